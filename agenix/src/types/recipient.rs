use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Represents any Age recipient, whether native or plugin.
#[derive(Debug, PartialEq, Clone)]
pub struct AgeRecipient {
    pub plugin: Option<String>,
    pub data: Vec<u8>,
}

const NATIVE_RECIPIENT_HRP: &str = "age";
const PLUGIN_RECIPIENT_HRP_PREFIX: &str = "age1";
const X25519_KEY_SIZE: usize = 32;

fn invalid(key: &str, reason: impl fmt::Display) -> Error {
    Error::InvalidRecipient {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

impl AgeRecipient {
    pub fn to_bech32(&self) -> Result<String> {
        let hrp = match self.plugin {
            None => NATIVE_RECIPIENT_HRP.to_owned(),
            Some(ref plugin) => PLUGIN_RECIPIENT_HRP_PREFIX.to_owned() + plugin,
        };
        let parsed = bech32::Hrp::parse(&hrp).map_err(|err| invalid(&hrp, err))?;
        bech32::encode::<bech32::Bech32>(parsed, &self.data).map_err(|err| invalid(&hrp, err))
    }

    pub fn from_bech32(s: &str) -> Result<Self> {
        let (hrp, data) = bech32::decode(s).map_err(|_| invalid(s, "invalid bech32"))?;
        let hrp = hrp.to_lowercase();
        let plugin = if hrp == NATIVE_RECIPIENT_HRP {
            if data.len() != X25519_KEY_SIZE {
                return Err(invalid(s, "wrong key length"));
            }
            None
        } else if let Some(plugin) = hrp.strip_prefix(PLUGIN_RECIPIENT_HRP_PREFIX) {
            Some(plugin.to_owned())
        } else {
            return Err(invalid(s, "invalid HRP"));
        };
        Ok(AgeRecipient { plugin, data })
    }

    fn to_recipient<C: age::Callbacks>(
        &self,
        callbacks: C,
    ) -> Result<Box<dyn age::Recipient + Send>> {
        let encoded = self.to_bech32()?;
        match self.plugin {
            None => Ok(Box::new(
                age::x25519::Recipient::from_str(&encoded).map_err(|err| invalid(&encoded, err))?,
            )),
            Some(ref plugin_name) => {
                let recipient = age::plugin::Recipient::from_str(&encoded)
                    .map_err(|err| invalid(&encoded, err))?;
                match age::plugin::RecipientPluginV1::new(plugin_name, &[recipient], &[], callbacks)
                {
                    Ok(plugin) => Ok(Box::new(plugin)),
                    Err(age::EncryptError::MissingPlugin { binary_name }) => Err(invalid(
                        &encoded,
                        format!("no plugin found for {}: {}", plugin_name, binary_name),
                    )),
                    Err(err) => Err(invalid(&encoded, err)),
                }
            }
        }
    }
}

/// An `ssh-ed25519` or `ssh-rsa` public key, comment dropped.
#[derive(Debug, PartialEq, Clone)]
pub struct SshRecipient {
    pub key_type: String,
    pub blob: Vec<u8>,
}

impl SshRecipient {
    fn encoded(&self) -> String {
        format!("{} {}", self.key_type, STANDARD_NO_PAD.encode(&self.blob))
    }

    fn parse(s: &str) -> Result<Self> {
        let mut fields = s.split_whitespace();
        let (Some(key_type), Some(data)) = (fields.next(), fields.next()) else {
            return Err(invalid(s, "expected \"<type> <base64>\""));
        };
        let blob = STANDARD_NO_PAD
            .decode(data.trim_end_matches('='))
            .map_err(|_| invalid(s, "invalid base64 key data"))?;
        let recipient = SshRecipient {
            key_type: key_type.to_owned(),
            blob,
        };
        recipient.to_ssh()?;
        Ok(recipient)
    }

    fn to_ssh(&self) -> Result<age::ssh::Recipient> {
        use age::ssh::ParseRecipientKeyError::*;
        let encoded = self.encoded();
        age::ssh::Recipient::from_str(&encoded).map_err(|err| {
            let reason = match err {
                Invalid(reason) => reason.to_string(),
                Unsupported(key_type) => format!("unsupported SSH key type {}", key_type),
                RsaModulusTooLarge => "RSA modulus too large".to_string(),
                RsaModulusTooSmall => "RSA modulus smaller than 2048 bits".to_string(),
                Ignore => "unsupported SSH key".to_string(),
            };
            invalid(&encoded, reason)
        })
    }
}

/// A public key entitled to decrypt a secret.
#[derive(Debug, PartialEq, Clone)]
pub enum Recipient {
    Age(AgeRecipient),
    Ssh(SshRecipient),
}

impl Recipient {
    /// `SHA256:` followed by the unpadded base64 digest of the canonical key,
    /// in the style of `ssh-keygen -l`.
    pub fn fingerprint(&self) -> Result<String> {
        let digest = match self {
            Recipient::Age(r) => Sha256::digest(r.to_bech32()?.as_bytes()),
            Recipient::Ssh(r) => Sha256::digest(&r.blob),
        };
        Ok(format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)))
    }

    pub fn to_recipient<C: age::Callbacks>(
        &self,
        callbacks: C,
    ) -> Result<Box<dyn age::Recipient + Send>> {
        match self {
            Recipient::Age(r) => r.to_recipient(callbacks),
            Recipient::Ssh(r) => Ok(Box::new(r.to_ssh()?)),
        }
    }
}

impl FromStr for Recipient {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.starts_with(NATIVE_RECIPIENT_HRP) && !s.contains(char::is_whitespace) {
            AgeRecipient::from_bech32(s).map(Recipient::Age)
        } else {
            SshRecipient::parse(s).map(Recipient::Ssh)
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Age(r) => match r.to_bech32() {
                Ok(s) => f.write_str(&s),
                Err(_) => f.write_str("<invalid age recipient>"),
            },
            Recipient::Ssh(r) => f.write_str(&r.encoded()),
        }
    }
}
