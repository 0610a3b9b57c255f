use std::fs;
use std::path::{Path, PathBuf};

use age::cli_common::UiCallbacks;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

const SSH_PRIVATE_KEY_PREFIX: &[u8] = b"-----BEGIN";

/// SSH keys tried, in order, when no identity is given on the command line.
pub const DEFAULT_SSH_IDENTITIES: [&str; 2] = [".ssh/id_rsa", ".ssh/id_ed25519"];

/// Represents any identity agenix can decrypt with: native, plugin or SSH.
#[derive(Clone)]
pub enum AgeIdentity {
    X25519(age::x25519::Identity),
    Plugin(age::plugin::Identity),
    Ssh(age::ssh::Identity),
}

impl AgeIdentity {
    /// Reads every identity in an OpenSSH private key or an age identity
    /// file. The file contents are never included in errors.
    pub fn read_file(path: &Path) -> Result<Vec<Self>> {
        let invalid = |reason: String| Error::InvalidIdentity {
            path: path.to_path_buf(),
            reason,
        };
        let content = Zeroizing::new(fs::read(path).map_err(|err| invalid(err.to_string()))?);

        if content.starts_with(SSH_PRIVATE_KEY_PREFIX) {
            let filename = Some(path.to_string_lossy().into_owned());
            return match age::ssh::Identity::from_buffer(&content[..], filename) {
                Ok(age::ssh::Identity::Unsupported(key)) => {
                    Err(invalid(format!("unsupported SSH key: {:?}", key)))
                }
                Ok(identity) => Ok(vec![Self::Ssh(identity)]),
                Err(err) => Err(invalid(err.to_string())),
            };
        }

        let entries = age::IdentityFile::from_buffer(&content[..])
            .map_err(|err| invalid(err.to_string()))?
            .into_identities();
        if entries.is_empty() {
            return Err(invalid("no identities found".to_string()));
        }
        Ok(entries
            .into_iter()
            .map(|entry| match entry {
                age::IdentityFileEntry::Native(i) => Self::X25519(i),
                age::IdentityFileEntry::Plugin(i) => Self::Plugin(i),
            })
            .collect())
    }

    pub fn to_identity<C: age::Callbacks>(&self, callbacks: C) -> Result<Box<dyn age::Identity>> {
        match self {
            Self::X25519(i) => Ok(Box::new(i.clone())),
            Self::Ssh(i) => Ok(Box::new(i.clone().with_callbacks(callbacks))),
            Self::Plugin(i) => {
                let plugin_name = i.plugin();
                match age::plugin::IdentityPluginV1::new(plugin_name, &[i.clone()], callbacks) {
                    Ok(plugin) => Ok(Box::new(plugin)),
                    Err(age::DecryptError::MissingPlugin { binary_name }) => {
                        Err(Error::InvalidIdentity {
                            path: PathBuf::from(binary_name),
                            reason: format!("no plugin found for {}", plugin_name),
                        })
                    }
                    Err(err) => Err(err.into()),
                }
            }
        }
    }
}

/// The identities available to one invocation.
#[derive(Default)]
pub struct Identities {
    identities: Vec<Box<dyn age::Identity>>,
}

impl Identities {
    /// Loads identity files in order. An unreadable or malformed file is an
    /// error; no file is skipped.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut identities = vec![];
        for path in paths {
            let path = path.as_ref();
            let loaded = AgeIdentity::read_file(path)?;
            debug!(path = %path.display(), count = loaded.len(), "loaded identities");
            identities.extend(loaded);
        }
        Self::from_identities(&identities)
    }

    pub fn from_identities(identities: &[AgeIdentity]) -> Result<Self> {
        let identities = identities
            .iter()
            .map(|i| i.to_identity(UiCallbacks))
            .collect::<Result<_>>()?;
        Ok(Identities { identities })
    }

    /// The default SSH keys under `home` that exist.
    pub fn default_paths(home: &Path) -> Vec<PathBuf> {
        DEFAULT_SSH_IDENTITIES
            .iter()
            .map(|p| home.join(p))
            .filter(|p| p.exists())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &dyn age::Identity> {
        self.identities.iter().map(|i| i.as_ref())
    }
}
