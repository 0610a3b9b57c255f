use std::path::PathBuf;

use tracing::{info, warn};

use crate::error::Result;
use crate::store::{Secret, SecretStore};
use crate::types::{Identities, RecipientSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rekeyed {
    Rekeyed,
    /// The secret is declared but its file does not exist.
    Missing,
}

/// Re-encrypts existing secrets without touching their plaintext.
pub struct RekeyEngine<'a> {
    store: &'a SecretStore,
    identities: &'a Identities,
}

impl<'a> RekeyEngine<'a> {
    pub fn new(store: &'a SecretStore, identities: &'a Identities) -> Self {
        RekeyEngine { store, identities }
    }

    /// Re-encrypts `secret` to `recipients`, or to its declared set when
    /// `None`. The file is left untouched on any failure.
    pub fn rekey(&self, secret: &Secret, recipients: Option<&RecipientSet>) -> Result<Rekeyed> {
        let Some(ciphertext) = self.store.read(secret)? else {
            warn!("{} does not exist, skipping", secret.path.display());
            return Ok(Rekeyed::Missing);
        };
        let declared;
        let recipients = match recipients {
            Some(recipients) => recipients,
            None => {
                declared = secret.recipients()?;
                &declared
            }
        };
        let plaintext = crate::decrypt_to_vec(self.identities, &ciphertext)
            .map_err(|err| err.at(&secret.path))?;
        let rekeyed = crate::encrypt_to_vec(recipients, secret.armor, &plaintext)
            .map_err(|err| err.at(&secret.path))?;
        self.store.commit(secret, &rekeyed)?;
        Ok(Rekeyed::Rekeyed)
    }

    /// Rekeys every declared secret, or only those named in `only`. Stops at
    /// the first failure.
    pub fn rekey_all(&self, only: &[PathBuf]) -> Result<usize> {
        let secrets = if only.is_empty() {
            self.store.secrets()
        } else {
            only.iter()
                .map(|file| self.store.resolve(file))
                .collect::<Result<_>>()?
        };
        let mut count = 0;
        for secret in &secrets {
            info!("Rekeying {}...", secret.name);
            if self.rekey(secret, None)? == Rekeyed::Rekeyed {
                count += 1;
            }
        }
        Ok(count)
    }
}
