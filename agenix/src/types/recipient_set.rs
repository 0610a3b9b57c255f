use std::collections::HashSet;

use age::cli_common::UiCallbacks;
use tracing::debug;

use super::Recipient;
use crate::error::{Error, Result};

/// The ordered public keys a secret file is encrypted to.
///
/// Keys are unique by fingerprint.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecipientSet {
    recipients: Vec<Recipient>,
}

impl RecipientSet {
    pub fn new(recipients: Vec<Recipient>) -> Result<Self> {
        let mut seen = HashSet::new();
        for r in &recipients {
            if !seen.insert(r.fingerprint()?) {
                return Err(Error::InvalidRecipient {
                    key: r.to_string(),
                    reason: "duplicate recipient".to_string(),
                });
            }
        }
        Ok(RecipientSet { recipients })
    }

    /// Parses every key, failing on the first malformed one.
    pub fn parse<S: AsRef<str>>(keys: &[S]) -> Result<Self> {
        let recipients = keys
            .iter()
            .map(|k| k.as_ref().parse())
            .collect::<Result<Vec<Recipient>>>()?;
        Self::new(recipients)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Recipient> {
        self.recipients.iter()
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    /// Instantiates the age recipients, starting plugins where needed.
    pub fn to_recipients(&self) -> Result<Vec<Box<dyn age::Recipient + Send>>> {
        if self.is_empty() {
            return Err(Error::NoRecipients);
        }
        let mut recipients = Vec::with_capacity(self.len());
        for r in self.iter() {
            debug!(fingerprint = %r.fingerprint()?, "adding recipient");
            recipients.push(r.to_recipient(UiCallbacks)?);
        }
        Ok(recipients)
    }
}
