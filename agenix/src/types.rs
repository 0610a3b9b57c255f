mod identity;
mod recipient;
mod recipient_set;

pub use identity::{AgeIdentity, Identities, DEFAULT_SSH_IDENTITIES};
pub use recipient::{AgeRecipient, Recipient, SshRecipient};
pub use recipient_set::RecipientSet;
