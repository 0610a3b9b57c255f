use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Everything that can abort an agenix operation.
///
/// Messages carry key strings, file paths and identity paths, never
/// plaintext.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid recipient {key:?}: {reason}")]
    InvalidRecipient { key: String, reason: String },

    #[error("no recipients declared")]
    NoRecipients,

    #[error("invalid identity {}: {reason}", path.display())]
    InvalidIdentity { path: PathBuf, reason: String },

    #[error("no matching identity")]
    NoMatchingIdentity,

    #[error("corrupt ciphertext: {0}")]
    CorruptCiphertext(String),

    #[error("no rule matches this file")]
    UnknownSecret,

    #[error("editor failed: {0}")]
    EditorFailure(String),

    #[error("rules: {0}")]
    Rules(String),

    #[error("interrupted by signal {0}")]
    Interrupted(i32),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Attaches the secret file an error is about.
    pub fn at(self, path: impl AsRef<Path>) -> Self {
        match self {
            // keep the innermost path
            err @ Error::File { .. } => err,
            err => Error::File {
                path: path.as_ref().to_path_buf(),
                source: Box::new(err),
            },
        }
    }

    /// The error without any attached path.
    pub fn kind(&self) -> &Error {
        match self {
            Error::File { source, .. } => source.kind(),
            err => err,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            Error::Io(_) | Error::File { .. } => 1,
            Error::InvalidRecipient { .. } => 3,
            Error::NoMatchingIdentity => 4,
            Error::CorruptCiphertext(_) => 5,
            Error::UnknownSecret => 6,
            Error::EditorFailure(_) => 7,
            Error::InvalidIdentity { .. } => 8,
            Error::NoRecipients => 9,
            Error::Rules(_) => 10,
            Error::Interrupted(signal) => 128u8.saturating_add(*signal as u8),
        }
    }
}

impl From<age::DecryptError> for Error {
    fn from(err: age::DecryptError) -> Self {
        use age::DecryptError;
        match err {
            DecryptError::NoMatchingKeys | DecryptError::KeyDecryptionFailed => {
                Error::NoMatchingIdentity
            }
            DecryptError::Io(err) => Error::from_payload_io(err),
            DecryptError::MissingPlugin { binary_name } => Error::InvalidIdentity {
                path: PathBuf::from(&binary_name),
                reason: "plugin binary not found".to_string(),
            },
            // header, MAC and payload failures
            err => Error::CorruptCiphertext(err.to_string()),
        }
    }
}

impl From<age::EncryptError> for Error {
    fn from(err: age::EncryptError) -> Self {
        use age::EncryptError;
        match err {
            EncryptError::Io(err) => Error::Io(err),
            EncryptError::MissingPlugin { binary_name } => Error::InvalidRecipient {
                key: binary_name,
                reason: "plugin binary not found".to_string(),
            },
            EncryptError::EncryptedIdentities(err) => err.into(),
            err @ EncryptError::Plugin(_) => Error::InvalidRecipient {
                key: "plugin".to_string(),
                reason: err.to_string(),
            },
        }
    }
}

impl Error {
    /// Maps an I/O error raised while reading an age payload. The stream
    /// reader reports failed chunk authentication and truncation this way.
    pub(crate) fn from_payload_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
                Error::CorruptCiphertext(err.to_string())
            }
            _ => Error::Io(err),
        }
    }
}
