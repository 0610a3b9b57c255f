use std::env;
use std::fs::{self, File, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::rules::{Rule, Rules};
use crate::types::RecipientSet;

const NEW_FILE_MODE: u32 = 0o644;

/// A secret file declared in the rules.
#[derive(Debug, Clone)]
pub struct Secret {
    /// The rule name.
    pub name: String,
    pub path: PathBuf,
    /// Declared keys, parsed only when the secret is encrypted so a bad
    /// key never blocks decryption.
    pub public_keys: Vec<String>,
    pub armor: bool,
}

impl Secret {
    fn new(name: &str, path: PathBuf, rule: &Rule) -> Self {
        Secret {
            name: name.to_owned(),
            path,
            public_keys: rule.public_keys.clone(),
            armor: rule.armor,
        }
    }

    pub fn recipients(&self) -> Result<RecipientSet> {
        RecipientSet::parse(&self.public_keys[..]).map_err(|err| err.at(&self.path))
    }
}

/// Secret files on disk, addressed through the rules that declare them.
pub struct SecretStore {
    rules: Rules,
}

impl SecretStore {
    pub fn new(rules: Rules) -> Self {
        SecretStore { rules }
    }

    pub fn open(rules: &Path, nix_instantiate: &str) -> Result<Self> {
        Ok(Self::new(Rules::load(rules, nix_instantiate)?))
    }

    /// Finds the rule for `file`, either by its literal name or by its
    /// location relative to the rules file.
    pub fn resolve(&self, file: &Path) -> Result<Secret> {
        let literal = file.to_string_lossy();
        let literal = literal.strip_prefix("./").unwrap_or(&literal);
        if let Some(rule) = self.rules.get(literal) {
            return Ok(Secret::new(literal, file.to_path_buf(), rule));
        }

        let relative = absolute(file)?
            .strip_prefix(self.rules.dir())
            .ok()
            .map(|p| p.to_string_lossy().into_owned());
        match relative {
            Some(name) => match self.rules.get(&name) {
                Some(rule) => Ok(Secret::new(&name, file.to_path_buf(), rule)),
                None => Err(Error::UnknownSecret.at(file)),
            },
            None => Err(Error::UnknownSecret.at(file)),
        }
    }

    /// Every declared secret, located relative to the rules file.
    pub fn secrets(&self) -> Vec<Secret> {
        self.rules
            .iter()
            .map(|(name, rule)| Secret::new(name, self.rules.dir().join(name), rule))
            .collect()
    }

    /// The current ciphertext, or `None` for a secret not created yet.
    pub fn read(&self, secret: &Secret) -> Result<Option<Vec<u8>>> {
        match fs::read(&secret.path) {
            Ok(ciphertext) => Ok(Some(ciphertext)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::from(err).at(&secret.path)),
        }
    }

    pub fn load(&self, file: &Path) -> Result<(Secret, Option<Vec<u8>>)> {
        let secret = self.resolve(file)?;
        let ciphertext = self.read(&secret)?;
        Ok((secret, ciphertext))
    }

    /// Atomically replaces the secret file: readers see either the old or
    /// the new ciphertext, never a partial write.
    pub fn commit(&self, secret: &Secret, ciphertext: &[u8]) -> Result<()> {
        replace(&secret.path, ciphertext).map_err(|err| Error::from(err).at(&secret.path))
    }
}

fn replace(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let permissions = match fs::metadata(path) {
        Ok(metadata) => metadata.permissions(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Permissions::from_mode(NEW_FILE_MODE)
        }
        Err(err) => return Err(err),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".agenix")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().set_permissions(permissions)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    if let Ok(dir) = File::open(dir) {
        dir.sync_all().ok();
    }
    debug!(path = %path.display(), bytes = contents.len(), "replaced");
    Ok(())
}

/// Absolute form of `path` with `.` and `..` removed, following symlinks
/// only for the parts that exist.
fn absolute(path: &Path) -> Result<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()?.join(path)
    };
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            c => normalized.push(c),
        }
    }
    match (normalized.parent(), normalized.file_name()) {
        (Some(parent), Some(name)) => match parent.canonicalize() {
            Ok(parent) => Ok(parent.join(name)),
            Err(_) => Ok(normalized),
        },
        _ => Ok(normalized),
    }
}
