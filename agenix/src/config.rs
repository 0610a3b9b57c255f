use std::path::PathBuf;

use tracing::debug;

use crate::error::Result;
use crate::types::Identities;

pub const DEFAULT_RULES: &str = "./secrets.nix";
pub const NIX_INSTANTIATE: &str = "nix-instantiate";

/// Settings for one invocation, gathered once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub rules: PathBuf,
    /// Identities given with `-i`; when empty the default SSH keys are used.
    pub identities: Vec<PathBuf>,
    pub editor: Option<String>,
    /// Whether standard input is a terminal.
    pub interactive: bool,
    pub home: Option<PathBuf>,
    pub nix_instantiate: String,
    /// Where plaintext is kept while editing; `/dev/shm` when unset.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rules: PathBuf::from(DEFAULT_RULES),
            identities: vec![],
            editor: None,
            interactive: false,
            home: None,
            nix_instantiate: NIX_INSTANTIATE.to_string(),
            scratch_dir: None,
        }
    }
}

impl Config {
    pub fn identity_paths(&self) -> Vec<PathBuf> {
        if !self.identities.is_empty() {
            return self.identities.clone();
        }
        match self.home {
            Some(ref home) => Identities::default_paths(home),
            None => vec![],
        }
    }

    pub fn load_identities(&self) -> Result<Identities> {
        let paths = self.identity_paths();
        debug!(?paths, "identity files");
        Identities::load(&paths)
    }
}
