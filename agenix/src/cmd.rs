use std::env;
use std::io::{self, prelude::*, IsTerminal};
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, NIX_INSTANTIATE};
use crate::edit::{EditSession, Editor};
use crate::error::{Error, Result};
use crate::rekey::RekeyEngine;
use crate::store::SecretStore;
use crate::types::Identities;

#[cfg(test)]
mod tests;

const AFTER_HELP: &str = "\
The secrets file declares which public keys each secret is encrypted to.

EDITOR environment variable of editor to use when editing FILE. If STDIN is \
not interactive, EDITOR is not set and the new contents are read from STDIN.

RULES environment variable with path to Nix file specifying recipient public \
keys. Defaults to './secrets.nix'";

#[derive(clap::Parser, Debug)]
#[command(name = "agenix", bin_name = "agenix", version)]
#[command(about = "edit and rekey age secret files", after_help = AFTER_HELP)]
pub struct Cli {
    /// Edit FILE using $EDITOR
    #[arg(short, long, value_name = "FILE", group = "action")]
    edit: Option<PathBuf>,
    /// Decrypt FILE to STDOUT
    #[arg(short, long, value_name = "FILE", group = "action")]
    decrypt: Option<PathBuf>,
    /// Re-encrypt all secrets with the keys in the rules file
    #[arg(short, long, group = "action")]
    rekey: bool,
    /// Private key to decrypt with; replaces the default SSH keys
    #[arg(short, long, value_name = "PRIVATE_KEY")]
    identity: Vec<PathBuf>,
    /// Nix or JSON file declaring the public keys of each secret
    #[arg(long, env = "RULES", default_value = crate::config::DEFAULT_RULES)]
    rules: PathBuf,
    /// Directory for plaintext while editing [default: /dev/shm]
    #[arg(long, value_name = "DIR", env = "AGENIX_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
    /// Only rekey these secrets
    #[arg(value_name = "FILE", requires = "rekey")]
    files: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Opts {
    Edit(PathBuf),
    Decrypt(PathBuf),
    Rekey(Vec<PathBuf>),
}

impl Cli {
    pub fn opts(&self) -> Option<Opts> {
        if let Some(ref file) = self.edit {
            Some(Opts::Edit(file.clone()))
        } else if let Some(ref file) = self.decrypt {
            Some(Opts::Decrypt(file.clone()))
        } else if self.rekey {
            Some(Opts::Rekey(self.files.clone()))
        } else {
            None
        }
    }

    pub fn config(&self) -> Config {
        Config {
            rules: self.rules.clone(),
            identities: self.identity.clone(),
            editor: env::var("EDITOR").ok(),
            interactive: io::stdin().is_terminal(),
            home: env::var_os("HOME").map(PathBuf::from),
            nix_instantiate: NIX_INSTANTIATE.to_string(),
            scratch_dir: self.scratch_dir.clone(),
        }
    }

    /// Installs the stderr log subscriber. `RUST_LOG` wins over `-v`.
    pub fn init_tracing(&self) {
        let default = if self.verbose { "debug" } else { "info" };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_ansi(io::stderr().is_terminal())
            .with_target(false)
            .without_time()
            .init();
    }

    pub fn main(&self) -> Result<()> {
        match self.opts() {
            Some(opts) => run(&opts, &self.config()),
            None => {
                Cli::command().print_help()?;
                Ok(())
            }
        }
    }
}

pub fn run(opts: &Opts, config: &Config) -> Result<()> {
    debug!(?opts, rules = %config.rules.display(), "running");
    match opts {
        Opts::Edit(file) => edit(file, config),
        Opts::Decrypt(file) => decrypt(file, config, &mut io::stdout().lock()),
        Opts::Rekey(files) => rekey(files, config),
    }
}

fn edit(file: &Path, config: &Config) -> Result<()> {
    let store = SecretStore::open(&config.rules, &config.nix_instantiate)?;
    let secret = store.resolve(file)?;
    let identities = if secret.path.exists() {
        config.load_identities()?
    } else {
        Identities::default()
    };
    let editor = Editor::select(config.editor.clone(), config.interactive);
    let mut session = EditSession::new(&store, &identities);
    if let Some(ref dir) = config.scratch_dir {
        session = session.scratch_in(dir);
    }
    session.run(&secret, editor)?;
    Ok(())
}

fn decrypt(file: &Path, config: &Config, output: &mut impl Write) -> Result<()> {
    let store = SecretStore::open(&config.rules, &config.nix_instantiate)?;
    let (secret, ciphertext) = store.load(file)?;
    let Some(ciphertext) = ciphertext else {
        return Err(Error::from(io::Error::new(
            io::ErrorKind::NotFound,
            "secret file does not exist",
        ))
        .at(&secret.path));
    };
    let identities = config.load_identities()?;
    crate::decrypt(&identities, &ciphertext[..], output).map_err(|err| err.at(&secret.path))?;
    output.flush()?;
    Ok(())
}

fn rekey(files: &[PathBuf], config: &Config) -> Result<()> {
    let store = SecretStore::open(&config.rules, &config.nix_instantiate)?;
    let identities = config.load_identities()?;
    let count = RekeyEngine::new(&store, &identities).rekey_all(files)?;
    debug!(count, "rekeyed");
    Ok(())
}
