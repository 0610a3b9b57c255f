use std::ffi::OsStr;
use std::fmt;
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, prelude::*};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicI32, Ordering};

use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::store::{Secret, SecretStore};
use crate::types::Identities;

const DEFAULT_EDITOR: &str = "vi";
const VOLATILE_DIR: &str = "/dev/shm";
const SCRATCH_MODE: u32 = 0o700;
const PLAINTEXT_MODE: u32 = 0o600;
const PIPE_CHUNK_SIZE: usize = 8 * 1024;

/// Signals that abort an edit. The session catches them so the scratch
/// directory is wiped before the process exits.
const CANCEL_SIGNALS: [libc::c_int; 4] = [libc::SIGINT, libc::SIGQUIT, libc::SIGTERM, libc::SIGHUP];

// Written from the signal handler, so plain atomics only.
static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);
static EDITOR_PID: AtomicI32 = AtomicI32::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Decrypting,
    Editing,
    ReEncrypting,
    Committing,
    Done,
    Failed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Failed)
    }
}

/// How the new plaintext is produced.
pub enum Editor {
    /// A shell command run with the plaintext path as `$1`.
    Command(String),
    /// Replace the plaintext with everything read from the stream.
    Pipe(Box<dyn Read>),
}

impl Editor {
    /// `$EDITOR` when set; otherwise `vi` on a terminal and standard input
    /// when piped.
    pub fn select(editor: Option<String>, interactive: bool) -> Self {
        match editor {
            Some(editor) if !editor.is_empty() => Editor::Command(editor),
            _ if interactive => Editor::Command(DEFAULT_EDITOR.to_string()),
            _ => Editor::Pipe(Box::new(io::stdin())),
        }
    }

    fn edit(self, path: &Path) -> Result<()> {
        match self {
            Editor::Command(command) => {
                debug!(%command, "starting editor");
                let mut child = Command::new("sh")
                    .arg("-c")
                    .arg(format!("{} \"$1\"", command))
                    .arg("sh")
                    .arg(path)
                    .spawn()
                    .map_err(|err| {
                        Error::EditorFailure(format!("cannot start {}: {}", command, err))
                    })?;
                EDITOR_PID.store(child.id() as i32, Ordering::SeqCst);
                forward_pending(child.id() as i32);
                let status = {
                    // interrupts typed at the terminal belong to the editor
                    let _ignore =
                        Dispositions::set(&[libc::SIGINT, libc::SIGQUIT], libc::SIG_IGN).ok();
                    child.wait()
                };
                EDITOR_PID.store(0, Ordering::SeqCst);
                let status = status?;
                if !status.success() {
                    return Err(Error::EditorFailure(format!("{} {}", command, status)));
                }
                Ok(())
            }
            Editor::Pipe(mut input) => {
                let mut file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(PLAINTEXT_MODE)
                    .open(path)?;
                let mut buf = Zeroizing::new(vec![0; PIPE_CHUNK_SIZE]);
                loop {
                    match input.read(&mut buf[..]) {
                        Ok(0) => break,
                        Ok(n) => file.write_all(&buf[..n])?,
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => pending()?,
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Editor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Editor::Command(command) => f.debug_tuple("Command").field(command).finish(),
            Editor::Pipe(_) => f.write_str("Pipe"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Written,
    /// The editor left no file behind; the secret was not written.
    Unchanged,
}

/// One edit of one secret.
pub struct EditSession<'a> {
    store: &'a SecretStore,
    identities: &'a Identities,
    scratch_root: Option<PathBuf>,
    state: State,
}

impl<'a> EditSession<'a> {
    pub fn new(store: &'a SecretStore, identities: &'a Identities) -> Self {
        EditSession {
            store,
            identities,
            scratch_root: None,
            state: State::Idle,
        }
    }

    /// Keeps plaintext under `dir` instead of `/dev/shm` or the system
    /// temporary directory.
    pub fn scratch_in(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(dir.into());
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn run(&mut self, secret: &Secret, editor: Editor) -> Result<Outcome> {
        if self.state != State::Idle {
            return Err(Error::Io(io::Error::other("edit session already used")));
        }
        self.edit(secret, editor).map_err(|err| {
            self.transition(State::Failed);
            err.at(&secret.path)
        })
    }

    fn transition(&mut self, next: State) {
        debug!(from = ?self.state, to = ?next, "edit session");
        self.state = next;
    }

    fn edit(&mut self, secret: &Secret, editor: Editor) -> Result<Outcome> {
        let recipients = secret.recipients()?;
        if recipients.is_empty() {
            return Err(Error::NoRecipients);
        }

        // dropped after `scratch`, so signals stay caught while it is wiped
        let _signals = Dispositions::catch_cancel()?;

        self.transition(State::Decrypting);
        let scratch = Scratch::new(self.scratch_root.as_deref(), &secret.path)?;
        let before = match self.store.read(secret)? {
            Some(ciphertext) => {
                let mut file = scratch.create()?;
                let mut plaintext = Zeroizing::new(Vec::new());
                crate::decrypt(self.identities, &ciphertext[..], &mut *plaintext)?;
                file.write_all(&plaintext)?;
                Some(Sha256::digest(&plaintext[..]))
            }
            None => None,
        };
        pending()?;

        self.transition(State::Editing);
        let edited = editor.edit(scratch.path());
        pending()?;
        edited?;
        let Some(plaintext) = scratch.read()? else {
            warn!("{} wasn't created", secret.name);
            self.transition(State::Done);
            return Ok(Outcome::Unchanged);
        };
        if before == Some(Sha256::digest(&plaintext[..])) {
            debug!(name = %secret.name, "content unchanged");
        }

        self.transition(State::ReEncrypting);
        let ciphertext = crate::encrypt_to_vec(&recipients, secret.armor, &plaintext)?;
        drop(plaintext);
        pending()?;

        self.transition(State::Committing);
        self.store.commit(secret, &ciphertext)?;
        self.transition(State::Done);
        Ok(Outcome::Written)
    }
}

/// A private directory holding the plaintext during an edit. Dropping it
/// overwrites every file in it with zeros before removal.
struct Scratch {
    dir: TempDir,
    path: PathBuf,
}

impl Scratch {
    fn new(root: Option<&Path>, secret: &Path) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("agenix.");
        let dir = match root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder
                .tempdir_in(VOLATILE_DIR)
                .or_else(|_| builder.tempdir())?,
        };
        fs::set_permissions(dir.path(), Permissions::from_mode(SCRATCH_MODE))?;
        let name = secret.file_name().unwrap_or(OsStr::new("secret"));
        let path = dir.path().join(name);
        debug!(dir = %dir.path().display(), "created scratch directory");
        Ok(Scratch { dir, path })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn create(&self) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(PLAINTEXT_MODE)
            .open(&self.path)
    }

    fn read(&self) -> io::Result<Option<Zeroizing<Vec<u8>>>> {
        match fs::read(&self.path) {
            Ok(plaintext) => Ok(Some(Zeroizing::new(plaintext))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let Ok(entries) = fs::read_dir(self.dir.path()) else {
            return;
        };
        for entry in entries.flatten() {
            if let Err(err) = shred(&entry.path()) {
                warn!(path = %entry.path().display(), %err, "cannot wipe plaintext");
            }
        }
    }
}

/// Overwrites a regular file with zeros, syncs it, then unlinks it.
fn shred(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_file() {
        let mut file = OpenOptions::new().write(true).open(path)?;
        let zeros = [0u8; 4096];
        let mut remaining = metadata.len();
        while remaining > 0 {
            let n = remaining.min(zeros.len() as u64) as usize;
            file.write_all(&zeros[..n])?;
            remaining -= n as u64;
        }
        file.sync_all()?;
    }
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

extern "C" fn on_cancel(signal: libc::c_int) {
    PENDING_SIGNAL.store(signal, Ordering::SeqCst);
    if signal == libc::SIGTERM || signal == libc::SIGHUP {
        let pid = EDITOR_PID.load(Ordering::SeqCst);
        if pid > 0 {
            // SAFETY: kill(2) is async-signal-safe.
            unsafe {
                libc::kill(pid, signal);
            }
        }
    }
}

/// Fails with the cancellation signal caught since the session started.
fn pending() -> Result<()> {
    match PENDING_SIGNAL.load(Ordering::SeqCst) {
        0 => Ok(()),
        signal => Err(Error::Interrupted(signal)),
    }
}

/// Passes a termination that arrived before the editor started on to it.
fn forward_pending(pid: i32) {
    let signal = PENDING_SIGNAL.load(Ordering::SeqCst);
    if signal == libc::SIGTERM || signal == libc::SIGHUP {
        // SAFETY: plain kill(2) on our own child.
        unsafe {
            libc::kill(pid, signal);
        }
    }
}

/// Replaced signal dispositions, restored in reverse order on drop.
struct Dispositions {
    saved: Vec<(libc::c_int, libc::sigaction)>,
}

impl Dispositions {
    fn set(signals: &[libc::c_int], handler: libc::sighandler_t) -> io::Result<Self> {
        let mut dispositions = Dispositions {
            saved: Vec::with_capacity(signals.len()),
        };
        for &signal in signals {
            // SAFETY: `action` is fully initialized; `handler` is SIG_IGN or
            // `on_cancel`, which only touches atomics and kill(2).
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = handler;
                libc::sigemptyset(&mut action.sa_mask);
                let mut previous: libc::sigaction = std::mem::zeroed();
                if libc::sigaction(signal, &action, &mut previous) != 0 {
                    return Err(io::Error::last_os_error());
                }
                dispositions.saved.push((signal, previous));
            }
        }
        Ok(dispositions)
    }

    /// Catches every cancellation signal without SA_RESTART, so blocking
    /// reads return and the session can unwind.
    fn catch_cancel() -> io::Result<Self> {
        PENDING_SIGNAL.store(0, Ordering::SeqCst);
        let handler = on_cancel as extern "C" fn(libc::c_int) as libc::sighandler_t;
        Self::set(&CANCEL_SIGNALS, handler)
    }
}

impl Drop for Dispositions {
    fn drop(&mut self) {
        for (signal, previous) in self.saved.drain(..).rev() {
            // SAFETY: restores a disposition returned by sigaction(2).
            unsafe {
                libc::sigaction(signal, &previous, std::ptr::null_mut());
            }
        }
    }
}
