//! Round-robin key rotation
//!
//! `TokenRotator` hands out pool entries in strict cyclic order. Two backends
//! sit behind the same interface:
//!
//! - **memory**: pool and cursor behind a `Mutex` in this process
//! - **shared**: pool and cursor live in a state directory so several
//!   processes rotate through one cycle. The initializer writes `pool.json`
//!   (JSON array of strings) and `cursor` (8-byte little-endian integer).
//!   Each process caches the pool together with an open handle to the cursor
//!   file it was read alongside. The cache is dropped whenever the cursor
//!   file on disk is no longer the one held open, which is how a worker
//!   notices that an initializer has replaced the state. Every `next()` takes
//!   an exclusive OS lock on the cursor file, so the cursor is the only thing
//!   processes ever contend on.
//!
//! Lifecycle: `Uninitialized -> Ready -> TornDown`. `teardown()` is valid from
//! any state and never fails; only the process that wrote the shared state
//! removes it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pool::TokenPool;

const POOL_FILE: &str = "pool.json";
const CURSOR_FILE: &str = "cursor";

/// Rotator lifecycle, as reported by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotatorState {
    Uninitialized,
    Ready,
    TornDown,
}

impl RotatorState {
    pub fn label(&self) -> &'static str {
        match self {
            RotatorState::Uninitialized => "uninitialized",
            RotatorState::Ready => "ready",
            RotatorState::TornDown => "torn_down",
        }
    }
}

/// Hands out the next key in the pool.
pub struct TokenRotator {
    backend: Backend,
}

enum Backend {
    Memory(Mutex<Phase>),
    Shared(SharedState),
}

enum Phase {
    Uninitialized,
    Ready { pool: TokenPool, cursor: usize },
    TornDown,
}

impl TokenRotator {
    /// Rotator for a single process.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Mutex::new(Phase::Uninitialized)),
        }
    }

    /// Rotator backed by files in `dir`, shared with other processes.
    ///
    /// Nothing touches the filesystem until `initialize()` or the first
    /// `next()`.
    pub fn shared(dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: Backend::Shared(SharedState {
                dir: dir.into(),
                attached: Mutex::new(None),
                owner: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Whether `next()` may block on a cross-process file lock.
    pub fn is_shared(&self) -> bool {
        matches!(self.backend, Backend::Shared(_))
    }

    pub fn mode(&self) -> &'static str {
        match self.backend {
            Backend::Memory(_) => "memory",
            Backend::Shared(_) => "shared",
        }
    }

    /// Install the pool and reset the cursor to 0.
    ///
    /// Repeating the call with an identical pool is a no-op; a different pool
    /// is `PoolMismatch`. After `teardown()` this is `RotatorClosed`.
    pub fn initialize(&self, pool: TokenPool) -> Result<()> {
        match &self.backend {
            Backend::Memory(phase) => {
                let mut phase = lock(phase);
                match &*phase {
                    Phase::Uninitialized => {}
                    Phase::Ready { pool: current, .. } if *current == pool => return Ok(()),
                    Phase::Ready { .. } => return Err(Error::PoolMismatch),
                    Phase::TornDown => return Err(Error::RotatorClosed),
                }
                info!(pool_size = pool.len(), "rotator initialized");
                *phase = Phase::Ready { pool, cursor: 0 };
                Ok(())
            }
            Backend::Shared(shared) => shared.initialize(pool),
        }
    }

    /// Return the key at the cursor and advance it, wrapping at the pool size.
    pub fn next(&self) -> Result<String> {
        match &self.backend {
            Backend::Memory(phase) => match &mut *lock(phase) {
                Phase::Uninitialized => Err(Error::RotatorNotReady),
                Phase::TornDown => Err(Error::RotatorClosed),
                Phase::Ready { pool, cursor } => {
                    let key = pool.get(*cursor).ok_or(Error::EmptyPool)?.to_owned();
                    *cursor = (*cursor + 1) % pool.len();
                    Ok(key)
                }
            },
            Backend::Shared(shared) => shared.next(),
        }
    }

    /// Release the rotator. Safe to call any number of times.
    pub fn teardown(&self) {
        match &self.backend {
            Backend::Memory(phase) => {
                *lock(phase) = Phase::TornDown;
            }
            Backend::Shared(shared) => shared.teardown(),
        }
    }

    pub fn state(&self) -> RotatorState {
        match &self.backend {
            Backend::Memory(phase) => match &*lock(phase) {
                Phase::Uninitialized => RotatorState::Uninitialized,
                Phase::Ready { .. } => RotatorState::Ready,
                Phase::TornDown => RotatorState::TornDown,
            },
            Backend::Shared(shared) => {
                if shared.closed.load(Ordering::SeqCst) {
                    RotatorState::TornDown
                } else if shared.attached_pool_size().is_ok() {
                    RotatorState::Ready
                } else {
                    RotatorState::Uninitialized
                }
            }
        }
    }

    /// Pool size, or 0 when not ready.
    pub fn pool_size(&self) -> usize {
        match &self.backend {
            Backend::Memory(phase) => match &*lock(phase) {
                Phase::Ready { pool, .. } => pool.len(),
                _ => 0,
            },
            Backend::Shared(shared) => {
                if shared.closed.load(Ordering::SeqCst) {
                    return 0;
                }
                shared.attached_pool_size().unwrap_or(0)
            }
        }
    }
}

impl std::fmt::Debug for TokenRotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRotator")
            .field("mode", &self.mode())
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SharedState {
    dir: PathBuf,
    /// The generation of shared state this process last read. The mutex
    /// serialises threads in this process; the file lock serialises
    /// processes.
    attached: Mutex<Option<Attachment>>,
    /// Set in the process that wrote the state; only it removes the files.
    owner: AtomicBool,
    closed: AtomicBool,
}

/// A pool plus the cursor file written with it.
struct Attachment {
    cursor: File,
    pool: TokenPool,
}

impl SharedState {
    fn pool_path(&self) -> PathBuf {
        self.dir.join(POOL_FILE)
    }

    fn cursor_path(&self) -> PathBuf {
        self.dir.join(CURSOR_FILE)
    }

    fn read_pool(&self) -> Result<TokenPool> {
        let bytes = match fs::read(self.pool_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::RotatorNotReady),
            Err(e) => return Err(Error::Persist(format!("reading shared pool: {e}"))),
        };
        serde_json::from_slice(&bytes).map_err(|e| Error::Persist(format!("parsing shared pool: {e}")))
    }

    /// Whether `held` is still the cursor file at the well-known path.
    fn is_current(&self, held: &File) -> Result<bool> {
        let on_disk = match fs::metadata(self.cursor_path()) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::Persist(format!("inspecting cursor file: {e}"))),
        };
        let held = held
            .metadata()
            .map_err(|e| Error::Persist(format!("inspecting open cursor file: {e}")))?;
        Ok(same_file(&held, &on_disk))
    }

    /// Make sure `slot` holds the generation currently on disk, reading it
    /// again if the initializer replaced or removed it.
    fn refresh(&self, slot: &mut Option<Attachment>) -> Result<()> {
        if let Some(attached) = slot.as_ref() {
            if self.is_current(&attached.cursor)? {
                return Ok(());
            }
            debug!(dir = %self.dir.display(), "shared state replaced, dropping cached pool");
            *slot = None;
        }

        // Cursor before pool: the initializer writes them in that order, so a
        // pool read after a successful open is never older than the cursor.
        let cursor = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.cursor_path())
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::RotatorNotReady,
                _ => Error::Persist(format!("opening cursor file: {e}")),
            })?;
        let pool = self.read_pool()?;
        debug!(dir = %self.dir.display(), pool_size = pool.len(), "loaded shared pool");
        *slot = Some(Attachment { cursor, pool });
        Ok(())
    }

    fn attached_pool_size(&self) -> Result<usize> {
        let mut slot = lock(&self.attached);
        self.refresh(&mut slot)?;
        slot.as_ref()
            .map(|attached| attached.pool.len())
            .ok_or(Error::RotatorNotReady)
    }

    fn initialize(&self, pool: TokenPool) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::RotatorClosed);
        }
        let mut slot = lock(&self.attached);

        match self.read_pool() {
            Ok(existing) if existing == pool => return Ok(()),
            Ok(_) => return Err(Error::PoolMismatch),
            Err(Error::RotatorNotReady) => {}
            Err(e) => return Err(e),
        }

        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Persist(format!("creating state directory: {e}")))?;
        // Cursor first: the pool file appearing is what makes workers ready.
        write_atomic(&self.cursor_path(), &0u64.to_le_bytes())?;
        let json = serde_json::to_vec(&pool)
            .map_err(|e| Error::Persist(format!("serializing pool: {e}")))?;
        write_atomic(&self.pool_path(), &json)?;

        self.owner.store(true, Ordering::SeqCst);
        *slot = None;
        info!(
            dir = %self.dir.display(),
            pool_size = pool.len(),
            "shared rotator initialized"
        );
        Ok(())
    }

    fn next(&self) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::RotatorClosed);
        }
        let mut slot = lock(&self.attached);

        loop {
            self.refresh(&mut slot)?;
            let Some(attached) = slot.as_mut() else {
                return Err(Error::RotatorNotReady);
            };
            if attached.pool.is_empty() {
                return Err(Error::EmptyPool);
            }

            attached
                .cursor
                .lock()
                .map_err(|e| Error::Persist(format!("locking cursor file: {e}")))?;
            // The state may have been replaced while we waited for the lock.
            let advanced = match self.is_current(&attached.cursor) {
                Ok(true) => Some(advance_cursor(&mut attached.cursor, attached.pool.len())),
                Ok(false) => None,
                Err(e) => Some(Err(e)),
            };
            if let Err(e) = attached.cursor.unlock() {
                warn!(error = %e, "failed to unlock cursor file");
            }

            match advanced {
                Some(index) => {
                    let index = index?;
                    return attached
                        .pool
                        .get(index)
                        .map(str::to_owned)
                        .ok_or(Error::EmptyPool);
                }
                None => *slot = None,
            }
        }
    }

    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *lock(&self.attached) = None;
        if self.owner.load(Ordering::SeqCst) {
            match remove_shared_state(&self.dir) {
                Ok(()) => info!(dir = %self.dir.display(), "removed shared rotator state"),
                Err(e) => warn!(dir = %self.dir.display(), error = %e, "failed to remove shared rotator state"),
            }
        } else {
            debug!("shared rotator detached");
        }
    }
}

#[cfg(unix)]
fn same_file(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    matches!((a.created(), b.created()), (Ok(x), Ok(y)) if x == y)
}

/// Read the cursor, write back its successor, return the index to serve.
/// Caller holds the file lock.
fn advance_cursor(file: &mut File, len: usize) -> Result<usize> {
    let mut raw = [0u8; 8];
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_exact(&mut raw))
        .map_err(|e| Error::Persist(format!("reading cursor: {e}")))?;

    let len = len as u64;
    let index = u64::from_le_bytes(raw) % len;
    let following = (index + 1) % len;

    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.write_all(&following.to_le_bytes()))
        .map_err(|e| Error::Persist(format!("writing cursor: {e}")))?;
    Ok(index as usize)
}

/// Write `data` to `path` via a temp file and rename, mode 0600.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Persist("state path has no parent directory".into()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state");
    let tmp_path = dir.join(format!(".{name}.tmp.{}", std::process::id()));

    fs::write(&tmp_path, data)
        .map_err(|e| Error::Persist(format!("writing temp state file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::Persist(format!("setting state file permissions: {e}")))?;
    }

    fs::rename(&tmp_path, path)
        .map_err(|e| Error::Persist(format!("renaming temp state file: {e}")))?;
    Ok(())
}

/// Delete the shared state files in `dir`. Missing files are not an error.
///
/// The directory itself is removed only if nothing else is left in it.
pub fn remove_shared_state(dir: &Path) -> Result<()> {
    for name in [POOL_FILE, CURSOR_FILE] {
        match fs::remove_file(dir.join(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Persist(format!("removing {name}: {e}"))),
        }
    }
    let _ = fs::remove_dir(dir);
    Ok(())
}
