//! Secondary-storage arena for spilled tiers
//!
//! Spill files all live in one arena directory that exists only while at least
//! one [`BackingFile`] is alive. The arena hands out numbered handles; dropping
//! a handle removes its file, and releasing the last handle removes the
//! directory. Every configured directory maps to one shared arena, and file
//! creation and removal across all arenas go through one process-wide lock.

use crate::core::channel::{Channel, FileChannel};
use crate::core::error::{Result, StreamError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use tempfile::TempDir;
use tracing::{debug, info, warn};

static GLOBAL_ARENA: OnceLock<BackingArena> = OnceLock::new();
static DIR_ARENAS: OnceLock<Mutex<HashMap<PathBuf, Weak<ArenaInner>>>> = OnceLock::new();

// Held for every spill directory or file creation and removal.
static SPILL_LOCK: Mutex<()> = parking_lot::const_mutex(());

#[derive(Debug, Default)]
struct ArenaState {
    dir: Option<TempDir>,
    next_id: u64,
    live: usize,
}

#[derive(Debug)]
struct ArenaInner {
    root: Option<PathBuf>,
    state: Mutex<ArenaState>,
}

impl ArenaInner {
    fn release(&self, id: u64, path: &Path) {
        let mut state = self.state.lock();
        let _spill = SPILL_LOCK.lock();

        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove spill file {}: {}", path.display(), e);
        }
        state.live = state.live.saturating_sub(1);
        debug!("Released spill file #{} ({} live)", id, state.live);

        if state.live == 0 {
            if let Some(dir) = state.dir.take() {
                let dir_path = dir.path().to_path_buf();
                match dir.close() {
                    Ok(()) => info!("Removed spill directory {}", dir_path.display()),
                    Err(e) => warn!(
                        "Failed to remove spill directory {}: {}",
                        dir_path.display(),
                        e
                    ),
                }
            }
        }
    }
}

/// Owner of all spill files for a set of tiered stores
#[derive(Debug, Clone)]
pub struct BackingArena {
    inner: Arc<ArenaInner>,
}

impl BackingArena {
    /// Arena whose directory is created under `root` (system temp dir when `None`)
    pub fn new(root: Option<PathBuf>) -> Self {
        BackingArena {
            inner: Arc::new(ArenaInner {
                root,
                state: Mutex::new(ArenaState::default()),
            }),
        }
    }

    /// Process-wide arena in the system temp dir
    pub fn global() -> BackingArena {
        GLOBAL_ARENA.get_or_init(|| BackingArena::new(None)).clone()
    }

    /// Shared arena for a configured directory, or the global one
    ///
    /// Repeated calls with the same directory return the same arena while any
    /// handle to it is alive.
    pub fn for_dir(root: Option<&Path>) -> BackingArena {
        let Some(root) = root else {
            return BackingArena::global();
        };
        let key = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());

        let mut arenas = DIR_ARENAS
            .get_or_init(|| Mutex::new(HashMap::new()))
            .lock();
        arenas.retain(|_, weak| weak.strong_count() > 0);

        if let Some(inner) = arenas.get(&key).and_then(Weak::upgrade) {
            return BackingArena { inner };
        }
        let arena = BackingArena::new(Some(root.to_path_buf()));
        arenas.insert(key, Arc::downgrade(&arena.inner));
        arena
    }

    /// Create a fresh, empty spill file
    pub fn allocate(&self) -> Result<BackingFile> {
        let mut state = self.inner.state.lock();
        let _spill = SPILL_LOCK.lock();

        if state.dir.is_none() {
            let builder = {
                let mut b = tempfile::Builder::new();
                b.prefix("partstream-");
                b
            };
            let dir = match &self.inner.root {
                Some(root) => builder.tempdir_in(root)?,
                None => builder.tempdir()?,
            };
            info!("Created spill directory {}", dir.path().display());
            state.dir = Some(dir);
        }

        let id = state.next_id;
        let dir_path = state
            .dir
            .as_ref()
            .map(|d| d.path().to_path_buf())
            .ok_or_else(|| StreamError::Unsupported("spill directory unavailable".to_string()))?;
        let path = dir_path.join(format!("spill-{:08}.bin", id));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        state.next_id += 1;
        state.live += 1;
        debug!("Allocated spill file #{} ({} live)", id, state.live);

        Ok(BackingFile {
            id,
            path: path.clone(),
            channel: Some(FileChannel::from_file(file, path, true)),
            arena: Arc::clone(&self.inner),
        })
    }

    /// Number of spill files currently alive
    pub fn live_files(&self) -> usize {
        self.inner.state.lock().live
    }

    /// Current arena directory, if any file is alive
    pub fn directory(&self) -> Option<PathBuf> {
        self.inner
            .state
            .lock()
            .dir
            .as_ref()
            .map(|d| d.path().to_path_buf())
    }
}

/// Handle to one spill file; the file is removed when the handle drops
#[derive(Debug)]
pub struct BackingFile {
    id: u64,
    path: PathBuf,
    channel: Option<FileChannel>,
    arena: Arc<ArenaInner>,
}

impl BackingFile {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn channel(&mut self) -> Result<&mut FileChannel> {
        self.channel
            .as_mut()
            .ok_or_else(|| StreamError::Unsupported("spill file already released".to_string()))
    }
}

impl Channel for BackingFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.channel()?.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.channel()?.write(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.channel()?.seek(pos)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.channel()?.set_len(len)
    }

    fn flush(&mut self) -> Result<()> {
        self.channel()?.flush()
    }

    fn len(&mut self) -> Result<u64> {
        self.channel()?.len()
    }

    fn position(&self) -> u64 {
        self.channel.as_ref().map_or(0, |c| c.position())
    }
}

impl Drop for BackingFile {
    fn drop(&mut self) {
        // Close the handle before the file is unlinked.
        self.channel.take();
        self.arena.release(self.id, &self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_allocate_and_release() {
        let root = TempDir::new().unwrap();
        let arena = BackingArena::new(Some(root.path().to_path_buf()));

        let mut file = arena.allocate().unwrap();
        file.write(b"spilled").unwrap();
        assert_eq!(file.len().unwrap(), 7);
        assert!(file.path().exists());
        assert_eq!(arena.live_files(), 1);

        assert!(format!("{:?}", file).contains("spill-00000000.bin"));

        let path = file.path().to_path_buf();
        drop(file);
        assert!(!path.exists());
        assert_eq!(arena.live_files(), 0);
    }

    #[test]
    fn test_directory_lives_while_handles_exist() {
        let root = TempDir::new().unwrap();
        let arena = BackingArena::new(Some(root.path().to_path_buf()));
        assert!(arena.directory().is_none());

        let first = arena.allocate().unwrap();
        let second = arena.allocate().unwrap();
        assert_ne!(first.id(), second.id());

        let dir = arena.directory().unwrap();
        assert!(dir.starts_with(root.path()));

        drop(first);
        assert!(dir.exists());

        drop(second);
        assert!(!dir.exists());
        assert!(arena.directory().is_none());
    }

    #[test]
    fn test_same_directory_shares_one_arena() {
        let root = TempDir::new().unwrap();
        let a = BackingArena::for_dir(Some(root.path()));
        let b = BackingArena::for_dir(Some(root.path()));

        let first = a.allocate().unwrap();
        let second = b.allocate().unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(a.live_files(), 2);
        assert_eq!(b.live_files(), 2);
        assert_eq!(a.directory(), b.directory());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);

        let other = TempDir::new().unwrap();
        let c = BackingArena::for_dir(Some(other.path()));
        assert_eq!(c.live_files(), 0);
    }

    #[test]
    fn test_directory_recreated_after_release() {
        let root = TempDir::new().unwrap();
        let arena = BackingArena::new(Some(root.path().to_path_buf()));

        drop(arena.allocate().unwrap());
        let file = arena.allocate().unwrap();
        assert!(file.path().exists());
        assert_eq!(arena.live_files(), 1);
    }
}
