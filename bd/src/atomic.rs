//! Crash-safe file I/O for the JSONL store: temp-file-then-rename writes,
//! content hashing, and advisory locking against concurrent writers.

use crate::error::{BeadsError, ContextualError, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

fn wrap(component: &'static str, operation: &'static str, path: &Path, e: std::io::Error) -> BeadsError {
    let ctx = ContextualError::new(component, operation, BeadsError::from(e)).with_path(path.to_path_buf());
    BeadsError::integrity(component, operation, ctx.to_string())
}

/// Writes `contents` to `path` via a temp file in the same directory followed
/// by an atomic rename, so a crash mid-write never leaves a truncated file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_path = make_temp_path(path);

    let write_result = (|| -> std::io::Result<()> {
        let mut file = File::create(&temp_path)?;
        file.write_all(contents)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(wrap("atomic", "write_atomic", path, e));
    }

    fs::rename(&temp_path, path).map_err(|e| wrap("atomic", "write_atomic.rename", path, e))?;

    Ok(())
}

fn make_temp_path(path: &Path) -> PathBuf {
    let mut temp_path = path.to_path_buf();
    let new_extension = match path.extension() {
        Some(ext) => {
            let mut new_ext = ext.to_os_string();
            new_ext.push(".tmp");
            new_ext
        }
        None => std::ffi::OsString::from("tmp"),
    };
    temp_path.set_extension(new_extension);
    temp_path
}

/// SHA-256 of a byte slice, hex-encoded. Used for both the per-issue
/// content hash and the whole-file JSONL hash.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hashes a file's contents on disk. Returns `None` if the file doesn't exist.
pub fn hash_file(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut file = File::open(path).map_err(|e| wrap("atomic", "hash_file", path, e))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| wrap("atomic", "hash_file", path, e))?;
    Ok(Some(hash_bytes(&buf)))
}

/// A held advisory lock on a file. Dropping it releases the lock; the lock
/// file itself is left on disk for the next acquirer.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquires an exclusive advisory lock on `path`, creating it if absent.
    /// Blocks until the lock is available.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(|e| wrap("atomic", "lock.open", path, e))?;

        file.lock_exclusive()
            .map_err(|e| wrap("atomic", "lock.acquire", path, e))?;

        Ok(FileLock {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Attempts to acquire the lock without blocking. Returns `Ok(None)` if
    /// another process currently holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(|e| wrap("atomic", "lock.open", path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(FileLock {
                file,
                path: path.to_path_buf(),
            })),
            Err(ref e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(wrap("atomic", "lock.try_acquire", path, e)),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_atomic_creates_file_with_expected_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("issues.jsonl");

        write_atomic(&path, b"{\"id\":\"bd-1\"}\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"id\":\"bd-1\"}\n");
        assert!(!make_temp_path(&path).exists());
    }

    #[test]
    fn write_atomic_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("issues.jsonl");
        fs::write(&path, b"old\n").unwrap();

        write_atomic(&path, b"new\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "new\n");
    }

    #[test]
    fn hash_bytes_is_deterministic() {
        assert_eq!(hash_bytes(b"hello"), hash_bytes(b"hello"));
        assert_ne!(hash_bytes(b"hello"), hash_bytes(b"world"));
    }

    #[test]
    fn hash_file_returns_none_for_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.jsonl");
        assert_eq!(hash_file(&path).unwrap(), None);
    }

    #[test]
    fn file_lock_blocks_second_nonblocking_acquire() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bd.lock");

        let _held = FileLock::acquire(&path).unwrap();
        let second = FileLock::try_acquire(&path).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn file_lock_releases_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bd.lock");

        {
            let _held = FileLock::acquire(&path).unwrap();
        }

        let second = FileLock::try_acquire(&path).unwrap();
        assert!(second.is_some());
    }
}
