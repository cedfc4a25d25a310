//! Buffer file access: exclusive locking, snapshots, and truncation.
//!
//! The buffer file is an append-only spool shared with external producers.
//! Coordination is a single advisory exclusive lock (`flock`) held for the
//! whole snapshot → load → truncate window; producers are expected to take
//! the same lock around their appends. The lock is released exactly once,
//! on guard drop, so every exit path of a drain cycle unlocks.

use memmap2::Mmap;
use snafu::prelude::*;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::fd::AsFd;
use std::os::unix::fs::FileExt as _;
use std::path::Path;
use std::sync::Arc;

use crate::config::TruncateMode;
use crate::error::{
    BufferError, LockSnafu, LockTaskSnafu, MapSnafu, OpenSnafu, RewriteSnafu, SeekSnafu, StatSnafu,
    StdinSnafu, TruncateSnafu,
};

/// Chunk size for shifting the unconsumed tail to the front of the file.
const REWRITE_CHUNK: usize = 64 * 1024;

/// Owned handle to the buffer file.
///
/// The handle is duplicated into an [`Arc`] so the blocking lock wait can
/// run on the blocking thread pool while the accessor stays borrowable.
#[derive(Debug)]
pub struct BufferFile {
    file: Arc<File>,
}

impl BufferFile {
    /// Adopt the buffer file attached to standard input.
    ///
    /// The caller is expected to redirect the buffer file to fd 0 with a
    /// read/write redirection (`<>` in a POSIX shell). The fd is duplicated
    /// into an owned handle; the duplicate shares the open file description,
    /// so locks taken here apply to the original fd as well.
    pub fn from_stdin() -> Result<Self, BufferError> {
        let fd = std::io::stdin()
            .as_fd()
            .try_clone_to_owned()
            .context(StdinSnafu)?;
        Self::adopt(File::from(fd))
    }

    /// Open a buffer file at `path` with read/write access, creating it if
    /// the producer has not written yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BufferError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .context(OpenSnafu {
                path: path.display().to_string(),
            })?;
        Self::adopt(file)
    }

    fn adopt(file: File) -> Result<Self, BufferError> {
        // Rejects pipes and terminals up front; a non-seekable handle can
        // never be truncated later.
        (&file).seek(SeekFrom::Start(0)).context(SeekSnafu)?;
        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// Block until the exclusive lock on the buffer file is held.
    ///
    /// The wait is unbounded (the previous holder decides how long) and runs
    /// on the blocking pool so the runtime stays responsive. The returned
    /// guard releases the lock when dropped.
    pub async fn lock(&self) -> Result<BufferGuard, BufferError> {
        let file = Arc::clone(&self.file);
        let file =
            tokio::task::spawn_blocking(move || fs2::FileExt::lock_exclusive(&*file).map(|()| file))
                .await
                .context(LockTaskSnafu)?
                .context(LockSnafu)?;
        Ok(BufferGuard { file })
    }
}

/// Holds the exclusive lock on the buffer file.
pub struct BufferGuard {
    file: Arc<File>,
}

impl BufferGuard {
    /// Snapshot the buffer contents at their current length.
    ///
    /// Returns `None` when the buffer is empty, in which case the caller
    /// must skip the load entirely. Under the lock no producer can append,
    /// so the mapped length is stable for the lifetime of the snapshot.
    pub fn snapshot(&self) -> Result<Option<Snapshot>, BufferError> {
        let len = self.file.metadata().context(StatSnafu)?.len();
        if len == 0 {
            return Ok(None);
        }
        let map = unsafe { Mmap::map(&*self.file) }.context(MapSnafu)?;
        Ok(Some(Snapshot { map, len }))
    }

    /// Remove the snapshotted bytes after the database confirmed the load.
    ///
    /// Takes the snapshot by value so the mapping is gone before the file
    /// shrinks. Returns the number of bytes removed.
    pub fn consume(&self, snapshot: Snapshot, mode: TruncateMode) -> Result<u64, BufferError> {
        let consumed = snapshot.len;
        drop(snapshot);

        match mode {
            TruncateMode::Full => {
                self.file.set_len(0).context(TruncateSnafu)?;
            }
            TruncateMode::Prefix => {
                let len = self.file.metadata().context(StatSnafu)?.len();
                let tail = len - consumed;
                self.shift_tail(consumed, tail)?;
                self.file.set_len(tail).context(TruncateSnafu)?;
            }
        }
        Ok(consumed)
    }

    /// Move `tail` bytes starting at `offset` to the front of the file.
    fn shift_tail(&self, offset: u64, tail: u64) -> Result<(), BufferError> {
        let mut chunk = vec![0u8; REWRITE_CHUNK.min(tail as usize).max(1)];
        let mut moved = 0u64;
        while moved < tail {
            let want = chunk.len().min((tail - moved) as usize);
            let buf = &mut chunk[..want];
            self.file
                .read_exact_at(buf, offset + moved)
                .context(RewriteSnafu)?;
            self.file.write_all_at(buf, moved).context(RewriteSnafu)?;
            moved += want as u64;
        }
        Ok(())
    }
}

impl Drop for BufferGuard {
    fn drop(&mut self) {
        // Advisory unlock cannot meaningfully fail here; the description
        // stays locked until process exit if it somehow does.
        let _ = fs2::FileExt::unlock(&*self.file);
    }
}

/// Read-only view of the buffer's first `len` bytes at snapshot time.
pub struct Snapshot {
    map: Mmap,
    len: u64,
}

impl Snapshot {
    /// Number of bytes captured.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The captured bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.map[..self.len as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs2::FileExt as _;
    use std::io::Write;

    fn buffer_with(content: &[u8]) -> (tempfile::TempDir, std::path::PathBuf, BufferFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.csv");
        std::fs::write(&path, content).unwrap();
        let buffer = BufferFile::open(&path).unwrap();
        (dir, path, buffer)
    }

    #[tokio::test]
    async fn test_empty_buffer_has_no_snapshot() {
        let (_dir, _path, buffer) = buffer_with(b"");
        let guard = buffer.lock().await.unwrap();
        assert!(guard.snapshot().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_captures_contents() {
        let content = b"2024-01-01T00:00:00Z;room1;dht22;temp;21.5\n";
        let (_dir, _path, buffer) = buffer_with(content);
        let guard = buffer.lock().await.unwrap();
        let snapshot = guard.snapshot().unwrap().unwrap();
        assert_eq!(snapshot.len(), content.len() as u64);
        assert_eq!(snapshot.bytes(), content);
    }

    #[tokio::test]
    async fn test_prefix_consume_empties_buffer() {
        let (_dir, path, buffer) = buffer_with(b"a;1\nb;2\n");
        let guard = buffer.lock().await.unwrap();
        let snapshot = guard.snapshot().unwrap().unwrap();
        let consumed = guard.consume(snapshot, TruncateMode::Prefix).unwrap();
        assert_eq!(consumed, 8);
        assert_eq!(std::fs::read(&path).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_prefix_consume_keeps_racing_appends() {
        let (_dir, path, buffer) = buffer_with(b"a;1\nb;2\n");
        let guard = buffer.lock().await.unwrap();
        let snapshot = guard.snapshot().unwrap().unwrap();

        // A producer that ignores the advisory lock appends mid-cycle.
        let mut appender = OpenOptions::new().append(true).open(&path).unwrap();
        appender.write_all(b"c;3\n").unwrap();

        guard.consume(snapshot, TruncateMode::Prefix).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"c;3\n");
    }

    #[tokio::test]
    async fn test_full_consume_discards_racing_appends() {
        let (_dir, path, buffer) = buffer_with(b"a;1\nb;2\n");
        let guard = buffer.lock().await.unwrap();
        let snapshot = guard.snapshot().unwrap().unwrap();

        let mut appender = OpenOptions::new().append(true).open(&path).unwrap();
        appender.write_all(b"c;3\n").unwrap();

        guard.consume(snapshot, TruncateMode::Full).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_prefix_consume_shifts_large_tails() {
        let head = vec![b'x'; 3 * REWRITE_CHUNK + 17];
        let (_dir, path, buffer) = buffer_with(&head);
        let guard = buffer.lock().await.unwrap();
        let snapshot = guard.snapshot().unwrap().unwrap();

        let tail: Vec<u8> = (0..2 * REWRITE_CHUNK + 5).map(|i| (i % 251) as u8).collect();
        let mut appender = OpenOptions::new().append(true).open(&path).unwrap();
        appender.write_all(&tail).unwrap();

        guard.consume(snapshot, TruncateMode::Prefix).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), tail);
    }

    #[tokio::test]
    async fn test_lock_excludes_other_holders() {
        let (_dir, path, buffer) = buffer_with(b"a;1\n");
        let guard = buffer.lock().await.unwrap();

        // A separate open file description contends for the same lock.
        let other = File::open(&path).unwrap();
        assert!(other.try_lock_exclusive().is_err());

        drop(guard);
        assert!(other.try_lock_exclusive().is_ok());
        other.unlock().unwrap();
    }

    #[tokio::test]
    async fn test_lock_released_even_without_consume() {
        let (_dir, path, buffer) = buffer_with(b"a;1\n");
        {
            let guard = buffer.lock().await.unwrap();
            let _snapshot = guard.snapshot().unwrap().unwrap();
            // Simulates a failed load: guard dropped without consume.
        }
        let other = File::open(&path).unwrap();
        assert!(other.try_lock_exclusive().is_ok());
        other.unlock().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"a;1\n");
    }

    #[test]
    fn test_open_rejects_missing_parent() {
        assert!(matches!(
            BufferFile::open("/nonexistent-dir/buffer.csv"),
            Err(BufferError::Open { .. })
        ));
    }
}
