//! Per-job temp-file arenas with guaranteed release.
//!
//! Every job owns one directory under the spool root, named by a random
//! token. The directory is removed on every job exit path: explicitly on
//! completion, via `Drop` when the job future is torn down, by the
//! startup sweep for arenas orphaned by a crash, and by the background
//! purge for arenas past the configured age. A byte quota across all
//! arenas applies backpressure to spool writes.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Byte accounting shared by all arenas of one federator instance.
#[derive(Debug)]
pub struct ByteQuota {
    limit: u64,
    used: parking_lot::Mutex<u64>,
    freed: Notify,
}

impl ByteQuota {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: parking_lot::Mutex::new(0),
            freed: Notify::new(),
        }
    }

    /// Reserve `bytes`, waiting until the quota has room. A reservation
    /// larger than the whole quota is admitted once the quota is idle,
    /// so a single oversized response cannot deadlock the engine.
    pub async fn reserve(&self, bytes: u64) {
        loop {
            {
                let mut used = self.used.lock();
                if *used + bytes <= self.limit || *used == 0 {
                    *used += bytes;
                    return;
                }
            }
            self.freed.notified().await;
        }
    }

    pub fn release(&self, bytes: u64) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(bytes);
        drop(used);
        self.freed.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn used(&self) -> u64 {
        *self.used.lock()
    }
}

/// Factory and janitor for job arenas.
#[derive(Debug)]
pub struct ArenaSet {
    root: PathBuf,
    quota: Arc<ByteQuota>,
    purge_age: Duration,
}

impl ArenaSet {
    /// Create the arena root (and its parents) if missing.
    pub async fn create(root: PathBuf, quota_bytes: u64, purge_age: Duration) -> io::Result<Self> {
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            quota: Arc::new(ByteQuota::new(quota_bytes)),
            purge_age,
        })
    }

    /// Remove every arena directory below the root. Called once at
    /// startup to reclaim space orphaned by a crash.
    pub async fn sweep_orphans(&self) -> io::Result<usize> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, root = %self.root.display(), "swept orphaned arenas");
        }
        Ok(removed)
    }

    /// Background purge loop removing arenas older than the configured
    /// age. Runs until `shutdown` fires.
    pub async fn run_purge(&self, interval: Duration, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.purge_old().await {
                warn!(error = %e, "arena purge pass failed");
            }
        }
    }

    async fn purge_old(&self) -> io::Result<()> {
        let cutoff = SystemTime::now() - self.purge_age;
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            if modified < cutoff {
                warn!(arena = %entry.path().display(), "purging aged arena");
                tokio::fs::remove_dir_all(entry.path()).await?;
            }
        }
        Ok(())
    }

    /// Allocate a fresh arena for one job.
    pub async fn new_arena(&self) -> io::Result<SpoolArena> {
        let dir = self.root.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir(&dir).await?;
        Ok(SpoolArena {
            dir,
            quota: Arc::clone(&self.quota),
            reserved: AtomicU64::new(0),
        })
    }

    pub fn quota(&self) -> &Arc<ByteQuota> {
        &self.quota
    }
}

/// The spool directory of one job.
///
/// Dropping the arena removes the directory and releases its quota
/// reservation, whichever way the job ended.
#[derive(Debug)]
pub struct SpoolArena {
    dir: PathBuf,
    quota: Arc<ByteQuota>,
    reserved: AtomicU64,
}

impl SpoolArena {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the spool file for sub-request `seq`.
    pub fn spool_path(&self, seq: usize) -> PathBuf {
        self.dir.join(format!("part-{seq:04}"))
    }

    /// Account `bytes` against the shared quota, waiting for room.
    pub async fn reserve(&self, bytes: u64) {
        self.quota.reserve(bytes).await;
        self.reserved.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Give back the reservation held for a discarded spool file.
    pub fn release(&self, bytes: u64) {
        let held = self.reserved.load(Ordering::Relaxed).min(bytes);
        self.reserved.fetch_sub(held, Ordering::Relaxed);
        self.quota.release(held);
    }
}

impl Drop for SpoolArena {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(arena = %self.dir.display(), error = %e, "arena removal failed");
            }
        }
        self.quota.release(self.reserved.load(Ordering::Relaxed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn arena_set(quota: u64) -> (tempfile::TempDir, ArenaSet) {
        let tmp = tempfile::tempdir().unwrap();
        let set = ArenaSet::create(tmp.path().join("spool"), quota, Duration::from_secs(3600))
            .await
            .unwrap();
        (tmp, set)
    }

    #[tokio::test]
    async fn arena_directory_removed_on_drop() {
        let (_tmp, set) = arena_set(1024).await;
        let arena = set.new_arena().await.unwrap();
        let dir = arena.dir().to_path_buf();
        tokio::fs::write(arena.spool_path(0), b"payload").await.unwrap();
        assert!(dir.exists());

        drop(arena);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn drop_releases_quota() {
        let (_tmp, set) = arena_set(1024).await;
        let arena = set.new_arena().await.unwrap();
        arena.reserve(512).await;
        assert_eq!(set.quota().used(), 512);

        drop(arena);
        assert_eq!(set.quota().used(), 0);
    }

    #[tokio::test]
    async fn quota_blocks_until_freed() {
        let (_tmp, set) = arena_set(100).await;
        let a = set.new_arena().await.unwrap();
        let b = set.new_arena().await.unwrap();
        a.reserve(80).await;

        let quota = Arc::clone(set.quota());
        let waiter = tokio::spawn(async move {
            b.reserve(50).await;
            b
        });

        // the waiter cannot proceed yet
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(quota.used(), 80);

        a.release(80);
        let b = waiter.await.unwrap();
        assert_eq!(quota.used(), 50);
        drop(b);
    }

    #[tokio::test]
    async fn oversized_reservation_admitted_when_idle() {
        let (_tmp, set) = arena_set(10).await;
        let arena = set.new_arena().await.unwrap();
        // larger than the whole quota, but the quota is idle
        arena.reserve(100).await;
        assert_eq!(set.quota().used(), 100);
    }

    #[tokio::test]
    async fn sweep_removes_orphans() {
        let (_tmp, set) = arena_set(1024).await;
        let arena = set.new_arena().await.unwrap();
        let dir = arena.dir().to_path_buf();
        // simulate a crash: forget the arena instead of dropping it
        std::mem::forget(arena);
        assert!(dir.exists());

        let removed = set.sweep_orphans().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.exists());
    }
}
