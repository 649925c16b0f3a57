//! Per-artifact mutual exclusion.
//!
//! Producing an artifact takes the write side; streaming a complete
//! artifact takes the read side. A write guard can be downgraded once the
//! artifact is complete so the same call streams it without letting another
//! writer in between.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Registry of per-path locks, shared by every call on the server.
#[derive(Debug, Clone, Default)]
pub struct ArtifactLocks {
    inner: Arc<Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>>,
}

impl ArtifactLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, path: &Path) -> Arc<RwLock<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // Drop entries nobody holds or waits on.
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(map.entry(path.to_path_buf()).or_default())
    }

    /// Waits for exclusive access to the artifact at `path`.
    pub async fn write(&self, path: &Path) -> OwnedRwLockWriteGuard<()> {
        self.entry(path).write_owned().await
    }

    /// Waits for shared access to the artifact at `path`.
    pub async fn read(&self, path: &Path) -> OwnedRwLockReadGuard<()> {
        self.entry(path).read_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn writer_excludes_reader() {
        let locks = ArtifactLocks::new();
        let path = Path::new("/tmp/backup.dump");

        let write = locks.write(path).await;
        let pending = tokio::time::timeout(Duration::from_millis(50), locks.read(path)).await;
        assert!(pending.is_err(), "reader must wait for the writer");

        drop(write);
        tokio::time::timeout(Duration::from_secs(1), locks.read(path))
            .await
            .expect("reader proceeds after writer releases");
    }

    #[tokio::test]
    async fn readers_share() {
        let locks = ArtifactLocks::new();
        let path = Path::new("/tmp/backup.dump");

        let _r1 = locks.read(path).await;
        tokio::time::timeout(Duration::from_millis(100), locks.read(path))
            .await
            .expect("second reader should not block");
    }

    #[tokio::test]
    async fn distinct_paths_are_independent() {
        let locks = ArtifactLocks::new();
        let _w = locks.write(Path::new("/tmp/a.dump")).await;
        tokio::time::timeout(Duration::from_millis(100), locks.write(Path::new("/tmp/b.dump")))
            .await
            .expect("different artifacts do not contend");
    }

    #[tokio::test]
    async fn downgrade_keeps_other_writers_out() {
        let locks = ArtifactLocks::new();
        let path = Path::new("/tmp/backup.dump");

        let read = locks.write(path).await.downgrade();
        let writer = tokio::time::timeout(Duration::from_millis(50), locks.write(path)).await;
        assert!(writer.is_err());

        drop(read);
        tokio::time::timeout(Duration::from_secs(1), locks.write(path))
            .await
            .expect("writer proceeds after reader releases");
    }

    #[tokio::test]
    async fn released_entries_are_pruned() {
        let locks = ArtifactLocks::new();
        drop(locks.write(Path::new("/tmp/a.dump")).await);
        drop(locks.write(Path::new("/tmp/b.dump")).await);
        // Acquiring a third path prunes the two released ones.
        let _c = locks.write(Path::new("/tmp/c.dump")).await;
        assert_eq!(locks.tracked(), 1);
    }
}
