//! Persistent clone-index allocation
//!
//! Indices for a name only ever grow, across buckets and processes sharing the
//! same LXC path, so a re-created container never reuses an old directory.

use crate::lock::{atomic_write, with_path_lock};
use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the ledger inside the LXC path
pub const LEDGER_FILE: &str = ".autolxc-clone-index.json";

const LEDGER_LOCK_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    /// Next free index per container name
    next: BTreeMap<String, u32>,
}

#[derive(Debug, Clone)]
pub struct CloneIndexLedger {
    path: PathBuf,
}

impl CloneIndexLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Ledger stored in the standard location under `lxc_path`
    pub fn in_lxc_path(lxc_path: &Path) -> Self {
        Self::new(lxc_path.join(LEDGER_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reserve the next index for `name`, never lower than `floor`.
    ///
    /// The reservation is persisted before returning, so it is consumed even
    /// if the caller later fails to create the container.
    pub async fn allocate(&self, name: &str, floor: u32) -> Result<u32> {
        let path = self.path.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || {
            with_path_lock(&path, LEDGER_LOCK_WAIT, || {
                let mut ledger = read_ledger(&path)?;
                let index = ledger.next.get(&name).copied().unwrap_or(0).max(floor);
                ledger.next.insert(name.clone(), index.saturating_add(1));
                let json = serde_json::to_vec_pretty(&ledger).map_err(std::io::Error::other)?;
                atomic_write(&path, &json)?;
                Ok(index)
            })
        })
        .await
        .map_err(std::io::Error::other)?
        .map_err(CoreError::from)
    }

    /// Next index that would be handed out for `name`
    pub fn peek(&self, name: &str) -> Result<u32> {
        Ok(read_ledger(&self.path)?.next.get(name).copied().unwrap_or(0))
    }
}

fn read_ledger(path: &Path) -> std::io::Result<LedgerFile> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(LedgerFile::default()),
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LedgerFile::default()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocate_is_monotonic() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = CloneIndexLedger::in_lxc_path(tmp.path());

        assert_eq!(ledger.allocate("t1", 0).await.unwrap(), 0);
        assert_eq!(ledger.allocate("t1", 0).await.unwrap(), 1);
        assert_eq!(ledger.allocate("t2", 0).await.unwrap(), 0);
        assert_eq!(ledger.peek("t1").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_allocate_respects_floor() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = CloneIndexLedger::in_lxc_path(tmp.path());

        assert_eq!(ledger.allocate("t1", 5).await.unwrap(), 5);
        assert_eq!(ledger.allocate("t1", 2).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_shared_between_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let a = CloneIndexLedger::in_lxc_path(tmp.path());
        let b = CloneIndexLedger::in_lxc_path(tmp.path());

        assert_eq!(a.allocate("t1", 0).await.unwrap(), 0);
        assert_eq!(b.allocate("t1", 0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_distinct() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = CloneIndexLedger::in_lxc_path(tmp.path());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.allocate("t1", 0).await.unwrap() })
            })
            .collect();
        let mut indices = Vec::new();
        for h in handles {
            indices.push(h.await.unwrap());
        }
        indices.sort();
        assert_eq!(indices, (0..8).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_corrupt_ledger_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = CloneIndexLedger::in_lxc_path(tmp.path());
        std::fs::write(ledger.path(), "not json").unwrap();
        assert!(ledger.allocate("t1", 0).await.is_err());
    }
}
