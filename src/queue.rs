//! Archive queue backed by object storage.
//!
//! Archives live under `metrics-logs/{new,ongoing,processed}/`. The folder an
//! archive sits in is its [`ArchiveStatus`]; `claim` and `release` are the only
//! operations that move it, always one step forward, by copying to the next
//! prefix and then deleting the source. The pair is not atomic, so the queue
//! assumes a single run at a time.

use crate::constants;
use crate::error::{MetricsError, Result};
use crate::observability::QueueMetrics;
use chrono::NaiveDate;
use futures::StreamExt;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

static ARCHIVE_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|[^0-9])([0-9]{8})(?:[^0-9]|$)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    New,
    Ongoing,
    Processed,
}

impl ArchiveStatus {
    pub const ALL: [ArchiveStatus; 3] = [ArchiveStatus::New, ArchiveStatus::Ongoing, ArchiveStatus::Processed];

    pub fn dir_name(&self) -> &'static str {
        match self {
            ArchiveStatus::New => "new",
            ArchiveStatus::Ongoing => "ongoing",
            ArchiveStatus::Processed => "processed",
        }
    }

    pub fn prefix(&self) -> ObjectPath {
        ObjectPath::from(format!("{}/{}", constants::QUEUE_ROOT, self.dir_name()))
    }

    /// The only state this one may move to.
    pub fn next(&self) -> Option<ArchiveStatus> {
        match self {
            ArchiveStatus::New => Some(ArchiveStatus::Ongoing),
            ArchiveStatus::Ongoing => Some(ArchiveStatus::Processed),
            ArchiveStatus::Processed => None,
        }
    }
}

impl fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// An archive file name together with the log date it encodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ArchiveKey {
    file_name: String,
    date: NaiveDate,
}

impl ArchiveKey {
    /// Parse a file name such as `haproxy-logs-01012024-01.tar.gz`.
    pub fn parse(file_name: &str) -> Result<Self> {
        let date = ARCHIVE_DATE
            .captures_iter(file_name)
            .filter_map(|c| c.get(1))
            .find_map(|m| NaiveDate::parse_from_str(m.as_str(), constants::ARCHIVE_DATE_FORMAT).ok())
            .ok_or_else(|| MetricsError::InvalidArchiveKey(file_name.to_string()))?;
        Ok(Self {
            file_name: file_name.to_string(),
            date,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn location(&self, status: ArchiveStatus) -> ObjectPath {
        status.prefix().child(self.file_name.as_str())
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name)
    }
}

/// Where every archive currently sits.
#[derive(Debug, Default, Serialize)]
pub struct QueueIndex {
    entries: BTreeMap<ArchiveKey, ArchiveStatus>,
    /// Keys seen under more than one prefix, e.g. after a crash between copy and delete
    conflicts: BTreeMap<ArchiveKey, Vec<ArchiveStatus>>,
}

impl QueueIndex {
    fn record(&mut self, key: ArchiveKey, status: ArchiveStatus) {
        if let Some(conflict) = self.conflicts.get_mut(&key) {
            conflict.push(status);
            return;
        }
        match self.entries.insert(key.clone(), status) {
            Some(previous) if previous != status => {
                self.entries.remove(&key);
                self.conflicts.insert(key, vec![previous, status]);
            }
            _ => {}
        }
    }

    pub fn status(&self, key: &ArchiveKey) -> Option<ArchiveStatus> {
        self.entries.get(key).copied()
    }

    pub fn keys_in(&self, status: ArchiveStatus) -> BTreeSet<ArchiveKey> {
        self.entries
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn conflicts(&self) -> &BTreeMap<ArchiveKey, Vec<ArchiveStatus>> {
        &self.conflicts
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct LogQueue {
    store: Arc<dyn ObjectStore>,
}

impl LogQueue {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    async fn list_status(&self, status: ArchiveStatus) -> Result<BTreeSet<ArchiveKey>> {
        let listing = self.store.list_with_delimiter(Some(&status.prefix())).await?;
        let mut keys = BTreeSet::new();
        let mut invalid = 0;
        for meta in listing.objects {
            let Some(file_name) = meta.location.filename() else {
                continue;
            };
            match ArchiveKey::parse(file_name) {
                Ok(key) => {
                    keys.insert(key);
                }
                Err(e) => {
                    invalid += 1;
                    warn!("Ignoring {} under {}: {}", meta.location, status, e);
                }
            }
        }
        if invalid > 0 {
            QueueMetrics::invalid_keys(invalid);
        }
        Ok(keys)
    }

    pub async fn list_new(&self) -> Result<BTreeSet<ArchiveKey>> {
        self.list_status(ArchiveStatus::New).await
    }

    /// Archives left in `ongoing`, typically by a crashed run. They are never
    /// requeued automatically.
    pub async fn list_stuck(&self) -> Result<BTreeSet<ArchiveKey>> {
        let stuck = self.list_status(ArchiveStatus::Ongoing).await?;
        QueueMetrics::archives_stuck(stuck.len());
        Ok(stuck)
    }

    pub async fn snapshot(&self) -> Result<QueueIndex> {
        let mut index = QueueIndex::default();
        for status in ArchiveStatus::ALL {
            for key in self.list_status(status).await? {
                index.record(key, status);
            }
        }
        Ok(index)
    }

    /// Move archives from `new` to `ongoing`. Returns the keys actually claimed
    /// with their new location.
    #[instrument(skip(self, keys), fields(requested = keys.len()))]
    pub async fn claim(&self, keys: &BTreeSet<ArchiveKey>) -> Result<BTreeMap<ArchiveKey, ObjectPath>> {
        let claimed = self.advance(keys, ArchiveStatus::New, ArchiveStatus::Ongoing).await?;
        QueueMetrics::archives_claimed(claimed.len());
        info!("Claimed {} of {} archives", claimed.len(), keys.len());
        Ok(claimed)
    }

    /// Move archives from `ongoing` to `processed`.
    #[instrument(skip(self, keys), fields(requested = keys.len()))]
    pub async fn release(&self, keys: &BTreeSet<ArchiveKey>) -> Result<BTreeMap<ArchiveKey, ObjectPath>> {
        let released = self.advance(keys, ArchiveStatus::Ongoing, ArchiveStatus::Processed).await?;
        QueueMetrics::archives_released(released.len());
        info!("Released {} of {} archives", released.len(), keys.len());
        Ok(released)
    }

    async fn advance(
        &self,
        keys: &BTreeSet<ArchiveKey>,
        from: ArchiveStatus,
        to: ArchiveStatus,
    ) -> Result<BTreeMap<ArchiveKey, ObjectPath>> {
        if from.next() != Some(to) {
            return Err(MetricsError::IllegalTransition {
                key: keys.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(","),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let mut moved = BTreeMap::new();
        for key in keys {
            let source = key.location(from);
            let target = key.location(to);
            match self.store.copy(&source, &target).await {
                Ok(()) => {}
                Err(object_store::Error::NotFound { .. }) => {
                    warn!("{} is no longer in {}, skipping", key, from);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            self.store.delete(&source).await?;
            debug!("{}: {} -> {}", key, from, to);
            moved.insert(key.clone(), target);
        }
        Ok(moved)
    }

    /// Stream one archive to `dest_dir`, returning the local file path.
    pub async fn download(&self, location: &ObjectPath, dest_dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let file_name = location
            .filename()
            .ok_or_else(|| MetricsError::InvalidArchiveKey(location.to_string()))?;
        let dest = dest_dir.join(file_name);

        let mut stream = self.store.get(location).await?.into_stream();
        let mut file = tokio::fs::File::create(&dest).await?;
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use object_store::memory::InMemory;

    async fn seed(store: &InMemory, status: ArchiveStatus, name: &str) {
        let path = status.prefix().child(name);
        store.put(&path, Bytes::from_static(b"archive")).await.unwrap();
    }

    #[test]
    fn parses_date_from_archive_name() {
        let key = ArchiveKey::parse("haproxy-logs-01012024-02.tar.gz").unwrap();
        assert_eq!(key.date(), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert!(ArchiveKey::parse("haproxy-logs.tar.gz").is_err());
        assert!(ArchiveKey::parse("logs-32132024.tar.gz").is_err());
    }

    #[test]
    fn statuses_only_move_forward() {
        assert_eq!(ArchiveStatus::New.next(), Some(ArchiveStatus::Ongoing));
        assert_eq!(ArchiveStatus::Ongoing.next(), Some(ArchiveStatus::Processed));
        assert_eq!(ArchiveStatus::Processed.next(), None);
    }

    #[tokio::test]
    async fn claim_then_release_moves_each_archive_once() {
        let store = Arc::new(InMemory::new());
        seed(&store, ArchiveStatus::New, "logs-01012024.tar.gz").await;
        seed(&store, ArchiveStatus::New, "logs-02012024.tar.gz").await;
        let queue = LogQueue::new(store.clone());

        let new = queue.list_new().await.unwrap();
        assert_eq!(new.len(), 2);

        let claimed = queue.claim(&new).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(queue.list_new().await.unwrap().is_empty());
        assert_eq!(queue.list_stuck().await.unwrap().len(), 2);

        let claimed_keys: BTreeSet<_> = claimed.keys().cloned().collect();
        queue.release(&claimed_keys).await.unwrap();

        let index = queue.snapshot().await.unwrap();
        assert!(index.conflicts().is_empty());
        assert_eq!(index.keys_in(ArchiveStatus::Processed), claimed_keys);
        assert!(index.keys_in(ArchiveStatus::Ongoing).is_empty());
    }

    #[tokio::test]
    async fn claim_skips_archives_that_vanished() {
        let store = Arc::new(InMemory::new());
        seed(&store, ArchiveStatus::New, "logs-01012024.tar.gz").await;
        let queue = LogQueue::new(store.clone());

        let mut keys = queue.list_new().await.unwrap();
        keys.insert(ArchiveKey::parse("logs-05012024.tar.gz").unwrap());

        let claimed = queue.claim(&keys).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(claimed.contains_key(&ArchiveKey::parse("logs-01012024.tar.gz").unwrap()));
    }

    #[tokio::test]
    async fn release_does_not_touch_new_archives() {
        let store = Arc::new(InMemory::new());
        seed(&store, ArchiveStatus::New, "logs-01012024.tar.gz").await;
        let queue = LogQueue::new(store.clone());

        let keys = queue.list_new().await.unwrap();
        let released = queue.release(&keys).await.unwrap();
        assert!(released.is_empty());
        assert_eq!(queue.list_new().await.unwrap(), keys);
    }

    #[tokio::test]
    async fn snapshot_reports_keys_in_two_states() {
        let store = Arc::new(InMemory::new());
        seed(&store, ArchiveStatus::New, "logs-01012024.tar.gz").await;
        seed(&store, ArchiveStatus::Ongoing, "logs-01012024.tar.gz").await;
        let queue = LogQueue::new(store.clone());

        let index = queue.snapshot().await.unwrap();
        let key = ArchiveKey::parse("logs-01012024.tar.gz").unwrap();
        assert_eq!(index.status(&key), None);
        assert_eq!(
            index.conflicts().get(&key),
            Some(&vec![ArchiveStatus::New, ArchiveStatus::Ongoing])
        );
    }

    #[tokio::test]
    async fn download_streams_archive_to_disk() {
        let store = Arc::new(InMemory::new());
        seed(&store, ArchiveStatus::Ongoing, "logs-01012024.tar.gz").await;
        let queue = LogQueue::new(store.clone());
        let dir = tempfile::tempdir().unwrap();

        let key = ArchiveKey::parse("logs-01012024.tar.gz").unwrap();
        let local = queue
            .download(&key.location(ArchiveStatus::Ongoing), dir.path())
            .await
            .unwrap();
        assert_eq!(std::fs::read(local).unwrap(), b"archive");
    }
}
