//! Durable store of already-notified vacancy ids + poll log.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;
use vacmon_core::VacancyRecord;

pub const CRATE_NAME: &str = "vacmon-storage";

/// Only the most recent polls are kept in the log.
pub const POLL_LOG_CAP: usize = 100;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The persisted state exists but cannot be decoded. Never treated as an
    /// empty set: that would re-notify every vacancy ever seen.
    #[error("persisted state {path} is corrupt")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding persisted state")]
    Encode(#[source] serde_json::Error),
    #[error("accessing persisted state {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What gets remembered about a vacancy once its notification went out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifiedEntry {
    pub position: String,
    pub area_codes: Vec<String>,
    pub level: String,
    pub notified_at: DateTime<Utc>,
}

/// One line of the bounded poll log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRecord {
    pub at: DateTime<Utc>,
    pub total_found: usize,
    pub new_notified: usize,
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    notified: BTreeMap<String, NotifiedEntry>,
    #[serde(default)]
    polls: Vec<PollRecord>,
}

/// Read-only snapshot of the notified set as of the last `load`.
#[derive(Debug, Clone, Default)]
pub struct NotifiedSnapshot {
    entries: BTreeMap<String, NotifiedEntry>,
}

impl NotifiedSnapshot {
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&NotifiedEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_notified: usize,
    pub total_polls: usize,
    pub last_poll: Option<PollRecord>,
}

/// JSON-file store of notified vacancy ids. Single writer per store file;
/// callers serialize passes externally.
#[derive(Debug, Clone)]
pub struct NotifiedStore {
    path: PathBuf,
}

impl NotifiedStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted notified set. A missing file is a normal first
    /// run and yields an empty snapshot.
    pub async fn load(&self) -> Result<NotifiedSnapshot, StorageError> {
        let doc = self.read_document().await?;
        Ok(NotifiedSnapshot {
            entries: doc.notified,
        })
    }

    /// Merges the delivered records into the persisted set and durably
    /// rewrites it. Ids already present keep their original entry, so a
    /// repeated commit leaves membership unchanged. Returns how many ids
    /// were newly inserted.
    ///
    /// Callers invoke this only after the notification sink confirmed
    /// delivery of `delivered`.
    pub async fn commit(
        &self,
        delivered: &[VacancyRecord],
        notified_at: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        if delivered.is_empty() {
            return Ok(0);
        }

        let mut doc = self.read_document().await?;
        let mut inserted = 0usize;
        for record in delivered {
            doc.notified.entry(record.id.clone()).or_insert_with(|| {
                inserted += 1;
                NotifiedEntry {
                    position: record.position.clone(),
                    area_codes: record.area_codes.iter().cloned().collect(),
                    level: record.level.clone(),
                    notified_at,
                }
            });
        }

        if inserted == 0 {
            return Ok(0);
        }
        self.write_document(&doc).await?;
        debug!(inserted, total = doc.notified.len(), "notified set committed");
        Ok(inserted)
    }

    /// Appends one poll record, dropping the oldest entries past the cap.
    pub async fn record_poll(&self, poll: PollRecord) -> Result<(), StorageError> {
        let mut doc = self.read_document().await?;
        doc.polls.push(poll);
        if doc.polls.len() > POLL_LOG_CAP {
            let excess = doc.polls.len() - POLL_LOG_CAP;
            doc.polls.drain(..excess);
        }
        self.write_document(&doc).await
    }

    pub async fn stats(&self) -> Result<StoreStats, StorageError> {
        let doc = self.read_document().await?;
        Ok(StoreStats {
            total_notified: doc.notified.len(),
            total_polls: doc.polls.len(),
            last_poll: doc.polls.last().cloned(),
        })
    }

    async fn read_document(&self) -> Result<StoreDocument, StorageError> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StorageError::Corrupt {
                path: self.path.clone(),
                source,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(StoreDocument::default())
            }
            Err(source) => Err(StorageError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Writes via a temp file in the destination directory plus rename, so
    /// an interrupted write leaves the previous state intact.
    async fn write_document(&self, doc: &StoreDocument) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(doc).map_err(StorageError::Encode)?;

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|source| StorageError::Io {
                path: parent.clone(),
                source,
            })?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|source| StorageError::Io {
                path: temp_path.clone(),
                source,
            })?;
        let write_result = async {
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(source) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io {
                path: temp_path,
                source,
            });
        }

        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(source) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StorageError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        }
    }
}
