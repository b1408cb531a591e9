//! Append-only capture history with per-identity counters
//!
//! Records are never updated or deleted. Appending a record and incrementing
//! its owner's counter happen as one unit, so a reader never sees one without
//! the other.

use crate::{CaptureRequest, ImageFormat, LedgerError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Metadata for one completed capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRecord {
    pub id: Uuid,
    pub owner: String,
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub full_page: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    pub created_at: DateTime<Utc>,
    pub size: usize,
}

impl CaptureRecord {
    pub fn new(owner: &str, request: &CaptureRequest, size: usize) -> Self {
        Self {
            id: Uuid::now_v7(),
            owner: owner.to_string(),
            url: request.url.to_string(),
            width: request.viewport.width,
            height: request.viewport.height,
            format: request.format,
            full_page: request.full_page,
            quality: request.quality,
            created_at: Utc::now(),
            size,
        }
    }

    fn sort_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

/// One page of an identity's history, newest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryPage {
    pub records: Vec<CaptureRecord>,
    pub total: u64,
}

/// Storage backend for the ledger.
///
/// Implementations must apply `append` atomically: the record becomes visible
/// to `query` in the same step as the owner's counter is incremented.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a record and return the owner's new capture count.
    async fn append(&self, record: CaptureRecord) -> Result<u64, LedgerError>;

    /// Up to `limit` records after skipping `offset`, ordered by `created_at`
    /// descending with ties broken by id descending.
    async fn query(&self, owner: &str, limit: usize, offset: usize) -> Result<HistoryPage, LedgerError>;

    async fn count_for(&self, owner: &str) -> Result<u64, LedgerError>;
}

#[derive(Debug, Default)]
struct OwnerEntry {
    /// Ascending by (created_at, id)
    records: Vec<CaptureRecord>,
    count: u64,
}

/// In-process store; each owner's entry lock serialises that owner's writes.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    owners: DashMap<String, OwnerEntry>,
    ids: DashSet<Uuid>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn append(&self, record: CaptureRecord) -> Result<u64, LedgerError> {
        if !self.ids.insert(record.id) {
            return Err(LedgerError::DuplicateRecord(record.id));
        }

        let mut entry = self.owners.entry(record.owner.clone()).or_default();
        let key = record.sort_key();
        let position = entry.records.partition_point(|r| r.sort_key() <= key);
        entry.records.insert(position, record);
        entry.count += 1;
        Ok(entry.count)
    }

    async fn query(&self, owner: &str, limit: usize, offset: usize) -> Result<HistoryPage, LedgerError> {
        Ok(match self.owners.get(owner) {
            Some(entry) => HistoryPage {
                records: entry.records.iter().rev().skip(offset).take(limit).cloned().collect(),
                total: entry.count,
            },
            None => HistoryPage {
                records: Vec::new(),
                total: 0,
            },
        })
    }

    async fn count_for(&self, owner: &str) -> Result<u64, LedgerError> {
        Ok(self.owners.get(owner).map_or(0, |entry| entry.count))
    }
}

/// Shared handle to the capture history
#[derive(Clone)]
pub struct CaptureLedger {
    store: Arc<dyn LedgerStore>,
}

impl CaptureLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLedgerStore::new()))
    }

    pub async fn append(&self, record: CaptureRecord) -> Result<u64, LedgerError> {
        self.store.append(record).await
    }

    pub async fn history(&self, owner: &str, limit: usize, offset: usize) -> Result<HistoryPage, LedgerError> {
        self.store.query(owner, limit, offset).await
    }

    pub async fn count_for(&self, owner: &str) -> Result<u64, LedgerError> {
        self.store.count_for(owner).await
    }
}
