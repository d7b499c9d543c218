//! Interface to the resharding subsystem, plus an in-process implementation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::topology::ClusterTopology;
use crate::error::{DistError, DistResult};

/// Status of a coordination record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinatorStatus {
    Created,
    Registered,
    Running,
    Completed,
    Error,
    Deleted,
}

impl CoordinatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorStatus::Created => "CREATED",
            CoordinatorStatus::Registered => "REGISTERED",
            CoordinatorStatus::Running => "RUNNING",
            CoordinatorStatus::Completed => "COMPLETED",
            CoordinatorStatus::Error => "ERROR",
            CoordinatorStatus::Deleted => "DELETED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CoordinatorStatus::Completed | CoordinatorStatus::Error | CoordinatorStatus::Deleted
        )
    }
}

/// The resharding subsystem as seen by a distributed table
#[async_trait]
pub trait ReshardingWorker: Send + Sync {
    fn is_started(&self) -> bool;

    /// Create a coordination record for `topology` and return its id
    async fn create_coordinator(&self, topology: &ClusterTopology) -> DistResult<String>;

    /// Attach the rendered statement text to the record
    async fn register_query(&self, coordinator_id: &str, query: &str) -> DistResult<()>;

    async fn set_status(
        &self,
        coordinator_id: &str,
        status: CoordinatorStatus,
        message: Option<&str>,
    ) -> DistResult<()>;

    /// Diagnostic snapshot of the record
    async fn dump_coordinator_state(&self, coordinator_id: &str) -> DistResult<String>;

    async fn delete_coordinator(&self, coordinator_id: &str) -> DistResult<()>;
}

/// One status change of a coordination record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: CoordinatorStatus,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorRecord {
    pub id: String,
    pub cluster: String,
    pub shard_count: usize,
    pub query: Option<String>,
    pub status: CoordinatorStatus,
    pub history: Vec<StatusChange>,
}

impl CoordinatorRecord {
    fn transition(&mut self, status: CoordinatorStatus, message: Option<&str>) {
        self.status = status;
        self.history.push(StatusChange {
            status,
            message: message.map(str::to_string),
            at: Utc::now(),
        });
    }

    /// Number of times the record was set to `status`
    pub fn times_set(&self, status: CoordinatorStatus) -> usize {
        self.history.iter().filter(|c| c.status == status).count()
    }
}

/// Deleted records kept for diagnostics by default
pub const DEFAULT_TOMBSTONE_LIMIT: usize = 64;

/// Coordination records kept in memory, for single-process deployments
/// without an external coordination service.
///
/// Deleting a record moves it out of the live set. The most recent deleted
/// records stay readable through [`InMemoryReshardingWorker::record`] with
/// status `DELETED`, older ones are dropped.
#[derive(Debug)]
pub struct InMemoryReshardingWorker {
    started: AtomicBool,
    records: DashMap<String, CoordinatorRecord>,
    tombstones: Mutex<VecDeque<CoordinatorRecord>>,
    tombstone_limit: usize,
}

impl Default for InMemoryReshardingWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryReshardingWorker {
    pub fn new() -> Self {
        Self::with_tombstone_limit(DEFAULT_TOMBSTONE_LIMIT)
    }

    /// Keep at most `limit` deleted records
    pub fn with_tombstone_limit(limit: usize) -> Self {
        Self {
            started: AtomicBool::new(true),
            records: DashMap::new(),
            tombstones: Mutex::new(VecDeque::new()),
            tombstone_limit: limit,
        }
    }

    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }

    /// Live record, or a retained deleted one
    pub fn record(&self, coordinator_id: &str) -> Option<CoordinatorRecord> {
        if let Some(record) = self.records.get(coordinator_id) {
            return Some(record.value().clone());
        }
        self.tombstones
            .lock()
            .iter()
            .find(|r| r.id == coordinator_id)
            .cloned()
    }

    /// Live records followed by the retained deleted ones
    pub fn records(&self) -> Vec<CoordinatorRecord> {
        let mut records: Vec<CoordinatorRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.extend(self.tombstones.lock().iter().cloned());
        records
    }

    /// Records not yet deleted
    pub fn live_count(&self) -> usize {
        self.records.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.lock().len()
    }

    fn missing(&self, coordinator_id: &str) -> DistError {
        let deleted = self
            .tombstones
            .lock()
            .iter()
            .any(|r| r.id == coordinator_id);
        if deleted {
            DistError::CoordinationError(format!("Coordinator {} was deleted", coordinator_id))
        } else {
            DistError::CoordinationError(format!("Coordinator {} not found", coordinator_id))
        }
    }

    fn with_live_record<T>(
        &self,
        coordinator_id: &str,
        f: impl FnOnce(&mut CoordinatorRecord) -> T,
    ) -> DistResult<T> {
        match self.records.get_mut(coordinator_id) {
            Some(mut record) => Ok(f(record.value_mut())),
            None => Err(self.missing(coordinator_id)),
        }
    }

    fn bury(&self, record: CoordinatorRecord) {
        if self.tombstone_limit == 0 {
            return;
        }
        let mut tombstones = self.tombstones.lock();
        while tombstones.len() >= self.tombstone_limit {
            tombstones.pop_front();
        }
        tombstones.push_back(record);
    }
}

#[async_trait]
impl ReshardingWorker for InMemoryReshardingWorker {
    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn create_coordinator(&self, topology: &ClusterTopology) -> DistResult<String> {
        let id = format!("{}-{}", topology.name(), uuid::Uuid::now_v7());
        let mut record = CoordinatorRecord {
            id: id.clone(),
            cluster: topology.name().to_string(),
            shard_count: topology.shard_count(),
            query: None,
            status: CoordinatorStatus::Created,
            history: Vec::new(),
        };
        record.transition(CoordinatorStatus::Created, None);
        self.records.insert(id.clone(), record);
        debug!("RESHARD: created coordinator {}", id);
        Ok(id)
    }

    async fn register_query(&self, coordinator_id: &str, query: &str) -> DistResult<()> {
        self.with_live_record(coordinator_id, |record| {
            record.query = Some(query.to_string());
            record.transition(CoordinatorStatus::Registered, None);
        })
    }

    async fn set_status(
        &self,
        coordinator_id: &str,
        status: CoordinatorStatus,
        message: Option<&str>,
    ) -> DistResult<()> {
        self.with_live_record(coordinator_id, |record| record.transition(status, message))
    }

    async fn dump_coordinator_state(&self, coordinator_id: &str) -> DistResult<String> {
        let record = self.record(coordinator_id).ok_or_else(|| {
            DistError::CoordinationError(format!("Coordinator {} not found", coordinator_id))
        })?;
        Ok(serde_json::to_string_pretty(&record)?)
    }

    async fn delete_coordinator(&self, coordinator_id: &str) -> DistResult<()> {
        let (_, mut record) = self
            .records
            .remove(coordinator_id)
            .ok_or_else(|| self.missing(coordinator_id))?;
        record.transition(CoordinatorStatus::Deleted, None);
        self.bury(record);
        debug!("RESHARD: deleted coordinator {}", coordinator_id);
        Ok(())
    }
}
