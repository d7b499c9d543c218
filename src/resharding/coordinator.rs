//! Client side of a distributed `ALTER TABLE ... RESHARD`.
//!
//! The client creates a coordination record, registers the rendered
//! statement, starts it on every shard and waits for all shards to finish.
//! Shards synchronise with each other through the record, so one failing
//! shard would leave its peers waiting forever. The first failure therefore
//! marks the record `ERROR` right away, from inside the union of shard
//! streams, before the error even reaches this client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use disttable_ast::{AlterParameter, AlterQuery, ReshardParameters, Statement};
use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::worker::{CoordinatorStatus, ReshardingWorker};
use crate::cluster::executor::{AlterQueryConstructor, ClusterQueryExecutor};
use crate::error::{DistError, DistResult};
use crate::query::QueryContext;
use crate::stream::{FailureHook, UnionStream};

/// Progress of one resharding call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    CoordinatorCreated,
    QueryRegistered,
    Dispatched,
    Finalized,
}

/// Mark the record `ERROR` unless that already happened for this call.
/// The flag is released again when the status write itself fails, so a
/// later attempt can still deliver it.
async fn notify_error(
    worker: &dyn ReshardingWorker,
    coordinator_id: &str,
    notified: &AtomicBool,
    message: &str,
) {
    if notified
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    if let Err(err) = worker
        .set_status(coordinator_id, CoordinatorStatus::Error, Some(message))
        .await
    {
        notified.store(false, Ordering::SeqCst);
        warn!(
            "RESHARD: could not mark coordinator {} as failed: {}",
            coordinator_id, err
        );
    }
}

/// Drives one resharding operation across all shards of a cluster
pub struct ReshardingCoordinatorClient {
    worker: Arc<dyn ReshardingWorker>,
    executor: ClusterQueryExecutor,
    remote_database: String,
    remote_table: String,
    state: ClientState,
    coordinator_id: Option<String>,
}

impl ReshardingCoordinatorClient {
    pub fn new(
        worker: Arc<dyn ReshardingWorker>,
        executor: ClusterQueryExecutor,
        remote_database: impl Into<String>,
        remote_table: impl Into<String>,
    ) -> Self {
        Self {
            worker,
            executor,
            remote_database: remote_database.into(),
            remote_table: remote_table.into(),
            state: ClientState::Idle,
            coordinator_id: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn coordinator_id(&self) -> Option<&str> {
        self.coordinator_id.as_deref()
    }

    /// Reshard the partitions described by `params` and wait for every shard.
    ///
    /// `params.coordinator` must be empty: the coordinator is always created
    /// here. Any failure after the record exists is reported to it, the record
    /// is deleted and the original error is returned.
    pub async fn run(&mut self, params: ReshardParameters, context: &QueryContext) -> DistResult<()> {
        if !self.worker.is_started() {
            return Err(DistError::NoReshardingWorker);
        }

        if params.coordinator.is_some() {
            return Err(DistError::InvalidCoordinationRequest(
                "Use of COORDINATE WITH is forbidden in ALTER TABLE ... RESHARD queries for distributed tables"
                    .to_string(),
            ));
        }
        params
            .validate()
            .map_err(|err| DistError::InvalidCoordinationRequest(err.to_string()))?;

        let topology = self.executor.topology().clone();
        let coordinator_id = self.worker.create_coordinator(&topology).await?;
        self.coordinator_id = Some(coordinator_id.clone());
        self.state = ClientState::CoordinatorCreated;
        info!(
            "RESHARD: coordinator {} created for {}.{} on cluster '{}'",
            coordinator_id,
            self.remote_database,
            self.remote_table,
            topology.name()
        );

        let notified = Arc::new(AtomicBool::new(false));

        match self.dispatch(params, context, &coordinator_id, &notified).await {
            Ok(()) => {
                self.state = ClientState::Finalized;
                info!("RESHARD: coordinator {} finished on all shards", coordinator_id);
                Ok(())
            }
            Err(err) => {
                self.cleanup(&coordinator_id, &notified, &err).await;
                Err(err)
            }
        }
    }

    async fn dispatch(
        &mut self,
        params: ReshardParameters,
        context: &QueryContext,
        coordinator_id: &str,
        notified: &Arc<AtomicBool>,
    ) -> DistResult<()> {
        let alter = AlterQuery::new(self.remote_database.as_str(), self.remote_table.as_str())
            .with_parameter(AlterParameter::ReshardPartition(ReshardParameters {
                coordinator: Some(Value::String(coordinator_id.to_string())),
                ..params
            }));
        let statement = Statement::Alter(alter);

        self.worker
            .register_query(coordinator_id, &statement.to_string())
            .await?;
        self.state = ClientState::QueryRegistered;

        let mut shard_context = context.clone();
        shard_context.settings.distributed_group_by_no_merge = true;
        let shard_context = Arc::new(shard_context);

        let streams = self
            .executor
            .execute(&AlterQueryConstructor, &statement, &shard_context);
        self.state = ClientState::Dispatched;
        debug!(
            "RESHARD: dispatched to {} shards: {}",
            streams.len(),
            statement
        );

        let hook_worker = self.worker.clone();
        let hook_id = coordinator_id.to_string();
        let hook_flag = notified.clone();
        let hook: FailureHook = Box::new(move |err: &DistError| -> BoxFuture<'static, ()> {
            let message = err.to_string();
            Box::pin(async move {
                notify_error(hook_worker.as_ref(), &hook_id, &hook_flag, &message).await;
            })
        });

        let mut union = UnionStream::with_failure_hook(streams, hook);

        // Output carries nothing; reading it only waits for every shard
        while let Some(item) = union.next().await {
            item?;
        }
        Ok(())
    }

    /// Best effort: nothing in here may replace the error being reported
    async fn cleanup(&self, coordinator_id: &str, notified: &AtomicBool, err: &DistError) {
        notify_error(self.worker.as_ref(), coordinator_id, notified, &err.to_string()).await;

        let dump = match self.worker.dump_coordinator_state(coordinator_id).await {
            Ok(dump) => dump,
            Err(dump_err) => {
                warn!(
                    "RESHARD: could not dump state of coordinator {}: {}",
                    coordinator_id, dump_err
                );
                String::new()
            }
        };

        if let Err(delete_err) = self.worker.delete_coordinator(coordinator_id).await {
            warn!(
                "RESHARD: could not delete coordinator {}: {}",
                coordinator_id, delete_err
            );
        }

        error!(
            "RESHARD: coordinator {} failed: {}. Coordinator state:\n{}",
            coordinator_id, err, dump
        );
    }
}
