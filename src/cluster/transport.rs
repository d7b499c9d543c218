//! HTTP adapters for talking to remote shard replicas.
//!
//! Both adapters share one pooled `reqwest` client. Replicas of a shard are
//! tried in configuration order and the first one that answers wins.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::executor::{RemoteExecutor, RemoteRequest};
use super::topology::ShardInfo;
use crate::error::{DistError, DistResult};
use crate::sharding::batch::WriteBatch;
use crate::sharding::queue::BatchSender;
use crate::stream::{Block, BlockStream};

pub const QUERY_PATH: &str = "/_api/shard/query";
pub const INSERT_PATH: &str = "/_api/shard/insert";

static HTTP_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Install the client used by the remote adapters. Only the first call wins.
pub fn init_http_client(client: reqwest::Client) {
    let _ = HTTP_CLIENT.set(client);
}

pub fn get_http_client() -> reqwest::Client {
    HTTP_CLIENT.get_or_init(reqwest::Client::new).clone()
}

fn replica_url(replica: &str, path: &str) -> String {
    format!("http://{}{}", replica, path)
}

/// Body of a successful query response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub blocks: Vec<Block>,
}

/// Send a JSON body to each replica in turn until one accepts it
async fn post_to_replicas<T, R>(
    shard: &ShardInfo,
    path: &str,
    body: &T,
    timeout: Duration,
) -> DistResult<R>
where
    T: Serialize + Sync,
    R: for<'de> Deserialize<'de>,
{
    if shard.remote_replicas.is_empty() {
        return Err(DistError::ConfigError(format!(
            "Shard {} has no remote replicas",
            shard.index
        )));
    }

    let client = get_http_client();
    let mut last_error = None;

    for replica in &shard.remote_replicas {
        let url = replica_url(replica, path);
        let result = async {
            let response = client.post(&url).timeout(timeout).json(body).send().await?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(DistError::NetworkError(format!(
                    "{} returned {}: {}",
                    url, status, text
                )));
            }
            Ok(response.json::<R>().await?)
        }
        .await;

        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!("DISTRIBUTED: replica {} of shard {} failed: {}", replica, shard.index, err);
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| DistError::InternalError("no replica attempted".to_string())))
}

/// Runs shard statements on remote replicas over HTTP
#[derive(Debug, Clone, Default)]
pub struct HttpRemoteExecutor;

impl HttpRemoteExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RemoteExecutor for HttpRemoteExecutor {
    async fn execute(&self, shard: &ShardInfo, request: RemoteRequest) -> DistResult<BlockStream> {
        let timeout = request.settings.remote_timeout();
        let response: QueryResponse = post_to_replicas(shard, QUERY_PATH, &request, timeout).await?;
        debug!(
            "DISTRIBUTED: shard {} returned {} blocks",
            shard.index,
            response.blocks.len()
        );
        Ok(Box::pin(stream::iter(response.blocks.into_iter().map(Ok))))
    }
}

/// Delivers queued write batches to remote replicas over HTTP
#[derive(Debug, Clone)]
pub struct HttpBatchSender {
    timeout: Duration,
}

impl HttpBatchSender {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[derive(Debug, Deserialize)]
struct InsertAck {
    #[serde(default)]
    #[allow(dead_code)]
    rows: u64,
}

#[async_trait]
impl BatchSender for HttpBatchSender {
    async fn send_batch(&self, shard: &ShardInfo, batch: &WriteBatch) -> DistResult<()> {
        let _: InsertAck = post_to_replicas(shard, INSERT_PATH, batch, self.timeout).await?;
        Ok(())
    }
}
