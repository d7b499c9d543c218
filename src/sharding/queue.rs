//! Per-shard on-disk delivery queues.
//!
//! Every shard with remote replicas gets a directory under the table's data
//! path. Writers drop encoded batches into it and one background sender per
//! directory delivers them in sequence order. A batch file is removed only
//! after its delivery succeeded, so batches survive restarts and failures.
//!
//! Layout:
//! ```text
//! <data_path>/<table>/shard_1/00000000000000000001.bin
//! <data_path>/<table>/shard_1/broken/...      (undecodable batches)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::batch::WriteBatch;
use crate::cluster::topology::{ClusterTopology, ShardInfo};
use crate::error::{DistError, DistResult};
use crate::stream::union::wait_cancelled;

pub const BATCH_EXTENSION: &str = "bin";
const TMP_EXTENSION: &str = "tmp";
const BROKEN_DIR: &str = "broken";

/// Delivers one batch to the remote replicas of a shard
#[async_trait]
pub trait BatchSender: Send + Sync {
    async fn send_batch(&self, shard: &ShardInfo, batch: &WriteBatch) -> DistResult<()>;
}

/// Delay between delivery attempts after failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: base * 2^attempt, capped at `max_delay`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(20);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Create the table's queue directory if needed and return the names of the
/// queue subdirectories already present in it.
pub fn recover_queues(path: &Path) -> DistResult<BTreeSet<String>> {
    std::fs::create_dir_all(path)?;

    let mut names = BTreeSet::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

fn batch_sequence(path: &Path) -> Option<u64> {
    if path.extension().and_then(|e| e.to_str()) != Some(BATCH_EXTENSION) {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn batch_file_name(sequence: u64) -> String {
    format!("{:020}.{}", sequence, BATCH_EXTENSION)
}

struct QueueShared {
    name: String,
    dir: PathBuf,
    next_sequence: AtomicU64,
    notify: Notify,
}

impl QueueShared {
    async fn pending_files(&self) -> DistResult<Vec<(u64, PathBuf)>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(seq) = batch_sequence(&path) {
                files.push((seq, path));
            }
        }
        files.sort_by_key(|(seq, _)| *seq);
        Ok(files)
    }

    async fn move_to_broken(&self, path: &Path) -> DistResult<()> {
        let broken = self.dir.join(BROKEN_DIR);
        tokio::fs::create_dir_all(&broken).await?;
        if let Some(file_name) = path.file_name() {
            tokio::fs::rename(path, broken.join(file_name)).await?;
        }
        Ok(())
    }

    /// Deliver every pending batch in order. Stops at the first failed
    /// delivery, leaving that batch and all later ones in place.
    async fn drain(
        &self,
        shard: &ShardInfo,
        sender: &dyn BatchSender,
        shutdown: &mut watch::Receiver<bool>,
    ) -> DistResult<usize> {
        let mut delivered = 0;

        for (_, path) in self.pending_files().await? {
            if *shutdown.borrow() {
                break;
            }

            let bytes = tokio::fs::read(&path).await?;
            let batch = match WriteBatch::decode(&bytes) {
                Ok(batch) => batch,
                Err(err) => {
                    error!(
                        "QUEUE: {}: cannot decode {}, moving it aside: {}",
                        self.name,
                        path.display(),
                        err
                    );
                    self.move_to_broken(&path).await?;
                    continue;
                }
            };

            tokio::select! {
                result = sender.send_batch(shard, &batch) => result?,
                _ = wait_cancelled(shutdown) => break,
            }

            tokio::fs::remove_file(&path).await?;
            delivered += 1;
        }

        Ok(delivered)
    }
}

/// Queue of pending batches for one shard directory
pub struct DeliveryQueue {
    shared: Arc<QueueShared>,
    shard: Option<ShardInfo>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryQueue {
    /// Open the queue in `dir`, creating the directory when missing.
    ///
    /// Batches already in the directory are kept and delivered first. With no
    /// `shard` the queue holds its batches but runs no sender. The sender task
    /// runs on `runtime`.
    pub fn open(
        dir: PathBuf,
        shard: Option<ShardInfo>,
        sender: Arc<dyn BatchSender>,
        policy: RetryPolicy,
        runtime: &Handle,
    ) -> DistResult<Self> {
        std::fs::create_dir_all(&dir)?;
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut last_sequence = 0;
        let mut pending = 0usize;
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(TMP_EXTENSION) {
                // Interrupted enqueue, the batch was never acknowledged
                let _ = std::fs::remove_file(&path);
                continue;
            }
            if let Some(seq) = batch_sequence(&path) {
                last_sequence = last_sequence.max(seq);
                pending += 1;
            }
        }

        let shared = Arc::new(QueueShared {
            name,
            dir,
            next_sequence: AtomicU64::new(last_sequence + 1),
            notify: Notify::new(),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handle = match &shard {
            Some(shard) => {
                debug!(
                    "QUEUE: {}: starting sender for shard {} ({} pending)",
                    shared.name, shard.index, pending
                );
                Some(runtime.spawn(run_sender(
                    shared.clone(),
                    shard.clone(),
                    sender,
                    policy,
                    shutdown_rx,
                )))
            }
            None => {
                warn!(
                    "QUEUE: {}: directory matches no shard of the cluster, keeping {} pending batches undelivered",
                    shared.name, pending
                );
                None
            }
        };

        Ok(Self {
            shared,
            shard,
            shutdown,
            handle: Mutex::new(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    pub fn shard(&self) -> Option<&ShardInfo> {
        self.shard.as_ref()
    }

    /// Persist `batch` and wake the sender. The batch is durable once this
    /// returns.
    pub async fn enqueue(&self, batch: &WriteBatch) -> DistResult<PathBuf> {
        if *self.shutdown.borrow() {
            return Err(DistError::InternalError(format!(
                "delivery queue {} is shut down",
                self.shared.name
            )));
        }

        let bytes = batch.encode()?;
        let sequence = self.shared.next_sequence.fetch_add(1, Ordering::SeqCst);
        let path = self.shared.dir.join(batch_file_name(sequence));
        let tmp = path.with_extension(TMP_EXTENSION);

        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        self.shared.notify.notify_one();
        Ok(path)
    }

    /// Pending batch files in delivery order
    pub async fn pending_files(&self) -> DistResult<Vec<PathBuf>> {
        Ok(self
            .shared
            .pending_files()
            .await?
            .into_iter()
            .map(|(_, path)| path)
            .collect())
    }

    pub async fn pending_count(&self) -> DistResult<usize> {
        Ok(self.shared.pending_files().await?.len())
    }

    /// Stop the sender. Pending batches stay on disk.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("QUEUE: {}: sender task ended abnormally: {}", self.shared.name, err);
            }
        }
    }
}

impl Drop for DeliveryQueue {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn run_sender(
    shared: Arc<QueueShared>,
    shard: ShardInfo,
    sender: Arc<dyn BatchSender>,
    policy: RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match shared.drain(&shard, sender.as_ref(), &mut shutdown).await {
            Ok(delivered) => {
                if delivered > 0 {
                    debug!("QUEUE: {}: delivered {} batches", shared.name, delivered);
                }
                attempt = 0;
                tokio::select! {
                    _ = shared.notify.notified() => {}
                    _ = wait_cancelled(&mut shutdown) => break,
                }
            }
            Err(err) => {
                let delay = policy.delay(attempt);
                attempt = attempt.saturating_add(1);
                warn!(
                    "QUEUE: {}: delivery to shard {} failed (attempt {}), retrying in {:?}: {}",
                    shared.name, shard.index, attempt, delay, err
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_cancelled(&mut shutdown) => break,
                }
            }
        }
    }

    debug!("QUEUE: {}: sender stopped", shared.name);
}

/// All delivery queues of one distributed table
pub struct DeliveryQueues {
    root: PathBuf,
    topology: Arc<ClusterTopology>,
    sender: Arc<dyn BatchSender>,
    policy: RetryPolicy,
    runtime: Handle,
    queues: Mutex<BTreeMap<String, Arc<DeliveryQueue>>>,
}

impl DeliveryQueues {
    /// Adopt every queue directory already under `root`, even empty ones,
    /// before any write arrives. Senders run on the current tokio runtime;
    /// outside of one this fails instead of starting them.
    pub fn recover(
        root: PathBuf,
        topology: Arc<ClusterTopology>,
        sender: Arc<dyn BatchSender>,
        policy: RetryPolicy,
    ) -> DistResult<Self> {
        let runtime = Handle::try_current().map_err(|err| {
            DistError::InternalError(format!(
                "delivery queues under {} need a tokio runtime: {}",
                root.display(),
                err
            ))
        })?;
        Self::recover_on(runtime, root, topology, sender, policy)
    }

    /// [`DeliveryQueues::recover`] with senders spawned on `runtime`
    pub fn recover_on(
        runtime: Handle,
        root: PathBuf,
        topology: Arc<ClusterTopology>,
        sender: Arc<dyn BatchSender>,
        policy: RetryPolicy,
    ) -> DistResult<Self> {
        let names = recover_queues(&root)?;
        let queues = Self {
            root,
            topology,
            sender,
            policy,
            runtime,
            queues: Mutex::new(BTreeMap::new()),
        };

        for name in &names {
            queues.require(name)?;
        }

        if !names.is_empty() {
            info!(
                "QUEUE: recovered {} delivery queues under {}",
                names.len(),
                queues.root.display()
            );
        }
        Ok(queues)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Queue for directory `name`, started on first use
    pub fn require(&self, name: &str) -> DistResult<Arc<DeliveryQueue>> {
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get(name) {
            return Ok(queue.clone());
        }

        let shard = self.topology.shard_by_dir_name(name).cloned();
        let queue = Arc::new(DeliveryQueue::open(
            self.root.join(name),
            shard,
            self.sender.clone(),
            self.policy,
            &self.runtime,
        )?);
        queues.insert(name.to_string(), queue.clone());
        Ok(queue)
    }

    pub fn require_for_shard(&self, shard: &ShardInfo) -> DistResult<Arc<DeliveryQueue>> {
        self.require(&shard.dir_name())
    }

    pub fn get(&self, name: &str) -> Option<Arc<DeliveryQueue>> {
        self.queues.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.queues.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().is_empty()
    }

    /// Stop and release all queues. Nothing is flushed.
    pub async fn shutdown_all(&self) {
        let queues: Vec<Arc<DeliveryQueue>> =
            std::mem::take(&mut *self.queues.lock()).into_values().collect();
        for queue in queues {
            queue.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Block;
    use disttable_ast::InsertQuery;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MockSender {
        delivered: Mutex<Vec<(usize, u64)>>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl BatchSender for MockSender {
        async fn send_batch(&self, shard: &ShardInfo, batch: &WriteBatch) -> DistResult<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DistError::NetworkError("replica down".to_string()));
            }
            let id = batch.block().rows[0][0].as_u64().unwrap_or_default();
            self.delivered.lock().push((shard.index, id));
            Ok(())
        }
    }

    fn topology() -> Arc<ClusterTopology> {
        Arc::new(
            ClusterTopology::new(
                "test",
                vec![
                    ShardInfo::new(1, 1, vec![]),
                    ShardInfo::new(1, 0, vec!["a:9000".to_string()]),
                    ShardInfo::new(1, 0, vec!["b:9000".to_string()]),
                ],
            )
            .unwrap(),
        )
    }

    fn batch(shard: usize, id: u64) -> WriteBatch {
        WriteBatch::new(
            shard,
            InsertQuery::new("db", "hits_local"),
            Block::with_rows(vec!["id".to_string()], vec![vec![json!(id)]]),
        )
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        }
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(20), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_recover_queues_lists_directories() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("hits_all");
        assert!(recover_queues(&root).unwrap().is_empty());
        assert!(root.is_dir());

        std::fs::create_dir(root.join("shard_1")).unwrap();
        std::fs::create_dir(root.join("shard_2")).unwrap();
        std::fs::write(root.join("stray.txt"), b"x").unwrap();

        let names: Vec<String> = recover_queues(&root).unwrap().into_iter().collect();
        assert_eq!(names, vec!["shard_1".to_string(), "shard_2".to_string()]);
    }

    #[tokio::test]
    async fn test_enqueue_and_deliver_in_order() {
        let dir = TempDir::new().unwrap();
        let sender = Arc::new(MockSender::default());
        let queues = DeliveryQueues::recover(dir.path().to_path_buf(), topology(), sender.clone(), fast_policy())
            .unwrap();
        assert!(queues.is_empty());

        let queue = queues.require_for_shard(topology().shard(1).unwrap()).unwrap();
        for id in 1..=5 {
            queue.enqueue(&batch(1, id)).await.unwrap();
        }

        wait_until(|| sender.delivered.lock().len() == 5).await;
        let ids: Vec<u64> = sender.delivered.lock().iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert!(sender.delivered.lock().iter().all(|(shard, _)| *shard == 1));

        wait_until(|| std::fs::read_dir(queue.dir()).unwrap().count() == 0).await;
        queues.shutdown_all().await;
        assert!(queues.is_empty());
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried() {
        let dir = TempDir::new().unwrap();
        let sender = Arc::new(MockSender::default());
        sender.failures_left.store(3, Ordering::SeqCst);

        let queues = DeliveryQueues::recover(dir.path().to_path_buf(), topology(), sender.clone(), fast_policy())
            .unwrap();
        let queue = queues.require("shard_2").unwrap();
        queue.enqueue(&batch(2, 7)).await.unwrap();

        wait_until(|| sender.delivered.lock().len() == 1).await;
        assert_eq!(sender.delivered.lock()[0], (2, 7));
        assert_eq!(sender.failures_left.load(Ordering::SeqCst), 0);
        queues.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_pending_batches_survive_restart() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();

        // Sender that never succeeds keeps everything on disk
        let down = Arc::new(MockSender::default());
        down.failures_left.store(usize::MAX, Ordering::SeqCst);
        let queues = DeliveryQueues::recover(root.clone(), topology(), down, fast_policy()).unwrap();
        let queue = queues.require("shard_1").unwrap();
        queue.enqueue(&batch(1, 10)).await.unwrap();
        queue.enqueue(&batch(1, 11)).await.unwrap();
        queues.shutdown_all().await;
        drop(queue);

        assert_eq!(std::fs::read_dir(root.join("shard_1")).unwrap().count(), 2);

        let sender = Arc::new(MockSender::default());
        let queues = DeliveryQueues::recover(root.clone(), topology(), sender.clone(), fast_policy()).unwrap();
        assert_eq!(queues.names(), vec!["shard_1".to_string()]);

        wait_until(|| sender.delivered.lock().len() == 2).await;
        assert_eq!(*sender.delivered.lock(), vec![(1, 10), (1, 11)]);

        // Sequence numbers continue after the recovered files
        let queue = queues.require("shard_1").unwrap();
        let path = queue.enqueue(&batch(1, 12)).await.unwrap();
        assert_eq!(batch_sequence(&path), Some(3));
        queues.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_broken_batch_moved_aside() {
        let dir = TempDir::new().unwrap();
        let shard_dir = dir.path().join("shard_1");
        std::fs::create_dir_all(&shard_dir).unwrap();
        std::fs::write(shard_dir.join(batch_file_name(1)), [3u8, 0, 0, 0, 0xff]).unwrap();
        std::fs::write(shard_dir.join(batch_file_name(2)), batch(1, 5).encode().unwrap()).unwrap();

        let sender = Arc::new(MockSender::default());
        let queues = DeliveryQueues::recover(dir.path().to_path_buf(), topology(), sender.clone(), fast_policy())
            .unwrap();

        wait_until(|| sender.delivered.lock().len() == 1).await;
        assert_eq!(sender.delivered.lock()[0], (1, 5));
        assert!(shard_dir.join(BROKEN_DIR).join(batch_file_name(1)).exists());
        queues.shutdown_all().await;
    }

    #[test]
    fn test_recover_outside_runtime() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("shard_1")).unwrap();
        let sender = Arc::new(MockSender::default());

        let err = DeliveryQueues::recover(dir.path().to_path_buf(), topology(), sender.clone(), fast_policy())
            .err()
            .unwrap();
        assert!(matches!(err, DistError::InternalError(_)));

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let queues =
            DeliveryQueues::recover_on(runtime.handle().clone(), dir.path().to_path_buf(), topology(), sender, fast_policy())
                .unwrap();
        assert_eq!(queues.names(), vec!["shard_1".to_string()]);
        runtime.block_on(queues.shutdown_all());
    }

    #[tokio::test]
    async fn test_unknown_directory_keeps_batches() {
        let dir = TempDir::new().unwrap();
        let stray = dir.path().join("old_replica");
        std::fs::create_dir_all(&stray).unwrap();
        std::fs::write(stray.join(batch_file_name(1)), batch(0, 1).encode().unwrap()).unwrap();

        let sender = Arc::new(MockSender::default());
        let queues = DeliveryQueues::recover(dir.path().to_path_buf(), topology(), sender.clone(), fast_policy())
            .unwrap();
        let queue = queues.get("old_replica").unwrap();
        assert!(queue.shard().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sender.delivered.lock().is_empty());
        assert_eq!(queue.pending_count().await.unwrap(), 1);
        queues.shutdown_all().await;
    }
}
