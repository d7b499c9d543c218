//! Union of shard streams.
//!
//! Every input stream is pumped by its own task into one shared channel, so a
//! slow or stuck shard never keeps the others from being collected. All
//! inputs are pulled at once; how many shards run at the same time is
//! bounded where they are started, in the cluster executor. The first
//! failure cancels all sibling tasks and runs an optional failure hook before
//! the error reaches the consumer. The resharding coordinator relies on that
//! hook to release shards waiting at a barrier for a peer that already failed.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::block::{Block, BlockStream};
use crate::error::{DistError, DistResult};

/// Runs once, on the first failure read from any input stream
pub type FailureHook = Box<dyn FnOnce(&DistError) -> BoxFuture<'static, ()> + Send>;

/// Rows from all input streams, in no particular order across streams.
/// Rows of one input stream keep their relative order.
pub struct UnionStream {
    rx: mpsc::Receiver<DistResult<Block>>,
    cancel: Arc<watch::Sender<bool>>,
    cancelled: AtomicBool,
    failed: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

/// Resolves once `rx` carries `true` or its sender is gone
pub(crate) async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

struct Forwarder {
    index: usize,
    tx: mpsc::Sender<DistResult<Block>>,
    cancel_rx: watch::Receiver<bool>,
    cancel: Arc<watch::Sender<bool>>,
    failed: Arc<AtomicBool>,
    hook: Arc<Mutex<Option<FailureHook>>>,
}

impl Forwarder {
    async fn run(mut self, mut stream: BlockStream) {
        loop {
            let item = tokio::select! {
                biased;
                _ = wait_cancelled(&mut self.cancel_rx) => return,
                item = stream.next() => item,
            };

            match item {
                None => return,
                Some(Ok(block)) => {
                    tokio::select! {
                        biased;
                        _ = wait_cancelled(&mut self.cancel_rx) => return,
                        sent = self.tx.send(Ok(block)) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    if self.failed.swap(true, Ordering::SeqCst) {
                        tracing::debug!(
                            "UNION: Dropping later failure of input {}: {}",
                            self.index,
                            err
                        );
                        return;
                    }

                    tracing::warn!("UNION: Input {} failed, cancelling siblings: {}", self.index, err);
                    self.cancel.send_replace(true);

                    let hook = self.hook.lock().take();
                    if let Some(hook) = hook {
                        hook(&err).await;
                    }

                    let _ = self.tx.send(Err(err)).await;
                    return;
                }
            }
        }
    }
}

impl UnionStream {
    pub fn new(streams: Vec<BlockStream>) -> Self {
        Self::build(streams, None)
    }

    pub fn with_failure_hook(streams: Vec<BlockStream>, hook: FailureHook) -> Self {
        Self::build(streams, Some(hook))
    }

    fn build(streams: Vec<BlockStream>, hook: Option<FailureHook>) -> Self {
        let (tx, rx) = mpsc::channel(streams.len().max(1) * 4);
        let (cancel, _) = watch::channel(false);
        let cancel = Arc::new(cancel);
        let failed = Arc::new(AtomicBool::new(false));
        let hook = Arc::new(Mutex::new(hook));

        let handles = streams
            .into_iter()
            .enumerate()
            .map(|(index, stream)| {
                let forwarder = Forwarder {
                    index,
                    tx: tx.clone(),
                    cancel_rx: cancel.subscribe(),
                    cancel: cancel.clone(),
                    failed: failed.clone(),
                    hook: hook.clone(),
                };
                tokio::spawn(forwarder.run(stream))
            })
            .collect();

        // The channel closes once every forwarder is done
        drop(tx);

        Self {
            rx,
            cancel,
            cancelled: AtomicBool::new(false),
            failed,
            handles,
        }
    }

    /// Stop pulling from every input. Buffered rows may still be returned,
    /// after which the stream ends.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel.send_replace(true);
    }

    /// True once the consumer called [`UnionStream::cancel`]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// True once any input has failed
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

impl Stream for UnionStream {
    type Item = DistResult<Block>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for UnionStream {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
        for handle in &self.handles {
            handle.abort();
        }
    }
}
