//! FIFO serialization of asynchronous remote operations.
//!
//! One queue serves one logical remote connection. Operations are fed
//! through an unbounded channel into a single worker task, so each one
//! starts only after every previously enqueued operation has completed
//! (success or failure), no matter how their remote round-trips would
//! otherwise interleave. A failure never stalls the chain: the worker
//! logs it and moves on, and the operation's own outcome is available
//! through the receiver [`enqueue`](OpQueue::enqueue) hands back.

use std::future::Future;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use crate::error::SyncError;

type Op = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), SyncError>> + Send>;

struct QueuedOp {
    label: String,
    op: Op,
    done: oneshot::Sender<Result<(), SyncError>>,
}

/// Per-observer serialization primitive for remote calls.
pub struct OpQueue {
    tx: mpsc::UnboundedSender<QueuedOp>,
}

impl OpQueue {
    /// Spawn the worker task and return the queue handle. Must be called
    /// from within a tokio runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedOp>();
        tokio::spawn(async move {
            while let Some(queued) = rx.recv().await {
                let result = (queued.op)().await;
                if let Err(err) = &result {
                    log::warn!("queued operation `{}` failed: {err}", queued.label);
                }
                // The caller may have dropped the receiver; the failure
                // is already logged above.
                let _ = queued.done.send(result);
            }
        });
        Self { tx }
    }

    /// Append `op` to the chain; it starts only once every previously
    /// enqueued operation has completed.
    ///
    /// The returned receiver carries this operation's typed outcome.
    /// Dropping it gives the fire-and-forget behavior the queue's
    /// failure policy is built around; awaiting it resolves to
    /// `Err(RecvError)` only if the worker is gone.
    pub fn enqueue<F, Fut>(
        &self,
        label: impl Into<String>,
        op: F,
    ) -> oneshot::Receiver<Result<(), SyncError>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        let label = label.into();
        let (done_tx, done_rx) = oneshot::channel();
        let queued = QueuedOp {
            label: label.clone(),
            op: Box::new(move || Box::pin(op())),
            done: done_tx,
        };
        if self.tx.send(queued).is_err() {
            log::warn!("operation queue worker is gone; dropping `{label}`");
        }
        done_rx
    }

    /// Barrier: the returned future resolves once every operation
    /// enqueued before this call has completed. Operations enqueued
    /// afterwards do not delay it.
    ///
    /// The marker is enqueued at call time, not at first poll.
    pub fn drain(&self) -> impl Future<Output = ()> + Send {
        let rx = self.enqueue("drain", || async { Ok(()) });
        async move {
            let _ = rx.await;
        }
    }
}

impl Default for OpQueue {
    fn default() -> Self {
        Self::new()
    }
}
