//! Background directory refresh and preload.
//!
//! Directories whose listing went stale, and child directories that were
//! never enumerated, are queued here. A single worker task drains the
//! queue one directory at a time and lets the cache diff the fresh remote
//! listing against its children.
//!
//! The worker only holds a weak reference to the cache and stops as soon
//! as the cache is gone or shut down.

use std::sync::{Arc, Weak};

use dashmap::DashSet;
use davdrive_core::ports::RemoteError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::MetadataCache;

/// Sending side of the refresh queue, owned by the cache.
///
/// A directory is queued at most once until the worker has processed it.
#[derive(Debug)]
pub struct RefreshQueue {
    tx: mpsc::UnboundedSender<String>,
    queued: Arc<DashSet<String>>,
    shutdown: CancellationToken,
}

impl RefreshQueue {
    /// Creates the queue together with the receiver the worker drains.
    pub fn new() -> (Self, RefreshReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(DashSet::new());
        let shutdown = CancellationToken::new();
        let receiver = RefreshReceiver {
            rx,
            queued: Arc::clone(&queued),
            shutdown: shutdown.clone(),
        };
        (
            Self {
                tx,
                queued,
                shutdown,
            },
            receiver,
        )
    }

    /// Queues a directory by local path.
    ///
    /// Returns false if it is already queued or the worker has stopped.
    pub fn enqueue(&self, local_path: &str) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        if !self.queued.insert(local_path.to_string()) {
            return false;
        }
        if self.tx.send(local_path.to_string()).is_err() {
            self.queued.remove(local_path);
            return false;
        }
        debug!(local_path, "Queued directory refresh");
        true
    }

    pub fn is_queued(&self, local_path: &str) -> bool {
        self.queued.contains(local_path)
    }

    /// Number of directories waiting for the worker.
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// False once the cache has been torn down.
    pub fn is_alive(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stops the worker and rejects further requests.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.queued.clear();
    }
}

/// Receiving side of the refresh queue.
#[derive(Debug)]
pub struct RefreshReceiver {
    rx: mpsc::UnboundedReceiver<String>,
    queued: Arc<DashSet<String>>,
    shutdown: CancellationToken,
}

/// Drains the refresh queue for one cache.
pub struct RefreshWorker {
    receiver: RefreshReceiver,
    cache: Weak<MetadataCache>,
}

impl RefreshWorker {
    pub fn new(receiver: RefreshReceiver, cache: Weak<MetadataCache>) -> Self {
        Self { receiver, cache }
    }

    /// Runs until the cache is shut down or dropped.
    pub async fn run(mut self) {
        info!("Directory refresh worker started");

        loop {
            let local_path = tokio::select! {
                _ = self.receiver.shutdown.cancelled() => break,
                next = self.receiver.rx.recv() => match next {
                    Some(path) => path,
                    None => break,
                },
            };

            let Some(cache) = self.cache.upgrade() else {
                break;
            };
            if !cache.is_alive() {
                break;
            }

            match cache.refresh_directory(&local_path).await {
                Ok(()) => debug!(local_path = %local_path, "Directory refreshed"),
                Err(RemoteError::Unauthorized) => {
                    warn!(local_path = %local_path, "Refresh rejected by server, clearing cache");
                    cache.handle_unauthorized();
                }
                Err(e) => {
                    warn!(local_path = %local_path, error = %e, "Directory refresh failed");
                }
            }
            self.receiver.queued.remove(&local_path);
        }

        info!("Directory refresh worker stopped");
    }
}
