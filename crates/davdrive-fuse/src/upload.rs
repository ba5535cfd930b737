//! Streaming uploads.
//!
//! An [`UploadStream`] feeds write callbacks into one running
//! `upload`/`upload_partial` call through a bounded channel. Writers that
//! find the channel full are queued behind each other on the runtime, so
//! chunks always reach the server in the order the writes were issued.

use std::sync::Arc;

use davdrive_core::ports::{IRemoteRepository, RemoteError, UploadSource};
use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle};
use tracing::debug;

/// Why a chunk could not be handed to the upload task synchronously.
#[derive(Debug)]
pub enum PushError {
    /// The channel is full or earlier chunks are still queued; retry via
    /// [`UploadStream::push_deferred`].
    Busy(Vec<u8>),
    /// The upload task has ended; [`UploadStream::finish`] reports why.
    Closed,
}

/// An upload in progress for one file.
#[derive(Debug)]
pub struct UploadStream {
    tx: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<Result<bool, RemoteError>>,
    start: u64,
    offset: u64,
    tail: Option<JoinHandle<()>>,
}

impl UploadStream {
    /// Starts uploading `name` into `parent` beginning at `offset`.
    ///
    /// Offset zero replaces the whole file; any other offset uses the
    /// partial upload of the remote client.
    pub fn start(
        rt: &Handle,
        remote: Arc<dyn IRemoteRepository>,
        parent: String,
        name: String,
        offset: u64,
        capacity: usize,
    ) -> Self {
        let (tx, source) = UploadSource::channel(capacity);
        debug!(parent = %parent, name = %name, offset, "Starting upload stream");
        let task = rt.spawn(async move {
            if offset == 0 {
                remote.upload(&parent, &name, source).await
            } else {
                remote.upload_partial(&parent, &name, offset, source).await
            }
        });

        Self {
            tx,
            task,
            start: offset,
            offset,
            tail: None,
        }
    }

    /// File offset at which the stream started.
    pub fn start_offset(&self) -> u64 {
        self.start
    }

    /// File offset of the next byte the stream expects.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// True if a write at `offset` continues this stream.
    pub fn continues_at(&self, offset: u64) -> bool {
        self.offset == offset
    }

    /// Hands `chunk` to the upload task without waiting.
    pub fn try_push(&mut self, chunk: Vec<u8>) -> Result<(), PushError> {
        if self.tail.as_ref().is_some_and(|tail| !tail.is_finished()) {
            return Err(PushError::Busy(chunk));
        }
        let len = chunk.len() as u64;
        match self.tx.try_send(chunk) {
            Ok(()) => {
                self.offset += len;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(chunk)) => Err(PushError::Busy(chunk)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }

    /// Queues `chunk` behind every earlier deferred chunk.
    ///
    /// `on_sent` runs once the upload task accepted the chunk, or with an
    /// error if the task ended first.
    pub fn push_deferred<F>(&mut self, rt: &Handle, chunk: Vec<u8>, on_sent: F)
    where
        F: FnOnce(Result<(), RemoteError>) + Send + 'static,
    {
        self.offset += chunk.len() as u64;
        let previous = self.tail.take();
        let tx = self.tx.clone();
        self.tail = Some(rt.spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let result = tx
                .send(chunk)
                .await
                .map_err(|_| RemoteError::Other("upload stream closed".to_string()));
            on_sent(result);
        }));
    }

    /// Stops the upload without waiting; the server keeps whatever it got.
    pub fn abort(self) {
        if let Some(tail) = &self.tail {
            tail.abort();
        }
        self.task.abort();
    }

    /// Closes the stream and waits for the server's answer.
    pub async fn finish(self) -> Result<bool, RemoteError> {
        let UploadStream { tx, task, tail, .. } = self;
        if let Some(tail) = tail {
            let _ = tail.await;
        }
        drop(tx);
        match task.await {
            Ok(result) => result,
            Err(e) => Err(RemoteError::Other(format!("upload task failed: {}", e))),
        }
    }
}
