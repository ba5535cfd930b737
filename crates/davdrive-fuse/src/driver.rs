//! Filesystem driver core.
//!
//! [`DavDriver`] implements [`FileSystemCallbacks`] on top of the metadata
//! cache and the remote repository client. Each callback is a short
//! transaction against the cache that escalates to the server on a miss.
//!
//! ## Concurrency
//!
//! - Per-node state is guarded by the node's own lock. Cache structure is
//!   guarded by the cache lock, which is always taken first.
//! - No lock is held while waiting on the network. Metadata requests block
//!   the calling thread briefly; content downloads and deferred writes run
//!   on the runtime and complete through the [`HostResponder`].
//! - Flushes of one node are serialised by its flush lock.
//!
//! ## Unauthorized responses
//!
//! A 401 from the server clears the whole cache and raises the observer's
//! `authentication_failed`. Lookups, listings and reads then answer
//! not-found; mutating callbacks answer access-denied.

use std::{
    future::Future,
    sync::Arc,
    time::{Instant, SystemTime},
};

use davdrive_core::{
    config::{Config, FlushMode},
    domain::{local_name, local_parent, DomainError, PathTranslator, ServerDialect, LOCAL_ROOT},
    ports::{IActionObserver, IRemoteRepository, RemoteError, RepositoryAction, UploadSource},
};
use parking_lot::RwLock;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheLookup, CacheSettings, DirectoryEntry, MetadataCache},
    callbacks::{
        BasicInfo, CleanupFlags, Completion, CompletionToken, FileSystemCallbacks, HostResponder,
        OpenedNode, VolumeInfo, WriteOutcome, WriteRequest,
    },
    enumerator::DirectoryCursor,
    error::DriveError,
    node::{attributes, FileInfo, FileNode, NodeState, WriteState, DEFAULT_SECURITY_DESCRIPTOR},
    upload::{PushError, UploadStream},
};

/// Volume capacity in multiples of the largest file size.
const VOLUME_SIZE_FACTOR: u64 = 500_000;

/// Driver core for one mounted repository.
///
/// Cheap to clone; clones share the cache and the remote client.
#[derive(Clone)]
pub struct DavDriver {
    config: Arc<Config>,
    translator: PathTranslator,
    remote: Arc<dyn IRemoteRepository>,
    observer: Arc<dyn IActionObserver>,
    responder: Arc<dyn HostResponder>,
    cache: Arc<MetadataCache>,
    rt: Handle,
    volume_label: Arc<RwLock<String>>,
}

impl DavDriver {
    /// Creates the driver and its metadata cache.
    ///
    /// Fails if the repository URL does not parse.
    pub fn new(
        config: Config,
        remote: Arc<dyn IRemoteRepository>,
        observer: Arc<dyn IActionObserver>,
        responder: Arc<dyn HostResponder>,
        rt: Handle,
    ) -> Result<Self, DomainError> {
        let translator = config.repository.path_translator()?;
        let cache = MetadataCache::new(
            CacheSettings::from_config(&config),
            translator.clone(),
            Arc::clone(&remote),
            Arc::clone(&observer),
            &rt,
        );
        let volume_label = Arc::new(RwLock::new(config.fuse.volume_label.clone()));

        info!(
            repository = %translator.repository_root(),
            dialect = %config.repository.dialect,
            flush_mode = ?config.transfer.flush_mode,
            "DavDrive driver created"
        );

        Ok(Self {
            config: Arc::new(config),
            translator,
            remote,
            observer,
            responder,
            cache,
            rt,
            volume_label,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.translator
    }

    pub fn rt_handle(&self) -> &Handle {
        &self.rt
    }

    fn dialect(&self) -> ServerDialect {
        self.config.repository.dialect
    }

    fn flush_mode(&self) -> FlushMode {
        self.config.transfer.flush_mode
    }

    /// Checks that the repository root can be listed with the configured credentials.
    pub fn verify_connection(&self) -> Result<(), DriveError> {
        let root = self.translator.repository_root();
        match self.block_on(self.remote.list(&root)) {
            Ok(items) => {
                info!(repository = %root, entries = items.len(), "Repository reachable");
                Ok(())
            }
            Err(RemoteError::Unauthorized) => {
                self.auth_failed();
                Err(DriveError::AccessDenied("invalid credentials".to_string()))
            }
            Err(RemoteError::NetworkUnreachable(message)) => {
                Err(DriveError::NetworkUnreachable(message))
            }
            Err(e) => Err(DriveError::UnexpectedIoError(e.to_string())),
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Runs `future` to completion from a synchronous callback.
    fn block_on<F: Future>(&self, future: F) -> F::Output {
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.rt.block_on(future))
            }
            _ => self.rt.block_on(future),
        }
    }

    fn emit(&self, action: RepositoryAction) {
        self.observer.action_performed(action);
    }

    fn emit_failure(&self, node: Option<&FileNode>, method: &str, path: &str, error: &dyn ToString) {
        let object_id = node.map(FileNode::object_id).unwrap_or(0);
        self.emit(RepositoryAction::failed(
            object_id,
            method,
            path,
            error.to_string(),
        ));
    }

    fn auth_failed(&self) {
        warn!("Server rejected credentials, clearing metadata cache");
        self.cache.handle_unauthorized();
    }

    /// Maps a failed mutating request.
    fn mutation_failure(&self, error: RemoteError, path: &str) -> DriveError {
        match error {
            RemoteError::Unauthorized => {
                self.auth_failed();
                DriveError::AccessDenied(path.to_string())
            }
            RemoteError::NetworkUnreachable(message) => DriveError::NetworkUnreachable(message),
            RemoteError::NotFound(_) => DriveError::NotFound(path.to_string()),
            RemoteError::Conflict(_) => DriveError::AccessDenied(path.to_string()),
            other => DriveError::CannotMake(other.to_string()),
        }
    }

    fn repository_parent(&self, local_path: &str) -> String {
        self.translator
            .local_to_repository(local_parent(local_path).unwrap_or(LOCAL_ROOT))
    }

    /// Existence check that bypasses the cache.
    fn remote_exists(&self, path: &str) -> Result<bool, RemoteError> {
        let repository_path = self.translator.local_to_repository(path);
        match self.block_on(self.remote.get_item(&repository_path)) {
            Ok(_) => Ok(true),
            Err(RemoteError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Target check for create and rename: `Some(is_directory)` if it exists.
    fn target_kind(&self, path: &str) -> Result<Option<bool>, RemoteError> {
        match self.cache.lookup(path) {
            CacheLookup::Found(node) => return Ok(Some(node.is_directory())),
            CacheLookup::Missing => return Ok(None),
            CacheLookup::Unknown => {}
        }
        let repository_path = self.translator.local_to_repository(path);
        match self.block_on(self.remote.get_item(&repository_path)) {
            Ok(item) => Ok(Some(item.is_directory(self.dialect()))),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// A 409 after a successful existence check is either a lost race or
    /// a permission problem; ask the server which.
    fn conflict_failure(&self, path: &str) -> DriveError {
        match self.remote_exists(path) {
            Ok(true) => DriveError::NameCollision(path.to_string()),
            _ => DriveError::AccessDenied(path.to_string()),
        }
    }

    /// Resolves a local path to a node, asking the server on a cache miss.
    fn resolve_node(&self, path: &str) -> Result<Arc<FileNode>, DriveError> {
        if path != LOCAL_ROOT && self.config.cache.is_ignored(local_name(path)) {
            return Err(DriveError::NotFound(path.to_string()));
        }

        match self.cache.lookup(path) {
            CacheLookup::Found(node) => return Ok(node),
            CacheLookup::Missing => return Err(DriveError::NotFound(path.to_string())),
            CacheLookup::Unknown => {}
        }

        let repository_path = self.translator.local_to_repository(path);
        match self.block_on(self.remote.get_item(&repository_path)) {
            Ok(item) => {
                let node = FileNode::from_remote(&item, &self.translator, self.dialect())
                    .ok_or_else(|| DriveError::NotFound(path.to_string()))?;
                let node = Arc::new(node);
                self.cache.insert(Arc::clone(&node));
                debug!(path, object_id = node.object_id(), "Resolved remote item");
                Ok(node)
            }
            Err(RemoteError::NotFound(_)) => {
                self.cache.mark_missing(path);
                Err(DriveError::NotFound(path.to_string()))
            }
            Err(RemoteError::Unauthorized) => {
                self.auth_failed();
                self.emit_failure(None, "Resolve", path, &RemoteError::Unauthorized);
                Err(DriveError::NotFound(path.to_string()))
            }
            Err(RemoteError::NetworkUnreachable(message)) => {
                self.emit_failure(None, "Resolve", path, &message);
                Err(DriveError::NetworkUnreachable(message))
            }
            Err(e) => {
                warn!(path, error = %e, "Lookup failed, treating as missing");
                self.cache.mark_missing(path);
                self.emit_failure(None, "Resolve", path, &e);
                Err(DriveError::NotFound(path.to_string()))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Content
    // ------------------------------------------------------------------------

    /// Downloads the content of a file whose buffer is not loaded.
    async fn load_content(&self, node: &FileNode) -> Result<(), DriveError> {
        let repository_path = {
            let state = node.lock();
            if state.content_loaded() {
                return Ok(());
            }
            state.repository_path.clone()
        };

        let content = self
            .remote
            .download(&repository_path)
            .await
            .map_err(|e| self.transfer_failure(node, "Download", e))?;

        let mut state = node.lock();
        if state.buffer.is_none() {
            let mut buffer = content;
            buffer.resize(state.info.file_size as usize, 0);
            state.buffer = Some(buffer);
        }
        Ok(())
    }

    /// Reports a failed content transfer and invalidates the node.
    fn transfer_failure(&self, node: &FileNode, method: &str, error: RemoteError) -> DriveError {
        let path = node.local_path();
        if error.is_unauthorized() {
            self.auth_failed();
        }
        self.emit_failure(Some(node), method, &path, &error);
        self.invalidate_node(node);
        match error {
            RemoteError::NetworkUnreachable(message) => DriveError::NetworkUnreachable(message),
            RemoteError::Conflict(_) => DriveError::AccessDenied(path),
            other => DriveError::UnexpectedIoError(other.to_string()),
        }
    }

    fn invalidate_node(&self, node: &FileNode) {
        if let CacheLookup::Found(cached) = self.cache.lookup(&node.local_path()) {
            if std::ptr::eq(Arc::as_ptr(&cached), node) {
                self.cache.invalidate(&cached);
            }
        }
    }

    fn read_failure(&self, node: &FileNode, error: RemoteError) -> DriveError {
        let path = node.local_path();
        match error {
            RemoteError::RangeNotSatisfiable => DriveError::EndOfFile,
            RemoteError::Unauthorized => {
                self.auth_failed();
                self.emit_failure(Some(node), "Read", &path, &RemoteError::Unauthorized);
                DriveError::NotFound(path)
            }
            RemoteError::NotFound(_) => {
                self.invalidate_node(node);
                DriveError::NotFound(path)
            }
            RemoteError::NetworkUnreachable(message) => {
                self.emit_failure(Some(node), "Read", &path, &message);
                DriveError::NetworkUnreachable(message)
            }
            other => {
                self.emit_failure(Some(node), "Read", &path, &other);
                DriveError::UnexpectedIoError(other.to_string())
            }
        }
    }

    /// Queues a write behind the node's earlier deferred writes.
    ///
    /// The content is downloaded first if it is not loaded yet.
    fn defer_write(
        &self,
        node: &Arc<FileNode>,
        state: &mut NodeState,
        request: WriteRequest<'_>,
        token: CompletionToken,
    ) -> Completion<WriteOutcome> {
        let write = OwnedWrite::from(request);
        let previous = state.pending_io.take();
        // Listed as unflushed from now on, so refreshes leave the node alone
        state.mark_dirty();

        let driver = self.clone();
        let node = Arc::clone(node);
        state.pending_io = Some(self.rt.spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let result = match driver.load_content(&node).await {
                Ok(()) => {
                    let mut state = node.lock();
                    apply_buffered_write(&mut state, write.as_request(), &driver.config)
                }
                Err(e) => Err(e),
            };
            driver.responder.complete_write(token, result);
        }));

        debug!(token = token.0, "Write deferred until content is loaded");
        Completion::Pending(token)
    }

    fn write_buffered(
        &self,
        node: &Arc<FileNode>,
        request: WriteRequest<'_>,
        token: CompletionToken,
    ) -> Result<Completion<WriteOutcome>, DriveError> {
        let mut state = node.lock();
        if state.is_deleted() {
            return Err(DriveError::UnexpectedIoError(format!(
                "{} was deleted",
                state.local_path
            )));
        }
        if state.is_directory() {
            return Err(DriveError::AccessDenied(state.local_path.clone()));
        }

        if state.has_pending_io() || !state.content_loaded() {
            return Ok(self.defer_write(node, &mut state, request, token));
        }
        apply_buffered_write(&mut state, request, &self.config).map(Completion::Ready)
    }

    /// Reports a failed upload stream write.
    fn stream_failure(&self, node: &FileNode, error: RemoteError) -> DriveError {
        self.transfer_failure(node, "Write Flush", error)
    }

    fn write_streamed(
        &self,
        node: &Arc<FileNode>,
        request: WriteRequest<'_>,
        token: CompletionToken,
    ) -> Result<Completion<WriteOutcome>, DriveError> {
        let transfer = &self.config.transfer;
        let mut state = node.lock();
        if state.is_deleted() {
            return Err(DriveError::UnexpectedIoError(format!(
                "{} was deleted",
                state.local_path
            )));
        }
        if state.is_directory() {
            return Err(DriveError::AccessDenied(state.local_path.clone()));
        }

        let Some((offset, length)) = write_range(&state, &request) else {
            return Ok(Completion::Ready(WriteOutcome {
                bytes_written: 0,
                info: state.info,
            }));
        };
        let end = offset + length;
        if end > state.info.file_size {
            state.set_file_size(end, false, false, transfer)?;
        }

        let chunk = request.data[..length as usize].to_vec();
        // Only a write of the whole file leaves a usable buffer behind
        state.buffer = (offset == 0 && end == state.info.file_size).then(|| chunk.clone());
        stamp_write(&mut state);

        let restart = !state
            .upload
            .as_ref()
            .is_some_and(|upload| upload.continues_at(offset));
        if restart {
            if let Some(previous) = state.upload.take() {
                drop(state);
                self.settle_upload(node, previous, "Write Flush")?;
                state = node.lock();
            }
            let name = state.name.clone();
            let parent = self.repository_parent(&state.local_path);
            state.upload = Some(UploadStream::start(
                &self.rt,
                Arc::clone(&self.remote),
                parent,
                name,
                offset,
                transfer.upload_channel_capacity,
            ));
        }

        let info = state.info;
        let bytes_written = length as u32;
        let Some(upload) = state.upload.as_mut() else {
            return Err(DriveError::UnexpectedIoError("upload stream missing".to_string()));
        };
        match upload.try_push(chunk) {
            Ok(()) => Ok(Completion::Ready(WriteOutcome {
                bytes_written,
                info,
            })),
            Err(PushError::Busy(chunk)) => {
                let driver = self.clone();
                let task_node = Arc::clone(node);
                upload.push_deferred(&self.rt, chunk, move |sent| {
                    let result = match sent {
                        Ok(()) => Ok(WriteOutcome {
                            bytes_written,
                            info,
                        }),
                        Err(e) => Err(driver.stream_failure(&task_node, e)),
                    };
                    driver.responder.complete_write(token, result);
                });
                Ok(Completion::Pending(token))
            }
            Err(PushError::Closed) => {
                let upload = state.upload.take();
                drop(state);
                let error = match upload.map(|upload| self.block_on(upload.finish())) {
                    Some(Err(e)) => e,
                    _ => RemoteError::Other("upload ended early".to_string()),
                };
                Err(self.stream_failure(node, error))
            }
        }
    }

    /// Waits for an upload stream and reports its outcome.
    fn settle_upload(
        &self,
        node: &FileNode,
        upload: UploadStream,
        method: &str,
    ) -> Result<(), DriveError> {
        let path = node.local_path();
        let error = match self.block_on(upload.finish()) {
            Ok(true) => {
                self.emit(RepositoryAction::success(node.object_id(), method, &path));
                return Ok(());
            }
            Ok(false) => RemoteError::Other("server refused the upload".to_string()),
            Err(e) => e,
        };

        if error.is_unauthorized() {
            self.auth_failed();
        }
        let copy = {
            let mut state = node.lock();
            let copy = state.generate_local_copy(&self.config.transfer.recovery_dir());
            if copy.is_some() {
                state.write_state = WriteState::FailedWithBackup;
            }
            copy
        };
        self.invalidate_node(node);
        self.emit(
            RepositoryAction::failed(node.object_id(), method, &path, error.to_string())
                .with_temporary_path(copy),
        );
        Err(DriveError::UnexpectedIoError(error.to_string()))
    }

    /// Finishes the node's upload stream, if any.
    fn finish_upload(&self, node: &FileNode, method: &str) -> Result<(), DriveError> {
        let upload = node.lock().upload.take();
        match upload {
            Some(upload) => self.settle_upload(node, upload, method),
            None => Ok(()),
        }
    }

    /// Uploads the buffer of a dirty node.
    ///
    /// The upload reflects the buffer at the moment of the call. Failed
    /// attempts are retried; once retries are exhausted the buffer is saved
    /// to a recovery copy and the node is invalidated.
    fn flush_buffer(&self, node: &Arc<FileNode>, method: &str) -> Result<(), DriveError> {
        let _flush = node.flush_guard();

        let pending = node.lock().pending_io.take();
        if let Some(pending) = pending {
            let _ = self.block_on(pending);
        }

        let (snapshot, generation, parent, name, path) = {
            let mut state = node.lock();
            // A failed save waits for the next write before uploading again
            if state.is_deleted()
                || state.is_directory()
                || state.write_state != WriteState::Dirty
            {
                return Ok(());
            }
            let size = state.info.file_size as usize;
            let snapshot = match &state.buffer {
                Some(buffer) => buffer[..size.min(buffer.len())].to_vec(),
                None if size == 0 => Vec::new(),
                None => {
                    warn!(path = %state.local_path, "Dirty node without content, nothing to flush");
                    state.write_state = WriteState::Clean;
                    return Ok(());
                }
            };
            state.write_state = WriteState::Flushing;
            (
                snapshot,
                state.write_generation,
                self.repository_parent(&state.local_path),
                state.name.clone(),
                state.local_path.clone(),
            )
        };

        let transfer = &self.config.transfer;
        let attempts = transfer.flush_retries.saturating_add(1);
        let mut failure = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = transfer.flush_retry_delay();
                self.block_on(async move { tokio::time::sleep(delay).await });
            }
            let source = UploadSource::from_bytes(snapshot.clone());
            match self.block_on(self.remote.upload(&parent, &name, source)) {
                Ok(true) => {
                    failure = None;
                    break;
                }
                Ok(false) => {
                    failure = Some(RemoteError::Other("server refused the upload".to_string()))
                }
                Err(RemoteError::Unauthorized) => {
                    failure = Some(RemoteError::Unauthorized);
                    break;
                }
                Err(e) => failure = Some(e),
            }
            warn!(path = %path, attempt, attempts, "Flush attempt failed");
        }

        let Some(error) = failure else {
            {
                let mut state = node.lock();
                if state.write_state == WriteState::Flushing {
                    state.write_state = if state.write_generation == generation {
                        WriteState::Clean
                    } else {
                        WriteState::Dirty
                    };
                }
                state.local_copy = None;
            }
            debug!(path = %path, bytes = snapshot.len(), "Flushed buffer");
            self.emit(RepositoryAction::success(node.object_id(), method, &path));
            return Ok(());
        };

        if error.is_unauthorized() {
            self.auth_failed();
        }
        let copy = {
            let mut state = node.lock();
            let copy = state.generate_local_copy(&transfer.recovery_dir());
            if state.write_state == WriteState::Flushing {
                state.write_state = if copy.is_some() {
                    WriteState::FailedWithBackup
                } else {
                    WriteState::Dirty
                };
            }
            copy
        };
        self.cache.invalidate(node);
        warn!(path = %path, error = %error, recovery_copy = ?copy, "Flush failed");
        self.emit(
            RepositoryAction::failed(node.object_id(), method, &path, error.to_string())
                .with_temporary_path(copy),
        );
        Err(DriveError::UnexpectedIoError(error.to_string()))
    }

    /// Deletes the node remotely and forgets it.
    fn delete_node(&self, node: &Arc<FileNode>) {
        let (path, repository_path) = {
            let state = node.lock();
            (state.local_path.clone(), state.repository_path.clone())
        };
        let result = if node.is_directory() {
            self.block_on(self.remote.delete_directory(&repository_path))
        } else {
            self.block_on(self.remote.delete_file(&repository_path))
        };

        match result {
            Ok(()) | Err(RemoteError::NotFound(_)) => {
                let upload = {
                    let mut state = node.lock();
                    state.write_state = WriteState::Deleted;
                    state.buffer = None;
                    state.upload.take()
                };
                if let Some(upload) = upload {
                    upload.abort();
                }
                self.cache.remove(node);
                info!(path = %path, "Deleted");
                self.emit(RepositoryAction::success(node.object_id(), "Delete", &path));
            }
            Err(e) => {
                if e.is_unauthorized() {
                    self.auth_failed();
                }
                warn!(path = %path, error = %e, "Delete failed");
                self.emit_failure(Some(node), "Delete", &path, &e);
            }
        }
    }

    fn check_live(&self, node: &FileNode) -> Result<(), DriveError> {
        if node.is_deleted() {
            return Err(DriveError::NotFound(node.local_path()));
        }
        Ok(())
    }
}

// ============================================================================
// Buffered writes
// ============================================================================

/// Owned copy of a [`WriteRequest`] for deferred execution.
struct OwnedWrite {
    offset: u64,
    data: Vec<u8>,
    write_to_end_of_file: bool,
    constrained_io: bool,
}

impl From<WriteRequest<'_>> for OwnedWrite {
    fn from(request: WriteRequest<'_>) -> Self {
        Self {
            offset: request.offset,
            data: request.data.to_vec(),
            write_to_end_of_file: request.write_to_end_of_file,
            constrained_io: request.constrained_io,
        }
    }
}

impl OwnedWrite {
    fn as_request(&self) -> WriteRequest<'_> {
        WriteRequest {
            offset: self.offset,
            data: &self.data,
            write_to_end_of_file: self.write_to_end_of_file,
            constrained_io: self.constrained_io,
        }
    }
}

/// Effective `(offset, length)` of a write, or `None` if nothing is written.
fn write_range(state: &NodeState, request: &WriteRequest<'_>) -> Option<(u64, u64)> {
    let size = state.info.file_size;
    let length = request.data.len() as u64;
    if request.constrained_io {
        if request.offset >= size {
            return None;
        }
        return Some((request.offset, length.min(size - request.offset)));
    }
    let offset = if request.write_to_end_of_file {
        size
    } else {
        request.offset
    };
    Some((offset, length))
}

fn stamp_write(state: &mut NodeState) {
    let now = SystemTime::now();
    state.info.last_access_time = now;
    state.info.last_write_time = now;
    state.info.change_time = now;
    state.info.attributes = (state.info.attributes & !attributes::NORMAL) | attributes::ARCHIVE;
}

/// Copies a write into the node's buffer, growing the file if needed.
fn apply_buffered_write(
    state: &mut NodeState,
    request: WriteRequest<'_>,
    config: &Config,
) -> Result<WriteOutcome, DriveError> {
    if state.is_deleted() {
        return Err(DriveError::UnexpectedIoError(format!(
            "{} was deleted",
            state.local_path
        )));
    }
    let Some((offset, length)) = write_range(state, &request) else {
        return Ok(WriteOutcome {
            bytes_written: 0,
            info: state.info,
        });
    };

    let end = offset + length;
    if end > state.info.file_size {
        state.set_file_size(end, false, true, &config.transfer)?;
    }

    let buffer = state.buffer.get_or_insert_with(Vec::new);
    if buffer.len() < end as usize {
        buffer.resize(end as usize, 0);
    }
    buffer[offset as usize..end as usize].copy_from_slice(&request.data[..length as usize]);

    stamp_write(state);
    state.mark_dirty();
    Ok(WriteOutcome {
        bytes_written: length as u32,
        info: state.info,
    })
}

// ============================================================================
// FileSystemCallbacks
// ============================================================================

impl FileSystemCallbacks for DavDriver {
    fn volume_info(&self) -> VolumeInfo {
        let size = VOLUME_SIZE_FACTOR.saturating_mul(self.config.transfer.max_file_size);
        VolumeInfo {
            total_size: size,
            free_size: size,
            volume_label: self.volume_label.read().clone(),
        }
    }

    fn set_volume_label(&self, label: &str) -> VolumeInfo {
        *self.volume_label.write() = label.to_string();
        self.volume_info()
    }

    fn resolve(&self, path: &str) -> Result<Arc<FileNode>, DriveError> {
        self.resolve_node(path)
    }

    fn open(&self, path: &str) -> Result<OpenedNode, DriveError> {
        let node = self.resolve_node(path)?;
        let info = {
            let mut state = node.lock();
            if state.is_deleted() {
                return Err(DriveError::NotFound(path.to_string()));
            }
            state.open_count += 1;
            state.info
        };
        debug!(path, open_count = node.open_count(), "Opened");
        Ok(OpenedNode { node, info })
    }

    fn create(
        &self,
        path: &str,
        is_directory: bool,
        allocation_size: u64,
    ) -> Result<OpenedNode, DriveError> {
        let Some(parent) = local_parent(path) else {
            return Err(DriveError::NameCollision(path.to_string()));
        };
        let name = local_name(path);

        match self.target_kind(path) {
            Ok(Some(_)) => return Err(DriveError::NameCollision(path.to_string())),
            Ok(None) => {}
            Err(RemoteError::Unauthorized) => {
                self.auth_failed();
                return Err(DriveError::AccessDenied(path.to_string()));
            }
            Err(RemoteError::NetworkUnreachable(message)) => {
                return Err(DriveError::NetworkUnreachable(message))
            }
            Err(e) => return Err(DriveError::CannotMake(e.to_string())),
        }

        let repository_path = self.translator.local_to_repository(path);
        let node = Arc::new(FileNode::new_local(path, &repository_path, is_directory));

        if is_directory {
            let parent_path = self.translator.local_to_repository(parent);
            let failure = match self.block_on(self.remote.create_directory(&parent_path, name)) {
                Ok(true) => None,
                Ok(false) => Some((
                    DriveError::CannotMake(path.to_string()),
                    "server refused".to_string(),
                )),
                Err(RemoteError::Conflict(message)) => {
                    Some((self.conflict_failure(path), message))
                }
                Err(e) => {
                    let message = e.to_string();
                    Some((self.mutation_failure(e, path), message))
                }
            };
            if let Some((error, message)) = failure {
                self.emit_failure(Some(&node), "Create", path, &message);
                return Err(error);
            }
            let mut state = node.lock();
            state.is_parsed = true;
            state.last_refresh = Some(Instant::now());
        } else {
            let transfer = &self.config.transfer;
            let mut state = node.lock();
            match self.flush_mode() {
                FlushMode::AtClose => {
                    state.buffer = Some(Vec::new());
                    if allocation_size > 0 {
                        state.set_file_size(allocation_size, true, true, transfer)?;
                    }
                    state.mark_dirty();
                }
                FlushMode::AtWrite => {
                    if allocation_size > 0 {
                        state.set_file_size(allocation_size, true, false, transfer)?;
                    }
                    state.upload = Some(UploadStream::start(
                        &self.rt,
                        Arc::clone(&self.remote),
                        self.translator.local_to_repository(parent),
                        name.to_string(),
                        0,
                        transfer.upload_channel_capacity,
                    ));
                }
            }
        }

        let info = {
            let mut state = node.lock();
            state.open_count = 1;
            state.info
        };
        self.cache.insert(Arc::clone(&node));
        info!(path, is_directory, "Created");
        self.emit(RepositoryAction::success(node.object_id(), "Create", path));
        Ok(OpenedNode { node, info })
    }

    fn overwrite(
        &self,
        node: &Arc<FileNode>,
        allocation_size: u64,
    ) -> Result<FileInfo, DriveError> {
        self.check_live(node)?;
        let transfer = &self.config.transfer;

        if self.flush_mode() == FlushMode::AtWrite {
            let previous = node.lock().upload.take();
            if let Some(previous) = previous {
                self.settle_upload(node, previous, "Overwrite")?;
            }
        }

        let mut state = node.lock();
        let keep_buffer = self.flush_mode() == FlushMode::AtClose;
        state.set_file_size(allocation_size, true, keep_buffer, transfer)?;
        state.set_file_size(0, false, keep_buffer, transfer)?;
        state.touch();
        state.info.attributes = (state.info.attributes & !attributes::NORMAL) | attributes::ARCHIVE;

        match self.flush_mode() {
            FlushMode::AtClose => {
                state.buffer.get_or_insert_with(Vec::new).clear();
                state.mark_dirty();
            }
            FlushMode::AtWrite => {
                state.buffer = None;
                let parent = self.repository_parent(&state.local_path);
                state.upload = Some(UploadStream::start(
                    &self.rt,
                    Arc::clone(&self.remote),
                    parent,
                    state.name.clone(),
                    0,
                    transfer.upload_channel_capacity,
                ));
            }
        }
        debug!(path = %state.local_path, allocation_size, "Overwritten");
        Ok(state.info)
    }

    fn get_file_info(&self, node: &Arc<FileNode>) -> Result<FileInfo, DriveError> {
        Ok(node.info())
    }

    fn get_security(&self, _node: &Arc<FileNode>) -> Result<String, DriveError> {
        Ok(DEFAULT_SECURITY_DESCRIPTOR.to_string())
    }

    fn read_directory_entry(
        &self,
        dir: &Arc<FileNode>,
        marker: Option<&str>,
        cursor: &mut Option<DirectoryCursor>,
    ) -> Result<Option<DirectoryEntry>, DriveError> {
        if let Some(cursor) = cursor.as_mut() {
            return Ok(cursor.next_entry());
        }

        let path = dir.local_path();
        if !dir.is_directory() {
            return Err(DriveError::NotFound(path));
        }

        let entries = match self.block_on(self.cache.directory_listing(dir, marker)) {
            Ok(entries) => entries,
            Err(RemoteError::Unauthorized) => {
                self.auth_failed();
                self.emit_failure(Some(dir), "ReadDirectory", &path, &RemoteError::Unauthorized);
                return Err(DriveError::NotFound(path));
            }
            Err(RemoteError::NotFound(_)) => {
                self.cache.invalidate(dir);
                return Err(DriveError::NotFound(path));
            }
            Err(RemoteError::NetworkUnreachable(message)) => {
                self.emit_failure(Some(dir), "ReadDirectory", &path, &message);
                return Err(DriveError::NetworkUnreachable(message));
            }
            Err(e) => {
                self.emit_failure(Some(dir), "ReadDirectory", &path, &e);
                return Err(DriveError::UnexpectedIoError(e.to_string()));
            }
        };

        let mut scan = DirectoryCursor::new(entries);
        debug!(
            path = %path,
            operation_id = %scan.operation_id(),
            entries = scan.len(),
            "Directory scan started"
        );
        let first = scan.next_entry();
        *cursor = Some(scan);
        Ok(first)
    }

    fn read(
        &self,
        node: &Arc<FileNode>,
        offset: u64,
        length: u32,
        token: CompletionToken,
    ) -> Result<Completion<Vec<u8>>, DriveError> {
        let (repository_path, size) = {
            let state = node.lock();
            if state.is_directory() {
                return Err(DriveError::AccessDenied(state.local_path.clone()));
            }
            if state.pending_upload(offset) {
                return Err(DriveError::EndOfFile);
            }
            let size = state.info.file_size;
            if offset >= size {
                return Err(DriveError::EndOfFile);
            }
            let end = offset.saturating_add(u64::from(length)).min(size);
            if let Some(buffer) = &state.buffer {
                let data = buffer
                    .get(offset as usize..end as usize)
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default();
                return Ok(Completion::Ready(data));
            }
            if length == 0 {
                return Ok(Completion::Ready(Vec::new()));
            }
            (state.repository_path.clone(), size)
        };

        let end = offset.saturating_add(u64::from(length)).min(size) - 1;
        let whole_file = offset == 0 && end + 1 == size;
        let driver = self.clone();
        let node = Arc::clone(node);
        self.rt.spawn(async move {
            let result = match driver
                .remote
                .download_partial(&repository_path, offset, end)
                .await
            {
                Ok(data) => {
                    if whole_file && data.len() as u64 == size {
                        let mut state = node.lock();
                        if state.buffer.is_none()
                            && !state.has_unflushed_data()
                            && state.info.file_size == size
                        {
                            state.buffer = Some(data.clone());
                        }
                    }
                    Ok(data)
                }
                Err(e) => Err(driver.read_failure(&node, e)),
            };
            driver.responder.complete_read(token, result);
        });

        Ok(Completion::Pending(token))
    }

    fn write(
        &self,
        node: &Arc<FileNode>,
        request: WriteRequest<'_>,
        token: CompletionToken,
    ) -> Result<Completion<WriteOutcome>, DriveError> {
        match self.flush_mode() {
            FlushMode::AtClose => self.write_buffered(node, request, token),
            FlushMode::AtWrite => self.write_streamed(node, request, token),
        }
    }

    fn flush(&self, node: &Arc<FileNode>) -> Result<FileInfo, DriveError> {
        Ok(node.info())
    }

    fn set_basic_info(
        &self,
        node: &Arc<FileNode>,
        info: BasicInfo,
    ) -> Result<FileInfo, DriveError> {
        let mut state = node.lock();
        if state.is_deleted() {
            return Err(DriveError::NotFound(state.local_path.clone()));
        }
        if info.attributes != u32::MAX {
            let directory = state.info.attributes & attributes::DIRECTORY;
            state.info.attributes = (info.attributes & !attributes::DIRECTORY) | directory;
        }
        if let Some(time) = info.creation_time {
            state.info.creation_time = time;
        }
        if let Some(time) = info.last_access_time {
            state.info.last_access_time = time;
        }
        if let Some(time) = info.last_write_time {
            state.info.last_write_time = time;
        }
        if let Some(time) = info.change_time {
            state.info.change_time = time;
        }
        Ok(state.info)
    }

    fn set_file_size(
        &self,
        node: &Arc<FileNode>,
        new_size: u64,
        set_allocation_size: bool,
    ) -> Result<FileInfo, DriveError> {
        self.check_live(node)?;
        let buffered = self.flush_mode() == FlushMode::AtClose;

        if buffered && !node.is_directory() {
            let pending = node.lock().pending_io.take();
            if let Some(pending) = pending {
                let _ = self.block_on(pending);
            }
            // Truncation to zero and allocation changes past the end keep no content
            let current = node.info().file_size;
            let needs_content = new_size != 0 && !(set_allocation_size && new_size >= current);
            if needs_content {
                self.block_on(self.load_content(node))?;
            }
        }

        let mut state = node.lock();
        let before = state.info.file_size;
        if buffered && new_size == 0 && !state.is_directory() && state.buffer.is_none() {
            state.buffer = Some(Vec::new());
        }
        let keep_buffer = state.buffer.is_some();
        state.set_file_size(
            new_size,
            set_allocation_size,
            keep_buffer,
            &self.config.transfer,
        )?;
        if buffered && state.info.file_size != before {
            stamp_write(&mut state);
            state.mark_dirty();
        }
        Ok(state.info)
    }

    fn can_delete(&self, node: &Arc<FileNode>) -> Result<(), DriveError> {
        self.check_live(node)
    }

    fn rename(
        &self,
        node: &Arc<FileNode>,
        old_path: &str,
        new_path: &str,
        replace_if_exists: bool,
    ) -> Result<(), DriveError> {
        if old_path == new_path {
            return Ok(());
        }
        self.check_live(node)?;

        match self.target_kind(new_path) {
            Ok(None) => {}
            Ok(Some(target_is_directory)) => {
                if !replace_if_exists || target_is_directory {
                    return Err(DriveError::NameCollision(new_path.to_string()));
                }
                if self.dialect().emulates_replace() {
                    let target = self.translator.local_to_repository(new_path);
                    match self.block_on(self.remote.delete_file(&target)) {
                        Ok(()) | Err(RemoteError::NotFound(_)) => {}
                        Err(e) => {
                            self.emit_failure(Some(node), "Rename", new_path, &e);
                            return Err(self.mutation_failure(e, new_path));
                        }
                    }
                }
            }
            Err(RemoteError::Unauthorized) => {
                self.auth_failed();
                return Err(DriveError::AccessDenied(new_path.to_string()));
            }
            Err(RemoteError::NetworkUnreachable(message)) => {
                return Err(DriveError::NetworkUnreachable(message))
            }
            Err(e) => return Err(DriveError::CannotMake(e.to_string())),
        }

        // The server must hold the content before it can move it
        if self.flush_mode() == FlushMode::AtClose {
            if node.has_unflushed_data() {
                self.flush_buffer(node, "Rename")?;
            }
        } else {
            self.finish_upload(node, "Rename")?;
        }

        let source = self.translator.local_to_repository(old_path);
        let destination = self.translator.local_to_repository(new_path);
        let failure = match self.block_on(self.remote.move_item(&source, &destination)) {
            Ok(true) => None,
            Ok(false) => Some((
                DriveError::AccessDenied(new_path.to_string()),
                "server refused".to_string(),
            )),
            Err(RemoteError::Conflict(message)) => Some((self.conflict_failure(new_path), message)),
            Err(RemoteError::NotFound(message)) => {
                self.cache.invalidate(node);
                Some((DriveError::NotFound(old_path.to_string()), message))
            }
            Err(RemoteError::Unauthorized) => {
                self.auth_failed();
                Some((
                    DriveError::AccessDenied(new_path.to_string()),
                    RemoteError::Unauthorized.to_string(),
                ))
            }
            Err(RemoteError::NetworkUnreachable(message)) => Some((
                DriveError::NetworkUnreachable(message.clone()),
                message,
            )),
            Err(e) => Some((DriveError::AccessDenied(new_path.to_string()), e.to_string())),
        };
        if let Some((error, message)) = failure {
            warn!(from = old_path, to = new_path, error = %message, "Rename failed");
            self.emit_failure(Some(node), "Rename", old_path, &message);
            return Err(error);
        }

        self.cache.rename_node(node, new_path);
        info!(from = old_path, to = new_path, "Renamed");
        self.emit(RepositoryAction::success(node.object_id(), "Rename", new_path));
        Ok(())
    }

    fn cleanup(&self, node: &Arc<FileNode>, flags: CleanupFlags) {
        let path = node.local_path();
        if path == LOCAL_ROOT || node.is_deleted() {
            return;
        }

        if flags.set_allocation_size && !node.is_directory() {
            let mut state = node.lock();
            let transfer = &self.config.transfer;
            let allocation = transfer
                .round_to_allocation(state.info.file_size)
                .min(transfer.max_file_size);
            let keep_buffer = state.buffer.is_some();
            if let Err(e) =
                state.set_file_size(allocation, true, keep_buffer, &self.config.transfer)
            {
                debug!(path = %path, error = %e, "Could not adjust allocation");
            }
        }

        if flags.delete {
            self.delete_node(node);
            return;
        }

        if self.flush_mode() == FlushMode::AtClose && node.has_unflushed_data() {
            if let Err(e) = self.flush_buffer(node, "Cleanup") {
                debug!(path = %path, error = %e, "Flush at cleanup failed");
            }
        }
        if let Err(e) = self.finish_upload(node, "Cleanup") {
            debug!(path = %path, error = %e, "Upload at cleanup failed");
        }
    }

    fn close(&self, node: &Arc<FileNode>) {
        if !node.is_deleted() {
            if self.flush_mode() == FlushMode::AtClose {
                if let Err(e) = self.flush_buffer(node, "Close") {
                    debug!(error = %e, "Flush at close failed");
                }
            }
            if let Err(e) = self.finish_upload(node, "Close") {
                debug!(error = %e, "Upload at close failed");
            }
        }

        let mut state = node.lock();
        state.open_count = state.open_count.saturating_sub(1);
        if state.open_count == 0 && !state.has_unflushed_data() && state.release_buffer() {
            debug!(path = %state.local_path, "Released content buffer");
        }
    }

    fn unmounted(&self) {
        info!("Volume unmounted, stopping metadata cache");
        self.cache.shutdown();
    }
}
