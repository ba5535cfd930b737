//! Host callback contract.
//!
//! [`FileSystemCallbacks`] is the boundary between the driver core and
//! whatever projects it into the operating system. It has one method per
//! filesystem operation. Long transfers do not block the calling thread:
//! such callbacks return [`Completion::Pending`] and the driver later
//! delivers the result through the host's [`HostResponder`].

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::SystemTime,
};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{
    cache::DirectoryEntry,
    enumerator::DirectoryCursor,
    error::DriveError,
    node::{FileInfo, FileNode},
};

// ============================================================================
// Completion
// ============================================================================

/// Identifies one pending host request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionToken(pub u64);

/// Outcome of a callback that may finish asynchronously.
#[derive(Debug)]
pub enum Completion<T> {
    /// The result is available now
    Ready(T),
    /// The result will be delivered through the host responder
    Pending(CompletionToken),
}

impl<T> Completion<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Completion::Pending(_))
    }
}

/// Delivers results of pending callbacks back to the host.
pub trait HostResponder: Send + Sync {
    fn complete_read(&self, token: CompletionToken, result: Result<Vec<u8>, DriveError>);

    fn complete_write(&self, token: CompletionToken, result: Result<WriteOutcome, DriveError>);
}

/// A result delivered through [`PendingReplies`].
#[derive(Debug)]
pub enum PendingReply {
    Read(Result<Vec<u8>, DriveError>),
    Write(Result<WriteOutcome, DriveError>),
}

/// Responder that parks each pending request on a oneshot channel.
///
/// The adapter registers a token before issuing a read or write and awaits
/// the receiver in a task that owns the kernel reply.
#[derive(Debug)]
pub struct PendingReplies {
    waiting: DashMap<CompletionToken, oneshot::Sender<PendingReply>>,
    next_token: AtomicU64,
}

impl Default for PendingReplies {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingReplies {
    pub fn new() -> Self {
        Self {
            waiting: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Allocates a token and the receiver its result will arrive on.
    pub fn register(&self) -> (CompletionToken, oneshot::Receiver<PendingReply>) {
        let token = CompletionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(token, tx);
        (token, rx)
    }

    /// Forgets a token whose callback answered synchronously.
    pub fn cancel(&self, token: CompletionToken) {
        self.waiting.remove(&token);
    }

    /// Number of requests still waiting for a result.
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    fn deliver(&self, token: CompletionToken, reply: PendingReply) {
        match self.waiting.remove(&token) {
            Some((_, tx)) => {
                if tx.send(reply).is_err() {
                    debug!(token = token.0, "Pending reply receiver dropped");
                }
            }
            None => debug!(token = token.0, "Completion for unknown token"),
        }
    }
}

impl HostResponder for PendingReplies {
    fn complete_read(&self, token: CompletionToken, result: Result<Vec<u8>, DriveError>) {
        self.deliver(token, PendingReply::Read(result));
    }

    fn complete_write(&self, token: CompletionToken, result: Result<WriteOutcome, DriveError>) {
        self.deliver(token, PendingReply::Write(result));
    }
}

// ============================================================================
// Request and result types
// ============================================================================

/// Arguments of a write callback.
#[derive(Debug, Clone, Copy)]
pub struct WriteRequest<'a> {
    pub offset: u64,
    pub data: &'a [u8],
    /// Append at the current end of file, ignoring `offset`
    pub write_to_end_of_file: bool,
    /// Never extend the file; bytes past the end are dropped
    pub constrained_io: bool,
}

impl<'a> WriteRequest<'a> {
    /// A plain positional write.
    pub fn at(offset: u64, data: &'a [u8]) -> Self {
        Self {
            offset,
            data,
            write_to_end_of_file: false,
            constrained_io: false,
        }
    }
}

/// Result of a write callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub bytes_written: u32,
    pub info: FileInfo,
}

/// Flags passed to [`FileSystemCallbacks::cleanup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupFlags {
    pub delete: bool,
    pub set_allocation_size: bool,
    pub set_archive_bit: bool,
    pub set_last_write_time: bool,
}

impl CleanupFlags {
    pub fn delete() -> Self {
        Self {
            delete: true,
            ..Self::default()
        }
    }

    /// True if the handle modified the file.
    pub fn modified(&self) -> bool {
        self.set_allocation_size || self.set_archive_bit || self.set_last_write_time
    }
}

/// Attribute and timestamp changes for [`FileSystemCallbacks::set_basic_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicInfo {
    /// `u32::MAX` keeps the current attributes
    pub attributes: u32,
    pub creation_time: Option<SystemTime>,
    pub last_access_time: Option<SystemTime>,
    pub last_write_time: Option<SystemTime>,
    pub change_time: Option<SystemTime>,
}

impl Default for BasicInfo {
    fn default() -> Self {
        Self {
            attributes: u32::MAX,
            creation_time: None,
            last_access_time: None,
            last_write_time: None,
            change_time: None,
        }
    }
}

/// Volume size and label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub total_size: u64,
    pub free_size: u64,
    pub volume_label: String,
}

/// A node the host opened, with its attributes at open time.
#[derive(Debug, Clone)]
pub struct OpenedNode {
    pub node: Arc<FileNode>,
    pub info: FileInfo,
}

// ============================================================================
// FileSystemCallbacks trait
// ============================================================================

/// Callbacks the host filesystem framework invokes.
///
/// All paths are local paths. Methods run on host worker threads and may
/// block briefly on metadata requests; content transfers go through
/// [`Completion::Pending`].
pub trait FileSystemCallbacks: Send + Sync {
    fn volume_info(&self) -> VolumeInfo;

    fn set_volume_label(&self, label: &str) -> VolumeInfo;

    /// Finds a node without opening it.
    fn resolve(&self, path: &str) -> Result<Arc<FileNode>, DriveError>;

    fn open(&self, path: &str) -> Result<OpenedNode, DriveError>;

    /// Creates a file or directory and opens it.
    fn create(
        &self,
        path: &str,
        is_directory: bool,
        allocation_size: u64,
    ) -> Result<OpenedNode, DriveError>;

    /// Truncates an open file for rewriting.
    fn overwrite(&self, node: &Arc<FileNode>, allocation_size: u64)
        -> Result<FileInfo, DriveError>;

    fn get_file_info(&self, node: &Arc<FileNode>) -> Result<FileInfo, DriveError>;

    fn get_security(&self, node: &Arc<FileNode>) -> Result<String, DriveError>;

    /// Returns the next directory entry of a scan.
    ///
    /// The first call of a scan (`cursor` is `None`) lists `dir`, resuming
    /// after `marker`, and stores the listing in `cursor`. Later calls walk
    /// it. `Ok(None)` means the scan is exhausted.
    fn read_directory_entry(
        &self,
        dir: &Arc<FileNode>,
        marker: Option<&str>,
        cursor: &mut Option<DirectoryCursor>,
    ) -> Result<Option<DirectoryEntry>, DriveError>;

    fn read(
        &self,
        node: &Arc<FileNode>,
        offset: u64,
        length: u32,
        token: CompletionToken,
    ) -> Result<Completion<Vec<u8>>, DriveError>;

    fn write(
        &self,
        node: &Arc<FileNode>,
        request: WriteRequest<'_>,
        token: CompletionToken,
    ) -> Result<Completion<WriteOutcome>, DriveError>;

    fn flush(&self, node: &Arc<FileNode>) -> Result<FileInfo, DriveError>;

    fn set_basic_info(
        &self,
        node: &Arc<FileNode>,
        info: BasicInfo,
    ) -> Result<FileInfo, DriveError>;

    fn set_file_size(
        &self,
        node: &Arc<FileNode>,
        new_size: u64,
        set_allocation_size: bool,
    ) -> Result<FileInfo, DriveError>;

    fn can_delete(&self, node: &Arc<FileNode>) -> Result<(), DriveError>;

    fn rename(
        &self,
        node: &Arc<FileNode>,
        old_path: &str,
        new_path: &str,
        replace_if_exists: bool,
    ) -> Result<(), DriveError>;

    /// Last handle-level call; flushes or deletes.
    fn cleanup(&self, node: &Arc<FileNode>, flags: CleanupFlags);

    fn close(&self, node: &Arc<FileNode>);

    /// The volume went away.
    fn unmounted(&self);
}
