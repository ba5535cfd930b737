//! File nodes: the in-memory representation of one repository entry.
//!
//! A [`FileNode`] is identified by its local path and carries the entry's
//! metadata, its optional content buffer and its pending upload. All
//! mutable fields live in a [`NodeState`] behind the node's own lock, so
//! callbacks touching different nodes never contend.
//!
//! ## Write lifecycle
//!
//! ```text
//! Clean ──write──▶ Dirty ──flush──▶ Flushing ──ok──▶ Clean
//!                    ▲                  │
//!                    └──── failed ──────┤
//!                                       └─ retries exhausted ─▶ FailedWithBackup
//! any state ── remote delete ──▶ Deleted
//! ```

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Instant, SystemTime},
};

use davdrive_core::{
    config::TransferConfig,
    domain::{local_name, PathTranslator, ServerDialect},
    ports::RemoteItem,
};
use parking_lot::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{error::DriveError, upload::UploadStream};

/// Security descriptor reported for every entry.
///
/// Owner and group are the built-in administrators; everyone gets full access.
pub const DEFAULT_SECURITY_DESCRIPTOR: &str = "O:BAG:BAD:P(A;;FA;;;SY)(A;;FA;;;BA)(A;;FA;;;WD)";

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// FileInfo
// ============================================================================

/// Attribute bits, using the common file attribute values.
pub mod attributes {
    pub const READONLY: u32 = 0x0001;
    pub const HIDDEN: u32 = 0x0002;
    pub const DIRECTORY: u32 = 0x0010;
    pub const ARCHIVE: u32 = 0x0020;
    pub const NORMAL: u32 = 0x0080;
}

/// Metadata returned to the host for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub attributes: u32,
    pub file_size: u64,
    pub allocation_size: u64,
    pub creation_time: SystemTime,
    pub last_access_time: SystemTime,
    pub last_write_time: SystemTime,
    pub change_time: SystemTime,
    /// Stable object id of the node
    pub index_number: u64,
}

impl FileInfo {
    pub fn is_directory(&self) -> bool {
        self.attributes & attributes::DIRECTORY != 0
    }
}

/// Where a node is in its write lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Clean,
    Dirty,
    Flushing,
    FailedWithBackup,
    Deleted,
}

// ============================================================================
// NodeState
// ============================================================================

/// Mutable fields of a node, guarded by the node lock.
#[derive(Debug)]
pub struct NodeState {
    pub local_path: String,
    pub repository_path: String,
    pub name: String,
    pub info: FileInfo,
    pub etag: Option<String>,
    pub open_count: u32,
    /// Every immediate child has been fetched at least once
    pub is_parsed: bool,
    pub last_refresh: Option<Instant>,
    pub write_state: WriteState,
    /// Content buffer; always at least `file_size` bytes when present
    pub buffer: Option<Vec<u8>>,
    /// Upload stream of the flush-at-write policy
    pub upload: Option<UploadStream>,
    /// Last deferred write, later writes and flushes wait for it
    pub pending_io: Option<JoinHandle<()>>,
    /// Recovery copy written after a failed flush
    pub local_copy: Option<PathBuf>,
    /// Bumped by every buffered write
    pub write_generation: u64,
}

impl NodeState {
    pub fn is_directory(&self) -> bool {
        self.info.is_directory()
    }

    pub fn is_deleted(&self) -> bool {
        self.write_state == WriteState::Deleted
    }

    /// True while local changes have not reached the server.
    pub fn has_unflushed_data(&self) -> bool {
        self.upload.is_some()
            || matches!(
                self.write_state,
                WriteState::Dirty | WriteState::Flushing | WriteState::FailedWithBackup
            )
    }

    /// Records a buffered write.
    pub fn mark_dirty(&mut self) {
        if !self.is_deleted() {
            self.write_state = WriteState::Dirty;
            self.write_generation += 1;
        }
    }

    /// True if an upload stream is open and has not yet reached `offset`.
    ///
    /// The server copy is incomplete in that case, so reads there must
    /// report end-of-file.
    pub fn pending_upload(&self, offset: u64) -> bool {
        self.upload
            .as_ref()
            .is_some_and(|upload| upload.offset() < offset)
    }

    /// True if a deferred write is still running.
    pub fn has_pending_io(&self) -> bool {
        self.pending_io
            .as_ref()
            .is_some_and(|pending| !pending.is_finished())
    }

    /// True if the buffer holds the whole file content.
    pub fn content_loaded(&self) -> bool {
        self.buffer.is_some() || self.info.file_size == 0
    }

    /// Drops the content buffer. Returns true if one was held.
    pub fn release_buffer(&mut self) -> bool {
        self.buffer.take().is_some()
    }

    /// Sets all four timestamps to now.
    pub fn touch(&mut self) {
        let now = SystemTime::now();
        self.info.creation_time = now;
        self.info.last_access_time = now;
        self.info.last_write_time = now;
        self.info.change_time = now;
    }

    /// Changes the file size or the allocation size.
    ///
    /// With `set_allocation` the allocation becomes exactly `new_size` and the
    /// file size is clamped to it. Otherwise the file size becomes `new_size`,
    /// growing the allocation to the next allocation unit when needed.
    /// With `keep_buffer` the content buffer follows the new size, and growth
    /// is zero-filled.
    pub fn set_file_size(
        &mut self,
        new_size: u64,
        set_allocation: bool,
        keep_buffer: bool,
        transfer: &TransferConfig,
    ) -> Result<(), DriveError> {
        if new_size > transfer.max_file_size {
            return Err(DriveError::DiskFull(format!(
                "{} bytes exceeds the volume limit of {}",
                new_size, transfer.max_file_size
            )));
        }

        if set_allocation {
            if self.info.allocation_size != new_size {
                if keep_buffer {
                    let buffer = self.buffer.get_or_insert_with(Vec::new);
                    let wanted = new_size.min(self.info.file_size) as usize;
                    if buffer.len() > wanted {
                        buffer.truncate(wanted);
                        buffer.shrink_to(new_size as usize);
                    } else {
                        buffer
                            .try_reserve_exact((new_size as usize).saturating_sub(buffer.len()))
                            .map_err(|e| DriveError::InsufficientResources(e.to_string()))?;
                    }
                }
                self.info.allocation_size = new_size;
                if self.info.file_size > new_size {
                    self.info.file_size = new_size;
                }
            }
        } else if self.info.file_size != new_size {
            if self.info.allocation_size < new_size {
                let allocation = transfer
                    .round_to_allocation(new_size)
                    .min(transfer.max_file_size);
                self.set_file_size(allocation, true, keep_buffer, transfer)?;
            }
            if keep_buffer {
                let buffer = self.buffer.get_or_insert_with(Vec::new);
                let size = new_size as usize;
                if buffer.len() < size {
                    buffer
                        .try_reserve_exact(size - buffer.len())
                        .map_err(|e| DriveError::InsufficientResources(e.to_string()))?;
                }
                buffer.resize(size, 0);
            }
            self.info.file_size = new_size;
        }

        Ok(())
    }

    /// Persists the buffer to a file in `dir` for manual recovery.
    ///
    /// Returns the path written, or `None` when there is no buffer or the
    /// file could not be written.
    pub fn generate_local_copy(&mut self, dir: &Path) -> Option<PathBuf> {
        let buffer = self.buffer.as_ref()?;
        let size = (self.info.file_size as usize).min(buffer.len());
        let path = dir.join(format!("{}-{}", uuid::Uuid::new_v4(), self.name));
        match std::fs::write(&path, &buffer[..size]) {
            Ok(()) => {
                debug!(path = %path.display(), bytes = size, "Wrote recovery copy");
                self.local_copy = Some(path.clone());
                Some(path)
            }
            Err(e) => {
                warn!(error = %e, local_path = %self.local_path, "Failed to write recovery copy");
                self.local_copy = None;
                None
            }
        }
    }
}

// ============================================================================
// FileNode
// ============================================================================

/// One file or directory of the repository.
///
/// Owned by the metadata cache once inserted; open handles hold further
/// `Arc`s to the same node.
#[derive(Debug)]
pub struct FileNode {
    object_id: u64,
    is_directory: bool,
    state: Mutex<NodeState>,
    flush_lock: Mutex<()>,
}

impl FileNode {
    /// Builds a node from remote metadata.
    ///
    /// Returns `None` if the item's href lies outside the document library.
    pub fn from_remote(
        item: &RemoteItem,
        translator: &PathTranslator,
        dialect: ServerDialect,
    ) -> Option<Self> {
        let repository_path = translator.href_to_repository(&item.href);
        let local_path = translator.repository_to_local(&repository_path)?;
        let is_directory = item.is_directory(dialect);
        let name = if translator.is_repository_root(&repository_path) {
            String::new()
        } else {
            local_name(&local_path).to_string()
        };

        let object_id = NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed);
        let size = item.content_length.unwrap_or(0);
        let now = SystemTime::now();
        let info = FileInfo {
            attributes: if is_directory {
                attributes::DIRECTORY
            } else {
                attributes::NORMAL
            },
            file_size: if is_directory { 0 } else { size },
            allocation_size: if is_directory { 0 } else { size },
            creation_time: item.creation_date.map(SystemTime::from).unwrap_or(now),
            last_access_time: now,
            last_write_time: item.last_modified.map(SystemTime::from).unwrap_or(now),
            change_time: item.last_modified.map(SystemTime::from).unwrap_or(now),
            index_number: object_id,
        };

        Some(Self::with_state(
            object_id,
            is_directory,
            local_path,
            repository_path,
            name,
            info,
            item.etag.clone(),
        ))
    }

    /// Builds a node for an entry created locally.
    pub fn new_local(local_path: &str, repository_path: &str, is_directory: bool) -> Self {
        let object_id = NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now();
        let info = FileInfo {
            attributes: if is_directory {
                attributes::DIRECTORY
            } else {
                attributes::ARCHIVE
            },
            file_size: 0,
            allocation_size: 0,
            creation_time: now,
            last_access_time: now,
            last_write_time: now,
            change_time: now,
            index_number: object_id,
        };
        Self::with_state(
            object_id,
            is_directory,
            local_path.to_string(),
            repository_path.to_string(),
            local_name(local_path).to_string(),
            info,
            None,
        )
    }

    fn with_state(
        object_id: u64,
        is_directory: bool,
        local_path: String,
        repository_path: String,
        name: String,
        info: FileInfo,
        etag: Option<String>,
    ) -> Self {
        Self {
            object_id,
            is_directory,
            state: Mutex::new(NodeState {
                local_path,
                repository_path,
                name,
                info,
                etag,
                open_count: 0,
                is_parsed: false,
                last_refresh: None,
                write_state: WriteState::Clean,
                buffer: None,
                upload: None,
                pending_io: None,
                local_copy: None,
                write_generation: 0,
            }),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn object_id(&self) -> u64 {
        self.object_id
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// Takes the node lock.
    pub fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock()
    }

    /// Serialises flushes of this node. Taken before the node lock, never after.
    pub(crate) fn flush_guard(&self) -> MutexGuard<'_, ()> {
        self.flush_lock.lock()
    }

    pub fn local_path(&self) -> String {
        self.state.lock().local_path.clone()
    }

    pub fn repository_path(&self) -> String {
        self.state.lock().repository_path.clone()
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn info(&self) -> FileInfo {
        self.state.lock().info
    }

    pub fn open_count(&self) -> u32 {
        self.state.lock().open_count
    }

    pub fn is_parsed(&self) -> bool {
        self.state.lock().is_parsed
    }

    pub fn has_unflushed_data(&self) -> bool {
        self.state.lock().has_unflushed_data()
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().is_deleted()
    }

    pub fn has_buffer(&self) -> bool {
        self.state.lock().buffer.is_some()
    }

    pub fn write_state(&self) -> WriteState {
        self.state.lock().write_state
    }

    /// Rewrites the path fields after a rename.
    pub fn set_paths(&self, local_path: &str, translator: &PathTranslator) {
        let mut state = self.state.lock();
        state.repository_path = translator.local_to_repository(local_path);
        state.name = local_name(local_path).to_string();
        state.local_path = local_path.to_string();
    }

    /// Refreshes size, timestamps and entity tag from newer remote metadata.
    ///
    /// Nodes with local changes are left alone.
    pub fn apply_remote(&self, item: &RemoteItem) {
        let mut state = self.state.lock();
        if state.has_unflushed_data() || state.is_directory() {
            return;
        }
        let size = item.content_length.unwrap_or(0);
        if state.etag.is_some() && state.etag == item.etag && state.info.file_size == size {
            return;
        }
        if state.info.file_size != size || state.etag != item.etag {
            // Content changed on the server
            state.buffer = None;
        }
        state.info.file_size = size;
        state.info.allocation_size = size;
        if let Some(modified) = item.last_modified {
            state.info.last_write_time = SystemTime::from(modified);
            state.info.change_time = SystemTime::from(modified);
        }
        state.etag = item.etag.clone();
    }
}
