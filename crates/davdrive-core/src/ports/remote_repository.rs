//! Remote repository port (driven/secondary port)
//!
//! This module defines the interface of the WebDAV wire client. The driver
//! treats it as a black-box RPC client: it lists collections, fetches single
//! items, streams uploads and downloads, and performs namespace operations.
//!
//! ## Design Notes
//!
//! - Uses a typed [`RemoteError`] instead of `anyhow::Result`, because the
//!   driver reacts differently to unauthorized, missing, conflicting and
//!   unreachable outcomes.
//! - Uses `#[async_trait]` for async trait methods.
//! - All paths are repository paths as produced by
//!   [`PathTranslator`](crate::domain::PathTranslator).
//! - Uploads consume an [`UploadSource`], the receiving half of a bounded
//!   channel, so a writer can stream a large file without buffering it all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::ServerDialect;

// ============================================================================
// RemoteError
// ============================================================================

/// Errors reported by the remote repository client
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The server rejected the credentials (HTTP 401)
    #[error("authentication rejected by server")]
    Unauthorized,

    /// The resource does not exist (HTTP 404)
    #[error("not found: {0}")]
    NotFound(String),

    /// The request conflicts with the current resource state (HTTP 409)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Byte range lies beyond the end of the resource (HTTP 416)
    #[error("requested range not satisfiable")]
    RangeNotSatisfiable,

    /// The server could not be reached at all
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Any other HTTP failure status
    #[error("HTTP {status}: {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Reason or response body excerpt
        message: String,
    },

    /// Client-side failure not tied to a status code
    #[error("{0}")]
    Other(String),
}

impl RemoteError {
    /// Maps an HTTP failure status to the matching variant.
    pub fn from_status(status: u16, context: impl Into<String>) -> Self {
        let context = context.into();
        match status {
            401 => RemoteError::Unauthorized,
            404 => RemoteError::NotFound(context),
            409 => RemoteError::Conflict(context),
            416 => RemoteError::RangeNotSatisfiable,
            _ => RemoteError::Http {
                status,
                message: context,
            },
        }
    }

    /// True if the server rejected the credentials.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RemoteError::Unauthorized)
    }
}

// ============================================================================
// RemoteItem
// ============================================================================

/// Metadata of one remote resource, as returned by `list` and `get_item`.
///
/// This is a port-level DTO; the driver builds its own nodes from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    /// Resource href (absolute URL or absolute path)
    pub href: String,
    /// Server-provided display name, if any
    pub display_name: Option<String>,
    /// Explicit collection flag (only meaningful for some dialects)
    pub is_collection: bool,
    /// Size in bytes, if reported
    pub content_length: Option<u64>,
    /// Entity tag, if reported
    pub etag: Option<String>,
    /// Creation timestamp
    pub creation_date: Option<DateTime<Utc>>,
    /// Last modification timestamp
    pub last_modified: Option<DateTime<Utc>>,
}

impl RemoteItem {
    /// Describes a file with the given size.
    pub fn file(href: impl Into<String>, size: u64) -> Self {
        let now = Utc::now();
        Self {
            href: href.into(),
            display_name: None,
            is_collection: false,
            content_length: Some(size),
            etag: Some(format!("\"{:x}-{:x}\"", size, now.timestamp_millis())),
            creation_date: Some(now),
            last_modified: Some(now),
        }
    }

    /// Describes a collection.
    pub fn collection(href: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            href: href.into(),
            display_name: None,
            is_collection: true,
            content_length: None,
            etag: None,
            creation_date: Some(now),
            last_modified: Some(now),
        }
    }

    /// Classifies the item with the given server dialect.
    pub fn is_directory(&self, dialect: ServerDialect) -> bool {
        dialect.is_directory(self.is_collection, self.etag.as_deref(), self.content_length)
    }
}

// ============================================================================
// UploadSource
// ============================================================================

/// Streaming body of an upload.
///
/// Wraps the receiving half of a bounded channel of byte chunks. The
/// sender side is held by the driver; dropping it ends the body.
#[derive(Debug)]
pub struct UploadSource {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl UploadSource {
    /// Wraps an existing receiver.
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Creates a bounded channel and returns its sender with the source.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(rx))
    }

    /// A source that yields `data` once and then ends.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let (tx, source) = Self::channel(1);
        if !data.is_empty() {
            // Capacity 1 and a fresh channel: this cannot be full.
            let _ = tx.try_send(data);
        }
        source
    }

    /// Next chunk of the body, or `None` once the writer is done.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Drains the whole body into memory.
    pub async fn read_to_end(mut self) -> Vec<u8> {
        let mut body = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            body.extend_from_slice(&chunk);
        }
        body
    }
}

// ============================================================================
// IRemoteRepository trait
// ============================================================================

/// WebDAV repository operations used by the driver
///
/// Implementations own the HTTP session and credentials. All methods take
/// repository paths.
#[async_trait::async_trait]
pub trait IRemoteRepository: Send + Sync {
    /// Lists a collection. The collection itself may be part of the result.
    async fn list(&self, path: &str) -> Result<Vec<RemoteItem>, RemoteError>;

    /// Fetches a single item; `NotFound` if it does not exist.
    async fn get_item(&self, path: &str) -> Result<RemoteItem, RemoteError>;

    /// Uploads a whole file named `name` into `parent`.
    async fn upload(
        &self,
        parent: &str,
        name: &str,
        content: UploadSource,
    ) -> Result<bool, RemoteError>;

    /// Uploads bytes starting at `offset` into an existing file.
    async fn upload_partial(
        &self,
        parent: &str,
        name: &str,
        offset: u64,
        content: UploadSource,
    ) -> Result<bool, RemoteError>;

    /// Downloads the whole file.
    async fn download(&self, path: &str) -> Result<Vec<u8>, RemoteError>;

    /// Downloads the inclusive byte range `start..=end`.
    ///
    /// A range starting past the end yields `RangeNotSatisfiable`.
    async fn download_partial(
        &self,
        path: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, RemoteError>;

    /// Creates the collection `name` inside `parent`.
    async fn create_directory(&self, parent: &str, name: &str) -> Result<bool, RemoteError>;

    /// Deletes a file.
    async fn delete_file(&self, path: &str) -> Result<(), RemoteError>;

    /// Deletes a collection and everything below it.
    async fn delete_directory(&self, path: &str) -> Result<(), RemoteError>;

    /// Moves a file or collection from `source` to `destination`.
    async fn move_item(&self, source: &str, destination: &str) -> Result<bool, RemoteError>;
}
