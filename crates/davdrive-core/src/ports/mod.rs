//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! driver. Ports are interfaces the driver depends on, but whose
//! implementations live in adapter crates or in the embedding host.
//!
//! ## Ports Overview
//!
//! - [`IRemoteRepository`] - WebDAV wire client (list, get, upload, download, move, delete)
//! - [`IActionObserver`] - Per-operation events and the authentication-failed signal

pub mod observer;
pub mod remote_repository;

pub use observer::{ActionOutcome, IActionObserver, RepositoryAction};
pub use remote_repository::{IRemoteRepository, RemoteError, RemoteItem, UploadSource};
