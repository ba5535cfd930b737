//! Error types for the filesystem driver.
//!
//! Defines `DriveError`, the typed failure every filesystem callback can
//! return, and its conversion to libc errno values for the FUSE adapter.

use thiserror::Error;

/// Failures returned by driver callbacks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriveError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("name collision: {0}")]
    NameCollision(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("cannot make: {0}")]
    CannotMake(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("end of file")]
    EndOfFile,

    #[error("disk full: {0}")]
    DiskFull(String),

    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("unexpected I/O error: {0}")]
    UnexpectedIoError(String),

    #[error("invalid mount point: {0}")]
    InvalidMountPoint(String),
}

impl From<DriveError> for libc::c_int {
    fn from(err: DriveError) -> libc::c_int {
        match err {
            DriveError::NotFound(_) => libc::ENOENT,
            DriveError::NameCollision(_) => libc::EEXIST,
            DriveError::AccessDenied(_) => libc::EACCES,
            DriveError::CannotMake(_) => libc::EPERM,
            DriveError::NetworkUnreachable(_) => libc::ENETUNREACH,
            DriveError::EndOfFile => libc::ENODATA,
            DriveError::DiskFull(_) => libc::ENOSPC,
            DriveError::InsufficientResources(_) => libc::ENOMEM,
            DriveError::UnexpectedIoError(_) => libc::EIO,
            DriveError::InvalidMountPoint(_) => libc::ENOTDIR,
        }
    }
}

impl From<std::io::Error> for DriveError {
    fn from(err: std::io::Error) -> Self {
        DriveError::UnexpectedIoError(err.to_string())
    }
}

impl From<anyhow::Error> for DriveError {
    fn from(err: anyhow::Error) -> Self {
        DriveError::UnexpectedIoError(err.to_string())
    }
}
