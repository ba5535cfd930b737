//! DavDrive FUSE - WebDAV repositories as a local filesystem
//!
//! Presents a remote WebDAV document library as a mounted volume:
//! - Metadata cache with missing-entry suppression and background refresh
//! - On-demand content download with ranged reads
//! - Write buffering with flush-at-close or streaming flush-at-write
//! - Recovery copies for content the server refused
//!
//! # Architecture
//!
//! The driver core is independent of the kernel interface:
//! - [`DavDriver`] implements [`FileSystemCallbacks`] on local paths
//! - [`MetadataCache`] owns every known [`FileNode`]
//! - [`DavDriveFs`] adapts the callbacks to `fuser::Filesystem`
//!
//! # Usage
//!
//! ```ignore
//! use davdrive_fuse::{mount, TracingObserver};
//!
//! let session = mount(&config, remote, Arc::new(TracingObserver), rt.handle().clone())?;
//! // Filesystem is mounted until session is dropped
//! ```

pub mod cache;
pub mod callbacks;
pub mod driver;
pub mod enumerator;
pub mod error;
pub mod events;
pub mod filesystem;
pub mod inode;
pub mod node;
pub mod refresh;
pub mod upload;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
pub use cache::{CacheLookup, DirectoryEntry, MetadataCache};
pub use callbacks::{
    BasicInfo, CleanupFlags, Completion, CompletionToken, FileSystemCallbacks, HostResponder,
    OpenedNode, PendingReplies, VolumeInfo, WriteOutcome, WriteRequest,
};
use davdrive_core::{
    config::Config,
    ports::{IActionObserver, IRemoteRepository},
};
pub use driver::DavDriver;
pub use enumerator::DirectoryCursor;
pub use error::DriveError;
pub use events::{ChannelObserver, DriveEvent, TracingObserver};
pub use filesystem::DavDriveFs;
pub use fuser::BackgroundSession;
use fuser::MountOption;
pub use node::{FileInfo, FileNode, WriteState};
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Expands a `~/` prefix to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Mounts the repository described by `config` at its mount point.
///
/// The mount point must exist, be a directory and be empty. The
/// repository root is listed once before mounting so bad credentials or
/// an unreachable server fail here instead of on first access.
///
/// The filesystem stays mounted as long as the returned session is kept
/// alive.
///
/// # Mount Options
///
/// - `AutoUnmount` - Unmount when the mounting process exits
/// - `FSName` - `fuse.fs_name` from the configuration
/// - `Subtype("webdav")`
/// - `DefaultPermissions` - Let the kernel handle permission checks
/// - `NoAtime`
/// - `Async`
pub fn mount(
    config: &Config,
    remote: Arc<dyn IRemoteRepository>,
    observer: Arc<dyn IActionObserver>,
    rt_handle: Handle,
) -> Result<BackgroundSession, DriveError> {
    let mount_point = expand_tilde(&config.fuse.mount_point);

    info!(
        mount_point = %mount_point.display(),
        repository = %config.repository.url,
        "Preparing to mount DavDrive FUSE filesystem"
    );

    if !mount_point.exists() {
        return Err(DriveError::InvalidMountPoint(format!(
            "Mount point does not exist: {}",
            mount_point.display()
        )));
    }
    if !mount_point.is_dir() {
        return Err(DriveError::InvalidMountPoint(format!(
            "Mount point is not a directory: {}",
            mount_point.display()
        )));
    }
    let entries = std::fs::read_dir(&mount_point)
        .with_context(|| format!("Cannot read mount point {}", mount_point.display()))?;
    if entries.count() > 0 {
        return Err(DriveError::InvalidMountPoint(format!(
            "Mount point is not empty: {}",
            mount_point.display()
        )));
    }

    let filesystem = DavDriveFs::new(config.clone(), remote, observer, rt_handle)
        .map_err(|e| DriveError::InvalidMountPoint(e.to_string()))?;
    filesystem.driver().verify_connection()?;

    let mount_options = [
        MountOption::AutoUnmount,
        MountOption::FSName(config.fuse.fs_name.clone()),
        MountOption::Subtype("webdav".to_string()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
        MountOption::Async,
    ];
    debug!(options = ?mount_options, "Mounting FUSE filesystem");

    let session = fuser::spawn_mount2(filesystem, &mount_point, &mount_options).map_err(|e| {
        DriveError::UnexpectedIoError(format!(
            "Failed to mount FUSE filesystem at {}: {}",
            mount_point.display(),
            e
        ))
    })?;

    info!(
        mount_point = %mount_point.display(),
        "DavDrive FUSE filesystem mounted successfully"
    );
    Ok(session)
}

/// Unmounts the filesystem by dropping its session.
///
/// Dropping the session runs the filesystem's `destroy()`, which flushes
/// open files and stops the metadata cache.
pub fn unmount(session: BackgroundSession) {
    info!("Unmounting DavDrive FUSE filesystem");
    drop(session);
    info!("DavDrive FUSE filesystem unmounted");
}
