//! FUSE filesystem implementation.
//!
//! Implements `fuser::Filesystem` for DavDrive by translating kernel
//! requests (inode numbers, file handles) into [`FileSystemCallbacks`]
//! calls on local paths. Reads and writes the driver answers
//! asynchronously are completed from a runtime task that owns the reply.

use std::{
    ffi::{c_int, OsStr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use dashmap::DashMap;
use davdrive_core::{
    config::Config,
    domain::{join_local, DomainError, LOCAL_SEPARATOR},
    ports::{IActionObserver, IRemoteRepository},
};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::{
    callbacks::{
        BasicInfo, CleanupFlags, Completion, FileSystemCallbacks, PendingReplies, PendingReply,
        WriteRequest,
    },
    driver::DavDriver,
    enumerator::DirectoryCursor,
    error::DriveError,
    inode::InodeTable,
    node::{attributes, FileInfo, FileNode},
};

/// FUSE open flag indicating the kernel should keep cached data.
const FOPEN_KEEP_CACHE: u32 = 1 << 1;

/// Maximum filename length in bytes (POSIX NAME_MAX).
const NAME_MAX: usize = 255;

const BLOCK_SIZE: u32 = 4096;

/// `renameat2` flag refusing to replace an existing target.
const RENAME_NOREPLACE: u32 = 1;

/// An open file handle.
struct OpenFile {
    node: Arc<FileNode>,
    /// The handle wrote or truncated the file
    modified: bool,
}

/// An open directory handle and its scan position.
struct OpenDir {
    node: Arc<FileNode>,
    cursor: Option<DirectoryCursor>,
}

/// FUSE adapter around a [`DavDriver`].
///
/// ```text
/// kernel ──ino/fh──▶ DavDriveFs ──local path──▶ DavDriver ──▶ MetadataCache
///                        ▲                          │               │
///                        └──── PendingReplies ◀─────┘        IRemoteRepository
/// ```
pub struct DavDriveFs {
    driver: DavDriver,
    replies: Arc<PendingReplies>,
    inodes: Arc<InodeTable>,
    files: DashMap<u64, OpenFile>,
    dirs: DashMap<u64, OpenDir>,
    next_fh: AtomicU64,
    attr_ttl: Duration,
    keep_data: bool,
}

impl DavDriveFs {
    /// Builds the driver for `config` and wraps it.
    pub fn new(
        config: Config,
        remote: Arc<dyn IRemoteRepository>,
        observer: Arc<dyn IActionObserver>,
        rt_handle: Handle,
    ) -> Result<Self, DomainError> {
        let replies = Arc::new(PendingReplies::new());
        let driver = DavDriver::new(config, remote, observer, replies.clone(), rt_handle)?;
        Ok(Self::with_driver(driver, replies))
    }

    /// Wraps an existing driver whose responder is `replies`.
    pub fn with_driver(driver: DavDriver, replies: Arc<PendingReplies>) -> Self {
        let kernel_cache = driver.config().fuse.kernel_cache;
        Self {
            driver,
            replies,
            inodes: Arc::new(InodeTable::new()),
            files: DashMap::new(),
            dirs: DashMap::new(),
            next_fh: AtomicU64::new(1),
            attr_ttl: kernel_cache.attr_ttl(),
            keep_data: kernel_cache.keep_data(),
        }
    }

    pub fn driver(&self) -> &DavDriver {
        &self.driver
    }

    pub fn inode_table(&self) -> &Arc<InodeTable> {
        &self.inodes
    }

    /// Allocates a new unique file handle.
    pub fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    fn open_flags(&self) -> u32 {
        if self.keep_data {
            FOPEN_KEEP_CACHE
        } else {
            0
        }
    }

    /// Local path of `name` inside the directory `parent`.
    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let name = validate_name(name)?;
        let parent_path = self.inodes.path(parent).ok_or(libc::ENOENT)?;
        Ok(join_local(&parent_path, name))
    }

    /// Node behind an inode, preferring the one bound to an open handle.
    fn node_for(&self, ino: u64, fh: Option<u64>) -> Result<Arc<FileNode>, c_int> {
        if let Some(file) = fh.and_then(|fh| self.files.get(&fh)) {
            return Ok(Arc::clone(&file.node));
        }
        let path = self.inodes.path(ino).ok_or(libc::ENOENT)?;
        self.driver.resolve(&path).map_err(c_int::from)
    }

    fn attr_of(&self, node: &FileNode, info: &FileInfo) -> FileAttr {
        let ino = self.inodes.get_or_assign(&node.local_path());
        to_file_attr(ino, info)
    }

    /// Opens, deletes and closes `path`, as a shell `rm` would.
    fn remove_entry(&self, path: &str, expect_directory: bool) -> Result<(), c_int> {
        let opened = self.driver.open(path).map_err(c_int::from)?;
        let node = opened.node;

        let verdict = if node.is_directory() != expect_directory {
            Err(if expect_directory {
                libc::ENOTDIR
            } else {
                libc::EISDIR
            })
        } else if expect_directory {
            match self.is_empty_directory(&node) {
                Ok(true) => self.driver.can_delete(&node).map_err(c_int::from),
                Ok(false) => Err(libc::ENOTEMPTY),
                Err(errno) => Err(errno),
            }
        } else {
            self.driver.can_delete(&node).map_err(c_int::from)
        };

        if verdict.is_ok() {
            self.driver.cleanup(&node, CleanupFlags::delete());
        }
        self.driver.close(&node);
        verdict?;

        if !node.is_deleted() {
            return Err(libc::EIO);
        }
        self.inodes.remove_path(path);
        Ok(())
    }

    fn is_empty_directory(&self, dir: &Arc<FileNode>) -> Result<bool, c_int> {
        let mut cursor = None;
        let mut entry = self
            .driver
            .read_directory_entry(dir, None, &mut cursor)
            .map_err(c_int::from)?;
        while let Some(current) = entry {
            if current.name != "." && current.name != ".." {
                return Ok(false);
            }
            entry = cursor.as_mut().and_then(DirectoryCursor::next_entry);
        }
        Ok(true)
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn validate_name(name: &OsStr) -> Result<&str, c_int> {
    let name = name.to_str().ok_or(libc::EINVAL)?;
    if name.len() > NAME_MAX {
        return Err(libc::ENAMETOOLONG);
    }
    // The separator of local paths cannot appear inside a name
    if name.is_empty() || name.contains(LOCAL_SEPARATOR) {
        return Err(libc::EINVAL);
    }
    Ok(name)
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::Now => SystemTime::now(),
        TimeOrNow::SpecificTime(time) => time,
    }
}

/// Maps a permission mode onto the read-only attribute.
fn attributes_for_mode(current: u32, mode: u32) -> u32 {
    if mode & 0o222 == 0 {
        current | attributes::READONLY
    } else {
        current & !attributes::READONLY
    }
}

/// Converts driver metadata into kernel attributes.
pub fn to_file_attr(ino: u64, info: &FileInfo) -> FileAttr {
    let directory = info.is_directory();
    let readonly = info.attributes & attributes::READONLY != 0;
    let perm = match (directory, readonly) {
        (true, false) => 0o755,
        (true, true) => 0o555,
        (false, false) => 0o644,
        (false, true) => 0o444,
    };
    FileAttr {
        ino,
        size: info.file_size,
        blocks: info.allocation_size.div_ceil(512),
        atime: info.last_access_time,
        mtime: info.last_write_time,
        ctime: info.change_time,
        crtime: info.creation_time,
        kind: if directory {
            FileType::Directory
        } else {
            FileType::RegularFile
        },
        perm,
        nlink: if directory { 2 } else { 1 },
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

// ============================================================================
// fuser::Filesystem
// ============================================================================

impl Filesystem for DavDriveFs {
    #[tracing::instrument(level = "info", skip(self, _req, _config))]
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        tracing::info!(
            repository = %self.driver.translator().repository_root(),
            "Initializing DavDrive FUSE filesystem"
        );
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    fn destroy(&mut self) {
        tracing::info!(
            inodes = self.inodes.len(),
            open_files = self.files.len(),
            "DavDrive FUSE filesystem shutting down"
        );
        for (_, file) in std::mem::take(&mut self.files) {
            self.driver.cleanup(&file.node, CleanupFlags::default());
            self.driver.close(&file.node);
        }
        self.driver.unmounted();
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(parent, name = ?name))]
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                // Names the volume cannot hold simply do not exist
                reply.error(if errno == libc::EINVAL {
                    libc::ENOENT
                } else {
                    errno
                });
                return;
            }
        };

        match self.driver.resolve(&path) {
            Ok(node) => {
                let attr = self.attr_of(&node, &node.info());
                reply.entry(&self.attr_ttl, &attr, 0);
            }
            Err(e) => {
                debug!(path = %path, error = %e, "lookup failed");
                reply.error(e.into());
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino))]
    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        match self.node_for(ino, fh) {
            Ok(node) => {
                let info = node.info();
                reply.attr(&self.attr_ttl, &to_file_attr(ino, &info));
            }
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, mode, size))]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctime: Option<SystemTime>,
        fh: Option<u64>,
        crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let node = match self.node_for(ino, fh) {
            Ok(node) => node,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        if let Some(size) = size {
            if let Err(e) = self.driver.set_file_size(&node, size, false) {
                warn!(ino, size, error = %e, "truncate failed");
                reply.error(e.into());
                return;
            }
            if let Some(mut file) = fh.and_then(|fh| self.files.get_mut(&fh)) {
                file.modified = true;
            }
        }

        let mut basic = BasicInfo {
            creation_time: crtime,
            last_access_time: atime.map(resolve_time),
            last_write_time: mtime.map(resolve_time),
            change_time: ctime,
            ..BasicInfo::default()
        };
        if let Some(mode) = mode {
            basic.attributes = attributes_for_mode(node.info().attributes, mode);
        }

        let info = if basic == BasicInfo::default() {
            node.info()
        } else {
            match self.driver.set_basic_info(&node, basic) {
                Ok(info) => info,
                Err(e) => {
                    reply.error(e.into());
                    return;
                }
            }
        };
        reply.attr(&self.attr_ttl, &to_file_attr(ino, &info));
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply))]
    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let volume = self.driver.volume_info();
        let blocks = volume.total_size / u64::from(BLOCK_SIZE);
        let free = volume.free_size / u64::from(BLOCK_SIZE);
        reply.statfs(
            blocks,
            free,
            free,
            self.inodes.len() as u64,
            u64::MAX / 2,
            BLOCK_SIZE,
            NAME_MAX as u32,
            BLOCK_SIZE,
        );
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino))]
    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let node = match self.node_for(ino, None) {
            Ok(node) => node,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        if !node.is_directory() {
            reply.error(libc::ENOTDIR);
            return;
        }

        let fh = self.alloc_fh();
        self.dirs.insert(fh, OpenDir { node, cursor: None });
        reply.opened(fh, self.open_flags());
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, offset))]
    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(mut dir) = self.dirs.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let dir = &mut *dir;

        if dir.cursor.is_none() {
            if let Err(e) = self
                .driver
                .read_directory_entry(&dir.node, None, &mut dir.cursor)
            {
                reply.error(e.into());
                return;
            }
        }
        let Some(cursor) = dir.cursor.as_mut() else {
            reply.ok();
            return;
        };

        cursor.seek(usize::try_from(offset).unwrap_or(0));
        while let Some(entry) = cursor.next_entry() {
            let entry_ino = if entry.name == "." {
                ino
            } else {
                self.inodes.get_or_assign(&entry.node.local_path())
            };
            let kind = if entry.node.is_directory() {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            if reply.add(entry_ino, cursor.position() as i64, kind, &entry.name) {
                // Buffer is full, the kernel asks again from this offset
                break;
            }
        }
        reply.ok();
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, fh))]
    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        self.dirs.remove(&fh);
        reply.ok();
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, flags))]
    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let opened = match self.driver.open(&path) {
            Ok(opened) => opened,
            Err(e) => {
                reply.error(e.into());
                return;
            }
        };

        let truncate = flags & libc::O_TRUNC != 0 && !opened.node.is_directory();
        if truncate {
            if let Err(e) = self.driver.overwrite(&opened.node, 0) {
                self.driver.close(&opened.node);
                reply.error(e.into());
                return;
            }
        }

        let fh = self.alloc_fh();
        self.files.insert(
            fh,
            OpenFile {
                node: opened.node,
                modified: truncate,
            },
        );
        reply.opened(fh, self.open_flags());
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, offset, size))]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let node = match self.node_for(ino, Some(fh)) {
            Ok(node) => node,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let (token, rx) = self.replies.register();
        match self.driver.read(&node, offset, size, token) {
            Ok(Completion::Ready(data)) => {
                self.replies.cancel(token);
                reply.data(&data);
            }
            Ok(Completion::Pending(_)) => {
                self.driver.rt_handle().spawn(async move {
                    match rx.await {
                        Ok(PendingReply::Read(Ok(data))) => reply.data(&data),
                        Ok(PendingReply::Read(Err(DriveError::EndOfFile))) => reply.data(&[]),
                        Ok(PendingReply::Read(Err(e))) => reply.error(e.into()),
                        Ok(PendingReply::Write(_)) | Err(_) => reply.error(libc::EIO),
                    }
                });
            }
            Err(DriveError::EndOfFile) => {
                self.replies.cancel(token);
                reply.data(&[]);
            }
            Err(e) => {
                self.replies.cancel(token);
                reply.error(e.into());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "debug", skip(self, _req, data, reply), fields(ino, offset, size = data.len()))]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let node = match self.files.get_mut(&fh) {
            Some(mut file) => {
                file.modified = true;
                Arc::clone(&file.node)
            }
            None => {
                warn!(ino, fh, "write on unknown handle");
                reply.error(libc::EBADF);
                return;
            }
        };

        let request = WriteRequest {
            write_to_end_of_file: flags & libc::O_APPEND != 0,
            ..WriteRequest::at(offset, data)
        };
        let (token, rx) = self.replies.register();
        match self.driver.write(&node, request, token) {
            Ok(Completion::Ready(outcome)) => {
                self.replies.cancel(token);
                reply.written(outcome.bytes_written);
            }
            Ok(Completion::Pending(_)) => {
                self.driver.rt_handle().spawn(async move {
                    match rx.await {
                        Ok(PendingReply::Write(Ok(outcome))) => reply.written(outcome.bytes_written),
                        Ok(PendingReply::Write(Err(e))) => reply.error(e.into()),
                        Ok(PendingReply::Read(_)) | Err(_) => reply.error(libc::EIO),
                    }
                });
            }
            Err(e) => {
                self.replies.cancel(token);
                reply.error(e.into());
            }
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.node_for(ino, Some(fh)) {
            Ok(node) => match self.driver.flush(&node) {
                Ok(_) => reply.ok(),
                Err(e) => reply.error(e.into()),
            },
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, fh))]
    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.files.remove(&fh) {
            Some((_, file)) => {
                let flags = CleanupFlags {
                    set_allocation_size: file.modified,
                    set_archive_bit: file.modified,
                    set_last_write_time: file.modified,
                    ..CleanupFlags::default()
                };
                self.driver.cleanup(&file.node, flags);
                self.driver.close(&file.node);
            }
            None => warn!(ino, fh, "release of unknown handle"),
        }
        reply.ok();
    }

    #[tracing::instrument(level = "info", skip(self, _req, reply), fields(parent, name = ?name))]
    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        match self.driver.create(&path, true, 0) {
            Ok(opened) => {
                let attr = self.attr_of(&opened.node, &opened.info);
                self.driver.cleanup(&opened.node, CleanupFlags::default());
                self.driver.close(&opened.node);
                reply.entry(&self.attr_ttl, &attr, 0);
            }
            Err(e) => reply.error(e.into()),
        }
    }

    #[tracing::instrument(level = "info", skip(self, _req, reply), fields(parent, name = ?name))]
    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self
            .child_path(parent, name)
            .and_then(|path| self.remove_entry(&path, true))
        {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    #[tracing::instrument(level = "info", skip(self, _req, reply), fields(parent, name = ?name))]
    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self
            .child_path(parent, name)
            .and_then(|path| self.remove_entry(&path, false))
        {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    #[tracing::instrument(level = "info", skip(self, _req, reply), fields(parent, name = ?name, newparent, newname = ?newname))]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let paths = self
            .child_path(parent, name)
            .and_then(|old| Ok((old, self.child_path(newparent, newname)?)));
        let (old, new) = match paths {
            Ok(paths) => paths,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let node = match self.driver.resolve(&old) {
            Ok(node) => node,
            Err(e) => {
                reply.error(e.into());
                return;
            }
        };
        let replace = flags & RENAME_NOREPLACE == 0;
        match self.driver.rename(&node, &old, &new, replace) {
            Ok(()) => {
                self.inodes.rename(&old, &new);
                reply.ok();
            }
            Err(e) => {
                debug!(from = %old, to = %new, error = %e, "rename failed");
                reply.error(e.into());
            }
        }
    }

    #[tracing::instrument(level = "info", skip(self, _req, reply), fields(parent, name = ?name, mode, flags))]
    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let opened = match self.driver.create(&path, false, 0) {
            Ok(opened) => opened,
            Err(e) => {
                reply.error(e.into());
                return;
            }
        };
        if mode & 0o222 == 0 {
            let basic = BasicInfo {
                attributes: attributes_for_mode(opened.info.attributes, mode),
                ..BasicInfo::default()
            };
            if let Err(e) = self.driver.set_basic_info(&opened.node, basic) {
                debug!(path = %path, error = %e, "could not apply mode");
            }
        }

        let attr = self.attr_of(&opened.node, &opened.node.info());
        let fh = self.alloc_fh();
        self.files.insert(
            fh,
            OpenFile {
                node: opened.node,
                modified: true,
            },
        );
        debug!(path = %path, fh, flags, "created");
        reply.created(&self.attr_ttl, &attr, 0, fh, self.open_flags());
    }
}
