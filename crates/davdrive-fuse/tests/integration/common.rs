//! Shared helpers for driver integration tests
//!
//! [`MockRepository`] is an in-memory WebDAV server rooted at `/dav` that
//! counts calls and can be told to fail. [`Harness`] wires a [`DavDriver`]
//! to it and turns pending completions back into plain results.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use davdrive_core::{
    config::ConfigBuilder,
    ports::{IRemoteRepository, RemoteError, RemoteItem, UploadSource},
};
use davdrive_fuse::{
    callbacks::PendingReply, ChannelObserver, Completion, DavDriver, DirectoryCursor, DriveError,
    DriveEvent, FileNode, FileSystemCallbacks, PendingReplies, WriteOutcome, WriteRequest,
};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::{runtime::Runtime, sync::mpsc};

/// Repository path of the document library.
pub const ROOT: &str = "/dav";

const SERVER: &str = "https://dav.example.com";

// ============================================================================
// MockRepository
// ============================================================================

#[derive(Debug, Clone)]
struct Entry {
    is_dir: bool,
    content: Vec<u8>,
    version: u64,
}

impl Entry {
    fn dir() -> Self {
        Self {
            is_dir: true,
            content: Vec::new(),
            version: 0,
        }
    }

    fn file(content: Vec<u8>) -> Self {
        Self {
            is_dir: false,
            content,
            version: 1,
        }
    }
}

/// An injected failure and how many more calls it applies to.
struct Failure {
    error: RemoteError,
    remaining: Option<usize>,
}

/// In-memory repository keyed by repository path.
pub struct MockRepository {
    entries: Mutex<BTreeMap<String, Entry>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    failures: Mutex<HashMap<&'static str, Failure>>,
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
}

impl Default for MockRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRepository {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(ROOT.to_string(), Entry::dir());
        Self {
            entries: Mutex::new(entries),
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            uploads: Mutex::new(Vec::new()),
        }
    }

    /// Adds a file at `relative` (e.g. `"docs/a.txt"`).
    pub fn add_file(&self, relative: &str, content: &[u8]) {
        self.entries
            .lock()
            .insert(key(relative), Entry::file(content.to_vec()));
    }

    pub fn add_dir(&self, relative: &str) {
        self.entries.lock().insert(key(relative), Entry::dir());
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.entries.lock().contains_key(&key(relative))
    }

    /// Content of the file at `relative`, if it is a file.
    pub fn content(&self, relative: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .get(&key(relative))
            .filter(|entry| !entry.is_dir)
            .map(|entry| entry.content.clone())
    }

    /// Number of calls made to `method`.
    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().get(method).copied().unwrap_or(0)
    }

    /// Every completed upload as `(repository path, body)`.
    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.uploads.lock().clone()
    }

    /// Makes every call to `method` fail with `error`.
    pub fn fail(&self, method: &'static str, error: RemoteError) {
        self.failures.lock().insert(
            method,
            Failure {
                error,
                remaining: None,
            },
        );
    }

    /// Makes the next `times` calls to `method` fail with `error`.
    pub fn fail_times(&self, method: &'static str, error: RemoteError, times: usize) {
        self.failures.lock().insert(
            method,
            Failure {
                error,
                remaining: Some(times),
            },
        );
    }

    pub fn heal(&self, method: &'static str) {
        self.failures.lock().remove(method);
    }

    /// Counts the call and returns the injected failure, if any.
    fn enter(&self, method: &'static str) -> Result<(), RemoteError> {
        *self.calls.lock().entry(method).or_insert(0) += 1;
        let mut failures = self.failures.lock();
        let Some(failure) = failures.get_mut(method) else {
            return Ok(());
        };
        let error = failure.error.clone();
        match failure.remaining.as_mut() {
            Some(0) => {
                failures.remove(method);
                return Ok(());
            }
            Some(remaining) => {
                *remaining -= 1;
                if *remaining == 0 {
                    failures.remove(method);
                }
            }
            None => {}
        }
        Err(error)
    }

    fn item(path: &str, entry: &Entry) -> RemoteItem {
        if entry.is_dir {
            RemoteItem::collection(format!("{}{}/", SERVER, path))
        } else {
            let mut item = RemoteItem::file(format!("{}{}", SERVER, path), entry.content.len() as u64);
            item.etag = Some(format!("\"{}-{}\"", entry.content.len(), entry.version));
            item
        }
    }

    fn store(&self, path: String, content: Vec<u8>) -> Result<(), RemoteError> {
        let mut entries = self.entries.lock();
        let parent = parent_of(&path);
        if !entries.get(parent).is_some_and(|entry| entry.is_dir) {
            return Err(RemoteError::Conflict(format!("no parent for {}", path)));
        }
        let version = entries.get(&path).map_or(0, |entry| entry.version) + 1;
        entries.insert(
            path.clone(),
            Entry {
                is_dir: false,
                content: content.clone(),
                version,
            },
        );
        drop(entries);
        self.uploads.lock().push((path, content));
        Ok(())
    }

    fn remove_tree(entries: &mut BTreeMap<String, Entry>, path: &str) {
        let prefix = format!("{}/", path);
        entries.retain(|key, _| key != path && !key.starts_with(&prefix));
    }
}

fn key(relative: &str) -> String {
    let relative = relative.trim_matches('/');
    if relative.is_empty() {
        ROOT.to_string()
    } else {
        format!("{}/{}", ROOT, relative)
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(index) => &path[..index],
    }
}

#[async_trait]
impl IRemoteRepository for MockRepository {
    async fn list(&self, path: &str) -> Result<Vec<RemoteItem>, RemoteError> {
        self.enter("list")?;
        let path = normalize(path);
        let entries = self.entries.lock();
        let Some(own) = entries.get(&path) else {
            return Err(RemoteError::NotFound(path));
        };
        let mut items = vec![Self::item(&path, own)];
        if own.is_dir {
            items.extend(
                entries
                    .iter()
                    .filter(|(key, _)| key.as_str() != path && parent_of(key) == path)
                    .map(|(key, entry)| Self::item(key, entry)),
            );
        }
        Ok(items)
    }

    async fn get_item(&self, path: &str) -> Result<RemoteItem, RemoteError> {
        self.enter("get_item")?;
        let path = normalize(path);
        self.entries
            .lock()
            .get(&path)
            .map(|entry| Self::item(&path, entry))
            .ok_or(RemoteError::NotFound(path))
    }

    async fn upload(
        &self,
        parent: &str,
        name: &str,
        content: UploadSource,
    ) -> Result<bool, RemoteError> {
        self.enter("upload")?;
        let body = content.read_to_end().await;
        self.store(format!("{}/{}", normalize(parent), name), body)?;
        Ok(true)
    }

    async fn upload_partial(
        &self,
        parent: &str,
        name: &str,
        offset: u64,
        content: UploadSource,
    ) -> Result<bool, RemoteError> {
        self.enter("upload_partial")?;
        let body = content.read_to_end().await;
        let path = format!("{}/{}", normalize(parent), name);
        let mut merged = self
            .entries
            .lock()
            .get(&path)
            .map(|entry| entry.content.clone())
            .unwrap_or_default();
        let start = offset as usize;
        if merged.len() < start + body.len() {
            merged.resize(start + body.len(), 0);
        }
        merged[start..start + body.len()].copy_from_slice(&body);
        self.store(path, merged)?;
        Ok(true)
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, RemoteError> {
        self.enter("download")?;
        let path = normalize(path);
        self.entries
            .lock()
            .get(&path)
            .filter(|entry| !entry.is_dir)
            .map(|entry| entry.content.clone())
            .ok_or(RemoteError::NotFound(path))
    }

    async fn download_partial(
        &self,
        path: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, RemoteError> {
        self.enter("download_partial")?;
        let path = normalize(path);
        let entries = self.entries.lock();
        let Some(entry) = entries.get(&path).filter(|entry| !entry.is_dir) else {
            return Err(RemoteError::NotFound(path));
        };
        let len = entry.content.len() as u64;
        if start >= len {
            return Err(RemoteError::RangeNotSatisfiable);
        }
        let last = end.min(len - 1);
        Ok(entry.content[start as usize..=last as usize].to_vec())
    }

    async fn create_directory(&self, parent: &str, name: &str) -> Result<bool, RemoteError> {
        self.enter("create_directory")?;
        let parent = normalize(parent);
        let path = format!("{}/{}", parent, name);
        let mut entries = self.entries.lock();
        if !entries.get(&parent).is_some_and(|entry| entry.is_dir) || entries.contains_key(&path)
        {
            return Err(RemoteError::Conflict(path));
        }
        entries.insert(path, Entry::dir());
        Ok(true)
    }

    async fn delete_file(&self, path: &str) -> Result<(), RemoteError> {
        self.enter("delete_file")?;
        let path = normalize(path);
        let mut entries = self.entries.lock();
        if !entries.contains_key(&path) {
            return Err(RemoteError::NotFound(path));
        }
        Self::remove_tree(&mut entries, &path);
        Ok(())
    }

    async fn delete_directory(&self, path: &str) -> Result<(), RemoteError> {
        self.enter("delete_directory")?;
        let path = normalize(path);
        let mut entries = self.entries.lock();
        if !entries.contains_key(&path) {
            return Err(RemoteError::NotFound(path));
        }
        Self::remove_tree(&mut entries, &path);
        Ok(())
    }

    async fn move_item(&self, source: &str, destination: &str) -> Result<bool, RemoteError> {
        self.enter("move_item")?;
        let source = normalize(source);
        let destination = normalize(destination);
        let mut entries = self.entries.lock();
        if !entries.contains_key(&source) {
            return Err(RemoteError::NotFound(source));
        }
        if !entries.contains_key(parent_of(&destination)) {
            return Err(RemoteError::Conflict(destination));
        }

        Self::remove_tree(&mut entries, &destination);
        let prefix = format!("{}/", source);
        let moved: Vec<String> = entries
            .keys()
            .filter(|key| **key == source || key.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(entry) = entries.remove(&old) {
                let new = format!("{}{}", destination, &old[source.len()..]);
                entries.insert(new, entry);
            }
        }
        Ok(true)
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A driver bound to a mock repository.
pub struct Harness {
    pub remote: Arc<MockRepository>,
    pub replies: Arc<PendingReplies>,
    pub driver: DavDriver,
    pub events: mpsc::UnboundedReceiver<DriveEvent>,
    pub recovery: TempDir,
    // Dropped last so background tasks outlive the driver
    pub rt: Runtime,
}

impl Harness {
    /// Driver over an empty repository with the default test configuration.
    pub fn new() -> Self {
        Self::with(|builder| builder)
    }

    /// Driver over an empty repository; `configure` adjusts the configuration.
    pub fn with(configure: impl FnOnce(ConfigBuilder) -> ConfigBuilder) -> Self {
        Self::with_remote(Arc::new(MockRepository::new()), configure)
    }

    /// Driver over an existing repository.
    pub fn with_remote(
        remote: Arc<MockRepository>,
        configure: impl FnOnce(ConfigBuilder) -> ConfigBuilder,
    ) -> Self {
        let rt = Runtime::new().expect("runtime");
        let recovery = tempfile::tempdir().expect("recovery dir");
        let config = configure(
            ConfigBuilder::new()
                .repository_url(format!("{}{}/", SERVER, ROOT))
                .credentials("alice", "secret")
                .preloading(false)
                .flush_retries(0, 0)
                .recovery_dir(recovery.path().to_path_buf()),
        )
        .build();

        let (observer, events) = ChannelObserver::new();
        let replies = Arc::new(PendingReplies::new());
        let driver = DavDriver::new(
            config,
            remote.clone(),
            Arc::new(observer),
            replies.clone(),
            rt.handle().clone(),
        )
        .expect("driver");

        Self {
            remote,
            replies,
            driver,
            events,
            recovery,
            rt,
        }
    }

    /// Reads through the driver, waiting for a pending completion.
    pub fn read(&self, node: &Arc<FileNode>, offset: u64, length: u32) -> Result<Vec<u8>, DriveError> {
        let (token, rx) = self.replies.register();
        match self.driver.read(node, offset, length, token) {
            Ok(Completion::Ready(data)) => {
                self.replies.cancel(token);
                Ok(data)
            }
            Ok(Completion::Pending(_)) => match self.rt.block_on(rx) {
                Ok(PendingReply::Read(result)) => result,
                other => panic!("unexpected read reply: {:?}", other),
            },
            Err(e) => {
                self.replies.cancel(token);
                Err(e)
            }
        }
    }

    /// Writes through the driver, waiting for a pending completion.
    pub fn write_request(
        &self,
        node: &Arc<FileNode>,
        request: WriteRequest<'_>,
    ) -> Result<WriteOutcome, DriveError> {
        let (token, rx) = self.replies.register();
        match self.driver.write(node, request, token) {
            Ok(Completion::Ready(outcome)) => {
                self.replies.cancel(token);
                Ok(outcome)
            }
            Ok(Completion::Pending(_)) => match self.rt.block_on(rx) {
                Ok(PendingReply::Write(result)) => result,
                other => panic!("unexpected write reply: {:?}", other),
            },
            Err(e) => {
                self.replies.cancel(token);
                Err(e)
            }
        }
    }

    pub fn write(&self, node: &Arc<FileNode>, offset: u64, data: &[u8]) -> Result<WriteOutcome, DriveError> {
        self.write_request(node, WriteRequest::at(offset, data))
    }

    /// Names of a full directory scan, optionally resuming after `marker`.
    pub fn list_names(&self, dir: &Arc<FileNode>, marker: Option<&str>) -> Result<Vec<String>, DriveError> {
        let mut cursor: Option<DirectoryCursor> = None;
        let mut names = Vec::new();
        while let Some(entry) = self.driver.read_directory_entry(dir, marker, &mut cursor)? {
            names.push(entry.name);
        }
        Ok(names)
    }

    /// Every event observed so far.
    pub fn drain_events(&mut self) -> Vec<DriveEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
