//! Metadata cache.
//!
//! The single source of truth for which entries exist, their metadata and
//! which paths were recently confirmed missing. Nodes are kept in a flat
//! map ordered by local path; a directory's children are a contiguous key
//! range, so subtree operations are range scans instead of tree walks.
//!
//! ## Locking
//!
//! Both maps sit behind one `RwLock`. Node locks may be taken while the
//! cache lock is held, never the other way round.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use davdrive_core::{
    config::Config,
    domain::{
        join_local, local_parent, rebase_local, PathTranslator, ServerDialect, LOCAL_ROOT,
        LOCAL_SEPARATOR,
    },
    ports::{IActionObserver, IRemoteRepository, RemoteError, RemoteItem},
};
use parking_lot::RwLock;
use tokio::{runtime::Handle, sync::watch};
use tracing::{debug, info, warn};

use crate::{
    node::FileNode,
    refresh::{RefreshQueue, RefreshWorker},
};

/// Result of a cache lookup.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// The node is cached
    Found(Arc<FileNode>),
    /// The path was confirmed missing within the missing-path TTL
    Missing,
    /// Nothing is known about the path
    Unknown,
}

impl CacheLookup {
    pub fn node(self) -> Option<Arc<FileNode>> {
        match self {
            CacheLookup::Found(node) => Some(node),
            _ => None,
        }
    }

    pub fn is_known_missing(&self) -> bool {
        matches!(self, CacheLookup::Missing)
    }
}

/// Cache behaviour derived from the configuration.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl: Duration,
    pub missing_ttl: Duration,
    pub preloading: bool,
    pub dialect: ServerDialect,
}

impl CacheSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.cache.enabled,
            ttl: config.cache.ttl(),
            missing_ttl: config.cache.missing_ttl(),
            preloading: config.cache.preloading,
            dialect: config.repository.dialect,
        }
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub name: String,
    pub node: Arc<FileNode>,
}

#[derive(Debug, Default)]
struct CacheMaps {
    nodes: BTreeMap<String, Arc<FileNode>>,
    missing: HashMap<String, Instant>,
}

impl CacheMaps {
    /// Keys strictly below `prefix`, boundary-safe.
    fn descendant_keys(&self, prefix: &str) -> Vec<String> {
        let start = subtree_start(prefix);
        self.nodes
            .range(start.clone()..)
            .take_while(|(key, _)| key.starts_with(&start))
            .filter(|(key, _)| key.as_str() != prefix)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Keys exactly one path segment below `dir`.
    fn child_keys(&self, dir: &str) -> Vec<String> {
        let start = subtree_start(dir);
        self.descendant_keys(dir)
            .into_iter()
            .filter(|key| !key[start.len()..].contains(LOCAL_SEPARATOR))
            .collect()
    }

    /// Removes `path` and everything below it.
    fn remove_tree(&mut self, path: &str) -> usize {
        let mut removed = usize::from(self.nodes.remove(path).is_some());
        for key in self.descendant_keys(path) {
            self.nodes.remove(&key);
            removed += 1;
        }
        removed
    }

    /// Moves the entry at `old` to `new` and rewrites its path fields.
    fn move_entry(&mut self, old: &str, new: &str, translator: &PathTranslator) -> bool {
        match self.nodes.remove(old) {
            Some(node) => {
                node.set_paths(new, translator);
                self.missing.remove(new);
                self.nodes.insert(new.to_string(), node);
                true
            }
            None => false,
        }
    }

    /// Moves every entry strictly below `old` to below `new`.
    fn move_subtree(&mut self, old: &str, new: &str, translator: &PathTranslator) -> usize {
        let mut moved = 0;
        for key in self.descendant_keys(old) {
            if let Some(target) = rebase_local(&key, old, new) {
                if self.move_entry(&key, &target, translator) {
                    moved += 1;
                }
            }
        }
        moved
    }
}

fn subtree_start(prefix: &str) -> String {
    if prefix == LOCAL_ROOT {
        LOCAL_ROOT.to_string()
    } else {
        join_local(prefix, "")
    }
}

// ============================================================================
// MetadataCache
// ============================================================================

/// Index of file nodes and known-missing paths for one mount.
pub struct MetadataCache {
    maps: RwLock<CacheMaps>,
    settings: CacheSettings,
    translator: PathTranslator,
    remote: Arc<dyn IRemoteRepository>,
    observer: Arc<dyn IActionObserver>,
    refresher: RefreshQueue,
    changes: watch::Sender<u64>,
}

impl MetadataCache {
    /// Creates the cache and spawns its refresh worker on `rt`.
    pub fn new(
        settings: CacheSettings,
        translator: PathTranslator,
        remote: Arc<dyn IRemoteRepository>,
        observer: Arc<dyn IActionObserver>,
        rt: &Handle,
    ) -> Arc<Self> {
        let (refresher, receiver) = RefreshQueue::new();
        let (changes, _) = watch::channel(0);
        let cache = Arc::new(Self {
            maps: RwLock::new(CacheMaps::default()),
            settings,
            translator,
            remote,
            observer,
            refresher,
            changes,
        });

        let worker = RefreshWorker::new(receiver, Arc::downgrade(&cache));
        rt.spawn(worker.run());

        info!(
            enabled = cache.settings.enabled,
            ttl_secs = cache.settings.ttl.as_secs(),
            preloading = cache.settings.preloading,
            "Metadata cache created"
        );
        cache
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.translator
    }

    pub fn refresher(&self) -> &RefreshQueue {
        &self.refresher
    }

    /// Subscribes to change notifications; the value counts changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }

    /// False once the cache has been shut down.
    pub fn is_alive(&self) -> bool {
        self.refresher.is_alive()
    }

    pub fn len(&self) -> usize {
        self.maps.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.read().nodes.is_empty()
    }

    // ------------------------------------------------------------------------
    // Point operations
    // ------------------------------------------------------------------------

    /// Looks up a local path.
    pub fn lookup(&self, path: &str) -> CacheLookup {
        if !self.settings.enabled {
            return CacheLookup::Unknown;
        }

        {
            let maps = self.maps.read();
            if let Some(node) = maps.nodes.get(path) {
                return CacheLookup::Found(Arc::clone(node));
            }
            match maps.missing.get(path) {
                None => return CacheLookup::Unknown,
                Some(seen) if seen.elapsed() <= self.settings.missing_ttl => {
                    return CacheLookup::Missing;
                }
                Some(_) => {}
            }
        }

        // Expired missing entry
        let mut maps = self.maps.write();
        if maps
            .missing
            .get(path)
            .is_some_and(|seen| seen.elapsed() > self.settings.missing_ttl)
        {
            maps.missing.remove(path);
        }
        CacheLookup::Unknown
    }

    /// Inserts or replaces a node under its local path.
    pub fn insert(&self, node: Arc<FileNode>) {
        if !self.settings.enabled {
            return;
        }
        let local_path = node.local_path();
        {
            let mut maps = self.maps.write();
            maps.missing.remove(&local_path);
            maps.nodes.insert(local_path, node);
        }
        self.notify();
    }

    /// Removes a node, with its subtree if it is a directory.
    pub fn remove(&self, node: &Arc<FileNode>) {
        let local_path = node.local_path();
        let removed = {
            let mut maps = self.maps.write();
            if maps
                .nodes
                .get(&local_path)
                .is_some_and(|cached| Arc::ptr_eq(cached, node))
            {
                maps.remove_tree(&local_path)
            } else {
                0
            }
        };
        if removed > 0 {
            debug!(local_path = %local_path, removed, "Removed nodes from cache");
            self.notify();
        }
    }

    /// Removes `prefix` and every node below it.
    pub fn remove_subtree(&self, prefix: &str) -> usize {
        let removed = self.maps.write().remove_tree(prefix);
        if removed > 0 {
            self.notify();
        }
        removed
    }

    /// Moves the node at `old` to `new`, rewriting its path fields.
    pub fn rename_key(&self, old: &str, new: &str) -> bool {
        let moved = self.maps.write().move_entry(old, new, &self.translator);
        if moved {
            self.notify();
        }
        moved
    }

    /// Moves every node strictly below `old` to below `new`.
    pub fn rename_subtree(&self, old: &str, new: &str) -> usize {
        let moved = self.maps.write().move_subtree(old, new, &self.translator);
        if moved > 0 {
            self.notify();
        }
        moved
    }

    /// Renames a node and, for directories, its cached descendants.
    ///
    /// Everything happens under one cache lock, so no reader sees a
    /// half-renamed subtree. Stale entries at the destination are dropped.
    pub fn rename_node(&self, node: &Arc<FileNode>, new_path: &str) {
        let old_path = node.local_path();
        {
            let mut maps = self.maps.write();
            let cached = maps
                .nodes
                .get(&old_path)
                .is_some_and(|cached| Arc::ptr_eq(cached, node));

            maps.remove_tree(new_path);
            if cached {
                maps.move_entry(&old_path, new_path, &self.translator);
            } else {
                node.set_paths(new_path, &self.translator);
                if self.settings.enabled {
                    maps.missing.remove(new_path);
                    maps.nodes.insert(new_path.to_string(), Arc::clone(node));
                }
            }
            if node.is_directory() {
                maps.move_subtree(&old_path, new_path, &self.translator);
            }
        }
        debug!(from = %old_path, to = %new_path, "Renamed node in cache");
        self.notify();
    }

    /// Records that `path` does not exist remotely.
    pub fn mark_missing(&self, path: &str) {
        if !self.settings.enabled {
            return;
        }
        let mut maps = self.maps.write();
        maps.remove_tree(path);
        maps.missing.insert(path.to_string(), Instant::now());
    }

    /// Drops a node and forces its parent to be enumerated again.
    pub fn invalidate(&self, node: &Arc<FileNode>) {
        let local_path = node.local_path();
        {
            let mut maps = self.maps.write();
            if maps
                .nodes
                .get(&local_path)
                .is_some_and(|cached| Arc::ptr_eq(cached, node))
            {
                maps.remove_tree(&local_path);
            }
            if let Some(parent) = local_parent(&local_path).and_then(|p| maps.nodes.get(p)) {
                parent.lock().is_parsed = false;
            }
        }
        debug!(local_path = %local_path, "Invalidated node");
        self.notify();
    }

    /// Forgets everything.
    pub fn clear(&self) {
        {
            let mut maps = self.maps.write();
            maps.nodes.clear();
            maps.missing.clear();
        }
        info!("Metadata cache cleared");
        self.notify();
    }

    /// Reacts to rejected credentials: the server's view is unknown now.
    pub fn handle_unauthorized(&self) {
        self.clear();
        self.observer.authentication_failed();
    }

    /// Stops background work and clears the cache.
    pub fn shutdown(&self) {
        self.refresher.shutdown();
        self.clear();
    }

    // ------------------------------------------------------------------------
    // Directory listings
    // ------------------------------------------------------------------------

    /// Lists `dir`, sorted by name, optionally resuming after `marker`.
    ///
    /// An unparsed directory is listed remotely and its children cached.
    /// A parsed one is answered from the cache; a stale listing is
    /// refreshed in the background. Non-root directories include the
    /// `.` and `..` pseudo entries.
    pub async fn directory_listing(
        &self,
        dir: &Arc<FileNode>,
        marker: Option<&str>,
    ) -> Result<Vec<DirectoryEntry>, RemoteError> {
        let (local_path, repository_path, is_parsed, stale) = {
            let state = dir.lock();
            (
                state.local_path.clone(),
                state.repository_path.clone(),
                state.is_parsed,
                state
                    .last_refresh
                    .map_or(true, |refreshed| refreshed.elapsed() > self.settings.ttl),
            )
        };

        let children = if !self.settings.enabled || !is_parsed {
            let items = self.remote.list(&repository_path).await?;
            self.merge_listing(dir, &local_path, &items)
        } else {
            if stale {
                self.refresher.enqueue(&local_path);
            }
            self.cached_children(&local_path)
        };

        let mut entries: Vec<DirectoryEntry> = children
            .into_iter()
            .map(|node| DirectoryEntry {
                name: node.name(),
                node,
            })
            .collect();

        if local_path != LOCAL_ROOT {
            entries.push(DirectoryEntry {
                name: ".".to_string(),
                node: Arc::clone(dir),
            });
            if let Some(parent) = self.parent_node(&local_path).await {
                entries.push(DirectoryEntry {
                    name: "..".to_string(),
                    node: parent,
                });
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(marker) = marker {
            entries.retain(|entry| entry.name.as_str() > marker);
        }

        if self.settings.enabled && self.settings.preloading {
            for entry in &entries {
                if entry.name == "." || entry.name == ".." {
                    continue;
                }
                if entry.node.is_directory() && !entry.node.is_parsed() {
                    self.refresher.enqueue(&entry.node.local_path());
                }
            }
        }

        Ok(entries)
    }

    /// Lists a cached directory again and merges the result.
    ///
    /// Directories that left the cache in the meantime are skipped.
    pub async fn refresh_directory(&self, local_path: &str) -> Result<(), RemoteError> {
        let dir = {
            let maps = self.maps.read();
            match maps.nodes.get(local_path) {
                Some(node) if node.is_directory() => Arc::clone(node),
                _ => return Ok(()),
            }
        };

        let items = self.remote.list(&dir.repository_path()).await?;
        if !self.is_alive() {
            return Ok(());
        }
        self.merge_listing(&dir, local_path, &items);
        Ok(())
    }

    fn cached_children(&self, local_path: &str) -> Vec<Arc<FileNode>> {
        let maps = self.maps.read();
        maps.child_keys(local_path)
            .iter()
            .filter_map(|key| maps.nodes.get(key).cloned())
            .collect()
    }

    async fn parent_node(&self, local_path: &str) -> Option<Arc<FileNode>> {
        let parent_path = local_parent(local_path)?;
        if let CacheLookup::Found(parent) = self.lookup(parent_path) {
            return Some(parent);
        }

        let repository_path = self.translator.local_to_repository(parent_path);
        match self.remote.get_item(&repository_path).await {
            Ok(item) => {
                let node = Arc::new(FileNode::from_remote(
                    &item,
                    &self.translator,
                    self.settings.dialect,
                )?);
                self.insert(Arc::clone(&node));
                Some(node)
            }
            Err(e) => {
                debug!(parent = %parent_path, error = %e, "Parent lookup failed, omitting '..'");
                None
            }
        }
    }

    /// Merges a remote listing of `dir` into the cache.
    ///
    /// Existing nodes keep their identity and get fresh metadata; children
    /// gone from the server are dropped unless they hold local changes.
    /// Nothing is cached when `dir` is no longer the cached node for its
    /// path, which happens after a concurrent `clear`.
    fn merge_listing(
        &self,
        dir: &Arc<FileNode>,
        local_path: &str,
        items: &[RemoteItem],
    ) -> Vec<Arc<FileNode>> {
        let dialect = self.settings.dialect;
        let mut maps = self.maps.write();
        let attached = self.is_alive()
            && maps
                .nodes
                .get(local_path)
                .is_some_and(|cached| Arc::ptr_eq(cached, dir));

        let mut children = Vec::with_capacity(items.len());
        let mut seen = HashSet::with_capacity(items.len());

        for item in items {
            let repository_path = self.translator.href_to_repository(&item.href);
            let Some(child_path) = self.translator.repository_to_local(&repository_path) else {
                warn!(href = %item.href, "Listing entry outside the repository, skipped");
                continue;
            };
            if child_path == local_path || local_parent(&child_path) != Some(local_path) {
                continue;
            }
            if !seen.insert(child_path.clone()) {
                continue;
            }

            if let Some(existing) = maps.nodes.get(&child_path).cloned() {
                if existing.is_directory() == item.is_directory(dialect)
                    || existing.has_unflushed_data()
                {
                    existing.apply_remote(item);
                    children.push(existing);
                    continue;
                }
                if attached {
                    maps.remove_tree(&child_path);
                }
            }

            let Some(node) = FileNode::from_remote(item, &self.translator, dialect) else {
                continue;
            };
            let node = Arc::new(node);
            if attached {
                maps.missing.remove(&child_path);
                maps.nodes.insert(child_path, Arc::clone(&node));
            }
            children.push(node);
        }

        if attached {
            for key in maps.child_keys(local_path) {
                if seen.contains(&key) {
                    continue;
                }
                let keep = maps
                    .nodes
                    .get(&key)
                    .filter(|node| node.has_unflushed_data())
                    .cloned();
                match keep {
                    Some(node) => children.push(node),
                    None => {
                        maps.remove_tree(&key);
                    }
                }
            }

            let mut state = dir.lock();
            state.is_parsed = true;
            state.last_refresh = Some(Instant::now());
        }
        drop(maps);

        if attached {
            self.notify();
        }
        children
    }
}
