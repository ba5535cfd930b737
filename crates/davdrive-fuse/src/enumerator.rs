//! Directory enumeration cursor.
//!
//! Hosts enumerate a directory through repeated callbacks, each asking for
//! the next entry. The listing is computed once per scan and walked by a
//! [`DirectoryCursor`] that the host keeps between those calls.

use uuid::Uuid;

use crate::cache::DirectoryEntry;

/// Position within one directory scan.
#[derive(Debug, Clone)]
pub struct DirectoryCursor {
    operation_id: Uuid,
    entries: Vec<DirectoryEntry>,
    position: usize,
}

impl DirectoryCursor {
    pub fn new(entries: Vec<DirectoryEntry>) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            entries,
            position: 0,
        }
    }

    /// Identifies the scan in logs.
    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    /// Index of the entry [`next_entry`](Self::next_entry) returns.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_exhausted(&self) -> bool {
        self.position >= self.entries.len()
    }

    /// Moves to `position`, clamped to the end of the listing.
    pub fn seek(&mut self, position: usize) {
        self.position = position.min(self.entries.len());
    }

    pub fn next_entry(&mut self) -> Option<DirectoryEntry> {
        let entry = self.entries.get(self.position).cloned()?;
        self.position += 1;
        Some(entry)
    }
}
