//! Versioned store: append-only, ordered history per block.
//!
//! Every block is a linear chain of full-body [`Version`]s. `commit` is the
//! only way the head moves, and it is serialized per block. History is never
//! rewritten; `restore` appends a copy of an old body.
//!
//! # Backends
//!
//! | Backend | Storage |
//! |---------|---------|
//! | [`MemoryVersionStore`] | `DashMap` of chains, process lifetime |
//! | [`DbVersionStore`] | SQLite via [`StoreDb`](crate::db::StoreDb) |

mod memory;
mod sqlite;

pub use memory::MemoryVersionStore;
pub use sqlite::DbVersionStore;

use std::collections::HashSet;

use kioku_types::{Block, BlockKey, ProposalId, Version, VersionId};

use crate::error::{Result, StoreError};

/// Arguments for appending a version.
#[derive(Debug, Clone)]
pub struct NewVersion<'a> {
    pub body: &'a str,
    pub message: &'a str,
    pub author: &'a str,
    /// Commit only if the head is still this version.
    pub expected_head: Option<VersionId>,
    pub source_proposal: Option<ProposalId>,
}

impl<'a> NewVersion<'a> {
    pub fn new(body: &'a str, message: &'a str, author: &'a str) -> Self {
        Self {
            body,
            message,
            author,
            expected_head: None,
            source_proposal: None,
        }
    }

    pub fn on_head(mut self, head: VersionId) -> Self {
        self.expected_head = Some(head);
        self
    }

    pub fn from_proposal(mut self, id: ProposalId) -> Self {
        self.source_proposal = Some(id);
        self
    }
}

/// Message recorded on the root version of a new block.
pub const CREATE_MESSAGE: &str = "create";

/// Durable, ordered history of block bodies.
pub trait VersionedStore: Send + Sync {
    /// Create a block whose root version is `root`, in one atomic write.
    ///
    /// `root.expected_head` is ignored. Fails with `AlreadyExists` and
    /// writes nothing if the block exists.
    fn create_from(&self, key: &BlockKey, root: NewVersion<'_>) -> Result<(Block, Version)>;

    /// Head of a block.
    fn current(&self, key: &BlockKey) -> Result<(Block, Version)>;

    /// Append a version on top of the head, atomically moving the head.
    ///
    /// With `expected_head` set, fails with `HeadMoved` if another commit
    /// landed first. Lock contention fails with `Busy`.
    fn commit_from(&self, key: &BlockKey, new: NewVersion<'_>) -> Result<Version>;

    /// Versions newest-first, at most `limit`. Empty for `limit == 0`.
    fn history(&self, key: &BlockKey, limit: usize) -> Result<Vec<Version>>;

    /// A specific version of this block.
    fn at(&self, key: &BlockKey, version_id: VersionId) -> Result<Version>;

    /// All blocks of an owner, sorted by label.
    fn list_blocks(&self, owner_id: &str) -> Result<Vec<Block>>;

    /// Version produced by approving `proposal`, if one was committed.
    fn find_by_proposal(&self, key: &BlockKey, proposal: ProposalId) -> Result<Option<Version>>;

    /// Create a block with its root version. Author is the owner.
    fn create_block(&self, key: &BlockKey, initial_body: &str) -> Result<Block> {
        let (block, _) = self.create_from(key, NewVersion::new(initial_body, CREATE_MESSAGE, &key.owner_id))?;
        Ok(block)
    }

    /// Append a version on whatever the head currently is.
    fn commit(&self, key: &BlockKey, new_body: &str, message: &str, author: &str) -> Result<Version> {
        self.commit_from(key, NewVersion::new(new_body, message, author))
    }

    /// Append a new version whose body equals `version_id`'s body.
    fn restore(&self, key: &BlockKey, version_id: VersionId, author: &str) -> Result<Version> {
        let target = self.at(key, version_id)?;
        let message = restore_message(version_id);
        let version = self.commit(key, &target.body, &message, author)?;
        tracing::info!(block = %key, restored = %version_id, version = %version.id, "restored version");
        Ok(version)
    }

    fn exists(&self, key: &BlockKey) -> Result<bool> {
        match self.current(key) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Message recorded by `restore`.
pub fn restore_message(version_id: VersionId) -> String {
    format!("restore to {version_id}")
}

/// Check a newest-first slice of a chain against its head.
///
/// `complete` means the slice is the whole history, so it must end at a root
/// with `seq == 1`.
pub fn verify_chain(key: &BlockKey, head: VersionId, versions: &[Version], complete: bool) -> Result<()> {
    let Some(first) = versions.first() else {
        return Err(StoreError::corrupt(key, "block has no versions"));
    };
    if first.id != head {
        return Err(StoreError::corrupt(
            key,
            format!("head {} is not the newest version {}", head, first.id),
        ));
    }

    let mut seen = HashSet::with_capacity(versions.len());
    for (i, v) in versions.iter().enumerate() {
        if !seen.insert(v.id) {
            return Err(StoreError::corrupt(key, format!("version {} repeats", v.id)));
        }
        match versions.get(i + 1) {
            Some(next) => {
                if v.parent_version != Some(next.id) {
                    return Err(StoreError::corrupt(
                        key,
                        format!("version {} does not link to {}", v.id, next.id),
                    ));
                }
                if next.seq + 1 != v.seq {
                    return Err(StoreError::corrupt(
                        key,
                        format!("seq gap between {} and {}", next.seq, v.seq),
                    ));
                }
            }
            None => {
                let at_root = v.seq == 1;
                if at_root != v.parent_version.is_none() {
                    return Err(StoreError::corrupt(
                        key,
                        format!("version {} (seq {}) has a dangling parent link", v.id, v.seq),
                    ));
                }
                if complete && !at_root {
                    return Err(StoreError::corrupt(
                        key,
                        format!("history ends at seq {} instead of the root", v.seq),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Log a corrupt chain with full context; other blocks are unaffected.
pub(crate) fn report_corrupt<T>(result: Result<T>) -> Result<T> {
    if let Err(StoreError::Corrupt { key, detail }) = &result {
        tracing::error!(owner = %key.owner_id, label = %key.label, %detail, "version chain corrupt");
    }
    result
}
