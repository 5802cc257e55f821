//! Blocks and their immutable versions.
//!
//! A [`Block`] is a directory entry: it names a document and points at its
//! head [`Version`]. Versions always carry the *full* body, never a delta, and
//! link to their parent so the history forms a single chain from head to root.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{ProposalId, VersionId};

/// Longest accepted block label.
pub const MAX_LABEL_LEN: usize = 128;

/// Address of a block: unique label within an owner's scope.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BlockKey {
    pub owner_id: String,
    pub label: String,
}

/// Why a label was refused at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    #[error("label is empty")]
    Empty,
    #[error("label is longer than {MAX_LABEL_LEN} characters")]
    TooLong,
    #[error("label contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("owner id is empty")]
    EmptyOwner,
}

impl BlockKey {
    /// Build a key without validation (callers inside the store that already
    /// hold a validated key).
    pub fn new(owner_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            label: label.into(),
        }
    }

    /// Build a key, rejecting labels outside `[A-Za-z0-9_.-]{1,128}`.
    pub fn parse(owner_id: &str, label: &str) -> Result<Self, LabelError> {
        if owner_id.is_empty() {
            return Err(LabelError::EmptyOwner);
        }
        if label.is_empty() {
            return Err(LabelError::Empty);
        }
        if label.chars().count() > MAX_LABEL_LEN {
            return Err(LabelError::TooLong);
        }
        if let Some(bad) = label
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(LabelError::InvalidChar(bad));
        }
        Ok(Self::new(owner_id, label))
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.label)
    }
}

/// A named, owned, mutable document. Never observed without a head version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub label: String,
    pub owner_id: String,
    pub current_version: VersionId,
    /// Sequence number of the head version (1 for a fresh block).
    pub version_count: u64,
    pub created_at: u64,
}

impl Block {
    pub fn key(&self) -> BlockKey {
        BlockKey::new(&self.owner_id, &self.label)
    }
}

/// Immutable snapshot in a block's history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub block_label: String,
    pub owner_id: String,
    /// 1-based position in the block's history; strictly increasing.
    pub seq: u64,
    pub body: String,
    /// Hex BLAKE3 digest of `body`.
    pub content_hash: String,
    pub message: String,
    /// Human id, or `agent:<agent_id>` for approved proposals.
    pub author: String,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_version: Option<VersionId>,
    /// Proposal whose approval produced this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_proposal: Option<ProposalId>,
}

impl Version {
    /// Build the next version on top of `parent` (or a root when `None`).
    pub fn next(
        key: &BlockKey,
        parent: Option<&Version>,
        body: impl Into<String>,
        message: impl Into<String>,
        author: impl Into<String>,
        source_proposal: Option<ProposalId>,
    ) -> Self {
        let body = body.into();
        Self {
            id: VersionId::new(),
            block_label: key.label.clone(),
            owner_id: key.owner_id.clone(),
            seq: parent.map(|p| p.seq + 1).unwrap_or(1),
            content_hash: content_hash(&body),
            body,
            message: message.into(),
            author: author.into(),
            created_at: crate::now_millis(),
            parent_version: parent.map(|p| p.id),
            source_proposal,
        }
    }

    pub fn key(&self) -> BlockKey {
        BlockKey::new(&self.owner_id, &self.block_label)
    }

    pub fn is_root(&self) -> bool {
        self.parent_version.is_none()
    }

    pub fn summary(&self) -> VersionSummary {
        VersionSummary::from(self)
    }
}

/// A version without its body, for history listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub id: VersionId,
    pub seq: u64,
    pub message: String,
    pub author: String,
    pub created_at: u64,
    pub parent_version: Option<VersionId>,
    pub content_hash: String,
    pub body_len: usize,
}

impl From<&Version> for VersionSummary {
    fn from(v: &Version) -> Self {
        Self {
            id: v.id,
            seq: v.seq,
            message: v.message.clone(),
            author: v.author.clone(),
            created_at: v.created_at,
            parent_version: v.parent_version,
            content_hash: v.content_hash.clone(),
            body_len: v.body.len(),
        }
    }
}

/// Hex BLAKE3 digest of a body.
pub fn content_hash(body: &str) -> String {
    blake3::hash(body.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_validation() {
        assert!(BlockKey::parse("u1", "student").is_ok());
        assert!(BlockKey::parse("u1", "goals.v2_draft-1").is_ok());
        assert_eq!(BlockKey::parse("u1", ""), Err(LabelError::Empty));
        assert_eq!(BlockKey::parse("", "student"), Err(LabelError::EmptyOwner));
        assert_eq!(
            BlockKey::parse("u1", "a/b"),
            Err(LabelError::InvalidChar('/'))
        );
        assert_eq!(
            BlockKey::parse("u1", &"x".repeat(MAX_LABEL_LEN + 1)),
            Err(LabelError::TooLong)
        );
    }

    #[test]
    fn test_next_links_parent() {
        let key = BlockKey::new("u1", "student");
        let root = Version::next(&key, None, "Name: Alice", "create", "u1", None);
        assert_eq!(root.seq, 1);
        assert!(root.is_root());

        let child = Version::next(&key, Some(&root), "Name: Alicia", "edit", "u1", None);
        assert_eq!(child.seq, 2);
        assert_eq!(child.parent_version, Some(root.id));
        assert_eq!(child.key(), key);
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("").len(), 64);
    }

    #[test]
    fn test_summary_drops_body() {
        let key = BlockKey::new("u1", "notes");
        let v = Version::next(&key, None, "hello", "create", "u1", None);
        let s = v.summary();
        assert_eq!(s.body_len, 5);
        assert_eq!(s.id, v.id);
        assert_eq!(s.content_hash, v.content_hash);
    }
}
