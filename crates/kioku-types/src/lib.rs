//! Shared types for kioku: versioned memory blocks with agent proposals.
//!
//! This is the leaf crate: typed ids, blocks, versions, proposals and the
//! closed set of edit operations an agent may propose. It has **no internal
//! kioku dependencies**.
//!
//! # Entity Overview
//!
//! ```text
//! Owner (owner_id) ← user / tenant, derived outside kioku
//!     └── owns Block (label unique per owner)
//!             └── history of Version (VersionId, seq 1..=n, parent chain)
//!             └── queue of Proposal (ProposalId, pending until reviewed)
//! ```
//!
//! |-------------------|----------------------------------------------|
//! | Type              | Purpose                                      |
//! |-------------------|----------------------------------------------|
//! | [`BlockKey`]      | `(owner_id, label)` address of a block       |
//! | [`Block`]         | Block directory entry (points at head)       |
//! | [`Version`]       | Immutable full-body snapshot                 |
//! | [`Proposal`]      | Agent-suggested edit awaiting review         |
//! | [`EditOperation`] | Append / ReplaceSubstring / FullReplace      |
//! |-------------------|----------------------------------------------|

pub mod block;
pub mod ids;
pub mod proposal;

pub use block::{Block, BlockKey, LabelError, Version, VersionSummary, content_hash};
pub use ids::{ProposalId, VersionId};
pub use proposal::{
    Confidence, EditOperation, OperationError, Proposal, ProposalStatus, ProposalSummary, Strategy,
};

/// Author prefix for versions committed on behalf of an agent.
pub const AGENT_AUTHOR_PREFIX: &str = "agent:";

/// Format the author string recorded for an agent's approved proposal.
pub fn agent_author(agent_id: &str) -> String {
    format!("{AGENT_AUTHOR_PREFIX}{agent_id}")
}

/// Current time as Unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
