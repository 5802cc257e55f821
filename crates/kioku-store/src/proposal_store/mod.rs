//! Proposal store: durable queue of agent suggestions and their outcomes.
//!
//! Proposals are never deleted by a status change. Terminal ones stay as an
//! audit trail until [`ProposalStore::purge_terminal`] drops old rows.

mod memory;
mod sqlite;

pub use memory::MemoryProposalStore;
pub use sqlite::DbProposalStore;

use kioku_types::{BlockKey, Proposal, ProposalId, ProposalStatus, VersionId, now_millis};

use crate::error::{Result, StoreError};

/// A requested status change with its review metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub to: ProposalStatus,
    pub applied_version: Option<VersionId>,
    pub reviewer: Option<String>,
    pub note: Option<String>,
}

impl Transition {
    pub fn approved(version: VersionId, reviewer: impl Into<String>) -> Self {
        Self {
            to: ProposalStatus::Approved,
            applied_version: Some(version),
            reviewer: Some(reviewer.into()),
            note: None,
        }
    }

    pub fn rejected(reviewer: impl Into<String>, note: Option<String>) -> Self {
        Self {
            to: ProposalStatus::Rejected,
            applied_version: None,
            reviewer: Some(reviewer.into()),
            note,
        }
    }

    pub fn expired() -> Self {
        Self {
            to: ProposalStatus::Expired,
            applied_version: None,
            reviewer: None,
            note: None,
        }
    }
}

/// Apply `t` to `p` in place.
///
/// Returns `Ok(false)` when `p` is already approved with the same version
/// (a repeated approval is a no-op). Anything else leaving a terminal state is
/// `InvalidTransition`.
pub fn apply_transition(p: &mut Proposal, t: &Transition) -> Result<bool> {
    if p.status == ProposalStatus::Approved
        && t.to == ProposalStatus::Approved
        && p.applied_version == t.applied_version
    {
        return Ok(false);
    }

    let invalid = StoreError::InvalidTransition {
        id: p.id,
        from: p.status,
        to: t.to,
    };
    if !p.status.can_transition_to(t.to) {
        return Err(invalid);
    }
    // applied_version is set iff Approved.
    if (t.to == ProposalStatus::Approved) != t.applied_version.is_some() {
        return Err(invalid);
    }

    p.status = t.to;
    p.applied_version = t.applied_version;
    p.reviewed_at = Some(now_millis());
    p.reviewed_by = t.reviewer.clone();
    p.review_note = t.note.clone();
    Ok(true)
}

/// Durable record of proposals.
pub trait ProposalStore: Send + Sync {
    /// Persist a new proposal.
    fn save(&self, proposal: &Proposal) -> Result<()>;

    fn get(&self, id: ProposalId) -> Result<Proposal>;

    /// Pending proposals of an owner, optionally for one block, oldest first.
    fn list_pending(&self, owner_id: &str, block_label: Option<&str>) -> Result<Vec<Proposal>>;

    /// Move a pending proposal to a terminal state.
    fn transition(&self, id: ProposalId, transition: Transition) -> Result<Proposal>;

    /// Mark all other pending proposals on `key` superseded.
    fn supersede_siblings(&self, key: &BlockKey, keep: ProposalId) -> Result<Vec<ProposalId>>;

    /// Pending proposals of every owner created before `cutoff` (millis).
    fn pending_created_before(&self, cutoff: u64) -> Result<Vec<Proposal>>;

    /// Delete terminal proposals reviewed before `cutoff`. Returns the count.
    fn purge_terminal(&self, cutoff: u64) -> Result<usize>;

    fn count_pending(&self, owner_id: &str, block_label: Option<&str>) -> Result<usize> {
        Ok(self.list_pending(owner_id, block_label)?.len())
    }
}
