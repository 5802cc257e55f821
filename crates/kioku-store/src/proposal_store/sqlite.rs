//! SQLite-backed proposal store.

use kioku_types::{BlockKey, Proposal, ProposalId, now_millis};

use super::{ProposalStore, Transition, apply_transition};
use crate::db::SharedDb;
use crate::error::{Result, StoreError};

/// Proposal store over a shared [`StoreDb`](crate::db::StoreDb).
pub struct DbProposalStore {
    db: SharedDb,
}

impl DbProposalStore {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }
}

impl ProposalStore for DbProposalStore {
    fn save(&self, proposal: &Proposal) -> Result<()> {
        Ok(self.db.lock().insert_proposal(proposal)?)
    }

    fn get(&self, id: ProposalId) -> Result<Proposal> {
        self.db
            .lock()
            .load_proposal(id)?
            .ok_or_else(|| StoreError::proposal_not_found(id))
    }

    fn list_pending(&self, owner_id: &str, block_label: Option<&str>) -> Result<Vec<Proposal>> {
        Ok(self.db.lock().list_pending(owner_id, block_label)?)
    }

    fn count_pending(&self, owner_id: &str, block_label: Option<&str>) -> Result<usize> {
        Ok(self.db.lock().count_pending(owner_id, block_label)?)
    }

    fn transition(&self, id: ProposalId, transition: Transition) -> Result<Proposal> {
        let db = self.db.lock();
        let mut proposal = db
            .load_proposal(id)?
            .ok_or_else(|| StoreError::proposal_not_found(id))?;
        let from = proposal.status;
        if !apply_transition(&mut proposal, &transition)? {
            return Ok(proposal);
        }
        if !db.record_review(&proposal)? {
            // Row left pending between load and update (another process).
            return Err(StoreError::InvalidTransition {
                id,
                from,
                to: transition.to,
            });
        }
        Ok(proposal)
    }

    fn supersede_siblings(&self, key: &BlockKey, keep: ProposalId) -> Result<Vec<ProposalId>> {
        Ok(self.db.lock().supersede_pending(key, keep, now_millis())?)
    }

    fn pending_created_before(&self, cutoff: u64) -> Result<Vec<Proposal>> {
        Ok(self.db.lock().pending_created_before(cutoff)?)
    }

    fn purge_terminal(&self, cutoff: u64) -> Result<usize> {
        Ok(self.db.lock().delete_terminal_before(cutoff)?)
    }
}
