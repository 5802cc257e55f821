//! In-memory proposal store.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use kioku_types::{BlockKey, Proposal, ProposalId, ProposalStatus, now_millis};

use super::{ProposalStore, Transition, apply_transition};
use crate::error::{Result, StoreError};

#[derive(Default)]
pub struct MemoryProposalStore {
    proposals: DashMap<ProposalId, Proposal>,
}

impl MemoryProposalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect_sorted(&self, filter: impl Fn(&Proposal) -> bool) -> Vec<Proposal> {
        let mut out: Vec<Proposal> = self
            .proposals
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }
}

impl ProposalStore for MemoryProposalStore {
    fn save(&self, proposal: &Proposal) -> Result<()> {
        match self.proposals.entry(proposal.id) {
            Entry::Occupied(_) => Err(StoreError::Corrupt {
                key: proposal.key(),
                detail: format!("proposal {} saved twice", proposal.id),
            }),
            Entry::Vacant(slot) => {
                slot.insert(proposal.clone());
                Ok(())
            }
        }
    }

    fn get(&self, id: ProposalId) -> Result<Proposal> {
        self.proposals
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or_else(|| StoreError::proposal_not_found(id))
    }

    fn list_pending(&self, owner_id: &str, block_label: Option<&str>) -> Result<Vec<Proposal>> {
        Ok(self.collect_sorted(|p| {
            p.is_pending()
                && p.owner_id == owner_id
                && block_label.is_none_or(|label| p.block_label == label)
        }))
    }

    fn transition(&self, id: ProposalId, transition: Transition) -> Result<Proposal> {
        let mut entry = self
            .proposals
            .get_mut(&id)
            .ok_or_else(|| StoreError::proposal_not_found(id))?;
        apply_transition(entry.value_mut(), &transition)?;
        Ok(entry.value().clone())
    }

    fn supersede_siblings(&self, key: &BlockKey, keep: ProposalId) -> Result<Vec<ProposalId>> {
        let now = now_millis();
        let mut superseded: Vec<(u64, ProposalId)> = Vec::new();
        for mut entry in self.proposals.iter_mut() {
            let p = entry.value_mut();
            if p.id != keep
                && p.is_pending()
                && p.owner_id == key.owner_id
                && p.block_label == key.label
            {
                p.status = ProposalStatus::Superseded;
                p.reviewed_at = Some(now);
                superseded.push((p.created_at, p.id));
            }
        }
        superseded.sort();
        Ok(superseded.into_iter().map(|(_, id)| id).collect())
    }

    fn pending_created_before(&self, cutoff: u64) -> Result<Vec<Proposal>> {
        Ok(self.collect_sorted(|p| p.is_pending() && p.created_at < cutoff))
    }

    fn purge_terminal(&self, cutoff: u64) -> Result<usize> {
        let before = self.proposals.len();
        self.proposals
            .retain(|_, p| p.is_pending() || p.reviewed_at.is_none_or(|t| t >= cutoff));
        Ok(before - self.proposals.len())
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;

    #[test]
    fn test_save_and_get() {
        contract::save_and_get(&MemoryProposalStore::new());
    }

    #[test]
    fn test_pending_is_scoped_and_ordered() {
        contract::pending_is_scoped_and_ordered(&MemoryProposalStore::new());
    }

    #[test]
    fn test_transitions_are_one_way() {
        contract::transitions_are_one_way(&MemoryProposalStore::new());
    }

    #[test]
    fn test_repeated_approval_is_idempotent() {
        contract::repeated_approval_is_idempotent(&MemoryProposalStore::new());
    }

    #[test]
    fn test_supersede_leaves_keeper() {
        contract::supersede_leaves_keeper(&MemoryProposalStore::new());
    }

    #[test]
    fn test_expiry_and_purge() {
        contract::expiry_and_purge(&MemoryProposalStore::new());
    }
}
