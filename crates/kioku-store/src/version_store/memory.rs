//! In-memory version store.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use kioku_types::{Block, BlockKey, ProposalId, Version, VersionId};

use super::{NewVersion, VersionedStore, report_corrupt, verify_chain};
use crate::error::{Result, StoreError};
use crate::lock::BlockLocks;

/// One block's full history, oldest first.
#[derive(Debug, Clone)]
struct Chain {
    block: Block,
    versions: Vec<Version>,
}

impl Chain {
    fn head(&self) -> Result<&Version> {
        self.versions
            .last()
            .ok_or_else(|| StoreError::corrupt(&self.block.key(), "block has no versions"))
    }
}

/// `DashMap`-backed store, lost on restart.
pub struct MemoryVersionStore {
    chains: DashMap<BlockKey, Chain>,
    locks: BlockLocks,
}

impl Default for MemoryVersionStore {
    fn default() -> Self {
        Self::new(BlockLocks::default())
    }
}

impl MemoryVersionStore {
    pub fn new(locks: BlockLocks) -> Self {
        Self {
            chains: DashMap::new(),
            locks,
        }
    }

    fn chain(&self, key: &BlockKey) -> Result<Chain> {
        self.chains
            .get(key)
            .map(|c| c.value().clone())
            .ok_or_else(|| StoreError::block_not_found(key))
    }
}

impl VersionedStore for MemoryVersionStore {
    #[tracing::instrument(skip(self, root), fields(block = %key), name = "store.create_block")]
    fn create_from(&self, key: &BlockKey, root: NewVersion<'_>) -> Result<(Block, Version)> {
        let root = Version::next(key, None, root.body, root.message, root.author, root.source_proposal);
        let block = Block {
            label: key.label.clone(),
            owner_id: key.owner_id.clone(),
            current_version: root.id,
            version_count: 1,
            created_at: root.created_at,
        };

        match self.chains.entry(key.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(key.clone())),
            Entry::Vacant(slot) => {
                slot.insert(Chain {
                    block: block.clone(),
                    versions: vec![root.clone()],
                });
                tracing::debug!(version = %root.id, "created block");
                Ok((block, root))
            }
        }
    }

    fn current(&self, key: &BlockKey) -> Result<(Block, Version)> {
        let chain = self.chains.get(key).ok_or_else(|| StoreError::block_not_found(key))?;
        let head = chain.head()?;
        if head.id != chain.block.current_version {
            return report_corrupt(Err(StoreError::corrupt(key, "head pointer disagrees with chain")));
        }
        Ok((chain.block.clone(), head.clone()))
    }

    #[tracing::instrument(skip(self, new), fields(block = %key), name = "store.commit")]
    fn commit_from(&self, key: &BlockKey, new: NewVersion<'_>) -> Result<Version> {
        self.locks.with_lock(key, || {
            let mut chain = self
                .chains
                .get_mut(key)
                .ok_or_else(|| StoreError::block_not_found(key))?;
            let head = chain.head()?.clone();

            if new.expected_head.is_some_and(|expected| expected != head.id) {
                return Err(StoreError::HeadMoved {
                    key: key.clone(),
                    expected: new.expected_head,
                    actual: head.id,
                });
            }

            let version = Version::next(
                key,
                Some(&head),
                new.body,
                new.message,
                new.author,
                new.source_proposal,
            );
            chain.block.current_version = version.id;
            chain.block.version_count = version.seq;
            chain.versions.push(version.clone());

            tracing::debug!(version = %version.id, seq = version.seq, "committed version");
            Ok(version)
        })
    }

    fn history(&self, key: &BlockKey, limit: usize) -> Result<Vec<Version>> {
        let chain = self.chain(key)?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let versions: Vec<Version> = chain.versions.iter().rev().take(limit).cloned().collect();
        let complete = versions.len() == chain.versions.len();
        report_corrupt(verify_chain(key, chain.block.current_version, &versions, complete))?;
        Ok(versions)
    }

    fn at(&self, key: &BlockKey, version_id: VersionId) -> Result<Version> {
        let chain = self.chains.get(key).ok_or_else(|| StoreError::block_not_found(key))?;
        chain
            .versions
            .iter()
            .find(|v| v.id == version_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("version", version_id))
    }

    fn list_blocks(&self, owner_id: &str) -> Result<Vec<Block>> {
        let mut blocks: Vec<Block> = self
            .chains
            .iter()
            .filter(|entry| entry.key().owner_id == owner_id)
            .map(|entry| entry.value().block.clone())
            .collect();
        blocks.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(blocks)
    }

    fn find_by_proposal(&self, key: &BlockKey, proposal: ProposalId) -> Result<Option<Version>> {
        let Some(chain) = self.chains.get(key) else {
            return Ok(None);
        };
        Ok(chain
            .versions
            .iter()
            .rev()
            .find(|v| v.source_proposal == Some(proposal))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_create_and_current() {
        contract::create_and_current(&MemoryVersionStore::default());
    }

    #[test]
    fn test_duplicate_create() {
        contract::duplicate_create(&MemoryVersionStore::default());
    }

    #[test]
    fn test_missing_block() {
        contract::missing_block(&MemoryVersionStore::default());
    }

    #[test]
    fn test_monotonic_history() {
        contract::monotonic_history(&MemoryVersionStore::default());
    }

    #[test]
    fn test_zero_limit_history() {
        contract::zero_limit_history(&MemoryVersionStore::default());
    }

    #[test]
    fn test_create_from_root() {
        contract::create_from_root(&MemoryVersionStore::default());
    }

    #[test]
    fn test_expected_head_guard() {
        contract::expected_head_guard(&MemoryVersionStore::default());
    }

    #[test]
    fn test_restore_is_additive() {
        contract::restore_is_additive(&MemoryVersionStore::default());
    }

    #[test]
    fn test_at_rejects_foreign_version() {
        contract::at_rejects_foreign_version(&MemoryVersionStore::default());
    }

    #[test]
    fn test_list_and_find() {
        contract::list_and_find(&MemoryVersionStore::default());
    }

    #[test]
    fn test_concurrent_commits_stay_linear() {
        let store = Arc::new(MemoryVersionStore::new(BlockLocks::new(
            std::time::Duration::from_secs(5),
        )));
        let key = contract::key();
        store.create_block(&key, "").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                let key = key.clone();
                thread::spawn(move || {
                    for i in 0..10 {
                        store.commit(&key, &format!("{t}-{i}"), "edit", "u1").unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let history = store.history(&key, usize::MAX).unwrap();
        assert_eq!(history.len(), 81);
        assert_eq!(history[0].seq, 81);
        let (block, _) = store.current(&key).unwrap();
        assert_eq!(block.version_count, 81);
    }
}
