//! SQLite-backed version store.

use kioku_types::{Block, BlockKey, ProposalId, Version, VersionId};

use super::{NewVersion, VersionedStore, report_corrupt, verify_chain};
use crate::db::SharedDb;
use crate::error::{Result, StoreError};
use crate::lock::BlockLocks;

/// Version store over a shared [`StoreDb`](crate::db::StoreDb).
pub struct DbVersionStore {
    db: SharedDb,
    locks: BlockLocks,
}

impl DbVersionStore {
    pub fn new(db: SharedDb, locks: BlockLocks) -> Self {
        Self { db, locks }
    }

    fn head(&self, key: &BlockKey) -> Result<(Block, Version)> {
        let db = self.db.lock();
        let block = db.load_block(key)?.ok_or_else(|| StoreError::block_not_found(key))?;
        let head = db
            .load_version(key, block.current_version)?
            .ok_or_else(|| StoreError::corrupt(key, format!("head {} is missing", block.current_version)))?;
        if head.seq != block.version_count {
            return Err(StoreError::corrupt(
                key,
                format!("head seq {} but block records {}", head.seq, block.version_count),
            ));
        }
        Ok((block, head))
    }
}

impl VersionedStore for DbVersionStore {
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
        if !self.db.lock().insert_block(&block, &root)? {
            return Err(StoreError::AlreadyExists(key.clone()));
        }
        tracing::debug!(version = %root.id, "created block");
        Ok((block, root))
    }

    fn current(&self, key: &BlockKey) -> Result<(Block, Version)> {
        report_corrupt(self.head(key))
    }

    #[tracing::instrument(skip(self, new), fields(block = %key), name = "store.commit")]
    fn commit_from(&self, key: &BlockKey, new: NewVersion<'_>) -> Result<Version> {
        self.locks.with_lock(key, || {
            let (_, head) = report_corrupt(self.head(key))?;
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
            if !self.db.lock().append_version(&head, &version)? {
                // Another process moved the head under us.
                let (_, actual) = self.head(key)?;
                return Err(StoreError::HeadMoved {
                    key: key.clone(),
                    expected: Some(head.id),
                    actual: actual.id,
                });
            }

            tracing::debug!(version = %version.id, seq = version.seq, "committed version");
            Ok(version)
        })
    }

    fn history(&self, key: &BlockKey, limit: usize) -> Result<Vec<Version>> {
        // Block row and rows must come from the same snapshot.
        let (block, versions) = {
            let db = self.db.lock();
            let block = db.load_block(key)?.ok_or_else(|| StoreError::block_not_found(key))?;
            if limit == 0 {
                return Ok(Vec::new());
            }
            (block, db.load_history(key, limit)?)
        };
        let complete = versions.len() < limit || versions.len() as u64 == block.version_count;
        report_corrupt(verify_chain(key, block.current_version, &versions, complete))?;
        Ok(versions)
    }

    fn at(&self, key: &BlockKey, version_id: VersionId) -> Result<Version> {
        let db = self.db.lock();
        if db.load_block(key)?.is_none() {
            return Err(StoreError::block_not_found(key));
        }
        db.load_version(key, version_id)?
            .ok_or_else(|| StoreError::not_found("version", version_id))
    }

    fn list_blocks(&self, owner_id: &str) -> Result<Vec<Block>> {
        Ok(self.db.lock().list_blocks(owner_id)?)
    }

    fn find_by_proposal(&self, key: &BlockKey, proposal: ProposalId) -> Result<Option<Version>> {
        Ok(self.db.lock().find_version_by_proposal(key, proposal)?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;
    use crate::db::StoreDb;

    fn store() -> DbVersionStore {
        DbVersionStore::new(StoreDb::in_memory().unwrap().into_shared(), BlockLocks::default())
    }

    #[test]
    fn test_create_and_current() {
        contract::create_and_current(&store());
    }

    #[test]
    fn test_duplicate_create() {
        contract::duplicate_create(&store());
    }

    #[test]
    fn test_missing_block() {
        contract::missing_block(&store());
    }

    #[test]
    fn test_monotonic_history() {
        contract::monotonic_history(&store());
    }

    #[test]
    fn test_zero_limit_history() {
        contract::zero_limit_history(&store());
    }

    #[test]
    fn test_create_from_root() {
        contract::create_from_root(&store());
    }

    #[test]
    fn test_expected_head_guard() {
        contract::expected_head_guard(&store());
    }

    #[test]
    fn test_restore_is_additive() {
        contract::restore_is_additive(&store());
    }

    #[test]
    fn test_at_rejects_foreign_version() {
        contract::at_rejects_foreign_version(&store());
    }

    #[test]
    fn test_list_and_find() {
        contract::list_and_find(&store());
    }

    #[test]
    fn test_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kioku.db");
        let key = contract::key();
        {
            let store = DbVersionStore::new(StoreDb::open(&path).unwrap().into_shared(), BlockLocks::default());
            store.create_block(&key, "v1").unwrap();
            store.commit(&key, "v2", "edit", "u1").unwrap();
        }
        let store = DbVersionStore::new(StoreDb::open(&path).unwrap().into_shared(), BlockLocks::default());
        let history = store.history(&key, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].body, "v2");
    }

    #[test]
    fn test_dangling_head_is_isolated() {
        let db = StoreDb::in_memory().unwrap().into_shared();
        let store = DbVersionStore::new(db.clone(), BlockLocks::default());
        let broken = BlockKey::new("u1", "broken");
        let healthy = BlockKey::new("u1", "healthy");
        store.create_block(&broken, "v1").unwrap();
        store.commit(&broken, "v2", "edit", "u1").unwrap();
        store.create_block(&healthy, "fine").unwrap();

        db.lock()
            .conn()
            .execute(
                "UPDATE blocks SET head_id = ?1 WHERE owner_id = ?2 AND label = ?3",
                rusqlite::params![VersionId::new().to_string(), "u1", "broken"],
            )
            .unwrap();

        assert!(matches!(store.current(&broken), Err(StoreError::Corrupt { .. })));
        assert!(matches!(store.history(&broken, 10), Err(StoreError::Corrupt { .. })));
        assert_eq!(store.current(&healthy).unwrap().1.body, "fine");
        assert_eq!(store.history(&healthy, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_broken_parent_link_is_isolated() {
        let db = StoreDb::in_memory().unwrap().into_shared();
        let store = DbVersionStore::new(db.clone(), BlockLocks::default());
        let broken = BlockKey::new("u1", "broken");
        let healthy = BlockKey::new("u1", "healthy");
        store.create_block(&broken, "v1").unwrap();
        store.commit(&broken, "v2", "edit", "u1").unwrap();
        let v3 = store.commit(&broken, "v3", "edit", "u1").unwrap();
        store.create_block(&healthy, "fine").unwrap();
        store.commit(&healthy, "finer", "edit", "u1").unwrap();

        db.lock()
            .conn()
            .execute(
                "UPDATE versions SET parent_id = ?1 WHERE id = ?2",
                rusqlite::params![VersionId::new().to_string(), v3.id.to_string()],
            )
            .unwrap();

        assert!(matches!(store.history(&broken, 10), Err(StoreError::Corrupt { .. })));
        let history = store.history(&healthy, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].body, "finer");
    }
}
