//! Block registry: the explicitly constructed handle request handlers share.
//!
//! Owns one version store, one proposal store and the workflow over them.
//! Cheap to clone. [`BlockRegistry::owner`] returns an [`OwnerScope`] that
//! validates labels and refuses to touch another owner's proposals.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;

use kioku_types::{Block, BlockKey, LabelError, Proposal, ProposalId, Version, VersionId};

use crate::config::StoreConfig;
use crate::db::StoreDb;
use crate::diff::{self, DiffLine};
use crate::error::{Result, StoreError};
use crate::events::{EventBus, StoreEvent};
use crate::lock::BlockLocks;
use crate::proposal_store::{DbProposalStore, MemoryProposalStore, ProposalStore};
use crate::version_store::{DbVersionStore, MemoryVersionStore, VersionedStore};
use crate::workflow::{Approval, ApprovalWorkflow, NewProposal, ProposalDiff};

/// Default message for a direct edit.
pub fn edit_message(author: &str) -> String {
    format!("Edit by {author}")
}

struct Inner {
    versions: Arc<dyn VersionedStore>,
    proposals: Arc<dyn ProposalStore>,
    workflow: ApprovalWorkflow,
    events: EventBus,
}

#[derive(Clone)]
pub struct BlockRegistry {
    inner: Arc<Inner>,
}

impl BlockRegistry {
    /// Registry over arbitrary stores.
    pub fn from_stores(
        versions: Arc<dyn VersionedStore>,
        proposals: Arc<dyn ProposalStore>,
        config: StoreConfig,
    ) -> Self {
        let events = EventBus::default();
        let workflow = ApprovalWorkflow::new(versions.clone(), proposals.clone(), events.clone(), config);
        Self {
            inner: Arc::new(Inner {
                versions,
                proposals,
                workflow,
                events,
            }),
        }
    }

    /// Process-lifetime registry.
    pub fn in_memory(config: StoreConfig) -> Self {
        Self::from_stores(
            Arc::new(MemoryVersionStore::new(BlockLocks::new(config.lock_timeout))),
            Arc::new(MemoryProposalStore::new()),
            config,
        )
    }

    /// SQLite-backed registry at `path`.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref();
        let db = StoreDb::open(path)?;
        tracing::info!(path = %path.display(), "opened block database");
        Ok(Self::over_db(db, config))
    }

    /// SQLite-backed registry without a file (tests, throwaway servers).
    pub fn sqlite_in_memory(config: StoreConfig) -> Result<Self> {
        Ok(Self::over_db(StoreDb::in_memory()?, config))
    }

    fn over_db(db: StoreDb, config: StoreConfig) -> Self {
        let db = db.into_shared();
        Self::from_stores(
            Arc::new(DbVersionStore::new(db.clone(), BlockLocks::new(config.lock_timeout))),
            Arc::new(DbProposalStore::new(db)),
            config,
        )
    }

    /// Operations scoped to one owner.
    pub fn owner(&self, owner_id: &str) -> Result<OwnerScope> {
        if owner_id.trim().is_empty() {
            return Err(LabelError::EmptyOwner.into());
        }
        Ok(OwnerScope {
            registry: self.clone(),
            owner_id: owner_id.to_string(),
        })
    }

    pub fn workflow(&self) -> &ApprovalWorkflow {
        &self.inner.workflow
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    /// Expire pending proposals of every owner created before `cutoff`.
    pub fn expire_pending(&self, cutoff: u64) -> Result<Vec<ProposalId>> {
        self.inner.workflow.expire_pending(cutoff)
    }

    pub fn purge_terminal(&self, cutoff: u64) -> Result<usize> {
        self.inner.workflow.purge_terminal(cutoff)
    }

    fn versions(&self) -> &dyn VersionedStore {
        self.inner.versions.as_ref()
    }

    fn proposals(&self) -> &dyn ProposalStore {
        self.inner.proposals.as_ref()
    }
}

/// A registry bound to one owner.
#[derive(Clone)]
pub struct OwnerScope {
    registry: BlockRegistry,
    owner_id: String,
}

impl OwnerScope {
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Validate `label` into a key under this owner.
    pub fn key(&self, label: &str) -> Result<BlockKey> {
        Ok(BlockKey::parse(&self.owner_id, label)?)
    }

    // ========================================================================
    // Blocks
    // ========================================================================

    pub fn list_blocks(&self) -> Result<Vec<Block>> {
        self.registry.versions().list_blocks(&self.owner_id)
    }

    pub fn create_block(&self, label: &str, body: &str) -> Result<Block> {
        let key = self.key(label)?;
        let block = self.registry.versions().create_block(&key, body)?;
        tracing::info!(block = %key, "created block");
        self.registry.inner.events.emit(StoreEvent::BlockCreated {
            key,
            version: block.current_version,
        });
        Ok(block)
    }

    pub fn current(&self, label: &str) -> Result<(Block, Version)> {
        self.registry.versions().current(&self.key(label)?)
    }

    /// Direct human edit. The first write to a missing label creates it.
    #[tracing::instrument(skip(self, body, message), fields(owner = %self.owner_id), name = "registry.edit")]
    pub fn edit(&self, label: &str, body: &str, author: &str, message: Option<&str>) -> Result<Version> {
        let key = self.key(label)?;
        let versions = self.registry.versions();
        if !versions.exists(&key)? {
            match versions.create_block(&key, body) {
                Ok(block) => {
                    self.registry.inner.events.emit(StoreEvent::BlockCreated {
                        key: key.clone(),
                        version: block.current_version,
                    });
                    tracing::info!(block = %key, "created block on first edit");
                    return versions.at(&key, block.current_version);
                }
                Err(StoreError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let message = message.map_or_else(|| edit_message(author), str::to_string);
        let version = versions.commit(&key, body, &message, author)?;
        tracing::info!(block = %key, version = %version.id, seq = version.seq, "committed edit");
        self.committed(&key, &version);
        Ok(version)
    }

    /// Newest first.
    pub fn history(&self, label: &str, limit: usize) -> Result<Vec<Version>> {
        self.registry.versions().history(&self.key(label)?, limit)
    }

    pub fn at(&self, label: &str, version_id: VersionId) -> Result<Version> {
        self.registry.versions().at(&self.key(label)?, version_id)
    }

    #[tracing::instrument(skip(self), fields(owner = %self.owner_id), name = "registry.restore")]
    pub fn restore(&self, label: &str, version_id: VersionId, author: &str) -> Result<Version> {
        let key = self.key(label)?;
        let version = self.registry.versions().restore(&key, version_id, author)?;
        self.committed(&key, &version);
        Ok(version)
    }

    /// Line diff between two versions of one block.
    pub fn diff_versions(&self, label: &str, from: VersionId, to: VersionId) -> Result<Vec<DiffLine>> {
        let key = self.key(label)?;
        let versions = self.registry.versions();
        let old = versions.at(&key, from)?;
        let new = versions.at(&key, to)?;
        Ok(diff::render_diff(&old.body, &new.body))
    }

    fn committed(&self, key: &BlockKey, version: &Version) {
        self.registry.inner.events.emit(StoreEvent::VersionCommitted {
            key: key.clone(),
            version: version.id,
            seq: version.seq,
            author: version.author.clone(),
        });
    }

    // ========================================================================
    // Proposals
    // ========================================================================

    pub fn propose(&self, label: &str, new: NewProposal) -> Result<Proposal> {
        let key = self.key(label)?;
        self.registry.workflow().propose(&key, new)
    }

    /// Pending proposals, oldest first; all blocks when `label` is `None`.
    pub fn pending(&self, label: Option<&str>) -> Result<Vec<Proposal>> {
        let label = label.map(|l| self.key(l)).transpose()?;
        self.registry
            .proposals()
            .list_pending(&self.owner_id, label.as_ref().map(|k| k.label.as_str()))
    }

    pub fn count_pending(&self, label: Option<&str>) -> Result<usize> {
        let label = label.map(|l| self.key(l)).transpose()?;
        self.registry
            .proposals()
            .count_pending(&self.owner_id, label.as_ref().map(|k| k.label.as_str()))
    }

    /// A proposal, only if it belongs to this owner and block.
    pub fn proposal(&self, label: &str, id: ProposalId) -> Result<Proposal> {
        let key = self.key(label)?;
        let proposal = self.registry.proposals().get(id)?;
        if proposal.key() != key {
            return Err(StoreError::proposal_not_found(id));
        }
        Ok(proposal)
    }

    pub fn approve(&self, label: &str, id: ProposalId, reviewer: &str) -> Result<Approval> {
        self.proposal(label, id)?;
        self.registry.workflow().approve(id, reviewer)
    }

    pub fn reject(&self, label: &str, id: ProposalId, reviewer: &str, reason: Option<String>) -> Result<Proposal> {
        self.proposal(label, id)?;
        self.registry.workflow().reject(id, reviewer, reason)
    }

    pub fn diff(&self, label: &str, id: ProposalId) -> Result<ProposalDiff> {
        self.proposal(label, id)?;
        self.registry.workflow().diff(id)
    }

    /// Finish this owner's interrupted approvals.
    pub fn reconcile(&self) -> Result<Vec<ProposalId>> {
        self.registry.workflow().reconcile(&self.owner_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kioku_types::{Confidence, EditOperation, ProposalStatus};

    fn append(content: &str) -> NewProposal {
        NewProposal {
            agent_id: "tutor".into(),
            base_version: None,
            field: None,
            operation: EditOperation::Append,
            content: content.into(),
            reasoning: "inferred from session".into(),
            confidence: Confidence::Medium,
        }
    }

    fn registries() -> [BlockRegistry; 2] {
        [
            BlockRegistry::in_memory(StoreConfig::default()),
            BlockRegistry::sqlite_in_memory(StoreConfig::default()).unwrap(),
        ]
    }

    #[test]
    fn test_owner_validation() {
        let registry = BlockRegistry::in_memory(StoreConfig::default());
        assert!(matches!(
            registry.owner(""),
            Err(StoreError::InvalidLabel(LabelError::EmptyOwner))
        ));
        let scope = registry.owner("u1").unwrap();
        assert!(matches!(
            scope.create_block("bad label", ""),
            Err(StoreError::InvalidLabel(LabelError::InvalidChar(' ')))
        ));
    }

    #[test]
    fn test_edit_creates_then_commits() {
        for registry in registries() {
            let scope = registry.owner("u1").unwrap();
            let first = scope.edit("notes", "hello", "u1", None).unwrap();
            assert!(first.is_root());

            let second = scope.edit("notes", "hello world", "u1", None).unwrap();
            assert_eq!(second.message, "Edit by u1");
            assert_eq!(second.parent_version, Some(first.id));

            let third = scope.edit("notes", "bye", "u1", Some("tidy")).unwrap();
            assert_eq!(third.message, "tidy");
            assert_eq!(scope.history("notes", 10).unwrap().len(), 3);
        }
    }

    #[test]
    fn test_owners_are_isolated() {
        for registry in registries() {
            let alice = registry.owner("u1").unwrap();
            let bob = registry.owner("u2").unwrap();
            alice.create_block("student", "Name: Alice").unwrap();
            bob.create_block("student", "Name: Bob").unwrap();

            let p = alice.propose("student", append("Goal")).unwrap();
            assert!(matches!(
                bob.approve("student", p.id, "u2"),
                Err(StoreError::NotFound { .. })
            ));
            assert!(matches!(
                alice.approve("goals", p.id, "u1"),
                Err(StoreError::NotFound { .. })
            ));
            assert_eq!(bob.count_pending(None).unwrap(), 0);
            assert_eq!(alice.count_pending(Some("student")).unwrap(), 1);

            alice.approve("student", p.id, "u1").unwrap();
            assert_eq!(bob.current("student").unwrap().1.body, "Name: Bob");
            assert_eq!(alice.list_blocks().unwrap().len(), 1);
        }
    }

    #[test]
    fn test_restore_and_diff_versions() {
        for registry in registries() {
            let scope = registry.owner("u1").unwrap();
            let v1 = scope.edit("student", "one\ntwo", "u1", None).unwrap();
            let v2 = scope.edit("student", "one\n2", "u1", None).unwrap();

            let lines = scope.diff_versions("student", v1.id, v2.id).unwrap();
            assert_eq!(diff::render_unified(&lines), " one\n-two\n+2");

            let restored = scope.restore("student", v1.id, "u1").unwrap();
            assert_eq!(restored.body, v1.body);
            assert_eq!(scope.at("student", v1.id).unwrap(), v1);
        }
    }

    #[test]
    fn test_edit_events() {
        let registry = BlockRegistry::in_memory(StoreConfig::default());
        let mut rx = registry.subscribe();
        let scope = registry.owner("u1").unwrap();
        let root = scope.edit("notes", "a", "u1", None).unwrap();
        let next = scope.edit("notes", "b", "u1", None).unwrap();

        let key = BlockKey::new("u1", "notes");
        assert_eq!(
            rx.try_recv().unwrap(),
            StoreEvent::BlockCreated {
                key: key.clone(),
                version: root.id
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            StoreEvent::VersionCommitted {
                key,
                version: next.id,
                seq: 2,
                author: "u1".into()
            }
        );
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kioku.db");
        let (p1, p2) = {
            let registry = BlockRegistry::open(&path, StoreConfig::default()).unwrap();
            let scope = registry.owner("u1").unwrap();
            scope.create_block("student", "Name: Alice").unwrap();
            let p1 = scope.propose("student", append("one")).unwrap();
            let p2 = scope.propose("student", append("two")).unwrap();
            (p1, p2)
        };

        let registry = BlockRegistry::open(&path, StoreConfig::default()).unwrap();
        let scope = registry.owner("u1").unwrap();
        assert_eq!(scope.pending(Some("student")).unwrap().len(), 2);
        let approval = scope.approve("student", p2.id, "u1").unwrap();
        assert_eq!(approval.version.body, "Name: Alice\n\ntwo");
        assert_eq!(approval.superseded, vec![p1.id]);
        assert_eq!(
            scope.proposal("student", p1.id).unwrap().status,
            ProposalStatus::Superseded
        );
    }
}
