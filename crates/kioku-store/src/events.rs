//! Change notifications.
//!
//! Every head move and proposal outcome is broadcast on a `tokio` channel.
//! Sends never block and never fail the operation; a lagging subscriber just
//! misses events.

use serde::Serialize;
use tokio::sync::broadcast;

use kioku_types::{BlockKey, ProposalId, ProposalStatus, VersionId};

/// Channel capacity for [`EventBus`].
pub const EVENT_CAPACITY: usize = 1024;

/// Events broadcast when blocks or proposals change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StoreEvent {
    /// A block was created with its root version.
    BlockCreated { key: BlockKey, version: VersionId },
    /// The head of a block moved.
    VersionCommitted {
        key: BlockKey,
        version: VersionId,
        seq: u64,
        author: String,
    },
    /// An agent queued a proposal.
    ProposalCreated { key: BlockKey, id: ProposalId },
    /// A proposal reached a terminal state.
    ProposalResolved {
        key: BlockKey,
        id: ProposalId,
        status: ProposalStatus,
    },
}

/// Cloneable sender half.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: StoreEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}
