//! # kioku-store
//!
//! Versioned memory blocks with agent-proposed, human-approved edits.
//!
//! Every block is a linear chain of immutable versions. Agents never write a
//! block directly: they queue proposals, and a human approves (commit a new
//! version, supersede siblings) or rejects (nothing changes).
//!
//! - [`version_store`]: append-only history with per-block locking
//! - [`diff`]: pure line diffs and edit application
//! - [`proposal_store`]: the review queue and its one-way status machine
//! - [`workflow`]: approval, retries, crash recovery
//! - [`registry`]: the handle request handlers hold
//!
//! Memory and SQLite backends are interchangeable behind the two store traits.

pub mod config;
pub mod db;
pub mod diff;
pub mod error;
pub mod events;
pub mod lock;
pub mod proposal_store;
pub mod registry;
pub mod version_store;
pub mod workflow;

pub use config::StoreConfig;
pub use db::{SharedDb, StoreDb};
pub use diff::{ApplyError, DiffLine, DiffStats, DiffTag, apply, diff_stats, render_diff, render_unified};
pub use error::{ErrorKind, Result, StoreError};
pub use events::{EventBus, StoreEvent};
pub use lock::BlockLocks;
pub use proposal_store::{DbProposalStore, MemoryProposalStore, ProposalStore, Transition};
pub use registry::{BlockRegistry, OwnerScope};
pub use version_store::{DbVersionStore, MemoryVersionStore, NewVersion, VersionedStore, verify_chain};
pub use workflow::{Approval, ApprovalWorkflow, NewProposal, ProposalDiff};
