//! Proposals: agent-suggested edits that have not touched the block yet.
//!
//! ## Lifecycle
//!
//! ```text
//! Pending --approve-->          Approved   (terminal, applied_version set)
//! Pending --reject-->           Rejected   (terminal)
//! Pending --sibling approved--> Superseded (terminal)
//! Pending --policy timeout-->   Expired    (terminal)
//! ```
//!
//! Transitions are one-way; nothing leaves a terminal state.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::block::BlockKey;
use crate::ids::{ProposalId, VersionId};

/// Wire name of an edit operation, as sent by agents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Strategy {
    #[strum(serialize = "append")]
    Append,
    #[strum(serialize = "replace", serialize = "replace_substring")]
    Replace,
    #[strum(serialize = "full_replace", serialize = "full")]
    FullReplace,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Append => "append",
            Strategy::Replace => "replace",
            Strategy::FullReplace => "full_replace",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Edit operations rejected at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("unknown strategy '{0}' (expected append, replace or full_replace)")]
    UnknownStrategy(String),
    #[error("replace requires a non-empty match string")]
    MissingMatch,
}

/// The closed set of edits a proposal can carry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum EditOperation {
    /// Add the proposed text after the body, separated by a blank line.
    Append,
    /// Replace the first occurrence of `match_text` with the proposed text.
    #[serde(rename = "replace")]
    ReplaceSubstring {
        #[serde(rename = "match")]
        match_text: String,
    },
    /// Replace the whole body with the proposed text.
    FullReplace,
}

impl EditOperation {
    /// Validate an untyped `(strategy, match)` pair from the wire.
    pub fn from_wire(strategy: &str, match_text: Option<&str>) -> Result<Self, OperationError> {
        let strategy = Strategy::from_str(strategy)
            .map_err(|_| OperationError::UnknownStrategy(strategy.to_string()))?;
        Self::from_strategy(strategy, match_text)
    }

    pub fn from_strategy(strategy: Strategy, match_text: Option<&str>) -> Result<Self, OperationError> {
        match strategy {
            Strategy::Append => Ok(EditOperation::Append),
            Strategy::FullReplace => Ok(EditOperation::FullReplace),
            Strategy::Replace => match match_text {
                Some(m) if !m.is_empty() => Ok(EditOperation::ReplaceSubstring {
                    match_text: m.to_string(),
                }),
                _ => Err(OperationError::MissingMatch),
            },
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            EditOperation::Append => Strategy::Append,
            EditOperation::ReplaceSubstring { .. } => Strategy::Replace,
            EditOperation::FullReplace => Strategy::FullReplace,
        }
    }

    /// The match text for `ReplaceSubstring`, if any.
    pub fn match_text(&self) -> Option<&str> {
        match self {
            EditOperation::ReplaceSubstring { match_text } => Some(match_text),
            _ => None,
        }
    }
}

/// How sure the agent is about its suggestion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Confidence {
    Low,
    #[default]
    Medium,
    High,
}

impl Confidence {
    /// Case-insensitive parse; `None` for unknown names.
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

/// Review state of a proposal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum ProposalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Superseded,
    Expired,
}

impl ProposalStatus {
    /// Case-insensitive parse; `None` for unknown names.
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Superseded => "superseded",
            ProposalStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProposalStatus::Pending)
    }

    /// One-way rule: only `Pending` may move, and only to a terminal state.
    pub fn can_transition_to(&self, next: ProposalStatus) -> bool {
        *self == ProposalStatus::Pending && next.is_terminal()
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A pending (or reviewed) suggestion against a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub owner_id: String,
    pub block_label: String,
    pub agent_id: String,
    /// Sub-target hint, opaque to the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub operation: EditOperation,
    /// Body at proposal time. Display only; approval re-reads the head.
    pub base_value: String,
    /// Head at proposal time (`None` when the block did not exist yet).
    #[serde(default)]
    pub base_version: Option<VersionId>,
    pub proposed_value: String,
    pub reasoning: String,
    pub confidence: Confidence,
    pub status: ProposalStatus,
    pub created_at: u64,
    #[serde(default)]
    pub reviewed_at: Option<u64>,
    #[serde(default)]
    pub reviewed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_note: Option<String>,
    /// Set if and only if `status == Approved`.
    #[serde(default)]
    pub applied_version: Option<VersionId>,
}

impl Proposal {
    /// Create a pending proposal.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: &BlockKey,
        agent_id: impl Into<String>,
        field: Option<String>,
        operation: EditOperation,
        base_value: impl Into<String>,
        base_version: Option<VersionId>,
        proposed_value: impl Into<String>,
        reasoning: impl Into<String>,
        confidence: Confidence,
    ) -> Self {
        Self {
            id: ProposalId::new(),
            owner_id: key.owner_id.clone(),
            block_label: key.label.clone(),
            agent_id: agent_id.into(),
            field,
            operation,
            base_value: base_value.into(),
            base_version,
            proposed_value: proposed_value.into(),
            reasoning: reasoning.into(),
            confidence,
            status: ProposalStatus::Pending,
            created_at: crate::now_millis(),
            reviewed_at: None,
            reviewed_by: None,
            review_note: None,
            applied_version: None,
        }
    }

    pub fn key(&self) -> BlockKey {
        BlockKey::new(&self.owner_id, &self.block_label)
    }

    pub fn is_pending(&self) -> bool {
        self.status == ProposalStatus::Pending
    }

    pub fn summary(&self) -> ProposalSummary {
        ProposalSummary::from(self)
    }
}

/// Characters of the proposed value shown in a summary.
const PREVIEW_CHARS: usize = 80;

/// Compact listing form of a proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalSummary {
    pub id: ProposalId,
    pub block_label: String,
    pub agent_id: String,
    pub strategy: Strategy,
    pub confidence: Confidence,
    pub status: ProposalStatus,
    pub reasoning: String,
    pub preview: String,
    pub created_at: u64,
}

impl From<&Proposal> for ProposalSummary {
    fn from(p: &Proposal) -> Self {
        let mut preview: String = p.proposed_value.chars().take(PREVIEW_CHARS).collect();
        if p.proposed_value.chars().count() > PREVIEW_CHARS {
            preview.push('…');
        }
        Self {
            id: p.id,
            block_label: p.block_label.clone(),
            agent_id: p.agent_id.clone(),
            strategy: p.operation.strategy(),
            confidence: p.confidence,
            status: p.status,
            reasoning: p.reasoning.clone(),
            preview,
            created_at: p.created_at,
        }
    }
}
