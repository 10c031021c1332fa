//! Contract with the authoritative backend.
//!
//! The engine only reads summaries and submits the viewer's own changes. Implementations are
//! synchronous; the engine always calls them from the runtime's blocking pool, never while
//! holding its state lock, so a slow transport only delays the settle of that one call.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{ReactionKind, TargetKey};

/// Error type for store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Network or server failure (5xx, timeout, connection reset).
    #[error("transport error: {0}")]
    Transport(String),

    /// The viewer is not allowed to perform the call.
    #[error("unauthorized")]
    Unauthorized,

    /// The backend refused the write.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The target does not exist on the backend.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Per-kind and per-emoji totals as returned by `fetch_summary`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KindSummary {
    pub by_kind: BTreeMap<ReactionKind, u32>,
    pub by_emoji: BTreeMap<String, u32>,
}

impl KindSummary {
    pub fn count(&self, kind: ReactionKind) -> u32 {
        self.by_kind.get(&kind).copied().unwrap_or(0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatingSummary {
    pub average: Option<f64>,
    pub count: u32,
}

impl RatingSummary {
    /// Enforce "average is null iff count is zero". A missing average with a non-zero count is
    /// treated as no ratings at all.
    pub fn normalized(&self) -> Self {
        match (self.average, self.count) {
            (Some(avg), count) if count > 0 && avg.is_finite() => Self {
                average: Some(avg),
                count,
            },
            _ => Self {
                average: None,
                count: 0,
            },
        }
    }
}

/// One reaction the viewer holds on a target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserReactionRecord {
    pub target_id: String,
    pub kind: ReactionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u8>,
}

pub trait AggregateStore: Send + Sync + 'static {
    fn fetch_summary(&self, target: &TargetKey, breakdown: bool)
        -> Result<KindSummary, StoreError>;

    fn fetch_rating_summary(&self, target: &TargetKey) -> Result<RatingSummary, StoreError>;

    /// Only called for authenticated viewers. `target_ids` all share `target_type`.
    fn fetch_user_reactions(
        &self,
        target_type: &str,
        target_ids: &[String],
    ) -> Result<Vec<UserReactionRecord>, StoreError>;

    fn submit_toggle(
        &self,
        target: &TargetKey,
        kind: ReactionKind,
        emoji: Option<&str>,
    ) -> Result<(), StoreError>;

    /// `Ok(false)` means the backend answered but did not accept the rating.
    fn submit_rate(&self, target: &TargetKey, value: u8) -> Result<bool, StoreError>;

    fn submit_clear_rating(&self, target: &TargetKey) -> Result<bool, StoreError>;
}
