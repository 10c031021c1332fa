use thiserror::Error;

use crate::state::{ReactionKind, TargetKey};
use crate::store::StoreError;

/// Errors surfaced to callers of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error, uniffi::Error)]
#[uniffi(flat_error)]
pub enum ReactionError {
    #[error("rating must be between 1 and 5, got {0}")]
    InvalidRating(u8),

    #[error("invalid emoji: {0:?}")]
    InvalidEmoji(String),

    #[error("{0} cannot be toggled")]
    UnsupportedToggle(ReactionKind),

    #[error("viewer is not authenticated")]
    NotAuthenticated,

    #[error("target {0} is not observed")]
    UnknownTarget(TargetKey),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The viewer changed while the mutation was in flight; its result was discarded.
    #[error("engine reset while the mutation was in flight")]
    EngineReset,

    #[error("engine stopped")]
    EngineStopped,

    #[error("failed to start engine runtime: {0}")]
    Runtime(String),
}

impl ReactionError {
    /// Rejected at the boundary, before any optimistic change was applied.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidRating(_)
                | Self::InvalidEmoji(_)
                | Self::UnsupportedToggle(_)
                | Self::NotAuthenticated
                | Self::UnknownTarget(_)
        )
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Store(StoreError::Transport(_)))
    }
}
