use crate::state::{ReactionsState, TargetKey, TargetView};
use crate::store::{KindSummary, RatingSummary, StoreError, UserReactionRecord};
use crate::ReactionAction;

#[derive(uniffi::Enum, Clone, Debug)]
pub enum ReactionUpdate {
    FullState(ReactionsState),
    TargetChanged {
        rev: u64,
        view: TargetView,
    },
    TargetEvicted {
        rev: u64,
        target: TargetKey,
    },
    /// A submit failed or was rejected; the optimistic change has been rolled back.
    MutationFailed {
        rev: u64,
        target: TargetKey,
        action: String,
        reason: String,
    },
    /// An action was refused before any state changed.
    ActionRejected {
        rev: u64,
        action: String,
        reason: String,
    },
    /// A fresh fetch contradicted a confirmed optimistic write; the fetched value won.
    Conflict {
        rev: u64,
        target: TargetKey,
        field: String,
        expected: String,
        fetched: String,
    },
}

impl ReactionUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            ReactionUpdate::FullState(s) => s.rev,
            ReactionUpdate::TargetChanged { rev, .. } => *rev,
            ReactionUpdate::TargetEvicted { rev, .. } => *rev,
            ReactionUpdate::MutationFailed { rev, .. } => *rev,
            ReactionUpdate::ActionRejected { rev, .. } => *rev,
            ReactionUpdate::Conflict { rev, .. } => *rev,
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(ReactionAction),
    Internal(Box<InternalEvent>),
    Shutdown,
}

/// Results of store calls, delivered back to the core loop.
///
/// Fetch results carry the generation of the cell they were issued for, so a result for an
/// evicted and re-created target is dropped instead of landing on the new cell. `issued_at`
/// orders fetches of the same kind: a result older than the one already applied is dropped.
#[derive(Debug)]
pub enum InternalEvent {
    SummaryFetched {
        target: TargetKey,
        generation: u64,
        issued_at: u64,
        result: Result<KindSummary, StoreError>,
    },
    RatingFetched {
        target: TargetKey,
        generation: u64,
        issued_at: u64,
        result: Result<RatingSummary, StoreError>,
    },
    UserReactionsFetched {
        targets: Vec<(TargetKey, u64)>,
        viewer_epoch: u64,
        // Overlay fields settled before this tick are confirmed by the result.
        issued_at: u64,
        result: Result<Vec<UserReactionRecord>, StoreError>,
    },
    SubmitSettled {
        seq: u64,
        result: Result<bool, StoreError>,
    },
}
