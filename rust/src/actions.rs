use crate::state::{ReactionKind, TargetKey};

#[derive(uniffi::Enum, Debug, Clone, PartialEq)]
pub enum ReactionAction {
    // Registry
    Observe {
        target: TargetKey,
    },
    Release {
        target: TargetKey,
    },

    // Refresh
    Refresh {
        target: TargetKey,
    },
    RefreshAll,

    // Mutations
    Toggle {
        target: TargetKey,
        kind: ReactionKind,
    },
    ToggleEmoji {
        target: TargetKey,
        emoji: String,
    },
    Rate {
        target: TargetKey,
        value: u8,
    },
    ClearRating {
        target: TargetKey,
    },

    // Viewer
    SetViewerAuthenticated {
        authenticated: bool,
    },
}

impl ReactionAction {
    /// Short tag for logs and failure updates.
    pub fn tag(&self) -> &'static str {
        match self {
            // Registry
            ReactionAction::Observe { .. } => "Observe",
            ReactionAction::Release { .. } => "Release",

            // Refresh
            ReactionAction::Refresh { .. } => "Refresh",
            ReactionAction::RefreshAll => "RefreshAll",

            // Mutations
            ReactionAction::Toggle { .. } => "Toggle",
            ReactionAction::ToggleEmoji { .. } => "ToggleEmoji",
            ReactionAction::Rate { .. } => "Rate",
            ReactionAction::ClearRating { .. } => "ClearRating",

            // Viewer
            ReactionAction::SetViewerAuthenticated { .. } => "SetViewerAuthenticated",
        }
    }
}
