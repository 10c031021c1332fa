//! Platform-supplied store over FFI.
//!
//! The platform implements [`ReactionBackend`] with flat result records (`ok` plus optional
//! error kind/message), and [`BackendStore`] maps those onto [`AggregateStore`].

use crate::state::{EmojiCount, ReactionKind, TargetKey};
use crate::store::{AggregateStore, KindSummary, RatingSummary, StoreError, UserReactionRecord};

#[derive(uniffi::Enum, Clone, Debug, PartialEq, Eq)]
pub enum BackendErrorKind {
    Transport,
    Unauthorized,
    Rejected,
    NotFound,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct KindCount {
    pub kind: ReactionKind,
    pub count: u32,
}

#[derive(uniffi::Record, Clone, Debug)]
pub struct BackendSummaryResult {
    pub ok: bool,
    pub by_kind: Vec<KindCount>,
    pub by_emoji: Vec<EmojiCount>,
    pub error_kind: Option<BackendErrorKind>,
    pub error_message: Option<String>,
}

#[derive(uniffi::Record, Clone, Debug)]
pub struct BackendRatingResult {
    pub ok: bool,
    pub average: Option<f64>,
    pub count: u32,
    pub error_kind: Option<BackendErrorKind>,
    pub error_message: Option<String>,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct BackendUserReaction {
    pub target_id: String,
    pub kind: ReactionKind,
    pub emoji: Option<String>,
    pub value: Option<u8>,
}

#[derive(uniffi::Record, Clone, Debug)]
pub struct BackendUserReactionsResult {
    pub ok: bool,
    pub reactions: Vec<BackendUserReaction>,
    pub error_kind: Option<BackendErrorKind>,
    pub error_message: Option<String>,
}

/// `accepted` is only meaningful for rate and clear-rating submits.
#[derive(uniffi::Record, Clone, Debug)]
pub struct BackendSubmitResult {
    pub ok: bool,
    pub accepted: bool,
    pub error_kind: Option<BackendErrorKind>,
    pub error_message: Option<String>,
}

/// Called from the engine's blocking pool; implementations may block on network I/O.
#[uniffi::export(callback_interface)]
pub trait ReactionBackend: Send + Sync + 'static {
    fn fetch_summary(&self, target: TargetKey, breakdown: bool) -> BackendSummaryResult;
    fn fetch_rating_summary(&self, target: TargetKey) -> BackendRatingResult;
    fn fetch_user_reactions(
        &self,
        target_type: String,
        target_ids: Vec<String>,
    ) -> BackendUserReactionsResult;
    fn submit_toggle(
        &self,
        target: TargetKey,
        kind: ReactionKind,
        emoji: Option<String>,
    ) -> BackendSubmitResult;
    fn submit_rate(&self, target: TargetKey, value: u8) -> BackendSubmitResult;
    fn submit_clear_rating(&self, target: TargetKey) -> BackendSubmitResult;
}

pub struct BackendStore {
    backend: Box<dyn ReactionBackend>,
}

impl BackendStore {
    pub fn new(backend: Box<dyn ReactionBackend>) -> Self {
        Self { backend }
    }
}

fn map_error(
    op: &str,
    kind: Option<BackendErrorKind>,
    message: Option<String>,
) -> StoreError {
    let message = message.unwrap_or_else(|| format!("{op} failed"));
    match kind {
        Some(BackendErrorKind::Unauthorized) => StoreError::Unauthorized,
        Some(BackendErrorKind::Rejected) => StoreError::Rejected(message),
        Some(BackendErrorKind::NotFound) => StoreError::NotFound(message),
        // Unclassified failures are treated as transport errors.
        Some(BackendErrorKind::Transport) | None => StoreError::Transport(message),
    }
}

impl AggregateStore for BackendStore {
    fn fetch_summary(
        &self,
        target: &TargetKey,
        breakdown: bool,
    ) -> Result<KindSummary, StoreError> {
        let res = self.backend.fetch_summary(target.clone(), breakdown);
        if !res.ok {
            return Err(map_error("fetch_summary", res.error_kind, res.error_message));
        }
        Ok(KindSummary {
            by_kind: res.by_kind.into_iter().map(|c| (c.kind, c.count)).collect(),
            by_emoji: res
                .by_emoji
                .into_iter()
                .map(|c| (c.emoji, c.count))
                .collect(),
        })
    }

    fn fetch_rating_summary(&self, target: &TargetKey) -> Result<RatingSummary, StoreError> {
        let res = self.backend.fetch_rating_summary(target.clone());
        if !res.ok {
            return Err(map_error(
                "fetch_rating_summary",
                res.error_kind,
                res.error_message,
            ));
        }
        Ok(RatingSummary {
            average: res.average,
            count: res.count,
        })
    }

    fn fetch_user_reactions(
        &self,
        target_type: &str,
        target_ids: &[String],
    ) -> Result<Vec<UserReactionRecord>, StoreError> {
        let res = self
            .backend
            .fetch_user_reactions(target_type.to_string(), target_ids.to_vec());
        if !res.ok {
            return Err(map_error(
                "fetch_user_reactions",
                res.error_kind,
                res.error_message,
            ));
        }
        Ok(res
            .reactions
            .into_iter()
            .map(|r| UserReactionRecord {
                target_id: r.target_id,
                kind: r.kind,
                emoji: r.emoji,
                value: r.value,
            })
            .collect())
    }

    fn submit_toggle(
        &self,
        target: &TargetKey,
        kind: ReactionKind,
        emoji: Option<&str>,
    ) -> Result<(), StoreError> {
        let res = self
            .backend
            .submit_toggle(target.clone(), kind, emoji.map(str::to_string));
        if res.ok {
            Ok(())
        } else {
            Err(map_error("submit_toggle", res.error_kind, res.error_message))
        }
    }

    fn submit_rate(&self, target: &TargetKey, value: u8) -> Result<bool, StoreError> {
        let res = self.backend.submit_rate(target.clone(), value);
        if res.ok {
            Ok(res.accepted)
        } else {
            Err(map_error("submit_rate", res.error_kind, res.error_message))
        }
    }

    fn submit_clear_rating(&self, target: &TargetKey) -> Result<bool, StoreError> {
        let res = self.backend.submit_clear_rating(target.clone());
        if res.ok {
            Ok(res.accepted)
        } else {
            Err(map_error(
                "submit_clear_rating",
                res.error_kind,
                res.error_message,
            ))
        }
    }
}
