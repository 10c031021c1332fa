// Rust-side reaction model. Ordered collections keep diffs and snapshots deterministic.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::state::ReactionKind;
use crate::store::{KindSummary, RatingSummary, UserReactionRecord};

/// Aggregate counts for a target. Used both for the fetched base and the effective projection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateSummary {
    pub likes: u32,
    pub favorites: u32,
    pub bookmarks: u32,
    pub emoji_counts: BTreeMap<String, u32>,
    pub rating_average: Option<f64>,
    pub rating_count: u32,
}

impl AggregateSummary {
    /// Compose the two independent fetches. Either may still be missing.
    pub fn from_fetched(kinds: Option<&KindSummary>, rating: Option<&RatingSummary>) -> Self {
        let mut out = Self::default();
        if let Some(k) = kinds {
            out.likes = k.count(ReactionKind::Like);
            out.favorites = k.count(ReactionKind::Favorite);
            out.bookmarks = k.count(ReactionKind::Bookmark);
            out.emoji_counts = k.by_emoji.clone();
        }
        if let Some(r) = rating {
            let r = r.normalized();
            out.rating_average = r.average;
            out.rating_count = r.count;
        }
        out
    }

    pub fn emoji_count(&self, emoji: &str) -> u32 {
        self.emoji_counts.get(emoji).copied().unwrap_or(0)
    }

    pub(crate) fn count_mut(&mut self, kind: ReactionKind) -> Option<&mut u32> {
        match kind {
            ReactionKind::Like => Some(&mut self.likes),
            ReactionKind::Favorite => Some(&mut self.favorites),
            ReactionKind::Bookmark => Some(&mut self.bookmarks),
            ReactionKind::Emoji | ReactionKind::Rating => None,
        }
    }
}

/// What the viewer has reacted with on one target.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserReactionState {
    pub like: bool,
    pub favorite: bool,
    pub bookmark: bool,
    pub emojis: BTreeSet<String>,
    pub rating: Option<u8>,
}

impl UserReactionState {
    /// Fold the store's per-reaction records for `target_id` into a state. Records for other
    /// targets are skipped, so one batched response can be split per target.
    pub fn from_records<'a>(
        target_id: &str,
        records: impl IntoIterator<Item = &'a UserReactionRecord>,
    ) -> Self {
        let mut out = Self::default();
        for r in records.into_iter().filter(|r| r.target_id == target_id) {
            match r.kind {
                ReactionKind::Like => out.like = true,
                ReactionKind::Favorite => out.favorite = true,
                ReactionKind::Bookmark => out.bookmark = true,
                ReactionKind::Emoji => {
                    if let Some(emoji) = r.emoji.as_ref().filter(|e| !e.is_empty()) {
                        out.emojis.insert(emoji.clone());
                    }
                }
                ReactionKind::Rating => {
                    out.rating = r.value.filter(|v| (1..=5).contains(v));
                }
            }
        }
        out
    }

    pub fn flag(&self, kind: ReactionKind) -> bool {
        match kind {
            ReactionKind::Like => self.like,
            ReactionKind::Favorite => self.favorite,
            ReactionKind::Bookmark => self.bookmark,
            ReactionKind::Emoji => !self.emojis.is_empty(),
            ReactionKind::Rating => self.rating.is_some(),
        }
    }

    pub(crate) fn set_flag(&mut self, kind: ReactionKind, value: bool) {
        match kind {
            ReactionKind::Like => self.like = value,
            ReactionKind::Favorite => self.favorite = value,
            ReactionKind::Bookmark => self.bookmark = value,
            ReactionKind::Emoji | ReactionKind::Rating => {}
        }
    }

    pub fn has_emoji(&self, emoji: &str) -> bool {
        self.emojis.contains(emoji)
    }
}
