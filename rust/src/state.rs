use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{AggregateSummary, UserReactionState};

/// Identity of the content item a reaction set attaches to.
///
/// `target_type` travels with every store call, so it is part of the key rather than
/// session-wide configuration.
#[derive(
    uniffi::Record, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TargetKey {
    pub target_type: String,
    pub target_id: String,
}

impl TargetKey {
    pub fn new(target_type: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            target_type: target_type.into(),
            target_id: target_id.into(),
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.target_type, self.target_id)
    }
}

#[derive(
    uniffi::Enum, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReactionKind {
    Like,
    Favorite,
    Bookmark,
    Emoji,
    Rating,
}

impl ReactionKind {
    /// Kinds that `toggle` accepts; emoji and rating have their own operations.
    pub fn is_flag(self) -> bool {
        matches!(self, Self::Like | Self::Favorite | Self::Bookmark)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Like => "LIKE",
            Self::Favorite => "FAVORITE",
            Self::Bookmark => "BOOKMARK",
            Self::Emoji => "EMOJI",
            Self::Rating => "RATING",
        }
    }
}

impl fmt::Display for ReactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct EmojiCount {
    pub emoji: String,
    pub count: u32,
}

/// Effective aggregate as shown to the viewer. Emoji counts are sorted by emoji.
#[derive(uniffi::Record, Clone, Debug, PartialEq)]
pub struct ReactionSummary {
    pub likes: u32,
    pub favorites: u32,
    pub bookmarks: u32,
    pub emoji_counts: Vec<EmojiCount>,
    pub rating_average: Option<f64>,
    pub rating_count: u32,
}

impl From<&AggregateSummary> for ReactionSummary {
    fn from(s: &AggregateSummary) -> Self {
        Self {
            likes: s.likes,
            favorites: s.favorites,
            bookmarks: s.bookmarks,
            emoji_counts: s
                .emoji_counts
                .iter()
                .map(|(emoji, count)| EmojiCount {
                    emoji: emoji.clone(),
                    count: *count,
                })
                .collect(),
            rating_average: s.rating_average,
            rating_count: s.rating_count,
        }
    }
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct MyReactions {
    pub like: bool,
    pub favorite: bool,
    pub bookmark: bool,
    pub emojis: Vec<String>,
    pub rating: Option<u8>,
}

impl From<&UserReactionState> for MyReactions {
    fn from(s: &UserReactionState) -> Self {
        Self {
            like: s.like,
            favorite: s.favorite,
            bookmark: s.bookmark,
            emojis: s.emojis.iter().cloned().collect(),
            rating: s.rating,
        }
    }
}

/// Projection of one observed target.
#[derive(uniffi::Record, Clone, Debug, PartialEq)]
pub struct TargetView {
    pub target: TargetKey,
    pub summary: ReactionSummary,
    pub mine: MyReactions,
    /// A mutation is in flight or a fetch is outstanding.
    pub loading: bool,
    /// Whether the last summary fetch has landed at least once.
    pub has_summary: bool,
    pub observers: u32,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq)]
pub struct ReactionsState {
    pub rev: u64,
    pub viewer_authenticated: bool,
    pub targets: Vec<TargetView>,
}

impl ReactionsState {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            viewer_authenticated: false,
            targets: vec![],
        }
    }

    pub fn target(&self, key: &TargetKey) -> Option<&TargetView> {
        self.targets.iter().find(|t| &t.target == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reaction_kind_wire_form_is_screaming_case() {
        let json = serde_json::to_string(&ReactionKind::Bookmark).unwrap();
        assert_eq!(json, "\"BOOKMARK\"");
        let kind: ReactionKind = serde_json::from_str("\"FAVORITE\"").unwrap();
        assert_eq!(kind, ReactionKind::Favorite);
    }

    #[test]
    fn only_boolean_kinds_are_flags() {
        assert!(ReactionKind::Like.is_flag());
        assert!(ReactionKind::Favorite.is_flag());
        assert!(ReactionKind::Bookmark.is_flag());
        assert!(!ReactionKind::Emoji.is_flag());
        assert!(!ReactionKind::Rating.is_flag());
    }

    #[test]
    fn summary_record_keeps_emoji_order() {
        let mut s = AggregateSummary::default();
        s.emoji_counts.insert("🔥".into(), 3);
        s.emoji_counts.insert("👍".into(), 1);
        let record = ReactionSummary::from(&s);
        let order: Vec<&str> = record.emoji_counts.iter().map(|e| e.emoji.as_str()).collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
    }

    #[test]
    fn target_key_displays_type_and_id() {
        assert_eq!(TargetKey::new("recipe", "42").to_string(), "recipe/42");
    }
}
