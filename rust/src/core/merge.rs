// Effective aggregate = fetched aggregate + (effective viewer state - base viewer state).
//
// Pure: recomputed from its three inputs on every read, nothing cached here.

use std::collections::BTreeSet;

use crate::model::{AggregateSummary, UserReactionState};
use crate::state::ReactionKind;

const FLAG_KINDS: [ReactionKind; 3] = [
    ReactionKind::Like,
    ReactionKind::Favorite,
    ReactionKind::Bookmark,
];

pub fn merge_summary(
    base: &UserReactionState,
    effective: &UserReactionState,
    summary: &AggregateSummary,
) -> AggregateSummary {
    let mut out = summary.clone();

    for kind in FLAG_KINDS {
        let (before, after) = (base.flag(kind), effective.flag(kind));
        if before == after {
            continue;
        }
        if let Some(count) = out.count_mut(kind) {
            *count = if after {
                count.saturating_add(1)
            } else {
                count.saturating_sub(1)
            };
        }
    }

    let touched: BTreeSet<&String> = base.emojis.union(&effective.emojis).collect();
    for emoji in touched {
        let delta = i64::from(effective.has_emoji(emoji)) - i64::from(base.has_emoji(emoji));
        if delta == 0 {
            continue;
        }
        let current = i64::from(summary.emoji_count(emoji));
        let next = (current + delta).max(0);
        out.emoji_counts
            .insert(emoji.clone(), u32::try_from(next).unwrap_or(u32::MAX));
    }

    let (average, count) = merge_rating(
        base.rating,
        effective.rating,
        summary.rating_average,
        summary.rating_count,
    );
    out.rating_average = average;
    out.rating_count = count;
    out
}

/// Incremental sum/count adjustment. Returns `(average, count)` with `average` null iff
/// `count` is zero.
fn merge_rating(
    before: Option<u8>,
    after: Option<u8>,
    average: Option<f64>,
    count: u32,
) -> (Option<f64>, u32) {
    if before == after {
        return normalize(average, count);
    }
    let mut sum = average.unwrap_or(0.0) * f64::from(count);
    let mut count = count;
    match (before, after) {
        (None, Some(v)) => {
            sum += f64::from(v);
            count = count.saturating_add(1);
        }
        (Some(v), None) => {
            sum -= f64::from(v);
            count = count.saturating_sub(1);
        }
        (Some(old), Some(new)) => {
            sum += f64::from(new) - f64::from(old);
        }
        (None, None) => {}
    }
    if count > 0 {
        (Some(sum / f64::from(count)), count)
    } else {
        (None, 0)
    }
}

fn normalize(average: Option<f64>, count: u32) -> (Option<f64>, u32) {
    match average {
        Some(avg) if count > 0 => (Some(avg), count),
        _ => (None, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> AggregateSummary {
        let mut s = AggregateSummary {
            likes: 10,
            favorites: 2,
            bookmarks: 0,
            rating_average: Some(4.5),
            rating_count: 4,
            ..Default::default()
        };
        s.emoji_counts.insert("🔥".into(), 3);
        s
    }

    fn mine() -> UserReactionState {
        UserReactionState::default()
    }

    fn close(a: Option<f64>, b: f64) -> bool {
        a.map(|a| (a - b).abs() < 1e-9).unwrap_or(false)
    }

    #[test]
    fn empty_overlay_is_identity() {
        let s = summary();
        let mut b = mine();
        b.like = true;
        b.emojis.insert("🔥".into());
        b.rating = Some(3);
        assert_eq!(merge_summary(&b, &b, &s), s);
    }

    #[test]
    fn flag_changes_adjust_their_own_counter() {
        let s = summary();
        let b = mine();
        let mut e = mine();
        e.like = true;
        e.bookmark = true;
        let out = merge_summary(&b, &e, &s);
        assert_eq!(out.likes, 11);
        assert_eq!(out.favorites, 2);
        assert_eq!(out.bookmarks, 1);

        let out = merge_summary(&e, &b, &out);
        assert_eq!(out.likes, 10);
        assert_eq!(out.bookmarks, 0);
    }

    #[test]
    fn unlike_on_zero_count_saturates() {
        let s = AggregateSummary::default();
        let mut b = mine();
        b.favorite = true;
        let out = merge_summary(&b, &mine(), &s);
        assert_eq!(out.favorites, 0);
    }

    #[test]
    fn emoji_counts_clamp_at_zero() {
        let s = summary();
        let mut b = mine();
        b.emojis.insert("👍".into());
        b.emojis.insert("🔥".into());
        let e = mine();
        let out = merge_summary(&b, &e, &s);
        assert_eq!(out.emoji_count("👍"), 0);
        assert_eq!(out.emoji_count("🔥"), 2);
    }

    #[test]
    fn new_emoji_is_added_to_breakdown() {
        let s = summary();
        let mut e = mine();
        e.emojis.insert("🎉".into());
        let out = merge_summary(&mine(), &e, &s);
        assert_eq!(out.emoji_count("🎉"), 1);
        assert_eq!(out.emoji_count("🔥"), 3);
    }

    #[test]
    fn first_rating_joins_the_average() {
        let s = AggregateSummary {
            rating_average: Some(4.0),
            rating_count: 2,
            ..Default::default()
        };
        let mut e = mine();
        e.rating = Some(5);
        let rated = merge_summary(&mine(), &e, &s);
        assert_eq!(rated.rating_count, 3);
        assert!(close(rated.rating_average, 13.0 / 3.0));

        // Un-rating is the same diff taken against the unchanged base.
        let unrated = merge_summary(&mine(), &mine(), &s);
        assert_eq!(unrated.rating_count, 2);
        assert_eq!(unrated.rating_average, Some(4.0));
    }

    #[test]
    fn removing_confirmed_rating_leaves_the_rest() {
        let s = AggregateSummary {
            rating_average: Some(13.0 / 3.0),
            rating_count: 3,
            ..Default::default()
        };
        let mut b = mine();
        b.rating = Some(5);
        let out = merge_summary(&b, &mine(), &s);
        assert_eq!(out.rating_count, 2);
        assert!(close(out.rating_average, 4.0));
    }

    #[test]
    fn changing_rating_keeps_count() {
        let s = AggregateSummary {
            rating_average: Some(3.0),
            rating_count: 2,
            ..Default::default()
        };
        let mut b = mine();
        b.rating = Some(2);
        let mut e = mine();
        e.rating = Some(4);
        let out = merge_summary(&b, &e, &s);
        assert_eq!(out.rating_count, 2);
        assert!(close(out.rating_average, 4.0));
    }

    #[test]
    fn removing_only_rating_nulls_the_average() {
        let s = AggregateSummary {
            rating_average: Some(5.0),
            rating_count: 1,
            ..Default::default()
        };
        let mut b = mine();
        b.rating = Some(5);
        let out = merge_summary(&b, &mine(), &s);
        assert_eq!(out.rating_count, 0);
        assert_eq!(out.rating_average, None);
    }

    #[test]
    fn rating_on_stale_empty_summary_stays_consistent() {
        // Base says the viewer rated, but the summary has not caught up yet.
        let s = AggregateSummary::default();
        let mut b = mine();
        b.rating = Some(4);
        let out = merge_summary(&b, &mine(), &s);
        assert_eq!(out.rating_count, 0);
        assert_eq!(out.rating_average, None);
    }

    #[test]
    fn end_to_end_projection() {
        let s = summary();
        let mut e = mine();
        e.like = true;
        let out = merge_summary(&mine(), &e, &s);
        assert_eq!(out.likes, 11);

        e.rating = Some(5);
        let out = merge_summary(&mine(), &e, &s);
        assert_eq!(out.rating_count, 5);
        assert!(close(out.rating_average, (4.5 * 4.0 + 5.0) / 5.0));
    }
}
