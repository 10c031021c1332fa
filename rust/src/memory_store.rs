//! In-memory [`AggregateStore`].
//!
//! Keeps authoritative totals per target plus the single viewer's own reactions, and applies
//! submits the way a backend would. Intended for tests, the CLI simulator and offline demos.
//!
//! Fault injection:
//! - [`MemoryAggregateStore::fail_next_submits`] fails the next N submits with a given error;
//! - [`MemoryAggregateStore::reject_next_rates`] answers the next N rate calls with "not accepted";
//! - [`MemoryAggregateStore::set_fetch_failure`] fails every fetch until cleared;
//! - [`MemoryAggregateStore::pause_submits`] holds submits in flight until
//!   [`MemoryAggregateStore::resume_submits`].

use std::collections::{BTreeMap, HashMap};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::model::{AggregateSummary, UserReactionState};
use crate::state::{ReactionKind, TargetKey};
use crate::store::{AggregateStore, KindSummary, RatingSummary, StoreError, UserReactionRecord};

#[derive(Debug, Clone, Default)]
struct TargetRecord {
    likes: u32,
    favorites: u32,
    bookmarks: u32,
    emojis: BTreeMap<String, u32>,
    rating_sum: f64,
    rating_count: u32,
    viewer: UserReactionState,
}

impl TargetRecord {
    fn counter(&mut self, kind: ReactionKind) -> Option<&mut u32> {
        match kind {
            ReactionKind::Like => Some(&mut self.likes),
            ReactionKind::Favorite => Some(&mut self.favorites),
            ReactionKind::Bookmark => Some(&mut self.bookmarks),
            ReactionKind::Emoji | ReactionKind::Rating => None,
        }
    }

    fn set_rating(&mut self, value: Option<u8>) {
        if let Some(old) = self.viewer.rating.take() {
            self.rating_sum -= f64::from(old);
            self.rating_count = self.rating_count.saturating_sub(1);
        }
        if let Some(new) = value {
            self.rating_sum += f64::from(new);
            self.rating_count += 1;
        }
        if self.rating_count == 0 {
            self.rating_sum = 0.0;
        }
        self.viewer.rating = value;
    }

    fn set_emoji(&mut self, emoji: &str, on: bool) {
        let had = self.viewer.emojis.contains(emoji);
        if had == on {
            return;
        }
        let count = self.emojis.entry(emoji.to_string()).or_insert(0);
        if on {
            *count += 1;
            self.viewer.emojis.insert(emoji.to_string());
        } else {
            *count = count.saturating_sub(1);
            self.viewer.emojis.remove(emoji);
        }
    }

    fn set_flag(&mut self, kind: ReactionKind, on: bool) {
        if self.viewer.flag(kind) == on {
            return;
        }
        if let Some(count) = self.counter(kind) {
            *count = if on {
                count.saturating_add(1)
            } else {
                count.saturating_sub(1)
            };
        }
        self.viewer.set_flag(kind, on);
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_submits: Vec<StoreError>,
    rejected_rates: u32,
    fetch_failure: Option<StoreError>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub summary_fetches: u32,
    pub rating_fetches: u32,
    pub user_reaction_fetches: u32,
    pub submits: u32,
}

#[derive(Debug, Default)]
pub struct MemoryAggregateStore {
    targets: RwLock<HashMap<TargetKey, TargetRecord>>,
    faults: Mutex<Faults>,
    calls: Mutex<CallCounts>,
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl MemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set authoritative totals and the viewer's own reactions for `target`. Totals are
    /// expected to already include the viewer's reactions.
    pub fn seed(&self, target: &TargetKey, totals: &AggregateSummary, viewer: UserReactionState) {
        let rating_count = if totals.rating_average.is_some() {
            totals.rating_count
        } else {
            0
        };
        let record = TargetRecord {
            likes: totals.likes,
            favorites: totals.favorites,
            bookmarks: totals.bookmarks,
            emojis: totals.emoji_counts.clone(),
            rating_sum: totals.rating_average.unwrap_or(0.0) * f64::from(rating_count),
            rating_count,
            viewer,
        };
        self.targets.write().insert(target.clone(), record);
    }

    /// Change the viewer's reactions out of band, as another device of the same viewer would.
    /// Totals follow the change.
    pub fn set_viewer_reactions(&self, target: &TargetKey, viewer: UserReactionState) {
        let mut targets = self.targets.write();
        let record = targets.entry(target.clone()).or_default();
        for kind in [
            ReactionKind::Like,
            ReactionKind::Favorite,
            ReactionKind::Bookmark,
        ] {
            record.set_flag(kind, viewer.flag(kind));
        }
        let current: Vec<String> = record.viewer.emojis.iter().cloned().collect();
        for emoji in current {
            if !viewer.emojis.contains(&emoji) {
                record.set_emoji(&emoji, false);
            }
        }
        for emoji in &viewer.emojis {
            record.set_emoji(emoji, true);
        }
        record.set_rating(viewer.rating);
    }

    pub fn totals(&self, target: &TargetKey) -> Option<AggregateSummary> {
        let targets = self.targets.read();
        let record = targets.get(target)?;
        Some(Self::summary_of(record))
    }

    pub fn viewer_reactions(&self, target: &TargetKey) -> Option<UserReactionState> {
        self.targets.read().get(target).map(|r| r.viewer.clone())
    }

    pub fn fail_next_submits(&self, count: usize, error: StoreError) {
        let mut faults = self.faults.lock();
        faults
            .failing_submits
            .extend(std::iter::repeat(error).take(count));
    }

    pub fn reject_next_rates(&self, count: u32) {
        self.faults.lock().rejected_rates += count;
    }

    pub fn set_fetch_failure(&self, error: Option<StoreError>) {
        self.faults.lock().fetch_failure = error;
    }

    pub fn pause_submits(&self) {
        *self.paused.lock() = true;
    }

    pub fn resume_submits(&self) {
        *self.paused.lock() = false;
        self.resumed.notify_all();
    }

    pub fn calls(&self) -> CallCounts {
        *self.calls.lock()
    }

    fn summary_of(record: &TargetRecord) -> AggregateSummary {
        let (rating_average, rating_count) = if record.rating_count > 0 {
            (
                Some(record.rating_sum / f64::from(record.rating_count)),
                record.rating_count,
            )
        } else {
            (None, 0)
        };
        AggregateSummary {
            likes: record.likes,
            favorites: record.favorites,
            bookmarks: record.bookmarks,
            emoji_counts: record
                .emojis
                .iter()
                .filter(|(_, c)| **c > 0)
                .map(|(e, c)| (e.clone(), *c))
                .collect(),
            rating_average,
            rating_count,
        }
    }

    fn check_fetch(&self) -> Result<(), StoreError> {
        match &self.faults.lock().fetch_failure {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Block while paused, then consume one injected failure if any.
    fn enter_submit(&self) -> Result<(), StoreError> {
        {
            let mut paused = self.paused.lock();
            while *paused {
                self.resumed.wait(&mut paused);
            }
        }
        self.calls.lock().submits += 1;
        let mut faults = self.faults.lock();
        if faults.failing_submits.is_empty() {
            Ok(())
        } else {
            Err(faults.failing_submits.remove(0))
        }
    }
}

impl AggregateStore for MemoryAggregateStore {
    fn fetch_summary(
        &self,
        target: &TargetKey,
        breakdown: bool,
    ) -> Result<KindSummary, StoreError> {
        self.calls.lock().summary_fetches += 1;
        self.check_fetch()?;
        let targets = self.targets.read();
        let Some(record) = targets.get(target) else {
            return Ok(KindSummary::default());
        };
        let summary = Self::summary_of(record);
        let mut out = KindSummary::default();
        out.by_kind.insert(ReactionKind::Like, summary.likes);
        out.by_kind.insert(ReactionKind::Favorite, summary.favorites);
        out.by_kind.insert(ReactionKind::Bookmark, summary.bookmarks);
        if breakdown {
            out.by_kind.insert(
                ReactionKind::Emoji,
                summary.emoji_counts.values().sum::<u32>(),
            );
            out.by_emoji = summary.emoji_counts;
        }
        Ok(out)
    }

    fn fetch_rating_summary(&self, target: &TargetKey) -> Result<RatingSummary, StoreError> {
        self.calls.lock().rating_fetches += 1;
        self.check_fetch()?;
        let targets = self.targets.read();
        let summary = targets.get(target).map(Self::summary_of).unwrap_or_default();
        Ok(RatingSummary {
            average: summary.rating_average,
            count: summary.rating_count,
        })
    }

    fn fetch_user_reactions(
        &self,
        target_type: &str,
        target_ids: &[String],
    ) -> Result<Vec<UserReactionRecord>, StoreError> {
        self.calls.lock().user_reaction_fetches += 1;
        self.check_fetch()?;
        let targets = self.targets.read();
        let mut out = Vec::new();
        for id in target_ids {
            let key = TargetKey::new(target_type, id.as_str());
            let Some(viewer) = targets.get(&key).map(|r| &r.viewer) else {
                continue;
            };
            let record = |kind, emoji: Option<String>, value: Option<u8>| UserReactionRecord {
                target_id: id.clone(),
                kind,
                emoji,
                value,
            };
            for kind in [
                ReactionKind::Like,
                ReactionKind::Favorite,
                ReactionKind::Bookmark,
            ] {
                if viewer.flag(kind) {
                    out.push(record(kind, None, None));
                }
            }
            for emoji in &viewer.emojis {
                out.push(record(ReactionKind::Emoji, Some(emoji.clone()), None));
            }
            if let Some(value) = viewer.rating {
                out.push(record(ReactionKind::Rating, None, Some(value)));
            }
        }
        Ok(out)
    }

    fn submit_toggle(
        &self,
        target: &TargetKey,
        kind: ReactionKind,
        emoji: Option<&str>,
    ) -> Result<(), StoreError> {
        self.enter_submit()?;
        let mut targets = self.targets.write();
        let record = targets.entry(target.clone()).or_default();
        match (kind, emoji) {
            (ReactionKind::Emoji, Some(emoji)) => {
                let on = !record.viewer.emojis.contains(emoji);
                record.set_emoji(emoji, on);
            }
            (ReactionKind::Emoji, None) => {
                return Err(StoreError::Rejected("emoji toggle without emoji".into()));
            }
            (ReactionKind::Rating, _) => {
                return Err(StoreError::Rejected("ratings are not toggled".into()));
            }
            (kind, _) => {
                let on = !record.viewer.flag(kind);
                record.set_flag(kind, on);
            }
        }
        Ok(())
    }

    fn submit_rate(&self, target: &TargetKey, value: u8) -> Result<bool, StoreError> {
        self.enter_submit()?;
        {
            let mut faults = self.faults.lock();
            if faults.rejected_rates > 0 {
                faults.rejected_rates -= 1;
                return Ok(false);
            }
        }
        if !(1..=5).contains(&value) {
            return Ok(false);
        }
        let mut targets = self.targets.write();
        targets.entry(target.clone()).or_default().set_rating(Some(value));
        Ok(true)
    }

    fn submit_clear_rating(&self, target: &TargetKey) -> Result<bool, StoreError> {
        self.enter_submit()?;
        let mut targets = self.targets.write();
        targets.entry(target.clone()).or_default().set_rating(None);
        Ok(true)
    }
}
