// Registry lifecycle, fetch scheduling and ingestion of fetched base state.

use std::collections::BTreeMap;

use super::overlay::FieldValue;
use super::{ReactionCore, TargetCell};
use crate::error::ReactionError;
use crate::model::UserReactionState;
use crate::state::TargetKey;
use crate::store::{KindSummary, RatingSummary, StoreError, UserReactionRecord};
use crate::updates::{CoreMsg, InternalEvent, ReactionUpdate};

impl ReactionCore {
    /// Register an observer. The first observer triggers the initial fetches.
    pub(crate) fn observe(&mut self, target: TargetKey) {
        let generation = self.next_generation;
        let cell = self.targets.entry(target.clone()).or_insert_with(|| {
            tracing::debug!(%target, generation, "target cell created");
            TargetCell::new(generation)
        });
        if cell.generation == generation {
            self.next_generation += 1;
        }
        cell.observers += 1;
        cell.evict_when_idle = false;
        let first = cell.observers == 1;

        if first {
            let needs_summary = cell.summary.is_none() && cell.summary_in_flight == 0;
            let needs_rating = cell.rating.is_none() && cell.rating_in_flight == 0;
            if needs_summary {
                self.fetch_summary(&target);
            }
            if needs_rating {
                self.fetch_rating(&target);
            }
            self.fetch_user_reactions(vec![target.clone()]);
        }
        self.emit_target(&target);
    }

    pub(crate) fn release(&mut self, target: &TargetKey) {
        let evict = self.evict_unobserved();
        let Some(cell) = self.targets.get_mut(target) else {
            return;
        };
        cell.observers = cell.observers.saturating_sub(1);
        if cell.observers == 0 && evict {
            cell.evict_when_idle = true;
        }
        if !self.evict_if_idle(target) {
            self.emit_target(target);
        }
    }

    /// Evict the cell if it is marked for eviction and no mutation for it is in flight.
    /// Outstanding fetches do not hold a cell; their results are dropped by generation.
    pub(super) fn evict_if_idle(&mut self, target: &TargetKey) -> bool {
        let Some(cell) = self.targets.get(target) else {
            return false;
        };
        if !cell.evict_when_idle || cell.observers > 0 {
            return false;
        }
        if self.in_flight.values().any(|f| &f.target == target) {
            return false;
        }
        self.targets.remove(target);
        tracing::debug!(%target, "target cell evicted");
        self.emit_evicted(target.clone());
        true
    }

    /// Reissue all three fetches for one target, regardless of what is cached.
    pub(crate) fn refresh_target(&mut self, target: &TargetKey) -> Result<(), ReactionError> {
        if !self.targets.contains_key(target) {
            return Err(ReactionError::UnknownTarget(target.clone()));
        }
        self.fetch_summary(target);
        self.fetch_rating(target);
        self.fetch_user_reactions(vec![target.clone()]);
        self.emit_target(target);
        Ok(())
    }

    pub(crate) fn refresh_all(&mut self) {
        let keys: Vec<TargetKey> = self.targets.keys().cloned().collect();
        for key in &keys {
            self.fetch_summary(key);
            self.fetch_rating(key);
        }
        self.fetch_user_reactions(keys);
        self.emit_state();
    }

    pub(super) fn refresh_after_commit(&mut self, target: &TargetKey) {
        if self.targets.contains_key(target) {
            self.fetch_summary(target);
            self.fetch_rating(target);
            self.fetch_user_reactions(vec![target.clone()]);
        }
    }

    /// Authentication transition: everything viewer-specific is dropped and refetched.
    pub(crate) fn set_viewer_authenticated(&mut self, authenticated: bool) {
        if self.authenticated == authenticated {
            return;
        }
        tracing::info!(authenticated, "viewer changed");
        self.authenticated = authenticated;
        self.viewer_epoch += 1;

        for (_, flight) in std::mem::take(&mut self.in_flight) {
            flight.reply.resolve(Err(ReactionError::EngineReset));
        }
        for cell in self.targets.values_mut() {
            cell.mine = None;
            cell.overlay.clear();
            cell.mine_in_flight = 0;
        }
        let idle: Vec<TargetKey> = self
            .targets
            .iter()
            .filter(|(_, c)| c.evict_when_idle && c.observers == 0)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &idle {
            self.evict_if_idle(key);
        }

        let keys: Vec<TargetKey> = self.targets.keys().cloned().collect();
        self.fetch_user_reactions(keys);
        self.emit_state();
    }

    fn fetch_summary(&mut self, target: &TargetKey) {
        let issued_at = self.next_tick();
        let breakdown = self.fetch_breakdown();
        let Some(cell) = self.targets.get_mut(target) else {
            return;
        };
        cell.summary_in_flight += 1;
        let generation = cell.generation;
        let store = self.store.clone();
        let tx = self.core_sender.clone();
        let target = target.clone();
        self.runtime.spawn_blocking(move || {
            let result = store.fetch_summary(&target, breakdown);
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SummaryFetched {
                target,
                generation,
                issued_at,
                result,
            })));
        });
    }

    fn fetch_rating(&mut self, target: &TargetKey) {
        let issued_at = self.next_tick();
        let Some(cell) = self.targets.get_mut(target) else {
            return;
        };
        cell.rating_in_flight += 1;
        let generation = cell.generation;
        let store = self.store.clone();
        let tx = self.core_sender.clone();
        let target = target.clone();
        self.runtime.spawn_blocking(move || {
            let result = store.fetch_rating_summary(&target);
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::RatingFetched {
                target,
                generation,
                issued_at,
                result,
            })));
        });
    }

    /// One store call per `target_type`. No-op for anonymous viewers.
    fn fetch_user_reactions(&mut self, targets: Vec<TargetKey>) {
        if !self.authenticated || targets.is_empty() {
            return;
        }
        let issued_at = self.next_tick();
        let viewer_epoch = self.viewer_epoch;

        let mut by_type: BTreeMap<String, Vec<(TargetKey, u64)>> = BTreeMap::new();
        for target in targets {
            if let Some(cell) = self.targets.get_mut(&target) {
                cell.mine_in_flight += 1;
                by_type
                    .entry(target.target_type.clone())
                    .or_default()
                    .push((target, cell.generation));
            }
        }

        for (target_type, batch) in by_type {
            let store = self.store.clone();
            let tx = self.core_sender.clone();
            self.runtime.spawn_blocking(move || {
                let ids: Vec<String> = batch.iter().map(|(t, _)| t.target_id.clone()).collect();
                let result = store.fetch_user_reactions(&target_type, &ids);
                let _ = tx.send(CoreMsg::Internal(Box::new(
                    InternalEvent::UserReactionsFetched {
                        targets: batch,
                        viewer_epoch,
                        issued_at,
                        result,
                    },
                )));
            });
        }
    }

    fn live_cell(&mut self, target: &TargetKey, generation: u64) -> Option<&mut TargetCell> {
        self.targets
            .get_mut(target)
            .filter(|c| c.generation == generation)
    }

    pub(super) fn handle_summary_fetched(
        &mut self,
        target: &TargetKey,
        generation: u64,
        issued_at: u64,
        result: Result<KindSummary, StoreError>,
    ) {
        let Some(cell) = self.live_cell(target, generation) else {
            tracing::debug!(%target, "dropping summary for evicted target");
            return;
        };
        cell.summary_in_flight = cell.summary_in_flight.saturating_sub(1);
        match result {
            Ok(_) if issued_at < cell.summary_issued_at => {
                tracing::debug!(%target, issued_at, "dropping out-of-order summary");
            }
            Ok(summary) => {
                cell.summary = Some(summary);
                cell.summary_issued_at = issued_at;
            }
            // Base stays as it was; the caller may refresh again.
            Err(e) => tracing::warn!(%target, %e, "summary fetch failed"),
        }
        self.emit_target(target);
    }

    pub(super) fn handle_rating_fetched(
        &mut self,
        target: &TargetKey,
        generation: u64,
        issued_at: u64,
        result: Result<RatingSummary, StoreError>,
    ) {
        let Some(cell) = self.live_cell(target, generation) else {
            tracing::debug!(%target, "dropping rating summary for evicted target");
            return;
        };
        cell.rating_in_flight = cell.rating_in_flight.saturating_sub(1);
        match result {
            Ok(_) if issued_at < cell.rating_issued_at => {
                tracing::debug!(%target, issued_at, "dropping out-of-order rating summary");
            }
            Ok(rating) => {
                cell.rating = Some(rating.normalized());
                cell.rating_issued_at = issued_at;
            }
            Err(e) => tracing::warn!(%target, %e, "rating summary fetch failed"),
        }
        self.emit_target(target);
    }

    pub(super) fn handle_user_reactions_fetched(
        &mut self,
        targets: Vec<(TargetKey, u64)>,
        viewer_epoch: u64,
        issued_at: u64,
        result: Result<Vec<UserReactionRecord>, StoreError>,
    ) {
        if viewer_epoch != self.viewer_epoch {
            tracing::debug!(viewer_epoch, "dropping user reactions for previous viewer");
            return;
        }
        let records = match result {
            Ok(records) => Some(records),
            Err(e) => {
                tracing::warn!(targets = targets.len(), %e, "user reactions fetch failed");
                None
            }
        };
        let report = self.report_conflicts();

        for (target, generation) in targets {
            let Some(cell) = self.live_cell(&target, generation) else {
                continue;
            };
            cell.mine_in_flight = cell.mine_in_flight.saturating_sub(1);
            let mut contradictions = Vec::new();
            match records.as_ref() {
                Some(_) if issued_at < cell.mine_issued_at => {
                    tracing::debug!(%target, issued_at, "dropping out-of-order user reactions");
                }
                Some(records) => {
                    let fetched = UserReactionState::from_records(&target.target_id, records);
                    contradictions = cell.overlay.prune_settled(&fetched, issued_at);
                    cell.mine = Some(fetched);
                    cell.mine_issued_at = issued_at;
                }
                None => {}
            }
            for c in contradictions {
                tracing::warn!(
                    %target,
                    field = %c.field.label(),
                    expected = %describe(&c.expected),
                    fetched = %describe(&c.fetched),
                    "fetched state contradicts confirmed write; fetched state wins"
                );
                if report {
                    let rev = self.next_rev();
                    self.send_update(ReactionUpdate::Conflict {
                        rev,
                        target: target.clone(),
                        field: c.field.label(),
                        expected: describe(&c.expected),
                        fetched: describe(&c.fetched),
                    });
                }
            }
            self.emit_target(&target);
        }
    }
}

fn describe(value: &FieldValue) -> String {
    match value {
        FieldValue::Flag(on) => on.to_string(),
        FieldValue::Rating(Some(v)) => v.to_string(),
        FieldValue::Rating(None) => "none".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::mutation::Reply;
    use super::super::testing::{recipe, Harness};
    use super::super::EngineConfig;
    use super::*;
    use crate::model::AggregateSummary;
    use crate::state::ReactionKind;

    fn evictions(updates: &[ReactionUpdate]) -> usize {
        updates
            .iter()
            .filter(|u| matches!(u, ReactionUpdate::TargetEvicted { .. }))
            .count()
    }

    #[test]
    fn first_observer_fetches_and_loads_base() {
        let mut h = Harness::new();
        h.observe_loaded(&recipe());
        let (summary, mine, loading) = h.core.projection(&recipe()).unwrap();
        assert_eq!(summary.likes, 10);
        assert_eq!(summary.emoji_count("🔥"), 3);
        assert_eq!(summary.rating_count, 4);
        assert_eq!(mine, UserReactionState::default());
        assert!(!loading);

        let calls = h.store.calls();
        h.core.observe(recipe());
        assert_eq!(h.core.targets[&recipe()].observers, 2);
        // Cached cell: only the viewer state would be refetched on a new first observer.
        assert_eq!(h.store.calls().summary_fetches, calls.summary_fetches);
    }

    #[test]
    fn last_release_evicts_the_cell() {
        let mut h = Harness::new();
        h.observe_loaded(&recipe());
        h.core.observe(recipe());
        h.drain_updates();

        h.core.release(&recipe());
        assert!(h.core.targets.contains_key(&recipe()));
        h.core.release(&recipe());
        assert!(!h.core.targets.contains_key(&recipe()));
        assert_eq!(evictions(&h.drain_updates()), 1);
    }

    #[test]
    fn eviction_can_be_disabled() {
        let mut h = Harness::with_config(EngineConfig {
            evict_unobserved: Some(false),
            ..Default::default()
        });
        h.observe_loaded(&recipe());
        h.core.release(&recipe());
        let cell = &h.core.targets[&recipe()];
        assert_eq!(cell.observers, 0);
    }

    #[test]
    fn eviction_waits_for_in_flight_mutation() {
        let mut h = Harness::new();
        h.observe_loaded(&recipe());
        h.store.pause_submits();

        h.core
            .toggle(&recipe(), ReactionKind::Bookmark, Reply::Detached)
            .unwrap();
        h.core.release(&recipe());
        assert!(h.core.targets.contains_key(&recipe()));

        h.drain_updates();
        h.core.handle_submit_settled(1, Ok(true));
        assert!(!h.core.targets.contains_key(&recipe()));
        assert_eq!(evictions(&h.drain_updates()), 1);
    }

    #[test]
    fn results_for_an_evicted_cell_are_dropped() {
        let mut h = Harness::new();
        h.observe_loaded(&recipe());
        let old_generation = h.core.targets[&recipe()].generation;
        h.core.release(&recipe());

        h.observe_loaded(&recipe());
        assert_ne!(h.core.targets[&recipe()].generation, old_generation);

        let bogus = KindSummary {
            by_kind: [(ReactionKind::Like, 999)].into_iter().collect(),
            by_emoji: Default::default(),
        };
        let issued_at = h.core.next_tick();
        h.core
            .handle_summary_fetched(&recipe(), old_generation, issued_at, Ok(bogus));
        let (summary, _, _) = h.core.projection(&recipe()).unwrap();
        assert_eq!(summary.likes, 10);
    }

    #[test]
    fn refresh_requires_an_observed_target() {
        let mut h = Harness::new();
        let other = TargetKey::new("recipe", "unknown");
        assert_eq!(
            h.core.refresh_target(&other),
            Err(ReactionError::UnknownTarget(other))
        );
    }

    #[test]
    fn failed_fetch_keeps_stale_base() {
        let mut h = Harness::new();
        h.observe_loaded(&recipe());
        h.store
            .set_fetch_failure(Some(StoreError::Transport("timeout".into())));

        h.core.refresh_target(&recipe()).unwrap();
        h.pump_fetches(&recipe());
        let (summary, _, loading) = h.core.projection(&recipe()).unwrap();
        assert_eq!(summary.likes, 10);
        assert!(!loading);
    }

    #[test]
    fn fetch_issued_before_settle_does_not_prune() {
        let mut h = Harness::new();
        h.observe_loaded(&recipe());
        h.store.pause_submits();

        let issued_before = h.core.next_tick();
        h.core
            .toggle(&recipe(), ReactionKind::Like, Reply::Detached)
            .unwrap();
        h.core.handle_submit_settled(1, Ok(true));
        let generation = h.core.targets[&recipe()].generation;
        let epoch = h.core.viewer_epoch;

        // Stale answer from before the write landed: overlay keeps the like.
        h.core.handle_user_reactions_fetched(
            vec![(recipe(), generation)],
            epoch,
            issued_before,
            Ok(vec![]),
        );
        assert!(h.core.projection(&recipe()).unwrap().1.like);
        assert_eq!(h.core.targets[&recipe()].overlay.len(), 1);

        // Fresh answer confirming the write: field handed back to base.
        let issued_after = h.core.next_tick();
        let confirmed = vec![UserReactionRecord {
            target_id: recipe().target_id,
            kind: ReactionKind::Like,
            emoji: None,
            value: None,
        }];
        h.core.handle_user_reactions_fetched(
            vec![(recipe(), generation)],
            epoch,
            issued_after,
            Ok(confirmed),
        );
        assert!(h.core.targets[&recipe()].overlay.is_empty());
        assert!(h.core.projection(&recipe()).unwrap().1.like);
    }

    #[test]
    fn contradicting_fetch_wins_and_reports_conflict() {
        let mut h = Harness::new();
        h.observe_loaded(&recipe());
        h.store.pause_submits();

        h.core
            .toggle(&recipe(), ReactionKind::Like, Reply::Detached)
            .unwrap();
        // Acknowledged, but the paused store never recorded it, so the refresh contradicts.
        h.core.handle_submit_settled(1, Ok(true));
        h.drain_updates();
        h.pump_fetches(&recipe());

        let (summary, mine, _) = h.core.projection(&recipe()).unwrap();
        assert!(!mine.like);
        assert_eq!(summary.likes, 10);

        let conflict = h.drain_updates().into_iter().find_map(|u| match u {
            ReactionUpdate::Conflict {
                field,
                expected,
                fetched,
                ..
            } => Some((field, expected, fetched)),
            _ => None,
        });
        assert_eq!(
            conflict,
            Some(("LIKE".to_string(), "true".to_string(), "false".to_string()))
        );
    }

    #[test]
    fn conflict_updates_can_be_silenced() {
        let mut h = Harness::with_config(EngineConfig {
            report_conflicts: Some(false),
            ..Default::default()
        });
        h.observe_loaded(&recipe());
        h.store.pause_submits();

        h.core.rate(&recipe(), 5, Reply::Detached).unwrap();
        h.core.handle_submit_settled(1, Ok(true));
        h.drain_updates();
        h.pump_fetches(&recipe());

        assert_eq!(h.core.projection(&recipe()).unwrap().1.rating, None);
        assert!(!h
            .drain_updates()
            .iter()
            .any(|u| matches!(u, ReactionUpdate::Conflict { .. })));
    }

    #[test]
    fn viewer_change_resets_in_flight_mutations() {
        let mut h = Harness::new();
        h.observe_loaded(&recipe());
        h.store.pause_submits();

        let (tx, rx) = flume::bounded(1);
        h.core
            .toggle(&recipe(), ReactionKind::Like, Reply::Toggle(tx))
            .unwrap();
        h.core.set_viewer_authenticated(false);

        assert_eq!(rx.try_recv().unwrap(), Err(ReactionError::EngineReset));
        let (summary, mine, _) = h.core.projection(&recipe()).unwrap();
        assert!(!mine.like);
        assert_eq!(summary.likes, 10);

        // The abandoned submit settling later changes nothing.
        h.core.handle_submit_settled(1, Ok(true));
        assert!(h.core.targets[&recipe()].overlay.is_empty());
    }

    #[test]
    fn user_reactions_from_previous_viewer_are_dropped() {
        let mut h = Harness::new();
        h.observe_loaded(&recipe());
        let generation = h.core.targets[&recipe()].generation;
        let old_epoch = h.core.viewer_epoch;

        h.core.set_viewer_authenticated(false);
        h.core.set_viewer_authenticated(true);
        h.pump_fetches(&recipe());

        let stale = vec![UserReactionRecord {
            target_id: recipe().target_id,
            kind: ReactionKind::Rating,
            emoji: None,
            value: Some(1),
        }];
        let issued_at = h.core.next_tick();
        h.core.handle_user_reactions_fetched(
            vec![(recipe(), generation)],
            old_epoch,
            issued_at,
            Ok(stale),
        );
        assert_eq!(h.core.projection(&recipe()).unwrap().1.rating, None);
    }

    #[test]
    fn anonymous_viewer_skips_user_reaction_fetches() {
        let mut h = Harness::new();
        h.core.set_viewer_authenticated(false);
        h.observe_loaded(&recipe());
        assert_eq!(h.store.calls().user_reaction_fetches, 0);
        assert_eq!(h.core.projection(&recipe()).unwrap().0.likes, 10);
    }

    #[test]
    fn refresh_all_batches_user_reactions_per_type() {
        let mut h = Harness::new();
        let second = TargetKey::new("recipe", "43");
        let article = TargetKey::new("article", "1");
        h.store
            .seed(&second, &AggregateSummary::default(), UserReactionState::default());
        for key in [recipe(), second.clone(), article.clone()] {
            h.observe_loaded(&key);
        }

        let before = h.store.calls();
        h.core.refresh_all();
        for key in [recipe(), second, article] {
            h.pump_fetches(&key);
        }
        let after = h.store.calls();
        assert_eq!(after.user_reaction_fetches - before.user_reaction_fetches, 2);
        assert_eq!(after.summary_fetches - before.summary_fetches, 3);
        assert_eq!(after.rating_fetches - before.rating_fetches, 3);
    }

    #[test]
    fn summary_landing_before_user_reactions_double_counts_until_both_arrive() {
        let mut h = Harness::new();
        h.observe_loaded(&recipe());
        h.core
            .toggle(&recipe(), ReactionKind::Like, Reply::Detached)
            .unwrap();
        assert_eq!(h.core.projection(&recipe()).unwrap().0.likes, 11);

        // Let the commit through, but hold back the post-commit fetches.
        let mut summary = None;
        let mut user = None;
        while summary.is_none() || user.is_none() {
            let msg = h
                .core_rx
                .recv_timeout(std::time::Duration::from_secs(5))
                .expect("post-commit fetches");
            match msg {
                CoreMsg::Internal(ev) if matches!(*ev, InternalEvent::SummaryFetched { .. }) => {
                    summary = Some(CoreMsg::Internal(ev));
                }
                CoreMsg::Internal(ev)
                    if matches!(*ev, InternalEvent::UserReactionsFetched { .. }) =>
                {
                    user = Some(CoreMsg::Internal(ev));
                }
                other => h.core.handle_message(other),
            }
        }

        // Fresh totals already include the like, and the overlay still adds it on top.
        h.core.handle_message(summary.unwrap());
        let (during, mine, loading) = h.core.projection(&recipe()).unwrap();
        assert_eq!(during.likes, 12);
        assert!(mine.like);
        assert!(loading);

        h.core.handle_message(user.unwrap());
        h.pump_fetches(&recipe());
        let (settled, mine, loading) = h.core.projection(&recipe()).unwrap();
        assert_eq!(settled.likes, 11);
        assert!(mine.like);
        assert!(!loading);
        assert!(h.core.targets[&recipe()].overlay.is_empty());
    }
}
