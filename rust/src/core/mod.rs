mod config;
pub(crate) mod merge;
mod mutation;
pub(crate) mod overlay;
mod refresh;
#[cfg(test)]
mod testing;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use flume::Sender;

use crate::actions::ReactionAction;
use crate::error::ReactionError;
use crate::model::{AggregateSummary, UserReactionState};
use crate::state::{MyReactions, ReactionSummary, ReactionsState, TargetKey, TargetView};
use crate::store::{AggregateStore, KindSummary, RatingSummary};
use crate::updates::{CoreMsg, InternalEvent, ReactionUpdate};

pub use config::{load_engine_config, EngineConfig};
pub use merge::merge_summary;
pub(crate) use mutation::Reply;

use merge::merge_summary as merge;
use overlay::{Overlay, OverlayEntry, OverlayField};

/// Base and overlay state for one observed target.
#[derive(Debug)]
struct TargetCell {
    generation: u64,
    observers: u32,
    summary: Option<KindSummary>,
    rating: Option<RatingSummary>,
    // None until the first user-reaction fetch lands (or for anonymous viewers).
    mine: Option<UserReactionState>,
    overlay: Overlay,
    summary_in_flight: u32,
    rating_in_flight: u32,
    mine_in_flight: u32,
    // Issue ticks of the fetches currently reflected in base.
    summary_issued_at: u64,
    rating_issued_at: u64,
    mine_issued_at: u64,
    evict_when_idle: bool,
}

impl TargetCell {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            observers: 0,
            summary: None,
            rating: None,
            mine: None,
            overlay: Overlay::default(),
            summary_in_flight: 0,
            rating_in_flight: 0,
            mine_in_flight: 0,
            summary_issued_at: 0,
            rating_issued_at: 0,
            mine_issued_at: 0,
            evict_when_idle: false,
        }
    }

    fn base_mine(&self) -> UserReactionState {
        self.mine.clone().unwrap_or_default()
    }

    fn base_summary(&self) -> AggregateSummary {
        AggregateSummary::from_fetched(self.summary.as_ref(), self.rating.as_ref())
    }

    fn effective(&self) -> (AggregateSummary, UserReactionState) {
        let base = self.base_mine();
        let effective = self.overlay.apply(&base);
        let summary = merge(&base, &effective, &self.base_summary());
        (summary, effective)
    }

    fn fetching(&self) -> bool {
        self.summary_in_flight + self.rating_in_flight + self.mine_in_flight > 0
    }
}

/// A submit that has been issued but not settled.
#[derive(Debug)]
struct InFlight {
    target: TargetKey,
    field: OverlayField,
    // Overlay entry to restore if this mutation fails while still owning `field`.
    previous: Option<OverlayEntry>,
    action: &'static str,
    reply: Reply,
}

/// Engine state: the target registry plus bookkeeping for in-flight work.
///
/// Every transition runs under the session's lock, either directly from a caller or from the
/// core loop draining `CoreMsg`s. Store calls never run under it.
pub struct ReactionCore {
    state: ReactionsState,
    rev: u64,
    mutation_seq: u64,
    tick: u64,
    next_generation: u64,
    viewer_epoch: u64,
    authenticated: bool,

    // None until a listener attaches; updates emitted before that are not queued.
    update_sender: Option<Sender<ReactionUpdate>>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<ReactionsState>>,

    config: EngineConfig,
    runtime: tokio::runtime::Handle,
    store: Arc<dyn AggregateStore>,

    targets: BTreeMap<TargetKey, TargetCell>,
    in_flight: BTreeMap<u64, InFlight>,
}

impl ReactionCore {
    pub fn new(
        core_sender: Sender<CoreMsg>,
        shared_state: Arc<RwLock<ReactionsState>>,
        config: EngineConfig,
        runtime: tokio::runtime::Handle,
        store: Arc<dyn AggregateStore>,
    ) -> Self {
        Self {
            state: ReactionsState::empty(),
            rev: 0,
            mutation_seq: 0,
            tick: 0,
            next_generation: 0,
            viewer_epoch: 0,
            authenticated: false,
            update_sender: None,
            core_sender,
            shared_state,
            config,
            runtime,
            store,
            targets: BTreeMap::new(),
            in_flight: BTreeMap::new(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Effective summary, effective viewer state and loading flag for an observed target.
    pub fn projection(
        &self,
        target: &TargetKey,
    ) -> Option<(AggregateSummary, UserReactionState, bool)> {
        let cell = self.targets.get(target)?;
        let (summary, mine) = cell.effective();
        Some((summary, mine, self.is_loading(target, cell)))
    }

    pub fn view(&self, target: &TargetKey) -> Option<TargetView> {
        self.targets
            .get(target)
            .map(|cell| self.build_view(target, cell))
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Action(action) => {
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action);
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
            // The loop owner stops draining; nothing to tear down here.
            CoreMsg::Shutdown => {}
        }
    }

    pub fn handle_action(&mut self, action: ReactionAction) {
        let tag = action.tag();
        let result = match action {
            ReactionAction::Observe { target } => {
                self.observe(target);
                Ok(())
            }
            ReactionAction::Release { target } => {
                self.release(&target);
                Ok(())
            }
            ReactionAction::Refresh { target } => self.refresh_target(&target),
            ReactionAction::RefreshAll => {
                self.refresh_all();
                Ok(())
            }
            ReactionAction::Toggle { target, kind } => self.toggle(&target, kind, Reply::Detached),
            ReactionAction::ToggleEmoji { target, emoji } => {
                self.toggle_emoji(&target, &emoji, Reply::Detached)
            }
            ReactionAction::Rate { target, value } => self.rate(&target, value, Reply::Detached),
            ReactionAction::ClearRating { target } => {
                self.clear_rating(&target, Reply::Detached)
            }
            ReactionAction::SetViewerAuthenticated { authenticated } => {
                self.set_viewer_authenticated(authenticated);
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(action = tag, %e, "action rejected");
            let rev = self.next_rev();
            self.commit_state_snapshot();
            self.send_update(ReactionUpdate::ActionRejected {
                rev,
                action: tag.to_string(),
                reason: e.to_string(),
            });
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::SummaryFetched {
                target,
                generation,
                issued_at,
                result,
            } => self.handle_summary_fetched(&target, generation, issued_at, result),
            InternalEvent::RatingFetched {
                target,
                generation,
                issued_at,
                result,
            } => self.handle_rating_fetched(&target, generation, issued_at, result),
            InternalEvent::UserReactionsFetched {
                targets,
                viewer_epoch,
                issued_at,
                result,
            } => self.handle_user_reactions_fetched(targets, viewer_epoch, issued_at, result),
            InternalEvent::SubmitSettled { seq, result } => self.handle_submit_settled(seq, result),
        }
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn is_loading(&self, target: &TargetKey, cell: &TargetCell) -> bool {
        cell.fetching() || self.in_flight.values().any(|f| &f.target == target)
    }

    fn build_view(&self, target: &TargetKey, cell: &TargetCell) -> TargetView {
        let (summary, mine) = cell.effective();
        TargetView {
            target: target.clone(),
            summary: ReactionSummary::from(&summary),
            mine: MyReactions::from(&mine),
            loading: self.is_loading(target, cell),
            has_summary: cell.summary.is_some(),
            observers: cell.observers,
        }
    }

    fn rebuild_snapshot(&mut self) {
        let targets = self
            .targets
            .iter()
            .map(|(key, cell)| self.build_view(key, cell))
            .collect();
        self.state.targets = targets;
        self.state.viewer_authenticated = self.authenticated;
    }

    fn commit_state_snapshot(&self) {
        match self.shared_state.write() {
            Ok(mut g) => *g = self.state.clone(),
            Err(poison) => *poison.into_inner() = self.state.clone(),
        }
    }

    /// Route updates to `tx` from now on. Revisions keep counting while nobody listens.
    pub fn attach_listener(&mut self, tx: Sender<ReactionUpdate>) {
        self.update_sender = Some(tx);
    }

    #[cfg(test)]
    pub(crate) fn queued_updates(&self) -> usize {
        self.update_sender.as_ref().map_or(0, Sender::len)
    }

    fn send_update(&mut self, update: ReactionUpdate) {
        let Some(tx) = &self.update_sender else {
            return;
        };
        if tx.send(update).is_err() {
            tracing::debug!("update listener gone; dropping sender");
            self.update_sender = None;
        }
    }

    fn emit_state(&mut self) {
        self.rebuild_snapshot();
        self.next_rev();
        self.commit_state_snapshot();
        if self.update_sender.is_some() {
            self.send_update(ReactionUpdate::FullState(self.state.clone()));
        }
    }

    fn emit_target(&mut self, target: &TargetKey) {
        let Some(view) = self.view(target) else {
            return;
        };
        self.rebuild_snapshot();
        let rev = self.next_rev();
        self.commit_state_snapshot();
        self.send_update(ReactionUpdate::TargetChanged { rev, view });
    }

    fn emit_evicted(&mut self, target: TargetKey) {
        self.rebuild_snapshot();
        let rev = self.next_rev();
        self.commit_state_snapshot();
        self.send_update(ReactionUpdate::TargetEvicted { rev, target });
    }

    fn emit_mutation_failed(&mut self, target: &TargetKey, action: &str, error: &ReactionError) {
        let rev = self.next_rev();
        self.commit_state_snapshot();
        self.send_update(ReactionUpdate::MutationFailed {
            rev,
            target: target.clone(),
            action: action.to_string(),
            reason: error.to_string(),
        });
    }
}
