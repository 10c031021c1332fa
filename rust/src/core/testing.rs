// Drives a ReactionCore directly so tests can choose the order in which store results land.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use flume::Receiver;

use super::{EngineConfig, ReactionCore};
use crate::memory_store::MemoryAggregateStore;
use crate::model::{AggregateSummary, UserReactionState};
use crate::state::{ReactionsState, TargetKey};
use crate::updates::{CoreMsg, ReactionUpdate};

pub(super) fn recipe() -> TargetKey {
    TargetKey::new("recipe", "42")
}

pub(super) fn seeded_totals() -> AggregateSummary {
    let mut totals = AggregateSummary {
        likes: 10,
        favorites: 2,
        bookmarks: 0,
        rating_average: Some(4.5),
        rating_count: 4,
        ..Default::default()
    };
    totals.emoji_counts.insert("🔥".into(), 3);
    totals
}

pub(super) struct Harness {
    pub core: ReactionCore,
    pub core_rx: Receiver<CoreMsg>,
    pub updates: Receiver<ReactionUpdate>,
    pub store: Arc<MemoryAggregateStore>,
    runtime: Option<tokio::runtime::Runtime>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap();
        let (update_tx, updates) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded();
        let store = Arc::new(MemoryAggregateStore::new());
        store.seed(&recipe(), &seeded_totals(), UserReactionState::default());

        let mut core = ReactionCore::new(
            core_tx,
            Arc::new(RwLock::new(ReactionsState::empty())),
            config,
            runtime.handle().clone(),
            store.clone(),
        );
        core.attach_listener(update_tx);
        core.set_viewer_authenticated(true);
        Self {
            core,
            core_rx,
            updates,
            store,
            runtime: Some(runtime),
        }
    }

    /// Handle store results as they arrive until `done` holds.
    pub fn pump_until(&mut self, what: &str, done: impl Fn(&ReactionCore) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(&self.core) {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.core_rx.recv_timeout(left) {
                Ok(msg) => self.core.handle_message(msg),
                Err(_) => panic!("{what}: condition not met"),
            }
        }
    }

    pub fn pump_fetches(&mut self, target: &TargetKey) {
        let key = target.clone();
        self.pump_until("fetches settled", move |core| {
            core.targets.get(&key).is_some_and(|c| !c.fetching())
        });
    }

    pub fn observe_loaded(&mut self, target: &TargetKey) {
        self.core.observe(target.clone());
        self.pump_fetches(target);
    }

    pub fn drain_updates(&self) -> Vec<ReactionUpdate> {
        self.updates.try_iter().collect()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.store.resume_submits();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
