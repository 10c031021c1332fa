mod actions;
mod backend;
mod core;
mod error;
mod logging;
mod memory_store;
mod model;
mod state;
mod store;
mod updates;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::core::{ReactionCore, Reply};

pub use crate::core::{load_engine_config, merge_summary, EngineConfig};
pub use actions::ReactionAction;
pub use backend::*;
pub use error::ReactionError;
pub use logging::init_logging;
pub use memory_store::{CallCounts, MemoryAggregateStore};
pub use model::{AggregateSummary, UserReactionState};
pub use state::*;
pub use store::*;
pub use updates::*;

uniffi::setup_scaffolding!();

#[uniffi::export(callback_interface)]
pub trait ReactionReconciler: Send + Sync + 'static {
    fn reconcile(&self, update: ReactionUpdate);
}

/// Shared between a session, its clones and every handle it produced. Dropped (and the
/// runtime shut down) once the last of them goes away.
struct Engine {
    core: Arc<Mutex<ReactionCore>>,
    core_tx: Sender<CoreMsg>,
    listening: AtomicBool,
    shared_state: Arc<RwLock<ReactionsState>>,
    runtime: Option<tokio::runtime::Runtime>,
}

impl Engine {
    fn start(config: EngineConfig, store: Arc<dyn AggregateStore>) -> Result<Self, ReactionError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads())
            .thread_name("reactions-worker")
            .enable_time()
            .build()
            .map_err(|e| ReactionError::Runtime(e.to_string()))?;

        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let shared_state = Arc::new(RwLock::new(ReactionsState::empty()));

        let core = Arc::new(Mutex::new(ReactionCore::new(
            core_tx.clone(),
            shared_state.clone(),
            config,
            runtime.handle().clone(),
            store,
        )));

        // Drains store results (and FFI actions) in arrival order.
        let core_for_loop = core.clone();
        thread::Builder::new()
            .name("reactions-core".into())
            .spawn(move || {
                while let Ok(msg) = core_rx.recv() {
                    if matches!(msg, CoreMsg::Shutdown) {
                        break;
                    }
                    core_for_loop.lock().handle_message(msg);
                }
                tracing::debug!("core loop stopped");
            })
            .map_err(|e| ReactionError::Runtime(e.to_string()))?;

        Ok(Self {
            core,
            core_tx,
            listening: AtomicBool::new(false),
            shared_state,
            runtime: Some(runtime),
        })
    }

    fn state(&self) -> ReactionsState {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    fn listen_for_updates(&self, reconciler: Box<dyn ReactionReconciler>) {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Avoid multiple listeners that would split messages.
            return;
        }

        let (tx, rx) = flume::unbounded();
        self.core.lock().attach_listener(tx);
        thread::spawn(move || {
            while let Ok(update) = rx.recv() {
                reconciler.reconcile(update);
            }
        });
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.core_tx.send(CoreMsg::Shutdown);
        // Submits still parked in the blocking pool are abandoned; their callers see
        // `EngineStopped` once the core is dropped.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Entry point for Rust callers: a registry of observed targets over one [`AggregateStore`].
///
/// The viewer starts out anonymous; call [`ReactionSession::set_viewer_authenticated`] once a
/// signed-in viewer is known.
#[derive(Clone)]
pub struct ReactionSession {
    engine: Arc<Engine>,
}

impl ReactionSession {
    /// Initializes logging and reads `reactions_config.json` from `data_dir`.
    pub fn new(data_dir: &str, store: Arc<dyn AggregateStore>) -> Result<Self, ReactionError> {
        logging::init_logging(data_dir);
        let config = load_engine_config(data_dir);
        tracing::info!(data_dir, ?config, "ReactionSession::new() starting");
        Self::with_config(config, store)
    }

    pub fn with_config(
        config: EngineConfig,
        store: Arc<dyn AggregateStore>,
    ) -> Result<Self, ReactionError> {
        Ok(Self {
            engine: Arc::new(Engine::start(config, store)?),
        })
    }

    /// Start observing `target`. The first observer triggers the initial fetches; dropping the
    /// last handle releases the target.
    pub fn observe(&self, target: TargetKey) -> TargetHandle {
        self.engine.core.lock().observe(target.clone());
        TargetHandle {
            engine: self.engine.clone(),
            target,
        }
    }

    /// Refetch every observed target. User reactions are fetched in one call per target type.
    pub fn refresh_all(&self) {
        self.engine.core.lock().refresh_all();
    }

    pub fn set_viewer_authenticated(&self, authenticated: bool) {
        self.engine
            .core
            .lock()
            .set_viewer_authenticated(authenticated);
    }

    pub fn is_viewer_authenticated(&self) -> bool {
        self.engine.core.lock().is_authenticated()
    }

    /// Queue an action for the core loop. Never blocks; failures arrive as updates.
    pub fn dispatch(&self, action: ReactionAction) {
        let _ = self.engine.core_tx.send(CoreMsg::Action(action));
    }

    /// Last committed snapshot of every observed target.
    pub fn state(&self) -> ReactionsState {
        self.engine.state()
    }

    /// Only the first listener is attached.
    pub fn listen_for_updates(&self, reconciler: Box<dyn ReactionReconciler>) {
        self.engine.listen_for_updates(reconciler);
    }
}

/// One observer of one target. Reads are computed from the current base and overlay; mutations
/// apply optimistically before returning.
pub struct TargetHandle {
    engine: Arc<Engine>,
    target: TargetKey,
}

impl TargetHandle {
    pub fn target(&self) -> &TargetKey {
        &self.target
    }

    /// Effective summary: the last fetched totals with in-flight changes merged in.
    pub fn summary(&self) -> AggregateSummary {
        self.engine
            .core
            .lock()
            .projection(&self.target)
            .map(|(summary, _, _)| summary)
            .unwrap_or_default()
    }

    pub fn mine(&self) -> UserReactionState {
        self.engine
            .core
            .lock()
            .projection(&self.target)
            .map(|(_, mine, _)| mine)
            .unwrap_or_default()
    }

    /// True while any fetch or submit for this target is outstanding.
    pub fn loading(&self) -> bool {
        self.engine
            .core
            .lock()
            .projection(&self.target)
            .is_some_and(|(_, _, loading)| loading)
    }

    pub fn view(&self) -> Option<TargetView> {
        self.engine.core.lock().view(&self.target)
    }

    pub fn refresh(&self) -> Result<(), ReactionError> {
        self.engine.core.lock().refresh_target(&self.target)
    }

    /// Flip LIKE, FAVORITE or BOOKMARK.
    pub fn toggle(&self, kind: ReactionKind) -> Result<Pending<()>, ReactionError> {
        let (tx, rx) = flume::bounded(1);
        self.engine
            .core
            .lock()
            .toggle(&self.target, kind, Reply::Toggle(tx))?;
        Ok(Pending { rx })
    }

    pub fn toggle_emoji(&self, emoji: &str) -> Result<Pending<()>, ReactionError> {
        let (tx, rx) = flume::bounded(1);
        self.engine
            .core
            .lock()
            .toggle_emoji(&self.target, emoji, Reply::Toggle(tx))?;
        Ok(Pending { rx })
    }

    /// Settles to `Ok(false)` if the backend answered without accepting the rating.
    pub fn rate(&self, value: u8) -> Result<Pending<bool>, ReactionError> {
        let (tx, rx) = flume::bounded(1);
        self.engine
            .core
            .lock()
            .rate(&self.target, value, Reply::Rate(tx))?;
        Ok(Pending { rx })
    }

    pub fn clear_rating(&self) -> Result<Pending<bool>, ReactionError> {
        let (tx, rx) = flume::bounded(1);
        self.engine
            .core
            .lock()
            .clear_rating(&self.target, Reply::Rate(tx))?;
        Ok(Pending { rx })
    }
}

impl Clone for TargetHandle {
    fn clone(&self) -> Self {
        self.engine.core.lock().observe(self.target.clone());
        Self {
            engine: self.engine.clone(),
            target: self.target.clone(),
        }
    }
}

impl Drop for TargetHandle {
    fn drop(&mut self) {
        self.engine.core.lock().release(&self.target);
    }
}

/// Outcome of a mutation whose optimistic change is already visible.
#[must_use = "dropping a Pending does not cancel the mutation, but its outcome is lost"]
pub struct Pending<T> {
    rx: Receiver<Result<T, ReactionError>>,
}

impl<T> Pending<T> {
    pub fn wait(self) -> Result<T, ReactionError> {
        self.rx
            .recv()
            .unwrap_or(Err(ReactionError::EngineStopped))
    }

    /// `None` if the mutation has not settled within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, ReactionError>> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(ReactionError::EngineStopped)),
        }
    }

    pub async fn settled(self) -> Result<T, ReactionError> {
        self.rx
            .recv_async()
            .await
            .unwrap_or(Err(ReactionError::EngineStopped))
    }
}

#[derive(uniffi::Object)]
pub struct FfiReactions {
    session: ReactionSession,
}

#[uniffi::export]
impl FfiReactions {
    #[uniffi::constructor]
    pub fn new(
        data_dir: String,
        backend: Box<dyn ReactionBackend>,
    ) -> Result<Arc<Self>, ReactionError> {
        Self::with_store(&data_dir, Arc::new(BackendStore::new(backend)))
    }

    pub fn state(&self) -> ReactionsState {
        self.session.state()
    }

    pub fn dispatch(&self, action: ReactionAction) {
        // Contract: never block caller.
        self.session.dispatch(action);
    }

    pub fn listen_for_updates(&self, reconciler: Box<dyn ReactionReconciler>) {
        self.session.listen_for_updates(reconciler);
    }
}

impl FfiReactions {
    /// Same as the FFI constructor, over any Rust store.
    pub fn with_store(
        data_dir: &str,
        store: Arc<dyn AggregateStore>,
    ) -> Result<Arc<Self>, ReactionError> {
        let session = ReactionSession::new(data_dir, store)?;
        Ok(Arc::new(Self { session }))
    }
}
