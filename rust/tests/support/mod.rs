#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reaction_core::{
    AggregateSummary, MemoryAggregateStore, ReactionReconciler, ReactionSession, ReactionUpdate,
    TargetHandle, TargetKey, UserReactionState,
};
use tempfile::TempDir;

pub fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("{what}: condition not met within {timeout:?}");
}

pub fn write_config(data_dir: &str, v: serde_json::Value) {
    let path = std::path::Path::new(data_dir).join("reactions_config.json");
    std::fs::write(path, serde_json::to_vec(&v).unwrap()).unwrap();
}

pub fn recipe() -> TargetKey {
    TargetKey::new("recipe", "42")
}

/// likes 10, favorites 2, bookmarks 0, 🔥 3, average 4.5 over 4 ratings; viewer has nothing.
pub fn seeded_totals() -> AggregateSummary {
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

pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<MemoryAggregateStore>,
    pub session: ReactionSession,
}

impl Fixture {
    pub fn data_dir(&self) -> &str {
        self.dir.path().to_str().unwrap()
    }

    /// Observe and wait for the initial fetches.
    pub fn observe(&self, key: TargetKey) -> TargetHandle {
        let handle = self.session.observe(key);
        settle(&handle);
        handle
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        // Let parked submits finish so their threads do not outlive the test.
        self.store.resume_submits();
    }
}

pub fn fixture() -> Fixture {
    fixture_with(|_| {})
}

/// `configure` runs against the data dir before the session reads its config.
pub fn fixture_with(configure: impl FnOnce(&str)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().to_str().unwrap().to_string();
    configure(&data_dir);

    let store = Arc::new(MemoryAggregateStore::new());
    store.seed(&recipe(), &seeded_totals(), UserReactionState::default());
    let session = ReactionSession::new(&data_dir, store.clone()).unwrap();
    session.set_viewer_authenticated(true);
    Fixture {
        dir,
        store,
        session,
    }
}

pub fn settle(handle: &TargetHandle) {
    wait_until("target settled", Duration::from_secs(5), || !handle.loading());
}

pub fn assert_close(actual: Option<f64>, expected: f64) {
    let actual = actual.expect("rating average present");
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected average {expected}, got {actual}"
    );
}

#[derive(Clone)]
pub struct Collector(pub Arc<Mutex<Vec<ReactionUpdate>>>);

impl Collector {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn snapshot(&self) -> Vec<ReactionUpdate> {
        self.0.lock().unwrap().clone()
    }

    pub fn any(&self, f: impl Fn(&ReactionUpdate) -> bool) -> bool {
        self.0.lock().unwrap().iter().any(f)
    }
}

impl ReactionReconciler for Collector {
    fn reconcile(&self, update: ReactionUpdate) {
        self.0.lock().unwrap().push(update);
    }
}
