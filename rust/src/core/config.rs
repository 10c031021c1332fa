use std::path::Path;

use serde::Deserialize;

use super::ReactionCore;

pub(crate) const CONFIG_FILE_NAME: &str = "reactions_config.json";

const DEFAULT_WORKER_THREADS: usize = 2;
const DEFAULT_MAX_EMOJI_BYTES: usize = 64;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub worker_threads: Option<usize>,
    /// Evict a target's cell once its last observer releases it.
    pub evict_unobserved: Option<bool>,
    /// Emit `Conflict` updates when a fetch contradicts a confirmed optimistic write.
    pub report_conflicts: Option<bool>,
    pub max_emoji_bytes: Option<usize>,
    /// Ask the store for the per-emoji breakdown with each summary fetch.
    pub fetch_breakdown: Option<bool>,
}

impl EngineConfig {
    pub(crate) fn worker_threads(&self) -> usize {
        self.worker_threads
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_WORKER_THREADS)
    }
}

/// Missing or unreadable config falls back to defaults.
pub fn load_engine_config(data_dir: &str) -> EngineConfig {
    let path = Path::new(data_dir).join(CONFIG_FILE_NAME);
    let Ok(bytes) = std::fs::read(&path) else {
        return EngineConfig::default();
    };
    match serde_json::from_slice::<EngineConfig>(&bytes) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %path.display(), %e, "ignoring malformed engine config");
            EngineConfig::default()
        }
    }
}

impl ReactionCore {
    pub(super) fn evict_unobserved(&self) -> bool {
        self.config.evict_unobserved.unwrap_or(true)
    }

    pub(super) fn report_conflicts(&self) -> bool {
        self.config.report_conflicts.unwrap_or(true)
    }

    pub(super) fn max_emoji_bytes(&self) -> usize {
        self.config
            .max_emoji_bytes
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_EMOJI_BYTES)
    }

    pub(super) fn fetch_breakdown(&self) -> bool {
        self.config.fetch_breakdown.unwrap_or(true)
    }
}
