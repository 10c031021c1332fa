use anyhow::{anyhow, Context};
use reaction_core::{AggregateSummary, ReactionKind, TargetKey, UserReactionState};
use serde::Deserialize;

/// Initial backend contents. `totals` already include the viewer's own reactions.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub viewer_authenticated: bool,
    pub targets: Vec<SeedTarget>,
}

#[derive(Debug, Deserialize)]
pub struct SeedTarget {
    pub target: String,
    #[serde(default)]
    pub totals: AggregateSummary,
    #[serde(default)]
    pub viewer: UserReactionState,
}

fn wait_by_default() -> bool {
    true
}

fn default_settle_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Observe {
        target: String,
    },
    Release {
        target: String,
    },
    Refresh {
        target: String,
    },
    RefreshAll,
    Toggle {
        target: String,
        kind: ReactionKind,
        #[serde(default = "wait_by_default")]
        wait: bool,
    },
    ToggleEmoji {
        target: String,
        emoji: String,
        #[serde(default = "wait_by_default")]
        wait: bool,
    },
    Rate {
        target: String,
        value: u8,
        #[serde(default = "wait_by_default")]
        wait: bool,
    },
    ClearRating {
        target: String,
        #[serde(default = "wait_by_default")]
        wait: bool,
    },
    SetViewer {
        authenticated: bool,
    },
    /// The next `count` submits fail with a transport error.
    FailNextSubmits {
        count: usize,
        #[serde(default)]
        message: Option<String>,
    },
    RejectNextRates {
        count: u32,
    },
    /// Change the viewer's reactions behind the engine's back.
    EditViewer {
        target: String,
        viewer: UserReactionState,
    },
    /// Wait until no observed target is loading.
    Settle {
        #[serde(default = "default_settle_ms")]
        timeout_ms: u64,
    },
    Show {
        target: String,
    },
}

impl Step {
    pub fn op(&self) -> &'static str {
        match self {
            Step::Observe { .. } => "observe",
            Step::Release { .. } => "release",
            Step::Refresh { .. } => "refresh",
            Step::RefreshAll => "refresh_all",
            Step::Toggle { .. } => "toggle",
            Step::ToggleEmoji { .. } => "toggle_emoji",
            Step::Rate { .. } => "rate",
            Step::ClearRating { .. } => "clear_rating",
            Step::SetViewer { .. } => "set_viewer",
            Step::FailNextSubmits { .. } => "fail_next_submits",
            Step::RejectNextRates { .. } => "reject_next_rates",
            Step::EditViewer { .. } => "edit_viewer",
            Step::Settle { .. } => "settle",
            Step::Show { .. } => "show",
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            Step::Observe { target }
            | Step::Release { target }
            | Step::Refresh { target }
            | Step::Toggle { target, .. }
            | Step::ToggleEmoji { target, .. }
            | Step::Rate { target, .. }
            | Step::ClearRating { target, .. }
            | Step::EditViewer { target, .. }
            | Step::Show { target } => Some(target),
            _ => None,
        }
    }
}

/// `"type/id"` → [`TargetKey`]. The id may itself contain slashes.
pub fn parse_target(s: &str) -> anyhow::Result<TargetKey> {
    let (target_type, target_id) = s
        .split_once('/')
        .ok_or_else(|| anyhow!("target {s:?} must look like <type>/<id>"))?;
    if target_type.is_empty() || target_id.is_empty() {
        return Err(anyhow!("target {s:?} must look like <type>/<id>"));
    }
    Ok(TargetKey::new(target_type, target_id))
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> anyhow::Result<T> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}
