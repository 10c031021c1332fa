mod script;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use reaction_core::{
    merge_summary, AggregateSummary, EngineConfig, MemoryAggregateStore, ReactionError,
    ReactionSession, StoreError, TargetHandle, TargetKey, UserReactionState,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::script::{parse_target, read_json, Seed, Step};

#[derive(Debug, Parser)]
#[command(name = "reactions-cli")]
#[command(about = "Drive the reaction engine against an in-memory backend")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Seed an in-memory backend and run a scripted sequence of steps
    Simulate {
        /// JSON file with initial backend totals and viewer reactions
        #[arg(long)]
        seed: PathBuf,

        /// JSON array of steps
        #[arg(long)]
        script: PathBuf,

        /// Data dir holding reactions_config.json (defaults apply without one)
        #[arg(long, env = "REACTIONS_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },

    /// Merge a pending viewer change into a summary
    Merge {
        /// JSON file with `base`, `effective` and `summary`
        #[arg(long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match &cli.cmd {
        Command::Simulate {
            seed,
            script,
            data_dir,
        } => cmd_simulate(seed, script, data_dir.as_ref()).await,
        Command::Merge { input } => cmd_merge(input),
    }
}

fn print(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn projection(handle: &TargetHandle) -> Value {
    json!({
        "target": handle.target().to_string(),
        "summary": handle.summary(),
        "mine": handle.mine(),
        "loading": handle.loading(),
    })
}

fn outcome<T: serde::Serialize>(result: Result<T, ReactionError>) -> Value {
    match result {
        Ok(v) => json!({ "ok": v }),
        Err(e) => json!({ "error": e.to_string() }),
    }
}

// ── simulate ────────────────────────────────────────────────────────────────

async fn cmd_simulate(
    seed_path: &PathBuf,
    script_path: &PathBuf,
    data_dir: Option<&PathBuf>,
) -> anyhow::Result<()> {
    let seed: Seed = read_json(seed_path)?;
    let steps: Vec<Step> = read_json(script_path)?;

    let store = Arc::new(MemoryAggregateStore::new());
    for t in &seed.targets {
        let key = parse_target(&t.target)?;
        store.seed(&key, &t.totals, t.viewer.clone());
    }

    let session = match data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create data dir {}", dir.display()))?;
            let dir = dir
                .to_str()
                .ok_or_else(|| anyhow!("data dir {} is not UTF-8", dir.display()))?;
            ReactionSession::new(dir, store.clone())?
        }
        None => ReactionSession::with_config(EngineConfig::default(), store.clone())?,
    };
    session.set_viewer_authenticated(seed.viewer_authenticated);

    let mut handles: HashMap<TargetKey, TargetHandle> = HashMap::new();
    for (index, step) in steps.into_iter().enumerate() {
        let op = step.op();
        let key = step.target().map(parse_target).transpose()?;
        tracing::debug!(index, op, "running step");
        let result = run_step(&session, &store, &mut handles, step).await?;

        let mut out = json!({ "step": index, "op": op, "result": result });
        if let Some(handle) = key.as_ref().and_then(|k| handles.get(k)) {
            out["projection"] = projection(handle);
        }
        print(&out)?;
    }

    let totals: Vec<Value> = handles
        .keys()
        .map(|k| json!({ "target": k.to_string(), "backend": store.totals(k) }))
        .collect();
    print(&json!({ "backend_totals": totals, "calls": format!("{:?}", store.calls()) }))?;
    Ok(())
}

fn handle<'a>(
    handles: &'a HashMap<TargetKey, TargetHandle>,
    target: &str,
) -> anyhow::Result<&'a TargetHandle> {
    let key = parse_target(target)?;
    handles
        .get(&key)
        .ok_or_else(|| anyhow!("{key} is not observed; add an observe step first"))
}

async fn settle(
    handles: &HashMap<TargetKey, TargetHandle>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let start = Instant::now();
    while handles.values().any(TargetHandle::loading) {
        if start.elapsed() > timeout {
            return Err(anyhow!("targets still loading after {timeout:?}"));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

async fn run_step(
    session: &ReactionSession,
    store: &MemoryAggregateStore,
    handles: &mut HashMap<TargetKey, TargetHandle>,
    step: Step,
) -> anyhow::Result<Value> {
    let result = match step {
        Step::Observe { target } => {
            let key = parse_target(&target)?;
            let h = session.observe(key.clone());
            handles.insert(key, h);
            settle(handles, Duration::from_secs(5)).await?;
            Value::Null
        }
        Step::Release { target } => {
            let key = parse_target(&target)?;
            handles.remove(&key);
            Value::Null
        }
        Step::Refresh { target } => outcome(handle(handles, &target)?.refresh()),
        Step::RefreshAll => {
            session.refresh_all();
            Value::Null
        }
        Step::Toggle { target, kind, wait } => {
            let pending = handle(handles, &target)?.toggle(kind);
            settle_pending(pending, wait).await
        }
        Step::ToggleEmoji {
            target,
            emoji,
            wait,
        } => {
            let pending = handle(handles, &target)?.toggle_emoji(&emoji);
            settle_pending(pending, wait).await
        }
        Step::Rate {
            target,
            value,
            wait,
        } => {
            let pending = handle(handles, &target)?.rate(value);
            settle_pending(pending, wait).await
        }
        Step::ClearRating { target, wait } => {
            let pending = handle(handles, &target)?.clear_rating();
            settle_pending(pending, wait).await
        }
        Step::SetViewer { authenticated } => {
            session.set_viewer_authenticated(authenticated);
            Value::Null
        }
        Step::FailNextSubmits { count, message } => {
            let message = message.unwrap_or_else(|| "simulated outage".to_string());
            store.fail_next_submits(count, StoreError::Transport(message));
            Value::Null
        }
        Step::RejectNextRates { count } => {
            store.reject_next_rates(count);
            Value::Null
        }
        Step::EditViewer { target, viewer } => {
            store.set_viewer_reactions(&parse_target(&target)?, viewer);
            Value::Null
        }
        Step::Settle { timeout_ms } => {
            settle(handles, Duration::from_millis(timeout_ms)).await?;
            Value::Null
        }
        Step::Show { .. } => Value::Null,
    };
    Ok(result)
}

async fn settle_pending<T: serde::Serialize>(
    pending: Result<reaction_core::Pending<T>, ReactionError>,
    wait: bool,
) -> Value {
    match pending {
        Err(e) => json!({ "rejected": e.to_string() }),
        Ok(_) if !wait => json!("pending"),
        Ok(p) => outcome(p.settled().await),
    }
}

// ── merge ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MergeInput {
    base: UserReactionState,
    effective: UserReactionState,
    summary: AggregateSummary,
}

fn cmd_merge(input: &PathBuf) -> anyhow::Result<()> {
    let input: MergeInput = read_json(input)?;
    let merged = merge_summary(&input.base, &input.effective, &input.summary);
    print(&serde_json::to_value(merged).context("serialize merged summary")?)
}
