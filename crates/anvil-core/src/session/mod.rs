//! Top-level session drivers for debug and harden modes.
//!
//! The driver owns the run's state machine: it persists run metadata and
//! status, builds the shared inputs, provisions worktrees, fans out one
//! runner per track, fans back in with panic containment, judges, and (in
//! debug mode) applies the winning patch. Session-level failures after the
//! run directory exists always leave a `CRASH.txt` next to a FAIL status.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::apply::{apply_patch, ApplyOutcome};
use crate::blackboard;
use crate::config::{ConfigError, SessionConfig};
use crate::context::{build_context, DEFAULT_MAX_FILES};
use crate::events::EventLog;
use crate::judge::{self, JudgeDecision};
use crate::provider::ProviderRegistry;
use crate::repro::write_repro_plan;
use crate::schema::{RunMeta, RunState, RunStatus};
use crate::shell::CommandRunner;
use crate::store::ArtifactStore;
use crate::track::{run_track, DisqualifyReason, SharedInputs, TrackOutcome, TrackParams};
use crate::verify;
use crate::worktree::{WorktreeError, WorktreeManager};

const DEFAULT_CONTAINER_IMAGE: &str = "anvil:latest";

/// Session-level failures, mapped to CLI exit codes by the caller.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Environment(#[from] WorktreeError),

    /// A tracked artifact from a prior run no longer validates.
    #[error("tracked artifact failed validation: {0}")]
    ArtifactDrift(String),

    #[error("session interrupted by operator")]
    Interrupted,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// What a finished session reports to the CLI.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub status: RunState,
    pub run_dir: PathBuf,
    pub decision_file: Option<PathBuf>,
    pub winner: Option<String>,
}

/// Run a debug session to completion.
pub async fn run_debug(
    cfg: &SessionConfig,
    cancel: CancellationToken,
) -> Result<RunResult, SessionError> {
    let store = ArtifactStore::new(cfg.run_dir());
    store
        .ensure()
        .map_err(|e| SessionError::Internal(e.into()))?;
    let events = EventLog::new(cfg.run_dir().join("events.jsonl"));

    match debug_session(cfg, &store, &events, cancel).await {
        Ok(result) => Ok(result),
        Err(e) => {
            capture_crash(cfg, &store, &events, &e);
            Err(e)
        }
    }
}

/// Run a harden session to completion.
pub async fn run_harden(
    cfg: &SessionConfig,
    cancel: CancellationToken,
) -> Result<RunResult, SessionError> {
    let store = ArtifactStore::new(cfg.run_dir());
    store
        .ensure()
        .map_err(|e| SessionError::Internal(e.into()))?;
    let events = EventLog::new(cfg.run_dir().join("events.jsonl"));

    match harden_session(cfg, &store, &events, cancel).await {
        Ok(result) => Ok(result),
        Err(e) => {
            capture_crash(cfg, &store, &events, &e);
            Err(e)
        }
    }
}

async fn debug_session(
    cfg: &SessionConfig,
    store: &ArtifactStore,
    events: &EventLog,
    cancel: CancellationToken,
) -> Result<RunResult, SessionError> {
    // Resume: a completed run is a no-op on disk.
    let mut issue_text = cfg.issue_text.clone().unwrap_or_default();
    if cfg.resume {
        if let Some(status) = load_existing_status(store)? {
            if matches!(status.status, RunState::Ok | RunState::Done) {
                tracing::info!(run_id = %cfg.run_id, status = status.status.as_str(), "run already complete, resume is a no-op");
                return Ok(RunResult {
                    status: status.status,
                    run_dir: store.run_dir().to_path_buf(),
                    decision_file: existing(store, "DECISION.md"),
                    winner: read_winner(store),
                });
            }
        }
        // Recover the issue text from the prior run's metadata.
        if issue_text.is_empty() && store.exists("RUN.json") {
            let meta: RunMeta = store
                .read_json("RUN.json")
                .map_err(|e| SessionError::ArtifactDrift(format!("RUN.json: {e}")))?;
            issue_text = meta.issue_text.unwrap_or_default();
        }
        events.emit("resume", "load_state", serde_json::json!({"run_id": cfg.run_id}));
    }

    if !cfg.resume {
        write_meta(cfg, store, Some(issue_text.clone()))?;
    }
    // A crash marker from a prior attempt is stale once this run is RUNNING
    // again; FAIL and CRASH.txt must stay paired.
    store.remove("CRASH.txt").map_err(anyhow::Error::from)?;
    set_status(store, cfg, RunState::Running, "starting", "")?;

    // Provision isolation before fan-out; a branch conflict or a
    // non-version-controlled repo fails the whole session here.
    let worktrees = WorktreeManager::new(&cfg.repo_path, &cfg.run_id)?;
    events.emit("setup", "worktrees_create", serde_json::json!({}));
    for track in &cfg.tracks {
        if cfg.resume && worktrees.get_path(&track.name).exists() {
            continue;
        }
        worktrees.create(&track.name)?;
        worktrees.write_contract(track)?;
    }

    // Shared inputs from the read-only collaborators.
    set_status(store, cfg, RunState::Running, "context", "")?;
    if !(cfg.resume && store.exists("CONTEXT.md")) {
        build_context(store, &cfg.repo_path, &issue_text, DEFAULT_MAX_FILES)?;
    }
    if !(cfg.resume && store.exists("REPRO.md")) {
        write_repro_plan(store, &cfg.repo_path, &issue_text)?;
    }
    let context_text = store.read_to_string("CONTEXT.md").unwrap_or_default();
    let repro_text = store.read_to_string("REPRO.md").unwrap_or_default();
    let contract = verify::load_contract(&cfg.repo_path)?;

    let shared = Arc::new(SharedInputs {
        issue_text: issue_text.clone(),
        context_text,
        repro_text,
        track_names: cfg.tracks.iter().map(|t| t.name.clone()).collect(),
        contract,
        verify_on_patch: true,
        resume: cfg.resume,
    });

    set_status(store, cfg, RunState::Running, "iterate", "")?;
    let outcomes = fan_out(cfg, store, events, &worktrees, shared, &cancel).await;

    if cancel.is_cancelled() {
        return Err(SessionError::Interrupted);
    }

    blackboard::write(store, &track_names(cfg)).map_err(anyhow::Error::from)?;

    set_status(store, cfg, RunState::Running, "judge", "")?;
    events.emit("judge", "run", serde_json::json!({}));
    let decision = judge::run(store, &outcomes)?;

    // Apply the winner's latest patch, guarded by a dry-run.
    let mut applied = false;
    if let Some(winner) = &decision.winner {
        if cfg.auto_apply {
            if let Some(patch) = latest_patch(store, winner) {
                set_status(store, cfg, RunState::Running, "apply", "")?;
                events.emit(
                    "apply",
                    "run",
                    serde_json::json!({"winner": winner, "patch": patch.display().to_string()}),
                );
                let outcome =
                    apply_patch(store, &cfg.repo_path, &CommandRunner::host(), &patch).await?;
                applied = outcome == ApplyOutcome::Applied;
            }
        } else {
            events.emit("apply", "skipped", serde_json::json!({"reason": "auto-apply disabled"}));
        }
    }

    let status = if decision.winner.is_some() && !applied {
        RunState::Done
    } else {
        RunState::Ok
    };
    finish_status(store, cfg, status, "completed", &outcomes)?;
    Ok(RunResult {
        status,
        run_dir: store.run_dir().to_path_buf(),
        decision_file: existing(store, "DECISION.md"),
        winner: decision.winner,
    })
}

async fn harden_session(
    cfg: &SessionConfig,
    store: &ArtifactStore,
    events: &EventLog,
    cancel: CancellationToken,
) -> Result<RunResult, SessionError> {
    write_meta(cfg, store, cfg.issue_text.clone())?;
    store.remove("CRASH.txt").map_err(anyhow::Error::from)?;
    set_status(store, cfg, RunState::Running, "starting", "")?;

    let issue_text = cfg.issue_text.clone().unwrap_or_else(|| {
        "Harden this codebase: find defects, missing tests, and edge cases.".to_string()
    });

    events.emit("harden", "context", serde_json::json!({}));
    set_status(store, cfg, RunState::Running, "context", "")?;
    build_context(store, &cfg.repo_path, &issue_text, DEFAULT_MAX_FILES)?;
    let context_text = store.read_to_string("CONTEXT.md").unwrap_or_default();

    // Baseline verification of the unmodified tree gives breakers a known
    // starting point.
    events.emit("harden", "verify_baseline", serde_json::json!({}));
    set_status(store, cfg, RunState::Running, "verify_baseline", "")?;
    let contract = verify::load_contract(&cfg.repo_path)?;
    let runner = runner_for(cfg);
    verify::run(store, &cfg.repo_path, &runner, &contract).await?;
    let baseline = store.read_to_string("VERIFY.md").unwrap_or_default();

    let worktrees = WorktreeManager::new(&cfg.repo_path, &cfg.run_id)?;
    for track in &cfg.tracks {
        worktrees.create(&track.name)?;
        worktrees.write_contract(track)?;
    }

    let mut seed = String::from(
        "# BLACKBOARD (observations-only)\n\n## objective\n\
         Find defects, missing tests, edge cases, and quality issues.\n\n\
         ## baseline verification\n",
    );
    seed.push_str(clamp_bytes(&baseline, 2000));
    store
        .write_text("BLACKBOARD.md", &seed)
        .map_err(anyhow::Error::from)?;

    let shared = Arc::new(SharedInputs {
        issue_text,
        context_text,
        repro_text: String::new(),
        track_names: track_names(cfg),
        contract,
        verify_on_patch: cfg.verify_patches,
        resume: false,
    });

    set_status(store, cfg, RunState::Running, "iterate", "")?;
    events.emit(
        "harden",
        "parallel_breakers",
        serde_json::json!({"num_tracks": cfg.tracks.len()}),
    );
    let outcomes = fan_out(cfg, store, events, &worktrees, shared, &cancel).await;

    if cancel.is_cancelled() {
        return Err(SessionError::Interrupted);
    }

    blackboard::write(store, &track_names(cfg)).map_err(anyhow::Error::from)?;

    set_status(store, cfg, RunState::Running, "judge", "")?;
    let decision = judge::run(store, &outcomes)?;
    write_harden_report(cfg, store, &decision, &outcomes, &baseline)?;

    finish_status(store, cfg, RunState::Done, "harden completed", &outcomes)?;
    Ok(RunResult {
        status: RunState::Done,
        run_dir: store.run_dir().to_path_buf(),
        decision_file: existing(store, "HARDEN.md"),
        winner: decision.winner,
    })
}

/// Spawn one runner per track and await them all.
///
/// Partial failure is contained twice over: the runner converts its own
/// errors into disqualified outcomes, and a panicking task is caught at the
/// join boundary, recorded as a track crash, and synthesized into a
/// disqualification. One track can never cancel another.
async fn fan_out(
    cfg: &SessionConfig,
    store: &ArtifactStore,
    events: &EventLog,
    worktrees: &WorktreeManager,
    shared: Arc<SharedInputs>,
    cancel: &CancellationToken,
) -> Vec<TrackOutcome> {
    let registry = ProviderRegistry::default();
    let runner = runner_for(cfg);

    let mut handles = Vec::with_capacity(cfg.tracks.len());
    for track_cfg in &cfg.tracks {
        let params = TrackParams {
            store: store.clone(),
            worktree: worktrees.clone(),
            runner: runner.clone(),
            provider: registry.build(track_cfg),
            cfg: track_cfg.clone(),
            shared: Arc::clone(&shared),
            cancel: cancel.clone(),
            events: events.clone(),
        };
        handles.push((track_cfg.clone(), tokio::spawn(run_track(params))));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (track_cfg, handle) in handles {
        match handle.await {
            Ok(outcome) => outcomes.push(outcome),
            Err(join_err) => {
                tracing::error!(track = %track_cfg.name, error = %join_err, "track task panicked");
                let _ = store.write_text(
                    format!("tracks/{}/CRASH.txt", track_cfg.name),
                    &format!("track task panicked: {join_err}\n"),
                );
                events.emit(
                    "iterate",
                    "crash",
                    serde_json::json!({"track": track_cfg.name, "error": join_err.to_string()}),
                );
                outcomes.push(TrackOutcome {
                    name: track_cfg.name.clone(),
                    role: track_cfg.role,
                    iterations_run: 0,
                    timeouts: 0,
                    has_patch: false,
                    done: false,
                    disqualified: Some(DisqualifyReason::InternalCrash),
                });
            }
        }
    }
    outcomes
}

fn write_harden_report(
    cfg: &SessionConfig,
    store: &ArtifactStore,
    decision: &JudgeDecision,
    outcomes: &[TrackOutcome],
    baseline: &str,
) -> Result<(), SessionError> {
    let mut md = format!(
        "# HARDEN Report\n\nRun ID: `{}`\nTracks: {}\nDisqualified: {}\n\n## Baseline verification\n\n",
        cfg.run_id,
        outcomes.len(),
        outcomes.iter().filter(|o| o.disqualified.is_some()).count(),
    );
    md.push_str(clamp_bytes(baseline, 3000));
    md.push_str("\n\n## Findings by track (ranked)\n\n");

    // Rank by judge score, highest first.
    let mut ranked: Vec<&TrackOutcome> = outcomes.iter().collect();
    ranked.sort_by(|a, b| {
        let score = |o: &TrackOutcome| decision.tracks.get(&o.name).map(|e| e.score).unwrap_or(0.0);
        score(b)
            .partial_cmp(&score(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });

    for outcome in ranked {
        let score = decision
            .tracks
            .get(&outcome.name)
            .map(|e| e.score)
            .unwrap_or(0.0);
        md.push_str(&format!("### {} (score {score:.1})\n", outcome.name));
        if let Some(reason) = outcome.disqualified {
            md.push_str(&format!("**DISQUALIFIED: {reason}**\n"));
        }
        match judge::latest_valid_envelope(store, &outcome.name) {
            Some((iter, env)) => {
                md.push_str(&format!("- [iter {iter}] {}\n", env.hypothesis));
                for obs in &env.observations {
                    md.push_str(&format!("- {obs}\n"));
                }
            }
            None => md.push_str("No findings.\n"),
        }
        md.push('\n');
    }

    md.push_str("## Generated patches\n\n");
    let mut any = false;
    for outcome in outcomes {
        for iter in blackboard::iteration_numbers(store, &outcome.name) {
            let rel = format!("tracks/{}/iter_{iter:02}/PATCH.diff", outcome.name);
            if store.exists(&rel) {
                md.push_str(&format!("- `{rel}`\n"));
                any = true;
            }
        }
    }
    if !any {
        md.push_str("(none)\n");
    }

    store.write_text("HARDEN.md", &md).map_err(anyhow::Error::from)?;
    Ok(())
}

/// Latest iteration patch for a track, if any.
fn latest_patch(store: &ArtifactStore, track: &str) -> Option<PathBuf> {
    let mut iters = blackboard::iteration_numbers(store, track);
    iters.sort_unstable_by(|a, b| b.cmp(a));
    for iter in iters {
        let rel = format!("tracks/{track}/iter_{iter:02}/PATCH.diff");
        if store.exists(&rel) {
            return store.path(rel).ok();
        }
    }
    None
}

fn runner_for(cfg: &SessionConfig) -> CommandRunner {
    if cfg.container {
        let image = std::env::var("ANVIL_CONTAINER_IMAGE")
            .unwrap_or_else(|_| DEFAULT_CONTAINER_IMAGE.to_string());
        CommandRunner::container(image)
    } else {
        CommandRunner::host()
    }
}

fn track_names(cfg: &SessionConfig) -> Vec<String> {
    cfg.tracks.iter().map(|t| t.name.clone()).collect()
}

/// Truncate to at most `max` bytes without splitting a UTF-8 character.
fn clamp_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn write_meta(
    cfg: &SessionConfig,
    store: &ArtifactStore,
    issue_text: Option<String>,
) -> Result<(), SessionError> {
    let meta = RunMeta {
        schema_version: 1,
        run_id: cfg.run_id.clone(),
        mode: cfg.mode,
        started_at: chrono::Utc::now(),
        issue_text,
        tracks: cfg.tracks.clone(),
        config_digest: cfg.digest(),
        container: cfg.container,
    };
    store.write_json("RUN.json", &meta).map_err(anyhow::Error::from)?;
    Ok(())
}

fn set_status(
    store: &ArtifactStore,
    cfg: &SessionConfig,
    state: RunState,
    phase: &str,
    message: &str,
) -> Result<(), SessionError> {
    let status = RunStatus::new(&cfg.run_id, cfg.mode, state, phase).with_message(message);
    store
        .write_json("RUN_STATUS.json", &status)
        .map_err(anyhow::Error::from)?;
    Ok(())
}

fn finish_status(
    store: &ArtifactStore,
    cfg: &SessionConfig,
    state: RunState,
    message: &str,
    outcomes: &[TrackOutcome],
) -> Result<(), SessionError> {
    let mut status =
        RunStatus::new(&cfg.run_id, cfg.mode, state, "completed").with_message(message);
    status.disqualified_tracks = outcomes
        .iter()
        .filter(|o| o.disqualified.is_some())
        .map(|o| o.name.clone())
        .collect();
    store
        .write_json("RUN_STATUS.json", &status)
        .map_err(anyhow::Error::from)?;
    Ok(())
}

fn load_existing_status(store: &ArtifactStore) -> Result<Option<RunStatus>, SessionError> {
    if !store.exists("RUN_STATUS.json") {
        return Ok(None);
    }
    store
        .read_json::<RunStatus>("RUN_STATUS.json")
        .map(Some)
        .map_err(|e| SessionError::ArtifactDrift(format!("RUN_STATUS.json: {e}")))
}

fn read_winner(store: &ArtifactStore) -> Option<String> {
    store
        .read_json::<JudgeDecision>("SCORECARD.json")
        .ok()
        .and_then(|d| d.winner)
}

fn existing(store: &ArtifactStore, rel: &str) -> Option<PathBuf> {
    store.exists(rel).then(|| store.path(rel).ok()).flatten()
}

/// Record a session-level failure: `CRASH.txt` at the run root, FAIL
/// status, and best-effort worktree cleanup.
fn capture_crash(cfg: &SessionConfig, store: &ArtifactStore, events: &EventLog, e: &SessionError) {
    tracing::error!(run_id = %cfg.run_id, error = %e, "session failed");
    events.emit("crash", "exception", serde_json::json!({"error": format!("{e:#}")}));
    let _ = store.write_text("CRASH.txt", &format!("{e:#}\n\ndetail:\n{e:?}\n"));
    let mut status = RunStatus::new(&cfg.run_id, cfg.mode, RunState::Fail, "crashed")
        .with_message(format!("{e}"));
    if matches!(e, SessionError::Interrupted) {
        status.message = "interrupted by operator".to_string();
    }
    let _ = store.write_json("RUN_STATUS.json", &status);

    // Worktree cleanup on failure is opt-in; the default leaves state on
    // disk for inspection and `anvil cleanup run`.
    let cleanup_on_fail = std::env::var("ANVIL_CLEANUP_ON_FAIL")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);
    if cleanup_on_fail {
        if let Ok(worktrees) = WorktreeManager::new(&cfg.repo_path, &cfg.run_id) {
            if let Err(cleanup_err) = worktrees.cleanup_all() {
                tracing::warn!(error = %cleanup_err, "best-effort worktree cleanup failed");
            }
        }
    }
}
