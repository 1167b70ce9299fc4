//! Per-track iteration loop.
//!
//! Each track runs independently of its peers: it iterates an agent adapter
//! up to its budget, persists every artifact through the store, refreshes
//! the shared blackboard at iteration boundaries, and converts every
//! failure into either a recorded iteration failure or a terminal
//! disqualification. Nothing that happens here can propagate to another
//! track; the session driver additionally contains panics at the join
//! boundary.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::blackboard;
use crate::config::{Role, TrackConfig};
use crate::events::EventLog;
use crate::provider::{IterationContext, Provider, ProviderOutcome};
use crate::redact::Redactor;
use crate::schema::{
    validate_iteration, validate_iteration_value, CheckRecord, IterationEnvelope, ProvisionRecord,
    StatusSignal,
};
use crate::shell::{CommandRequest, CommandRunner};
use crate::store::ArtifactStore;
use crate::verify::VerifyContract;
use crate::worktree::WorktreeManager;

/// Slack added on top of the adapter's own timeout enforcement so the
/// backstop only fires when the adapter failed to reap its process.
const TIMEOUT_BACKSTOP_GRACE: Duration = Duration::from_secs(15);

/// Enumerated reasons a track is excluded from winner selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisqualifyReason {
    WorktreeFailure,
    SchemaDrift,
    TimeoutFailure,
    NoPatch,
    InternalCrash,
}

impl std::fmt::Display for DisqualifyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisqualifyReason::WorktreeFailure => "WorktreeFailure",
            DisqualifyReason::SchemaDrift => "SchemaDrift",
            DisqualifyReason::TimeoutFailure => "TimeoutFailure",
            DisqualifyReason::NoPatch => "NoPatch",
            DisqualifyReason::InternalCrash => "InternalCrash",
        };
        f.write_str(s)
    }
}

/// Terminal state of one track, persisted as `tracks/<name>/TRACK.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackOutcome {
    pub name: String,
    pub role: Role,
    /// Iterations that produced a validated envelope.
    pub iterations_run: u32,
    pub timeouts: u32,
    pub has_patch: bool,
    pub done: bool,
    pub disqualified: Option<DisqualifyReason>,
}

/// Inputs shared by every track of a session.
#[derive(Debug)]
pub struct SharedInputs {
    pub issue_text: String,
    pub context_text: String,
    pub repro_text: String,
    pub track_names: Vec<String>,
    pub contract: VerifyContract,
    /// Run the verifier opportunistically whenever an iteration produces a
    /// patch.
    pub verify_on_patch: bool,
    pub resume: bool,
}

/// Everything one track runner needs.
pub struct TrackParams {
    pub store: ArtifactStore,
    pub worktree: WorktreeManager,
    pub runner: CommandRunner,
    pub cfg: TrackConfig,
    pub provider: Box<dyn Provider>,
    pub shared: Arc<SharedInputs>,
    pub cancel: CancellationToken,
    pub events: EventLog,
}

/// Drive one track to a terminal outcome.
///
/// Infallible by design: every error path becomes a disqualification (with
/// `CRASH.txt` for internal failures) rather than an `Err`.
pub async fn run_track(params: TrackParams) -> TrackOutcome {
    let name = params.cfg.name.clone();
    match run_track_inner(&params).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(track = %name, error = ?e, "track crashed");
            write_crash(&params.store, &name, &e);
            params
                .events
                .emit("iterate", "crash", serde_json::json!({"track": name, "error": format!("{e:#}")}));
            finish(
                &params.store,
                TrackOutcome {
                    name,
                    role: params.cfg.role,
                    iterations_run: 0,
                    timeouts: 0,
                    has_patch: false,
                    done: false,
                    disqualified: Some(DisqualifyReason::InternalCrash),
                },
            )
        }
    }
}

async fn run_track_inner(params: &TrackParams) -> anyhow::Result<TrackOutcome> {
    let cfg = &params.cfg;
    let store = &params.store;
    let name = cfg.name.clone();
    let mut outcome = TrackOutcome {
        name: name.clone(),
        role: cfg.role,
        iterations_run: 0,
        timeouts: 0,
        has_patch: false,
        done: false,
        disqualified: None,
    };

    // PROVISION: the worktree was created by the driver before fan-out; a
    // missing checkout here means provisioning failed for this track.
    let wt_path = params.worktree.get_path(&name);
    if !wt_path.exists() {
        tracing::warn!(track = %name, path = %wt_path.display(), "worktree missing at provision");
        outcome.disqualified = Some(DisqualifyReason::WorktreeFailure);
        return Ok(finish(store, outcome));
    }
    let provision_rel = format!("tracks/{name}/PROVISION.json");
    if !store.exists(&provision_rel) {
        store.write_json(
            &provision_rel,
            &ProvisionRecord {
                schema_version: 1,
                track: name.clone(),
                provisioned_at: chrono::Utc::now(),
            },
        )?;
    }

    let timeout = Duration::from_secs(cfg.budget.per_iter_timeout_s);
    let redactor = Redactor::default();

    for iteration in 1..=cfg.budget.max_iters {
        if params.cancel.is_cancelled() {
            tracing::info!(track = %name, iteration, "cancelled, skipping remaining iterations");
            break;
        }

        let iter_rel = format!("tracks/{name}/iter_{iteration:02}");

        // Resume: an iteration with a validated envelope is final.
        if params.shared.resume {
            if let Some(envelope) = existing_valid_iteration(store, &iter_rel) {
                outcome.iterations_run = iteration;
                outcome.has_patch |= store.exists(format!("{iter_rel}/PATCH.diff"));
                if envelope.status_signal == StatusSignal::Done {
                    outcome.done = true;
                    break;
                }
                continue;
            }
        }

        let iter_dir = store.mkdirs(&iter_rel)?;
        let blackboard_text = store.read_to_string("BLACKBOARD.md").unwrap_or_default();
        let ctx = IterationContext {
            track: name.clone(),
            role: cfg.role,
            iteration,
            issue_text: params.shared.issue_text.clone(),
            context_text: params.shared.context_text.clone(),
            repro_text: params.shared.repro_text.clone(),
            blackboard_text,
            directives: cfg.directives.clone(),
            model: cfg.model.clone(),
            worktree: wt_path.clone(),
            logs_dir: iter_dir.clone(),
            timeout,
        };

        params.events.emit(
            "iterate",
            "provider_call",
            serde_json::json!({
                "track": name,
                "iter": iteration,
                "provider": cfg.provider,
                "model": cfg.model.clone().unwrap_or_default(),
            }),
        );

        let call = params.provider.run_iteration(&ctx, &params.runner);
        let result = tokio::select! {
            _ = params.cancel.cancelled() => break,
            r = tokio::time::timeout(timeout + TIMEOUT_BACKSTOP_GRACE, call) => r,
        };

        let provider_outcome: ProviderOutcome = match result {
            // Backstop elapsed: the adapter never came back. The command
            // runner reaps its own child; nothing left to wait on here.
            Err(_elapsed) => {
                record_timeout(store, &iter_rel, &name, iteration, &mut outcome)?;
                continue;
            }
            Ok(Err(e)) => {
                // Adapter failure (missing binary, non-zero agent exit,
                // unknown provider). Contained as a track crash.
                write_crash(store, &name, &e);
                params.events.emit(
                    "iterate",
                    "provider_error",
                    serde_json::json!({"track": name, "iter": iteration, "error": format!("{e:#}")}),
                );
                outcome.disqualified = Some(DisqualifyReason::InternalCrash);
                break;
            }
            Ok(Ok(o)) => o,
        };

        if provider_outcome.timed_out {
            let raw = redactor.redact(&provider_outcome.raw_text);
            store.write_text(format!("{iter_rel}/ITERATION.txt"), &raw)?;
            record_timeout(store, &iter_rel, &name, iteration, &mut outcome)?;
            continue;
        }

        // Persist the redacted raw output regardless of what validation says.
        store.write_text(
            format!("{iter_rel}/ITERATION.txt"),
            &redactor.redact(&provider_outcome.raw_text),
        )?;

        let validated = match &provider_outcome.envelope_json {
            Some(value) => validate_iteration_value(value),
            None => validate_iteration(&provider_outcome.raw_text),
        };
        let envelope = match validated {
            Ok(envelope) => envelope,
            Err(e) => {
                store.write_json(
                    format!("{iter_rel}/CHECK_iterate.json"),
                    &CheckRecord {
                        schema_version: 1,
                        name: "iterate_schema".to_string(),
                        ok: false,
                        exit_code: 2,
                        details: format!("invalid ITERATION.json: {e}"),
                    },
                )?;
                params.events.emit(
                    "iterate",
                    "disqualified",
                    serde_json::json!({"track": name, "iter": iteration, "reason": "SchemaDrift"}),
                );
                outcome.disqualified = Some(DisqualifyReason::SchemaDrift);
                break;
            }
        };

        let serialized = serde_json::to_string_pretty(&envelope)?;
        store.write_text(
            format!("{iter_rel}/ITERATION.json"),
            &format!("{}\n", redactor.redact(&serialized)),
        )?;
        store.write_json(
            format!("{iter_rel}/CHECK_iterate.json"),
            &CheckRecord {
                schema_version: 1,
                name: "iterate_schema".to_string(),
                ok: true,
                exit_code: 0,
                details: "OK".to_string(),
            },
        )?;
        outcome.iterations_run = iteration;

        if let Some(patch) = &provider_outcome.patch_diff {
            store.write_text(format!("{iter_rel}/PATCH.diff"), patch)?;
            outcome.has_patch = true;
            if params.shared.verify_on_patch {
                // Verifier failures lower the score but never kill the track.
                if let Err(e) =
                    verify_iteration_patch(params, &wt_path, &iter_rel, &iter_dir).await
                {
                    tracing::warn!(track = %name, iteration, error = ?e, "opportunistic verify failed");
                }
            }
        }

        if envelope.status_signal == StatusSignal::Done {
            params.events.emit(
                "iterate",
                "done",
                serde_json::json!({"track": name, "iter": iteration}),
            );
            outcome.done = true;
            blackboard::write(store, &params.shared.track_names)?;
            break;
        }

        blackboard::write(store, &params.shared.track_names)?;
    }

    if outcome.disqualified.is_none() {
        if outcome.iterations_run == 0 && outcome.timeouts > 0 {
            outcome.disqualified = Some(DisqualifyReason::TimeoutFailure);
        } else if cfg.role == Role::Fixer && !outcome.has_patch {
            outcome.disqualified = Some(DisqualifyReason::NoPatch);
        }
    }

    Ok(finish(store, outcome))
}

/// Persist the terminal outcome; best-effort, the in-memory value wins.
fn finish(store: &ArtifactStore, outcome: TrackOutcome) -> TrackOutcome {
    let rel = format!("tracks/{}/TRACK.json", outcome.name);
    if let Err(e) = store.write_json(&rel, &outcome) {
        tracing::warn!(track = %outcome.name, error = %e, "failed to persist track outcome");
    }
    outcome
}

fn record_timeout(
    store: &ArtifactStore,
    iter_rel: &str,
    name: &str,
    iteration: u32,
    outcome: &mut TrackOutcome,
) -> Result<(), crate::store::StoreError> {
    tracing::warn!(track = %name, iteration, "iteration timed out");
    outcome.timeouts += 1;
    store.write_json(
        format!("{iter_rel}/CHECK_iterate.json"),
        &CheckRecord {
            schema_version: 1,
            name: "iterate_timeout".to_string(),
            ok: false,
            exit_code: crate::shell::TIMEOUT_EXIT_CODE,
            details: "TimeoutFailure: agent did not finish within the iteration budget"
                .to_string(),
        },
    )?;
    Ok(())
}

fn existing_valid_iteration(store: &ArtifactStore, iter_rel: &str) -> Option<IterationEnvelope> {
    let text = store
        .read_to_string(format!("{iter_rel}/ITERATION.json"))
        .ok()?;
    validate_iteration(&text).ok()
}

/// Apply this iteration's patch in the worktree, run the verifier with the
/// iteration directory as its artifact root, then restore the worktree.
async fn verify_iteration_patch(
    params: &TrackParams,
    wt_path: &std::path::Path,
    iter_rel: &str,
    iter_dir: &std::path::Path,
) -> anyhow::Result<()> {
    let store = &params.store;
    let patch_path = store.path(format!("{iter_rel}/PATCH.diff"))?;

    let apply_req = CommandRequest::new(
        format!(
            "git apply --whitespace=nowarn {}",
            crate::provider::common::sh_quote(&patch_path)
        ),
        wt_path,
        Duration::from_secs(30),
        iter_dir.join("logs").join("patch_apply.stdout.log"),
        iter_dir.join("logs").join("patch_apply.stderr.log"),
    );
    let applied = params.runner.run(&apply_req).await?;

    if applied.success() {
        let iter_store = ArtifactStore::new(iter_dir);
        crate::verify::run(&iter_store, wt_path, &params.runner, &params.shared.contract).await?;
    }

    // Restore the checkout so the next iteration starts clean.
    let revert_req = CommandRequest::new(
        "git checkout -- .",
        wt_path,
        Duration::from_secs(30),
        iter_dir.join("logs").join("revert.stdout.log"),
        iter_dir.join("logs").join("revert.stderr.log"),
    );
    let _ = params.runner.run(&revert_req).await;
    Ok(())
}

fn write_crash(store: &ArtifactStore, track: &str, error: &anyhow::Error) {
    let rel = format!("tracks/{track}/CRASH.txt");
    let body = format!("{error:#}\n\nchain:\n{error:?}\n");
    if let Err(e) = store.write_text(&rel, &body) {
        tracing::error!(track, error = %e, "failed to write track CRASH.txt");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disqualify_reason_serializes_by_name() {
        assert_eq!(
            serde_json::to_string(&DisqualifyReason::SchemaDrift).unwrap(),
            "\"SchemaDrift\""
        );
        assert_eq!(
            serde_json::to_string(&DisqualifyReason::NoPatch).unwrap(),
            "\"NoPatch\""
        );
    }

    #[test]
    fn track_outcome_round_trips() {
        let outcome = TrackOutcome {
            name: "A".to_string(),
            role: Role::Fixer,
            iterations_run: 2,
            timeouts: 1,
            has_patch: true,
            done: true,
            disqualified: None,
        };
        let json = serde_json::to_string(&outcome).unwrap();
        let back: TrackOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back.iterations_run, 2);
        assert_eq!(back.disqualified, None);
    }
}
