//! `anvil debug run|resume|status` commands.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use anvil_core::config::{
    new_run_id, resolve_tracks, validate_run_id, Mode, SessionConfig,
};
use anvil_core::session::{run_debug, RunResult, SessionError};

use crate::{fail, DebugCommands};

pub async fn run(command: DebugCommands) -> anyhow::Result<()> {
    match command {
        DebugCommands::Run {
            repo,
            issue,
            issue_file,
            tracks_file,
            run_id,
            container,
            no_apply,
        } => {
            let issue_text = match (issue, issue_file) {
                (Some(text), _) => text,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("read issue file {}", path.display()))?,
                (None, None) => {
                    eprintln!("anvil: provide --issue or --issue-file");
                    std::process::exit(1);
                }
            };

            let cfg = match build_config(
                &repo,
                run_id,
                tracks_file.as_deref(),
                Some(issue_text),
                container,
                !no_apply && env_auto_apply(),
                false,
            ) {
                Ok(cfg) => cfg,
                Err(e) => fail(e, None),
            };

            let result = execute(&cfg).await;
            report(&cfg, result);
        }
        DebugCommands::Resume { run_id, repo } => {
            let cfg = match build_config(&repo, Some(run_id), None, None, env_container(), env_auto_apply(), true) {
                Ok(cfg) => cfg,
                Err(e) => fail(e, None),
            };
            let result = execute(&cfg).await;
            report(&cfg, result);
        }
        DebugCommands::Status { run_id, repo } => {
            if let Err(e) = validate_run_id(&run_id) {
                fail(SessionError::Config(e), None);
            }
            let path = repo
                .join(".dbg")
                .join("runs")
                .join(&run_id)
                .join("RUN_STATUS.json");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("no status found at {}", path.display()))?;
            println!("{}", text.trim_end());
        }
    }
    Ok(())
}

async fn execute(cfg: &SessionConfig) -> Result<RunResult, SessionError> {
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, shutting down gracefully");
            signal_cancel.cancel();
        }
    });
    run_debug(cfg, cancel).await
}

fn report(cfg: &SessionConfig, result: Result<RunResult, SessionError>) {
    match result {
        Ok(result) => {
            println!(
                "Run {} finished with status: {}",
                cfg.run_id,
                result.status.as_str()
            );
            println!("Artifacts: {}", result.run_dir.display());
            if let Some(decision) = &result.decision_file {
                println!("Decision: {}", decision.display());
            }
            if let Some(winner) = &result.winner {
                println!("Winner: {winner}");
            }
        }
        Err(e) => fail(e, Some(&cfg.run_dir())),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn build_config(
    repo: &Path,
    run_id: Option<String>,
    tracks_file: Option<&Path>,
    issue_text: Option<String>,
    container: bool,
    auto_apply: bool,
    resume: bool,
) -> Result<SessionConfig, SessionError> {
    let run_id = match run_id {
        Some(id) => validate_run_id(&id).map(str::to_string)?,
        None => new_run_id(),
    };
    let tracks = resolve_tracks(tracks_file, repo, Mode::Debug)?;
    Ok(SessionConfig {
        run_id,
        runs_root: runs_root(repo),
        repo_path: repo.to_path_buf(),
        mode: Mode::Debug,
        issue_text,
        resume,
        auto_apply,
        container: container || env_container(),
        verify_patches: false,
        tracks,
    })
}

pub fn runs_root(repo: &Path) -> PathBuf {
    repo.join(".dbg").join("runs")
}

fn env_auto_apply() -> bool {
    std::env::var("ANVIL_AUTO_APPLY")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(true)
}

fn env_container() -> bool {
    std::env::var("ANVIL_CONTAINER")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
