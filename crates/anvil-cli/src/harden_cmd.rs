//! `anvil harden run` command.

use tokio_util::sync::CancellationToken;

use anvil_core::config::{new_run_id, resolve_tracks, validate_run_id, Mode, SessionConfig};
use anvil_core::session::run_harden;

use crate::{fail, HardenCommands};
use crate::debug_cmd::runs_root;

pub async fn run(command: HardenCommands) -> anyhow::Result<()> {
    let HardenCommands::Run {
        repo,
        tracks_file,
        run_id,
        container,
        verify_patches,
    } = command;

    let run_id = match run_id {
        Some(id) => match validate_run_id(&id) {
            Ok(id) => id.to_string(),
            Err(e) => fail(e.into(), None),
        },
        None => new_run_id(),
    };
    let tracks = match resolve_tracks(tracks_file.as_deref(), &repo, Mode::Harden) {
        Ok(tracks) => tracks,
        Err(e) => fail(e.into(), None),
    };

    let cfg = SessionConfig {
        run_id,
        runs_root: runs_root(&repo),
        repo_path: repo,
        mode: Mode::Harden,
        issue_text: None,
        resume: false,
        auto_apply: false,
        container,
        verify_patches,
        tracks,
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    match run_harden(&cfg, cancel).await {
        Ok(result) => {
            println!(
                "Harden {} finished with status: {}",
                cfg.run_id,
                result.status.as_str()
            );
            println!("Artifacts: {}", result.run_dir.display());
            if let Some(report) = &result.decision_file {
                println!("Report: {}", report.display());
            }
            Ok(())
        }
        Err(e) => fail(e, Some(&cfg.run_dir())),
    }
}
