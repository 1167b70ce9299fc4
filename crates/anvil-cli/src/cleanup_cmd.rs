//! `anvil cleanup run|list|stale|all` commands.

use std::io::Write;

use anvil_core::config::validate_run_id;
use anvil_core::worktree::{list_all, stale_runs, WorktreeManager};

use crate::{fail, CleanupCommands};

pub fn run(command: CleanupCommands) -> anyhow::Result<()> {
    match command {
        CleanupCommands::Run {
            run_id,
            repo,
            archive,
        } => {
            if let Err(e) = validate_run_id(&run_id) {
                fail(e.into(), None);
            }
            let mgr = match WorktreeManager::new(&repo, &run_id) {
                Ok(mgr) => mgr,
                Err(e) => fail(e.into(), None),
            };
            if archive {
                let archived = mgr.archive_all()?;
                println!("Archived {archived} track(s) for run {run_id}");
            } else {
                let cleaned = mgr.cleanup_all()?;
                println!("Cleaned {cleaned} track(s) for run {run_id}");
            }
        }
        CleanupCommands::List { repo } => {
            let entries = list_all(&repo);
            if entries.is_empty() {
                println!("No worktrees found.");
                return Ok(());
            }
            println!("{:<24} {:<16} PATH", "RUN", "TRACK");
            for (run_id, track) in entries {
                let path = repo.join(".dbg/worktrees").join(&run_id).join(&track);
                println!("{run_id:<24} {track:<16} {}", path.display());
            }
        }
        CleanupCommands::Stale { older_than, repo } => {
            let runs = stale_runs(&repo, older_than);
            if runs.is_empty() {
                println!("No stale worktrees found.");
                return Ok(());
            }
            let mut cleaned = 0;
            for run_id in runs {
                let mgr = match WorktreeManager::new(&repo, &run_id) {
                    Ok(mgr) => mgr,
                    Err(e) => fail(e.into(), None),
                };
                cleaned += mgr.cleanup_all()?;
            }
            println!("Removed {cleaned} stale track worktree(s)");
        }
        CleanupCommands::All { repo, yes } => {
            let entries = list_all(&repo);
            if entries.is_empty() {
                println!("No worktrees found.");
                return Ok(());
            }
            if !yes && !confirm(&format!("Remove worktrees for {} track(s)?", entries.len()))? {
                println!("Aborted.");
                return Ok(());
            }
            let mut runs: Vec<String> = entries.into_iter().map(|(run, _)| run).collect();
            runs.dedup();
            let mut cleaned = 0;
            for run_id in runs {
                let mgr = match WorktreeManager::new(&repo, &run_id) {
                    Ok(mgr) => mgr,
                    Err(e) => fail(e.into(), None),
                };
                cleaned += mgr.cleanup_all()?;
            }
            println!("Cleaned {cleaned} track(s).");
        }
    }
    Ok(())
}

fn confirm(question: &str) -> anyhow::Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
