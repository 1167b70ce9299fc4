//! Reproduction planner: a deterministic plan stub for debug sessions.
//!
//! Derives `REPRO.md` from the issue text and the names of the configured
//! verification commands. Deliberately mechanical; the agents do the actual
//! reproduction work.

use std::path::Path;

use anyhow::Result;

use crate::store::ArtifactStore;
use crate::verify::load_contract;

/// Write `REPRO.md` into the run directory.
pub fn write_repro_plan(store: &ArtifactStore, repo: &Path, issue_text: &str) -> Result<String> {
    let contract = load_contract(repo).unwrap_or_default();

    let mut md = String::from("# REPRO\n\n## Goal\n\n");
    if issue_text.is_empty() {
        md.push_str("Reproduce the reported behavior before attempting a fix.\n");
    } else {
        md.push_str("Reproduce the following issue before attempting a fix:\n\n");
        for line in issue_text.lines() {
            md.push_str("> ");
            md.push_str(line);
            md.push('\n');
        }
    }

    md.push_str("\n## Verification commands\n\n");
    if contract.commands.is_empty() {
        md.push_str("No verify contract configured; add `.dbg/verify_contract.toml`.\n");
    } else {
        for c in &contract.commands {
            md.push_str(&format!(
                "- `{}`: `{}`{}\n",
                c.name,
                c.cmd,
                if c.required { " (required)" } else { "" }
            ));
        }
    }

    md.push_str(
        "\n## Expectations\n\n\
         1. Run the verification commands on a clean checkout and record the failure.\n\
         2. Apply a candidate change in your worktree only.\n\
         3. Re-run the commands; a winning patch turns the failure into a pass.\n",
    );

    store.write_text("REPRO.md", &md)?;
    Ok(md)
}
