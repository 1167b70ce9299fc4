//! Shared adapter plumbing: the marker protocol, prompt assembly, output
//! extraction, and the common CLI invocation path.
//!
//! Agents are asked to answer with two delimited blocks: an iteration
//! envelope between `BEGIN_ITERATION_JSON`/`END_ITERATION_JSON` and a
//! unified diff (or the literal `NO_PATCH`) between
//! `BEGIN_PATCH_DIFF`/`END_PATCH_DIFF`. Extraction prefers the delimited
//! blocks and falls back to salvage over the whole output.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};

use crate::config::Role;
use crate::shell::{CommandRequest, CommandRunner};

use super::{IterationContext, ProviderOutcome};

pub const BEGIN_JSON: &str = "BEGIN_ITERATION_JSON";
pub const END_JSON: &str = "END_ITERATION_JSON";
pub const BEGIN_DIFF: &str = "BEGIN_PATCH_DIFF";
pub const END_DIFF: &str = "END_PATCH_DIFF";
pub const NO_PATCH: &str = "NO_PATCH";

/// Assemble the full prompt for one iteration.
///
/// The role decides the patch contract: fixers must end with a patch,
/// breakers may disclose findings instead.
pub fn build_prompt(ctx: &IterationContext) -> String {
    let role_contract = match ctx.role {
        Role::Fixer | Role::Debugger => {
            "You are fixing a known defect. A unified diff patch is REQUIRED before you \
             signal DONE; an analysis without a patch cannot win."
        }
        Role::Breaker => {
            "You are hunting for latent defects. Produce either a patch demonstrating or \
             fixing a defect, or disclosed findings as observations."
        }
        Role::Experimental => {
            "You may take an unconventional approach. Patches are welcome but optional; \
             record everything you learn as observations."
        }
    };

    let schema_hint = serde_json::json!({
        "schema_version": 1,
        "hypothesis": "string (non-empty)",
        "experiments": [],
        "proposed_changes": [],
        "confidence": 0.0,
        "status_signal": "CONTINUE | SKIP_TO_VERIFY | NEEDS_MORE_WORK | DONE | BLOCKED",
        "observations": ["short strings"],
        "patch_present": false,
    });

    let mut prompt = format!(
        "You are a contract-driven coding agent working inside an isolated checkout.\n\
         \n\
         TRACK: {track} (iteration {iteration})\n\
         ROLE: {role}\n\
         {role_contract}\n",
        track = ctx.track,
        iteration = ctx.iteration,
        role = ctx.role.as_str(),
    );
    if let Some(directives) = &ctx.directives {
        prompt.push_str("\nDIRECTIVES:\n");
        prompt.push_str(directives);
        prompt.push('\n');
    }
    if !ctx.issue_text.is_empty() {
        prompt.push_str("\nISSUE:\n");
        prompt.push_str(&ctx.issue_text);
        prompt.push('\n');
    }
    if !ctx.repro_text.is_empty() {
        prompt.push_str("\nREPRODUCTION PLAN:\n");
        prompt.push_str(&ctx.repro_text);
        prompt.push('\n');
    }
    if !ctx.blackboard_text.is_empty() {
        prompt.push_str("\nBLACKBOARD (observations from all tracks):\n");
        prompt.push_str(&ctx.blackboard_text);
        prompt.push('\n');
    }
    if !ctx.context_text.is_empty() {
        prompt.push_str("\nCONTEXT:\n");
        prompt.push_str(&ctx.context_text);
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "\nReturn ONLY the following markers and contents.\n\
         {BEGIN_JSON}\n\
         A single JSON object matching this shape:\n\
         {}\n\
         {END_JSON}\n\
         {BEGIN_DIFF}\n\
         Either a unified diff (git-style) or the literal text {NO_PATCH}.\n\
         {END_DIFF}\n",
        serde_json::to_string_pretty(&schema_hint).unwrap_or_default(),
    ));
    prompt
}

/// Extract the text between the last `start` marker and the first `end`
/// marker after it. Returns `None` when either marker is missing.
pub fn extract_between<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let start_idx = text.rfind(start)? + start.len();
    let end_idx = text[start_idx..].find(end)? + start_idx;
    Some(text[start_idx..end_idx].trim())
}

/// Extract the envelope JSON from agent output, preferring the delimited
/// block and falling back to salvage over the whole text.
pub fn extract_envelope_json(text: &str) -> Option<serde_json::Value> {
    if let Some(block) = extract_between(text, BEGIN_JSON, END_JSON) {
        if let Ok(value) = serde_json::from_str(block) {
            return Some(value);
        }
        if let Some(salvaged) = crate::schema::salvage_object(block) {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&salvaged) {
                return Some(value);
            }
        }
    }
    crate::schema::salvage_object(text).and_then(|s| serde_json::from_str(&s).ok())
}

/// Extract a unified diff from agent output.
///
/// Prefers the delimited block (the `NO_PATCH` sentinel means none), then
/// falls back to detecting a bare `diff --git` block in the raw text.
pub fn extract_patch(text: &str) -> Option<String> {
    if let Some(block) = extract_between(text, BEGIN_DIFF, END_DIFF) {
        if block.is_empty() || block == NO_PATCH {
            return None;
        }
        return Some(format!("{}\n", block.trim_end()));
    }
    let start = text.find("\ndiff --git ").map(|i| i + 1).or_else(|| {
        text.starts_with("diff --git ").then_some(0)
    })?;
    let block = text[start..].trim_end();
    Some(format!("{block}\n"))
}

/// Locate an executable on `PATH`.
pub fn which(binary: &str) -> Option<PathBuf> {
    if binary.contains('/') {
        let p = PathBuf::from(binary);
        return p.exists().then_some(p);
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.exists())
}

/// Quote a path for safe interpolation into a shell command string.
pub fn sh_quote(path: &Path) -> String {
    let s = path.to_string_lossy();
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// One external-CLI invocation shape; the per-provider adapters only differ
/// in the binary and flag layout they produce.
#[derive(Debug, Clone)]
pub struct CliInvocation {
    pub binary: String,
    /// Flags placed before the stdin redirection.
    pub args: Vec<String>,
}

/// Run an agent CLI for one iteration.
///
/// The prompt is written to `PROMPT.txt` in the iteration's logs directory
/// and fed to the agent over stdin; stdout/stderr are captured next to it.
/// A timeout is reported through the outcome, not as an error.
pub async fn run_cli_iteration(
    invocation: &CliInvocation,
    ctx: &IterationContext,
    runner: &CommandRunner,
) -> Result<ProviderOutcome> {
    if which(&invocation.binary).is_none() {
        bail!("agent binary {:?} not found in PATH", invocation.binary);
    }

    std::fs::create_dir_all(&ctx.logs_dir)
        .with_context(|| format!("create logs dir {}", ctx.logs_dir.display()))?;
    let prompt_path = ctx.logs_dir.join("PROMPT.txt");
    std::fs::write(&prompt_path, build_prompt(ctx))
        .with_context(|| format!("write prompt {}", prompt_path.display()))?;

    let cmd = format!(
        "{} {} < {}",
        invocation.binary,
        invocation.args.join(" "),
        sh_quote(&prompt_path),
    );
    let request = CommandRequest::new(
        cmd,
        &ctx.worktree,
        ctx.timeout,
        ctx.logs_dir.join("agent.stdout.log"),
        ctx.logs_dir.join("agent.stderr.log"),
    );

    let start = Instant::now();
    let outcome = runner.run(&request).await?;

    let stdout = std::fs::read_to_string(&outcome.stdout_path).unwrap_or_default();
    let stderr = std::fs::read_to_string(&outcome.stderr_path).unwrap_or_default();
    let raw_text = if stderr.trim().is_empty() {
        stdout
    } else {
        format!("{stdout}\n{stderr}")
    };

    if !outcome.success() && !outcome.timed_out {
        bail!(
            "agent {:?} failed (exit {}): {}",
            invocation.binary,
            outcome.exit_code,
            stderr.trim()
        );
    }

    let envelope_json = extract_envelope_json(&raw_text);
    let patch_diff = extract_patch(&raw_text);
    Ok(ProviderOutcome {
        raw_text,
        envelope_json,
        patch_diff,
        duration_ms: start.elapsed().as_millis() as u64,
        exit_code: outcome.exit_code,
        timed_out: outcome.timed_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackBudget;

    fn ctx(role: Role) -> IterationContext {
        IterationContext {
            track: "A".to_string(),
            role,
            iteration: 1,
            issue_text: "widget crashes on empty input".to_string(),
            context_text: "src/widget.rs".to_string(),
            repro_text: "run `cargo test widget`".to_string(),
            blackboard_text: "## B\n- saw a panic".to_string(),
            directives: Some("prefer minimal patches".to_string()),
            model: None,
            worktree: PathBuf::from("/tmp"),
            logs_dir: PathBuf::from("/tmp"),
            timeout: std::time::Duration::from_secs(TrackBudget::default().per_iter_timeout_s),
        }
    }

    #[test]
    fn prompt_embeds_all_sections_and_markers() {
        let prompt = build_prompt(&ctx(Role::Fixer));
        for needle in [
            "widget crashes on empty input",
            "cargo test widget",
            "saw a panic",
            "prefer minimal patches",
            BEGIN_JSON,
            END_JSON,
            BEGIN_DIFF,
            END_DIFF,
        ] {
            assert!(prompt.contains(needle), "prompt missing {needle:?}");
        }
    }

    #[test]
    fn fixer_prompt_requires_patch_breaker_does_not() {
        assert!(build_prompt(&ctx(Role::Fixer)).contains("REQUIRED"));
        assert!(build_prompt(&ctx(Role::Breaker)).contains("disclosed findings"));
    }

    #[test]
    fn extract_between_takes_last_start_marker() {
        let text = format!("{BEGIN_JSON} stale {END_JSON} noise {BEGIN_JSON} fresh {END_JSON}");
        assert_eq!(extract_between(&text, BEGIN_JSON, END_JSON), Some("fresh"));
    }

    #[test]
    fn extract_patch_honors_no_patch_sentinel() {
        let text = format!("{BEGIN_DIFF}\nNO_PATCH\n{END_DIFF}");
        assert_eq!(extract_patch(&text), None);
    }

    #[test]
    fn extract_patch_from_markers() {
        let text = format!(
            "{BEGIN_DIFF}\ndiff --git a/x b/x\n--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n{END_DIFF}"
        );
        let patch = extract_patch(&text).unwrap();
        assert!(patch.starts_with("diff --git"));
        assert!(patch.ends_with('\n'));
    }

    #[test]
    fn extract_patch_falls_back_to_bare_diff() {
        let text = "some prose\ndiff --git a/x b/x\n--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b";
        let patch = extract_patch(text).unwrap();
        assert!(patch.starts_with("diff --git"));
    }

    #[test]
    fn envelope_extracted_from_markers_then_salvage() {
        let body = r#"{"hypothesis": "h", "experiments": [], "proposed_changes": [],
            "confidence": 0.5, "status_signal": "DONE", "observations": []}"#;
        let marked = format!("{BEGIN_JSON}\n{body}\n{END_JSON}");
        assert!(extract_envelope_json(&marked).is_some());
        let unmarked = format!("prose before {body} prose after");
        assert!(extract_envelope_json(&unmarked).is_some());
    }

    #[test]
    fn sh_quote_escapes_single_quotes() {
        let quoted = sh_quote(Path::new("/tmp/it's here"));
        assert_eq!(quoted, r"'/tmp/it'\''s here'");
    }
}
