//! Manual adapter: human-in-the-loop iteration.
//!
//! Writes a deterministic fill-in template to the iteration directory and
//! returns a minimal valid envelope without invoking any external process.
//! Never produces a patch.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::shell::CommandRunner;

use super::{IterationContext, Provider, ProviderOutcome};

#[derive(Debug, Default)]
pub struct ManualProvider;

impl ManualProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for ManualProvider {
    fn name(&self) -> &str {
        "manual"
    }

    async fn run_iteration(
        &self,
        ctx: &IterationContext,
        _runner: &CommandRunner,
    ) -> Result<ProviderOutcome> {
        let template = format!(
            "MANUAL PROVIDER TEMPLATE\n\
             - track: {track}\n\
             - role: {role}\n\
             - iteration: {iteration}\n\
             Fill ITERATION.json (and optionally PATCH.diff) in this directory, then\n\
             rerun `anvil debug resume`.\n",
            track = ctx.track,
            role = ctx.role.as_str(),
            iteration = ctx.iteration,
        );
        std::fs::create_dir_all(&ctx.logs_dir)
            .with_context(|| format!("create iteration dir {}", ctx.logs_dir.display()))?;
        std::fs::write(ctx.logs_dir.join("TEMPLATE.md"), &template)
            .context("write manual template")?;

        let envelope = json!({
            "schema_version": 1,
            "hypothesis": format!("(fill) hypothesis for {} role", ctx.role.as_str()),
            "experiments": [
                {
                    "name": "(fill) experiment name",
                    "command": "(fill) command you ran",
                    "expected": "(fill) expected outcome",
                }
            ],
            "proposed_changes": [],
            "confidence": 0.0,
            "status_signal": "NEEDS_MORE_WORK",
            "observations": [],
            "patch_present": false,
        });

        Ok(ProviderOutcome {
            raw_text: template,
            envelope_json: Some(envelope),
            patch_diff: None,
            duration_ms: 0,
            exit_code: 0,
            timed_out: false,
        })
    }
}
