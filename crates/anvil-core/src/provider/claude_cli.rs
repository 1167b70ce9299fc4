//! Claude CLI adapter.
//!
//! Invokes the local `claude` binary in print mode with the prompt on
//! stdin. The binary path is overridable, which is also how tests stand in
//! a scripted fake agent.

use anyhow::Result;
use async_trait::async_trait;

use crate::config::TrackConfig;
use crate::shell::CommandRunner;

use super::common::{run_cli_iteration, CliInvocation};
use super::{IterationContext, Provider, ProviderOutcome};

pub struct ClaudeCliProvider {
    binary: String,
    extra_args: Vec<String>,
}

impl ClaudeCliProvider {
    pub fn new() -> Self {
        Self {
            binary: "claude".to_string(),
            extra_args: Vec::new(),
        }
    }

    /// Use a custom binary path (testing, non-standard installs).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn from_config(cfg: &TrackConfig) -> Self {
        let _ = cfg;
        Self::new()
    }

    fn invocation(&self, ctx: &IterationContext) -> CliInvocation {
        let mut args = vec!["-p".to_string()];
        if let Some(model) = &ctx.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        CliInvocation {
            binary: self.binary.clone(),
            args,
        }
    }
}

impl Default for ClaudeCliProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for ClaudeCliProvider {
    fn name(&self) -> &str {
        "claude"
    }

    async fn run_iteration(
        &self,
        ctx: &IterationContext,
        runner: &CommandRunner,
    ) -> Result<ProviderOutcome> {
        run_cli_iteration(&self.invocation(ctx), ctx, runner).await
    }
}
