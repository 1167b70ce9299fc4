//! Copilot CLI adapter.

use anyhow::Result;
use async_trait::async_trait;

use crate::config::TrackConfig;
use crate::shell::CommandRunner;

use super::common::{run_cli_iteration, CliInvocation};
use super::{IterationContext, Provider, ProviderOutcome};

const DEFAULT_MODEL: &str = "gpt-5";

pub struct CopilotCliProvider {
    binary: String,
}

impl CopilotCliProvider {
    pub fn new() -> Self {
        Self {
            binary: "copilot".to_string(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn from_config(cfg: &TrackConfig) -> Self {
        let _ = cfg;
        Self::new()
    }

    fn invocation(&self, ctx: &IterationContext) -> CliInvocation {
        let model = ctx.model.as_deref().unwrap_or(DEFAULT_MODEL);
        CliInvocation {
            binary: self.binary.clone(),
            args: vec![
                "--model".to_string(),
                model.to_string(),
                "--prompt-stdin".to_string(),
            ],
        }
    }
}

impl Default for CopilotCliProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for CopilotCliProvider {
    fn name(&self) -> &str {
        "copilot"
    }

    async fn run_iteration(
        &self,
        ctx: &IterationContext,
        runner: &CommandRunner,
    ) -> Result<ProviderOutcome> {
        run_cli_iteration(&self.invocation(ctx), ctx, runner).await
    }
}
