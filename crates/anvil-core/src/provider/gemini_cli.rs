//! Gemini CLI adapter.

use anyhow::Result;
use async_trait::async_trait;

use crate::config::TrackConfig;
use crate::shell::CommandRunner;

use super::common::{run_cli_iteration, CliInvocation};
use super::{IterationContext, Provider, ProviderOutcome};

const DEFAULT_MODEL: &str = "gemini-3-pro";

pub struct GeminiCliProvider {
    binary: String,
}

impl GeminiCliProvider {
    pub fn new() -> Self {
        Self {
            binary: "gemini".to_string(),
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
            args: vec!["-m".to_string(), model.to_string(), "-p".to_string()],
        }
    }
}

impl Default for GeminiCliProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for GeminiCliProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn run_iteration(
        &self,
        ctx: &IterationContext,
        runner: &CommandRunner,
    ) -> Result<ProviderOutcome> {
        run_cli_iteration(&self.invocation(ctx), ctx, runner).await
    }
}
