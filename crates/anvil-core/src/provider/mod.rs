//! Agent adapters behind a uniform capability contract.
//!
//! Every adapter wraps one opaque agent process (or none, for `manual`) and
//! exposes a single `run_iteration` call. Adapters are registered by
//! provider name in a [`ProviderRegistry`]; an unknown name resolves to a
//! synthesized error adapter whose invocation disqualifies the track rather
//! than crashing the session.

pub mod claude_cli;
pub mod common;
pub mod copilot_cli;
pub mod gemini_cli;
pub mod manual;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{Role, TrackConfig};
use crate::shell::CommandRunner;

/// Everything an adapter needs for one iteration.
#[derive(Debug, Clone)]
pub struct IterationContext {
    pub track: String,
    pub role: Role,
    /// 1-based iteration index.
    pub iteration: u32,
    pub issue_text: String,
    pub context_text: String,
    pub repro_text: String,
    pub blackboard_text: String,
    pub directives: Option<String>,
    pub model: Option<String>,
    /// The track's isolated checkout; agents run with this as cwd.
    pub worktree: PathBuf,
    /// Directory for this iteration's prompt and agent logs.
    pub logs_dir: PathBuf,
    pub timeout: Duration,
}

/// What one adapter invocation produced.
#[derive(Debug, Clone)]
pub struct ProviderOutcome {
    /// Raw agent output (unredacted; the track runner redacts on write).
    pub raw_text: String,
    /// Envelope extracted by the adapter, if any. Validation happens later.
    pub envelope_json: Option<serde_json::Value>,
    pub patch_diff: Option<String>,
    pub duration_ms: u64,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// The adapter capability: one method plus a name.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Adapter name as it appears in track configuration.
    fn name(&self) -> &str;

    /// Run one iteration of the agent.
    ///
    /// Timeouts are reported in the outcome (`timed_out`), not as errors; an
    /// `Err` means the adapter itself failed and the track should be
    /// disqualified with crash containment.
    async fn run_iteration(
        &self,
        ctx: &IterationContext,
        runner: &CommandRunner,
    ) -> Result<ProviderOutcome>;
}

type Constructor = fn(&TrackConfig) -> Box<dyn Provider>;

/// Constructor map keyed by provider name.
///
/// New adapters are added by registering a constructor; nothing else in the
/// core changes.
pub struct ProviderRegistry {
    constructors: HashMap<String, Constructor>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
        };
        registry.register("manual", |_| Box::new(manual::ManualProvider::new()));
        registry.register("claude", |cfg| {
            Box::new(claude_cli::ClaudeCliProvider::from_config(cfg))
        });
        registry.register("gemini", |cfg| {
            Box::new(gemini_cli::GeminiCliProvider::from_config(cfg))
        });
        registry.register("copilot", |cfg| {
            Box::new(copilot_cli::CopilotCliProvider::from_config(cfg))
        });
        registry
    }
}

impl ProviderRegistry {
    pub fn register(&mut self, name: &str, constructor: Constructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    /// Names of all registered adapters, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    /// Build the adapter for a track. Unknown providers get the error
    /// adapter instead of failing here; config validation normally rejects
    /// them long before this point.
    pub fn build(&self, track: &TrackConfig) -> Box<dyn Provider> {
        match self.constructors.get(&track.provider) {
            Some(make) => make(track),
            None => Box::new(ErrorProvider {
                message: format!(
                    "no adapter registered for provider {:?} (track {:?})",
                    track.provider, track.name
                ),
            }),
        }
    }
}

/// Synthesized adapter for unknown provider kinds. Always errors, which the
/// track runner converts into a disqualification.
pub struct ErrorProvider {
    message: String,
}

#[async_trait]
impl Provider for ErrorProvider {
    fn name(&self) -> &str {
        "error"
    }

    async fn run_iteration(
        &self,
        _ctx: &IterationContext,
        _runner: &CommandRunner,
    ) -> Result<ProviderOutcome> {
        anyhow::bail!("{}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackBudget;

    fn track(provider: &str) -> TrackConfig {
        TrackConfig {
            name: "A".to_string(),
            role: Role::Fixer,
            provider: provider.to_string(),
            model: None,
            directives: None,
            budget: TrackBudget::default(),
        }
    }

    fn ctx() -> IterationContext {
        IterationContext {
            track: "A".to_string(),
            role: Role::Fixer,
            iteration: 1,
            issue_text: String::new(),
            context_text: String::new(),
            repro_text: String::new(),
            blackboard_text: String::new(),
            directives: None,
            model: None,
            worktree: PathBuf::from("/tmp"),
            logs_dir: PathBuf::from("/tmp"),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn default_registry_has_all_known_providers() {
        let registry = ProviderRegistry::default();
        assert_eq!(registry.names(), vec!["claude", "copilot", "gemini", "manual"]);
        for name in crate::config::KNOWN_PROVIDERS {
            assert!(registry.constructors.contains_key(*name));
        }
    }

    #[test]
    fn build_resolves_by_name() {
        let registry = ProviderRegistry::default();
        assert_eq!(registry.build(&track("manual")).name(), "manual");
        assert_eq!(registry.build(&track("claude")).name(), "claude");
    }

    #[tokio::test]
    async fn unknown_provider_builds_error_adapter() {
        let registry = ProviderRegistry::default();
        let provider = registry.build(&track("skynet"));
        assert_eq!(provider.name(), "error");
        let err = provider
            .run_iteration(&ctx(), &CommandRunner::host())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("skynet"));
    }

    #[test]
    fn provider_trait_is_object_safe() {
        let registry = ProviderRegistry::default();
        let boxed: Box<dyn Provider> = registry.build(&track("manual"));
        assert_eq!(boxed.name(), "manual");
    }
}
