mod cleanup_cmd;
mod debug_cmd;
mod harden_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use anvil_core::session::SessionError;
use anvil_core::worktree::WorktreeError;

#[derive(Parser)]
#[command(name = "anvil", about = "Contract-driven debug + harden harness for coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Debug a known issue with parallel agent tracks
    Debug {
        #[command(subcommand)]
        command: DebugCommands,
    },
    /// Hunt for latent defects with breaker tracks
    Harden {
        #[command(subcommand)]
        command: HardenCommands,
    },
    /// Manage leftover worktrees and branches
    Cleanup {
        #[command(subcommand)]
        command: CleanupCommands,
    },
}

#[derive(Subcommand)]
pub enum DebugCommands {
    /// Run the full debug workflow
    Run {
        /// Target git repo root
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Issue text (GitHub-issue-like)
        #[arg(long)]
        issue: Option<String>,
        /// Issue markdown file
        #[arg(long)]
        issue_file: Option<PathBuf>,
        /// Tracks TOML file (defaults to <repo>/.dbg/tracks.toml)
        #[arg(long)]
        tracks_file: Option<PathBuf>,
        /// Run id (default: auto-generated, time-sortable)
        #[arg(long)]
        run_id: Option<String>,
        /// Run verification and agents inside a container
        #[arg(long)]
        container: bool,
        /// Skip applying the winning patch
        #[arg(long)]
        no_apply: bool,
    },
    /// Resume an interrupted run
    Resume {
        #[arg(long = "run")]
        run_id: String,
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
    /// Print RUN_STATUS.json for a run
    Status {
        #[arg(long = "run")]
        run_id: String,
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum HardenCommands {
    /// Run the harden workflow
    Run {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[arg(long)]
        tracks_file: Option<PathBuf>,
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        container: bool,
        /// Run per-iteration verification on breaker patches
        #[arg(long)]
        verify_patches: bool,
    },
}

#[derive(Subcommand)]
pub enum CleanupCommands {
    /// Clean up worktrees and branches for one run
    Run {
        #[arg(long)]
        run_id: String,
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Rename branches to archive/anvil-<run>-<track>-<ts> instead of
        /// deleting them
        #[arg(long)]
        archive: bool,
    },
    /// List all anvil worktrees
    List {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
    /// Clean worktrees older than N days
    Stale {
        #[arg(long, default_value_t = 7)]
        older_than: u64,
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
    /// Clean ALL anvil worktrees (destructive)
    All {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

/// Map a session failure to the documented exit codes: 1 input validation,
/// 2 schema drift in a tracked artifact, 3 environment precondition, 4
/// other failures.
fn exit_code_for(error: &SessionError) -> i32 {
    match error {
        SessionError::Config(_) => 1,
        SessionError::ArtifactDrift(_) => 2,
        SessionError::Environment(WorktreeError::NotAGitRepo(_)) => 3,
        SessionError::Environment(_) => 4,
        SessionError::Interrupted => 4,
        SessionError::Internal(_) => 4,
    }
}

fn fail(error: SessionError, run_dir: Option<&std::path::Path>) -> ! {
    match run_dir {
        Some(dir) => eprintln!("anvil: {error:#} (details in {})", dir.display()),
        None => eprintln!("anvil: {error:#}"),
    }
    std::process::exit(exit_code_for(&error));
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::config::ConfigError;

    #[test]
    fn exit_codes_follow_the_documented_mapping() {
        assert_eq!(
            exit_code_for(&SessionError::Config(ConfigError::InvalidRunId("x!".into()))),
            1
        );
        assert_eq!(
            exit_code_for(&SessionError::ArtifactDrift("RUN.json".into())),
            2
        );
        assert_eq!(
            exit_code_for(&SessionError::Environment(WorktreeError::NotAGitRepo(
                "/tmp/x".into()
            ))),
            3
        );
        assert_eq!(
            exit_code_for(&SessionError::Environment(WorktreeError::BranchConflict {
                branch: "dbg/r/A".into()
            })),
            4
        );
        assert_eq!(exit_code_for(&SessionError::Interrupted), 4);
    }

    #[test]
    fn cli_parses_debug_run() {
        let cli = Cli::try_parse_from([
            "anvil", "debug", "run", "--repo", "/tmp/r", "--issue", "broken", "--run-id", "r1",
            "--no-apply",
        ])
        .unwrap();
        match cli.command {
            Commands::Debug {
                command:
                    DebugCommands::Run {
                        repo,
                        issue,
                        run_id,
                        no_apply,
                        container,
                        ..
                    },
            } => {
                assert_eq!(repo, PathBuf::from("/tmp/r"));
                assert_eq!(issue.as_deref(), Some("broken"));
                assert_eq!(run_id.as_deref(), Some("r1"));
                assert!(no_apply);
                assert!(!container);
            }
            _ => panic!("parsed into the wrong command"),
        }
    }

    #[test]
    fn cli_parses_cleanup_stale() {
        let cli =
            Cli::try_parse_from(["anvil", "cleanup", "stale", "--older-than", "30"]).unwrap();
        match cli.command {
            Commands::Cleanup {
                command: CleanupCommands::Stale { older_than, .. },
            } => assert_eq!(older_than, 30),
            _ => panic!("parsed into the wrong command"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Debug { command } => debug_cmd::run(command).await,
        Commands::Harden { command } => harden_cmd::run(command).await,
        Commands::Cleanup { command } => cleanup_cmd::run(command),
    }
}
