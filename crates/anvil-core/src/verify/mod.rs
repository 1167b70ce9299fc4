//! Deterministic verification against a declarative contract.
//!
//! The contract is a TOML list of named commands. Every command runs
//! through the command runner in the designated working directory with its
//! output teed to per-command logs; a JSON line per command is appended to
//! `verify.commands.json`. The overall result is PASS only when every
//! required command exited 0 AND at least one command shows evidence that
//! tests actually executed -- a "no tests collected" outcome is a FAIL, not
//! a pass with zero coverage.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::shell::{CommandRequest, CommandRunner};
use crate::store::ArtifactStore;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Output fragments that mark a run as having collected nothing.
const NO_TEST_MARKERS: &[&str] = &[
    "no tests collected",
    "collected 0 items",
    "running 0 tests",
    "no tests to run",
    "0 tests run",
];

/// Output fragments that count as evidence of real test execution.
const EVIDENCE_MARKERS: &[&str] = &[
    "test result:",
    "passed",
    "failed",
    "assertion",
    " ok",
    "tests ran",
];

/// One entry in the verify contract.
///
/// Extra fields are tolerated and carried through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyCommand {
    pub name: String,
    pub cmd: String,
    #[serde(default)]
    pub required: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

/// Declarative verification contract (`.dbg/verify_contract.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyContract {
    #[serde(default)]
    pub commands: Vec<VerifyCommand>,
}

/// Per-command execution record, one JSON line in `verify.commands.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub name: String,
    pub cmd: String,
    pub required: bool,
    pub exit_code: i32,
    pub elapsed_ms: u64,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub log_paths: [String; 2],
}

/// Result of one verification pass.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub passed: bool,
    pub ran: Vec<CommandRecord>,
    pub failures: Vec<String>,
}

/// Load the contract for a repository.
///
/// `ANVIL_VERIFY_CONTRACT` overrides the default
/// `<repo>/.dbg/verify_contract.toml`. A missing file is an empty contract.
pub fn load_contract(repo: &Path) -> Result<VerifyContract> {
    let path = match std::env::var("ANVIL_VERIFY_CONTRACT") {
        Ok(p) => std::path::PathBuf::from(p),
        Err(_) => repo.join(".dbg").join("verify_contract.toml"),
    };
    if !path.exists() {
        return Ok(VerifyContract::default());
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("read verify contract {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parse verify contract {}", path.display()))
}

/// Run the contract in `workdir`, writing artifacts into `store`.
pub async fn run(
    store: &ArtifactStore,
    workdir: &Path,
    runner: &CommandRunner,
    contract: &VerifyContract,
) -> Result<VerifyOutcome> {
    let mut ran: Vec<CommandRecord> = Vec::new();
    let mut failures: Vec<String> = Vec::new();
    let mut evidence = false;

    for command in &contract.commands {
        let safe = safe_filename(&command.name);
        let stdout_rel = format!("logs/verify.{safe}.stdout.log");
        let stderr_rel = format!("logs/verify.{safe}.stderr.log");
        let request = CommandRequest::new(
            &command.cmd,
            workdir,
            COMMAND_TIMEOUT,
            store.path(&stdout_rel)?,
            store.path(&stderr_rel)?,
        );
        let outcome = runner
            .run(&request)
            .await
            .with_context(|| format!("verify command {:?}", command.name))?;

        if command.required && !outcome.success() {
            failures.push(command.name.clone());
        }

        let combined = format!(
            "{}\n{}",
            std::fs::read_to_string(&outcome.stdout_path).unwrap_or_default(),
            std::fs::read_to_string(&outcome.stderr_path).unwrap_or_default(),
        );
        if shows_test_evidence(&combined) {
            evidence = true;
        }

        let record = CommandRecord {
            name: command.name.clone(),
            cmd: command.cmd.clone(),
            required: command.required,
            exit_code: outcome.exit_code,
            elapsed_ms: outcome.elapsed_ms,
            stdout_bytes: outcome.stdout_bytes,
            stderr_bytes: outcome.stderr_bytes,
            log_paths: [stdout_rel, stderr_rel],
        };
        store.append_line("verify.commands.json", &serde_json::to_string(&record)?)?;
        ran.push(record);
    }

    let passed = failures.is_empty() && !contract.commands.is_empty() && evidence;
    let md = render_markdown(passed, &ran, &failures, contract.commands.is_empty(), evidence);
    store.write_text("VERIFY.md", &md)?;

    Ok(VerifyOutcome {
        passed,
        ran,
        failures,
    })
}

fn render_markdown(
    passed: bool,
    ran: &[CommandRecord],
    failures: &[String],
    empty_contract: bool,
    evidence: bool,
) -> String {
    let mut md = if passed {
        String::from("PASS\n\n# VERIFY\n\n")
    } else {
        String::from("FAIL\n\n# VERIFY\n\n")
    };
    if empty_contract {
        md.push_str("No verify contract commands configured.\n");
        return md;
    }
    md.push_str("## Commands\n\n");
    for r in ran {
        md.push_str(&format!(
            "- `{}` exit={} required={} elapsed_ms={} cmd: `{}`\n",
            r.name, r.exit_code, r.required, r.elapsed_ms, r.cmd
        ));
    }
    md.push_str("\n## Result\n\n");
    if !failures.is_empty() {
        md.push_str(&format!("Required failures: {}\n", failures.join(", ")));
    } else if !evidence {
        md.push_str("No evidence of test execution (no-tests-collected counts as FAIL).\n");
    } else {
        md.push_str("All required commands passed.\n");
    }
    md
}

/// Whether combined command output looks like tests really ran.
fn shows_test_evidence(output: &str) -> bool {
    let lower = output.to_lowercase();
    if NO_TEST_MARKERS.iter().any(|m| lower.contains(m)) {
        return false;
    }
    EVIDENCE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Reduce a command name to a filesystem-safe token.
pub fn safe_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "cmd".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("run"));
        store.ensure().unwrap();
        (dir, store)
    }

    fn contract(entries: &[(&str, &str, bool)]) -> VerifyContract {
        VerifyContract {
            commands: entries
                .iter()
                .map(|(name, cmd, required)| VerifyCommand {
                    name: name.to_string(),
                    cmd: cmd.to_string(),
                    required: *required,
                    extra: BTreeMap::new(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn passing_commands_with_evidence_pass() {
        let (dir, store) = store();
        let c = contract(&[("tests", "echo 'test result: ok. 3 passed'", true)]);
        let outcome = run(&store, dir.path(), &CommandRunner::host(), &c)
            .await
            .unwrap();
        assert!(outcome.passed);
        let md = store.read_to_string("VERIFY.md").unwrap();
        assert!(md.starts_with("PASS"));
        assert!(store.exists("logs/verify.tests.stdout.log"));

        let lines = store.read_to_string("verify.commands.json").unwrap();
        let record: CommandRecord = serde_json::from_str(lines.lines().next().unwrap()).unwrap();
        assert_eq!(record.name, "tests");
        assert_eq!(record.exit_code, 0);
    }

    #[tokio::test]
    async fn required_failure_fails() {
        let (dir, store) = store();
        let c = contract(&[
            ("build", "echo '1 passed'; true", true),
            ("tests", "echo '1 failed'; exit 1", true),
        ]);
        let outcome = run(&store, dir.path(), &CommandRunner::host(), &c)
            .await
            .unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.failures, vec!["tests"]);
        assert!(store.read_to_string("VERIFY.md").unwrap().starts_with("FAIL"));
    }

    #[tokio::test]
    async fn no_tests_collected_is_a_fail() {
        let (dir, store) = store();
        let c = contract(&[("tests", "echo 'running 0 tests'", true)]);
        let outcome = run(&store, dir.path(), &CommandRunner::host(), &c)
            .await
            .unwrap();
        assert!(!outcome.passed);
        let md = store.read_to_string("VERIFY.md").unwrap();
        assert!(md.starts_with("FAIL"));
        assert!(md.contains("no-tests-collected"));
    }

    #[tokio::test]
    async fn empty_contract_is_a_fail() {
        let (dir, store) = store();
        let outcome = run(&store, dir.path(), &CommandRunner::host(), &VerifyContract::default())
            .await
            .unwrap();
        assert!(!outcome.passed);
        assert!(store.read_to_string("VERIFY.md").unwrap().starts_with("FAIL"));
    }

    #[tokio::test]
    async fn optional_failures_do_not_block_pass() {
        let (dir, store) = store();
        let c = contract(&[
            ("tests", "echo 'test result: ok'", true),
            ("lint", "exit 1", false),
        ]);
        let outcome = run(&store, dir.path(), &CommandRunner::host(), &c)
            .await
            .unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.ran.len(), 2);
    }

    #[test]
    fn contract_parses_and_preserves_extra_fields() {
        let text = r#"
[[commands]]
name = "unit tests"
cmd = "cargo test"
required = true
timeout_hint_s = 120
"#;
        let contract: VerifyContract = toml::from_str(text).unwrap();
        assert_eq!(contract.commands.len(), 1);
        assert!(contract.commands[0].extra.contains_key("timeout_hint_s"));
        // Round-trips without dropping the unknown field.
        let out = toml::to_string(&contract).unwrap();
        assert!(out.contains("timeout_hint_s"));
    }

    #[test]
    fn safe_filename_sanitizes() {
        assert_eq!(safe_filename("unit tests/fast"), "unit_tests_fast");
        assert_eq!(safe_filename(""), "cmd");
        assert_eq!(safe_filename("build-1"), "build-1");
    }

    #[test]
    fn evidence_heuristic() {
        assert!(shows_test_evidence("test result: ok. 4 passed; 0 failed"));
        assert!(shows_test_evidence("== 3 passed in 0.2s =="));
        assert!(!shows_test_evidence("running 0 tests"));
        assert!(!shows_test_evidence("compiled successfully"));
    }
}
