//! Shared fixtures for anvil integration tests: throwaway git repositories
//! and scripted fake agents.

use std::path::{Path, PathBuf};
use std::process::Command;

/// Create a temporary git repository with an initial commit.
///
/// Returns the `TempDir` (hold it alive for the duration of the test) and
/// the repository path.
pub fn create_temp_git_repo() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().to_path_buf();

    let run = |args: &[&str]| {
        let output = Command::new("git")
            .args(args)
            .current_dir(&repo_path)
            .output()
            .unwrap_or_else(|e| panic!("failed to run git {}: {e}", args.join(" ")));
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
    };

    run(&["init"]);
    run(&["config", "user.email", "test@anvil.dev"]);
    run(&["config", "user.name", "Anvil Test"]);
    std::fs::write(repo_path.join("README.md"), "# Test repo\n").expect("failed to write README");
    run(&["add", "."]);
    run(&["commit", "-m", "Initial commit"]);

    (dir, repo_path)
}

/// Write an executable shell script that plays the role of an agent CLI.
///
/// The script drains stdin (the prompt) and then runs `body`.
pub fn write_fake_agent(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let script = format!("#!/bin/sh\ncat > /dev/null\n{body}\n");
    std::fs::write(&path, script).expect("failed to write fake agent script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod fake agent script");
    }
    path
}

/// Shell snippet that prints a well-formed iteration envelope between the
/// protocol markers, followed by a `NO_PATCH` diff block.
pub fn envelope_script_body(hypothesis: &str, confidence: f64, signal: &str) -> String {
    format!(
        "echo 'BEGIN_ITERATION_JSON'\n\
         echo '{{\"hypothesis\": \"{hypothesis}\", \"experiments\": [], \"proposed_changes\": [],'\n\
         echo ' \"confidence\": {confidence}, \"status_signal\": \"{signal}\", \"observations\": [\"from {hypothesis}\"]}}'\n\
         echo 'END_ITERATION_JSON'\n\
         echo 'BEGIN_PATCH_DIFF'\n\
         echo 'NO_PATCH'\n\
         echo 'END_PATCH_DIFF'"
    )
}

/// Write a tracks file with the given TOML body.
pub fn write_tracks_file(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("tracks.toml");
    std::fs::write(&path, body).expect("failed to write tracks file");
    path
}

/// Write a verify contract into `<repo>/.dbg/verify_contract.toml`.
pub fn write_verify_contract(repo: &Path, body: &str) {
    let dbg = repo.join(".dbg");
    std::fs::create_dir_all(&dbg).expect("failed to create .dbg");
    std::fs::write(dbg.join("verify_contract.toml"), body)
        .expect("failed to write verify contract");
}
