//! Apply the winning patch to the main repository.
//!
//! The only step that mutates the main working tree, serialized after the
//! judge. A pre-flight `git apply --check` guards the real apply: an
//! already-applied or conflicting patch is reported in `APPLY.md` without
//! touching the tree.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use crate::provider::common::sh_quote;
use crate::shell::{CommandRequest, CommandRunner};
use crate::store::ArtifactStore;

const APPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of the apply step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The dry-run rejected the patch; the tree was not modified.
    CheckFailed { exit_code: i32 },
    /// The dry-run passed but the real apply failed.
    ApplyFailed { exit_code: i32 },
}

/// Dry-run then apply `patch` in `repo`, writing `APPLY.md` and logs.
pub async fn apply_patch(
    store: &ArtifactStore,
    repo: &Path,
    runner: &CommandRunner,
    patch: &Path,
) -> Result<ApplyOutcome> {
    let quoted = sh_quote(patch);

    let check_req = CommandRequest::new(
        format!("git apply --check --whitespace=nowarn {quoted}"),
        repo,
        APPLY_TIMEOUT,
        store.path("logs/apply_check.stdout.log")?,
        store.path("logs/apply_check.stderr.log")?,
    );
    let check = runner.run(&check_req).await?;

    if !check.success() {
        let stderr = std::fs::read_to_string(&check.stderr_path).unwrap_or_default();
        let md = format!(
            "# APPLY\n\nPatch: `{}`\n\n## Pre-flight check failed\n\n```text\n{}\n```\n\nExit: {}\n\nThe working tree was not modified.\n",
            patch.display(),
            stderr.trim(),
            check.exit_code,
        );
        store.write_text("APPLY.md", &md)?;
        return Ok(ApplyOutcome::CheckFailed {
            exit_code: check.exit_code,
        });
    }

    let apply_req = CommandRequest::new(
        format!("git apply --whitespace=nowarn {quoted}"),
        repo,
        APPLY_TIMEOUT,
        store.path("logs/apply.stdout.log")?,
        store.path("logs/apply.stderr.log")?,
    );
    let applied = runner.run(&apply_req).await?;

    let outcome = if applied.success() {
        ApplyOutcome::Applied
    } else {
        ApplyOutcome::ApplyFailed {
            exit_code: applied.exit_code,
        }
    };
    let md = format!(
        "# APPLY\n\nPatch: `{}`\n\nPre-flight check: OK\nExit: {}\n",
        patch.display(),
        applied.exit_code,
    );
    store.write_text("APPLY.md", &md)?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_test_utils::create_temp_git_repo;

    const PATCH: &str = "\
diff --git a/README.md b/README.md
index 7b57bd2..f3e9d2a 100644
--- a/README.md
+++ b/README.md
@@ -1 +1 @@
-# Test repo
+# Test repo, patched
";

    fn store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("run"));
        store.ensure().unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn applies_a_clean_patch() {
        let (repo_dir, repo) = create_temp_git_repo();
        let (_dir, store) = store();
        let patch_path = repo_dir.path().join("fix.diff");
        std::fs::write(&patch_path, PATCH).unwrap();

        let outcome = apply_patch(&store, &repo, &CommandRunner::host(), &patch_path)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        let readme = std::fs::read_to_string(repo.join("README.md")).unwrap();
        assert!(readme.contains("patched"));
        assert!(store.read_to_string("APPLY.md").unwrap().contains("Pre-flight check: OK"));
    }

    #[tokio::test]
    async fn double_apply_is_caught_by_dry_run() {
        let (repo_dir, repo) = create_temp_git_repo();
        let (_dir, store) = store();
        let patch_path = repo_dir.path().join("fix.diff");
        std::fs::write(&patch_path, PATCH).unwrap();

        let runner = CommandRunner::host();
        let first = apply_patch(&store, &repo, &runner, &patch_path).await.unwrap();
        assert_eq!(first, ApplyOutcome::Applied);

        let second = apply_patch(&store, &repo, &runner, &patch_path).await.unwrap();
        assert!(matches!(second, ApplyOutcome::CheckFailed { .. }));
        // State not corrupted: still exactly one application.
        let readme = std::fs::read_to_string(repo.join("README.md")).unwrap();
        assert_eq!(readme.matches("patched").count(), 1);
        let md = store.read_to_string("APPLY.md").unwrap();
        assert!(md.contains("Pre-flight check failed"));
    }
}
