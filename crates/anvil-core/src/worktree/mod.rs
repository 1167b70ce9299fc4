//! Git worktree isolation, one checkout per track.
//!
//! Each track works in its own git worktree under
//! `<repo>/.dbg/worktrees/<run-id>/<track>` on a deterministic branch
//! `dbg/<run-id>/<track>`. Worktrees share the main repository's object
//! store but have independent working directories, so parallel tracks can
//! never see each other's edits.
//!
//! Git serializes worktree mutations through a repo-level lock file, so all
//! mutating operations here go through an internal mutex.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::config::TrackConfig;

/// Errors from worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// The target repository is not version-controlled. Hard precondition.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// The track's branch already exists, typically left over from a prior
    /// run with the same run id. Callers abort or run explicit cleanup.
    #[error("branch {branch} already exists; run `anvil cleanup run` or pick a new run id")]
    BranchConflict { branch: String },

    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// Manages the isolated checkouts for one run.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    run_id: String,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            run_id: self.run_id.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorktreeManager {
    /// Create a manager for `repo_path` / `run_id`.
    ///
    /// Fails with [`WorktreeError::NotAGitRepo`] if the repository is not a
    /// git tree; isolation depends on it.
    pub fn new(repo_path: impl Into<PathBuf>, run_id: impl Into<String>) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();
        let output = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }
        Ok(Self {
            repo_path,
            run_id: run_id.into(),
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Root directory holding this run's worktrees.
    pub fn worktrees_root(&self) -> PathBuf {
        all_worktrees_root(&self.repo_path).join(&self.run_id)
    }

    /// Branch name for a track: `dbg/<run-id>/<track>`.
    pub fn branch_name(&self, track: &str) -> String {
        format!("dbg/{}/{}", self.run_id, track)
    }

    /// Deterministic worktree path for a track. Pure; repeated calls return
    /// the same path whether or not the worktree exists yet.
    pub fn get_path(&self, track: &str) -> PathBuf {
        self.worktrees_root().join(track)
    }

    /// Create the worktree for a track on a fresh branch from HEAD.
    ///
    /// Fails with [`WorktreeError::BranchConflict`] when the branch already
    /// exists. Creating an already-present worktree on the right branch is a
    /// no-op returning the existing path.
    pub fn create(&self, track: &str) -> Result<PathBuf, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let wt_dir = self.get_path(track);
        let branch = self.branch_name(track);

        if wt_dir.exists() {
            return Ok(wt_dir);
        }
        if self.branch_exists(&branch)? {
            return Err(WorktreeError::BranchConflict { branch });
        }

        if let Some(parent) = wt_dir.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WorktreeError::GitCommand {
                message: format!("failed to create worktrees root {}", parent.display()),
                source: e,
            })?;
        }

        let output = Command::new("git")
            .args(["worktree", "add", "-b", &branch])
            .arg(&wt_dir)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree add".into(),
                source: e,
            })?;
        if !output.status.success() {
            // Clean up any partial directory before surfacing the failure.
            if wt_dir.exists() {
                let _ = std::fs::remove_dir_all(&wt_dir);
                let _ = self.prune();
            }
            return Err(WorktreeError::GitExit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(wt_dir)
    }

    /// Drop a track contract into a freshly created worktree.
    pub fn write_contract(&self, track: &TrackConfig) -> Result<(), WorktreeError> {
        let wt_dir = self.get_path(&track.name);
        if !wt_dir.exists() {
            return Ok(());
        }
        let contract = format!(
            "# CONTRACT -- worktree {name}\n\n\
             - role: {role}\n\
             - provider: {provider}\n\
             - model: {model}\n\n\
             ## Required artifacts (written to the run directory, not committed here)\n\
             - tracks/{name}/iter_NN/ITERATION.json\n\
             - tracks/{name}/iter_NN/ITERATION.txt\n\n\
             ## Disqualification\n\
             - Missing or invalid ITERATION.json\n\
             - Editing outside this worktree\n\
             - Claiming verification without logs\n",
            name = track.name,
            role = track.role.as_str(),
            provider = track.provider,
            model = track.model.as_deref().unwrap_or("default"),
        );
        std::fs::write(wt_dir.join("CONTRACT.md"), contract).map_err(|e| {
            WorktreeError::GitCommand {
                message: format!("failed to write CONTRACT.md for {}", track.name),
                source: e,
            }
        })
    }

    /// Archive a track's branch and remove its worktree.
    ///
    /// The branch is renamed to `archive/anvil-<run-id>-<track>-<ts>` so the
    /// work stays reachable; the worktree directory is removed. Idempotent:
    /// a second call on the same track is a no-op.
    pub fn archive_and_cleanup(&self, track: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        self.remove_worktree_dir(track)?;
        let branch = self.branch_name(track);
        if self.branch_exists(&branch)? {
            let ts = chrono::Utc::now().format("%Y%m%d_%H%M%S");
            let archive = format!("archive/anvil-{}-{}-{}", self.run_id, track, ts);
            self.git(&["branch", "-m", &branch, &archive], "branch -m")?;
            tracing::info!(branch, archive, "archived track branch");
        }
        Ok(())
    }

    /// Remove a track's worktree and delete its branch. Idempotent.
    pub fn cleanup(&self, track: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        self.remove_worktree_dir(track)?;
        let branch = self.branch_name(track);
        if self.branch_exists(&branch)? {
            self.git(&["branch", "-D", &branch], "branch -D")?;
        }
        Ok(())
    }

    /// All tracks of this run that have cleanup work: worktrees present on
    /// disk plus any stray `dbg/<run-id>/*` branches a crash left behind
    /// without a directory.
    pub fn tracks(&self) -> Result<Vec<String>, WorktreeError> {
        let mut tracks = list_dirs(&self.worktrees_root());
        for branch_track in self.run_branch_tracks()? {
            if !tracks.contains(&branch_track) {
                tracks.push(branch_track);
            }
        }
        Ok(tracks)
    }

    /// Clean up every track of this run.
    pub fn cleanup_all(&self) -> Result<usize, WorktreeError> {
        let tracks = self.tracks()?;
        let cleaned = tracks.len();
        for track in tracks {
            self.cleanup(&track)?;
        }
        let root = self.worktrees_root();
        if root.exists() {
            let _ = std::fs::remove_dir(&root);
        }
        Ok(cleaned)
    }

    /// Archive every track branch of this run and remove the worktrees.
    pub fn archive_all(&self) -> Result<usize, WorktreeError> {
        let tracks = self.tracks()?;
        let archived = tracks.len();
        for track in tracks {
            self.archive_and_cleanup(&track)?;
        }
        let root = self.worktrees_root();
        if root.exists() {
            let _ = std::fs::remove_dir(&root);
        }
        Ok(archived)
    }

    /// Track names derived from existing `dbg/<run-id>/*` branches.
    fn run_branch_tracks(&self) -> Result<Vec<String>, WorktreeError> {
        let pattern = format!("dbg/{}/*", self.run_id);
        let output = Command::new("git")
            .args(["branch", "--list", "--format=%(refname:short)", &pattern])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git branch --list".into(),
                source: e,
            })?;
        let prefix = format!("dbg/{}/", self.run_id);
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().strip_prefix(&prefix))
            .map(str::to_string)
            .collect())
    }

    fn remove_worktree_dir(&self, track: &str) -> Result<(), WorktreeError> {
        let wt_dir = self.get_path(track);
        if !wt_dir.exists() {
            return Ok(());
        }
        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(&wt_dir)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree remove".into(),
                source: e,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("is not a working tree") {
                let _ = std::fs::remove_dir_all(&wt_dir);
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "worktree remove".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }
        Ok(())
    }

    /// Prune stale worktree bookkeeping after external deletions.
    pub fn prune(&self) -> Result<(), WorktreeError> {
        self.git(&["worktree", "prune"], "worktree prune")
    }

    fn branch_exists(&self, branch: &str) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify"])
            .arg(format!("refs/heads/{branch}"))
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse --verify".into(),
                source: e,
            })?;
        Ok(output.status.success())
    }

    fn git(&self, args: &[&str], label: &str) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: format!("failed to run git {label}"),
                source: e,
            })?;
        if !output.status.success() {
            return Err(WorktreeError::GitExit {
                command: label.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }
}

/// Root directory holding worktrees for every run of this repo.
pub fn all_worktrees_root(repo_path: &Path) -> PathBuf {
    repo_path.join(".dbg").join("worktrees")
}

/// Enumerate `(run_id, track)` pairs for all worktrees on disk.
pub fn list_all(repo_path: &Path) -> Vec<(String, String)> {
    let root = all_worktrees_root(repo_path);
    let mut out = Vec::new();
    for run_id in list_dirs(&root) {
        for track in list_dirs(&root.join(&run_id)) {
            out.push((run_id.clone(), track));
        }
    }
    out.sort();
    out
}

/// Run ids whose worktree root was last modified more than `days` ago.
pub fn stale_runs(repo_path: &Path, days: u64) -> Vec<String> {
    let root = all_worktrees_root(repo_path);
    let cutoff = std::time::SystemTime::now() - std::time::Duration::from_secs(days * 24 * 3600);
    let mut out = Vec::new();
    for run_id in list_dirs(&root) {
        let dir = root.join(&run_id);
        let old = std::fs::metadata(&dir)
            .and_then(|m| m.modified())
            .map(|m| m < cutoff)
            .unwrap_or(false);
        if old {
            out.push(run_id);
        }
    }
    out.sort();
    out
}

fn list_dirs(root: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Role, TrackBudget};

    fn create_temp_repo() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo_path = dir.path().to_path_buf();
        let run = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(&repo_path)
                .output()
                .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
            assert!(output.status.success(), "git {} failed", args.join(" "));
        };
        run(&["init"]);
        run(&["config", "user.email", "test@anvil.dev"]);
        run(&["config", "user.name", "Anvil Test"]);
        std::fs::write(repo_path.join("README.md"), "# Test\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "initial commit"]);
        (dir, repo_path)
    }

    #[test]
    fn non_git_repo_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = WorktreeManager::new(dir.path(), "r1").unwrap_err();
        assert!(matches!(err, WorktreeError::NotAGitRepo(_)));
    }

    #[test]
    fn create_places_worktree_on_expected_branch() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo, "r1").unwrap();
        let path = mgr.create("A").unwrap();
        assert!(path.exists());
        assert_eq!(path, repo.join(".dbg/worktrees/r1/A"));
        assert!(mgr.branch_exists("dbg/r1/A").unwrap());

        // Idempotent: same path on a second call.
        assert_eq!(mgr.create("A").unwrap(), path);
    }

    #[test]
    fn existing_branch_is_a_conflict() {
        let (_dir, repo) = create_temp_repo();
        let out = Command::new("git")
            .args(["branch", "dbg/r1/A"])
            .current_dir(&repo)
            .output()
            .unwrap();
        assert!(out.status.success());

        let mgr = WorktreeManager::new(&repo, "r1").unwrap();
        let err = mgr.create("A").unwrap_err();
        assert!(matches!(err, WorktreeError::BranchConflict { .. }));
    }

    #[test]
    fn worktree_edits_stay_isolated() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo, "r1").unwrap();
        let path = mgr.create("A").unwrap();
        std::fs::write(path.join("agent-work.txt"), "x\n").unwrap();
        assert!(!repo.join("agent-work.txt").exists());
    }

    #[test]
    fn cleanup_removes_worktree_and_branch_idempotently() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo, "r1").unwrap();
        let path = mgr.create("A").unwrap();

        mgr.cleanup("A").unwrap();
        assert!(!path.exists());
        assert!(!mgr.branch_exists("dbg/r1/A").unwrap());

        // Second cleanup is a no-op.
        mgr.cleanup("A").unwrap();
    }

    #[test]
    fn archive_renames_branch() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo, "r1").unwrap();
        mgr.create("A").unwrap();

        mgr.archive_and_cleanup("A").unwrap();
        assert!(!mgr.branch_exists("dbg/r1/A").unwrap());

        let out = Command::new("git")
            .args(["branch", "--list", "archive/anvil-r1-A-*"])
            .current_dir(&repo)
            .output()
            .unwrap();
        let listing = String::from_utf8_lossy(&out.stdout);
        assert!(
            listing.contains("archive/anvil-r1-A-"),
            "expected archive branch, got: {listing}"
        );

        // Second archive pass is a no-op.
        mgr.archive_and_cleanup("A").unwrap();
    }

    #[test]
    fn cleanup_all_sweeps_every_track() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo, "r1").unwrap();
        mgr.create("A").unwrap();
        mgr.create("B").unwrap();

        let cleaned = mgr.cleanup_all().unwrap();
        assert_eq!(cleaned, 2);
        assert!(!mgr.get_path("A").exists());
        assert!(!mgr.get_path("B").exists());

        assert_eq!(mgr.cleanup_all().unwrap(), 0);
    }

    #[test]
    fn archive_all_preserves_branches_under_archive_namespace() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo, "r1").unwrap();
        mgr.create("A").unwrap();
        mgr.create("B").unwrap();

        let archived = mgr.archive_all().unwrap();
        assert_eq!(archived, 2);
        assert!(!mgr.get_path("A").exists());
        assert!(!mgr.branch_exists("dbg/r1/A").unwrap());

        let out = Command::new("git")
            .args(["branch", "--list", "archive/anvil-r1-*"])
            .current_dir(&repo)
            .output()
            .unwrap();
        let listing = String::from_utf8_lossy(&out.stdout);
        assert!(listing.contains("archive/anvil-r1-A-"));
        assert!(listing.contains("archive/anvil-r1-B-"));
    }

    #[test]
    fn cleanup_all_sweeps_stray_branches_without_directories() {
        let (_dir, repo) = create_temp_repo();
        // Simulate a crash that left a branch but no worktree directory.
        let out = Command::new("git")
            .args(["branch", "dbg/r1/A"])
            .current_dir(&repo)
            .output()
            .unwrap();
        assert!(out.status.success());

        let mgr = WorktreeManager::new(&repo, "r1").unwrap();
        let cleaned = mgr.cleanup_all().unwrap();
        assert_eq!(cleaned, 1);
        assert!(!mgr.branch_exists("dbg/r1/A").unwrap());

        // Retrying the run now succeeds.
        mgr.create("A").unwrap();
        mgr.cleanup_all().unwrap();
    }

    #[test]
    fn list_all_enumerates_runs_and_tracks() {
        let (_dir, repo) = create_temp_repo();
        let mgr1 = WorktreeManager::new(&repo, "r1").unwrap();
        mgr1.create("A").unwrap();
        let mgr2 = WorktreeManager::new(&repo, "r2").unwrap();
        mgr2.create("B").unwrap();

        let all = list_all(&repo);
        assert_eq!(
            all,
            vec![
                ("r1".to_string(), "A".to_string()),
                ("r2".to_string(), "B".to_string())
            ]
        );
    }

    #[test]
    fn contract_written_into_worktree() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo, "r1").unwrap();
        mgr.create("A").unwrap();
        let track = TrackConfig {
            name: "A".to_string(),
            role: Role::Fixer,
            provider: "manual".to_string(),
            model: None,
            directives: None,
            budget: TrackBudget::default(),
        };
        mgr.write_contract(&track).unwrap();
        let text = std::fs::read_to_string(mgr.get_path("A").join("CONTRACT.md")).unwrap();
        assert!(text.contains("role: fixer"));
        assert!(text.contains("tracks/A/iter_NN/ITERATION.json"));
    }
}
