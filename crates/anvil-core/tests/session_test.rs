//! End-to-end session driver scenarios (manual provider, real git repos).

use std::path::Path;

use tokio_util::sync::CancellationToken;

use anvil_core::config::{Mode, Role, SessionConfig, TrackBudget, TrackConfig};
use anvil_core::schema::{RunState, RunStatus};
use anvil_core::session::{run_debug, run_harden, SessionError};
use anvil_core::store::ArtifactStore;
use anvil_core::worktree::WorktreeManager;

use anvil_test_utils::create_temp_git_repo;

fn manual_track(name: &str, role: Role, max_iters: u32) -> TrackConfig {
    TrackConfig {
        name: name.to_string(),
        role,
        provider: "manual".to_string(),
        model: None,
        directives: None,
        budget: TrackBudget {
            max_iters,
            per_iter_timeout_s: 30,
        },
    }
}

fn config(repo: &Path, run_id: &str, mode: Mode, tracks: Vec<TrackConfig>) -> SessionConfig {
    SessionConfig {
        run_id: run_id.to_string(),
        runs_root: repo.join(".dbg").join("runs"),
        repo_path: repo.to_path_buf(),
        mode,
        issue_text: match mode {
            Mode::Debug => Some("fix typo in README".to_string()),
            Mode::Harden => None,
        },
        resume: false,
        auto_apply: true,
        container: false,
        verify_patches: false,
        tracks,
    }
}

fn store_for(cfg: &SessionConfig) -> ArtifactStore {
    ArtifactStore::new(cfg.run_dir())
}

#[tokio::test]
async fn manual_single_track_debug_produces_expected_artifacts() {
    let (_dir, repo) = create_temp_git_repo();
    let cfg = config(
        &repo,
        "run-solo",
        Mode::Debug,
        vec![manual_track("solo", Role::Debugger, 1)],
    );

    let result = run_debug(&cfg, CancellationToken::new()).await.unwrap();
    let store = store_for(&cfg);

    for rel in [
        "RUN.json",
        "RUN_STATUS.json",
        "CONTEXT.md",
        "FILES.json",
        "REPRO.md",
        "tracks/solo/iter_01/ITERATION.json",
        "tracks/solo/iter_01/ITERATION.txt",
        "DECISION.md",
        "SCORECARD.json",
        "BLACKBOARD.md",
        "events.jsonl",
    ] {
        assert!(store.exists(rel), "missing artifact {rel}");
    }

    // Manual yields NEEDS_MORE_WORK with no patch: no winner, no apply.
    assert_eq!(result.winner, None);
    assert!(!store.exists("APPLY.md"));
    assert!(!store.exists("CRASH.txt"));
    assert_eq!(result.status, RunState::Ok);

    let status: RunStatus = store.read_json("RUN_STATUS.json").unwrap();
    assert_eq!(status.status, RunState::Ok);

    let decision = store.read_to_string("DECISION.md").unwrap();
    assert!(decision.contains("Winner: **NONE**"));
}

#[tokio::test]
async fn harden_mode_writes_report_and_skips_apply() {
    let (_dir, repo) = create_temp_git_repo();
    let cfg = config(
        &repo,
        "run-harden",
        Mode::Harden,
        vec![manual_track("scan", Role::Breaker, 1)],
    );

    let result = run_harden(&cfg, CancellationToken::new()).await.unwrap();
    let store = store_for(&cfg);

    assert_eq!(result.status, RunState::Done);
    assert!(store.exists("HARDEN.md"));
    assert!(store.exists("VERIFY.md"));
    assert!(!store.exists("APPLY.md"));

    let report = store.read_to_string("HARDEN.md").unwrap();
    assert!(report.contains("### scan"));
    assert!(report.contains("Findings by track"));
    assert_eq!(
        result.decision_file.as_deref().map(|p| p.file_name().unwrap().to_str().unwrap().to_string()),
        Some("HARDEN.md".to_string())
    );
}

#[tokio::test]
async fn resume_of_completed_run_is_a_noop_on_disk() {
    let (_dir, repo) = create_temp_git_repo();
    let mut cfg = config(
        &repo,
        "run-resume",
        Mode::Debug,
        vec![manual_track("solo", Role::Debugger, 1)],
    );
    run_debug(&cfg, CancellationToken::new()).await.unwrap();
    let store = store_for(&cfg);

    let run_json_before = store.read("RUN.json").unwrap();
    let iteration_before = store.read("tracks/solo/iter_01/ITERATION.json").unwrap();
    let status_before = store.read("RUN_STATUS.json").unwrap();

    cfg.resume = true;
    cfg.issue_text = None;
    let result = run_debug(&cfg, CancellationToken::new()).await.unwrap();
    assert_eq!(result.status, RunState::Ok);

    assert_eq!(store.read("RUN.json").unwrap(), run_json_before);
    assert_eq!(
        store.read("tracks/solo/iter_01/ITERATION.json").unwrap(),
        iteration_before
    );
    assert_eq!(store.read("RUN_STATUS.json").unwrap(), status_before);
    assert!(!store.exists("tracks/solo/iter_02"));
}

#[tokio::test]
async fn stale_branch_fails_session_with_crash_artifact() {
    let (_dir, repo) = create_temp_git_repo();
    // A prior crash left the track branch behind.
    let out = std::process::Command::new("git")
        .args(["branch", "dbg/run-conflict/solo"])
        .current_dir(&repo)
        .output()
        .unwrap();
    assert!(out.status.success());

    let cfg = config(
        &repo,
        "run-conflict",
        Mode::Debug,
        vec![manual_track("solo", Role::Debugger, 1)],
    );
    let err = run_debug(&cfg, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SessionError::Environment(_)));

    let store = store_for(&cfg);
    assert!(store.exists("CRASH.txt"));
    let status: RunStatus = store.read_json("RUN_STATUS.json").unwrap();
    assert_eq!(status.status, RunState::Fail);

    // Explicit cleanup then retry succeeds, and the stale crash marker is
    // cleared so FAIL and CRASH.txt stay paired.
    let mgr = WorktreeManager::new(&repo, "run-conflict").unwrap();
    mgr.cleanup_all().unwrap();
    let result = run_debug(&cfg, CancellationToken::new()).await.unwrap();
    assert_eq!(result.status, RunState::Ok);
    assert!(!store.exists("CRASH.txt"));
}

#[tokio::test]
async fn non_git_repo_is_an_environment_failure() {
    let plain = tempfile::tempdir().unwrap();
    let cfg = config(
        plain.path(),
        "run-nogit",
        Mode::Debug,
        vec![manual_track("solo", Role::Debugger, 1)],
    );
    let err = run_debug(&cfg, CancellationToken::new()).await.unwrap_err();
    match err {
        SessionError::Environment(e) => {
            assert!(e.to_string().contains("not a git repository"));
        }
        other => panic!("expected environment failure, got {other:?}"),
    }
    // FAIL status and CRASH.txt are paired.
    let store = store_for(&cfg);
    assert!(store.exists("CRASH.txt"));
    let status: RunStatus = store.read_json("RUN_STATUS.json").unwrap();
    assert_eq!(status.status, RunState::Fail);
}

#[tokio::test]
async fn parallel_tracks_are_contained_and_judged_independently() {
    let (_dir, repo) = create_temp_git_repo();
    // One well-behaved manual breaker; one track whose provider kind is not
    // registered, forcing the error adapter path. The config is built
    // directly, bypassing load-time validation on purpose.
    let mut broken = manual_track("broken", Role::Breaker, 1);
    broken.provider = "unregistered".to_string();

    let cfg = config(
        &repo,
        "run-mixed",
        Mode::Debug,
        vec![manual_track("ok", Role::Breaker, 1), broken],
    );
    let result = run_debug(&cfg, CancellationToken::new()).await.unwrap();
    let store = store_for(&cfg);

    // The crashed track is disqualified; the healthy one still completed.
    let status: RunStatus = store.read_json("RUN_STATUS.json").unwrap();
    assert!(status.disqualified_tracks.contains(&"broken".to_string()));
    assert!(store.exists("tracks/ok/iter_01/ITERATION.json"));
    assert!(store.exists("tracks/broken/CRASH.txt"));
    assert!(!store.exists("CRASH.txt"));
    assert_eq!(result.winner, None);

    let scorecard: serde_json::Value = store.read_json("SCORECARD.json").unwrap();
    assert_eq!(scorecard["tracks"]["broken"]["score"], 0.0);
    assert_eq!(
        scorecard["tracks"]["broken"]["disqualified"],
        "InternalCrash"
    );
}
