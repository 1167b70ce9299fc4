//! Session and track configuration.
//!
//! A session configuration is immutable for the lifetime of a run. Tracks
//! are loaded from a TOML file (`[[tracks]]` records); unknown providers
//! and malformed names are rejected at load time, before any fan-out.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Provider kinds accepted in a tracks file.
pub const KNOWN_PROVIDERS: &[&str] = &["manual", "claude", "gemini", "copilot"];

/// Errors raised while loading or validating a session configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A track names a provider that no adapter is registered for.
    #[error("unknown provider {provider:?} for track {track:?} (expected one of {KNOWN_PROVIDERS:?})")]
    UnknownProvider { track: String, provider: String },

    /// Run ids are restricted to 1-64 chars of letters, digits, '.', '_', '-'.
    #[error("invalid run id {0:?}: use 1-64 chars of letters/digits plus '._-', starting with a letter or digit")]
    InvalidRunId(String),

    /// Track names are restricted to 1-32 chars of letters, digits, '_', '-'.
    #[error("invalid track name {0:?}: use 1-32 chars of letters/digits plus '_-', starting with a letter or digit")]
    InvalidTrackName(String),

    #[error("duplicate track name {0:?}")]
    DuplicateTrackName(String),

    #[error("track {track:?} has max_iters = 0; budgets require max_iters >= 1")]
    InvalidBudget { track: String },

    #[error("failed to read tracks file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse tracks file {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Session mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Debug,
    Harden,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Debug => write!(f, "debug"),
            Mode::Harden => write!(f, "harden"),
        }
    }
}

/// Track role. Fixers must produce a patch; breakers hunt for defects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Fixer,
    Breaker,
    Debugger,
    Experimental,
}

impl Role {
    /// Roles expected to end the session with a patch.
    pub fn requires_patch(self) -> bool {
        matches!(self, Role::Fixer)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Fixer => "fixer",
            Role::Breaker => "breaker",
            Role::Debugger => "debugger",
            Role::Experimental => "experimental",
        }
    }
}

/// Per-track iteration budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackBudget {
    #[serde(default = "default_max_iters")]
    pub max_iters: u32,
    #[serde(default = "default_iter_timeout")]
    pub per_iter_timeout_s: u64,
}

impl Default for TrackBudget {
    fn default() -> Self {
        Self {
            max_iters: default_max_iters(),
            per_iter_timeout_s: default_iter_timeout(),
        }
    }
}

fn default_max_iters() -> u32 {
    3
}

fn default_iter_timeout() -> u64 {
    std::env::var("ANVIL_ITER_TIMEOUT_S")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(600)
}

/// Configuration for a single track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackConfig {
    pub name: String,
    pub role: Role,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Free-form steering text appended to this track's prompts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directives: Option<String>,
    #[serde(default)]
    pub budget: TrackBudget,
}

/// On-disk shape of a tracks file.
#[derive(Debug, Deserialize)]
struct TracksFile {
    #[serde(default)]
    tracks: Vec<TrackConfig>,
}

/// Immutable configuration for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub run_id: String,
    /// Root directory that holds `runs/<run-id>/` directories.
    pub runs_root: PathBuf,
    pub repo_path: PathBuf,
    pub mode: Mode,
    pub issue_text: Option<String>,
    pub resume: bool,
    pub auto_apply: bool,
    pub container: bool,
    /// Harden mode: run the verifier on every iteration that yields a patch.
    pub verify_patches: bool,
    pub tracks: Vec<TrackConfig>,
}

impl SessionConfig {
    /// Run directory for this session's artifacts.
    pub fn run_dir(&self) -> PathBuf {
        self.runs_root.join(&self.run_id)
    }

    /// Hex SHA-256 over the canonical JSON form of this configuration.
    ///
    /// Recorded in RUN.json so a resumed run can be checked against the
    /// configuration it started with.
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }
}

/// Generate a time-sortable run id: `YYYYMMDD_HHMMSS_<rand4>`.
pub fn new_run_id() -> String {
    let ts = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let mut rng = rand::rng();
    let suffix: String = (0..4)
        .map(|_| {
            let chars = b"abcdefghijklmnopqrstuvwxyz0123456789";
            chars[rng.random_range(0..chars.len())] as char
        })
        .collect();
    format!("{ts}_{suffix}")
}

/// Validate a run id against the restricted character set.
pub fn validate_run_id(run_id: &str) -> Result<&str, ConfigError> {
    let mut chars = run_id.chars();
    let head_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let tail_ok = run_id.len() <= 64
        && run_id[1..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if head_ok && tail_ok {
        Ok(run_id)
    } else {
        Err(ConfigError::InvalidRunId(run_id.to_string()))
    }
}

/// Validate a track name against the restricted character set.
pub fn validate_track_name(name: &str) -> Result<&str, ConfigError> {
    let mut chars = name.chars();
    let head_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let tail_ok = name.len() <= 32
        && name[1..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));
    if head_ok && tail_ok {
        Ok(name)
    } else {
        Err(ConfigError::InvalidTrackName(name.to_string()))
    }
}

/// Load and validate a tracks file.
///
/// Every track must have a valid, unique name, a known provider, and a
/// budget with `max_iters >= 1`.
pub fn load_tracks_file(path: &Path) -> Result<Vec<TrackConfig>, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: TracksFile = toml::from_str(&contents).map_err(|source| ConfigError::Toml {
        path: path.to_path_buf(),
        source,
    })?;
    validate_tracks(parsed.tracks)
}

/// Validate an in-memory track list (shared by file loading and defaults).
pub fn validate_tracks(tracks: Vec<TrackConfig>) -> Result<Vec<TrackConfig>, ConfigError> {
    let mut seen = HashSet::new();
    for t in &tracks {
        validate_track_name(&t.name)?;
        if !seen.insert(t.name.clone()) {
            return Err(ConfigError::DuplicateTrackName(t.name.clone()));
        }
        if !KNOWN_PROVIDERS.contains(&t.provider.as_str()) {
            return Err(ConfigError::UnknownProvider {
                track: t.name.clone(),
                provider: t.provider.clone(),
            });
        }
        if t.budget.max_iters == 0 {
            return Err(ConfigError::InvalidBudget {
                track: t.name.clone(),
            });
        }
    }
    Ok(tracks)
}

/// Fallback track set when no tracks file is present.
///
/// Debug mode gets a fixer plus a breaker; harden mode a single breaker.
pub fn default_tracks(mode: Mode) -> Vec<TrackConfig> {
    match mode {
        Mode::Debug => vec![
            TrackConfig {
                name: "A".to_string(),
                role: Role::Fixer,
                provider: "manual".to_string(),
                model: None,
                directives: None,
                budget: TrackBudget::default(),
            },
            TrackConfig {
                name: "B".to_string(),
                role: Role::Breaker,
                provider: "manual".to_string(),
                model: None,
                directives: None,
                budget: TrackBudget::default(),
            },
        ],
        Mode::Harden => vec![TrackConfig {
            name: "scan".to_string(),
            role: Role::Breaker,
            provider: "manual".to_string(),
            model: None,
            directives: None,
            budget: TrackBudget::default(),
        }],
    }
}

/// Resolve the track list for a session: explicit file, then the repo's
/// `.dbg/tracks.toml`, then built-in defaults.
pub fn resolve_tracks(
    tracks_file: Option<&Path>,
    repo_path: &Path,
    mode: Mode,
) -> Result<Vec<TrackConfig>, ConfigError> {
    if let Some(path) = tracks_file {
        return load_tracks_file(path);
    }
    let repo_tracks = repo_path.join(".dbg").join("tracks.toml");
    if repo_tracks.exists() {
        return load_tracks_file(&repo_tracks);
    }
    Ok(default_tracks(mode))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(name: &str, provider: &str) -> TrackConfig {
        TrackConfig {
            name: name.to_string(),
            role: Role::Fixer,
            provider: provider.to_string(),
            model: None,
            directives: None,
            budget: TrackBudget::default(),
        }
    }

    #[test]
    fn run_id_validation() {
        assert!(validate_run_id("20260101_120000_ab3d").is_ok());
        assert!(validate_run_id("run-1.a_b").is_ok());
        assert!(validate_run_id("").is_err());
        assert!(validate_run_id("-leading-dash").is_err());
        assert!(validate_run_id("has space").is_err());
        assert!(validate_run_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn track_name_validation() {
        assert!(validate_track_name("A").is_ok());
        assert!(validate_track_name("track_1-x").is_ok());
        assert!(validate_track_name("no.dots").is_err());
        assert!(validate_track_name(&"t".repeat(33)).is_err());
    }

    #[test]
    fn new_run_id_is_valid_and_sortable_shaped() {
        let id = new_run_id();
        assert!(validate_run_id(&id).is_ok());
        // YYYYMMDD_HHMMSS_xxxx
        assert_eq!(id.len(), 8 + 1 + 6 + 1 + 4);
    }

    #[test]
    fn unknown_provider_rejected() {
        let err = validate_tracks(vec![track("A", "skynet")]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider { .. }));
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = validate_tracks(vec![track("A", "manual"), track("A", "manual")]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTrackName(_)));
    }

    #[test]
    fn zero_iteration_budget_rejected() {
        let mut t = track("A", "manual");
        t.budget.max_iters = 0;
        let err = validate_tracks(vec![t]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBudget { .. }));
    }

    #[test]
    fn tracks_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracks.toml");
        std::fs::write(
            &path,
            r#"
[[tracks]]
name = "fast"
role = "fixer"
provider = "claude"
model = "opus"

[tracks.budget]
max_iters = 2
per_iter_timeout_s = 30

[[tracks]]
name = "scan"
role = "breaker"
provider = "manual"
"#,
        )
        .unwrap();

        let tracks = load_tracks_file(&path).unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].name, "fast");
        assert_eq!(tracks[0].role, Role::Fixer);
        assert_eq!(tracks[0].model.as_deref(), Some("opus"));
        assert_eq!(tracks[0].budget.max_iters, 2);
        assert_eq!(tracks[0].budget.per_iter_timeout_s, 30);
        assert_eq!(tracks[1].role, Role::Breaker);
        assert_eq!(tracks[1].budget.max_iters, 3); // default
    }

    #[test]
    fn config_digest_is_stable() {
        let cfg = SessionConfig {
            run_id: "r1".to_string(),
            runs_root: PathBuf::from("/tmp/runs"),
            repo_path: PathBuf::from("/tmp/repo"),
            mode: Mode::Debug,
            issue_text: Some("fix it".to_string()),
            resume: false,
            auto_apply: true,
            container: false,
            verify_patches: false,
            tracks: default_tracks(Mode::Debug),
        };
        assert_eq!(cfg.digest(), cfg.digest());
        assert_eq!(cfg.digest().len(), 64);
    }

    #[test]
    fn resolve_tracks_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let tracks = resolve_tracks(None, dir.path(), Mode::Harden).unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].role, Role::Breaker);
    }
}
