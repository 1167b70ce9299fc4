//! Path-safe artifact storage rooted at the run directory.
//!
//! All orchestration components persist through this store. Every relative
//! path is containment-checked (after symlink expansion) before any I/O, and
//! file writes are atomic via write-to-temp-then-rename in the destination
//! directory. Components write to disjoint namespaces by contract, so no
//! locking is needed.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors from artifact store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The resolved path escapes the run directory.
    #[error("refusing to access path outside run dir: {path}")]
    PathEscape { path: PathBuf },

    #[error("artifact I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact JSON failed for {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Filesystem namespace for one run's artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    run_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    /// Create the run directory skeleton (`tracks/`, `logs/`).
    pub fn ensure(&self) -> Result<(), StoreError> {
        for rel in ["", "tracks", "logs"] {
            let dir = if rel.is_empty() {
                self.run_dir.clone()
            } else {
                self.run_dir.join(rel)
            };
            std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io { path: dir, source })?;
        }
        Ok(())
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Resolve a relative path inside the run directory.
    ///
    /// Rejects absolute paths and any `..` component up front, then collapses
    /// symlinks on the deepest existing ancestor and requires the result to
    /// remain a descendant of the canonical run root.
    pub fn path(&self, rel: impl AsRef<Path>) -> Result<PathBuf, StoreError> {
        let rel = rel.as_ref();
        let mut joined = self.run_dir.clone();
        for comp in rel.components() {
            match comp {
                Component::Normal(c) => joined.push(c),
                Component::CurDir => {}
                _ => {
                    return Err(StoreError::PathEscape {
                        path: rel.to_path_buf(),
                    })
                }
            }
        }

        let root = canonicalize_existing(&self.run_dir).map_err(|source| StoreError::Io {
            path: self.run_dir.clone(),
            source,
        })?;
        let resolved = resolve_through_existing(&joined).map_err(|source| StoreError::Io {
            path: joined.clone(),
            source,
        })?;
        if !resolved.starts_with(&root) {
            return Err(StoreError::PathEscape { path: joined });
        }
        Ok(joined)
    }

    pub fn exists(&self, rel: impl AsRef<Path>) -> bool {
        self.path(rel).map(|p| p.exists()).unwrap_or(false)
    }

    /// Create a directory (and parents) inside the run directory.
    pub fn mkdirs(&self, rel: impl AsRef<Path>) -> Result<PathBuf, StoreError> {
        let p = self.path(rel)?;
        std::fs::create_dir_all(&p).map_err(|source| StoreError::Io {
            path: p.clone(),
            source,
        })?;
        Ok(p)
    }

    /// Atomically write bytes to an artifact.
    pub fn write(&self, rel: impl AsRef<Path>, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let p = self.path(rel)?;
        let parent = p.parent().unwrap_or(&self.run_dir).to_path_buf();
        std::fs::create_dir_all(&parent).map_err(|source| StoreError::Io {
            path: parent.clone(),
            source,
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(&parent).map_err(|source| StoreError::Io {
            path: parent.clone(),
            source,
        })?;
        tmp.write_all(bytes).map_err(|source| StoreError::Io {
            path: p.clone(),
            source,
        })?;
        tmp.persist(&p).map_err(|e| StoreError::Io {
            path: p.clone(),
            source: e.error,
        })?;
        Ok(p)
    }

    pub fn write_text(&self, rel: impl AsRef<Path>, text: &str) -> Result<PathBuf, StoreError> {
        self.write(rel, text.as_bytes())
    }

    /// Atomically write a pretty-printed JSON artifact with a trailing newline.
    pub fn write_json<T: Serialize>(
        &self,
        rel: impl AsRef<Path>,
        value: &T,
    ) -> Result<PathBuf, StoreError> {
        let rel = rel.as_ref();
        let mut buf = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
            path: rel.to_path_buf(),
            source,
        })?;
        buf.push(b'\n');
        self.write(rel, &buf)
    }

    pub fn read(&self, rel: impl AsRef<Path>) -> Result<Vec<u8>, StoreError> {
        let p = self.path(rel)?;
        std::fs::read(&p).map_err(|source| StoreError::Io { path: p, source })
    }

    pub fn read_to_string(&self, rel: impl AsRef<Path>) -> Result<String, StoreError> {
        let p = self.path(rel)?;
        std::fs::read_to_string(&p).map_err(|source| StoreError::Io { path: p, source })
    }

    pub fn read_json<T: DeserializeOwned>(&self, rel: impl AsRef<Path>) -> Result<T, StoreError> {
        let p = self.path(rel)?;
        let bytes = std::fs::read(&p).map_err(|source| StoreError::Io {
            path: p.clone(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Json { path: p, source })
    }

    /// Remove an artifact if it exists. Idempotent.
    pub fn remove(&self, rel: impl AsRef<Path>) -> Result<(), StoreError> {
        let p = self.path(rel)?;
        match std::fs::remove_file(&p) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path: p, source }),
        }
    }

    /// Append a single line to an artifact (used for JSONL logs).
    ///
    /// Appends are not atomic, but every caller appends whole lines from a
    /// single writer per file.
    pub fn append_line(&self, rel: impl AsRef<Path>, line: &str) -> Result<(), StoreError> {
        let p = self.path(rel)?;
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&p)
            .map_err(|source| StoreError::Io {
                path: p.clone(),
                source,
            })?;
        writeln!(f, "{}", line.trim_end()).map_err(|source| StoreError::Io { path: p, source })
    }
}

/// Canonicalize a path, creating it first if it does not exist yet.
fn canonicalize_existing(path: &Path) -> std::io::Result<PathBuf> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    path.canonicalize()
}

/// Resolve symlinks on the deepest existing ancestor of `path`, then re-join
/// the not-yet-existing tail.
fn resolve_through_existing(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut resolved = existing.canonicalize()?;
    for part in tail.iter().rev() {
        resolved.push(part);
    }
    Ok(resolved)
}
