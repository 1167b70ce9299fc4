//! Context builder: a read-only scan of the working tree.
//!
//! Produces `CONTEXT.md` (issue text plus a bounded file inventory) and
//! `FILES.json`. The scan never mutates the repository and skips VCS and
//! build directories.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::store::ArtifactStore;

const SKIP_DIRS: &[&str] = &[".git", ".dbg", "target", "node_modules", ".venv", "__pycache__"];

pub const DEFAULT_MAX_FILES: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesIndex {
    pub schema_version: u32,
    pub total_files: usize,
    pub files: Vec<FileEntry>,
}

/// Scan the repository and persist `CONTEXT.md` + `FILES.json`.
pub fn build_context(
    store: &ArtifactStore,
    repo: &Path,
    issue_text: &str,
    max_files: usize,
) -> Result<FilesIndex> {
    let mut files = Vec::new();
    collect(repo, repo, &mut files)
        .with_context(|| format!("scan repository {}", repo.display()))?;
    files.sort_by(|a, b| a.path.cmp(&b.path));

    let total_files = files.len();
    files.truncate(max_files);
    let index = FilesIndex {
        schema_version: 1,
        total_files,
        files,
    };
    store.write_json("FILES.json", &index)?;

    let mut md = String::from("# CONTEXT\n\n## Issue\n\n");
    if issue_text.is_empty() {
        md.push_str("(no issue text)\n");
    } else {
        md.push_str(issue_text);
        md.push('\n');
    }
    md.push_str(&format!(
        "\n## Repository\n\n- root: `{}`\n- files: {} ({} listed)\n\n## Files\n\n",
        repo.display(),
        index.total_files,
        index.files.len()
    ));
    for f in &index.files {
        md.push_str(&format!("- `{}` ({} bytes)\n", f.path, f.size));
    }
    store.write_text("CONTEXT.md", &md)?;
    Ok(index)
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<FileEntry>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if path.is_dir() {
            if SKIP_DIRS.contains(&name.as_ref()) {
                continue;
            }
            collect(root, &path, out)?;
        } else if path.is_file() {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let rel: PathBuf = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            out.push(FileEntry {
                path: rel.to_string_lossy().into_owned(),
                size,
            });
        }
    }
    Ok(())
}
