//! Append-only JSONL event log for a run.
//!
//! Purely observational: emit failures are logged and swallowed so the
//! event log can never fail a session.

use std::path::PathBuf;

use serde_json::json;

/// Writer for `events.jsonl` under the run directory.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append one event line. `fields` is merged into the event object.
    pub fn emit(&self, stage: &str, action: &str, fields: serde_json::Value) {
        let mut event = json!({
            "ts": chrono::Utc::now().to_rfc3339(),
            "stage": stage,
            "action": action,
        });
        if let (Some(obj), Some(extra)) = (event.as_object_mut(), fields.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        let line = event.to_string();
        if let Err(e) = self.append(&line) {
            tracing::warn!(error = %e, "failed to append event (best-effort)");
        }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        use std::io::Write;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(f, "{line}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_parseable_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.jsonl"));
        log.emit("iterate", "provider_call", json!({"track": "A", "iter": 1}));
        log.emit("judge", "run", json!({}));

        let text = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["stage"], "iterate");
        assert_eq!(lines[0]["track"], "A");
        assert_eq!(lines[1]["stage"], "judge");
    }
}
