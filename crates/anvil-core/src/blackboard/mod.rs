//! Cross-track observation blackboard.
//!
//! The only deliberately shared artifact. Between iterations the driver
//! rebuilds it from the highest-numbered valid iteration envelope of each
//! track and persists both a structured and a human-readable form. Writes
//! go through the store's whole-file atomic rename, so readers always see a
//! fully-formed previous snapshot; last-writer-wins is acceptable by
//! contract.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::schema::{validate_iteration, StatusSignal};
use crate::store::{ArtifactStore, StoreError};

/// Latest observation state for one track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackObservations {
    pub iteration: u32,
    pub status_signal: StatusSignal,
    pub observations: Vec<String>,
}

/// Aggregated snapshot across tracks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlackboardSnapshot {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    /// Keyed by track name; BTreeMap keeps the output deterministic.
    pub tracks: BTreeMap<String, TrackObservations>,
    /// Flat merged view of every track's observations.
    pub merged: Vec<String>,
}

fn schema_version() -> u32 {
    1
}

/// Build the snapshot from persisted iteration artifacts.
///
/// Tracks with no valid envelope yet are skipped (best-effort by contract).
pub fn build(store: &ArtifactStore, tracks: &[String]) -> BlackboardSnapshot {
    let mut snapshot = BlackboardSnapshot {
        schema_version: 1,
        ..Default::default()
    };
    for track in tracks {
        let Some((iteration, envelope)) = latest_valid_envelope(store, track) else {
            continue;
        };
        snapshot
            .merged
            .extend(envelope.observations.iter().cloned());
        snapshot.tracks.insert(
            track.clone(),
            TrackObservations {
                iteration,
                status_signal: envelope.status_signal,
                observations: envelope.observations,
            },
        );
    }
    snapshot
}

/// Persist `BLACKBOARD.json` and `BLACKBOARD.md`.
pub fn write(store: &ArtifactStore, tracks: &[String]) -> Result<BlackboardSnapshot, StoreError> {
    let snapshot = build(store, tracks);
    store.write_json("BLACKBOARD.json", &snapshot)?;
    store.write_text("BLACKBOARD.md", &render_markdown(&snapshot))?;
    Ok(snapshot)
}

fn render_markdown(snapshot: &BlackboardSnapshot) -> String {
    let mut md = String::from("# BLACKBOARD (observations-only)\n\n");
    for (track, obs) in &snapshot.tracks {
        md.push_str(&format!(
            "## {track}\n- iteration: {}\n- status: {:?}\n",
            obs.iteration, obs.status_signal
        ));
        for line in &obs.observations {
            md.push_str(&format!("- {line}\n"));
        }
        md.push('\n');
    }
    md
}

/// Highest-numbered iteration of a track whose envelope validates.
fn latest_valid_envelope(
    store: &ArtifactStore,
    track: &str,
) -> Option<(u32, crate::schema::IterationEnvelope)> {
    let mut iters = iteration_numbers(store, track);
    iters.sort_unstable_by(|a, b| b.cmp(a));
    for iter in iters {
        let rel = format!("tracks/{track}/iter_{iter:02}/ITERATION.json");
        let Ok(text) = store.read_to_string(&rel) else {
            continue;
        };
        if let Ok(envelope) = validate_iteration(&text) {
            return Some((iter, envelope));
        }
    }
    None
}

/// Iteration numbers present on disk for a track.
pub fn iteration_numbers(store: &ArtifactStore, track: &str) -> Vec<u32> {
    let Ok(track_dir) = store.path(format!("tracks/{track}")) else {
        return Vec::new();
    };
    let Ok(entries) = std::fs::read_dir(&track_dir) else {
        return Vec::new();
    };
    let mut nums: Vec<u32> = entries
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter_map(|name| name.strip_prefix("iter_").and_then(|n| n.parse().ok()))
        .collect();
    nums.sort_unstable();
    nums
}
