//! Deterministic winner selection from artifacts alone.
//!
//! The judge never talks to an agent and never re-runs anything: it reads
//! the per-track artifacts (latest envelope, patches, verification
//! records), computes a score with fixed weights, and picks the unique
//! winner among strictly positive scores. Disqualified tracks score 0 and
//! cannot win.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::blackboard::iteration_numbers;
use crate::config::Role;
use crate::schema::{validate_iteration, IterationEnvelope, ProvisionRecord};
use crate::store::ArtifactStore;
use crate::track::TrackOutcome;

/// Per-track scorecard entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub score: f64,
    pub disqualified: Option<String>,
    pub verified: bool,
    pub has_patch: bool,
    pub role: Role,
    /// Human-readable breakdown, one line per scoring rule applied.
    pub details: Vec<String>,
}

/// The judge's persisted decision (`SCORECARD.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeDecision {
    pub schema_version: u32,
    pub winner: Option<String>,
    pub tracks: BTreeMap<String, ScoreEntry>,
}

/// Score all tracks, pick a winner, and persist `SCORECARD.json` and
/// `DECISION.md`.
pub fn run(store: &ArtifactStore, outcomes: &[TrackOutcome]) -> Result<JudgeDecision> {
    let mut tracks = BTreeMap::new();
    for outcome in outcomes {
        tracks.insert(outcome.name.clone(), score_track(store, outcome));
    }

    let winner = pick_winner(store, &tracks);
    let decision = JudgeDecision {
        schema_version: 1,
        winner,
        tracks,
    };

    store.write_json("SCORECARD.json", &decision)?;
    store.write_text("DECISION.md", &render_decision(&decision))?;
    Ok(decision)
}

fn score_track(store: &ArtifactStore, outcome: &TrackOutcome) -> ScoreEntry {
    if let Some(reason) = outcome.disqualified {
        return ScoreEntry {
            score: 0.0,
            disqualified: Some(reason.to_string()),
            verified: false,
            has_patch: outcome.has_patch,
            role: outcome.role,
            details: vec![format!("disqualified: {reason} (ineligible)")],
        };
    }

    let name = &outcome.name;
    let mut score = 0.0;
    let mut details = Vec::new();

    let confidence = latest_valid_envelope(store, name)
        .map(|(_, env)| env.confidence.clamp(0.0, 1.0))
        .unwrap_or(0.0);
    score += 100.0 * confidence;
    details.push(format!("confidence {confidence:.2} (+{:.1})", 100.0 * confidence));

    let has_patch = any_patch(store, name);
    if has_patch {
        score += 10.0;
        details.push("patch present (+10)".to_string());
    } else {
        let penalty = match outcome.role {
            Role::Fixer | Role::Debugger => 50.0,
            Role::Breaker | Role::Experimental => 10.0,
        };
        score -= penalty;
        details.push(format!("no patch (-{penalty:.0}, {} role)", outcome.role.as_str()));
    }

    let mut verified = false;
    if let Some((verify_iter, first_token)) = latest_verify(store, name) {
        let latest_iter = iteration_numbers(store, name).into_iter().max();
        match first_token.as_str() {
            "PASS" => {
                score += 40.0;
                details.push(format!("verification PASS at iter {verify_iter} (+40)"));
                verified = Some(verify_iter) == latest_iter;
            }
            "FAIL" => {
                score -= 100.0;
                details.push(format!("verification FAIL at iter {verify_iter} (-100)"));
            }
            other => {
                details.push(format!("verification artifact unreadable ({other:?})"));
            }
        }
    }

    ScoreEntry {
        score,
        disqualified: None,
        verified,
        has_patch,
        role: outcome.role,
        details,
    }
}

/// Unique argmax over strictly positive scores. Ties break by verified
/// first, then earliest provision timestamp, then lexicographic name.
fn pick_winner(store: &ArtifactStore, tracks: &BTreeMap<String, ScoreEntry>) -> Option<String> {
    let mut candidates: Vec<(&String, &ScoreEntry)> = tracks
        .iter()
        .filter(|(_, entry)| entry.disqualified.is_none() && entry.score > 0.0)
        .collect();

    candidates.sort_by(|(name_a, a), (name_b, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.verified.cmp(&a.verified))
            .then_with(|| {
                provisioned_at(store, name_a)
                    .cmp(&provisioned_at(store, name_b))
            })
            .then_with(|| name_a.cmp(name_b))
    });

    candidates.first().map(|(name, _)| (*name).clone())
}

fn provisioned_at(store: &ArtifactStore, track: &str) -> chrono::DateTime<chrono::Utc> {
    store
        .read_json::<ProvisionRecord>(format!("tracks/{track}/PROVISION.json"))
        .map(|r| r.provisioned_at)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}

/// Highest-numbered iteration with a validating envelope.
pub fn latest_valid_envelope(
    store: &ArtifactStore,
    track: &str,
) -> Option<(u32, IterationEnvelope)> {
    let mut iters = iteration_numbers(store, track);
    iters.sort_unstable_by(|a, b| b.cmp(a));
    for iter in iters {
        let rel = format!("tracks/{track}/iter_{iter:02}/ITERATION.json");
        if let Ok(text) = store.read_to_string(&rel) {
            if let Ok(env) = validate_iteration(&text) {
                return Some((iter, env));
            }
        }
    }
    None
}

fn any_patch(store: &ArtifactStore, track: &str) -> bool {
    iteration_numbers(store, track)
        .into_iter()
        .any(|i| store.exists(format!("tracks/{track}/iter_{i:02}/PATCH.diff")))
}

/// First token of the most recent per-iteration `VERIFY.md`.
fn latest_verify(store: &ArtifactStore, track: &str) -> Option<(u32, String)> {
    let mut iters = iteration_numbers(store, track);
    iters.sort_unstable_by(|a, b| b.cmp(a));
    for iter in iters {
        let rel = format!("tracks/{track}/iter_{iter:02}/VERIFY.md");
        if let Ok(text) = store.read_to_string(&rel) {
            let token = text.split_whitespace().next().unwrap_or("").to_string();
            return Some((iter, token));
        }
    }
    None
}

fn render_decision(decision: &JudgeDecision) -> String {
    let mut md = String::from("# DECISION\n\n");
    md.push_str(&format!(
        "Winner: **{}**\n\n## Scores\n\n",
        decision.winner.as_deref().unwrap_or("NONE")
    ));
    for (name, entry) in &decision.tracks {
        md.push_str(&format!("- {name}: {:.1}\n", entry.score));
        for line in &entry.details {
            md.push_str(&format!("  - {line}\n"));
        }
    }
    let disqualified: Vec<&str> = decision
        .tracks
        .iter()
        .filter_map(|(name, e)| e.disqualified.as_ref().map(|_| name.as_str()))
        .collect();
    if !disqualified.is_empty() {
        md.push_str(&format!("\n## Disqualified\n\n{}\n", disqualified.join(", ")));
    }
    if decision.winner.is_none() {
        md.push_str("\nNo winner: no track achieved a strictly positive score.\n");
    }
    md
}
