//! Core score model and new-agent diff computation for scorewatch.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "scorewatch-core";

/// Wall-clock format used for diff log timestamps.
pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Latest known agent scores, keyed by agent id.
pub type Snapshot = BTreeMap<String, i64>;

/// Persisted row shape of a snapshot (`{"agent_id": ..., "score": ...}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub agent_id: String,
    pub score: i64,
}

pub fn snapshot_to_records(snapshot: &Snapshot) -> Vec<SnapshotRecord> {
    snapshot
        .iter()
        .map(|(agent_id, score)| SnapshotRecord {
            agent_id: agent_id.clone(),
            score: *score,
        })
        .collect()
}

pub fn snapshot_from_records(records: Vec<SnapshotRecord>) -> Snapshot {
    records
        .into_iter()
        .map(|record| (record.agent_id, record.score))
        .collect()
}

/// One point of the total-diff time series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLogEntry {
    pub timestamp: String,
    pub total_diff: i64,
}

impl DiffLogEntry {
    pub fn new(timestamp: impl Into<String>, total_diff: i64) -> Self {
        Self {
            timestamp: timestamp.into(),
            total_diff,
        }
    }

    pub fn stamped(at: NaiveDateTime, total_diff: i64) -> Self {
        Self::new(at.format(LOG_TIMESTAMP_FORMAT).to_string(), total_diff)
    }
}

/// A validated upstream element.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentScore {
    pub agent_id: String,
    pub final_score: f64,
}

/// Standard rounding: exact `.5` ties go away from zero, never to even.
pub fn round_half_up(value: f64) -> i64 {
    value.round() as i64
}

/// Scales a 0-100 float score to the integer form stored in snapshots.
pub fn normalize_score(final_score: f64) -> i64 {
    round_half_up(final_score * 100.0)
}

/// Extracts usable agent scores from the upstream array, dropping elements
/// that are not objects or lack `agent_id` / `final_score`.
pub fn parse_agent_scores(items: &[JsonValue]) -> Vec<AgentScore> {
    items.iter().filter_map(agent_score_from_value).collect()
}

fn agent_score_from_value(item: &JsonValue) -> Option<AgentScore> {
    let object = item.as_object()?;
    let agent_id = object.get("agent_id")?.as_str()?.to_string();
    let final_score = match object.get("final_score")? {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !final_score.is_finite() {
        return None;
    }
    Some(AgentScore {
        agent_id,
        final_score,
    })
}

/// Result of diffing one fetch against the previous snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CycleOutcome {
    pub snapshot: Snapshot,
    pub total_diff: i64,
    /// One entry per contributing element, in response order.
    pub new_agents: Vec<String>,
}

/// Builds the replacement snapshot and sums `score - threshold` over every
/// element whose agent id is absent from `previous`.
///
/// Duplicate ids overwrite earlier ones in the snapshot. A duplicated id that
/// is new contributes once per occurrence, since membership is always checked
/// against `previous`, not against the snapshot under construction.
pub fn diff_new_agents(previous: &Snapshot, scores: &[AgentScore], threshold: i64) -> CycleOutcome {
    let mut outcome = CycleOutcome::default();
    for score in scores {
        let int_score = normalize_score(score.final_score);
        outcome.snapshot.insert(score.agent_id.clone(), int_score);

        if !previous.contains_key(&score.agent_id) {
            outcome.total_diff = outcome
                .total_diff
                .saturating_add(int_score.saturating_sub(threshold));
            outcome.new_agents.push(score.agent_id.clone());
        }
    }
    outcome
}
