//! # Task Kernels
//!
//! The fixed catalog of computations the scheduler can run. Every kernel is a
//! pure function from a JSON payload to a JSON result, so running it on a
//! background worker or on the calling task gives the same answer.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ResourceError, ResourceResult};

/// Task kinds accepted by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Level and progress from a total XP amount.
    XpCalculation,
    /// Sort and rank leaderboard entries.
    LeaderboardRanking,
    /// Filter/map/sort/reduce pipeline over a collection.
    CollectionTransform,
}

impl TaskKind {
    /// Every kind, in catalog order.
    pub const ALL: [TaskKind; 3] = [
        TaskKind::XpCalculation,
        TaskKind::LeaderboardRanking,
        TaskKind::CollectionTransform,
    ];

    /// Looks a kind up by its wire name.
    pub fn parse(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|candidate| candidate.as_str() == kind)
    }

    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::XpCalculation => "xp-calculation",
            TaskKind::LeaderboardRanking => "leaderboard-ranking",
            TaskKind::CollectionTransform => "collection-transform",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs the kernel for `kind` on `payload`.
pub fn run(kind: TaskKind, payload: &Value) -> ResourceResult<Value> {
    match kind {
        TaskKind::XpCalculation => xp_calculation(decode(kind, payload)?),
        TaskKind::LeaderboardRanking => leaderboard_ranking(decode(kind, payload)?),
        TaskKind::CollectionTransform => collection_transform(decode(kind, payload)?),
    }
}

fn decode<T: for<'de> Deserialize<'de>>(kind: TaskKind, payload: &Value) -> ResourceResult<T> {
    T::deserialize(payload).map_err(|err| invalid(kind, err.to_string()))
}

fn invalid(kind: TaskKind, message: impl Into<String>) -> ResourceError {
    ResourceError::InvalidPayload {
        kind: kind.to_string(),
        message: message.into(),
    }
}

// --- XP / Level ---

const XP_PER_LEVEL_UNIT: u64 = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct XpInput {
    total_xp: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct XpOutput {
    level: u64,
    total_xp: u64,
    current_level_xp: u64,
    next_level_xp: u64,
    xp_into_level: u64,
    xp_to_next_level: u64,
    progress: f64,
}

/// XP needed to reach `level` (level 1 starts at 0).
fn level_threshold(level: u64) -> u64 {
    let steps = level.saturating_sub(1);
    XP_PER_LEVEL_UNIT.saturating_mul(steps.saturating_mul(steps))
}

fn isqrt(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    // Newton's method on integers; converges from above.
    let mut x = n;
    let mut y = x / 2 + (x & 1);
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    x
}

fn xp_calculation(input: XpInput) -> ResourceResult<Value> {
    let level = isqrt(input.total_xp / XP_PER_LEVEL_UNIT) + 1;
    let current_level_xp = level_threshold(level);
    let next_level_xp = level_threshold(level + 1);
    let span = next_level_xp - current_level_xp;
    let xp_into_level = input.total_xp - current_level_xp;

    let output = XpOutput {
        level,
        total_xp: input.total_xp,
        current_level_xp,
        next_level_xp,
        xp_into_level,
        xp_to_next_level: next_level_xp - input.total_xp,
        progress: xp_into_level as f64 / span as f64,
    };
    serde_json::to_value(output).map_err(|err| invalid(TaskKind::XpCalculation, err.to_string()))
}

// --- Leaderboard ---

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct LeaderboardEntry {
    user_id: String,
    score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    achieved_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaderboardInput {
    entries: Vec<LeaderboardEntry>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RankedEntry {
    rank: usize,
    #[serde(flatten)]
    entry: LeaderboardEntry,
}

fn leaderboard_ranking(mut input: LeaderboardInput) -> ResourceResult<Value> {
    if input.entries.iter().any(|entry| !entry.score.is_finite()) {
        return Err(invalid(TaskKind::LeaderboardRanking, "scores must be finite numbers"));
    }
    // Higher score first; earlier achievement breaks ties, then user id.
    input.entries.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| {
                a.achieved_at
                    .unwrap_or(i64::MAX)
                    .cmp(&b.achieved_at.unwrap_or(i64::MAX))
            })
            .then_with(|| a.user_id.cmp(&b.user_id))
    });

    let total = input.entries.len();
    let mut ranked = Vec::with_capacity(total);
    let mut rank = 0;
    let mut previous_score = None;
    for (position, entry) in input.entries.into_iter().enumerate() {
        // Standard competition ranking: equal scores share a rank (1, 2, 2, 4).
        if previous_score != Some(entry.score) {
            rank = position + 1;
            previous_score = Some(entry.score);
        }
        ranked.push(RankedEntry { rank, entry });
    }
    if let Some(limit) = input.limit {
        ranked.truncate(limit);
    }

    Ok(json!({ "total": total, "entries": ranked }))
}

// --- Collection transform ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Comparison {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Aggregate {
    Sum,
    Count,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum CollectionOp {
    Filter {
        field: String,
        cmp: Comparison,
        value: Value,
    },
    Map {
        fields: Vec<String>,
    },
    Sort {
        field: String,
        #[serde(default)]
        descending: bool,
    },
    Reduce {
        #[serde(default)]
        field: Option<String>,
        agg: Aggregate,
    },
}

#[derive(Debug, Deserialize)]
struct CollectionInput {
    items: Vec<Value>,
    #[serde(default)]
    ops: Vec<CollectionOp>,
}

fn collection_transform(input: CollectionInput) -> ResourceResult<Value> {
    let mut items = input.items;
    let last = input.ops.len().saturating_sub(1);

    for (index, op) in input.ops.into_iter().enumerate() {
        match op {
            CollectionOp::Filter { field, cmp, value } => {
                items.retain(|item| compare_field(item.get(&field), cmp, &value));
            }
            CollectionOp::Map { fields } => {
                items = items
                    .into_iter()
                    .map(|item| {
                        let projected = fields
                            .iter()
                            .filter_map(|field| Some((field.clone(), item.get(field)?.clone())))
                            .collect();
                        Value::Object(projected)
                    })
                    .collect();
            }
            CollectionOp::Sort { field, descending } => {
                items.sort_by(|a, b| {
                    let ordering = order_values(a.get(&field), b.get(&field));
                    if descending {
                        ordering.reverse()
                    } else {
                        ordering
                    }
                });
            }
            CollectionOp::Reduce { field, agg } => {
                if index != last {
                    return Err(invalid(TaskKind::CollectionTransform, "reduce must be the last op"));
                }
                return Ok(json!({ "result": reduce(&items, field.as_deref(), agg) }));
            }
        }
    }

    Ok(json!({ "items": items }))
}

fn compare_field(found: Option<&Value>, cmp: Comparison, expected: &Value) -> bool {
    let Some(found) = found else {
        return cmp == Comparison::Ne;
    };
    match cmp {
        Comparison::Eq => found == expected,
        Comparison::Ne => found != expected,
        Comparison::Gt => order_values(Some(found), Some(expected)) == Ordering::Greater,
        Comparison::Gte => order_values(Some(found), Some(expected)) != Ordering::Less,
        Comparison::Lt => order_values(Some(found), Some(expected)) == Ordering::Less,
        Comparison::Lte => order_values(Some(found), Some(expected)) != Ordering::Greater,
        Comparison::Contains => match (found, expected) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(values), needle) => values.contains(needle),
            _ => false,
        },
    }
}

/// Total order used by `sort` and the relational filters. Missing values sort
/// first, then null, booleans, numbers, strings, and anything else last.
fn order_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn class(value: Option<&Value>) -> u8 {
        match value {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => class(a).cmp(&class(b)),
    }
}

fn reduce(items: &[Value], field: Option<&str>, agg: Aggregate) -> Value {
    let numbers: Vec<f64> = items
        .iter()
        .filter_map(|item| match field {
            Some(field) => item.get(field)?.as_f64(),
            None => item.as_f64(),
        })
        .collect();

    match agg {
        Aggregate::Count => {
            let count = match field {
                Some(field) => items.iter().filter(|item| item.get(field).is_some()).count(),
                None => items.len(),
            };
            json!(count)
        }
        Aggregate::Sum => json!(numbers.iter().sum::<f64>()),
        _ if numbers.is_empty() => Value::Null,
        Aggregate::Avg => json!(numbers.iter().sum::<f64>() / numbers.len() as f64),
        Aggregate::Min => json!(numbers.iter().copied().fold(f64::INFINITY, f64::min)),
        Aggregate::Max => json!(numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_their_wire_names() {
        for kind in TaskKind::ALL {
            assert_eq!(TaskKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TaskKind::parse("video-transcode"), None);
    }

    #[test]
    fn xp_levels_follow_quadratic_thresholds() {
        let at = |xp: u64| run(TaskKind::XpCalculation, &json!({ "totalXp": xp })).unwrap();

        assert_eq!(at(0)["level"], 1);
        assert_eq!(at(99)["level"], 1);
        assert_eq!(at(100)["level"], 2);
        assert_eq!(at(399)["level"], 2);
        assert_eq!(at(400)["level"], 3);

        let mid = at(250);
        assert_eq!(mid["currentLevelXp"], 100);
        assert_eq!(mid["nextLevelXp"], 400);
        assert_eq!(mid["xpIntoLevel"], 150);
        assert_eq!(mid["xpToNextLevel"], 150);
        assert_eq!(mid["progress"], 0.5);
    }

    #[test]
    fn integer_sqrt_is_exact() {
        for n in [0u64, 1, 2, 3, 4, 15, 16, 17, 99, 100, 10_000, u64::MAX] {
            let root = isqrt(n);
            assert!(root.checked_mul(root).is_some_and(|sq| sq <= n));
            assert!((root + 1).checked_mul(root + 1).map_or(true, |sq| sq > n));
        }
    }

    #[test]
    fn xp_rejects_malformed_payload() {
        let err = run(TaskKind::XpCalculation, &json!({ "xp": "lots" })).unwrap_err();
        assert!(matches!(err, ResourceError::InvalidPayload { .. }));
    }

    #[test]
    fn leaderboard_uses_competition_ranking() {
        let payload = json!({
            "entries": [
                { "userId": "c", "score": 80 },
                { "userId": "a", "score": 95, "achievedAt": 20 },
                { "userId": "b", "score": 95, "achievedAt": 10 },
                { "userId": "d", "score": 60 },
            ],
            "limit": 3,
        });
        let out = run(TaskKind::LeaderboardRanking, &payload).unwrap();

        assert_eq!(out["total"], 4);
        let entries = out["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 3);
        let summary: Vec<(String, u64)> = entries
            .iter()
            .map(|e| (e["userId"].as_str().unwrap().to_string(), e["rank"].as_u64().unwrap()))
            .collect();
        assert_eq!(
            summary,
            vec![("b".to_string(), 1), ("a".to_string(), 1), ("c".to_string(), 3)]
        );
    }

    #[test]
    fn collection_pipeline_filters_sorts_and_projects() {
        let payload = json!({
            "items": [
                { "id": 1, "topic": "math", "score": 7 },
                { "id": 2, "topic": "history", "score": 9 },
                { "id": 3, "topic": "math", "score": 4 },
                { "id": 4, "topic": "math" },
            ],
            "ops": [
                { "op": "filter", "field": "topic", "cmp": "eq", "value": "math" },
                { "op": "filter", "field": "score", "cmp": "gte", "value": 4 },
                { "op": "sort", "field": "score", "descending": true },
                { "op": "map", "fields": ["id"] },
            ],
        });
        let out = run(TaskKind::CollectionTransform, &payload).unwrap();
        assert_eq!(out, json!({ "items": [{ "id": 1 }, { "id": 3 }] }));
    }

    #[test]
    fn collection_reduce_aggregates_numeric_fields() {
        let items = json!([{ "v": 2 }, { "v": 4 }, { "v": "x" }, {}]);
        let reduce_with = |agg: &str| {
            run(
                TaskKind::CollectionTransform,
                &json!({ "items": items, "ops": [{ "op": "reduce", "field": "v", "agg": agg }] }),
            )
            .unwrap()["result"]
                .clone()
        };

        assert_eq!(reduce_with("sum"), json!(6.0));
        assert_eq!(reduce_with("avg"), json!(3.0));
        assert_eq!(reduce_with("min"), json!(2.0));
        assert_eq!(reduce_with("max"), json!(4.0));
        assert_eq!(reduce_with("count"), json!(3));
    }

    #[test]
    fn reduce_must_be_last() {
        let payload = json!({
            "items": [1, 2],
            "ops": [{ "op": "reduce", "agg": "sum" }, { "op": "sort", "field": "x" }],
        });
        let err = run(TaskKind::CollectionTransform, &payload).unwrap_err();
        assert!(err.to_string().contains("reduce must be the last op"));
    }
}
