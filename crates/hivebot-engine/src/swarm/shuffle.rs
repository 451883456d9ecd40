//! Shuffle-by-key — re-partitioning map output into keyed reducer inputs.
//!
//! Map workers return free-form text. This module extracts structured items
//! from each batch result, groups them by a configured key field, and splits
//! oversized partitions into bounded sub-partitions. The invocation side
//! (partition reduce, final merge) lives in the engine; everything here is
//! pure and directly testable.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use hivebot_core::config::{MultiKey, ShuffleSpec};

/// Partition for items whose key field is missing or empty.
pub const UNKEYED_PARTITION: &str = "_unkeyed";

/// Default per-partition reducer prompt (duplicate detection).
pub const DEFAULT_REDUCE_PROMPT: &str = "You are reducing one partition of swarm results.\n\
Partition key: {{partition_key}}\n\
Item count: {{item_count}}\n\n\
Identify duplicate and near-duplicate entries among the items below, merge\n\
them, and produce one consolidated summary for this partition.\n\n\
Items:\n{{items}}\n\n\
Original request: {{user_message}}";

/// Default final merge prompt.
pub const DEFAULT_MERGE_PROMPT: &str = "Merge the following {{partition_count}} partition summaries into one final\n\
report. Preserve every distinct finding; collapse repeated ones.\n\n\
{{items}}\n\n\
Original request: {{user_message}}";

// ─────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────

/// One keyed partition of parsed items.
#[derive(Clone, Debug, PartialEq)]
pub struct Partition {
    pub key: String,
    pub items: Vec<Value>,
}

/// Counters produced while grouping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShuffleStats {
    /// Items that landed in more than one partition (`multi_key = duplicate`).
    pub duplicated_items: usize,
    /// Batch results from which no structured item could be parsed.
    pub dropped_results: usize,
}

// ─────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────

/// Extract structured items from one batch result.
///
/// Tried in order: the whole result as JSON (array → its object elements,
/// single object → itself); the first `[ ... ]` substring as an array; then a
/// line scan for `{...}` objects. A result yielding no items is dropped by
/// the caller.
pub fn parse_result_items(result: &str) -> Vec<Value> {
    // (a) whole result
    if let Ok(value) = serde_json::from_str::<Value>(result.trim()) {
        match value {
            Value::Array(elements) => {
                let objects: Vec<Value> =
                    elements.into_iter().filter(|e| e.is_object()).collect();
                if !objects.is_empty() {
                    return objects;
                }
            }
            Value::Object(_) => return vec![value],
            _ => {}
        }
    }

    // (b) first bracketed substring
    if let (Some(start), Some(end)) = (result.find('['), result.rfind(']')) {
        if start < end {
            if let Ok(Value::Array(elements)) =
                serde_json::from_str::<Value>(&result[start..=end])
            {
                let objects: Vec<Value> =
                    elements.into_iter().filter(|e| e.is_object()).collect();
                if !objects.is_empty() {
                    return objects;
                }
            }
        }
    }

    // (c) per-line objects
    result
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .filter_map(|l| serde_json::from_str::<Value>(l).ok())
        .filter(|v| v.is_object())
        .collect()
}

/// Extract normalized key values from one item.
///
/// A scalar yields one key, an array all of its non-empty values; keys are
/// trimmed and lowercased. Missing, null, or empty values yield none.
pub fn extract_keys(item: &Value, key_field: &str) -> Vec<String> {
    let Some(value) = item.get(key_field) else {
        return Vec::new();
    };
    match value {
        Value::Array(elements) => elements.iter().filter_map(normalize_key).collect(),
        other => normalize_key(other).into_iter().collect(),
    }
}

fn normalize_key(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    let key = raw.trim().to_lowercase();
    (!key.is_empty()).then_some(key)
}

// ─────────────────────────────────────────────
// Grouping & sub-splitting
// ─────────────────────────────────────────────

/// Group successful batch results into keyed partitions.
///
/// Partitions come back in lexicographic key order (`_unkeyed` included).
pub fn group(results: &[String], spec: &ShuffleSpec) -> (Vec<Partition>, ShuffleStats) {
    let mut buckets: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let mut stats = ShuffleStats::default();

    for result in results {
        let items = parse_result_items(result);
        if items.is_empty() {
            debug!("batch result carried no structured items, dropped from shuffle");
            stats.dropped_results += 1;
            continue;
        }
        for item in items {
            let keys = extract_keys(&item, &spec.key_field);
            if keys.is_empty() {
                buckets
                    .entry(UNKEYED_PARTITION.to_string())
                    .or_default()
                    .push(item);
                continue;
            }
            match spec.multi_key {
                MultiKey::First => {
                    buckets.entry(keys[0].clone()).or_default().push(item);
                }
                MultiKey::Duplicate => {
                    if keys.len() > 1 {
                        stats.duplicated_items += 1;
                    }
                    let mut seen = Vec::new();
                    for key in keys {
                        if seen.contains(&key) {
                            continue;
                        }
                        seen.push(key.clone());
                        buckets.entry(key).or_default().push(item.clone());
                    }
                }
            }
        }
    }

    let partitions = buckets
        .into_iter()
        .map(|(key, items)| Partition { key, items })
        .collect();
    (partitions, stats)
}

/// Split oversized partitions into `<key>_partN` slices of at most `max`.
///
/// The concatenation of a key's sub-partitions equals the original partition.
pub fn sub_split(partitions: Vec<Partition>, max: usize) -> Vec<Partition> {
    let mut out = Vec::new();
    for partition in partitions {
        if partition.items.len() <= max {
            out.push(partition);
            continue;
        }
        for (i, chunk) in partition.items.chunks(max).enumerate() {
            out.push(Partition {
                key: format!("{}_part{}", partition.key, i + 1),
                items: chunk.to_vec(),
            });
        }
    }
    out
}

/// Render partition items for a reducer prompt, one JSON object per line.
pub fn render_items(items: &[Value]) -> String {
    items
        .iter()
        .map(|v| serde_json::to_string(v).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\n")
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
