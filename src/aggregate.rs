//! Per-peer connection counting and ranking

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::classifier::is_abnormal;
use crate::models::{ConnectionRecord, CountItem};

/// Which connections are counted towards a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMode {
    /// Every non-listening connection
    #[default]
    Normal,
    /// Only connections the classifier marks abnormal
    Abnormal,
}

impl std::fmt::Display for AggregationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregationMode::Normal => write!(f, "normal"),
            AggregationMode::Abnormal => write!(f, "abnormal"),
        }
    }
}

/// Count connections per remote IP.
///
/// An empty `ports` slice counts connections on every local port; otherwise a
/// connection counts only when its local port is one of `ports`.
pub fn count_peers(
    records: &[ConnectionRecord],
    ports: &[u16],
    mode: AggregationMode,
) -> HashMap<String, usize> {
    let mut counts = HashMap::new();

    for record in records {
        let eligible = match mode {
            AggregationMode::Normal => !record.is_listening(),
            AggregationMode::Abnormal => is_abnormal(record),
        };
        if !eligible {
            continue;
        }
        if !ports.is_empty() && !ports.contains(&record.local.port) {
            continue;
        }

        *counts.entry(record.peer()).or_insert(0) += 1;
    }

    counts
}

/// Sort peers by connection count, highest first. Equal counts are ordered by
/// peer key so the output is reproducible.
pub fn rank(counts: HashMap<String, usize>) -> Vec<CountItem> {
    let mut items: Vec<CountItem> = counts
        .into_iter()
        .map(|(key, n)| CountItem { key, n })
        .collect();
    items.sort_by(compare_items);
    items
}

fn compare_items(a: &CountItem, b: &CountItem) -> Ordering {
    b.n.cmp(&a.n).then_with(|| a.key.cmp(&b.key))
}

/// Count and rank in one step
pub fn top(records: &[ConnectionRecord], ports: &[u16], mode: AggregationMode) -> Vec<CountItem> {
    rank(count_peers(records, ports, mode))
}

/// Total connections across a ranked list
pub fn total_connections(items: &[CountItem]) -> usize {
    items.iter().map(|item| item.n).sum()
}
