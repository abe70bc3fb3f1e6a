//! Task partitioning: a pure, deterministic split of one task object into
//! per-agent partition descriptors.

use serde::Serialize;
use serde_json::Value;

use crate::error::{MusterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStrategy {
    RoundRobin,
    Hash,
}

impl PartitionStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "round-robin" | "round_robin" => Some(Self::RoundRobin),
            "hash" => Some(Self::Hash),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Partition {
    pub partition_id: String,
    pub agent_index: usize,
    pub task: Value,
}

/// FNV-1a, hand-rolled so assignment stays stable across builds and
/// platforms.
fn fnv1a(data: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in data.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn partition_key(task: &Value) -> Option<&str> {
    task.get("partition_key")
        .or_else(|| task.get("partitionKey"))
        .and_then(Value::as_str)
}

/// Split `task` into `agents` partitions. Each descriptor carries the task
/// annotated with its `partitionIndex` and `totalPartitions`. The hash
/// strategy rotates assignments by the task's partition key and falls back
/// to round-robin when no key is present.
pub fn partition_task(
    task: &Value,
    agents: usize,
    strategy: PartitionStrategy,
) -> Result<Vec<Partition>> {
    if agents == 0 {
        return Err(MusterError::Validation(
            "partitioning requires at least one agent".into(),
        ));
    }
    let Some(base) = task.as_object() else {
        return Err(MusterError::Validation(
            "task must be a JSON object".into(),
        ));
    };

    let offset = match strategy {
        PartitionStrategy::RoundRobin => 0,
        PartitionStrategy::Hash => partition_key(task)
            .map(|key| (fnv1a(key) % agents as u64) as usize)
            .unwrap_or(0),
    };

    let partitions = (0..agents)
        .map(|i| {
            let mut annotated = base.clone();
            annotated.insert("partitionIndex".into(), Value::from(i));
            annotated.insert("totalPartitions".into(), Value::from(agents));
            Partition {
                partition_id: format!("part-{i}"),
                agent_index: (offset + i) % agents,
                task: Value::Object(annotated),
            }
        })
        .collect();

    Ok(partitions)
}
