use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::peers::Peer;

/// Partition id used as `last` on the first planning call.
pub const NOT_APPLICABLE_PARTITION: &str = "not-applicable-partition";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QRepWriteType {
    Append,
    Upsert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QRepWriteMode {
    pub write_type: QRepWriteType,
    #[serde(default)]
    pub upsert_key_columns: Vec<String>,
}

/// Partition ranges are inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PartitionRange {
    Int { start: i64, end: i64 },
    Timestamp { start: DateTime<Utc>, end: DateTime<Utc> },
}

impl PartitionRange {
    /// Total order over range starts; the planner emits partitions in this
    /// order and the workflow dispatches them in it.
    pub fn start_sort_key(&self) -> (i64, i64) {
        match self {
            PartitionRange::Int { start, .. } => (0, *start),
            PartitionRange::Timestamp { start, .. } => (1, start.timestamp_micros()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QRepPartition {
    pub partition_id: String,
    pub range: Option<PartitionRange>,
    #[serde(default)]
    pub full_table_partition: bool,
}

impl QRepPartition {
    pub fn not_applicable() -> Self {
        Self {
            partition_id: NOT_APPLICABLE_PARTITION.to_string(),
            range: None,
            full_table_partition: false,
        }
    }

    pub fn full_table(partition_id: String) -> Self {
        Self {
            partition_id,
            range: None,
            full_table_partition: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QRepConfig {
    pub flow_job_name: String,
    pub source_peer: Peer,
    pub destination_peer: Peer,
    pub destination_table_identifier: String,
    /// Extraction query; `{{.start}}` and `{{.end}}` are substituted with
    /// the partition range bounds.
    pub query: String,
    pub watermark_table: String,
    pub watermark_column: String,
    #[serde(default)]
    pub initial_copy_only: bool,
    #[serde(default)]
    pub num_rows_per_partition: u32,
    #[serde(default)]
    pub max_parallel_workers: u32,
    #[serde(default)]
    pub wait_between_batches_seconds: u32,
    #[serde(default)]
    pub write_mode: Option<QRepWriteMode>,
    /// Staging location for Avro files; local directory when no scheme.
    #[serde(default)]
    pub staging_path: Option<String>,
    /// Consistent snapshot to export from, when planned by a snapshot flow.
    #[serde(default)]
    pub snapshot_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_order_by_range_start() {
        let mut parts = vec![
            QRepPartition {
                partition_id: "b".into(),
                range: Some(PartitionRange::Int { start: 100, end: 199 }),
                full_table_partition: false,
            },
            QRepPartition {
                partition_id: "a".into(),
                range: Some(PartitionRange::Int { start: 0, end: 99 }),
                full_table_partition: false,
            },
        ];
        parts.sort_by_key(|p| p.range.as_ref().map(|r| r.start_sort_key()));
        assert_eq!(parts[0].partition_id, "a");
        assert_eq!(parts[1].partition_id, "b");
    }

    #[test]
    fn not_applicable_partition_uses_sentinel_id() {
        let p = QRepPartition::not_applicable();
        assert_eq!(p.partition_id, NOT_APPLICABLE_PARTITION);
        assert!(p.range.is_none());
    }
}
