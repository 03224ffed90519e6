use std::collections::HashMap;
use std::time::Duration;

use pt::flow::{LastSyncState, RelationMessageMapping, TableSchema, TableSchemaDelta};
use serde::{Deserialize, Serialize};

use crate::records::Record;

#[derive(Debug, Clone)]
pub struct PullRecordsRequest {
    pub flow_job_name: String,
    pub last_sync_state: Option<LastSyncState>,
    pub max_batch_size: u32,
    /// The pull returns early once this much time passes without a new
    /// record, even if the batch is not full.
    pub idle_timeout: Duration,
    pub src_table_id_name_mapping: HashMap<u32, String>,
    pub table_name_mapping: HashMap<String, String>,
    pub table_name_schema_mapping: HashMap<String, TableSchema>,
    pub relation_message_mapping: RelationMessageMapping,
}

/// One pulled CDC batch. Restart-unsafe: records are consumed once.
#[derive(Debug, Default)]
pub struct RecordBatch {
    pub records: Vec<Record>,
    pub first_checkpoint_id: i64,
    pub last_checkpoint_id: i64,
    pub table_schema_deltas: Vec<TableSchemaDelta>,
    pub relation_message_mapping: RelationMessageMapping,
}

impl RecordBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[derive(Debug)]
pub struct SyncRecordsRequest {
    pub flow_job_name: String,
    pub records: RecordBatch,
    pub staging_path: Option<String>,
    /// Transform script source (already resolved from the catalog); queue
    /// sinks route every record through it.
    pub script: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub first_synced_checkpoint_id: i64,
    pub last_synced_checkpoint_id: i64,
    pub num_records_synced: u64,
    pub current_sync_batch_id: i64,
    #[serde(default)]
    pub table_schema_deltas: Vec<TableSchemaDelta>,
    #[serde(default)]
    pub relation_message_mapping: RelationMessageMapping,
}

#[derive(Debug, Clone)]
pub struct NormalizeRecordsRequest {
    pub flow_job_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeResponse {
    pub done: bool,
    pub start_batch_id: i64,
    pub end_batch_id: i64,
}

#[derive(Debug, Clone)]
pub struct CreateRawTableInput {
    pub flow_job_name: String,
    pub table_name_mapping: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct EnsurePullabilityInput {
    pub flow_job_name: String,
    pub source_table_identifiers: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EnsurePullabilityOutput {
    /// Source relation id to qualified table name.
    pub table_identifier_mapping: HashMap<u32, String>,
}

#[derive(Debug, Clone)]
pub struct SetupReplicationInput {
    pub flow_job_name: String,
    pub table_name_mapping: HashMap<String, String>,
    pub do_initial_copy: bool,
    pub publication_name: Option<String>,
    pub replication_slot_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SetupReplicationOutput {
    pub slot_name: String,
    pub snapshot_name: String,
}

#[derive(Debug, Clone)]
pub struct SetupNormalizedTableOutput {
    pub table_identifier: String,
    pub already_exists: bool,
}
