use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use value::Kind;

use crate::peers::Peer;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub kind: Kind,
    pub nullable: bool,
}

/// Ordered column list plus primary key, carried from source to sink at
/// setup time and refreshed after every schema delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_identifier: String,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_key_columns: Vec<String>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchemaDelta {
    pub src_table_name: String,
    pub dst_table_name: String,
    pub added_columns: Vec<ColumnDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationColumn {
    pub name: String,
    pub kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationMessage {
    pub relation_id: u32,
    pub relation_name: String,
    pub columns: Vec<RelationColumn>,
}

/// Relation id to latest relation descriptor, carried across workflow
/// iterations. A plain serde map round-trips empty, so no sentinel entry
/// is needed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationMessageMapping(pub HashMap<u32, RelationMessage>);

impl RelationMessageMapping {
    pub fn insert(&mut self, message: RelationMessage) {
        self.0.insert(message.relation_id, message);
    }

    pub fn get(&self, relation_id: u32) -> Option<&RelationMessage> {
        self.0.get(&relation_id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapping {
    pub source_table_identifier: String,
    pub destination_table_identifier: String,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// The replication job definition. Immutable for one workflow run;
/// continue-as-new re-creates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConnectionConfigs {
    pub flow_job_name: String,
    pub source: Peer,
    pub destination: Peer,
    pub table_mappings: Vec<TableMapping>,
    #[serde(default)]
    pub max_batch_size: u32,
    #[serde(default)]
    pub do_initial_copy: bool,
    #[serde(default)]
    pub resync: bool,
    #[serde(default)]
    pub publication_name: Option<String>,
    #[serde(default)]
    pub replication_slot_name: Option<String>,
    #[serde(default)]
    pub snapshot_num_rows_per_partition: u32,
    #[serde(default)]
    pub snapshot_max_parallel_workers: u32,
    #[serde(default)]
    pub snapshot_num_tables_in_parallel: u32,
    #[serde(default)]
    pub snapshot_staging_path: Option<String>,
    /// Name of a transform script in the catalog scripts table.
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub src_table_id_name_mapping: HashMap<u32, String>,
    #[serde(default)]
    pub table_name_schema_mapping: HashMap<String, TableSchema>,
}

impl FlowConnectionConfigs {
    pub fn table_name_mapping(&self) -> HashMap<String, String> {
        self.table_mappings
            .iter()
            .map(|m| {
                (
                    m.source_table_identifier.clone(),
                    m.destination_table_identifier.clone(),
                )
            })
            .collect()
    }

    pub fn destination_for_source(&self, source_table: &str) -> Option<&str> {
        self.table_mappings
            .iter()
            .find(|m| m.source_table_identifier == source_table)
            .map(|m| m.destination_table_identifier.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFlowOptions {
    pub batch_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSyncState {
    pub checkpoint: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameTableOption {
    pub current_name: String,
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameTablesInput {
    pub flow_job_name: String,
    pub peer: Peer,
    pub rename_table_options: Vec<RenameTableOption>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::Peer;

    fn sample_config() -> FlowConnectionConfigs {
        FlowConnectionConfigs {
            flow_job_name: "orders_mirror".to_string(),
            source: Peer::memory("src"),
            destination: Peer::memory("dst"),
            table_mappings: vec![TableMapping {
                source_table_identifier: "public.orders".to_string(),
                destination_table_identifier: "dw.orders".to_string(),
                partition_key: None,
                exclude: Vec::new(),
            }],
            max_batch_size: 1000,
            do_initial_copy: false,
            resync: false,
            publication_name: None,
            replication_slot_name: None,
            snapshot_num_rows_per_partition: 0,
            snapshot_max_parallel_workers: 0,
            snapshot_num_tables_in_parallel: 0,
            snapshot_staging_path: None,
            script: None,
            src_table_id_name_mapping: HashMap::new(),
            table_name_schema_mapping: HashMap::new(),
        }
    }

    #[test]
    fn flow_config_round_trips_through_serde() {
        let cfg = sample_config();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: FlowConnectionConfigs = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn empty_relation_mapping_survives_serialization() {
        let mapping = RelationMessageMapping::default();
        let json = serde_json::to_string(&mapping).unwrap();
        let back: RelationMessageMapping = serde_json::from_str(&json).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn table_name_mapping_projects_mappings() {
        let cfg = sample_config();
        let mapping = cfg.table_name_mapping();
        assert_eq!(
            mapping.get("public.orders").map(String::as_str),
            Some("dw.orders")
        );
        assert_eq!(cfg.destination_for_source("public.orders"), Some("dw.orders"));
        assert_eq!(cfg.destination_for_source("public.other"), None);
    }
}
