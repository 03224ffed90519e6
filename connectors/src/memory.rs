use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt as _;
use model::records::{Record, RecordItems};
use model::{
    CreateRawTableInput, EnsurePullabilityInput, EnsurePullabilityOutput, NormalizeRecordsRequest,
    NormalizeResponse, PullRecordsRequest, QRecord, QRecordBatch, QRecordSchema, QRecordStream,
    RecordBatch, SetupNormalizedTableOutput, SetupReplicationInput, SyncRecordsRequest,
    SyncResponse,
};
use pt::flow::{ColumnDescriptor, LastSyncState, RelationMessage, RenameTablesInput, TableSchema, TableSchemaDelta};
use pt::qrep::{PartitionRange, QRepConfig, QRepPartition};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use value::Value;

use crate::postgres::plan_int_partitions;
use crate::{Connector, ConnectorError, ConnectorResult, SlotCreated, SlotSignalWorker};

/// One staged CDC event, mirroring the raw-table layout.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub uid: Uuid,
    pub timestamp_ms: i64,
    pub checkpoint_id: i64,
    pub destination_table: String,
    pub data: serde_json::Value,
    pub record_type: i16,
    pub match_data: Option<serde_json::Value>,
    pub batch_id: i64,
    pub unchanged_toast_columns: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub schema: Option<TableSchema>,
    /// Rows keyed by the JSON encoding of their primary key values.
    pub rows: BTreeMap<String, RecordItems>,
}

#[derive(Debug, Clone)]
pub struct QRepMetadataRow {
    pub partition: QRepPartition,
    pub sync_start_time: DateTime<Utc>,
    pub sync_finish_time: DateTime<Utc>,
    pub rows_in_partition: u64,
}

#[derive(Default)]
struct FlowMetadata {
    last_offset: i64,
    sync_batch_id: i64,
    normalize_batch_id: i64,
}

/// Backing state for one memory peer name. Shared by every connector
/// handle so source activities, sink activities and tests observe the
/// same data.
#[derive(Default)]
pub struct MemoryStore {
    /// Append-only CDC feed, the stand-in for a replication slot: pulls
    /// read past the sink's checkpoint, so a failed sync re-reads the
    /// same range.
    feed: Mutex<Vec<Record>>,
    tables: Mutex<HashMap<String, MemoryTable>>,
    raw: Mutex<Vec<RawEvent>>,
    metadata: Mutex<HashMap<String, FlowMetadata>>,
    qrep_metadata: Mutex<HashMap<(String, String), QRepMetadataRow>>,
    relation_ids: Mutex<HashMap<String, u32>>,
    metadata_tables_created: AtomicBool,
    /// Fault injection: the next sync_records call fails without staging
    /// anything or moving the checkpoint.
    pub fail_next_sync: AtomicBool,
}

impl MemoryStore {
    /// Global registry, keyed by peer name.
    pub fn for_peer(peer_name: &str) -> Arc<MemoryStore> {
        static STORES: OnceLock<DashMap<String, Arc<MemoryStore>>> = OnceLock::new();
        STORES
            .get_or_init(DashMap::new)
            .entry(peer_name.to_string())
            .or_default()
            .clone()
    }

    /// Feeds CDC records for the next pulls (test/source side).
    pub async fn push_records(&self, records: impl IntoIterator<Item = Record>) {
        self.feed.lock().await.extend(records);
    }

    /// Seeds a table with schema and rows (source side for QRep, or a
    /// pre-existing destination).
    pub async fn seed_table(
        &self,
        table_identifier: &str,
        schema: TableSchema,
        rows: Vec<RecordItems>,
    ) {
        let mut tables = self.tables.lock().await;
        let table = tables.entry(table_identifier.to_string()).or_default();
        let pk_columns = schema.primary_key_columns.clone();
        table.schema = Some(schema);
        for items in rows {
            let key = pk_key_of(&pk_columns, &items);
            table.rows.insert(key, items);
        }
    }

    pub async fn table_rows(&self, table_identifier: &str) -> Vec<RecordItems> {
        self.tables
            .lock()
            .await
            .get(table_identifier)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn table_schema(&self, table_identifier: &str) -> Option<TableSchema> {
        self.tables
            .lock()
            .await
            .get(table_identifier)
            .and_then(|t| t.schema.clone())
    }

    pub async fn table_exists(&self, table_identifier: &str) -> bool {
        self.tables.lock().await.contains_key(table_identifier)
    }

    pub async fn raw_events(&self) -> Vec<RawEvent> {
        self.raw.lock().await.clone()
    }

    pub async fn qrep_partition_count(&self, flow_job_name: &str) -> usize {
        self.qrep_metadata
            .lock()
            .await
            .keys()
            .filter(|(flow, _)| flow == flow_job_name)
            .count()
    }

    pub async fn stored_offset(&self, flow_job_name: &str) -> Option<i64> {
        self.metadata
            .lock()
            .await
            .get(flow_job_name)
            .map(|m| m.last_offset)
    }
}

fn pk_key_of(pk_columns: &[String], items: &RecordItems) -> String {
    let keys: Vec<serde_json::Value> = pk_columns
        .iter()
        .map(|c| {
            items
                .get(c)
                .map(Value::to_serde_json_value)
                .unwrap_or(serde_json::Value::Null)
        })
        .collect();
    serde_json::Value::Array(keys).to_string()
}

fn items_from_json(
    schema: &TableSchema,
    data: &serde_json::Value,
) -> anyhow::Result<RecordItems> {
    schema
        .columns
        .iter()
        .map(|col| {
            let raw = data.get(&col.name).unwrap_or(&serde_json::Value::Null);
            Ok((col.name.clone(), Value::from_serde_json_value(&col.kind, raw)?))
        })
        .collect()
}

/// Hermetic peer holding everything in process. Implements the full
/// connector contract for both flow directions.
pub struct MemoryConnector {
    peer_name: String,
    store: Arc<MemoryStore>,
    token: CancellationToken,
    table_schema_mapping: Mutex<HashMap<String, TableSchema>>,
}

impl MemoryConnector {
    pub fn new(token: CancellationToken, peer_name: &str) -> Self {
        Self {
            peer_name: peer_name.to_string(),
            store: MemoryStore::for_peer(peer_name),
            token,
            table_schema_mapping: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn peer_name(&self) -> &str {
        &self.peer_name
    }

    async fn connection_active(&self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn needs_setup_metadata_tables(&self) -> ConnectorResult<bool> {
        Ok(!self.store.metadata_tables_created.load(Ordering::SeqCst))
    }

    async fn setup_metadata_tables(&self) -> ConnectorResult<()> {
        self.store
            .metadata_tables_created
            .store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get_last_offset(&self, flow_job_name: &str) -> ConnectorResult<Option<LastSyncState>> {
        let metadata = self.store.metadata.lock().await;
        Ok(metadata.get(flow_job_name).map(|m| LastSyncState {
            checkpoint: m.last_offset,
            last_synced_at: Some(Utc::now()),
        }))
    }

    async fn ensure_pullability(
        &self,
        req: &EnsurePullabilityInput,
    ) -> ConnectorResult<EnsurePullabilityOutput> {
        let mut relation_ids = self.store.relation_ids.lock().await;
        let mut mapping = HashMap::new();
        let mut next_id = relation_ids.len() as u32 + 16384;
        for table in &req.source_table_identifiers {
            let id = *relation_ids.entry(table.clone()).or_insert_with(|| {
                let id = next_id;
                next_id += 1;
                id
            });
            mapping.insert(id, table.clone());
        }
        Ok(EnsurePullabilityOutput {
            table_identifier_mapping: mapping,
        })
    }

    async fn setup_replication(
        &self,
        signal: SlotSignalWorker,
        req: SetupReplicationInput,
    ) -> ConnectorResult<()> {
        let slot_name = req
            .replication_slot_name
            .unwrap_or_else(|| format!("peerdb_slot_{}", req.flow_job_name));
        let _ = signal
            .slot_created
            .send(SlotCreated {
                slot_name,
                snapshot_name: format!("memory_snapshot_{}", Uuid::new_v4()),
                error: None,
            })
            .await;
        let _ = signal.clone_complete.await;
        Ok(())
    }

    async fn pull_flow_cleanup(&self, _flow_job_name: &str) -> ConnectorResult<()> {
        Ok(())
    }

    async fn send_wal_heartbeat(&self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn pull_records(&self, req: PullRecordsRequest) -> ConnectorResult<RecordBatch> {
        let last_checkpoint_seen = req
            .last_sync_state
            .map(|state| state.checkpoint)
            .unwrap_or(0);

        // wait for the first unseen record or the idle deadline
        let deadline = tokio::time::Instant::now() + req.idle_timeout;
        let mut unseen: Vec<Record> = loop {
            if self.token.is_cancelled() {
                return Err(ConnectorError::Cancelled);
            }
            let unseen: Vec<Record> = {
                let feed = self.store.feed.lock().await;
                feed.iter()
                    .filter(|r| r.checkpoint_id() > last_checkpoint_seen)
                    .cloned()
                    .collect()
            };
            if !unseen.is_empty() || tokio::time::Instant::now() >= deadline {
                break unseen;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                _ = self.token.cancelled() => return Err(ConnectorError::Cancelled),
            }
        };
        unseen.sort_by_key(Record::checkpoint_id);
        unseen.truncate(req.max_batch_size as usize);

        let mut records = Vec::new();
        let mut first_checkpoint = 0i64;
        let mut last_checkpoint = 0i64;
        let mut deltas: HashMap<String, TableSchemaDelta> = HashMap::new();
        let mut relation_message_mapping = req.relation_message_mapping.clone();

        for record in unseen {
            let checkpoint = record.checkpoint_id();
            if first_checkpoint == 0 {
                first_checkpoint = checkpoint;
            }
            last_checkpoint = last_checkpoint.max(checkpoint);

            if let Record::Relation(rel) = &record {
                relation_message_mapping.insert(rel.relation.clone());
            }
            if let (Some(destination), Some(items)) =
                (record.destination_table(), record.items())
            {
                if let Some(schema) = req.table_name_schema_mapping.get(destination) {
                    let added: Vec<ColumnDescriptor> = items
                        .iter()
                        .filter(|(name, _)| schema.column(name).is_none())
                        .map(|(name, v)| ColumnDescriptor {
                            name: name.to_string(),
                            kind: v.kind(),
                            nullable: true,
                        })
                        .collect();
                    if !added.is_empty() {
                        let source = match &record {
                            Record::Insert(r) => r.source_table.clone(),
                            Record::Update(r) => r.source_table.clone(),
                            Record::Delete(r) => r.source_table.clone(),
                            Record::Relation(_) => String::new(),
                        };
                        let delta =
                            deltas
                                .entry(destination.to_string())
                                .or_insert_with(|| TableSchemaDelta {
                                    src_table_name: source,
                                    dst_table_name: destination.to_string(),
                                    added_columns: Vec::new(),
                                });
                        for col in added {
                            if !delta.added_columns.iter().any(|c| c.name == col.name) {
                                delta.added_columns.push(col);
                            }
                        }
                        relation_message_mapping.insert(RelationMessage {
                            relation_id: 0,
                            relation_name: delta.src_table_name.clone(),
                            columns: items
                                .iter()
                                .map(|(name, v)| pt::flow::RelationColumn {
                                    name: name.to_string(),
                                    kind: v.kind(),
                                })
                                .collect(),
                        });
                    }
                }
            }
            records.push(record);
        }

        Ok(RecordBatch {
            records,
            first_checkpoint_id: first_checkpoint,
            last_checkpoint_id: last_checkpoint,
            table_schema_deltas: deltas.into_values().collect(),
            relation_message_mapping,
        })
    }

    async fn get_table_schema(
        &self,
        table_identifiers: &[String],
    ) -> ConnectorResult<Vec<TableSchema>> {
        let tables = self.store.tables.lock().await;
        table_identifiers
            .iter()
            .map(|name| {
                tables
                    .get(name)
                    .and_then(|t| t.schema.clone())
                    .ok_or_else(|| ConnectorError::Fatal(format!("table {name} does not exist")))
            })
            .collect()
    }

    async fn initialize_table_schema(
        &self,
        mapping: HashMap<String, TableSchema>,
    ) -> ConnectorResult<()> {
        {
            // replay schema additions onto existing normalized tables
            let mut tables = self.store.tables.lock().await;
            for (dst, schema) in &mapping {
                if let Some(table) = tables.get_mut(dst) {
                    table.schema = Some(schema.clone());
                }
            }
        }
        *self.table_schema_mapping.lock().await = mapping;
        Ok(())
    }

    async fn create_raw_table(&self, req: &CreateRawTableInput) -> ConnectorResult<String> {
        Ok(format!("_peerdb_raw_{}", req.flow_job_name))
    }

    async fn setup_normalized_table(
        &self,
        table_identifier: &str,
        schema: &TableSchema,
    ) -> ConnectorResult<SetupNormalizedTableOutput> {
        let mut tables = self.store.tables.lock().await;
        let already_exists = tables.contains_key(table_identifier);
        if !already_exists {
            tables.insert(
                table_identifier.to_string(),
                MemoryTable {
                    schema: Some(schema.clone()),
                    rows: BTreeMap::new(),
                },
            );
        }
        Ok(SetupNormalizedTableOutput {
            table_identifier: table_identifier.to_string(),
            already_exists,
        })
    }

    async fn sync_records(&self, req: SyncRecordsRequest) -> ConnectorResult<SyncResponse> {
        if self.token.is_cancelled() {
            return Err(ConnectorError::Cancelled);
        }
        if self.store.fail_next_sync.swap(false, Ordering::SeqCst) {
            return Err(ConnectorError::Transient(anyhow::anyhow!(
                "injected sync failure"
            )));
        }

        let mut metadata = self.store.metadata.lock().await;
        let mut raw = self.store.raw.lock().await;
        let flow = metadata.entry(req.flow_job_name.clone()).or_default();
        let batch_id = flow.sync_batch_id + 1;

        let mut num_records = 0u64;
        for record in &req.records.records {
            let (Some(record_type), Some(destination)) =
                (record.record_type(), record.destination_table())
            else {
                continue;
            };
            raw.push(RawEvent {
                uid: Uuid::new_v4(),
                timestamp_ms: Utc::now().timestamp_millis(),
                checkpoint_id: record.checkpoint_id(),
                destination_table: destination.to_string(),
                data: record
                    .items()
                    .map(RecordItems::to_json)
                    .unwrap_or(serde_json::Value::Null),
                record_type: record_type as i16,
                match_data: record.match_items().map(RecordItems::to_json),
                batch_id,
                unchanged_toast_columns: record
                    .unchanged_toast_columns()
                    .map(|cols| cols.iter().cloned().collect())
                    .unwrap_or_default(),
            });
            num_records += 1;
        }

        flow.sync_batch_id = batch_id;
        flow.last_offset = flow.last_offset.max(req.records.last_checkpoint_id);

        Ok(SyncResponse {
            first_synced_checkpoint_id: req.records.first_checkpoint_id,
            last_synced_checkpoint_id: req.records.last_checkpoint_id,
            num_records_synced: num_records,
            current_sync_batch_id: batch_id,
            table_schema_deltas: req.records.table_schema_deltas,
            relation_message_mapping: req.records.relation_message_mapping,
        })
    }

    async fn normalize_records(
        &self,
        req: NormalizeRecordsRequest,
    ) -> ConnectorResult<NormalizeResponse> {
        let schema_mapping = self.table_schema_mapping.lock().await.clone();
        let mut metadata = self.store.metadata.lock().await;
        let raw = self.store.raw.lock().await;
        let mut tables = self.store.tables.lock().await;

        let Some(flow) = metadata.get_mut(&req.flow_job_name) else {
            return Ok(NormalizeResponse::default());
        };
        if flow.sync_batch_id == flow.normalize_batch_id {
            return Ok(NormalizeResponse {
                done: false,
                start_batch_id: flow.normalize_batch_id,
                end_batch_id: flow.sync_batch_id,
            });
        }

        let mut events: Vec<&RawEvent> = raw
            .iter()
            .filter(|e| {
                e.batch_id > flow.normalize_batch_id && e.batch_id <= flow.sync_batch_id
            })
            .collect();
        events.sort_by_key(|e| (e.checkpoint_id, e.timestamp_ms));

        for event in events {
            let schema = schema_mapping
                .get(&event.destination_table)
                .cloned()
                .or_else(|| {
                    tables
                        .get(&event.destination_table)
                        .and_then(|t| t.schema.clone())
                })
                .ok_or_else(|| {
                    ConnectorError::DataSchema(format!(
                        "no schema initialized for destination table {}",
                        event.destination_table
                    ))
                })?;
            let table = tables.entry(event.destination_table.clone()).or_default();
            if table.schema.is_none() {
                table.schema = Some(schema.clone());
            }

            match event.record_type {
                0 | 1 => {
                    let mut items = items_from_json(&schema, &event.data)
                        .map_err(|e| ConnectorError::DataSchema(format!("{e:#}")))?;
                    let key = pk_key_of(&schema.primary_key_columns, &items);
                    if let Some(existing) = table.rows.get(&key) {
                        for unchanged in &event.unchanged_toast_columns {
                            if let Some(prior) = existing.get(unchanged) {
                                items.insert(unchanged.clone(), prior.clone());
                            }
                        }
                    }
                    table.rows.insert(key, items);
                }
                2 => {
                    let keys = event.match_data.as_ref().unwrap_or(&event.data);
                    let items = items_from_json(&schema, keys)
                        .map_err(|e| ConnectorError::DataSchema(format!("{e:#}")))?;
                    let key = pk_key_of(&schema.primary_key_columns, &items);
                    table.rows.remove(&key);
                }
                other => {
                    return Err(ConnectorError::DataSchema(format!(
                        "unknown raw record type {other}"
                    )))
                }
            }
        }

        let start = flow.normalize_batch_id + 1;
        let end = flow.sync_batch_id;
        flow.normalize_batch_id = end;
        Ok(NormalizeResponse {
            done: true,
            start_batch_id: start,
            end_batch_id: end,
        })
    }

    async fn rename_tables(&self, req: &RenameTablesInput) -> ConnectorResult<()> {
        let mut tables = self.store.tables.lock().await;
        for option in &req.rename_table_options {
            if let Some(mut table) = tables.remove(&option.current_name) {
                if let Some(schema) = &mut table.schema {
                    schema.table_identifier = option.new_name.clone();
                }
                tables.insert(option.new_name.clone(), table);
            }
        }
        Ok(())
    }

    async fn sync_flow_cleanup(&self, flow_job_name: &str) -> ConnectorResult<()> {
        self.store.metadata.lock().await.remove(flow_job_name);
        self.store.raw.lock().await.clear();
        Ok(())
    }

    async fn setup_qrep_metadata_tables(&self, _config: &QRepConfig) -> ConnectorResult<()> {
        Ok(())
    }

    async fn get_qrep_partitions(
        &self,
        config: &QRepConfig,
        last: &QRepPartition,
    ) -> ConnectorResult<Vec<QRepPartition>> {
        let tables = self.store.tables.lock().await;
        let Some(table) = tables.get(&config.watermark_table) else {
            return Err(ConnectorError::Fatal(format!(
                "table {} does not exist",
                config.watermark_table
            )));
        };

        let lower = match &last.range {
            Some(PartitionRange::Int { end, .. }) => Some(*end),
            _ => None,
        };
        let watermarks: Vec<i64> = table
            .rows
            .values()
            .filter_map(|items| match items.get(&config.watermark_column) {
                Some(Value::Integer(n)) => Some(*n as i64),
                Some(Value::BigInt(n)) => Some(*n),
                _ => None,
            })
            .filter(|n| lower.map(|l| *n > l).unwrap_or(true))
            .collect();

        let (Some(&min), Some(&max)) = (watermarks.iter().min(), watermarks.iter().max()) else {
            return Ok(Vec::new());
        };
        Ok(plan_int_partitions(
            min,
            max,
            watermarks.len() as u64,
            config.num_rows_per_partition,
        )
        .into_iter()
        .map(|(start, end)| QRepPartition {
            partition_id: Uuid::new_v4().to_string(),
            range: Some(PartitionRange::Int { start, end }),
            full_table_partition: false,
        })
        .collect())
    }

    async fn pull_qrep_records(
        &self,
        config: &QRepConfig,
        partition: &QRepPartition,
    ) -> ConnectorResult<QRecordBatch> {
        let tables = self.store.tables.lock().await;
        let Some(table) = tables.get(&config.watermark_table) else {
            return Err(ConnectorError::Fatal(format!(
                "table {} does not exist",
                config.watermark_table
            )));
        };
        let schema = table.schema.clone().ok_or_else(|| {
            ConnectorError::Fatal(format!("table {} has no schema", config.watermark_table))
        })?;

        let in_range = |items: &RecordItems| -> bool {
            if partition.full_table_partition || partition.range.is_none() {
                return true;
            }
            let Some(PartitionRange::Int { start, end }) = partition.range else {
                return false;
            };
            match items.get(&config.watermark_column) {
                Some(Value::Integer(n)) => (*n as i64) >= start && (*n as i64) <= end,
                Some(Value::BigInt(n)) => *n >= start && *n <= end,
                _ => false,
            }
        };

        let records: Vec<QRecord> = table
            .rows
            .values()
            .filter(|items| in_range(items))
            .map(|items| QRecord {
                values: schema
                    .columns
                    .iter()
                    .map(|c| items.get(&c.name).cloned().unwrap_or(Value::Null))
                    .collect(),
            })
            .collect();

        Ok(QRecordBatch {
            schema: QRecordSchema {
                fields: schema.columns.clone(),
            },
            records,
        })
    }

    async fn sync_qrep_records(
        &self,
        config: &QRepConfig,
        partition: &QRepPartition,
        mut stream: QRecordStream,
    ) -> ConnectorResult<u64> {
        let sync_start = Utc::now();
        {
            let qrep_metadata = self.store.qrep_metadata.lock().await;
            if qrep_metadata
                .contains_key(&(config.flow_job_name.clone(), partition.partition_id.clone()))
            {
                tracing::info!(
                    flow = config.flow_job_name,
                    partition = partition.partition_id,
                    "partition already synced, skipping"
                );
                return Ok(0);
            }
        }

        let fields = stream.schema().fields.clone();
        let mut rows = Vec::new();
        while let Some(record) = stream.next().await {
            rows.push(record);
        }

        let mut tables = self.store.tables.lock().await;
        let table = tables
            .entry(config.destination_table_identifier.clone())
            .or_default();
        let pk_columns: Vec<String> = config
            .write_mode
            .as_ref()
            .map(|m| m.upsert_key_columns.clone())
            .filter(|keys| !keys.is_empty())
            .or_else(|| {
                table
                    .schema
                    .as_ref()
                    .map(|s| s.primary_key_columns.clone())
            })
            .unwrap_or_default();
        if table.schema.is_none() {
            table.schema = Some(TableSchema {
                table_identifier: config.destination_table_identifier.clone(),
                columns: fields.clone(),
                primary_key_columns: pk_columns.clone(),
            });
        }

        let mut rows_synced = 0u64;
        for record in rows {
            let items: RecordItems = fields
                .iter()
                .zip(record.values)
                .map(|(f, v)| (f.name.clone(), v))
                .collect();
            let key = if pk_columns.is_empty() {
                Uuid::new_v4().to_string()
            } else {
                pk_key_of(&pk_columns, &items)
            };
            table.rows.insert(key, items);
            rows_synced += 1;
        }

        self.store.qrep_metadata.lock().await.insert(
            (config.flow_job_name.clone(), partition.partition_id.clone()),
            QRepMetadataRow {
                partition: partition.clone(),
                sync_start_time: sync_start,
                sync_finish_time: Utc::now(),
                rows_in_partition: rows_synced,
            },
        );
        Ok(rows_synced)
    }

    async fn consolidate_qrep_partitions(&self, _config: &QRepConfig) -> ConnectorResult<()> {
        Ok(())
    }

    async fn cleanup_qrep_flow(&self, config: &QRepConfig) -> ConnectorResult<()> {
        self.store
            .qrep_metadata
            .lock()
            .await
            .retain(|(flow, _), _| flow != &config.flow_job_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::records::{DeleteRecord, InsertRecord, UpdateRecord};
    use std::collections::BTreeSet;
    use value::Kind;

    fn schema(table: &str) -> TableSchema {
        TableSchema {
            table_identifier: table.to_string(),
            columns: vec![
                ColumnDescriptor {
                    name: "id".to_string(),
                    kind: Kind::Int32,
                    nullable: false,
                },
                ColumnDescriptor {
                    name: "v".to_string(),
                    kind: Kind::String,
                    nullable: true,
                },
                ColumnDescriptor {
                    name: "blob".to_string(),
                    kind: Kind::String,
                    nullable: true,
                },
            ],
            primary_key_columns: vec!["id".to_string()],
        }
    }

    fn items(id: i32, v: &str, blob: Option<&str>) -> RecordItems {
        let mut out = RecordItems::new();
        out.insert("id", Value::integer(id));
        out.insert("v", Value::text(v));
        out.insert(
            "blob",
            blob.map(Value::text).unwrap_or(Value::Null),
        );
        out
    }

    fn connector(name: &str) -> MemoryConnector {
        // unique store per test
        MemoryConnector::new(
            CancellationToken::new(),
            &format!("{name}_{}", Uuid::new_v4()),
        )
    }

    async fn sync_and_normalize(conn: &MemoryConnector, flow: &str, records: Vec<Record>) {
        let last = records.iter().map(Record::checkpoint_id).max().unwrap_or(0);
        let first = records.iter().map(Record::checkpoint_id).min().unwrap_or(0);
        conn.sync_records(SyncRecordsRequest {
            flow_job_name: flow.to_string(),
            records: RecordBatch {
                records,
                first_checkpoint_id: first,
                last_checkpoint_id: last,
                ..Default::default()
            },
            staging_path: None,
            script: None,
        })
        .await
        .unwrap();
        conn.normalize_records(NormalizeRecordsRequest {
            flow_job_name: flow.to_string(),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn insert_then_update_normalizes_to_latest() {
        let conn = connector("t1");
        conn.initialize_table_schema(HashMap::from([("dw.t".to_string(), schema("dw.t"))]))
            .await
            .unwrap();

        let records = vec![
            Record::Insert(InsertRecord {
                checkpoint_id: 100,
                commit_time: Utc::now(),
                source_table: "public.t".to_string(),
                destination_table: "dw.t".to_string(),
                items: items(1, "a", None),
            }),
            Record::Update(UpdateRecord {
                checkpoint_id: 200,
                commit_time: Utc::now(),
                source_table: "public.t".to_string(),
                destination_table: "dw.t".to_string(),
                old_items: items(1, "a", None),
                new_items: items(1, "b", None),
                unchanged_toast_columns: BTreeSet::new(),
            }),
        ];
        sync_and_normalize(&conn, "flow1", records).await;

        let store = conn.store();
        let rows = store.table_rows("dw.t").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("v"), Some(&Value::text("b")));
        assert_eq!(store.raw_events().await.len(), 2);
        assert_eq!(store.stored_offset("flow1").await, Some(200));
    }

    #[tokio::test]
    async fn unchanged_toast_columns_keep_prior_values() {
        let conn = connector("t2");
        conn.initialize_table_schema(HashMap::from([("dw.t".to_string(), schema("dw.t"))]))
            .await
            .unwrap();

        let big_blob = "x".repeat(100 * 1024);
        sync_and_normalize(
            &conn,
            "flow1",
            vec![Record::Insert(InsertRecord {
                checkpoint_id: 100,
                commit_time: Utc::now(),
                source_table: "public.t".to_string(),
                destination_table: "dw.t".to_string(),
                items: items(1, "a", Some(&big_blob)),
            })],
        )
        .await;

        sync_and_normalize(
            &conn,
            "flow1",
            vec![Record::Update(UpdateRecord {
                checkpoint_id: 200,
                commit_time: Utc::now(),
                source_table: "public.t".to_string(),
                destination_table: "dw.t".to_string(),
                old_items: items(1, "a", None),
                new_items: items(1, "b", None),
                unchanged_toast_columns: ["blob".to_string()].into_iter().collect(),
            })],
        )
        .await;

        let rows = conn.store().table_rows("dw.t").await;
        assert_eq!(rows[0].get("v"), Some(&Value::text("b")));
        assert_eq!(rows[0].get("blob"), Some(&Value::text(big_blob)));
    }

    #[tokio::test]
    async fn delete_removes_normalized_row() {
        let conn = connector("t3");
        conn.initialize_table_schema(HashMap::from([("dw.t".to_string(), schema("dw.t"))]))
            .await
            .unwrap();
        sync_and_normalize(
            &conn,
            "flow1",
            vec![
                Record::Insert(InsertRecord {
                    checkpoint_id: 100,
                    commit_time: Utc::now(),
                    source_table: "public.t".to_string(),
                    destination_table: "dw.t".to_string(),
                    items: items(1, "a", None),
                }),
                Record::Delete(DeleteRecord {
                    checkpoint_id: 150,
                    commit_time: Utc::now(),
                    source_table: "public.t".to_string(),
                    destination_table: "dw.t".to_string(),
                    items: items(1, "a", None),
                }),
            ],
        )
        .await;
        assert!(conn.store().table_rows("dw.t").await.is_empty());
    }

    #[tokio::test]
    async fn failed_sync_leaves_checkpoint_unchanged() {
        let conn = connector("t4");
        conn.store().fail_next_sync.store(true, Ordering::SeqCst);
        let err = conn
            .sync_records(SyncRecordsRequest {
                flow_job_name: "flow1".to_string(),
                records: RecordBatch {
                    records: vec![Record::Insert(InsertRecord {
                        checkpoint_id: 100,
                        commit_time: Utc::now(),
                        source_table: "public.t".to_string(),
                        destination_table: "dw.t".to_string(),
                        items: items(1, "a", None),
                    })],
                    first_checkpoint_id: 100,
                    last_checkpoint_id: 100,
                    ..Default::default()
                },
                staging_path: None,
                script: None,
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(conn.store().stored_offset("flow1").await, None);
        assert!(conn.store().raw_events().await.is_empty());
    }

    #[tokio::test]
    async fn qrep_partition_apply_is_idempotent() {
        let conn = connector("t5");
        let store = conn.store();
        store
            .seed_table(
                "public.big",
                schema("public.big"),
                (1..=100).map(|i| items(i, "v", None)).collect(),
            )
            .await;

        let config = QRepConfig {
            flow_job_name: "qrep1".to_string(),
            source_peer: pt::peers::Peer::memory("src"),
            destination_peer: pt::peers::Peer::memory("dst"),
            destination_table_identifier: "dw.big".to_string(),
            query: String::new(),
            watermark_table: "public.big".to_string(),
            watermark_column: "id".to_string(),
            initial_copy_only: true,
            num_rows_per_partition: 10,
            max_parallel_workers: 2,
            wait_between_batches_seconds: 0,
            write_mode: None,
            staging_path: None,
            snapshot_name: None,
        };

        let partitions = conn
            .get_qrep_partitions(&config, &QRepPartition::not_applicable())
            .await
            .unwrap();
        assert_eq!(partitions.len(), 10);

        for partition in &partitions {
            let batch = conn.pull_qrep_records(&config, partition).await.unwrap();
            let synced = conn
                .sync_qrep_records(&config, partition, batch.into_stream(1024))
                .await
                .unwrap();
            assert_eq!(synced, 10);
        }
        assert_eq!(store.table_rows("dw.big").await.len(), 100);

        // re-applying the same partitions must be a no-op
        for partition in &partitions {
            let batch = conn.pull_qrep_records(&config, partition).await.unwrap();
            let synced = conn
                .sync_qrep_records(&config, partition, batch.into_stream(1024))
                .await
                .unwrap();
            assert_eq!(synced, 0);
        }
        assert_eq!(store.table_rows("dw.big").await.len(), 100);
        assert_eq!(store.qrep_partition_count("qrep1").await, 10);
    }

    #[tokio::test]
    async fn rename_tables_swaps_resync_suffix() {
        let conn = connector("t6");
        let store = conn.store();
        store
            .seed_table(
                "dw.orders_resync",
                schema("dw.orders_resync"),
                vec![items(1, "snapshotted", None)],
            )
            .await;
        store
            .seed_table("dw.orders", schema("dw.orders"), vec![items(9, "stale", None)])
            .await;

        conn.rename_tables(&RenameTablesInput {
            flow_job_name: "flow1".to_string(),
            peer: pt::peers::Peer::memory("dst"),
            rename_table_options: vec![pt::flow::RenameTableOption {
                current_name: "dw.orders_resync".to_string(),
                new_name: "dw.orders".to_string(),
            }],
        })
        .await
        .unwrap();

        assert!(!store.table_exists("dw.orders_resync").await);
        let rows = store.table_rows("dw.orders").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("v"), Some(&Value::text("snapshotted")));
    }
}
