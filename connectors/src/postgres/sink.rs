use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use model::records::RecordItems;
use model::{
    CreateRawTableInput, NormalizeRecordsRequest, NormalizeResponse, SetupNormalizedTableOutput,
    SyncRecordsRequest, SyncResponse,
};
use pt::flow::{LastSyncState, RenameTablesInput, TableSchema};
use tokio_postgres::types::ToSql;
use uuid::Uuid;
use value::Value;

use super::pg_value::PgValue;
use super::schema::{
    create_normalized_table_ddl, quote_ident, quote_qualified, split_qualified,
};
use super::PostgresConnector;
use crate::{ConnectorError, ConnectorResult};

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl PostgresConnector {
    fn last_sync_state_table(&self) -> String {
        format!("{}.last_sync_state", quote_ident(&self.metadata_schema()))
    }

    pub(crate) fn raw_table_identifier(&self, flow_job_name: &str) -> String {
        format!(
            "{}.{}",
            quote_ident(&self.metadata_schema()),
            quote_ident(&format!("_peerdb_raw_{}", sanitize(flow_job_name)))
        )
    }

    pub(super) async fn needs_setup_metadata_tables_impl(&self) -> ConnectorResult<bool> {
        let client = self.client.lock().await;
        let row = client
            .query_one(
                "SELECT to_regclass($1) IS NULL",
                &[&format!("{}.last_sync_state", self.metadata_schema())],
            )
            .await?;
        Ok(row.get(0))
    }

    pub(super) async fn setup_metadata_tables_impl(&self) -> ConnectorResult<()> {
        let schema = quote_ident(&self.metadata_schema());
        let client = self.client.lock().await;
        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {schema};
                 CREATE TABLE IF NOT EXISTS {table} (
                     flow_job_name TEXT PRIMARY KEY,
                     last_offset BIGINT NOT NULL DEFAULT 0,
                     sync_batch_id BIGINT NOT NULL DEFAULT 0,
                     normalize_batch_id BIGINT NOT NULL DEFAULT 0,
                     updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                 )",
                schema = schema,
                table = self.last_sync_state_table(),
            ))
            .await?;
        Ok(())
    }

    pub(super) async fn get_last_offset_impl(
        &self,
        flow_job_name: &str,
    ) -> ConnectorResult<Option<LastSyncState>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    "SELECT last_offset, updated_at FROM {} WHERE flow_job_name = $1",
                    self.last_sync_state_table()
                ),
                &[&flow_job_name],
            )
            .await?;
        Ok(row.map(|row| LastSyncState {
            checkpoint: row.get(0),
            last_synced_at: Some(row.get(1)),
        }))
    }

    pub(super) async fn create_raw_table_impl(
        &self,
        req: &CreateRawTableInput,
    ) -> ConnectorResult<String> {
        self.setup_metadata_tables_impl().await?;
        let raw_table = self.raw_table_identifier(&req.flow_job_name);
        let client = self.client.lock().await;
        client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {raw_table} (
                     _peerdb_uid UUID PRIMARY KEY,
                     _peerdb_timestamp BIGINT NOT NULL,
                     _peerdb_checkpoint_id BIGINT NOT NULL,
                     _peerdb_destination_table TEXT NOT NULL,
                     _peerdb_data JSONB NOT NULL,
                     _peerdb_record_type SMALLINT NOT NULL,
                     _peerdb_match_data JSONB,
                     _peerdb_batch_id BIGINT NOT NULL,
                     _peerdb_unchanged_toast_columns TEXT NOT NULL DEFAULT ''
                 );
                 CREATE INDEX IF NOT EXISTS {index} ON {raw_table} (_peerdb_batch_id)",
                raw_table = raw_table,
                index = quote_ident(&format!(
                    "_peerdb_raw_{}_batch_idx",
                    sanitize(&req.flow_job_name)
                )),
            ))
            .await?;
        Ok(raw_table)
    }

    pub(super) async fn initialize_table_schema_impl(
        &self,
        mapping: HashMap<String, TableSchema>,
    ) -> ConnectorResult<()> {
        {
            let client = self.client.lock().await;
            for (dst_table, schema) in &mapping {
                let exists: bool = client
                    .query_one("SELECT to_regclass($1) IS NOT NULL", &[dst_table])
                    .await?
                    .get(0);
                if !exists {
                    continue;
                }
                // replay schema additions onto an existing normalized table
                for column in &schema.columns {
                    client
                        .batch_execute(&format!(
                            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                            quote_qualified(dst_table),
                            quote_ident(&column.name),
                            super::schema::pg_type_for(&column.kind),
                        ))
                        .await?;
                }
            }
        }
        *self.table_schema_mapping.lock().await = mapping;
        Ok(())
    }

    pub(super) async fn setup_normalized_table_impl(
        &self,
        table_identifier: &str,
        schema: &TableSchema,
    ) -> ConnectorResult<SetupNormalizedTableOutput> {
        let client = self.client.lock().await;
        let already_exists: bool = client
            .query_one("SELECT to_regclass($1) IS NOT NULL", &[&table_identifier])
            .await?
            .get(0);
        if !already_exists {
            let (schema_name, _) = split_qualified(table_identifier);
            client
                .batch_execute(&format!(
                    "CREATE SCHEMA IF NOT EXISTS {}",
                    quote_ident(schema_name)
                ))
                .await?;
            client
                .batch_execute(&create_normalized_table_ddl(table_identifier, schema))
                .await?;
        }
        Ok(SetupNormalizedTableOutput {
            table_identifier: table_identifier.to_string(),
            already_exists,
        })
    }

    pub(super) async fn sync_records_impl(
        &self,
        req: SyncRecordsRequest,
    ) -> ConnectorResult<SyncResponse> {
        if self.token.is_cancelled() {
            return Err(ConnectorError::Cancelled);
        }
        let raw_table = self.raw_table_identifier(&req.flow_job_name);
        let state_table = self.last_sync_state_table();

        let mut client = self.client.lock().await;
        let txn = client.transaction().await?;

        let batch_id: i64 = txn
            .query_opt(
                &format!(
                    "SELECT sync_batch_id FROM {state_table}
                     WHERE flow_job_name = $1 FOR UPDATE"
                ),
                &[&req.flow_job_name],
            )
            .await?
            .map(|row| row.get::<_, i64>(0) + 1)
            .unwrap_or(1);

        let insert = txn
            .prepare(&format!(
                "INSERT INTO {raw_table} (
                     _peerdb_uid, _peerdb_timestamp, _peerdb_checkpoint_id,
                     _peerdb_destination_table, _peerdb_data, _peerdb_record_type,
                     _peerdb_match_data, _peerdb_batch_id,
                     _peerdb_unchanged_toast_columns)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
            ))
            .await?;

        let mut num_records = 0u64;
        for record in &req.records.records {
            let Some(record_type) = record.record_type() else {
                continue;
            };
            let Some(destination) = record.destination_table() else {
                continue;
            };
            let data = record
                .items()
                .map(RecordItems::to_json)
                .unwrap_or(serde_json::Value::Null);
            let match_data = record.match_items().map(RecordItems::to_json);
            let unchanged = record
                .unchanged_toast_columns()
                .map(|cols| cols.iter().cloned().collect::<Vec<_>>().join(","))
                .unwrap_or_default();
            txn.execute(
                &insert,
                &[
                    &Uuid::new_v4(),
                    &Utc::now().timestamp_millis(),
                    &record.checkpoint_id(),
                    &destination,
                    &data,
                    &(record_type as i16),
                    &match_data,
                    &batch_id,
                    &unchanged,
                ],
            )
            .await?;
            num_records += 1;
        }

        // the checkpoint moves in the same transaction as the raw rows, so
        // a partial write leaves it untouched
        txn.execute(
            &format!(
                "INSERT INTO {state_table}
                     (flow_job_name, last_offset, sync_batch_id, updated_at)
                 VALUES ($1, $2, $3, now())
                 ON CONFLICT (flow_job_name) DO UPDATE SET
                     last_offset = GREATEST({state_table}.last_offset, EXCLUDED.last_offset),
                     sync_batch_id = EXCLUDED.sync_batch_id,
                     updated_at = now()"
            ),
            &[
                &req.flow_job_name,
                &req.records.last_checkpoint_id,
                &batch_id,
            ],
        )
        .await?;
        txn.commit().await?;

        tracing::info!(
            flow = req.flow_job_name,
            "synced {num_records} records into batch {batch_id}"
        );
        Ok(SyncResponse {
            first_synced_checkpoint_id: req.records.first_checkpoint_id,
            last_synced_checkpoint_id: req.records.last_checkpoint_id,
            num_records_synced: num_records,
            current_sync_batch_id: batch_id,
            table_schema_deltas: req.records.table_schema_deltas,
            relation_message_mapping: req.records.relation_message_mapping,
        })
    }

    pub(super) async fn normalize_records_impl(
        &self,
        req: NormalizeRecordsRequest,
    ) -> ConnectorResult<NormalizeResponse> {
        let raw_table = self.raw_table_identifier(&req.flow_job_name);
        let state_table = self.last_sync_state_table();
        let schema_mapping = self.table_schema_mapping.lock().await.clone();

        let mut client = self.client.lock().await;
        let txn = client.transaction().await?;

        let Some(state_row) = txn
            .query_opt(
                &format!(
                    "SELECT sync_batch_id, normalize_batch_id FROM {state_table}
                     WHERE flow_job_name = $1 FOR UPDATE"
                ),
                &[&req.flow_job_name],
            )
            .await?
        else {
            return Ok(NormalizeResponse::default());
        };
        let sync_batch_id: i64 = state_row.get(0);
        let normalize_batch_id: i64 = state_row.get(1);
        if sync_batch_id == normalize_batch_id {
            return Ok(NormalizeResponse {
                done: false,
                start_batch_id: normalize_batch_id,
                end_batch_id: sync_batch_id,
            });
        }

        let rows = txn
            .query(
                &format!(
                    "SELECT _peerdb_destination_table, _peerdb_data, _peerdb_record_type,
                            _peerdb_match_data, _peerdb_unchanged_toast_columns
                     FROM {raw_table}
                     WHERE _peerdb_batch_id > $1 AND _peerdb_batch_id <= $2
                     ORDER BY _peerdb_checkpoint_id, _peerdb_timestamp"
                ),
                &[&normalize_batch_id, &sync_batch_id],
            )
            .await?;

        for row in rows {
            let destination: String = row.get(0);
            let data: serde_json::Value = row.get(1);
            let record_type: i16 = row.get(2);
            let match_data: Option<serde_json::Value> = row.get(3);
            let unchanged_cols: String = row.get(4);

            let schema = schema_mapping.get(&destination).ok_or_else(|| {
                ConnectorError::DataSchema(format!(
                    "no schema initialized for destination table {destination}"
                ))
            })?;

            match record_type {
                0 | 1 => {
                    let unchanged: BTreeSet<String> = unchanged_cols
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                    let (sql, values) = build_upsert(&destination, schema, &data, &unchanged)
                        .map_err(|e| ConnectorError::DataSchema(format!("{e:#}")))?;
                    let params: Vec<PgValue> = values.iter().map(PgValue).collect();
                    let param_refs: Vec<&(dyn ToSql + Sync)> =
                        params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
                    txn.execute(&sql, &param_refs).await?;
                }
                2 => {
                    let keys = match_data.unwrap_or(data);
                    let (sql, values) = build_delete(&destination, schema, &keys)
                        .map_err(|e| ConnectorError::DataSchema(format!("{e:#}")))?;
                    let params: Vec<PgValue> = values.iter().map(PgValue).collect();
                    let param_refs: Vec<&(dyn ToSql + Sync)> =
                        params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
                    txn.execute(&sql, &param_refs).await?;
                }
                other => {
                    return Err(ConnectorError::DataSchema(format!(
                        "unknown raw record type {other}"
                    )))
                }
            }
        }

        txn.execute(
            &format!(
                "UPDATE {state_table} SET normalize_batch_id = $2, updated_at = now()
                 WHERE flow_job_name = $1"
            ),
            &[&req.flow_job_name, &sync_batch_id],
        )
        .await?;
        txn.commit().await?;

        Ok(NormalizeResponse {
            done: true,
            start_batch_id: normalize_batch_id + 1,
            end_batch_id: sync_batch_id,
        })
    }

    pub(super) async fn rename_tables_impl(&self, req: &RenameTablesInput) -> ConnectorResult<()> {
        let mut client = self.client.lock().await;
        let txn = client.transaction().await?;
        for option in &req.rename_table_options {
            let (_, new_short) = split_qualified(&option.new_name);
            txn.batch_execute(&format!(
                "DROP TABLE IF EXISTS {};
                 ALTER TABLE {} RENAME TO {}",
                quote_qualified(&option.new_name),
                quote_qualified(&option.current_name),
                quote_ident(new_short),
            ))
            .await?;
            tracing::info!(
                flow = req.flow_job_name,
                "renamed {} to {}",
                option.current_name,
                option.new_name
            );
        }
        txn.commit().await?;
        Ok(())
    }

    pub(super) async fn sync_flow_cleanup_impl(&self, flow_job_name: &str) -> ConnectorResult<()> {
        let raw_table = self.raw_table_identifier(flow_job_name);
        let state_table = self.last_sync_state_table();
        let mut client = self.client.lock().await;
        let txn = client.transaction().await?;
        txn.batch_execute(&format!("DROP TABLE IF EXISTS {raw_table}"))
            .await?;
        txn.execute(
            &format!("DELETE FROM {state_table} WHERE flow_job_name = $1"),
            &[&flow_job_name],
        )
        .await?;
        txn.commit().await?;
        Ok(())
    }
}

/// Builds the per-record merge: insert the post-image, on conflict update
/// every non-key column except the unchanged-toast ones, which keep their
/// previously normalized value.
pub fn build_upsert(
    destination: &str,
    schema: &TableSchema,
    data: &serde_json::Value,
    unchanged_toast: &BTreeSet<String>,
) -> anyhow::Result<(String, Vec<Value>)> {
    let mut columns = Vec::new();
    let mut placeholders = Vec::new();
    let mut values = Vec::new();
    for (i, column) in schema.columns.iter().enumerate() {
        let json_value = data.get(&column.name).unwrap_or(&serde_json::Value::Null);
        values.push(Value::from_serde_json_value(&column.kind, json_value)?);
        columns.push(quote_ident(&column.name));
        placeholders.push(format!("${}", i + 1));
    }

    let updates: Vec<String> = schema
        .columns
        .iter()
        .filter(|c| {
            !schema.primary_key_columns.contains(&c.name) && !unchanged_toast.contains(&c.name)
        })
        .map(|c| format!("{col} = EXCLUDED.{col}", col = quote_ident(&c.name)))
        .collect();

    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(","))
    };

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        quote_qualified(destination),
        columns.join(","),
        placeholders.join(","),
        schema
            .primary_key_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(","),
        conflict,
    );
    Ok((sql, values))
}

pub fn build_delete(
    destination: &str,
    schema: &TableSchema,
    keys: &serde_json::Value,
) -> anyhow::Result<(String, Vec<Value>)> {
    let mut predicates = Vec::new();
    let mut values = Vec::new();
    for (i, pk) in schema.primary_key_columns.iter().enumerate() {
        let column = schema
            .column(pk)
            .ok_or_else(|| anyhow::anyhow!("primary key column {pk} missing from schema"))?;
        let json_value = keys
            .get(pk)
            .ok_or_else(|| anyhow::anyhow!("delete record missing key column {pk}"))?;
        values.push(Value::from_serde_json_value(&column.kind, json_value)?);
        predicates.push(format!("{} = ${}", quote_ident(pk), i + 1));
    }
    let sql = format!(
        "DELETE FROM {} WHERE {}",
        quote_qualified(destination),
        predicates.join(" AND "),
    );
    Ok((sql, values))
}
