use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use model::records::{DeleteRecord, InsertRecord, Record, RecordItems, RelationRecord, UpdateRecord};
use model::{PullRecordsRequest, RecordBatch, SetupReplicationInput};
use pt::flow::{ColumnDescriptor, RelationColumn, RelationMessage, TableSchema, TableSchemaDelta};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::time::Instant;
use value::{Kind, Value};

use super::{connect_simple, PostgresConnector};
use crate::{ConnectorError, ConnectorResult, SlotCreated, SlotSignalWorker};

const PULL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Parses a textual WAL position ("16/B374D848") into a monotonic i64.
pub fn parse_lsn(lsn: &str) -> anyhow::Result<i64> {
    let (hi, lo) = lsn
        .split_once('/')
        .with_context(|| format!("malformed lsn: {lsn}"))?;
    let hi = u64::from_str_radix(hi, 16).with_context(|| format!("malformed lsn: {lsn}"))?;
    let lo = u64::from_str_radix(lo, 16).with_context(|| format!("malformed lsn: {lsn}"))?;
    Ok(((hi << 32) | lo) as i64)
}

pub fn lsn_to_string(lsn: i64) -> String {
    let lsn = lsn as u64;
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

/// Maps the decoder's SQL type names to abstract kinds.
pub fn kind_from_decoded_type(type_name: &str) -> Kind {
    if let Some(element) = type_name.strip_suffix("[]") {
        return Kind::Array(Box::new(kind_from_decoded_type(element)));
    }
    let base = type_name.split('(').next().unwrap_or(type_name).trim();
    match base {
        "boolean" => Kind::Bool,
        "smallint" | "integer" => Kind::Int32,
        "bigint" => Kind::Int64,
        "real" => Kind::Float32,
        "double precision" => Kind::Float64,
        "numeric" => Kind::Numeric,
        "bytea" => Kind::Bytes,
        "date" => Kind::Date,
        "time without time zone" | "time with time zone" => Kind::Time,
        "timestamp without time zone" => Kind::Timestamp,
        "timestamp with time zone" => Kind::TimestampTz,
        "uuid" => Kind::Uuid,
        "json" | "jsonb" => Kind::Json,
        "geometry" => Kind::Geometry,
        "geography" => Kind::Geography,
        _ => Kind::String,
    }
}

/// Decodes one column value as emitted by wal2json. Temporal values use
/// Postgres text format, bytea is hex with a `\x` prefix.
pub fn parse_decoded_value(kind: &Kind, raw: &serde_json::Value) -> anyhow::Result<Value> {
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let out = match kind {
        Kind::Bool => Value::Bool(raw.as_bool().context("expected bool")?),
        Kind::Int32 => Value::Integer(raw.as_i64().context("expected integer")? as i32),
        Kind::Int64 => Value::BigInt(raw.as_i64().context("expected bigint")?),
        Kind::Float32 => Value::Float(raw.as_f64().context("expected real")? as f32),
        Kind::Float64 => Value::Double(raw.as_f64().context("expected double")?),
        Kind::Numeric => match raw {
            serde_json::Value::Number(n) => Value::Numeric(Decimal::from_str(&n.to_string())?),
            serde_json::Value::String(s) => Value::Numeric(Decimal::from_str(s)?),
            other => anyhow::bail!("expected numeric, got {other}"),
        },
        Kind::Bytes => {
            let s = raw.as_str().context("expected bytea string")?;
            let hex_str = s.strip_prefix("\\x").unwrap_or(s);
            Value::Binary(bytes::Bytes::from(hex::decode(hex_str)?))
        }
        Kind::Date => Value::Date(NaiveDate::from_str(raw.as_str().context("expected date")?)?),
        Kind::Time => Value::Time(NaiveTime::from_str(raw.as_str().context("expected time")?)?),
        Kind::Timestamp => Value::Timestamp(parse_pg_timestamp(
            raw.as_str().context("expected timestamp")?,
        )?),
        Kind::TimestampTz => Value::TimestampWithTimeZone(
            parse_pg_timestamptz(raw.as_str().context("expected timestamptz")?)?,
        ),
        Kind::Uuid => Value::Uuid(uuid::Uuid::from_str(raw.as_str().context("expected uuid")?)?),
        Kind::Json => match raw {
            serde_json::Value::String(s) => Value::Json(serde_json::from_str(s)?),
            other => Value::Json(other.clone()),
        },
        Kind::Geometry => Value::Geometry(raw.as_str().context("expected geometry")?.to_string()),
        Kind::Geography => {
            Value::Geography(raw.as_str().context("expected geography")?.to_string())
        }
        Kind::String => match raw {
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        },
        Kind::Array(_) => Value::from_serde_json_value(kind, raw)?,
    };
    Ok(out)
}

fn parse_pg_timestamp(s: &str) -> anyhow::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .with_context(|| format!("malformed timestamp: {s}"))
}

fn parse_pg_timestamptz(s: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z")
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("malformed timestamptz: {s}"))
}

#[derive(Debug, Deserialize)]
struct ChangeColumn {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChangeMessage {
    action: String,
    #[serde(default)]
    schema: String,
    #[serde(default)]
    table: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    columns: Vec<ChangeColumn>,
    #[serde(default)]
    identity: Vec<ChangeColumn>,
}

fn items_from_columns(
    columns: &[ChangeColumn],
    schema: Option<&TableSchema>,
) -> anyhow::Result<RecordItems> {
    columns
        .iter()
        .map(|col| {
            let kind = schema
                .and_then(|s| s.column(&col.name))
                .map(|c| c.kind.clone())
                .unwrap_or_else(|| kind_from_decoded_type(&col.type_name));
            let v = parse_decoded_value(&kind, &col.value)
                .with_context(|| format!("column {}", col.name))?;
            Ok((col.name.clone(), v))
        })
        .collect()
}

/// Accumulates the per-pull decode state: parsed records, schema deltas
/// observed mid-stream, and the refreshed relation mapping.
pub struct DecodedBatch {
    pub records: Vec<Record>,
    pub deltas_by_table: HashMap<String, TableSchemaDelta>,
    pub relation_messages: Vec<RelationMessage>,
}

/// Parses one wal2json change line into the batch. Returns false when the
/// action carries no row data (begin/commit/truncate).
pub fn decode_change(
    req: &PullRecordsRequest,
    lsn: i64,
    data: &str,
    out: &mut DecodedBatch,
) -> anyhow::Result<bool> {
    let change: ChangeMessage = serde_json::from_str(data).context("malformed wal2json change")?;
    if !matches!(change.action.as_str(), "I" | "U" | "D") {
        return Ok(false);
    }

    let source_table = format!("{}.{}", change.schema, change.table);
    let Some(destination_table) = req.table_name_mapping.get(&source_table) else {
        return Ok(false);
    };
    let cached_schema = req.table_name_schema_mapping.get(destination_table);
    let commit_time = change
        .timestamp
        .as_deref()
        .and_then(|ts| parse_pg_timestamptz(ts).ok())
        .unwrap_or_else(Utc::now);

    // columns missing relative to the cached schema are unchanged toast;
    // columns beyond it are a schema delta
    let present: BTreeSet<&str> = change.columns.iter().map(|c| c.name.as_str()).collect();
    if let Some(schema) = cached_schema {
        let added: Vec<ColumnDescriptor> = change
            .columns
            .iter()
            .filter(|c| schema.column(&c.name).is_none())
            .map(|c| ColumnDescriptor {
                name: c.name.clone(),
                kind: kind_from_decoded_type(&c.type_name),
                nullable: true,
            })
            .collect();
        if !added.is_empty() {
            let delta = out
                .deltas_by_table
                .entry(source_table.clone())
                .or_insert_with(|| TableSchemaDelta {
                    src_table_name: source_table.clone(),
                    dst_table_name: destination_table.clone(),
                    added_columns: Vec::new(),
                });
            for col in added {
                if !delta.added_columns.iter().any(|c| c.name == col.name) {
                    delta.added_columns.push(col);
                }
            }

            let relation_id = req
                .src_table_id_name_mapping
                .iter()
                .find(|(_, name)| name.as_str() == source_table)
                .map(|(id, _)| *id)
                .unwrap_or_default();
            let relation = RelationMessage {
                relation_id,
                relation_name: source_table.clone(),
                columns: change
                    .columns
                    .iter()
                    .map(|c| RelationColumn {
                        name: c.name.clone(),
                        kind: kind_from_decoded_type(&c.type_name),
                    })
                    .collect(),
            };
            out.relation_messages.push(relation.clone());
            out.records.push(Record::Relation(RelationRecord {
                checkpoint_id: lsn,
                commit_time,
                relation,
            }));
        }
    }

    let record = match change.action.as_str() {
        "I" => Record::Insert(InsertRecord {
            checkpoint_id: lsn,
            commit_time,
            source_table,
            destination_table: destination_table.clone(),
            items: items_from_columns(&change.columns, cached_schema)?,
        }),
        "U" => {
            let unchanged_toast_columns: BTreeSet<String> = cached_schema
                .map(|schema| {
                    schema
                        .columns
                        .iter()
                        .filter(|c| !present.contains(c.name.as_str()))
                        .map(|c| c.name.clone())
                        .collect()
                })
                .unwrap_or_default();
            Record::Update(UpdateRecord {
                checkpoint_id: lsn,
                commit_time,
                source_table,
                destination_table: destination_table.clone(),
                old_items: items_from_columns(&change.identity, cached_schema)?,
                new_items: items_from_columns(&change.columns, cached_schema)?,
                unchanged_toast_columns,
            })
        }
        "D" => Record::Delete(DeleteRecord {
            checkpoint_id: lsn,
            commit_time,
            source_table,
            destination_table: destination_table.clone(),
            items: items_from_columns(&change.identity, cached_schema)?,
        }),
        _ => unreachable!(),
    };
    out.records.push(record);
    Ok(true)
}

impl PostgresConnector {
    pub(super) fn slot_name(&self, req_slot: Option<&str>, flow_job_name: &str) -> String {
        req_slot
            .map(str::to_string)
            .unwrap_or_else(|| format!("peerdb_slot_{}", sanitize(flow_job_name)))
    }

    pub(super) fn publication_name(&self, req_pub: Option<&str>, flow_job_name: &str) -> String {
        req_pub
            .map(str::to_string)
            .unwrap_or_else(|| format!("peerdb_pub_{}", sanitize(flow_job_name)))
    }

    pub(super) async fn setup_replication_impl(
        &self,
        signal: SlotSignalWorker,
        req: SetupReplicationInput,
    ) -> ConnectorResult<()> {
        let slot_name = self.slot_name(req.replication_slot_name.as_deref(), &req.flow_job_name);
        let publication = self.publication_name(req.publication_name.as_deref(), &req.flow_job_name);

        let tables: Vec<String> = req
            .table_name_mapping
            .keys()
            .map(|t| super::schema::quote_qualified(t))
            .collect();
        {
            let client = self.client.lock().await;
            let create_pub = format!(
                "CREATE PUBLICATION {} FOR TABLE {}",
                super::schema::quote_ident(&publication),
                tables.join(",")
            );
            if let Err(err) = client.batch_execute(&create_pub).await {
                // an existing publication from a previous attempt is fine
                if err.code() != Some(&tokio_postgres::error::SqlState::DUPLICATE_OBJECT) {
                    return Err(err.into());
                }
            }
        }

        // the snapshot must stay exported until the clone finishes, so it
        // lives on a dedicated connection
        let snapshot_client = connect_simple(&self.config).await?;
        let setup = async {
            snapshot_client
                .batch_execute("BEGIN TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
                .await?;
            let snapshot_row = snapshot_client
                .query_one("SELECT pg_export_snapshot()", &[])
                .await?;
            let snapshot_name: String = snapshot_row.get(0);

            let client = self.client.lock().await;
            client
                .query(
                    "SELECT * FROM pg_create_logical_replication_slot($1, 'wal2json')",
                    &[&slot_name],
                )
                .await?;
            Ok::<String, tokio_postgres::Error>(snapshot_name)
        };

        match setup.await {
            Ok(snapshot_name) => {
                tracing::info!(slot = slot_name, "created replication slot");
                let _ = signal
                    .slot_created
                    .send(SlotCreated {
                        slot_name: slot_name.clone(),
                        snapshot_name,
                        error: None,
                    })
                    .await;
                // hold the snapshot open until the initial copy completes
                let _ = signal.clone_complete.await;
                snapshot_client.batch_execute("COMMIT").await.ok();
                Ok(())
            }
            Err(err) => {
                let _ = signal
                    .slot_created
                    .send(SlotCreated {
                        slot_name,
                        snapshot_name: String::new(),
                        error: Some(err.to_string()),
                    })
                    .await;
                Err(err.into())
            }
        }
    }

    pub(super) async fn pull_flow_cleanup_impl(&self, flow_job_name: &str) -> ConnectorResult<()> {
        let slot_name = self.slot_name(None, flow_job_name);
        let publication = self.publication_name(None, flow_job_name);
        let client = self.client.lock().await;
        client
            .execute(
                "SELECT pg_drop_replication_slot(slot_name)
                 FROM pg_replication_slots WHERE slot_name = $1",
                &[&slot_name],
            )
            .await?;
        client
            .batch_execute(&format!(
                "DROP PUBLICATION IF EXISTS {}",
                super::schema::quote_ident(&publication)
            ))
            .await?;
        Ok(())
    }

    pub(super) async fn pull_records_impl(
        &self,
        req: PullRecordsRequest,
    ) -> ConnectorResult<RecordBatch> {
        let slot_name = self.slot_name(None, &req.flow_job_name);
        let max_batch_size = req.max_batch_size.max(1) as i32;
        let add_tables: String = req
            .table_name_mapping
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(",");

        {
            let client = self.client.lock().await;
            // confirm the previous batch; a failed sync never reaches here,
            // so the same range is re-read on the next cycle
            if let Some(state) = &req.last_sync_state {
                if state.checkpoint > 0 {
                    client
                        .execute(
                            "SELECT pg_replication_slot_advance($1, $2::pg_lsn)",
                            &[&slot_name, &lsn_to_string(state.checkpoint)],
                        )
                        .await?;
                }
            } else {
                let row = client
                    .query_opt(
                        "SELECT confirmed_flush_lsn::text FROM pg_replication_slots
                         WHERE slot_name = $1",
                        &[&slot_name],
                    )
                    .await?;
                if let Some(row) = row {
                    let lsn: String = row.get(0);
                    tracing::info!(slot = slot_name, "resuming from confirmed flush lsn {lsn}");
                }
            }
        }

        let mut out = DecodedBatch {
            records: Vec::new(),
            deltas_by_table: HashMap::new(),
            relation_messages: Vec::new(),
        };
        let mut relation_message_mapping = req.relation_message_mapping.clone();
        let mut first_checkpoint = 0i64;
        let mut last_checkpoint = 0i64;
        let mut rows_decoded = 0usize;
        let mut deadline = Instant::now() + req.idle_timeout;

        while out.records.len() < max_batch_size as usize {
            if self.token.is_cancelled() {
                return Err(ConnectorError::Cancelled);
            }
            if Instant::now() >= deadline {
                break;
            }

            let rows = {
                let client = self.client.lock().await;
                client
                    .query(
                        "SELECT lsn::text, data FROM pg_logical_slot_peek_changes(
                             $1, NULL, $2,
                             'format-version', '2',
                             'include-timestamp', 'true',
                             'add-tables', $3)",
                        &[&slot_name, &max_batch_size, &add_tables],
                    )
                    .await?
            };

            // peek re-reads from the confirmed position, so skip what this
            // pull already decoded
            let fresh = rows.len().saturating_sub(rows_decoded);
            if fresh == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(PULL_POLL_INTERVAL) => continue,
                    _ = self.token.cancelled() => return Err(ConnectorError::Cancelled),
                }
            }

            for row in rows.iter().skip(rows_decoded) {
                let lsn_text: String = row.get(0);
                let data: String = row.get(1);
                let lsn = parse_lsn(&lsn_text).map_err(ConnectorError::Other)?;
                let decoded = decode_change(&req, lsn, &data, &mut out)
                    .map_err(|e| ConnectorError::DataSchema(format!("{e:#}")))?;
                if decoded {
                    if first_checkpoint == 0 {
                        first_checkpoint = lsn;
                    }
                    last_checkpoint = last_checkpoint.max(lsn);
                }
            }
            rows_decoded = rows.len();
            deadline = Instant::now() + req.idle_timeout;
        }

        for relation in out.relation_messages {
            relation_message_mapping.insert(relation);
        }

        Ok(RecordBatch {
            records: out.records,
            first_checkpoint_id: first_checkpoint,
            last_checkpoint_id: last_checkpoint,
            table_schema_deltas: out.deltas_by_table.into_values().collect(),
            relation_message_mapping,
        })
    }
}

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

#[cfg(test)]
mod tests {
    use super::*;
    use pt::flow::RelationMessageMapping;

    fn schema() -> TableSchema {
        TableSchema {
            table_identifier: "public.t".to_string(),
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
                    kind: Kind::Bytes,
                    nullable: true,
                },
            ],
            primary_key_columns: vec!["id".to_string()],
        }
    }

    fn request() -> PullRecordsRequest {
        PullRecordsRequest {
            flow_job_name: "flow1".to_string(),
            last_sync_state: None,
            max_batch_size: 100,
            idle_timeout: Duration::from_secs(10),
            src_table_id_name_mapping: HashMap::from([(16384, "public.t".to_string())]),
            table_name_mapping: HashMap::from([("public.t".to_string(), "dw.t".to_string())]),
            table_name_schema_mapping: HashMap::from([("dw.t".to_string(), schema())]),
            relation_message_mapping: RelationMessageMapping::default(),
        }
    }

    fn empty_batch() -> DecodedBatch {
        DecodedBatch {
            records: Vec::new(),
            deltas_by_table: HashMap::new(),
            relation_messages: Vec::new(),
        }
    }

    #[test]
    fn lsn_round_trips() {
        let lsn = parse_lsn("16/B374D848").unwrap();
        assert_eq!(lsn, (0x16i64 << 32) | 0xB374D848);
        assert_eq!(lsn_to_string(lsn), "16/B374D848");
    }

    #[test]
    fn insert_change_decodes_typed_items() {
        let req = request();
        let mut out = empty_batch();
        let data = r#"{"action":"I","schema":"public","table":"t",
            "timestamp":"2024-01-02 03:04:05.123+00",
            "columns":[{"name":"id","type":"integer","value":1},
                       {"name":"v","type":"text","value":"a"},
                       {"name":"blob","type":"bytea","value":"\\x0001"}]}"#;
        assert!(decode_change(&req, 100, data, &mut out).unwrap());
        let Record::Insert(rec) = &out.records[0] else {
            panic!("expected insert");
        };
        assert_eq!(rec.checkpoint_id, 100);
        assert_eq!(rec.destination_table, "dw.t");
        assert_eq!(rec.items.get("id"), Some(&Value::integer(1)));
        assert_eq!(
            rec.items.get("blob"),
            Some(&Value::binary(vec![0x00, 0x01]))
        );
    }

    #[test]
    fn update_without_toasted_column_marks_it_unchanged() {
        let req = request();
        let mut out = empty_batch();
        let data = r#"{"action":"U","schema":"public","table":"t",
            "columns":[{"name":"id","type":"integer","value":1},
                       {"name":"v","type":"text","value":"b"}],
            "identity":[{"name":"id","type":"integer","value":1}]}"#;
        assert!(decode_change(&req, 200, data, &mut out).unwrap());
        let Record::Update(rec) = &out.records[0] else {
            panic!("expected update");
        };
        assert!(rec.unchanged_toast_columns.contains("blob"));
        assert!(!rec.unchanged_toast_columns.contains("v"));
        assert_eq!(rec.old_items.get("id"), Some(&Value::integer(1)));
    }

    #[test]
    fn new_column_produces_schema_delta_and_relation() {
        let req = request();
        let mut out = empty_batch();
        let data = r#"{"action":"I","schema":"public","table":"t",
            "columns":[{"name":"id","type":"integer","value":2},
                       {"name":"v","type":"text","value":"c"},
                       {"name":"blob","type":"bytea","value":null},
                       {"name":"c","type":"integer","value":7}]}"#;
        assert!(decode_change(&req, 300, data, &mut out).unwrap());
        let delta = out.deltas_by_table.get("public.t").unwrap();
        assert_eq!(delta.dst_table_name, "dw.t");
        assert_eq!(delta.added_columns.len(), 1);
        assert_eq!(delta.added_columns[0].name, "c");
        assert_eq!(delta.added_columns[0].kind, Kind::Int32);
        assert!(delta.added_columns[0].nullable);
        assert_eq!(out.relation_messages[0].relation_id, 16384);
        // relation record plus the insert itself
        assert_eq!(out.records.len(), 2);
    }

    #[test]
    fn transaction_markers_are_skipped() {
        let req = request();
        let mut out = empty_batch();
        assert!(!decode_change(&req, 1, r#"{"action":"B"}"#, &mut out).unwrap());
        assert!(!decode_change(&req, 2, r#"{"action":"C"}"#, &mut out).unwrap());
        assert!(out.records.is_empty());
    }

    #[test]
    fn unmapped_tables_are_ignored() {
        let req = request();
        let mut out = empty_batch();
        let data = r#"{"action":"I","schema":"public","table":"other",
            "columns":[{"name":"id","type":"integer","value":1}]}"#;
        assert!(!decode_change(&req, 5, data, &mut out).unwrap());
    }

    #[test]
    fn decoded_scalar_values_parse_pg_text_formats() {
        let ts = parse_decoded_value(
            &Kind::TimestampTz,
            &serde_json::json!("2024-02-29 23:59:59.5+00"),
        )
        .unwrap();
        assert!(matches!(ts, Value::TimestampWithTimeZone(_)));
        let num =
            parse_decoded_value(&Kind::Numeric, &serde_json::json!("12345.678")).unwrap();
        assert_eq!(num, Value::Numeric(Decimal::from_str("12345.678").unwrap()));
    }
}
