use std::path::PathBuf;

use chrono::{DateTime, Utc};
use futures::StreamExt as _;
use model::{QRecord, QRecordBatch, QRecordSchema, QRecordStream};
use pt::flow::ColumnDescriptor;
use pt::qrep::{PartitionRange, QRepConfig, QRepPartition, QRepWriteType};
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use uuid::Uuid;
use value::{Kind, Value};

use super::pg_value::PgValue;
use super::schema::{kind_from_pg_type, quote_ident, quote_qualified};
use super::PostgresConnector;
use crate::avro_sync;
use crate::{ConnectorError, ConnectorResult};

/// Splits `[min, max]` into equal-width inclusive ranges sized so that
/// `total_rows / rows_per_partition` chunks cover the interval.
pub fn plan_int_partitions(
    min: i64,
    max: i64,
    total_rows: u64,
    rows_per_partition: u32,
) -> Vec<(i64, i64)> {
    if total_rows == 0 || max < min {
        return Vec::new();
    }
    let num_partitions = if rows_per_partition == 0 {
        1
    } else {
        total_rows.div_ceil(rows_per_partition as u64)
    }
    .max(1);
    let span = (max - min + 1) as u64;
    let width = span.div_ceil(num_partitions).max(1);

    let mut ranges = Vec::new();
    let mut start = min;
    while start <= max {
        let end = (start as i128 + width as i128 - 1).min(max as i128) as i64;
        ranges.push((start, end));
        start = match end.checked_add(1) {
            Some(next) => next,
            None => break,
        };
    }
    ranges
}

/// Substitutes the partition bounds into the extraction query. The query
/// uses `{{.start}}` / `{{.end}}` placeholders.
pub fn render_partition_query(
    query: &str,
    watermark_table: &str,
    watermark_column: &str,
    partition: &QRepPartition,
) -> String {
    let base = if query.trim().is_empty() {
        if partition.full_table_partition || partition.range.is_none() {
            format!("SELECT * FROM {}", quote_qualified(watermark_table))
        } else {
            format!(
                "SELECT * FROM {} WHERE {} BETWEEN {{{{.start}}}} AND {{{{.end}}}}",
                quote_qualified(watermark_table),
                quote_ident(watermark_column),
            )
        }
    } else {
        query.to_string()
    };

    match &partition.range {
        None => base,
        Some(PartitionRange::Int { start, end }) => base
            .replace("{{.start}}", &start.to_string())
            .replace("{{.end}}", &end.to_string()),
        Some(PartitionRange::Timestamp { start, end }) => base
            .replace(
                "{{.start}}",
                &format!("'{}'::timestamptz", start.to_rfc3339()),
            )
            .replace("{{.end}}", &format!("'{}'::timestamptz", end.to_rfc3339())),
    }
}

fn value_from_row(row: &Row, i: usize) -> ConnectorResult<Value> {
    use tokio_postgres::types::Type;
    let col_type = row.columns()[i].type_();
    let v = match *col_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(i)?
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(i)?
            .map(|n| Value::Integer(n as i32))
            .unwrap_or(Value::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(i)?
            .map(Value::Integer)
            .unwrap_or(Value::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(i)?
            .map(Value::BigInt)
            .unwrap_or(Value::Null),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(i)?
            .map(Value::Float)
            .unwrap_or(Value::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(i)?
            .map(Value::Double)
            .unwrap_or(Value::Null),
        Type::NUMERIC => row
            .try_get::<_, Option<rust_decimal::Decimal>>(i)?
            .map(Value::Numeric)
            .unwrap_or(Value::Null),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(i)?
            .map(Value::binary)
            .unwrap_or(Value::Null),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(i)?
            .map(Value::Date)
            .unwrap_or(Value::Null),
        Type::TIME => row
            .try_get::<_, Option<chrono::NaiveTime>>(i)?
            .map(Value::Time)
            .unwrap_or(Value::Null),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(i)?
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(i)?
            .map(Value::TimestampWithTimeZone)
            .unwrap_or(Value::Null),
        Type::UUID => row
            .try_get::<_, Option<Uuid>>(i)?
            .map(Value::Uuid)
            .unwrap_or(Value::Null),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(i)?
            .map(Value::Json)
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<_, Option<String>>(i)?
            .map(Value::Text)
            .unwrap_or(Value::Null),
    };
    Ok(v)
}

impl PostgresConnector {
    fn qrep_metadata_table(&self) -> String {
        format!("{}.qrep_partitions", quote_ident(&self.metadata_schema()))
    }

    pub(super) async fn setup_qrep_metadata_tables_impl(
        &self,
        _config: &QRepConfig,
    ) -> ConnectorResult<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {schema};
                 CREATE TABLE IF NOT EXISTS {table} (
                     flow_job_name TEXT NOT NULL,
                     partition_id TEXT NOT NULL,
                     sync_partition JSONB NOT NULL,
                     sync_start_time TIMESTAMPTZ NOT NULL,
                     sync_finish_time TIMESTAMPTZ NOT NULL,
                     rows_in_partition BIGINT NOT NULL,
                     PRIMARY KEY (flow_job_name, partition_id)
                 )",
                schema = quote_ident(&self.metadata_schema()),
                table = self.qrep_metadata_table(),
            ))
            .await?;
        Ok(())
    }

    pub(super) async fn get_qrep_partitions_impl(
        &self,
        config: &QRepConfig,
        last: &QRepPartition,
    ) -> ConnectorResult<Vec<QRepPartition>> {
        let watermark_kind = {
            let client = self.client.lock().await;
            super::schema::fetch_table_schema(&client, &config.watermark_table)
                .await?
                .column(&config.watermark_column)
                .map(|c| c.kind.clone())
                .ok_or_else(|| {
                    ConnectorError::Fatal(format!(
                        "watermark column {} not found on {}",
                        config.watermark_column, config.watermark_table
                    ))
                })?
        };

        let table = quote_qualified(&config.watermark_table);
        let wm = quote_ident(&config.watermark_column);

        match watermark_kind {
            Kind::Int32 | Kind::Int64 => {
                let lower = match &last.range {
                    Some(PartitionRange::Int { end, .. }) => Some(*end),
                    _ => None,
                };
                let predicate = lower
                    .map(|end| format!("WHERE {wm} > {end}"))
                    .unwrap_or_default();
                let row = {
                    let client = self.client.lock().await;
                    client
                        .query_one(
                            &format!(
                                "SELECT MIN({wm})::bigint, MAX({wm})::bigint, COUNT(*)
                                 FROM {table} {predicate}"
                            ),
                            &[],
                        )
                        .await?
                };
                let min: Option<i64> = row.get(0);
                let max: Option<i64> = row.get(1);
                let count: i64 = row.get(2);
                let (Some(min), Some(max)) = (min, max) else {
                    return Ok(Vec::new());
                };
                Ok(plan_int_partitions(
                    min,
                    max,
                    count as u64,
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
            Kind::Timestamp | Kind::TimestampTz => {
                let lower = match &last.range {
                    Some(PartitionRange::Timestamp { end, .. }) => Some(*end),
                    _ => None,
                };
                let predicate = lower
                    .map(|end| format!("WHERE {wm} > '{}'::timestamptz", end.to_rfc3339()))
                    .unwrap_or_default();
                let row = {
                    let client = self.client.lock().await;
                    client
                        .query_one(
                            &format!(
                                "SELECT MIN({wm})::timestamptz, MAX({wm})::timestamptz, COUNT(*)
                                 FROM {table} {predicate}"
                            ),
                            &[],
                        )
                        .await?
                };
                let min: Option<DateTime<Utc>> = row.get(0);
                let max: Option<DateTime<Utc>> = row.get(1);
                let count: i64 = row.get(2);
                let (Some(min), Some(max)) = (min, max) else {
                    return Ok(Vec::new());
                };
                let ranges = plan_int_partitions(
                    min.timestamp_micros(),
                    max.timestamp_micros(),
                    count as u64,
                    config.num_rows_per_partition,
                );
                Ok(ranges
                    .into_iter()
                    .map(|(start, end)| QRepPartition {
                        partition_id: Uuid::new_v4().to_string(),
                        range: Some(PartitionRange::Timestamp {
                            start: DateTime::from_timestamp_micros(start).unwrap_or(min),
                            end: DateTime::from_timestamp_micros(end).unwrap_or(max),
                        }),
                        full_table_partition: false,
                    })
                    .collect())
            }
            other => Err(ConnectorError::DataSchema(format!(
                "unsupported watermark column kind {other}"
            ))),
        }
    }

    pub(super) async fn pull_qrep_records_impl(
        &self,
        config: &QRepConfig,
        partition: &QRepPartition,
    ) -> ConnectorResult<QRecordBatch> {
        let query = render_partition_query(
            &config.query,
            &config.watermark_table,
            &config.watermark_column,
            partition,
        );
        tracing::info!(
            flow = config.flow_job_name,
            partition = partition.partition_id,
            "pulling qrep partition"
        );

        let client = self.client.lock().await;
        // a snapshot pins every partition of an initial copy to one
        // consistent view of the source
        if let Some(snapshot) = &config.snapshot_name {
            client
                .batch_execute(&format!(
                    "BEGIN TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY;
                     SET TRANSACTION SNAPSHOT '{}'",
                    snapshot.replace('\'', "''")
                ))
                .await?;
        }

        let statement = client.prepare(&query).await?;
        let fields: Vec<ColumnDescriptor> = statement
            .columns()
            .iter()
            .map(|col| ColumnDescriptor {
                name: col.name().to_string(),
                kind: kind_from_pg_type(col.type_()),
                nullable: true,
            })
            .collect();

        let rows = client.query(&statement, &[]).await?;
        if config.snapshot_name.is_some() {
            client.batch_execute("COMMIT").await?;
        }

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(fields.len());
            for i in 0..fields.len() {
                values.push(value_from_row(row, i)?);
            }
            records.push(QRecord { values });
        }

        Ok(QRecordBatch {
            schema: QRecordSchema { fields },
            records,
        })
    }

    pub(super) async fn sync_qrep_records_impl(
        &self,
        config: &QRepConfig,
        partition: &QRepPartition,
        mut stream: QRecordStream,
    ) -> ConnectorResult<u64> {
        let sync_start = Utc::now();
        let metadata_table = self.qrep_metadata_table();

        {
            let client = self.client.lock().await;
            let done = client
                .query_opt(
                    &format!(
                        "SELECT 1 FROM {metadata_table}
                         WHERE flow_job_name = $1 AND partition_id = $2"
                    ),
                    &[&config.flow_job_name, &partition.partition_id],
                )
                .await?;
            if done.is_some() {
                tracing::info!(
                    flow = config.flow_job_name,
                    partition = partition.partition_id,
                    "partition already synced, skipping"
                );
                return Ok(0);
            }
        }

        let schema = stream.schema().clone();

        // stage through Avro when a staging path is configured, otherwise
        // stream rows straight into the destination
        let records: Vec<QRecord> = if let Some(staging) = &config.staging_path {
            let avro_schema =
                avro_sync::avro_schema_for(&config.destination_table_identifier, &schema)
                    .map_err(ConnectorError::Other)?;
            let staged = avro_sync::write_records_to_avro_file(
                stream,
                &avro_schema,
                &PathBuf::from(staging),
                &config.flow_job_name,
                &partition.partition_id,
            )
            .await
            .map_err(ConnectorError::Other)?;
            tracing::info!(
                flow = config.flow_job_name,
                "staged {} records at {}",
                staged.num_records,
                staged.file_path.display()
            );
            avro_sync::read_avro_file(&staged.file_path, &schema).map_err(ConnectorError::Other)?
        } else {
            let mut collected = Vec::new();
            while let Some(record) = stream.next().await {
                collected.push(record);
            }
            collected
        };

        let dst = quote_qualified(&config.destination_table_identifier);
        let columns: Vec<String> = schema.fields.iter().map(|f| quote_ident(&f.name)).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
        let upsert_keys = config
            .write_mode
            .as_ref()
            .filter(|m| m.write_type == QRepWriteType::Upsert)
            .map(|m| m.upsert_key_columns.clone())
            .unwrap_or_default();
        let insert_sql = if upsert_keys.is_empty() {
            format!(
                "INSERT INTO {dst} ({}) VALUES ({})",
                columns.join(","),
                placeholders.join(","),
            )
        } else {
            let updates: Vec<String> = schema
                .fields
                .iter()
                .filter(|f| !upsert_keys.contains(&f.name))
                .map(|f| format!("{col} = EXCLUDED.{col}", col = quote_ident(&f.name)))
                .collect();
            format!(
                "INSERT INTO {dst} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
                columns.join(","),
                placeholders.join(","),
                upsert_keys
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(","),
                updates.join(","),
            )
        };

        let mut client = self.client.lock().await;
        let txn = client.transaction().await?;
        let statement = txn.prepare(&insert_sql).await?;
        let mut rows_synced = 0u64;
        for record in &records {
            let params: Vec<PgValue> = record.values.iter().map(PgValue).collect();
            let param_refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
            txn.execute(&statement, &param_refs).await?;
            rows_synced += 1;
        }

        // the metadata row commits atomically with the rows, which is what
        // makes a re-apply a no-op
        let sync_partition =
            serde_json::to_value(partition).map_err(|e| ConnectorError::Other(e.into()))?;
        txn.execute(
            &format!(
                "INSERT INTO {metadata_table}
                     (flow_job_name, partition_id, sync_partition,
                      sync_start_time, sync_finish_time, rows_in_partition)
                 VALUES ($1, $2, $3, $4, now(), $5)"
            ),
            &[
                &config.flow_job_name,
                &partition.partition_id,
                &sync_partition,
                &sync_start,
                &(rows_synced as i64),
            ],
        )
        .await?;
        txn.commit().await?;

        tracing::info!(
            flow = config.flow_job_name,
            partition = partition.partition_id,
            "pushed {rows_synced} records"
        );
        Ok(rows_synced)
    }

    pub(super) async fn cleanup_qrep_flow_impl(&self, config: &QRepConfig) -> ConnectorResult<()> {
        let client = self.client.lock().await;
        client
            .execute(
                &format!(
                    "DELETE FROM {} WHERE flow_job_name = $1",
                    self.qrep_metadata_table()
                ),
                &[&config.flow_job_name],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn million_rows_in_hundred_thousand_chunks_is_ten_partitions() {
        let ranges = plan_int_partitions(1, 1_000_000, 1_000_000, 100_000);
        assert_eq!(ranges.len(), 10);
        assert_eq!(ranges[0], (1, 100_000));
        assert_eq!(ranges[9], (900_001, 1_000_000));
        // contiguous and non-overlapping
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }
    }

    #[test]
    fn zero_rows_plans_nothing() {
        assert!(plan_int_partitions(0, -1, 0, 1000).is_empty());
    }

    #[test]
    fn rows_per_partition_zero_means_one_partition() {
        let ranges = plan_int_partitions(5, 500, 496, 0);
        assert_eq!(ranges, vec![(5, 500)]);
    }

    #[test]
    fn render_substitutes_int_bounds() {
        let partition = QRepPartition {
            partition_id: "p".to_string(),
            range: Some(PartitionRange::Int { start: 10, end: 19 }),
            full_table_partition: false,
        };
        let q = render_partition_query(
            "SELECT * FROM public.big WHERE id BETWEEN {{.start}} AND {{.end}}",
            "public.big",
            "id",
            &partition,
        );
        assert_eq!(q, "SELECT * FROM public.big WHERE id BETWEEN 10 AND 19");
    }

    #[test]
    fn render_defaults_to_watermark_query() {
        let partition = QRepPartition {
            partition_id: "p".to_string(),
            range: Some(PartitionRange::Int { start: 1, end: 5 }),
            full_table_partition: false,
        };
        let q = render_partition_query("", "public.big", "id", &partition);
        assert_eq!(
            q,
            "SELECT * FROM \"public\".\"big\" WHERE \"id\" BETWEEN 1 AND 5"
        );
    }

    #[test]
    fn render_full_table_has_no_predicate() {
        let partition = QRepPartition::full_table("p".to_string());
        let q = render_partition_query("", "public.big", "id", &partition);
        assert_eq!(q, "SELECT * FROM \"public\".\"big\"");
    }
}
