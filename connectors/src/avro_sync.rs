use std::path::{Path, PathBuf};

use anyhow::Context;
use apache_avro::types::Value as AvroValue;
use apache_avro::{Codec, Reader, Schema, Writer};
use model::{QRecord, QRecordSchema, QRecordStream};
use value::{Kind, Value};

pub struct AvroFile {
    pub num_records: usize,
    pub file_path: PathBuf,
}

/// Derives the Avro schema for one destination table. Every field is a
/// `["null", T]` union so nullability never fails a write.
pub fn avro_schema_for(dst_table_name: &str, schema: &QRecordSchema) -> anyhow::Result<Schema> {
    let record_name: String = dst_table_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();

    let fields: Vec<serde_json::Value> = schema
        .fields
        .iter()
        .map(|f| {
            serde_json::json!({
                "name": f.name,
                "type": ["null", avro_type_for(&f.kind)],
                "default": null,
            })
        })
        .collect();

    let schema_json = serde_json::json!({
        "type": "record",
        "name": record_name,
        "fields": fields,
    });

    Schema::parse(&schema_json).context("failed to define Avro schema")
}

fn avro_type_for(kind: &Kind) -> serde_json::Value {
    match kind {
        Kind::Bool => "boolean".into(),
        Kind::Int32 => "int".into(),
        Kind::Int64 => "long".into(),
        Kind::Float32 => "float".into(),
        Kind::Float64 => "double".into(),
        Kind::Bytes => "bytes".into(),
        // decimals, temporal kinds, uuids and json all travel as strings;
        // the sink's ingest path re-types them from the record schema
        Kind::Numeric
        | Kind::String
        | Kind::Date
        | Kind::Time
        | Kind::Timestamp
        | Kind::TimestampTz
        | Kind::Uuid
        | Kind::Json
        | Kind::Geometry
        | Kind::Geography => "string".into(),
        Kind::Array(inner) => serde_json::json!({
            "type": "array",
            "items": avro_type_for(inner),
        }),
    }
}

fn avro_value_for(value: &Value) -> AvroValue {
    match value {
        Value::Null => AvroValue::Union(0, Box::new(AvroValue::Null)),
        other => AvroValue::Union(1, Box::new(plain_avro_value(other))),
    }
}

fn plain_avro_value(value: &Value) -> AvroValue {
    match value {
        Value::Null => AvroValue::Null,
        Value::Bool(b) => AvroValue::Boolean(*b),
        Value::Integer(n) => AvroValue::Int(*n),
        Value::BigInt(n) => AvroValue::Long(*n),
        Value::Float(n) => AvroValue::Float(*n),
        Value::Double(n) => AvroValue::Double(*n),
        Value::Binary(b) => AvroValue::Bytes(b.to_vec()),
        Value::Array(_) | Value::Json(_) => match value.to_serde_json_value() {
            serde_json::Value::Array(items) => AvroValue::Array(
                items
                    .into_iter()
                    .map(|v| json_scalar_to_avro(&v))
                    .collect(),
            ),
            other => AvroValue::String(other.to_string()),
        },
        other => match other.to_serde_json_value() {
            serde_json::Value::String(s) => AvroValue::String(s),
            json => AvroValue::String(json.to_string()),
        },
    }
}

fn json_scalar_to_avro(value: &serde_json::Value) -> AvroValue {
    match value {
        serde_json::Value::Bool(b) => AvroValue::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AvroValue::Long(i)
            } else {
                AvroValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => AvroValue::String(s.clone()),
        other => AvroValue::String(other.to_string()),
    }
}

/// Staging object path: `{prefix}/{flow_job_name}/{partition_id}.avro.zst`.
pub fn staging_file_path(prefix: &Path, flow_job_name: &str, partition_id: &str) -> PathBuf {
    prefix
        .join(flow_job_name)
        .join(format!("{partition_id}.avro.zst"))
}

/// Spools a record stream into a Zstandard-compressed Avro OCF file at the
/// staging path, consuming the stream.
pub async fn write_records_to_avro_file(
    mut stream: QRecordStream,
    avro_schema: &Schema,
    staging_prefix: &Path,
    flow_job_name: &str,
    partition_id: &str,
) -> anyhow::Result<AvroFile> {
    let file_path = staging_file_path(staging_prefix, flow_job_name, partition_id);
    if let Some(parent) = file_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("failed to create staging directory")?;
    }

    let schema = stream.schema().clone();
    let mut writer = Writer::with_codec(avro_schema, Vec::new(), Codec::Zstandard);
    let mut num_records = 0usize;

    while let Some(record) = stream.next_record().await {
        let fields: Vec<(String, AvroValue)> = schema
            .fields
            .iter()
            .zip(record.values.iter())
            .map(|(field, v)| (field.name.clone(), avro_value_for(v)))
            .collect();
        writer
            .append(AvroValue::Record(fields))
            .context("failed to append record to Avro file")?;
        num_records += 1;
    }

    let encoded = writer.into_inner().context("failed to finish Avro file")?;
    tokio::fs::write(&file_path, encoded)
        .await
        .with_context(|| format!("failed to write {}", file_path.display()))?;

    Ok(AvroFile {
        num_records,
        file_path,
    })
}

/// Reads a staged Avro file back into typed records using the record
/// schema that produced it. This is the ingest half of the staging
/// contract for sinks without a native Avro reader.
pub fn read_avro_file(path: &Path, schema: &QRecordSchema) -> anyhow::Result<Vec<QRecord>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open staged file {}", path.display()))?;
    let reader = Reader::new(file).context("failed to open Avro reader")?;

    let mut records = Vec::new();
    for row in reader {
        let row = row.context("failed to decode Avro record")?;
        let AvroValue::Record(fields) = row else {
            anyhow::bail!("staged file does not contain records");
        };
        let mut values = Vec::with_capacity(schema.fields.len());
        for (field, (_, avro_value)) in schema.fields.iter().zip(fields) {
            values.push(typed_value_from_avro(&field.kind, avro_value)?);
        }
        records.push(QRecord { values });
    }
    Ok(records)
}

fn typed_value_from_avro(kind: &Kind, avro_value: AvroValue) -> anyhow::Result<Value> {
    let inner = match avro_value {
        AvroValue::Union(_, boxed) => *boxed,
        other => other,
    };
    let out = match inner {
        AvroValue::Null => Value::Null,
        AvroValue::Boolean(b) => Value::Bool(b),
        AvroValue::Int(n) => Value::Integer(n),
        AvroValue::Long(n) => Value::BigInt(n),
        AvroValue::Float(n) => Value::Float(n),
        AvroValue::Double(n) => Value::Double(n),
        AvroValue::Bytes(b) => Value::Binary(bytes::Bytes::from(b)),
        AvroValue::String(s) => {
            Value::from_serde_json_value(kind, &serde_json::Value::String(s))?
        }
        AvroValue::Array(items) => {
            let json = serde_json::Value::Array(
                items.into_iter().map(avro_scalar_to_json).collect(),
            );
            Value::from_serde_json_value(kind, &json)?
        }
        other => anyhow::bail!("unexpected Avro value {other:?} for kind {kind}"),
    };
    Ok(out)
}

fn avro_scalar_to_json(value: AvroValue) -> serde_json::Value {
    match value {
        AvroValue::Boolean(b) => serde_json::Value::Bool(b),
        AvroValue::Int(n) => serde_json::Value::Number(n.into()),
        AvroValue::Long(n) => serde_json::Value::Number(n.into()),
        AvroValue::Float(n) => serde_json::Number::from_f64(f64::from(n))
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        AvroValue::Double(n) => serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        AvroValue::String(s) => serde_json::Value::String(s),
        other => serde_json::Value::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::QRecordBatch;
    use pt::flow::ColumnDescriptor;

    fn schema() -> QRecordSchema {
        QRecordSchema {
            fields: vec![
                ColumnDescriptor {
                    name: "id".to_string(),
                    kind: Kind::Int64,
                    nullable: false,
                },
                ColumnDescriptor {
                    name: "v".to_string(),
                    kind: Kind::String,
                    nullable: true,
                },
            ],
        }
    }

    #[tokio::test]
    async fn staged_file_round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let schema = schema();
        let batch = QRecordBatch {
            schema: schema.clone(),
            records: vec![
                QRecord {
                    values: vec![Value::big_int(1), Value::text("a")],
                },
                QRecord {
                    values: vec![Value::big_int(2), Value::Null],
                },
            ],
        };

        let avro_schema = avro_schema_for("dw.orders", &schema).unwrap();
        let file = write_records_to_avro_file(
            batch.into_stream(1024),
            &avro_schema,
            dir.path(),
            "flow1",
            "part-0001",
        )
        .await
        .unwrap();

        assert_eq!(file.num_records, 2);
        assert!(file
            .file_path
            .to_string_lossy()
            .ends_with("flow1/part-0001.avro.zst"));

        let rows = read_avro_file(&file.file_path, &schema).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].values[0], Value::big_int(1));
        assert_eq!(rows[0].values[1], Value::text("a"));
        assert!(rows[1].values[1].is_null());
    }

    #[test]
    fn schema_names_are_sanitized() {
        let s = avro_schema_for("dw.orders-2024", &schema()).unwrap();
        let canonical = s.canonical_form();
        assert!(canonical.contains("dw_orders_2024"), "got: {canonical}");
    }
}
