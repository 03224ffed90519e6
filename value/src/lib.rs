use std::fmt;
use std::str::FromStr;

use array::ArrayValue;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod array;

/// Abstract column kind, carried in table schemas from source to sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    Numeric,
    String,
    Bytes,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
    Geometry,
    Geography,
    Array(Box<Kind>),
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Bool => write!(f, "bool"),
            Kind::Int32 => write!(f, "int32"),
            Kind::Int64 => write!(f, "int64"),
            Kind::Float32 => write!(f, "float32"),
            Kind::Float64 => write!(f, "float64"),
            Kind::Numeric => write!(f, "numeric"),
            Kind::String => write!(f, "string"),
            Kind::Bytes => write!(f, "bytes"),
            Kind::Date => write!(f, "date"),
            Kind::Time => write!(f, "time"),
            Kind::Timestamp => write!(f, "timestamp"),
            Kind::TimestampTz => write!(f, "timestamptz"),
            Kind::Uuid => write!(f, "uuid"),
            Kind::Json => write!(f, "json"),
            Kind::Geometry => write!(f, "geometry"),
            Kind::Geography => write!(f, "geography"),
            Kind::Array(inner) => write!(f, "array<{inner}>"),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Numeric(Decimal),
    Text(String),
    Binary(Bytes),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampWithTimeZone(DateTime<Utc>),
    Uuid(Uuid),
    Json(serde_json::Value),
    Geometry(String),
    Geography(String),
    Array(ArrayValue),
}

impl Value {
    pub fn null() -> Self {
        Value::Null
    }

    pub fn bool(value: bool) -> Self {
        Value::Bool(value)
    }

    pub fn integer(value: i32) -> Self {
        Value::Integer(value)
    }

    pub fn big_int(value: i64) -> Self {
        Value::BigInt(value)
    }

    pub fn float(value: f32) -> Self {
        Value::Float(value)
    }

    pub fn double(value: f64) -> Self {
        Value::Double(value)
    }

    pub fn numeric(value: Decimal) -> Self {
        Value::Numeric(value)
    }

    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn binary(value: Vec<u8>) -> Self {
        Value::Binary(Bytes::from(value))
    }

    pub fn date(value: NaiveDate) -> Self {
        Value::Date(value)
    }

    pub fn time(value: NaiveTime) -> Self {
        Value::Time(value)
    }

    pub fn timestamp(value: NaiveDateTime) -> Self {
        Value::Timestamp(value)
    }

    pub fn timestamp_with_time_zone(value: DateTime<Utc>) -> Self {
        Value::TimestampWithTimeZone(value)
    }

    pub fn uuid(value: Uuid) -> Self {
        Value::Uuid(value)
    }

    pub fn json(value: serde_json::Value) -> Self {
        Value::Json(value)
    }

    pub fn array(value: ArrayValue) -> Self {
        Value::Array(value)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind(&self) -> Kind {
        match self {
            Value::Null => Kind::String,
            Value::Bool(_) => Kind::Bool,
            Value::Integer(_) => Kind::Int32,
            Value::BigInt(_) => Kind::Int64,
            Value::Float(_) => Kind::Float32,
            Value::Double(_) => Kind::Float64,
            Value::Numeric(_) => Kind::Numeric,
            Value::Text(_) => Kind::String,
            Value::Binary(_) => Kind::Bytes,
            Value::Date(_) => Kind::Date,
            Value::Time(_) => Kind::Time,
            Value::Timestamp(_) => Kind::Timestamp,
            Value::TimestampWithTimeZone(_) => Kind::TimestampTz,
            Value::Uuid(_) => Kind::Uuid,
            Value::Json(_) => Kind::Json,
            Value::Geometry(_) => Kind::Geometry,
            Value::Geography(_) => Kind::Geography,
            Value::Array(arr) => Kind::Array(Box::new(arr.element_kind())),
        }
    }

    pub fn to_serde_json_value(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(n) => serde_json::Value::Number(serde_json::Number::from(*n)),
            Value::BigInt(n) => serde_json::Value::Number(serde_json::Number::from(*n)),
            Value::Float(n) => serde_json::Number::from_f64(f64::from(*n))
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Double(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Numeric(n) => serde_json::Value::String(n.to_string()),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Binary(b) => serde_json::Value::String(BASE64.encode(b)),
            Value::Date(d) => serde_json::Value::String(d.to_string()),
            Value::Time(t) => serde_json::Value::String(t.to_string()),
            Value::Timestamp(ts) => serde_json::Value::String(ts.and_utc().to_rfc3339()),
            Value::TimestampWithTimeZone(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Value::Uuid(u) => serde_json::Value::String(u.to_string()),
            Value::Json(v) => v.clone(),
            Value::Geometry(wkt) => serde_json::Value::String(wkt.clone()),
            Value::Geography(wkt) => serde_json::Value::String(wkt.clone()),
            Value::Array(arr) => arr.to_serde_json_value(),
        }
    }

    /// Decodes a JSON value into the typed value a column of `kind` holds.
    /// Inverse of [`Value::to_serde_json_value`] for every kind the
    /// raw-table payload can carry.
    pub fn from_serde_json_value(kind: &Kind, value: &serde_json::Value) -> anyhow::Result<Self> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let out = match kind {
            Kind::Bool => Value::Bool(
                value
                    .as_bool()
                    .ok_or_else(|| anyhow::anyhow!("expected bool, got {value}"))?,
            ),
            Kind::Int32 => Value::Integer(
                value
                    .as_i64()
                    .ok_or_else(|| anyhow::anyhow!("expected int32, got {value}"))?
                    as i32,
            ),
            Kind::Int64 => Value::BigInt(
                value
                    .as_i64()
                    .ok_or_else(|| anyhow::anyhow!("expected int64, got {value}"))?,
            ),
            Kind::Float32 => Value::Float(
                value
                    .as_f64()
                    .ok_or_else(|| anyhow::anyhow!("expected float32, got {value}"))?
                    as f32,
            ),
            Kind::Float64 => Value::Double(
                value
                    .as_f64()
                    .ok_or_else(|| anyhow::anyhow!("expected float64, got {value}"))?,
            ),
            Kind::Numeric => {
                let s = json_str(value)?;
                Value::Numeric(Decimal::from_str(s)?)
            }
            Kind::String => Value::Text(json_str(value)?.to_string()),
            Kind::Bytes => Value::Binary(Bytes::from(BASE64.decode(json_str(value)?)?)),
            Kind::Date => Value::Date(NaiveDate::from_str(json_str(value)?)?),
            Kind::Time => Value::Time(NaiveTime::from_str(json_str(value)?)?),
            Kind::Timestamp => {
                let ts = DateTime::parse_from_rfc3339(json_str(value)?)?;
                Value::Timestamp(ts.naive_utc())
            }
            Kind::TimestampTz => {
                let ts = DateTime::parse_from_rfc3339(json_str(value)?)?;
                Value::TimestampWithTimeZone(ts.with_timezone(&Utc))
            }
            Kind::Uuid => Value::Uuid(Uuid::from_str(json_str(value)?)?),
            Kind::Json => Value::Json(value.clone()),
            Kind::Geometry => Value::Geometry(json_str(value)?.to_string()),
            Kind::Geography => Value::Geography(json_str(value)?.to_string()),
            Kind::Array(inner) => {
                let items = value
                    .as_array()
                    .ok_or_else(|| anyhow::anyhow!("expected array, got {value}"))?;
                Value::Array(decode_array(inner, items)?)
            }
        };
        Ok(out)
    }
}

fn json_str(value: &serde_json::Value) -> anyhow::Result<&str> {
    value
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("expected string, got {value}"))
}

fn decode_array(kind: &Kind, items: &[serde_json::Value]) -> anyhow::Result<ArrayValue> {
    if items.is_empty() {
        return Ok(ArrayValue::Empty);
    }
    let arr = match kind {
        Kind::Bool => ArrayValue::Bool(
            items
                .iter()
                .map(|v| v.as_bool().ok_or_else(|| anyhow::anyhow!("expected bool")))
                .collect::<anyhow::Result<_>>()?,
        ),
        Kind::Int32 => ArrayValue::Integer(
            items
                .iter()
                .map(|v| {
                    v.as_i64()
                        .map(|n| n as i32)
                        .ok_or_else(|| anyhow::anyhow!("expected int32"))
                })
                .collect::<anyhow::Result<_>>()?,
        ),
        Kind::Int64 => ArrayValue::BigInt(
            items
                .iter()
                .map(|v| v.as_i64().ok_or_else(|| anyhow::anyhow!("expected int64")))
                .collect::<anyhow::Result<_>>()?,
        ),
        Kind::Float32 => ArrayValue::Float(
            items
                .iter()
                .map(|v| {
                    v.as_f64()
                        .map(|n| n as f32)
                        .ok_or_else(|| anyhow::anyhow!("expected float32"))
                })
                .collect::<anyhow::Result<_>>()?,
        ),
        Kind::Float64 => ArrayValue::Double(
            items
                .iter()
                .map(|v| v.as_f64().ok_or_else(|| anyhow::anyhow!("expected float64")))
                .collect::<anyhow::Result<_>>()?,
        ),
        Kind::Numeric => ArrayValue::Numeric(
            items
                .iter()
                .map(|v| json_str(v).map(str::to_string))
                .collect::<anyhow::Result<_>>()?,
        ),
        Kind::Uuid => ArrayValue::Uuid(
            items
                .iter()
                .map(|v| Ok(Uuid::from_str(json_str(v)?)?))
                .collect::<anyhow::Result<_>>()?,
        ),
        Kind::Date => ArrayValue::Date(
            items
                .iter()
                .map(|v| Ok(NaiveDate::from_str(json_str(v)?)?))
                .collect::<anyhow::Result<_>>()?,
        ),
        Kind::Time => ArrayValue::Time(
            items
                .iter()
                .map(|v| Ok(NaiveTime::from_str(json_str(v)?)?))
                .collect::<anyhow::Result<_>>()?,
        ),
        Kind::Timestamp | Kind::TimestampTz => {
            let parsed = items
                .iter()
                .map(|v| Ok(DateTime::parse_from_rfc3339(json_str(v)?)?.with_timezone(&Utc)))
                .collect::<anyhow::Result<Vec<_>>>()?;
            if matches!(kind, Kind::Timestamp) {
                ArrayValue::Timestamp(parsed)
            } else {
                ArrayValue::TimestampWithTimeZone(parsed)
            }
        }
        _ => ArrayValue::Text(
            items
                .iter()
                .map(|v| json_str(v).map(str::to_string))
                .collect::<anyhow::Result<_>>()?,
        ),
    };
    Ok(arr)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match serde_json::to_string(&self.to_serde_json_value()) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "<unrepresentable value>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_kinds_round_trip_through_json() {
        let values = vec![
            Value::Bool(true),
            Value::Integer(42),
            Value::BigInt(1 << 40),
            Value::Double(2.5),
            Value::Numeric(Decimal::from_str("1234.5678").unwrap()),
            Value::Text("hello".to_string()),
            Value::Binary(Bytes::from_static(b"\x00\x01\x02")),
            Value::Uuid(Uuid::from_u128(7)),
            Value::Json(serde_json::json!({"a": 1})),
            Value::Geometry("POINT(1 2)".to_string()),
        ];
        for v in values {
            let kind = v.kind();
            let json = v.to_serde_json_value();
            let back = Value::from_serde_json_value(&kind, &json).unwrap();
            assert_eq!(v, back, "kind {kind}");
        }
    }

    #[test]
    fn timestamps_round_trip() {
        let ts = DateTime::parse_from_rfc3339("2024-02-29T12:34:56Z")
            .unwrap()
            .with_timezone(&Utc);
        let v = Value::TimestampWithTimeZone(ts);
        let back = Value::from_serde_json_value(&Kind::TimestampTz, &v.to_serde_json_value());
        assert_eq!(v, back.unwrap());
    }

    #[test]
    fn null_decodes_for_every_kind() {
        let v = Value::from_serde_json_value(&Kind::Int64, &serde_json::Value::Null).unwrap();
        assert!(v.is_null());
    }

    #[test]
    fn arrays_round_trip() {
        let v = Value::Array(ArrayValue::Integer(vec![1, 2, 3]));
        let kind = v.kind();
        let back = Value::from_serde_json_value(&kind, &v.to_serde_json_value()).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn empty_array_encodes_as_empty_json_array() {
        let v = Value::Array(ArrayValue::Empty);
        assert_eq!(v.to_serde_json_value(), serde_json::json!([]));
    }
}
