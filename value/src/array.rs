use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use uuid::Uuid;

use crate::Kind;

#[derive(Debug, PartialEq, Clone)]
pub enum ArrayValue {
    Empty,
    Bool(Vec<bool>),
    Integer(Vec<i32>),
    BigInt(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Numeric(Vec<String>),
    Text(Vec<String>),
    Uuid(Vec<Uuid>),
    Date(Vec<NaiveDate>),
    Time(Vec<NaiveTime>),
    Timestamp(Vec<DateTime<Utc>>),
    TimestampWithTimeZone(Vec<DateTime<Utc>>),
}

impl ArrayValue {
    pub fn element_kind(&self) -> Kind {
        match self {
            ArrayValue::Empty => Kind::String,
            ArrayValue::Bool(_) => Kind::Bool,
            ArrayValue::Integer(_) => Kind::Int32,
            ArrayValue::BigInt(_) => Kind::Int64,
            ArrayValue::Float(_) => Kind::Float32,
            ArrayValue::Double(_) => Kind::Float64,
            ArrayValue::Numeric(_) => Kind::Numeric,
            ArrayValue::Text(_) => Kind::String,
            ArrayValue::Uuid(_) => Kind::Uuid,
            ArrayValue::Date(_) => Kind::Date,
            ArrayValue::Time(_) => Kind::Time,
            ArrayValue::Timestamp(_) => Kind::Timestamp,
            ArrayValue::TimestampWithTimeZone(_) => Kind::TimestampTz,
        }
    }

    pub fn to_serde_json_value(&self) -> serde_json::Value {
        match self {
            ArrayValue::Empty => serde_json::Value::Array(Vec::new()),
            ArrayValue::Bool(arr) => {
                serde_json::Value::Array(arr.iter().map(|&v| serde_json::Value::Bool(v)).collect())
            }
            ArrayValue::Integer(arr) => serde_json::Value::Array(
                arr.iter()
                    .map(|&v| serde_json::Value::Number(v.into()))
                    .collect(),
            ),
            ArrayValue::BigInt(arr) => serde_json::Value::Array(
                arr.iter()
                    .map(|&v| serde_json::Value::Number(v.into()))
                    .collect(),
            ),
            ArrayValue::Float(arr) => serde_json::Value::Array(
                arr.iter()
                    .map(|&v| {
                        serde_json::Number::from_f64(f64::from(v))
                            .map(serde_json::Value::Number)
                            .unwrap_or(serde_json::Value::Null)
                    })
                    .collect(),
            ),
            ArrayValue::Double(arr) => serde_json::Value::Array(
                arr.iter()
                    .map(|&v| {
                        serde_json::Number::from_f64(v)
                            .map(serde_json::Value::Number)
                            .unwrap_or(serde_json::Value::Null)
                    })
                    .collect(),
            ),
            ArrayValue::Numeric(arr) => serde_json::Value::Array(
                arr.iter()
                    .map(|v| serde_json::Value::String(v.clone()))
                    .collect(),
            ),
            ArrayValue::Text(arr) => serde_json::Value::Array(
                arr.iter()
                    .map(|v| serde_json::Value::String(v.clone()))
                    .collect(),
            ),
            ArrayValue::Uuid(arr) => serde_json::Value::Array(
                arr.iter()
                    .map(|v| serde_json::Value::String(v.to_string()))
                    .collect(),
            ),
            ArrayValue::Date(arr) => serde_json::Value::Array(
                arr.iter()
                    .map(|&v| serde_json::Value::String(v.to_string()))
                    .collect(),
            ),
            ArrayValue::Time(arr) => serde_json::Value::Array(
                arr.iter()
                    .map(|&v| serde_json::Value::String(v.to_string()))
                    .collect(),
            ),
            ArrayValue::Timestamp(arr) => serde_json::Value::Array(
                arr.iter()
                    .map(|&v| serde_json::Value::String(v.to_rfc3339()))
                    .collect(),
            ),
            ArrayValue::TimestampWithTimeZone(arr) => serde_json::Value::Array(
                arr.iter()
                    .map(|&v| serde_json::Value::String(v.to_rfc3339()))
                    .collect(),
            ),
        }
    }
}
