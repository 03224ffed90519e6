use std::error::Error;

use bytes::BytesMut;
use tokio_postgres::types::{IsNull, ToSql, Type};
use value::{array::ArrayValue, Value};

/// Borrow wrapper so typed values can ride as query parameters. Encoding
/// delegates to the driver's native impls; the target column type decides
/// the wire format.
#[derive(Debug)]
pub struct PgValue<'a>(pub &'a Value);

impl ToSql for PgValue<'_> {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql(ty, out),
            Value::Integer(n) => n.to_sql(ty, out),
            Value::BigInt(n) => n.to_sql(ty, out),
            Value::Float(n) => n.to_sql(ty, out),
            Value::Double(n) => n.to_sql(ty, out),
            Value::Numeric(d) => d.to_sql(ty, out),
            Value::Text(s) => s.to_sql(ty, out),
            Value::Binary(b) => {
                let bytes: &[u8] = b;
                bytes.to_sql(ty, out)
            }
            Value::Date(d) => d.to_sql(ty, out),
            Value::Time(t) => t.to_sql(ty, out),
            Value::Timestamp(ts) => ts.to_sql(ty, out),
            Value::TimestampWithTimeZone(ts) => ts.to_sql(ty, out),
            Value::Uuid(u) => u.to_sql(ty, out),
            Value::Json(j) => j.to_sql(ty, out),
            Value::Geometry(s) | Value::Geography(s) => s.to_sql(ty, out),
            Value::Array(arr) => match arr {
                ArrayValue::Empty => Ok(IsNull::Yes),
                ArrayValue::Bool(v) => v.to_sql(ty, out),
                ArrayValue::Integer(v) => v.to_sql(ty, out),
                ArrayValue::BigInt(v) => v.to_sql(ty, out),
                ArrayValue::Float(v) => v.to_sql(ty, out),
                ArrayValue::Double(v) => v.to_sql(ty, out),
                ArrayValue::Numeric(v) => v.to_sql(ty, out),
                ArrayValue::Text(v) => v.to_sql(ty, out),
                ArrayValue::Uuid(v) => v.to_sql(ty, out),
                ArrayValue::Date(v) => v.to_sql(ty, out),
                ArrayValue::Time(v) => v.to_sql(ty, out),
                ArrayValue::Timestamp(v) => v.to_sql(ty, out),
                ArrayValue::TimestampWithTimeZone(v) => v.to_sql(ty, out),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn to_sql_checked(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        self.to_sql(ty, out)
    }
}
