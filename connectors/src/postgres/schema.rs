use pt::flow::{ColumnDescriptor, TableSchema};
use tokio_postgres::types::Type;
use tokio_postgres::Client;
use value::Kind;

use crate::{ConnectorError, ConnectorResult};

/// Quotes one identifier part.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quotes a possibly schema-qualified identifier.
pub fn quote_qualified(name: &str) -> String {
    name.split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

pub fn split_qualified(name: &str) -> (&str, &str) {
    match name.split_once('.') {
        Some((schema, table)) => (schema, table),
        None => ("public", name),
    }
}

/// Maps a `pg_type.typname` (information_schema `udt_name`) to the
/// abstract kind. Array types arrive with a leading underscore.
pub fn kind_from_udt(udt_name: &str) -> Kind {
    if let Some(element) = udt_name.strip_prefix('_') {
        return Kind::Array(Box::new(kind_from_udt(element)));
    }
    match udt_name {
        "bool" => Kind::Bool,
        "int2" | "int4" => Kind::Int32,
        "int8" => Kind::Int64,
        "float4" => Kind::Float32,
        "float8" => Kind::Float64,
        "numeric" => Kind::Numeric,
        "bytea" => Kind::Bytes,
        "date" => Kind::Date,
        "time" | "timetz" => Kind::Time,
        "timestamp" => Kind::Timestamp,
        "timestamptz" => Kind::TimestampTz,
        "uuid" => Kind::Uuid,
        "json" | "jsonb" => Kind::Json,
        "geometry" => Kind::Geometry,
        "geography" => Kind::Geography,
        _ => Kind::String,
    }
}

/// Maps a driver-level column type to the abstract kind (query results).
pub fn kind_from_pg_type(ty: &Type) -> Kind {
    match *ty {
        Type::BOOL => Kind::Bool,
        Type::INT2 | Type::INT4 => Kind::Int32,
        Type::INT8 => Kind::Int64,
        Type::FLOAT4 => Kind::Float32,
        Type::FLOAT8 => Kind::Float64,
        Type::NUMERIC => Kind::Numeric,
        Type::BYTEA => Kind::Bytes,
        Type::DATE => Kind::Date,
        Type::TIME | Type::TIMETZ => Kind::Time,
        Type::TIMESTAMP => Kind::Timestamp,
        Type::TIMESTAMPTZ => Kind::TimestampTz,
        Type::UUID => Kind::Uuid,
        Type::JSON | Type::JSONB => Kind::Json,
        Type::BOOL_ARRAY => Kind::Array(Box::new(Kind::Bool)),
        Type::INT2_ARRAY | Type::INT4_ARRAY => Kind::Array(Box::new(Kind::Int32)),
        Type::INT8_ARRAY => Kind::Array(Box::new(Kind::Int64)),
        Type::FLOAT4_ARRAY => Kind::Array(Box::new(Kind::Float32)),
        Type::FLOAT8_ARRAY => Kind::Array(Box::new(Kind::Float64)),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => Kind::Array(Box::new(Kind::String)),
        _ => Kind::String,
    }
}

/// DDL type for one abstract kind.
pub fn pg_type_for(kind: &Kind) -> String {
    match kind {
        Kind::Bool => "BOOLEAN".to_string(),
        Kind::Int32 => "INTEGER".to_string(),
        Kind::Int64 => "BIGINT".to_string(),
        Kind::Float32 => "REAL".to_string(),
        Kind::Float64 => "DOUBLE PRECISION".to_string(),
        Kind::Numeric => "NUMERIC".to_string(),
        Kind::String => "TEXT".to_string(),
        Kind::Bytes => "BYTEA".to_string(),
        Kind::Date => "DATE".to_string(),
        Kind::Time => "TIME".to_string(),
        Kind::Timestamp => "TIMESTAMP".to_string(),
        Kind::TimestampTz => "TIMESTAMPTZ".to_string(),
        Kind::Uuid => "UUID".to_string(),
        Kind::Json => "JSONB".to_string(),
        // kept as text so the sink does not require a GIS extension
        Kind::Geometry | Kind::Geography => "TEXT".to_string(),
        Kind::Array(inner) => format!("{}[]", pg_type_for(inner)),
    }
}

pub fn create_normalized_table_ddl(table_identifier: &str, schema: &TableSchema) -> String {
    let mut columns: Vec<String> = schema
        .columns
        .iter()
        .map(|c| {
            let mut col = format!("{} {}", quote_ident(&c.name), pg_type_for(&c.kind));
            if !c.nullable && schema.primary_key_columns.contains(&c.name) {
                col.push_str(" NOT NULL");
            }
            col
        })
        .collect();
    if !schema.primary_key_columns.is_empty() {
        columns.push(format!(
            "PRIMARY KEY ({})",
            schema
                .primary_key_columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(",")
        ));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_qualified(table_identifier),
        columns.join(",")
    )
}

pub async fn fetch_table_schema(
    client: &Client,
    table_identifier: &str,
) -> ConnectorResult<TableSchema> {
    let (schema_name, table_name) = split_qualified(table_identifier);

    let column_rows = client
        .query(
            "SELECT column_name, udt_name, is_nullable
             FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = $2
             ORDER BY ordinal_position",
            &[&schema_name, &table_name],
        )
        .await?;

    if column_rows.is_empty() {
        return Err(ConnectorError::Fatal(format!(
            "table {table_identifier} does not exist on the source"
        )));
    }

    let columns = column_rows
        .iter()
        .map(|row| {
            let name: String = row.get(0);
            let udt: String = row.get(1);
            let is_nullable: String = row.get(2);
            ColumnDescriptor {
                name,
                kind: kind_from_udt(&udt),
                nullable: is_nullable == "YES",
            }
        })
        .collect();

    let pk_rows = client
        .query(
            "SELECT a.attname
             FROM pg_index i
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
             WHERE i.indrelid = $1::regclass AND i.indisprimary
             ORDER BY a.attnum",
            &[&table_identifier],
        )
        .await?;

    Ok(TableSchema {
        table_identifier: table_identifier.to_string(),
        columns,
        primary_key_columns: pk_rows.iter().map(|row| row.get(0)).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udt_names_map_to_kinds() {
        assert_eq!(kind_from_udt("int4"), Kind::Int32);
        assert_eq!(kind_from_udt("timestamptz"), Kind::TimestampTz);
        assert_eq!(kind_from_udt("_int8"), Kind::Array(Box::new(Kind::Int64)));
        assert_eq!(kind_from_udt("customtype"), Kind::String);
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_qualified("dw.orders"), "\"dw\".\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(split_qualified("orders"), ("public", "orders"));
    }

    #[test]
    fn ddl_includes_primary_key_and_types() {
        let schema = TableSchema {
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
            ],
            primary_key_columns: vec!["id".to_string()],
        };
        let ddl = create_normalized_table_ddl("dw.t", &schema);
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS \"dw\".\"t\" \
             (\"id\" INTEGER NOT NULL,\"v\" TEXT,PRIMARY KEY (\"id\"))"
        );
    }
}
