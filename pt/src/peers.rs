use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    Postgres,
    Bigquery,
    Snowflake,
    Clickhouse,
    S3,
    Eventhub,
    Kafka,
    /// In-process peer used for tests and local development.
    Memory,
}

impl DbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::Postgres => "postgres",
            DbType::Bigquery => "bigquery",
            DbType::Snowflake => "snowflake",
            DbType::Clickhouse => "clickhouse",
            DbType::S3 => "s3",
            DbType::Eventhub => "eventhub",
            DbType::Kafka => "kafka",
            DbType::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default)]
    pub metadata_schema: Option<String>,
}

/// Event-style sink (event hub / kafka alike). The core only consumes the
/// batching seam, so the config carries routing and batch sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHubConfig {
    pub namespace: String,
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    #[serde(default)]
    pub partition_count: u32,
}

fn default_max_batch_bytes() -> usize {
    1024 * 1024
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Config {
    Postgres(PostgresConfig),
    Eventhub(EventHubConfig),
    Memory(MemoryConfig),
}

impl Config {
    pub fn db_type(&self) -> DbType {
        match self {
            Config::Postgres(_) => DbType::Postgres,
            Config::Eventhub(_) => DbType::Eventhub,
            Config::Memory(_) => DbType::Memory,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub r#type: DbType,
    pub config: Config,
}

impl Peer {
    pub fn postgres(name: impl Into<String>, config: PostgresConfig) -> Self {
        Self {
            name: name.into(),
            r#type: DbType::Postgres,
            config: Config::Postgres(config),
        }
    }

    pub fn memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            r#type: DbType::Memory,
            config: Config::Memory(MemoryConfig::default()),
        }
    }
}
