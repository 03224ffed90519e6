use std::collections::HashMap;

use async_trait::async_trait;
use model::{
    CreateRawTableInput, EnsurePullabilityInput, EnsurePullabilityOutput, NormalizeRecordsRequest,
    NormalizeResponse, PullRecordsRequest, QRecordBatch, QRecordStream, RecordBatch,
    SetupNormalizedTableOutput, SetupReplicationInput, SyncRecordsRequest, SyncResponse,
};
use pt::flow::{LastSyncState, RenameTablesInput, TableSchema};
use pt::peers::PostgresConfig;
use pt::qrep::{QRepConfig, QRepPartition};
use tokio::sync::Mutex;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;

use crate::{Connector, ConnectorError, ConnectorResult, SlotSignalWorker};

mod cdc;
mod pg_value;
mod qrep;
pub mod schema;
mod sink;

pub use cdc::{kind_from_decoded_type, lsn_to_string, parse_decoded_value, parse_lsn};
pub use qrep::{plan_int_partitions, render_partition_query};

const DEFAULT_METADATA_SCHEMA: &str = "peerdb_internal";

pub(crate) fn pg_connection_string(config: &PostgresConfig) -> String {
    format!(
        "host={} port={} user={} password={} dbname={} application_name=peerdb_flow connect_timeout=15",
        config.host, config.port, config.user, config.password, config.database
    )
}

pub(crate) async fn connect_simple(config: &PostgresConfig) -> ConnectorResult<Client> {
    let (client, connection) =
        tokio_postgres::connect(&pg_connection_string(config), tokio_postgres::NoTls)
            .await
            .map_err(|e| ConnectorError::Transient(e.into()))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::info!("connection error: {}", e);
        }
    });
    Ok(client)
}

/// Postgres peer: CDC source via a wal2json logical slot, reference sink
/// with raw landing table and per-key normalize, and both QRep halves.
pub struct PostgresConnector {
    peer_name: String,
    pub(crate) config: PostgresConfig,
    pub(crate) client: Mutex<Client>,
    pub(crate) token: CancellationToken,
    pub(crate) table_schema_mapping: Mutex<HashMap<String, TableSchema>>,
}

impl PostgresConnector {
    pub async fn new(
        token: CancellationToken,
        peer_name: &str,
        config: &PostgresConfig,
    ) -> ConnectorResult<Self> {
        let client = connect_simple(config).await?;
        Ok(Self {
            peer_name: peer_name.to_string(),
            config: config.clone(),
            client: Mutex::new(client),
            token,
            table_schema_mapping: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn metadata_schema(&self) -> String {
        self.config
            .metadata_schema
            .clone()
            .unwrap_or_else(|| DEFAULT_METADATA_SCHEMA.to_string())
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    fn peer_name(&self) -> &str {
        &self.peer_name
    }

    async fn connection_active(&self) -> ConnectorResult<()> {
        let client = self.client.lock().await;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| ConnectorError::Transient(e.into()))?;
        Ok(())
    }

    async fn needs_setup_metadata_tables(&self) -> ConnectorResult<bool> {
        self.needs_setup_metadata_tables_impl().await
    }

    async fn setup_metadata_tables(&self) -> ConnectorResult<()> {
        self.setup_metadata_tables_impl().await
    }

    async fn get_last_offset(&self, flow_job_name: &str) -> ConnectorResult<Option<LastSyncState>> {
        self.get_last_offset_impl(flow_job_name).await
    }

    async fn ensure_pullability(
        &self,
        req: &EnsurePullabilityInput,
    ) -> ConnectorResult<EnsurePullabilityOutput> {
        let client = self.client.lock().await;
        let mut mapping = HashMap::new();
        for table in &req.source_table_identifiers {
            let row = client
                .query_opt("SELECT $1::regclass::oid", &[table])
                .await?
                .ok_or_else(|| {
                    ConnectorError::Fatal(format!("table {table} does not exist on the source"))
                })?;
            let oid: u32 = row.get(0);
            mapping.insert(oid, table.clone());
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
        self.setup_replication_impl(signal, req).await
    }

    async fn pull_flow_cleanup(&self, flow_job_name: &str) -> ConnectorResult<()> {
        self.pull_flow_cleanup_impl(flow_job_name).await
    }

    async fn pull_records(&self, req: PullRecordsRequest) -> ConnectorResult<RecordBatch> {
        self.pull_records_impl(req).await
    }

    async fn send_wal_heartbeat(&self) -> ConnectorResult<()> {
        let client = self.client.lock().await;
        client
            .execute(
                "SELECT pg_logical_emit_message(false, 'peerdb_heartbeat', now()::text)",
                &[],
            )
            .await?;
        Ok(())
    }

    async fn get_table_schema(
        &self,
        table_identifiers: &[String],
    ) -> ConnectorResult<Vec<TableSchema>> {
        let client = self.client.lock().await;
        let mut schemas = Vec::with_capacity(table_identifiers.len());
        for table in table_identifiers {
            schemas.push(schema::fetch_table_schema(&client, table).await?);
        }
        Ok(schemas)
    }

    async fn initialize_table_schema(
        &self,
        mapping: HashMap<String, TableSchema>,
    ) -> ConnectorResult<()> {
        self.initialize_table_schema_impl(mapping).await
    }

    async fn create_raw_table(&self, req: &CreateRawTableInput) -> ConnectorResult<String> {
        self.create_raw_table_impl(req).await
    }

    async fn setup_normalized_table(
        &self,
        table_identifier: &str,
        schema: &TableSchema,
    ) -> ConnectorResult<SetupNormalizedTableOutput> {
        self.setup_normalized_table_impl(table_identifier, schema)
            .await
    }

    async fn sync_records(&self, req: SyncRecordsRequest) -> ConnectorResult<SyncResponse> {
        self.sync_records_impl(req).await
    }

    async fn normalize_records(
        &self,
        req: NormalizeRecordsRequest,
    ) -> ConnectorResult<NormalizeResponse> {
        self.normalize_records_impl(req).await
    }

    async fn rename_tables(&self, req: &RenameTablesInput) -> ConnectorResult<()> {
        self.rename_tables_impl(req).await
    }

    async fn sync_flow_cleanup(&self, flow_job_name: &str) -> ConnectorResult<()> {
        self.sync_flow_cleanup_impl(flow_job_name).await
    }

    async fn setup_qrep_metadata_tables(&self, config: &QRepConfig) -> ConnectorResult<()> {
        self.setup_qrep_metadata_tables_impl(config).await
    }

    async fn get_qrep_partitions(
        &self,
        config: &QRepConfig,
        last: &QRepPartition,
    ) -> ConnectorResult<Vec<QRepPartition>> {
        self.get_qrep_partitions_impl(config, last).await
    }

    async fn pull_qrep_records(
        &self,
        config: &QRepConfig,
        partition: &QRepPartition,
    ) -> ConnectorResult<QRecordBatch> {
        self.pull_qrep_records_impl(config, partition).await
    }

    async fn sync_qrep_records(
        &self,
        config: &QRepConfig,
        partition: &QRepPartition,
        stream: QRecordStream,
    ) -> ConnectorResult<u64> {
        self.sync_qrep_records_impl(config, partition, stream).await
    }

    async fn consolidate_qrep_partitions(&self, _config: &QRepConfig) -> ConnectorResult<()> {
        // rows are written to the destination table directly
        Ok(())
    }

    async fn cleanup_qrep_flow(&self, config: &QRepConfig) -> ConnectorResult<()> {
        self.cleanup_qrep_flow_impl(config).await
    }
}
