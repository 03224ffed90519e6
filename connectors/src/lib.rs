use std::collections::HashMap;

use async_trait::async_trait;
use model::{
    CreateRawTableInput, EnsurePullabilityInput, EnsurePullabilityOutput, NormalizeRecordsRequest,
    NormalizeResponse, PullRecordsRequest, QRecordBatch, QRecordStream, RecordBatch,
    SetupNormalizedTableOutput, SetupReplicationInput, SyncRecordsRequest, SyncResponse,
};
use pt::flow::{LastSyncState, RenameTablesInput, TableSchema};
use pt::peers::{Config, Peer};
use pt::qrep::{QRepConfig, QRepPartition};
use tokio_util::sync::CancellationToken;

pub mod avro_sync;
pub mod error;
pub mod events;
pub mod eventhub;
pub mod memory;
pub mod postgres;
mod slot;

pub use error::{ConnectorError, ConnectorResult};
pub use slot::{slot_signal, SlotCreated, SlotSignalHandle, SlotSignalWorker};

/// A scoped handle to one peer. Constructed from a peer descriptor and a
/// cancellation token; `close` releases every network and file handle.
/// Capabilities a peer kind does not implement fail with
/// [`ConnectorError::Unsupported`].
#[async_trait]
pub trait Connector: Send + Sync {
    fn peer_name(&self) -> &str;

    async fn connection_active(&self) -> ConnectorResult<()>;

    async fn close(&self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn needs_setup_metadata_tables(&self) -> ConnectorResult<bool> {
        Err(ConnectorError::Unsupported("needs_setup_metadata_tables"))
    }

    async fn setup_metadata_tables(&self) -> ConnectorResult<()> {
        Err(ConnectorError::Unsupported("setup_metadata_tables"))
    }

    async fn get_last_offset(&self, _flow_job_name: &str) -> ConnectorResult<Option<LastSyncState>> {
        Err(ConnectorError::Unsupported("get_last_offset"))
    }

    // ---- source-only capabilities ----

    async fn ensure_pullability(
        &self,
        _req: &EnsurePullabilityInput,
    ) -> ConnectorResult<EnsurePullabilityOutput> {
        Err(ConnectorError::Unsupported("ensure_pullability"))
    }

    /// Creates the replication slot and exports a consistent snapshot,
    /// handing both through `signal`, then blocks until the snapshot
    /// consumer reports completion.
    async fn setup_replication(
        &self,
        _signal: SlotSignalWorker,
        _req: SetupReplicationInput,
    ) -> ConnectorResult<()> {
        Err(ConnectorError::Unsupported("setup_replication"))
    }

    async fn pull_flow_cleanup(&self, _flow_job_name: &str) -> ConnectorResult<()> {
        Err(ConnectorError::Unsupported("pull_flow_cleanup"))
    }

    async fn pull_records(&self, _req: PullRecordsRequest) -> ConnectorResult<RecordBatch> {
        Err(ConnectorError::Unsupported("pull_records"))
    }

    /// Nudges the WAL forward so idle replication slots do not pin it.
    async fn send_wal_heartbeat(&self) -> ConnectorResult<()> {
        Err(ConnectorError::Unsupported("send_wal_heartbeat"))
    }

    async fn get_table_schema(
        &self,
        _table_identifiers: &[String],
    ) -> ConnectorResult<Vec<TableSchema>> {
        Err(ConnectorError::Unsupported("get_table_schema"))
    }

    // ---- sink-only capabilities ----

    async fn initialize_table_schema(
        &self,
        _mapping: HashMap<String, TableSchema>,
    ) -> ConnectorResult<()> {
        Err(ConnectorError::Unsupported("initialize_table_schema"))
    }

    async fn create_raw_table(&self, _req: &CreateRawTableInput) -> ConnectorResult<String> {
        Err(ConnectorError::Unsupported("create_raw_table"))
    }

    async fn setup_normalized_table(
        &self,
        _table_identifier: &str,
        _schema: &TableSchema,
    ) -> ConnectorResult<SetupNormalizedTableOutput> {
        Err(ConnectorError::Unsupported("setup_normalized_table"))
    }

    async fn sync_records(&self, _req: SyncRecordsRequest) -> ConnectorResult<SyncResponse> {
        Err(ConnectorError::Unsupported("sync_records"))
    }

    async fn normalize_records(
        &self,
        _req: NormalizeRecordsRequest,
    ) -> ConnectorResult<NormalizeResponse> {
        Err(ConnectorError::Unsupported("normalize_records"))
    }

    async fn rename_tables(&self, _req: &RenameTablesInput) -> ConnectorResult<()> {
        Err(ConnectorError::Unsupported("rename_tables"))
    }

    async fn sync_flow_cleanup(&self, _flow_job_name: &str) -> ConnectorResult<()> {
        Err(ConnectorError::Unsupported("sync_flow_cleanup"))
    }

    // ---- qrep capabilities ----

    async fn setup_qrep_metadata_tables(&self, _config: &QRepConfig) -> ConnectorResult<()> {
        Err(ConnectorError::Unsupported("setup_qrep_metadata_tables"))
    }

    async fn get_qrep_partitions(
        &self,
        _config: &QRepConfig,
        _last: &QRepPartition,
    ) -> ConnectorResult<Vec<QRepPartition>> {
        Err(ConnectorError::Unsupported("get_qrep_partitions"))
    }

    async fn pull_qrep_records(
        &self,
        _config: &QRepConfig,
        _partition: &QRepPartition,
    ) -> ConnectorResult<QRecordBatch> {
        Err(ConnectorError::Unsupported("pull_qrep_records"))
    }

    async fn sync_qrep_records(
        &self,
        _config: &QRepConfig,
        _partition: &QRepPartition,
        _stream: QRecordStream,
    ) -> ConnectorResult<u64> {
        Err(ConnectorError::Unsupported("sync_qrep_records"))
    }

    async fn consolidate_qrep_partitions(&self, _config: &QRepConfig) -> ConnectorResult<()> {
        Err(ConnectorError::Unsupported("consolidate_qrep_partitions"))
    }

    async fn cleanup_qrep_flow(&self, _config: &QRepConfig) -> ConnectorResult<()> {
        Err(ConnectorError::Unsupported("cleanup_qrep_flow"))
    }
}

/// Maps a peer descriptor to a connector. The registry is read-only after
/// init: adding a peer kind means adding a match arm.
pub async fn get_connector(
    token: CancellationToken,
    peer: &Peer,
) -> ConnectorResult<Box<dyn Connector>> {
    match &peer.config {
        Config::Postgres(config) => Ok(Box::new(
            postgres::PostgresConnector::new(token, &peer.name, config).await?,
        )),
        Config::Eventhub(config) => Ok(Box::new(eventhub::EventHubConnector::new(
            token, &peer.name, config,
        ))),
        Config::Memory(_) => Ok(Box::new(memory::MemoryConnector::new(token, &peer.name))),
    }
}

/// Best-effort close, mirrored on every activity exit path.
pub async fn close_connector(connector: Box<dyn Connector>) {
    if let Err(err) = connector.close().await {
        tracing::warn!(peer = connector.peer_name(), "failed to close connector: {err:#}");
    }
}
