use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use connectors::{
    close_connector, get_connector, slot_signal, Connector, ConnectorError, SlotCreated,
};
use model::{
    CreateRawTableInput, EnsurePullabilityInput, EnsurePullabilityOutput, NormalizeRecordsRequest,
    NormalizeResponse, PullRecordsRequest, SetupNormalizedTableOutput, SetupReplicationInput,
    SetupReplicationOutput, SyncRecordsRequest, SyncResponse,
};
use pt::flow::{
    FlowConnectionConfigs, LastSyncState, RenameTablesInput, SyncFlowOptions, TableSchema,
};
use pt::peers::{DbType, Peer};
use pt::qrep::{QRepConfig, QRepPartition};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::heartbeat::{record_heartbeat, HeartbeatRoutine, DEFAULT_HEARTBEAT_INTERVAL};

const QREP_STREAM_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct CheckConnectionResult {
    pub needs_setup_metadata_tables: bool,
}

#[derive(Debug, Clone)]
pub struct StartFlowInput {
    pub flow_connection_configs: FlowConnectionConfigs,
    pub last_sync_state: Option<LastSyncState>,
    pub sync_flow_options: SyncFlowOptions,
    pub relation_message_mapping: pt::flow::RelationMessageMapping,
    pub idle_timeout: Duration,
}

struct SlotSnapshotEntry {
    slot_name: String,
    snapshot_name: String,
    clone_complete: oneshot::Sender<()>,
    worker: tokio::task::JoinHandle<()>,
}

/// Activity adapters bridging workflow steps to connector calls. Each
/// activity acquires its connectors at entry and releases them on every
/// exit path.
pub struct FlowableActivity {
    catalog: Option<Arc<catalog::Catalog>>,
    snapshot_connections: std::sync::Mutex<HashMap<String, SlotSnapshotEntry>>,
}

impl FlowableActivity {
    pub fn new(catalog: Option<Arc<catalog::Catalog>>) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            snapshot_connections: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub async fn check_connection(
        &self,
        token: CancellationToken,
        peer: &Peer,
    ) -> anyhow::Result<CheckConnectionResult> {
        let conn = get_connector(token, peer).await?;
        let result = async {
            conn.connection_active().await?;
            match conn.needs_setup_metadata_tables().await {
                Ok(needs) => Ok(needs),
                Err(ConnectorError::Unsupported(_)) => Ok(false),
                Err(err) => Err(err),
            }
        }
        .await;
        close_connector(conn).await;
        Ok(CheckConnectionResult {
            needs_setup_metadata_tables: result?,
        })
    }

    pub async fn setup_metadata_tables(
        &self,
        token: CancellationToken,
        peer: &Peer,
    ) -> anyhow::Result<()> {
        let conn = get_connector(token, peer).await?;
        let result = conn.setup_metadata_tables().await;
        close_connector(conn).await;
        result.map_err(Into::into)
    }

    pub async fn get_last_synced_id(
        &self,
        token: CancellationToken,
        peer: &Peer,
        flow_job_name: &str,
    ) -> anyhow::Result<Option<LastSyncState>> {
        let conn = get_connector(token, peer).await?;
        let result = conn.get_last_offset(flow_job_name).await;
        close_connector(conn).await;
        result.map_err(Into::into)
    }

    pub async fn ensure_pullability(
        &self,
        token: CancellationToken,
        peer: &Peer,
        input: &EnsurePullabilityInput,
    ) -> anyhow::Result<EnsurePullabilityOutput> {
        let conn = get_connector(token, peer).await?;
        let result = conn.ensure_pullability(input).await;
        close_connector(conn).await;
        result.map_err(Into::into)
    }

    /// Validates that replication can be set up at all: creates a slot
    /// through the regular handshake, then tears everything down.
    pub async fn check_replication(
        &self,
        token: CancellationToken,
        cfg: &FlowConnectionConfigs,
    ) -> anyhow::Result<()> {
        if cfg.source.r#type != DbType::Postgres {
            tracing::info!(
                "check replication is a no-op for {}",
                cfg.source.r#type.as_str()
            );
            return Ok(());
        }
        let conn = get_connector(token, &cfg.source).await?;
        let (mut handle, worker) = slot_signal();
        let input = SetupReplicationInput {
            flow_job_name: cfg.flow_job_name.clone(),
            table_name_mapping: cfg.table_name_mapping(),
            do_initial_copy: false,
            publication_name: cfg.publication_name.clone(),
            replication_slot_name: cfg.replication_slot_name.clone(),
        };
        let result = async {
            let setup = conn.setup_replication(worker, input);
            tokio::pin!(setup);
            let created: Option<SlotCreated> = tokio::select! {
                created = handle.slot_created.recv() => created,
                res = &mut setup => {
                    res?;
                    None
                }
            };
            if let Some(created) = created {
                if let Some(err) = created.error {
                    anyhow::bail!("slot error: {err}");
                }
                let _ = handle.clone_complete.send(());
                setup.await?;
            }
            Ok(())
        }
        .await;
        let cleanup = conn.pull_flow_cleanup(&cfg.flow_job_name).await;
        close_connector(conn).await;
        result?;
        cleanup.map_err(Into::into)
    }

    /// Spawns the replication-setup worker, blocks until the slot and
    /// exported snapshot exist, and parks the handshake so the snapshot
    /// stays open until `close_slot_keep_alive`.
    pub async fn setup_replication(
        &self,
        token: CancellationToken,
        peer: &Peer,
        input: SetupReplicationInput,
    ) -> anyhow::Result<SetupReplicationOutput> {
        if peer.r#type != DbType::Postgres && peer.r#type != DbType::Memory {
            tracing::info!("setup replication is a no-op for {}", peer.r#type.as_str());
            return Ok(SetupReplicationOutput::default());
        }

        let conn = get_connector(token, peer).await?;
        let (mut handle, worker) = slot_signal();
        let flow_job_name = input.flow_job_name.clone();

        let worker_task = tokio::spawn(async move {
            if let Err(err) = conn.setup_replication(worker, input).await {
                tracing::error!("failed to setup replication: {err:#}");
            }
            close_connector(conn).await;
        });

        tracing::info!("waiting for slot to be created...");
        let created = handle
            .slot_created
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("replication setup ended without creating a slot"))?;
        if let Some(err) = created.error {
            anyhow::bail!("slot error: {err}");
        }
        tracing::info!(slot = created.slot_name, "slot created");

        let mut connections = self
            .snapshot_connections
            .lock()
            .expect("snapshot connection registry poisoned");
        connections.insert(
            flow_job_name,
            SlotSnapshotEntry {
                slot_name: created.slot_name.clone(),
                snapshot_name: created.snapshot_name.clone(),
                clone_complete: handle.clone_complete,
                worker: worker_task,
            },
        );

        Ok(SetupReplicationOutput {
            slot_name: created.slot_name,
            snapshot_name: created.snapshot_name,
        })
    }

    /// Signals clone completion and releases the parked replication
    /// connection.
    pub async fn close_slot_keep_alive(&self, flow_job_name: &str) -> anyhow::Result<()> {
        let entry = {
            let mut connections = self
                .snapshot_connections
                .lock()
                .expect("snapshot connection registry poisoned");
            connections.remove(flow_job_name)
        };
        if let Some(entry) = entry {
            tracing::info!(slot = entry.slot_name, "releasing snapshot hold");
            let _ = entry.clone_complete.send(());
            let _ = entry.worker.await;
        }
        Ok(())
    }

    pub fn snapshot_name_for(&self, flow_job_name: &str) -> Option<String> {
        self.snapshot_connections
            .lock()
            .ok()?
            .get(flow_job_name)
            .map(|entry| entry.snapshot_name.clone())
    }

    pub async fn create_raw_table(
        &self,
        token: CancellationToken,
        peer: &Peer,
        input: &CreateRawTableInput,
    ) -> anyhow::Result<String> {
        let conn = get_connector(token, peer).await?;
        let result = conn.create_raw_table(input).await;
        close_connector(conn).await;
        result.map_err(Into::into)
    }

    pub async fn get_table_schema(
        &self,
        token: CancellationToken,
        peer: &Peer,
        table_identifiers: &[String],
    ) -> anyhow::Result<Vec<TableSchema>> {
        let conn = get_connector(token, peer).await?;
        let result = conn.get_table_schema(table_identifiers).await;
        close_connector(conn).await;
        result.map_err(Into::into)
    }

    pub async fn setup_normalized_table(
        &self,
        token: CancellationToken,
        peer: &Peer,
        table_identifier: &str,
        schema: &TableSchema,
    ) -> anyhow::Result<SetupNormalizedTableOutput> {
        let conn = get_connector(token, peer).await?;
        let result = conn.setup_normalized_table(table_identifier, schema).await;
        close_connector(conn).await;
        result.map_err(Into::into)
    }

    /// One CDC cycle: initialize sink schema, pull a bounded batch from
    /// the source, and stage it into the sink's raw table. Returns None
    /// when the pull came back empty (a no-op cycle).
    pub async fn start_flow(
        &self,
        token: CancellationToken,
        input: StartFlowInput,
    ) -> anyhow::Result<Option<SyncResponse>> {
        let cfg = &input.flow_connection_configs;

        let src = get_connector(token.clone(), &cfg.source).await?;
        let dst = match get_connector(token.clone(), &cfg.destination).await {
            Ok(dst) => dst,
            Err(err) => {
                close_connector(src).await;
                return Err(err.into());
            }
        };

        let result = self
            .start_flow_inner(token, &input, src.as_ref(), dst.as_ref())
            .await;
        close_connector(src).await;
        close_connector(dst).await;
        result
    }

    async fn start_flow_inner(
        &self,
        _token: CancellationToken,
        input: &StartFlowInput,
        src: &dyn Connector,
        dst: &dyn Connector,
    ) -> anyhow::Result<Option<SyncResponse>> {
        let cfg = &input.flow_connection_configs;

        tracing::info!(flow = cfg.flow_job_name, "initializing table schema...");
        dst.initialize_table_schema(cfg.table_name_schema_mapping.clone())
            .await?;

        let last_sync_state = match input.last_sync_state {
            Some(state) => Some(state),
            None => dst.get_last_offset(&cfg.flow_job_name).await?,
        };

        let _heartbeat = HeartbeatRoutine::start("start_flow", DEFAULT_HEARTBEAT_INTERVAL, {
            let flow = cfg.flow_job_name.clone();
            move || format!("pulling records for {flow}")
        });

        tracing::info!(flow = cfg.flow_job_name, "pulling records...");
        let records = src
            .pull_records(PullRecordsRequest {
                flow_job_name: cfg.flow_job_name.clone(),
                last_sync_state,
                max_batch_size: input.sync_flow_options.batch_size,
                idle_timeout: input.idle_timeout,
                src_table_id_name_mapping: cfg.src_table_id_name_mapping.clone(),
                table_name_mapping: cfg.table_name_mapping(),
                table_name_schema_mapping: cfg.table_name_schema_mapping.clone(),
                relation_message_mapping: input.relation_message_mapping.clone(),
            })
            .await?;

        let num_records = records.len();
        tracing::info!(flow = cfg.flow_job_name, "pulled {num_records} records");
        if num_records == 0 {
            record_heartbeat("start_flow", "no records to push");
            return Ok(None);
        }

        let script = match (&cfg.script, &self.catalog) {
            (Some(name), Some(catalog)) => catalog.get_script(name).await?,
            _ => None,
        };

        let response = dst
            .sync_records(SyncRecordsRequest {
                flow_job_name: cfg.flow_job_name.clone(),
                records,
                staging_path: cfg.snapshot_staging_path.clone(),
                script,
            })
            .await?;
        tracing::info!(flow = cfg.flow_job_name, "pushed records");
        Ok(Some(response))
    }

    /// Merges staged raw rows into the normalized tables. A sink without
    /// a normalize step (queue sinks) degrades to a no-op.
    pub async fn start_normalize(
        &self,
        token: CancellationToken,
        cfg: &FlowConnectionConfigs,
    ) -> anyhow::Result<NormalizeResponse> {
        let dst = get_connector(token, &cfg.destination).await?;
        let result: anyhow::Result<NormalizeResponse> = async {
            dst.initialize_table_schema(cfg.table_name_schema_mapping.clone())
                .await?;
            match dst
                .normalize_records(NormalizeRecordsRequest {
                    flow_job_name: cfg.flow_job_name.clone(),
                })
                .await
            {
                Ok(response) => Ok(response),
                Err(ConnectorError::Unsupported(capability)) => {
                    tracing::info!(
                        flow = cfg.flow_job_name,
                        "{capability} is a no-op for this peer"
                    );
                    Ok(NormalizeResponse::default())
                }
                Err(err) => Err(err.into()),
            }
        }
        .await;
        close_connector(dst).await;
        let response: NormalizeResponse = result?;
        if response.done {
            tracing::info!(
                flow = cfg.flow_job_name,
                "normalized records from batch {} to batch {}",
                response.start_batch_id,
                response.end_batch_id
            );
        }
        Ok(response)
    }

    pub async fn rename_tables(
        &self,
        token: CancellationToken,
        input: &RenameTablesInput,
    ) -> anyhow::Result<()> {
        let conn = get_connector(token, &input.peer).await?;
        let _heartbeat = HeartbeatRoutine::start("rename_tables", DEFAULT_HEARTBEAT_INTERVAL, {
            let flow = input.flow_job_name.clone();
            move || format!("renaming tables for {flow}")
        });
        let result = conn.rename_tables(input).await;
        close_connector(conn).await;
        result.map_err(Into::into)
    }

    /// Keeps idle WAL slots moving between sync waves.
    pub async fn send_wal_heartbeat(
        &self,
        token: CancellationToken,
        cfg: &FlowConnectionConfigs,
    ) -> anyhow::Result<()> {
        let conn = get_connector(token, &cfg.source).await?;
        let result = match conn.send_wal_heartbeat().await {
            Ok(()) => Ok(()),
            Err(ConnectorError::Unsupported(_)) => {
                tracing::info!("wal heartbeat is a no-op for {}", cfg.source.r#type.as_str());
                Ok(())
            }
            Err(err) => Err(err.into()),
        };
        close_connector(conn).await;
        result
    }

    pub async fn setup_qrep_metadata_tables(
        &self,
        token: CancellationToken,
        config: &QRepConfig,
    ) -> anyhow::Result<()> {
        let conn = get_connector(token, &config.destination_peer).await?;
        let result = conn.setup_qrep_metadata_tables(config).await;
        close_connector(conn).await;
        result.map_err(Into::into)
    }

    pub async fn get_qrep_partitions(
        &self,
        token: CancellationToken,
        config: &QRepConfig,
        last: &QRepPartition,
    ) -> anyhow::Result<Vec<QRepPartition>> {
        let conn = get_connector(token, &config.source_peer).await?;
        let result = conn.get_qrep_partitions(config, last).await;
        close_connector(conn).await;
        result.map_err(Into::into)
    }

    /// Extracts one partition from the source and applies it to the sink
    /// through the buffered record stream.
    pub async fn replicate_qrep_partition(
        &self,
        token: CancellationToken,
        config: &QRepConfig,
        partition: &QRepPartition,
    ) -> anyhow::Result<u64> {
        let src = get_connector(token.clone(), &config.source_peer).await?;
        let dst = match get_connector(token, &config.destination_peer).await {
            Ok(dst) => dst,
            Err(err) => {
                close_connector(src).await;
                return Err(err.into());
            }
        };

        let _heartbeat =
            HeartbeatRoutine::start("replicate_qrep_partition", DEFAULT_HEARTBEAT_INTERVAL, {
                let partition_id = partition.partition_id.clone();
                move || format!("replicating partition {partition_id}")
            });

        let result = async {
            tracing::info!(
                flow = config.flow_job_name,
                partition = partition.partition_id,
                "replicating partition"
            );
            let batch = src.pull_qrep_records(config, partition).await?;
            tracing::info!(
                flow = config.flow_job_name,
                "pulled {} records",
                batch.num_records()
            );
            let stream = batch.into_stream(QREP_STREAM_BUFFER);
            let rows = dst.sync_qrep_records(config, partition, stream).await?;
            tracing::info!(flow = config.flow_job_name, "pushed {rows} records");
            Ok(rows)
        }
        .await;

        close_connector(src).await;
        close_connector(dst).await;
        result
    }

    pub async fn consolidate_qrep_partitions(
        &self,
        token: CancellationToken,
        config: &QRepConfig,
    ) -> anyhow::Result<()> {
        let conn = get_connector(token, &config.destination_peer).await?;
        let result = conn.consolidate_qrep_partitions(config).await;
        close_connector(conn).await;
        result.map_err(Into::into)
    }

    pub async fn cleanup_qrep_flow(
        &self,
        token: CancellationToken,
        config: &QRepConfig,
    ) -> anyhow::Result<()> {
        let conn = get_connector(token, &config.destination_peer).await?;
        let result = conn.cleanup_qrep_flow(config).await;
        close_connector(conn).await;
        result.map_err(Into::into)
    }

    /// Tears a flow down on both peers.
    pub async fn drop_flow(
        &self,
        token: CancellationToken,
        cfg: &FlowConnectionConfigs,
    ) -> anyhow::Result<()> {
        let src = get_connector(token.clone(), &cfg.source).await?;
        let src_result = src.pull_flow_cleanup(&cfg.flow_job_name).await;
        close_connector(src).await;

        let dst = get_connector(token, &cfg.destination).await?;
        let dst_result = dst.sync_flow_cleanup(&cfg.flow_job_name).await;
        close_connector(dst).await;

        src_result?;
        dst_result?;
        Ok(())
    }
}
