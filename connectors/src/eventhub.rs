use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use model::{SyncRecordsRequest, SyncResponse};
use pt::flow::LastSyncState;
use pt::peers::EventHubConfig;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBatches, EventSender, ScopedDestination};
use crate::{Connector, ConnectorError, ConnectorResult};

const MAX_FLUSH_PARALLELISM: usize = 10;

/// In-process hub transport. The vendor producer client is out of scope;
/// anything implementing [`EventSender`] can replace this at the same seam.
#[derive(Default)]
pub struct InProcessHubSender {
    hubs: DashMap<String, Vec<String>>,
}

impl InProcessHubSender {
    pub fn events_for(&self, destination: &str) -> Vec<String> {
        self.hubs
            .get(destination)
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventSender for InProcessHubSender {
    async fn send(
        &self,
        destination: &ScopedDestination,
        events: Vec<String>,
    ) -> anyhow::Result<()> {
        self.hubs
            .entry(destination.destination.clone())
            .or_default()
            .extend(events);
        Ok(())
    }
}

/// Event-style sink: stages serialized records into per-destination
/// batches and records checkpoints in connector-local metadata. Normalize
/// does not apply to queue sinks and reports `Unsupported`.
pub struct EventHubConnector {
    peer_name: String,
    config: EventHubConfig,
    sender: Arc<InProcessHubSender>,
    offsets: Mutex<HashMap<String, i64>>,
    sync_batch_ids: Mutex<HashMap<String, i64>>,
    token: CancellationToken,
}

impl EventHubConnector {
    pub fn new(token: CancellationToken, peer_name: &str, config: &EventHubConfig) -> Self {
        Self {
            peer_name: peer_name.to_string(),
            config: config.clone(),
            sender: Arc::new(InProcessHubSender::default()),
            offsets: Mutex::new(HashMap::new()),
            sync_batch_ids: Mutex::new(HashMap::new()),
            token,
        }
    }

    pub fn sender(&self) -> Arc<InProcessHubSender> {
        self.sender.clone()
    }
}

#[async_trait]
impl Connector for EventHubConnector {
    fn peer_name(&self) -> &str {
        &self.peer_name
    }

    async fn connection_active(&self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn needs_setup_metadata_tables(&self) -> ConnectorResult<bool> {
        Ok(false)
    }

    async fn setup_metadata_tables(&self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn get_last_offset(&self, flow_job_name: &str) -> ConnectorResult<Option<LastSyncState>> {
        let offsets = self.offsets.lock().await;
        Ok(offsets.get(flow_job_name).map(|&checkpoint| LastSyncState {
            checkpoint,
            last_synced_at: Some(Utc::now()),
        }))
    }

    async fn create_raw_table(
        &self,
        req: &model::CreateRawTableInput,
    ) -> ConnectorResult<String> {
        // hubs are created lazily by the transport; nothing to stage
        Ok(format!("_peerdb_raw_{}", req.flow_job_name))
    }

    async fn initialize_table_schema(
        &self,
        _mapping: HashMap<String, pt::flow::TableSchema>,
    ) -> ConnectorResult<()> {
        Ok(())
    }

    async fn sync_records(&self, req: SyncRecordsRequest) -> ConnectorResult<SyncResponse> {
        if self.token.is_cancelled() {
            return Err(ConnectorError::Cancelled);
        }

        let batches = EventBatches::new(self.sender.clone(), self.config.max_batch_bytes);
        let first = req.records.first_checkpoint_id;
        let last = req.records.last_checkpoint_id;

        // every record goes through the transform runtime; without a
        // script that is the default JSON serialization
        let mut transformer = pua::RecordTransformer::new(req.script.clone(), self.token.clone())
            .map_err(|e| ConnectorError::Fatal(format!("{e:#}")))?;
        for record in &req.records.records {
            transformer.submit(record.clone());
        }
        let events = transformer
            .finish(&self.token)
            .await
            .map_err(|e| ConnectorError::DataSchema(format!("{e:#}")))?;

        let mut num_records = 0u64;
        for event in events {
            let destination = ScopedDestination {
                peer_name: self.peer_name.clone(),
                destination: event.destination,
                partition_key: None,
            };
            batches
                .add_event(destination, event.payload)
                .await
                .map_err(ConnectorError::Transient)?;
            num_records += 1;
        }

        let flushed = batches
            .flush_all(MAX_FLUSH_PARALLELISM)
            .await
            .map_err(ConnectorError::Transient)?;
        tracing::info!(
            flow = req.flow_job_name,
            "flushed {flushed} events to event hubs"
        );

        let batch_id = {
            let mut ids = self.sync_batch_ids.lock().await;
            let id = ids.entry(req.flow_job_name.clone()).or_insert(0);
            *id += 1;
            *id
        };
        self.offsets
            .lock()
            .await
            .insert(req.flow_job_name.clone(), last);

        Ok(SyncResponse {
            first_synced_checkpoint_id: first,
            last_synced_checkpoint_id: last,
            num_records_synced: num_records,
            current_sync_batch_id: batch_id,
            table_schema_deltas: req.records.table_schema_deltas,
            relation_message_mapping: req.records.relation_message_mapping,
        })
    }

    async fn sync_flow_cleanup(&self, flow_job_name: &str) -> ConnectorResult<()> {
        self.offsets.lock().await.remove(flow_job_name);
        self.sync_batch_ids.lock().await.remove(flow_job_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::records::{InsertRecord, Record, RecordItems};
    use model::RecordBatch;
    use value::Value;

    fn insert(checkpoint: i64, table: &str) -> Record {
        let items: RecordItems = [("id".to_string(), Value::big_int(checkpoint))]
            .into_iter()
            .collect();
        Record::Insert(InsertRecord {
            checkpoint_id: checkpoint,
            commit_time: Utc::now(),
            source_table: "public.t".to_string(),
            destination_table: table.to_string(),
            items,
        })
    }

    #[tokio::test]
    async fn sync_stages_and_advances_offset() {
        let config = EventHubConfig {
            namespace: "ns".to_string(),
            max_batch_bytes: 1024,
            partition_count: 0,
        };
        let conn = EventHubConnector::new(CancellationToken::new(), "hub", &config);
        let sender = conn.sender();

        let res = conn
            .sync_records(SyncRecordsRequest {
                flow_job_name: "flow1".to_string(),
                records: RecordBatch {
                    records: vec![insert(100, "topic_a"), insert(200, "topic_a")],
                    first_checkpoint_id: 100,
                    last_checkpoint_id: 200,
                    ..Default::default()
                },
                staging_path: None,
                script: None,
            })
            .await
            .unwrap();

        assert_eq!(res.num_records_synced, 2);
        assert_eq!(res.last_synced_checkpoint_id, 200);
        let events = sender.events_for("topic_a");
        assert_eq!(events.len(), 2);
        let payload: serde_json::Value = serde_json::from_str(&events[0]).unwrap();
        assert_eq!(payload["kind"], "insert");
        assert_eq!(payload["data"]["id"], 100);

        let offset = conn.get_last_offset("flow1").await.unwrap().unwrap();
        assert_eq!(offset.checkpoint, 200);
    }

    #[tokio::test]
    async fn normalize_is_unsupported_for_queue_sinks() {
        let config = EventHubConfig {
            namespace: "ns".to_string(),
            max_batch_bytes: 1024,
            partition_count: 0,
        };
        let conn = EventHubConnector::new(CancellationToken::new(), "hub", &config);
        let err = conn
            .normalize_records(model::NormalizeRecordsRequest {
                flow_job_name: "flow1".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Unsupported(_)));
    }
}
