use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use connectors::memory::MemoryStore;
use flow::runtime::{EngineOptions, FlowEngine, MemoryStateStore, RetryPolicy};
use flow::workflows::cdc_flow::CdcFlowLimits;
use flow::FlowableActivity;
use model::records::{InsertRecord, Record, RecordItems, UpdateRecord};
use pt::flow::{ColumnDescriptor, FlowConnectionConfigs, TableMapping, TableSchema};
use pt::peers::Peer;
use pt::qrep::{QRepConfig, QRepWriteMode, QRepWriteType};
use shared::CdcFlowSignal;
use uuid::Uuid;
use value::{Kind, Value};

fn test_options() -> EngineOptions {
    EngineOptions {
        retry: RetryPolicy {
            maximum_attempts: 5,
            initial_interval: Duration::from_millis(10),
            backoff_coefficient: 1.5,
            maximum_interval: Duration::from_millis(100),
        },
        pause_granularity: Duration::from_millis(50),
        qrep_wait_floor: Duration::from_millis(10),
        cdc_idle_timeout: Duration::from_millis(200),
    }
}

fn engine() -> Arc<FlowEngine> {
    FlowEngine::new(
        FlowableActivity::new(None),
        Arc::new(MemoryStateStore::default()),
        test_options(),
    )
}

fn table_schema(table: &str, with_extra: bool) -> TableSchema {
    let mut columns = vec![
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
    ];
    if with_extra {
        columns.push(ColumnDescriptor {
            name: "c".to_string(),
            kind: Kind::Int32,
            nullable: true,
        });
    }
    TableSchema {
        table_identifier: table.to_string(),
        columns,
        primary_key_columns: vec!["id".to_string()],
    }
}

fn row(id: i32, v: &str) -> RecordItems {
    let mut items = RecordItems::new();
    items.insert("id", Value::integer(id));
    items.insert("v", Value::text(v));
    items
}

fn insert(checkpoint: i64, items: RecordItems) -> Record {
    Record::Insert(InsertRecord {
        checkpoint_id: checkpoint,
        commit_time: Utc::now(),
        source_table: "public.t".to_string(),
        destination_table: "dw.t".to_string(),
        items,
    })
}

fn update(checkpoint: i64, old: RecordItems, new: RecordItems, toast: &[&str]) -> Record {
    Record::Update(UpdateRecord {
        checkpoint_id: checkpoint,
        commit_time: Utc::now(),
        source_table: "public.t".to_string(),
        destination_table: "dw.t".to_string(),
        old_items: old,
        new_items: new,
        unchanged_toast_columns: toast.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
    })
}

struct Mirror {
    cfg: FlowConnectionConfigs,
    src: Arc<MemoryStore>,
    dst: Arc<MemoryStore>,
}

async fn mirror(test: &str) -> Mirror {
    let src_peer = Peer::memory(format!("src_{test}_{}", Uuid::new_v4()));
    let dst_peer = Peer::memory(format!("dst_{test}_{}", Uuid::new_v4()));
    let src = MemoryStore::for_peer(&src_peer.name);
    let dst = MemoryStore::for_peer(&dst_peer.name);
    src.seed_table("public.t", table_schema("public.t", false), Vec::new())
        .await;

    let cfg = FlowConnectionConfigs {
        flow_job_name: format!("{test}_{}", Uuid::new_v4().simple()),
        source: src_peer,
        destination: dst_peer,
        table_mappings: vec![TableMapping {
            source_table_identifier: "public.t".to_string(),
            destination_table_identifier: "dw.t".to_string(),
            partition_key: None,
            exclude: Vec::new(),
        }],
        max_batch_size: 1000,
        do_initial_copy: false,
        resync: false,
        publication_name: None,
        replication_slot_name: None,
        snapshot_num_rows_per_partition: 100,
        snapshot_max_parallel_workers: 2,
        snapshot_num_tables_in_parallel: 1,
        snapshot_staging_path: None,
        script: None,
        src_table_id_name_mapping: HashMap::new(),
        table_name_schema_mapping: HashMap::new(),
    };
    Mirror { cfg, src, dst }
}

#[tokio::test]
async fn insert_then_update_reaches_normalized_table() {
    let m = mirror("ins_upd").await;
    m.src
        .push_records([
            insert(100, row(1, "a")),
            update(200, row(1, "a"), row(1, "b"), &[]),
        ])
        .await;

    let engine = engine();
    let flow = m.cfg.flow_job_name.clone();
    engine
        .start_cdc_flow(
            m.cfg,
            CdcFlowLimits {
                total_sync_flows: 2,
                total_normalize_flows: 0,
                max_batch_size: 1000,
            },
        )
        .await
        .unwrap();
    let state = engine.wait_for_flow(&flow).await.unwrap();

    assert!(state.setup_complete && state.snapshot_complete);
    assert!(state.sync_flow_errors.is_empty(), "{:?}", state.sync_flow_errors);

    let rows = m.dst.table_rows("dw.t").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("v"), Some(&Value::text("b")));

    let raw = m.dst.raw_events().await;
    assert_eq!(raw.len(), 2);
    let mut checkpoints: Vec<i64> = raw.iter().map(|e| e.checkpoint_id).collect();
    checkpoints.sort();
    assert_eq!(checkpoints, vec![100, 200]);
    assert_eq!(m.dst.stored_offset(&flow).await, Some(200));
}

#[tokio::test]
async fn unchanged_toast_column_survives_update() {
    let m = mirror("toast").await;
    let mut schema = table_schema("public.t", false);
    schema.columns.push(ColumnDescriptor {
        name: "blob".to_string(),
        kind: Kind::String,
        nullable: true,
    });
    m.src.seed_table("public.t", schema, Vec::new()).await;

    let blob = "x".repeat(100 * 1024);
    let mut first = row(1, "a");
    first.insert("blob", Value::text(&blob));
    // wal decode omits the toasted column from the update post-image
    m.src
        .push_records([
            insert(100, first),
            update(200, row(1, "a"), row(1, "b"), &["blob"]),
        ])
        .await;

    let engine = engine();
    let flow = m.cfg.flow_job_name.clone();
    engine
        .start_cdc_flow(
            m.cfg,
            CdcFlowLimits {
                total_sync_flows: 2,
                total_normalize_flows: 0,
                max_batch_size: 1000,
            },
        )
        .await
        .unwrap();
    engine.wait_for_flow(&flow).await.unwrap();

    let rows = m.dst.table_rows("dw.t").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("v"), Some(&Value::text("b")));
    assert_eq!(rows[0].get("blob"), Some(&Value::text(blob)));
}

#[tokio::test]
async fn zero_record_cycle_is_a_noop() {
    let m = mirror("noop").await;
    let engine = engine();
    let flow = m.cfg.flow_job_name.clone();
    engine
        .start_cdc_flow(
            m.cfg,
            CdcFlowLimits {
                total_sync_flows: 1,
                total_normalize_flows: 0,
                max_batch_size: 1000,
            },
        )
        .await
        .unwrap();
    let state = engine.wait_for_flow(&flow).await.unwrap();

    assert!(state.sync_flow_statuses.is_empty());
    assert_eq!(m.dst.stored_offset(&flow).await, None);
    assert!(m.dst.raw_events().await.is_empty());
}

#[tokio::test]
async fn failed_sync_is_retried_without_double_staging() {
    let m = mirror("retry").await;
    m.src.push_records([insert(100, row(1, "a"))]).await;
    m.dst
        .fail_next_sync
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let engine = engine();
    let flow = m.cfg.flow_job_name.clone();
    engine
        .start_cdc_flow(
            m.cfg,
            CdcFlowLimits {
                total_sync_flows: 1,
                total_normalize_flows: 0,
                max_batch_size: 1000,
            },
        )
        .await
        .unwrap();
    let state = engine.wait_for_flow(&flow).await.unwrap();

    assert!(state.sync_flow_errors.is_empty(), "{:?}", state.sync_flow_errors);
    assert_eq!(m.dst.raw_events().await.len(), 1);
    assert_eq!(m.dst.stored_offset(&flow).await, Some(100));
}

#[tokio::test]
async fn schema_delta_propagates_to_destination() {
    let m = mirror("delta").await;
    m.src.push_records([insert(100, row(1, "a"))]).await;

    let engine = engine();
    let flow = m.cfg.flow_job_name.clone();
    let cfg = m.cfg;
    engine
        .start_cdc_flow(
            cfg,
            CdcFlowLimits {
                total_sync_flows: 3,
                total_normalize_flows: 0,
                max_batch_size: 1000,
            },
        )
        .await
        .unwrap();

    // mid-stream the source gains a column and emits a row carrying it
    tokio::time::sleep(Duration::from_millis(50)).await;
    m.src
        .seed_table("public.t", table_schema("public.t", true), Vec::new())
        .await;
    let mut wide = row(2, "w");
    wide.insert("c", Value::integer(7));
    m.src.push_records([insert(200, wide)]).await;

    let state = engine.wait_for_flow(&flow).await.unwrap();
    assert!(state.sync_flow_errors.is_empty(), "{:?}", state.sync_flow_errors);

    let schema = m.dst.table_schema("dw.t").await.unwrap();
    assert!(schema.column("c").is_some(), "destination schema missing new column");
    let rows = m.dst.table_rows("dw.t").await;
    assert_eq!(rows.len(), 2);
    let wide_row = rows.iter().find(|r| r.get("id") == Some(&Value::integer(2))).unwrap();
    assert_eq!(wide_row.get("c"), Some(&Value::integer(7)));
    let narrow_row = rows.iter().find(|r| r.get("id") == Some(&Value::integer(1))).unwrap();
    assert!(narrow_row.get("c").map(Value::is_null).unwrap_or(true));
}

#[tokio::test]
async fn resync_rebuilds_through_shadow_table() {
    let m = mirror("resync").await;
    // the destination already holds stale data; the source holds the truth
    m.src
        .seed_table(
            "public.t",
            table_schema("public.t", false),
            vec![row(1, "fresh"), row(2, "fresh")],
        )
        .await;
    m.dst
        .seed_table("dw.t", table_schema("dw.t", false), vec![row(9, "stale")])
        .await;

    let engine = engine();
    let flow = m.cfg.flow_job_name.clone();
    let mut cfg = m.cfg;
    cfg.resync = true;
    cfg.do_initial_copy = true;
    engine
        .start_cdc_flow(
            cfg,
            CdcFlowLimits {
                total_sync_flows: 1,
                total_normalize_flows: 0,
                max_batch_size: 1000,
            },
        )
        .await
        .unwrap();
    let state = engine.wait_for_flow(&flow).await.unwrap();
    assert!(state.snapshot_complete);

    assert!(!m.dst.table_exists("dw.t_resync").await);
    let rows = m.dst.table_rows("dw.t").await;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.get("v") == Some(&Value::text("fresh"))));
}

#[tokio::test]
async fn continue_as_new_truncates_retained_state() {
    let m = mirror("truncate").await;
    let records: Vec<Record> = (1..=15).map(|i| insert(i * 10, row(i as i32, "x"))).collect();
    m.src.push_records(records).await;

    let engine = engine();
    let flow = m.cfg.flow_job_name.clone();
    engine
        .start_cdc_flow(
            m.cfg,
            CdcFlowLimits {
                total_sync_flows: 35,
                total_normalize_flows: 0,
                max_batch_size: 1,
            },
        )
        .await
        .unwrap();
    let state = engine.wait_for_flow(&flow).await.unwrap();

    assert!(state.progress.len() <= 10);
    assert!(state.sync_flow_statuses.len() <= 10);
    assert!(state.normalize_flow_statuses.len() <= 10);
    assert_eq!(m.dst.table_rows("dw.t").await.len(), 15);
    assert_eq!(m.dst.stored_offset(&flow).await, Some(150));
}

#[tokio::test]
async fn sync_flow_limit_spans_continue_as_new() {
    let m = mirror("can_limit").await;
    // 34 single-record waves force a continue-as-new at 32 with two more
    // waves after it
    let records: Vec<Record> = (1..=34).map(|i| insert(i * 10, row(i as i32, "x"))).collect();
    m.src.push_records(records).await;

    let engine = engine();
    let flow = m.cfg.flow_job_name.clone();
    engine
        .start_cdc_flow(
            m.cfg,
            CdcFlowLimits {
                total_sync_flows: 34,
                total_normalize_flows: 0,
                max_batch_size: 1,
            },
        )
        .await
        .unwrap();
    // completing at all proves the limit counts across the restart: a
    // per-segment counter would reset to 0 at the boundary and never
    // reach 34
    let state = engine.wait_for_flow(&flow).await.unwrap();

    assert!(state.sync_flow_errors.is_empty(), "{:?}", state.sync_flow_errors);
    assert_eq!(m.dst.raw_events().await.len(), 34);
    assert_eq!(m.dst.table_rows("dw.t").await.len(), 34);
    assert_eq!(m.dst.stored_offset(&flow).await, Some(340));
    // the boundary also truncated the retained statuses
    assert!(state.sync_flow_statuses.len() <= 10);
    assert!(state.normalize_flow_statuses.len() <= 10);
}

#[tokio::test]
async fn pause_and_shutdown_signals_drive_the_flow() {
    let m = mirror("signals").await;
    let engine = engine();
    let flow = m.cfg.flow_job_name.clone();
    engine
        .start_cdc_flow(
            m.cfg,
            CdcFlowLimits {
                total_sync_flows: 0,
                total_normalize_flows: 0,
                max_batch_size: 1000,
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    engine.signal_flow(&flow, CdcFlowSignal::Pause).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let paused = engine.query_flow_state(&flow).unwrap();
    assert_eq!(paused.active_signal, CdcFlowSignal::Pause);
    assert!(
        paused.progress.iter().any(|p| p.starts_with("paused for")),
        "progress: {:?}",
        paused.progress
    );

    engine.signal_flow(&flow, CdcFlowSignal::Shutdown).unwrap();
    let state = engine.wait_for_flow(&flow).await.unwrap();
    assert_eq!(state.active_signal, CdcFlowSignal::Shutdown);
}

#[tokio::test]
async fn qrep_flow_partitions_and_stays_idempotent() {
    let src_peer = Peer::memory(format!("qrep_src_{}", Uuid::new_v4()));
    let dst_peer = Peer::memory(format!("qrep_dst_{}", Uuid::new_v4()));
    let src = MemoryStore::for_peer(&src_peer.name);
    let dst = MemoryStore::for_peer(&dst_peer.name);
    src.seed_table(
        "public.big",
        table_schema("public.big", false),
        (1..=1000).map(|i| row(i, "v")).collect(),
    )
    .await;

    let config = QRepConfig {
        flow_job_name: format!("qrep_{}", Uuid::new_v4().simple()),
        source_peer: src_peer,
        destination_peer: dst_peer,
        destination_table_identifier: "dw.big".to_string(),
        query: String::new(),
        watermark_table: "public.big".to_string(),
        watermark_column: "id".to_string(),
        initial_copy_only: true,
        num_rows_per_partition: 100,
        max_parallel_workers: 4,
        wait_between_batches_seconds: 0,
        write_mode: Some(QRepWriteMode {
            write_type: QRepWriteType::Upsert,
            upsert_key_columns: vec!["id".to_string()],
        }),
        staging_path: None,
        snapshot_name: None,
    };

    let engine = engine();
    let flow = config.flow_job_name.clone();
    engine.start_qrep_flow(config.clone()).await.unwrap();
    engine.wait_for_flow(&flow).await.unwrap();
    engine.remove_flow(&flow);

    assert_eq!(dst.table_rows("dw.big").await.len(), 1000);
    assert_eq!(dst.qrep_partition_count(&flow).await, 10);

    // rerunning the copy with the same config converges to the same rows
    engine.start_qrep_flow(config).await.unwrap();
    engine.wait_for_flow(&flow).await.unwrap();
    assert_eq!(dst.table_rows("dw.big").await.len(), 1000);
}
