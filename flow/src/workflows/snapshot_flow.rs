use futures::stream::{self, StreamExt, TryStreamExt};
use model::SetupReplicationInput;
use pt::flow::FlowConnectionConfigs;
use pt::qrep::{QRepConfig, QRepWriteMode, QRepWriteType};

use crate::runtime::WorkflowContext;

fn snapshot_table_flow_name(flow_job_name: &str, destination_table: &str) -> String {
    let sanitized: String = destination_table
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{flow_job_name}_snapshot_{sanitized}")
}

/// Sets up replication on the source (slot + exported snapshot) and runs
/// the initial copy of every table against that snapshot, then releases
/// the slot hold.
pub fn snapshot_flow_workflow<'a>(
    ctx: &'a WorkflowContext,
    cfg: &'a FlowConnectionConfigs,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'a>> {
    Box::pin(async move {
    let replication_input = SetupReplicationInput {
        flow_job_name: cfg.flow_job_name.clone(),
        table_name_mapping: cfg.table_name_mapping(),
        do_initial_copy: cfg.do_initial_copy,
        publication_name: cfg.publication_name.clone(),
        replication_slot_name: cfg.replication_slot_name.clone(),
    };
    let replication = ctx
        .execute_activity("setup_replication", || {
            ctx.activities.setup_replication(
                ctx.cancel.clone(),
                &cfg.source,
                replication_input.clone(),
            )
        })
        .await?;

    let result = if cfg.do_initial_copy {
        run_initial_copies(ctx, cfg, &replication.snapshot_name).await
    } else {
        tracing::info!(flow = cfg.flow_job_name, "skipping initial copy");
        Ok(())
    };

    // the slot hold is released on every path, or the exported snapshot
    // would pin the WAL forever
    let close_result = ctx.activities.close_slot_keep_alive(&cfg.flow_job_name).await;
    result?;
    close_result
    })
}

fn run_initial_copies<'a>(
    ctx: &'a WorkflowContext,
    cfg: &'a FlowConnectionConfigs,
    snapshot_name: &'a str,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'a>> {
    Box::pin(async move {
    let parallelism = cfg.snapshot_num_tables_in_parallel.max(1) as usize;

    let copies = cfg.table_mappings.iter().map(|mapping| {
        let snapshot_name = (!snapshot_name.is_empty()).then(|| snapshot_name.to_string());
        let qrep_config = QRepConfig {
            flow_job_name: snapshot_table_flow_name(
                &cfg.flow_job_name,
                &mapping.destination_table_identifier,
            ),
            source_peer: cfg.source.clone(),
            destination_peer: cfg.destination.clone(),
            destination_table_identifier: mapping.destination_table_identifier.clone(),
            query: String::new(),
            watermark_table: mapping.source_table_identifier.clone(),
            watermark_column: watermark_column_for(cfg, mapping),
            initial_copy_only: true,
            num_rows_per_partition: cfg.snapshot_num_rows_per_partition,
            max_parallel_workers: cfg.snapshot_max_parallel_workers.max(1),
            wait_between_batches_seconds: 0,
            write_mode: Some(QRepWriteMode {
                write_type: QRepWriteType::Append,
                upsert_key_columns: Vec::new(),
            }),
            staging_path: cfg.snapshot_staging_path.clone(),
            snapshot_name,
        };
        async move {
            tracing::info!(
                flow = qrep_config.flow_job_name,
                table = qrep_config.watermark_table,
                "snapshotting table"
            );
            super::qrep_flow::qrep_copy_once(ctx, &qrep_config).await
        }
    });

    stream::iter(copies)
        .buffered(parallelism)
        .try_collect::<Vec<_>>()
        .await?;
    Ok(())
}

fn watermark_column_for(
    cfg: &FlowConnectionConfigs,
    mapping: &pt::flow::TableMapping,
) -> String {
    mapping
        .partition_key
        .clone()
        .or_else(|| {
            cfg.table_name_schema_mapping
                .get(&mapping.destination_table_identifier)
                .and_then(|schema| schema.primary_key_columns.first().cloned())
        })
        .unwrap_or_else(|| "id".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_flow_names_are_sanitized() {
        assert_eq!(
            snapshot_table_flow_name("orders_mirror", "dw.orders-v2"),
            "orders_mirror_snapshot_dw_orders_v2"
        );
    }
}
