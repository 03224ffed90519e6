use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use pt::qrep::{QRepConfig, QRepPartition};
use shared::CdcFlowSignal;

use crate::runtime::WorkflowContext;

/// Plans and replicates every currently visible partition once.
/// Partitions are dispatched in ascending range order with bounded
/// concurrency; completion order does not matter because each partition
/// records its own metadata row. Returns the new `last` partition and
/// the number processed.
async fn replicate_wave(
    ctx: &WorkflowContext,
    config: &QRepConfig,
    last: &QRepPartition,
) -> anyhow::Result<(Option<QRepPartition>, usize)> {
    let partitions = ctx
        .execute_activity("get_qrep_partitions", || {
            ctx.activities
                .get_qrep_partitions(ctx.cancel.clone(), config, last)
        })
        .await?;

    if partitions.is_empty() {
        return Ok((None, 0));
    }
    tracing::info!(
        flow = config.flow_job_name,
        "replicating {} partitions",
        partitions.len()
    );

    let parallelism = config.max_parallel_workers.max(1) as usize;
    let replications = partitions.iter().map(|partition| async move {
        ctx.execute_activity("replicate_qrep_partition", || {
            ctx.activities
                .replicate_qrep_partition(ctx.cancel.clone(), config, partition)
        })
        .await
    });
    stream::iter(replications)
        .buffered(parallelism)
        .try_collect::<Vec<_>>()
        .await?;

    let processed = partitions.len();
    Ok((partitions.into_iter().last(), processed))
}

/// One full copy pass used by the snapshot flow: metadata tables, every
/// partition, consolidate.
pub async fn qrep_copy_once(ctx: &WorkflowContext, config: &QRepConfig) -> anyhow::Result<usize> {
    ctx.execute_activity("setup_qrep_metadata_tables", || {
        ctx.activities
            .setup_qrep_metadata_tables(ctx.cancel.clone(), config)
    })
    .await?;

    let (_, processed) = replicate_wave(ctx, config, &QRepPartition::not_applicable()).await?;

    ctx.execute_activity("consolidate_qrep_partitions", || {
        ctx.activities
            .consolidate_qrep_partitions(ctx.cancel.clone(), config)
    })
    .await?;
    Ok(processed)
}

/// The standalone QRep workflow: repeated partition waves over the
/// watermark column until shutdown, or a single pass when the config is
/// initial-copy-only.
pub async fn qrep_flow_workflow(
    ctx: &WorkflowContext,
    config: QRepConfig,
) -> anyhow::Result<usize> {
    ctx.execute_activity("setup_qrep_metadata_tables", || {
        ctx.activities
            .setup_qrep_metadata_tables(ctx.cancel.clone(), &config)
    })
    .await?;

    let mut last = QRepPartition::not_applicable();
    let mut num_partitions_processed = 0usize;

    loop {
        if let Some(CdcFlowSignal::Shutdown) = ctx.receive_signal_async() {
            tracing::info!(flow = config.flow_job_name, "qrep flow has been shutdown");
            break;
        }
        if ctx.cancel.is_cancelled() {
            break;
        }

        let (new_last, processed) = replicate_wave(ctx, &config, &last).await?;
        num_partitions_processed += processed;
        if let Some(new_last) = new_last {
            last = new_last;
        }

        ctx.execute_activity("consolidate_qrep_partitions", || {
            ctx.activities
                .consolidate_qrep_partitions(ctx.cancel.clone(), &config)
        })
        .await?;

        if config.initial_copy_only {
            break;
        }

        let wait = Duration::from_secs(config.wait_between_batches_seconds as u64)
            .max(ctx.options.qrep_wait_floor);
        if ctx.sleep(wait).await.is_err() {
            break;
        }
    }

    tracing::info!(
        flow = config.flow_job_name,
        "qrep flow processed {num_partitions_processed} partitions"
    );
    Ok(num_partitions_processed)
}
