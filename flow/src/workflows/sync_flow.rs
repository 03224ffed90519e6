use model::SyncResponse;
use pt::flow::{FlowConnectionConfigs, RelationMessageMapping, SyncFlowOptions};

use crate::activities::StartFlowInput;
use crate::runtime::WorkflowContext;
use crate::workflows::cdc_flow::CdcFlowLimits;

/// One sync wave: pull a bounded batch from the source and stage it on
/// the sink. None means the cycle saw no records and advanced nothing.
pub async fn sync_flow_workflow(
    ctx: &WorkflowContext,
    cfg: &FlowConnectionConfigs,
    limits: &CdcFlowLimits,
    relation_message_mapping: RelationMessageMapping,
) -> anyhow::Result<Option<SyncResponse>> {
    let batch_size = if limits.max_batch_size != 0 {
        limits.max_batch_size
    } else {
        cfg.max_batch_size
    };

    let input = StartFlowInput {
        flow_connection_configs: cfg.clone(),
        last_sync_state: None,
        sync_flow_options: SyncFlowOptions {
            batch_size: batch_size.max(1),
        },
        relation_message_mapping,
        idle_timeout: ctx.options.cdc_idle_timeout,
    };

    ctx.execute_activity("start_flow", || {
        ctx.activities.start_flow(ctx.cancel.clone(), input.clone())
    })
    .await
}
