use model::NormalizeResponse;
use pt::flow::FlowConnectionConfigs;

use crate::runtime::WorkflowContext;

/// One normalize wave: merge newly staged raw batches into the
/// normalized tables.
pub async fn normalize_flow_workflow(
    ctx: &WorkflowContext,
    cfg: &FlowConnectionConfigs,
) -> anyhow::Result<NormalizeResponse> {
    ctx.execute_activity("start_normalize", || {
        ctx.activities.start_normalize(ctx.cancel.clone(), cfg)
    })
    .await
}
