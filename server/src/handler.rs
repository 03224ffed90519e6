use std::sync::Arc;

use flow::workflows::cdc_flow::CdcFlowLimits;
use flow::{CdcFlowWorkflowState, FlowEngine};
use pt::flow::FlowConnectionConfigs;
use pt::qrep::QRepConfig;
use shared::CdcFlowSignal;

const DEFAULT_MAX_BATCH_SIZE: u32 = 100_000;

/// Admin surface for the flow engine. The transport in front of this
/// (gRPC, HTTP) is deployment-specific; these are the operations it maps
/// onto.
pub struct FlowRequestHandler {
    engine: Arc<FlowEngine>,
}

impl FlowRequestHandler {
    pub fn new(engine: Arc<FlowEngine>) -> Self {
        Self { engine }
    }

    /// Launches a CDC flow and returns its workflow id
    /// (`<flow_job_name>-peerflow-<uuid>`).
    pub async fn create_peer_flow(
        &self,
        mut cfg: FlowConnectionConfigs,
    ) -> anyhow::Result<String> {
        if cfg.max_batch_size == 0 {
            cfg.max_batch_size = DEFAULT_MAX_BATCH_SIZE;
        }
        let limits = CdcFlowLimits {
            total_sync_flows: 0,
            total_normalize_flows: 0,
            max_batch_size: cfg.max_batch_size,
        };
        self.engine.start_cdc_flow(cfg, limits).await
    }

    /// Launches a partitioned-copy flow and returns its workflow id
    /// (`<flow_job_name>-qrepflow-<uuid>`).
    pub async fn create_qrep_flow(&self, cfg: QRepConfig) -> anyhow::Result<String> {
        self.engine.start_qrep_flow(cfg).await
    }

    /// Pause toggles on repeat: pausing a paused flow resumes it.
    pub fn pause_flow(&self, flow_job_name: &str) -> anyhow::Result<()> {
        self.engine.signal_flow(flow_job_name, CdcFlowSignal::Pause)
    }

    /// Requests shutdown and waits for the current cycle to finish.
    pub async fn shutdown_flow(
        &self,
        flow_job_name: &str,
    ) -> anyhow::Result<CdcFlowWorkflowState> {
        self.engine
            .signal_flow(flow_job_name, CdcFlowSignal::Shutdown)?;
        let state = self.engine.wait_for_flow(flow_job_name).await?;
        self.engine.remove_flow(flow_job_name);
        Ok(state)
    }

    /// The `q-cdc-flow-status` query.
    pub fn flow_status(&self, flow_job_name: &str) -> anyhow::Result<CdcFlowWorkflowState> {
        self.engine.query_flow_state(flow_job_name)
    }

    /// Drops a flow entirely: cleanup on both peers, durable state gone.
    pub async fn drop_peer_flow(&self, cfg: &FlowConnectionConfigs) -> anyhow::Result<()> {
        self.engine.drop_flow(cfg).await
    }

    pub async fn drop_qrep_flow(&self, cfg: &QRepConfig) -> anyhow::Result<()> {
        self.engine.drop_qrep_flow(cfg).await
    }

    pub fn health_check(&self) -> &'static str {
        "healthy"
    }
}
