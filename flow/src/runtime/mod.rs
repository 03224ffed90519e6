use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use connectors::ConnectorError;
use dashmap::DashMap;
use shared::CdcFlowSignal;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::activities::FlowableActivity;
use crate::workflows::cdc_flow::CdcFlowWorkflowState;

/// Mirrors the child-workflow retry options: activities are retried with
/// exponential backoff until the maximum attempts run out.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub maximum_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            maximum_attempts: 20,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub retry: RetryPolicy,
    /// Sleep grain of the pause loop.
    pub pause_granularity: Duration,
    /// Sleep between continuous QRep waves.
    pub qrep_wait_floor: Duration,
    /// How long a pull waits for records before reporting an empty cycle.
    pub cdc_idle_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            pause_granularity: Duration::from_secs(60),
            qrep_wait_floor: Duration::from_secs(10),
            cdc_idle_timeout: Duration::from_secs(10),
        }
    }
}

/// Durable checkpoint seam: the workflow saves its state after every
/// activity result and reloads it on boot.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(
        &self,
        flow_job_name: &str,
        workflow_id: &str,
        state: &CdcFlowWorkflowState,
    ) -> anyhow::Result<()>;
    async fn load(&self, flow_job_name: &str) -> anyhow::Result<Option<CdcFlowWorkflowState>>;
    async fn remove(&self, flow_job_name: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryStateStore {
    states: DashMap<String, serde_json::Value>,
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(
        &self,
        flow_job_name: &str,
        _workflow_id: &str,
        state: &CdcFlowWorkflowState,
    ) -> anyhow::Result<()> {
        self.states
            .insert(flow_job_name.to_string(), serde_json::to_value(state)?);
        Ok(())
    }

    async fn load(&self, flow_job_name: &str) -> anyhow::Result<Option<CdcFlowWorkflowState>> {
        self.states
            .get(flow_job_name)
            .map(|v| serde_json::from_value(v.clone()).map_err(Into::into))
            .transpose()
    }

    async fn remove(&self, flow_job_name: &str) -> anyhow::Result<()> {
        self.states.remove(flow_job_name);
        Ok(())
    }
}

pub struct CatalogStateStore {
    catalog: Arc<catalog::Catalog>,
}

impl CatalogStateStore {
    pub fn new(catalog: Arc<catalog::Catalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl StateStore for CatalogStateStore {
    async fn save(
        &self,
        flow_job_name: &str,
        workflow_id: &str,
        state: &CdcFlowWorkflowState,
    ) -> anyhow::Result<()> {
        self.catalog
            .save_flow_state(flow_job_name, workflow_id, &serde_json::to_value(state)?)
            .await
    }

    async fn load(&self, flow_job_name: &str) -> anyhow::Result<Option<CdcFlowWorkflowState>> {
        Ok(self
            .catalog
            .load_flow_state(flow_job_name)
            .await?
            .map(serde_json::from_value)
            .transpose()?)
    }

    async fn remove(&self, flow_job_name: &str) -> anyhow::Result<()> {
        self.catalog.delete_flow_state(flow_job_name).await
    }
}

/// Everything one workflow execution can reach: activity adapters, the
/// state checkpoint seam, its signal channel and cancellation scope.
pub struct WorkflowContext {
    pub flow_job_name: String,
    pub workflow_id: String,
    pub activities: Arc<FlowableActivity>,
    pub options: EngineOptions,
    pub cancel: CancellationToken,
    store: Arc<dyn StateStore>,
    signal_rx: std::sync::Mutex<mpsc::UnboundedReceiver<CdcFlowSignal>>,
    state_tx: watch::Sender<CdcFlowWorkflowState>,
}

impl WorkflowContext {
    /// Non-blocking signal receive, checked between workflow steps.
    pub fn receive_signal_async(&self) -> Option<CdcFlowSignal> {
        self.signal_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.try_recv().ok())
    }

    pub fn sleep<'a>(
        &'a self,
        duration: Duration,
    ) -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => Ok(()),
                _ = self.cancel.cancelled() => anyhow::bail!("workflow cancelled during sleep"),
            }
        })
    }

    /// Replay-safe child workflow id: `<prefix>-<flow_job_name>-<uuid>`.
    pub fn child_workflow_id(&self, prefix: &str) -> String {
        format!("{}-{}-{}", prefix, self.flow_job_name, Uuid::new_v4())
    }

    /// Persists the state and publishes it to the status query channel.
    pub fn checkpoint<'a>(
        &'a self,
        state: &'a CdcFlowWorkflowState,
    ) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let _ = self.state_tx.send(state.clone());
            if let Err(err) = self
                .store
                .save(&self.flow_job_name, &self.workflow_id, state)
                .await
            {
                tracing::error!(flow = self.flow_job_name, "failed to checkpoint state: {err:#}");
            }
        })
    }

    pub fn load_state<'a>(
        &'a self,
    ) -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<Option<CdcFlowWorkflowState>>> + Send + 'a>>
    {
        Box::pin(async move { self.store.load(&self.flow_job_name).await })
    }

    /// Runs one activity with the retry policy. Cancellation and
    /// non-retryable connector errors short-circuit.
    pub fn execute_activity<'a, T, Fut>(
        &'a self,
        activity_name: &'a str,
        mut activity: impl FnMut() -> Fut + Send + 'a,
    ) -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>
    where
        T: Send + 'a,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'a,
    {
        Box::pin(async move {
            let policy = &self.options.retry;
            let mut interval = policy.initial_interval;
            let mut attempt = 1;
            loop {
                if self.cancel.is_cancelled() {
                    anyhow::bail!("workflow cancelled before activity {activity_name}");
                }
                match activity().await {
                    Ok(out) => return Ok(out),
                    Err(err) => {
                        let retryable = err
                            .downcast_ref::<ConnectorError>()
                            .map(ConnectorError::is_retryable)
                            .unwrap_or(true);
                        if !retryable || attempt >= policy.maximum_attempts {
                            return Err(err.context(format!(
                                "activity {activity_name} failed after {attempt} attempt(s)"
                            )));
                        }
                        tracing::warn!(
                            flow = self.flow_job_name,
                            "activity {activity_name} attempt {attempt} failed, retrying: {err:#}"
                        );
                        self.sleep(interval).await?;
                        interval = Duration::from_secs_f64(
                            (interval.as_secs_f64() * policy.backoff_coefficient)
                                .min(policy.maximum_interval.as_secs_f64()),
                        );
                        attempt += 1;
                    }
                }
            }
        })
    }
}

pub struct WorkflowHandle {
    pub workflow_id: String,
    signal_tx: mpsc::UnboundedSender<CdcFlowSignal>,
    state_rx: watch::Receiver<CdcFlowWorkflowState>,
    join: Mutex<Option<JoinHandle<anyhow::Result<CdcFlowWorkflowState>>>>,
    cancel: CancellationToken,
}

/// Process-local execution engine: starts workflow tasks, routes signals
/// and status queries, and owns the state checkpoint seam.
pub struct FlowEngine {
    pub activities: Arc<FlowableActivity>,
    pub options: EngineOptions,
    store: Arc<dyn StateStore>,
    workflows: DashMap<String, Arc<WorkflowHandle>>,
}

impl FlowEngine {
    pub fn new(
        activities: Arc<FlowableActivity>,
        store: Arc<dyn StateStore>,
        options: EngineOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            activities,
            options,
            store,
            workflows: DashMap::new(),
        })
    }

    fn register(
        &self,
        flow_job_name: &str,
        workflow_id: String,
    ) -> (Arc<WorkflowHandle>, WorkflowContext) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CdcFlowWorkflowState::new());
        let cancel = CancellationToken::new();

        let handle = Arc::new(WorkflowHandle {
            workflow_id: workflow_id.clone(),
            signal_tx,
            state_rx,
            join: Mutex::new(None),
            cancel: cancel.clone(),
        });
        let ctx = WorkflowContext {
            flow_job_name: flow_job_name.to_string(),
            workflow_id,
            activities: self.activities.clone(),
            options: self.options.clone(),
            cancel,
            store: self.store.clone(),
            signal_rx: std::sync::Mutex::new(signal_rx),
            state_tx,
        };
        self.workflows
            .insert(flow_job_name.to_string(), handle.clone());
        (handle, ctx)
    }

    pub async fn start_cdc_flow(
        self: &Arc<Self>,
        cfg: pt::flow::FlowConnectionConfigs,
        limits: crate::workflows::cdc_flow::CdcFlowLimits,
    ) -> anyhow::Result<String> {
        let workflow_id = format!("{}-peerflow-{}", cfg.flow_job_name, Uuid::new_v4());
        let (handle, ctx) = self.register(&cfg.flow_job_name, workflow_id.clone());

        let fut: std::pin::Pin<
            Box<dyn Future<Output = anyhow::Result<CdcFlowWorkflowState>> + Send>,
        > = Box::pin(async move {
            crate::workflows::cdc_flow::cdc_flow_workflow(&ctx, cfg, limits).await
        });
        let join = tokio::spawn(fut);
        *handle.join.lock().await = Some(join);

        tracing::info!(workflow_id, "started cdc flow");
        Ok(workflow_id)
    }

    pub async fn start_qrep_flow(
        self: &Arc<Self>,
        config: pt::qrep::QRepConfig,
    ) -> anyhow::Result<String> {
        let workflow_id = format!("{}-qrepflow-{}", config.flow_job_name, Uuid::new_v4());
        let (handle, ctx) = self.register(&config.flow_job_name, workflow_id.clone());

        let fut: std::pin::Pin<
            Box<dyn Future<Output = anyhow::Result<CdcFlowWorkflowState>> + Send>,
        > = Box::pin(async move {
            crate::workflows::qrep_flow::qrep_flow_workflow(&ctx, config)
                .await
                // qrep flows report partition counts through logs; the
                // handle still resolves to a state for uniformity
                .map(|_| CdcFlowWorkflowState::new())
        });
        let join = tokio::spawn(fut);
        *handle.join.lock().await = Some(join);

        tracing::info!(workflow_id, "started qrep flow");
        Ok(workflow_id)
    }

    fn handle_for(&self, flow_job_name: &str) -> anyhow::Result<Arc<WorkflowHandle>> {
        self.workflows
            .get(flow_job_name)
            .map(|h| h.clone())
            .ok_or_else(|| anyhow::anyhow!("no workflow registered for {flow_job_name}"))
    }

    pub fn signal_flow(&self, flow_job_name: &str, signal: CdcFlowSignal) -> anyhow::Result<()> {
        let handle = self.handle_for(flow_job_name)?;
        handle
            .signal_tx
            .send(signal)
            .map_err(|_| anyhow::anyhow!("workflow {flow_job_name} is no longer running"))
    }

    /// The status query: a snapshot of the current workflow state.
    pub fn query_flow_state(&self, flow_job_name: &str) -> anyhow::Result<CdcFlowWorkflowState> {
        let handle = self.handle_for(flow_job_name)?;
        let state = handle.state_rx.borrow().clone();
        Ok(state)
    }

    pub async fn wait_for_flow(
        &self,
        flow_job_name: &str,
    ) -> anyhow::Result<CdcFlowWorkflowState> {
        let handle = self.handle_for(flow_job_name)?;
        let join = handle
            .join
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("workflow {flow_job_name} already awaited"))?;
        join.await?
    }

    pub fn cancel_flow(&self, flow_job_name: &str) -> anyhow::Result<()> {
        let handle = self.handle_for(flow_job_name)?;
        handle.cancel.cancel();
        Ok(())
    }

    pub fn remove_flow(&self, flow_job_name: &str) {
        self.workflows.remove(flow_job_name);
    }

    /// Tears a CDC flow down on both peers and forgets its durable state.
    pub async fn drop_flow(
        &self,
        cfg: &pt::flow::FlowConnectionConfigs,
    ) -> anyhow::Result<()> {
        self.activities
            .drop_flow(CancellationToken::new(), cfg)
            .await?;
        self.store.remove(&cfg.flow_job_name).await?;
        self.remove_flow(&cfg.flow_job_name);
        Ok(())
    }

    /// Drops the partition metadata of a QRep flow on the sink.
    pub async fn drop_qrep_flow(&self, config: &pt::qrep::QRepConfig) -> anyhow::Result<()> {
        self.activities
            .cleanup_qrep_flow(CancellationToken::new(), config)
            .await?;
        self.remove_flow(&config.flow_job_name);
        Ok(())
    }
}
