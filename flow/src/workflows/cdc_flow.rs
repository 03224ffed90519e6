use std::time::Instant;

use model::{NormalizeResponse, SyncResponse};
use pt::flow::{FlowConnectionConfigs, RelationMessageMapping, RenameTableOption, RenameTablesInput};
use serde::{Deserialize, Serialize};
use shared::CdcFlowSignal;

use crate::runtime::WorkflowContext;

const MAX_SYNC_FLOWS_PER_CDC_FLOW: u32 = 32;
const RETAINED_STATUSES: usize = 10;
const RESYNC_SUFFIX: &str = "_resync";

#[derive(Debug, Clone, Copy, Default)]
pub struct CdcFlowLimits {
    /// Number of sync flows to execute in total, counted across
    /// continue-as-new boundaries: a limit above 32 spans restarts
    /// instead of resetting per execution segment. 0 runs until
    /// shutdown.
    pub total_sync_flows: u32,
    /// Number of normalize flows to execute in total. 0 runs until
    /// shutdown.
    pub total_normalize_flows: u32,
    /// Maximum number of rows in a sync flow batch.
    pub max_batch_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcFlowWorkflowState {
    /// Last few human-readable milestones.
    pub progress: Vec<String>,
    pub sync_flow_statuses: Vec<SyncResponse>,
    pub normalize_flow_statuses: Vec<NormalizeResponse>,
    pub active_signal: CdcFlowSignal,
    pub setup_complete: bool,
    pub snapshot_complete: bool,
    pub sync_flow_errors: Vec<String>,
    pub normalize_flow_errors: Vec<String>,
    /// Relation id to relation descriptor, carried across iterations so
    /// schema changes survive continue-as-new.
    pub relation_message_mapping: RelationMessageMapping,
}

impl Default for CdcFlowWorkflowState {
    fn default() -> Self {
        Self::new()
    }
}

impl CdcFlowWorkflowState {
    pub fn new() -> Self {
        Self {
            progress: vec!["started".to_string()],
            sync_flow_statuses: Vec::new(),
            normalize_flow_statuses: Vec::new(),
            active_signal: CdcFlowSignal::Noop,
            setup_complete: false,
            snapshot_complete: false,
            sync_flow_errors: Vec::new(),
            normalize_flow_errors: Vec::new(),
            relation_message_mapping: RelationMessageMapping::default(),
        }
    }

    /// Truncates the bounded slices to the retention limit and clears the
    /// accumulated errors after logging them.
    pub fn truncate_progress(&mut self) {
        if self.progress.len() > RETAINED_STATUSES {
            self.progress
                .drain(..self.progress.len() - RETAINED_STATUSES);
        }
        if self.sync_flow_statuses.len() > RETAINED_STATUSES {
            self.sync_flow_statuses
                .drain(..self.sync_flow_statuses.len() - RETAINED_STATUSES);
        }
        if self.normalize_flow_statuses.len() > RETAINED_STATUSES {
            self.normalize_flow_statuses
                .drain(..self.normalize_flow_statuses.len() - RETAINED_STATUSES);
        }
        if !self.sync_flow_errors.is_empty() {
            tracing::warn!("sync flow errors: {:?}", self.sync_flow_errors);
            self.sync_flow_errors.clear();
        }
        if !self.normalize_flow_errors.is_empty() {
            tracing::warn!("normalize flow errors: {:?}", self.normalize_flow_errors);
            self.normalize_flow_errors.clear();
        }
    }

    fn handle_signal(&mut self, signal: CdcFlowSignal) {
        match signal {
            CdcFlowSignal::Shutdown => {
                tracing::info!("received shutdown signal");
                self.active_signal = CdcFlowSignal::Shutdown;
            }
            CdcFlowSignal::Pause => match self.active_signal {
                CdcFlowSignal::Noop => {
                    tracing::info!("workflow was running, pausing it");
                    self.active_signal = CdcFlowSignal::Pause;
                }
                CdcFlowSignal::Pause => {
                    tracing::info!("workflow was paused, resuming it");
                    self.active_signal = CdcFlowSignal::Noop;
                }
                CdcFlowSignal::Shutdown => {}
            },
            CdcFlowSignal::Noop => {}
        }
    }
}

enum FlowOutcome {
    Completed,
    ContinueAsNew,
}

fn receive_and_handle_signal(ctx: &WorkflowContext, state: &mut CdcFlowWorkflowState) {
    while let Some(signal) = ctx.receive_signal_async() {
        tracing::info!(flow = ctx.flow_job_name, "received signal - {signal}");
        state.handle_signal(signal);
    }
}

/// The long-running CDC flow: setup, initial snapshot, then indefinite
/// sync + normalize waves with continue-as-new truncation between them.
pub fn cdc_flow_workflow<'a>(
    ctx: &'a WorkflowContext,
    mut cfg: FlowConnectionConfigs,
    limits: CdcFlowLimits,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<CdcFlowWorkflowState>> + Send + 'a>>
{
    Box::pin(async move {
    let mut state = match ctx.load_state().await {
        Ok(Some(state)) => state,
        Ok(None) => CdcFlowWorkflowState::new(),
        Err(err) => {
            tracing::warn!(flow = ctx.flow_job_name, "state load failed, starting fresh: {err:#}");
            CdcFlowWorkflowState::new()
        }
    };
    ctx.checkpoint(&state).await;

    let mut sync_flows_completed = 0u32;
    loop {
        match cdc_flow_run(ctx, &mut cfg, &limits, &mut state, &mut sync_flows_completed).await? {
            FlowOutcome::Completed => {
                ctx.checkpoint(&state).await;
                return Ok(state);
            }
            FlowOutcome::ContinueAsNew => {
                state.truncate_progress();
                ctx.checkpoint(&state).await;
            }
        }
    }
    })
}

/// One workflow execution between continue-as-new boundaries.
fn cdc_flow_run<'a>(
    ctx: &'a WorkflowContext,
    cfg: &'a mut FlowConnectionConfigs,
    limits: &'a CdcFlowLimits,
    state: &'a mut CdcFlowWorkflowState,
    sync_flows_completed: &'a mut u32,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<FlowOutcome>> + Send + 'a>> {
    Box::pin(async move {
    // setup is skipped only when both phases completed; resync rewrites
    // destination identifiers before either runs
    if !(state.setup_complete && state.snapshot_complete) {
        if cfg.resync {
            for mapping in &mut cfg.table_mappings {
                if !mapping.destination_table_identifier.ends_with(RESYNC_SUFFIX) {
                    mapping.destination_table_identifier =
                        format!("{}{}", mapping.destination_table_identifier, RESYNC_SUFFIX);
                }
            }
        }

        let setup_flow_id = ctx.child_workflow_id("setup-flow");
        tracing::info!(workflow_id = setup_flow_id, "executing setup flow");
        *cfg = super::setup_flow::setup_flow_workflow(ctx, cfg.clone()).await?;
        state.setup_complete = true;
        ctx.checkpoint(state).await;

        let snapshot_flow_id = ctx.child_workflow_id("snapshot-flow");
        tracing::info!(workflow_id = snapshot_flow_id, "executing snapshot flow");
        super::snapshot_flow::snapshot_flow_workflow(ctx, cfg).await?;

        if cfg.resync {
            let mut rename_options = Vec::new();
            for mapping in &mut cfg.table_mappings {
                let old_name = mapping.destination_table_identifier.clone();
                let new_name = old_name
                    .strip_suffix(RESYNC_SUFFIX)
                    .unwrap_or(&old_name)
                    .to_string();
                rename_options.push(RenameTableOption {
                    current_name: old_name,
                    new_name: new_name.clone(),
                });
                mapping.destination_table_identifier = new_name;
            }
            let rename_input = RenameTablesInput {
                flow_job_name: cfg.flow_job_name.clone(),
                peer: cfg.destination.clone(),
                rename_table_options: rename_options,
            };
            ctx.execute_activity("rename_tables", || {
                ctx.activities
                    .rename_tables(ctx.cancel.clone(), &rename_input)
            })
            .await?;
            // the schema mapping still points at the _resync names
            let renamed: std::collections::HashMap<_, _> = cfg
                .table_name_schema_mapping
                .drain()
                .map(|(name, schema)| {
                    (
                        name.strip_suffix(RESYNC_SUFFIX)
                            .map(str::to_string)
                            .unwrap_or(name),
                        schema,
                    )
                })
                .collect();
            cfg.table_name_schema_mapping = renamed;
        }

        state.snapshot_complete = true;
        state
            .progress
            .push("executed setup flow and snapshot flow".to_string());
        ctx.checkpoint(state).await;
    }

    let mut iterations_this_run = 0u32;
    loop {
        receive_and_handle_signal(ctx, state);

        if state.active_signal == CdcFlowSignal::Shutdown {
            tracing::info!(flow = ctx.flow_job_name, "peer flow has been shutdown");
            return Ok(FlowOutcome::Completed);
        }

        if state.active_signal == CdcFlowSignal::Pause {
            let pause_started = Instant::now();
            while state.active_signal == CdcFlowSignal::Pause {
                ctx.sleep(ctx.options.pause_granularity).await?;
                state
                    .progress
                    .push(format!("paused for {:?}", pause_started.elapsed()));
                ctx.checkpoint(state).await;
                receive_and_handle_signal(ctx, state);
            }
            if state.active_signal == CdcFlowSignal::Shutdown {
                continue;
            }
        }

        if limits.total_sync_flows != 0 && *sync_flows_completed >= limits.total_sync_flows {
            tracing::info!(
                "all {} requested sync flows have completed",
                limits.total_sync_flows
            );
            state.truncate_progress();
            return Ok(FlowOutcome::Completed);
        }

        if iterations_this_run >= MAX_SYNC_FLOWS_PER_CDC_FLOW {
            // keep idle WAL slots alive, then trim history
            if let Err(err) = ctx
                .execute_activity("send_wal_heartbeat", || {
                    ctx.activities.send_wal_heartbeat(ctx.cancel.clone(), cfg)
                })
                .await
            {
                return Err(anyhow::anyhow!("failed to send WAL heartbeat: {err:#}"));
            }
            return Ok(FlowOutcome::ContinueAsNew);
        }
        iterations_this_run += 1;
        *sync_flows_completed += 1;

        let sync_flow_id = ctx.child_workflow_id("sync-flow");
        tracing::debug!(workflow_id = sync_flow_id, "executing sync flow");
        let sync_result = super::sync_flow::sync_flow_workflow(
            ctx,
            cfg,
            limits,
            state.relation_message_mapping.clone(),
        )
        .await;

        let mut table_schema_deltas = Vec::new();
        match sync_result {
            Ok(Some(response)) => {
                table_schema_deltas = response.table_schema_deltas.clone();
                state.relation_message_mapping = response.relation_message_mapping.clone();
                state.sync_flow_statuses.push(response);
            }
            Ok(None) => {
                tracing::debug!(flow = ctx.flow_job_name, "no records in this cycle");
            }
            Err(err) => {
                tracing::error!(flow = ctx.flow_job_name, "failed to execute sync flow: {err:#}");
                state.sync_flow_errors.push(format!("{err:#}"));
            }
        }
        ctx.checkpoint(state).await;

        // the schema mapping is cached, so deltas require a refresh from
        // the source before the next normalize
        if !table_schema_deltas.is_empty() {
            let modified_src_tables: Vec<String> = table_schema_deltas
                .iter()
                .map(|d| d.src_table_name.clone())
                .collect();
            let modified_dst_tables: Vec<String> = table_schema_deltas
                .iter()
                .map(|d| d.dst_table_name.clone())
                .collect();

            match ctx
                .execute_activity("get_table_schema", || {
                    ctx.activities.get_table_schema(
                        ctx.cancel.clone(),
                        &cfg.source,
                        &modified_src_tables,
                    )
                })
                .await
            {
                Ok(schemas) => {
                    for (dst, schema) in modified_dst_tables.iter().zip(schemas) {
                        cfg.table_name_schema_mapping.insert(dst.clone(), schema);
                    }
                }
                Err(err) => {
                    tracing::error!("failed to execute schema update at source: {err:#}");
                    state.sync_flow_errors.push(format!("{err:#}"));
                }
            }
        }

        let normalize_flow_id = ctx.child_workflow_id("normalize-flow");
        tracing::debug!(workflow_id = normalize_flow_id, "executing normalize flow");
        match super::normalize_flow::normalize_flow_workflow(ctx, cfg).await {
            Ok(response) => state.normalize_flow_statuses.push(response),
            Err(err) => {
                tracing::error!("failed to execute normalize flow: {err:#}");
                state.normalize_flow_errors.push(format!("{err:#}"));
            }
        }
        ctx.checkpoint(state).await;
    }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_keeps_last_ten() {
        let mut state = CdcFlowWorkflowState::new();
        for i in 0..25 {
            state.progress.push(format!("step {i}"));
            state.sync_flow_statuses.push(SyncResponse::default());
            state.normalize_flow_statuses.push(NormalizeResponse::default());
        }
        state.sync_flow_errors.push("boom".to_string());
        state.truncate_progress();

        assert_eq!(state.progress.len(), RETAINED_STATUSES);
        assert_eq!(state.sync_flow_statuses.len(), RETAINED_STATUSES);
        assert_eq!(state.normalize_flow_statuses.len(), RETAINED_STATUSES);
        assert!(state.sync_flow_errors.is_empty());
        assert_eq!(state.progress.last().map(String::as_str), Some("step 24"));
    }

    #[test]
    fn pause_signal_toggles_on_repeat() {
        let mut state = CdcFlowWorkflowState::new();
        state.handle_signal(CdcFlowSignal::Pause);
        assert_eq!(state.active_signal, CdcFlowSignal::Pause);
        state.handle_signal(CdcFlowSignal::Pause);
        assert_eq!(state.active_signal, CdcFlowSignal::Noop);
    }

    #[test]
    fn shutdown_wins_over_pause() {
        let mut state = CdcFlowWorkflowState::new();
        state.handle_signal(CdcFlowSignal::Pause);
        state.handle_signal(CdcFlowSignal::Shutdown);
        assert_eq!(state.active_signal, CdcFlowSignal::Shutdown);
        state.handle_signal(CdcFlowSignal::Pause);
        assert_eq!(state.active_signal, CdcFlowSignal::Shutdown);
    }

    #[test]
    fn state_round_trips_through_serde() {
        let mut state = CdcFlowWorkflowState::new();
        state.setup_complete = true;
        state.sync_flow_statuses.push(SyncResponse {
            last_synced_checkpoint_id: 42,
            ..Default::default()
        });
        let json = serde_json::to_string(&state).unwrap();
        let back: CdcFlowWorkflowState = serde_json::from_str(&json).unwrap();
        assert!(back.setup_complete);
        assert_eq!(back.sync_flow_statuses[0].last_synced_checkpoint_id, 42);
        assert!(back.relation_message_mapping.is_empty());
    }
}
