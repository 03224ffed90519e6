pub mod activities;
pub mod runtime;
pub mod workflows;

pub use activities::FlowableActivity;
pub use runtime::{EngineOptions, FlowEngine, MemoryStateStore, RetryPolicy, StateStore};
pub use workflows::cdc_flow::{CdcFlowLimits, CdcFlowWorkflowState};
