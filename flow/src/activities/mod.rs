pub mod flowable;
pub mod heartbeat;

pub use flowable::{CheckConnectionResult, FlowableActivity, StartFlowInput};
pub use heartbeat::{record_heartbeat, HeartbeatRoutine};
