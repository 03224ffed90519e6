pub mod cdc_flow;
pub mod normalize_flow;
pub mod qrep_flow;
pub mod setup_flow;
pub mod snapshot_flow;
pub mod sync_flow;
