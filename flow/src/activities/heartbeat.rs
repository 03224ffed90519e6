use std::time::Duration;

use tokio::sync::oneshot;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Emits a heartbeat for a long-running activity. Safe to call from any
/// task, including outside an activity scope, where it only logs.
pub fn record_heartbeat(activity: &str, details: &str) {
    tracing::debug!(target: "activity_heartbeat", activity, "{details}");
}

/// Background ticker emitting numbered heartbeats until dropped.
pub struct HeartbeatRoutine {
    shutdown: Option<oneshot::Sender<()>>,
}

impl HeartbeatRoutine {
    pub fn start(
        activity: &'static str,
        interval: Duration,
        message: impl Fn() -> String + Send + 'static,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut counter = 1u64;
            loop {
                record_heartbeat(activity, &format!("heartbeat #{counter}: {}", message()));
                counter += 1;
                tokio::select! {
                    _ = &mut shutdown_rx => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
        Self {
            shutdown: Some(shutdown_tx),
        }
    }
}

impl Drop for HeartbeatRoutine {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}
