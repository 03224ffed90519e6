use tokio::sync::{mpsc, oneshot};

/// Outcome of replication-slot creation, sent once by the connector's
/// background worker.
#[derive(Debug, Clone)]
pub struct SlotCreated {
    pub slot_name: String,
    pub snapshot_name: String,
    pub error: Option<String>,
}

/// Connector half of the slot handshake: announce the created slot, then
/// hold the exported snapshot open until the clone completes.
pub struct SlotSignalWorker {
    pub slot_created: mpsc::Sender<SlotCreated>,
    pub clone_complete: oneshot::Receiver<()>,
}

/// Activity half: wait for the slot, and release the snapshot when the
/// initial copy is done.
pub struct SlotSignalHandle {
    pub slot_created: mpsc::Receiver<SlotCreated>,
    pub clone_complete: oneshot::Sender<()>,
}

pub fn slot_signal() -> (SlotSignalHandle, SlotSignalWorker) {
    let (created_tx, created_rx) = mpsc::channel(1);
    let (complete_tx, complete_rx) = oneshot::channel();
    (
        SlotSignalHandle {
            slot_created: created_rx,
            clone_complete: complete_tx,
        },
        SlotSignalWorker {
            slot_created: created_tx,
            clone_complete: complete_rx,
        },
    )
}
