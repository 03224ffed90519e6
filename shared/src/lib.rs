use std::fmt;

use serde::{Deserialize, Serialize};

pub const PEER_FLOW_TASK_QUEUE: &str = "peer-flow-task-queue";
pub const SNAPSHOT_FLOW_TASK_QUEUE: &str = "snapshot-flow-task-queue";

pub const CDC_FLOW_SIGNAL_NAME: &str = "peer-flow-signal";
pub const CDC_FLOW_STATUS_QUERY: &str = "q-cdc-flow-status";

/// Signal values accepted by a running CDC flow. Pause toggles on repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CdcFlowSignal {
    #[default]
    Noop,
    Pause,
    Shutdown,
}

impl fmt::Display for CdcFlowSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CdcFlowSignal::Noop => write!(f, "noop"),
            CdcFlowSignal::Pause => write!(f, "pause"),
            CdcFlowSignal::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Accumulates errors from child flows so one failed cycle does not lose
/// the errors of the previous ones. Cleared at truncation boundaries.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<anyhow::Error>,
}

impl MultiError {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn push(&mut self, err: anyhow::Error) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// First error, if any. Used to report a joined flush where successful
    /// sends are not rolled back.
    pub fn first(&self) -> Option<&anyhow::Error> {
        self.errors.first()
    }

    pub fn clear(&mut self) {
        self.errors.clear();
    }

    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| format!("{e:#}")).collect()
    }

    /// Collapses into a single error, or Ok when nothing accumulated.
    pub fn into_result(self) -> anyhow::Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(self.to_string()))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n\t* {err:#}")?;
        }
        Ok(())
    }
}

impl From<anyhow::Error> for MultiError {
    fn from(err: anyhow::Error) -> Self {
        Self { errors: vec![err] }
    }
}

impl FromIterator<anyhow::Error> for MultiError {
    fn from_iter<I: IntoIterator<Item = anyhow::Error>>(iter: I) -> Self {
        Self {
            errors: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_error_joins_messages() {
        let mut errs = MultiError::new();
        errs.push(anyhow::anyhow!("first failure"));
        errs.push(anyhow::anyhow!("second failure"));
        let msg = errs.to_string();
        assert!(msg.contains("2 error(s)"), "got: {msg}");
        assert!(msg.contains("first failure"));
        assert!(msg.contains("second failure"));
    }

    #[test]
    fn empty_multi_error_is_ok() {
        let errs = MultiError::new();
        assert!(errs.is_empty());
        assert!(errs.into_result().is_ok());
    }

    #[test]
    fn signal_round_trips_through_serde() {
        let sig = CdcFlowSignal::Pause;
        let json = serde_json::to_string(&sig).unwrap();
        let back: CdcFlowSignal = serde_json::from_str(&json).unwrap();
        assert_eq!(sig, back);
    }
}
