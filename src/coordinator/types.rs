//! Engine state and pass reporting types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (full gap analysis done)
//!    ↓                              ↓
//! Stopped ←── ShuttingDown ←──── Running
//!
//! Starting ──(gap analysis failed)──→ Failed
//! ```
//!
//! - **Created**: after construction. `route_once()` already works.
//! - **Starting**: `start()` is repairing the gap table.
//! - **Running**: the routing loop and the purge task are active.
//! - **ShuttingDown**: `shutdown()` is draining the running pass.
//! - **Stopped**: all tasks finished. Safe to drop.
//! - **Failed**: startup could not complete.

use crate::gap::ReconcileReport;
use crate::router::ChannelPassResult;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Result of one routing pass over every enabled channel.
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub channels: Vec<ChannelPassResult>,
    pub gaps: ReconcileReport,
    /// Every channel read its whole range.
    pub all_data_read: bool,
    /// Distinct ids folded into the gap table.
    pub observed: usize,
    pub duration: Duration,
}

impl PassReport {
    pub fn is_success(&self) -> bool {
        self.channels.iter().all(|c| c.is_success())
    }

    pub fn rows_read(&self) -> u64 {
        self.channels.iter().map(|c| c.rows_read).sum()
    }

    pub fn data_events(&self) -> u64 {
        self.channels.iter().map(|c| c.data_events).sum()
    }

    pub fn failed_channels(&self) -> Vec<&str> {
        self.channels
            .iter()
            .filter(|c| !c.is_success())
            .map(|c| c.channel_id.as_str())
            .collect()
    }
}

/// Health snapshot for readiness and liveness endpoints.
///
/// Built from in-memory counters only; taking one does no I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running.
    pub ready: bool,
    /// Ready and the last passes did not keep failing.
    pub healthy: bool,
    pub passes: u64,
    pub consecutive_failures: usize,
    /// `None` until a pass has succeeded.
    pub millis_since_success: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Starting.to_string(), "Starting");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_pass_report_totals() {
        let report = PassReport {
            channels: vec![
                ChannelPassResult {
                    channel_id: "default".into(),
                    rows_read: 3,
                    data_events: 6,
                    ..Default::default()
                },
                ChannelPassResult {
                    channel_id: "config".into(),
                    rows_read: 1,
                    data_events: 1,
                    error: Some("boom".into()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(report.rows_read(), 4);
        assert_eq!(report.data_events(), 7);
        assert!(!report.is_success());
        assert_eq!(report.failed_channels(), vec!["config"]);
        assert!(PassReport::default().is_success());
    }
}
