//! Motion controller drivers.
//!
//! A driver owns the link to the motion controller, fans status reports out
//! over a broadcast channel, and accepts motion either as an open stream of
//! directives (for manual jogging, where the end is not known up front) or as
//! a finite list. Exactly one submission runs at a time; the session layer is
//! responsible for never opening a second one while the first is in flight.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::gcode::Directive;

pub mod serial;
pub mod sim;

/// Fault code the controller raises when a travel limit trips.
pub const FAULT_CODE_LIMIT: u16 = 203;

/// How long to wait for the controller to acknowledge a parameter write.
pub const ACK_TIMEOUT_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("serial port error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for controller acknowledgement")]
    AckTimeout,
    #[error("driver is no longer running")]
    Closed,
}

/// Controller execution states as carried in the `stat` field of a status
/// report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Init,
    Ready,
    Alarm,
    ProgramStop,
    ProgramEnd,
    Running,
    Hold,
    Probe,
    Cycle,
    Homing,
    Jog,
    Interlock,
    Shutdown,
    Panic,
}

impl ControllerState {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ControllerState::Init),
            1 => Some(ControllerState::Ready),
            2 => Some(ControllerState::Alarm),
            3 => Some(ControllerState::ProgramStop),
            4 => Some(ControllerState::ProgramEnd),
            5 => Some(ControllerState::Running),
            6 => Some(ControllerState::Hold),
            7 => Some(ControllerState::Probe),
            8 => Some(ControllerState::Cycle),
            9 => Some(ControllerState::Homing),
            10 => Some(ControllerState::Jog),
            11 => Some(ControllerState::Interlock),
            12 => Some(ControllerState::Shutdown),
            13 => Some(ControllerState::Panic),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ControllerState::Init => 0,
            ControllerState::Ready => 1,
            ControllerState::Alarm => 2,
            ControllerState::ProgramStop => 3,
            ControllerState::ProgramEnd => 4,
            ControllerState::Running => 5,
            ControllerState::Hold => 6,
            ControllerState::Probe => 7,
            ControllerState::Cycle => 8,
            ControllerState::Homing => 9,
            ControllerState::Jog => 10,
            ControllerState::Interlock => 11,
            ControllerState::Shutdown => 12,
            ControllerState::Panic => 13,
        }
    }
}

/// One status report from the controller. Reports are sparse: only the fields
/// that changed since the last report are present, so consumers merge rather
/// than replace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<u8>,
    #[serde(flatten)]
    pub fields: HashMap<String, serde_json::Value>,
}

impl StatusReport {
    pub fn with_stat(state: ControllerState) -> Self {
        StatusReport {
            stat: Some(state.code()),
            fields: HashMap::new(),
        }
    }

    pub fn stat_state(&self) -> Option<ControllerState> {
        self.stat.and_then(ControllerState::from_code)
    }
}

/// A fault record reported by the controller alongside an alarm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerFault {
    #[serde(rename = "st")]
    pub code: u16,
    #[serde(rename = "msg")]
    pub message: String,
}

/// Final word on a finished submission.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub id: Uuid,
    pub final_state: Option<ControllerState>,
}

/// Handle for one accepted submission. `done` resolves when the controller
/// has drained the motion, or is dropped if the driver shuts down first.
#[derive(Debug)]
pub struct Submission {
    pub id: Uuid,
    pub done: oneshot::Receiver<ExecOutcome>,
}

#[async_trait]
pub trait MotionDriver: Send + Sync {
    /// Subscribe to the controller's status report feed.
    fn subscribe(&self) -> broadcast::Receiver<StatusReport>;

    /// The most recent unconsumed fault record, if any.
    async fn last_fault(&self) -> Option<ControllerFault>;

    /// Consume the stored fault record.
    async fn clear_last_fault(&self);

    /// Write a controller parameter and wait for the acknowledgement.
    async fn set_parameter(&self, key: &str, value: f64) -> Result<(), DriverError>;

    /// Open a directive stream. Lines sent on the channel are forwarded to
    /// the controller as they arrive; closing the channel ends the stream and
    /// lets buffered motion drain.
    async fn run_stream(
        &self,
        directives: mpsc::UnboundedReceiver<Directive>,
    ) -> Result<Submission, DriverError>;

    /// Submit a finite list of directives.
    async fn run_list(&self, directives: Vec<Directive>) -> Result<Submission, DriverError>;

    /// Nudge the controller to start consuming whatever has been written.
    async fn prime(&self) -> Result<(), DriverError>;

    /// Ask the controller to pause motion at the next convenient point.
    async fn feed_hold(&self);

    /// Resume motion paused by a feed hold.
    async fn resume(&self);

    /// Abandon any queued motion.
    async fn quit(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_codes_round_trip() {
        for code in 0..=13 {
            let state = ControllerState::from_code(code).unwrap();
            assert_eq!(state.code(), code);
        }
        assert_eq!(ControllerState::from_code(14), None);
        assert_eq!(ControllerState::from_code(255), None);
    }

    #[test]
    fn report_parses_stat_and_extras() {
        let report: StatusReport =
            serde_json::from_str(r#"{"stat":5,"posx":1.25,"vel":120.0}"#).unwrap();
        assert_eq!(report.stat_state(), Some(ControllerState::Running));
        assert_eq!(report.fields["posx"], serde_json::json!(1.25));
        assert_eq!(report.fields["vel"], serde_json::json!(120.0));
    }

    #[test]
    fn report_without_stat_is_routine() {
        let report: StatusReport = serde_json::from_str(r#"{"posy":-3.5}"#).unwrap();
        assert_eq!(report.stat, None);
        assert_eq!(report.stat_state(), None);
    }

    #[test]
    fn fault_uses_wire_field_names() {
        let fault: ControllerFault =
            serde_json::from_str(r#"{"st":203,"msg":"[G1] y axis soft limit"}"#).unwrap();
        assert_eq!(fault.code, FAULT_CODE_LIMIT);
        assert_eq!(fault.message, "[G1] y axis soft limit");
    }
}
