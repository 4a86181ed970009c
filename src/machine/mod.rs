//! The machine model shared between the session and anything observing it.
//!
//! `Machine` holds the authoritative status snapshot: the session state, the
//! most recent operator-facing message, and a map of controller-reported
//! fields merged from sparse status reports. Every change is fanned out on a
//! broadcast channel so consoles and supervisors can watch without polling.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};

use crate::driver::StatusReport;

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Fields every status snapshot starts out with, before the controller has
/// reported anything.
const BASE_FIELDS: [(&str, f64); 10] = [
    ("posx", 0.0),
    ("posy", 0.0),
    ("posz", 0.0),
    ("posa", 0.0),
    ("posb", 0.0),
    ("posc", 0.0),
    ("vel", 0.0),
    ("feed", 0.0),
    ("line", 0.0),
    ("unit", 1.0),
];

/// What the manual session is currently doing with the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Manual,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Manual => write!(f, "manual"),
            SessionState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineStatus {
    pub state: SessionState,
    /// Most recent operator-facing message, if any.
    pub error: Option<String>,
    /// Set once a fatal controller fault has been seen. A dead machine needs
    /// a restart; session state no longer changes.
    pub dead: bool,
    pub fields: HashMap<String, serde_json::Value>,
    pub updated: DateTime<Utc>,
}

impl MachineStatus {
    fn initial() -> Self {
        let mut fields = HashMap::new();
        for (key, value) in BASE_FIELDS {
            fields.insert(key.to_string(), serde_json::json!(value));
        }
        fields.insert("stat".to_string(), serde_json::json!(0));
        MachineStatus {
            state: SessionState::Idle,
            error: None,
            dead: false,
            fields,
            updated: Utc::now(),
        }
    }
}

pub struct Machine {
    name: String,
    status: RwLock<MachineStatus>,
    dead: AtomicBool,
    status_tx: broadcast::Sender<MachineStatus>,
}

impl Machine {
    pub fn new(name: &str) -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Arc::new(Machine {
            name: name.to_string(),
            status: RwLock::new(MachineStatus::initial()),
            dead: AtomicBool::new(false),
            status_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MachineStatus> {
        self.status_tx.subscribe()
    }

    pub async fn status(&self) -> MachineStatus {
        self.status.read().await.clone()
    }

    pub async fn state(&self) -> SessionState {
        self.status.read().await.state
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Record a session state change. Ignored once the machine is dead.
    pub async fn set_state(&self, state: SessionState, error: Option<String>) {
        if self.is_dead() {
            tracing::debug!("{}: ignoring state change to {state}, machine is dead", self.name);
            return;
        }
        let snapshot = {
            let mut status = self.status.write().await;
            status.state = state;
            status.error = error;
            status.updated = Utc::now();
            status.clone()
        };
        tracing::debug!("{}: state -> {state}", self.name);
        let _ = self.status_tx.send(snapshot);
    }

    /// Fold a sparse controller report into the snapshot. Only fields present
    /// in the report are touched.
    pub async fn merge_report(&self, report: &StatusReport) {
        let snapshot = {
            let mut status = self.status.write().await;
            if let Some(stat) = report.stat {
                status.fields.insert("stat".to_string(), serde_json::json!(stat));
            }
            for (key, value) in &report.fields {
                status.fields.insert(key.clone(), value.clone());
            }
            status.updated = Utc::now();
            status.clone()
        };
        let _ = self.status_tx.send(snapshot);
    }

    /// Mark the machine as unrecoverable. The first call wins; repeats are
    /// logged and dropped.
    pub async fn die(&self, reason: &str) {
        if self.dead.swap(true, Ordering::SeqCst) {
            tracing::debug!("{}: already dead ({reason})", self.name);
            return;
        }
        tracing::error!("{}: {reason}", self.name);
        let snapshot = {
            let mut status = self.status.write().await;
            status.dead = true;
            status.error = Some(reason.to_string());
            status.updated = Utc::now();
            status.clone()
        };
        let _ = self.status_tx.send(snapshot);
    }
}
