// src/driver/sim.rs - in-process controller stand-in for tests and offline bring-up
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::gcode::Directive;

use super::{
    ControllerFault, ControllerState, DriverError, ExecOutcome, MotionDriver, StatusReport,
    Submission,
};

const STATUS_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_EXEC_DELAY: Duration = Duration::from_millis(50);

/// Counters describing everything the simulated controller has been asked to
/// do. Snapshots are cheap to clone out for assertions.
#[derive(Debug, Default, Clone)]
pub struct SimStats {
    pub streams_opened: usize,
    pub streams_open: usize,
    pub max_streams_open: usize,
    pub lists_run: usize,
    pub lists_refused: usize,
    pub primes: usize,
    pub quits: usize,
    pub holds: usize,
    pub resumes: usize,
    pub fault_clears: usize,
}

/// A controller that accepts submissions, records every line it is handed,
/// and reports completion after a fixed simulated execution delay. Status
/// reports and fault records are injected by the caller, and submissions can
/// be made to fail on demand.
pub struct SimDriver {
    status_tx: broadcast::Sender<StatusReport>,
    last_fault: Mutex<Option<ControllerFault>>,
    lines: Arc<Mutex<Vec<String>>>,
    params: Mutex<Vec<(String, f64)>>,
    stats: Arc<Mutex<SimStats>>,
    fail_lists: Mutex<usize>,
    exec_delay: Duration,
}

impl SimDriver {
    pub fn new() -> Arc<Self> {
        Self::with_exec_delay(DEFAULT_EXEC_DELAY)
    }

    pub fn with_exec_delay(exec_delay: Duration) -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Arc::new(SimDriver {
            status_tx,
            last_fault: Mutex::new(None),
            lines: Arc::new(Mutex::new(Vec::new())),
            params: Mutex::new(Vec::new()),
            stats: Arc::new(Mutex::new(SimStats::default())),
            fail_lists: Mutex::new(0),
            exec_delay,
        })
    }

    /// Publish a status report as if the controller had sent it.
    pub fn inject(&self, report: StatusReport) {
        let _ = self.status_tx.send(report);
    }

    /// Record a fault as if the controller had raised it. Usually paired with
    /// an injected alarm report.
    pub async fn raise_fault(&self, code: u16, message: &str) {
        *self.last_fault.lock().await = Some(ControllerFault {
            code,
            message: message.to_string(),
        });
    }

    /// Every directive line handed to the controller so far, in order.
    pub async fn sent_lines(&self) -> Vec<String> {
        self.lines.lock().await.clone()
    }

    /// Parameter writes in the order they were made.
    pub async fn parameter_writes(&self) -> Vec<(String, f64)> {
        self.params.lock().await.clone()
    }

    /// Refuse the next `count` list submissions.
    pub async fn fail_next_lists(&self, count: usize) {
        *self.fail_lists.lock().await += count;
    }

    pub async fn stats(&self) -> SimStats {
        self.stats.lock().await.clone()
    }

    /// Emit a trickle of position reports so an interactive console has
    /// something to show when no real tool is attached.
    pub fn spawn_demo_feed(self: &Arc<Self>, period: Duration) {
        let status_tx = self.status_tx.clone();
        tokio::spawn(async move {
            let mut posx = 0.0f64;
            loop {
                tokio::time::sleep(period).await;
                posx += rand::rng().random_range(-0.05..0.05);
                let mut report = StatusReport::default();
                report.fields.insert(
                    "posx".to_string(),
                    serde_json::json!((posx * 1000.0).round() / 1000.0),
                );
                report
                    .fields
                    .insert("vel".to_string(), serde_json::json!(0.0));
                if status_tx.send(report).is_err() {
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl MotionDriver for SimDriver {
    fn subscribe(&self) -> broadcast::Receiver<StatusReport> {
        self.status_tx.subscribe()
    }

    async fn last_fault(&self) -> Option<ControllerFault> {
        self.last_fault.lock().await.clone()
    }

    async fn clear_last_fault(&self) {
        self.last_fault.lock().await.take();
        self.stats.lock().await.fault_clears += 1;
    }

    async fn set_parameter(&self, key: &str, value: f64) -> Result<(), DriverError> {
        self.params.lock().await.push((key.to_string(), value));
        Ok(())
    }

    async fn run_stream(
        &self,
        mut directives: mpsc::UnboundedReceiver<Directive>,
    ) -> Result<Submission, DriverError> {
        let id = Uuid::new_v4();
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut stats = self.stats.lock().await;
            stats.streams_opened += 1;
            stats.streams_open += 1;
            stats.max_streams_open = stats.max_streams_open.max(stats.streams_open);
        }

        let lines = Arc::clone(&self.lines);
        let stats = Arc::clone(&self.stats);
        let status_tx = self.status_tx.clone();
        let exec_delay = self.exec_delay;
        tokio::spawn(async move {
            while let Some(directive) = directives.recv().await {
                lines.lock().await.push(directive.to_string());
            }
            // Sender dropped: whatever was buffered drains, then the
            // controller goes quiet.
            tokio::time::sleep(exec_delay).await;
            stats.lock().await.streams_open -= 1;
            let _ = status_tx.send(StatusReport::with_stat(ControllerState::ProgramStop));
            let _ = done_tx.send(ExecOutcome {
                id,
                final_state: Some(ControllerState::ProgramStop),
            });
        });

        Ok(Submission { id, done: done_rx })
    }

    async fn run_list(&self, directives: Vec<Directive>) -> Result<Submission, DriverError> {
        let refused = {
            let mut budget = self.fail_lists.lock().await;
            if *budget > 0 {
                *budget -= 1;
                true
            } else {
                false
            }
        };
        if refused {
            self.stats.lock().await.lists_refused += 1;
            return Err(DriverError::Closed);
        }

        let id = Uuid::new_v4();
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut lines = self.lines.lock().await;
            for directive in &directives {
                lines.push(directive.to_string());
            }
        }
        self.stats.lock().await.lists_run += 1;

        let status_tx = self.status_tx.clone();
        let exec_delay = self.exec_delay;
        tokio::spawn(async move {
            tokio::time::sleep(exec_delay).await;
            let _ = status_tx.send(StatusReport::with_stat(ControllerState::ProgramStop));
            let _ = done_tx.send(ExecOutcome {
                id,
                final_state: Some(ControllerState::ProgramStop),
            });
        });

        Ok(Submission { id, done: done_rx })
    }

    async fn prime(&self) -> Result<(), DriverError> {
        self.stats.lock().await.primes += 1;
        Ok(())
    }

    async fn feed_hold(&self) {
        self.stats.lock().await.holds += 1;
        tracing::debug!("sim: feed hold");
    }

    async fn resume(&self) {
        self.stats.lock().await.resumes += 1;
        tracing::debug!("sim: resume");
    }

    async fn quit(&self) {
        self.stats.lock().await.quits += 1;
        tracing::debug!("sim: motion flush");
    }
}
