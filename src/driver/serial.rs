// src/driver/serial.rs - serial transport to the motion controller
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serial2_tokio::SerialPort;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::gcode::Directive;

use super::{
    ACK_TIMEOUT_MS, ControllerFault, ControllerState, DriverError, ExecOutcome, MotionDriver,
    StatusReport, Submission,
};

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// One submission handed to the writer task.
enum Job {
    Stream {
        id: Uuid,
        directives: mpsc::UnboundedReceiver<Directive>,
        done: oneshot::Sender<ExecOutcome>,
    },
    List {
        id: Uuid,
        directives: Vec<Directive>,
        done: oneshot::Sender<ExecOutcome>,
    },
}

/// Driver for a controller on a serial port.
///
/// A reader task turns the newline-delimited JSON coming back from the
/// controller into broadcast status reports, and a writer task feeds it one
/// submission at a time. Control bytes (hold, resume, flush) are written
/// directly so they cut ahead of any stream in progress.
pub struct SerialDriver {
    port: Arc<SerialPort>,
    status_tx: broadcast::Sender<StatusReport>,
    last_fault: Arc<Mutex<Option<ControllerFault>>>,
    // Acknowledgements carry no correlation data, so waiters pair with
    // writes purely by order. Each entry is tagged so a waiter can only
    // ever remove itself.
    acks: Arc<Mutex<VecDeque<(Uuid, oneshot::Sender<()>)>>>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl SerialDriver {
    pub fn connect(port_name: &str, baud: u32) -> Result<Arc<Self>, DriverError> {
        let port = Arc::new(SerialPort::open(port_name, baud)?);
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let last_fault = Arc::new(Mutex::new(None));
        let acks = Arc::new(Mutex::new(VecDeque::new()));
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(
            Arc::clone(&port),
            status_tx.clone(),
            Arc::clone(&last_fault),
            Arc::clone(&acks),
        ));
        tokio::spawn(write_loop(Arc::clone(&port), jobs_rx, status_tx.clone()));

        tracing::info!("controller connected on {port_name} at {baud} baud");
        Ok(Arc::new(SerialDriver {
            port,
            status_tx,
            last_fault,
            acks,
            jobs: jobs_tx,
        }))
    }

    async fn send_control(&self, bytes: &[u8], what: &str) {
        if let Err(e) = self.port.write_all(bytes).await {
            tracing::error!("failed to send {what} to controller: {e}");
        }
    }
}

#[async_trait]
impl MotionDriver for SerialDriver {
    fn subscribe(&self) -> broadcast::Receiver<StatusReport> {
        self.status_tx.subscribe()
    }

    async fn last_fault(&self) -> Option<ControllerFault> {
        self.last_fault.lock().await.clone()
    }

    async fn clear_last_fault(&self) {
        self.last_fault.lock().await.take();
    }

    async fn set_parameter(&self, key: &str, value: f64) -> Result<(), DriverError> {
        let ack_id = Uuid::new_v4();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.acks.lock().await.push_back((ack_id, ack_tx));

        let mut line = serde_json::json!({ key: value }).to_string();
        line.push('\n');
        if let Err(e) = self.port.write_all(line.as_bytes()).await {
            // A write that never reached the port gets no ack; only its own
            // waiter may leave the pairing order.
            self.acks.lock().await.retain(|(id, _)| *id != ack_id);
            return Err(e.into());
        }

        match tokio::time::timeout(Duration::from_millis(ACK_TIMEOUT_MS), ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DriverError::Closed),
            Err(_) => {
                tracing::warn!("no acknowledgement for parameter {key}");
                Err(DriverError::AckTimeout)
            }
        }
    }

    async fn run_stream(
        &self,
        directives: mpsc::UnboundedReceiver<Directive>,
    ) -> Result<Submission, DriverError> {
        let id = Uuid::new_v4();
        let (done_tx, done_rx) = oneshot::channel();
        self.jobs
            .send(Job::Stream {
                id,
                directives,
                done: done_tx,
            })
            .map_err(|_| DriverError::Closed)?;
        Ok(Submission { id, done: done_rx })
    }

    async fn run_list(&self, directives: Vec<Directive>) -> Result<Submission, DriverError> {
        let id = Uuid::new_v4();
        let (done_tx, done_rx) = oneshot::channel();
        self.jobs
            .send(Job::List {
                id,
                directives,
                done: done_tx,
            })
            .map_err(|_| DriverError::Closed)?;
        Ok(Submission { id, done: done_rx })
    }

    async fn prime(&self) -> Result<(), DriverError> {
        self.port.write_all(b"\n").await?;
        Ok(())
    }

    async fn feed_hold(&self) {
        self.send_control(b"!", "feed hold").await;
    }

    async fn resume(&self) {
        self.send_control(b"~", "resume").await;
    }

    async fn quit(&self) {
        self.send_control(b"!%", "motion flush").await;
    }
}

async fn read_loop(
    port: Arc<SerialPort>,
    status_tx: broadcast::Sender<StatusReport>,
    last_fault: Arc<Mutex<Option<ControllerFault>>>,
    acks: Arc<Mutex<VecDeque<(Uuid, oneshot::Sender<()>)>>>,
) {
    let mut buf = vec![0u8; 1024];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        match port.read(&mut buf).await {
            Ok(0) => {
                tracing::warn!("controller closed the serial connection");
                break;
            }
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = pending.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw).trim().to_string();
                    if !line.is_empty() {
                        handle_line(&line, &status_tx, &last_fault, &acks).await;
                    }
                }
            }
            Err(e) => {
                tracing::error!("serial read failed: {e}");
                break;
            }
        }
    }
}

/// Frame shape for a line coming back from the controller: a status report,
/// a fault record, a command acknowledgement, or any mix of the three.
#[derive(Deserialize)]
struct Frame {
    #[serde(default)]
    sr: Option<StatusReport>,
    #[serde(default)]
    er: Option<ControllerFault>,
    #[serde(default)]
    r: Option<serde_json::Value>,
}

async fn handle_line(
    line: &str,
    status_tx: &broadcast::Sender<StatusReport>,
    last_fault: &Mutex<Option<ControllerFault>>,
    acks: &Mutex<VecDeque<(Uuid, oneshot::Sender<()>)>>,
) {
    let frame: Frame = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(_) => {
            // Boot banners and similar chatter come through as plain text.
            tracing::trace!("controller: {line}");
            return;
        }
    };

    // The fault record is stored before the report fans out so a subscriber
    // reacting to an alarm report finds it already in place.
    if let Some(fault) = frame.er {
        tracing::debug!("controller fault {}: {}", fault.code, fault.message);
        *last_fault.lock().await = Some(fault);
    }
    if frame.r.is_some() {
        // The oldest waiter owns this ack even if its caller has since
        // given up; handing it to the next one would shift every pairing
        // behind it.
        if let Some((_, waiter)) = acks.lock().await.pop_front() {
            let _ = waiter.send(());
        }
    }
    if let Some(report) = frame.sr {
        let _ = status_tx.send(report);
    }
}

async fn write_loop(
    port: Arc<SerialPort>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    status_tx: broadcast::Sender<StatusReport>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Stream {
                id,
                mut directives,
                done,
            } => {
                tracing::debug!(%id, "motion stream opened");
                let reports = status_tx.subscribe();
                let mut write_ok = true;
                while let Some(directive) = directives.recv().await {
                    if let Err(e) = write_line(&port, &directive).await {
                        tracing::error!("stream write failed: {e}");
                        write_ok = false;
                        break;
                    }
                }
                let final_state = if write_ok {
                    wait_quiescent(reports).await
                } else {
                    None
                };
                tracing::debug!(%id, ?final_state, "motion stream finished");
                let _ = done.send(ExecOutcome { id, final_state });
            }
            Job::List {
                id,
                directives,
                done,
            } => {
                let reports = status_tx.subscribe();
                let mut write_ok = true;
                for directive in &directives {
                    if let Err(e) = write_line(&port, directive).await {
                        tracing::error!("list write failed: {e}");
                        write_ok = false;
                        break;
                    }
                }
                let final_state = if write_ok {
                    wait_quiescent(reports).await
                } else {
                    None
                };
                tracing::debug!(%id, ?final_state, "list finished");
                let _ = done.send(ExecOutcome { id, final_state });
            }
        }
    }
}

async fn write_line(port: &SerialPort, directive: &Directive) -> std::io::Result<()> {
    let mut line = directive.to_string();
    line.push('\n');
    port.write_all(line.as_bytes()).await
}

/// Wait until the controller reports a state that means motion has drained.
async fn wait_quiescent(mut reports: broadcast::Receiver<StatusReport>) -> Option<ControllerState> {
    loop {
        match reports.recv().await {
            Ok(report) => {
                if let Some(state) = report.stat_state() {
                    match state {
                        ControllerState::Ready
                        | ControllerState::ProgramStop
                        | ControllerState::ProgramEnd
                        | ControllerState::Alarm
                        | ControllerState::Interlock
                        | ControllerState::Shutdown
                        | ControllerState::Panic => return Some(state),
                        _ => {}
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("status feed lagged by {skipped} reports");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
