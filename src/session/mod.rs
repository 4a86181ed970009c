// src/session/mod.rs - the manual motion session actor
//
// All session logic runs on one task. Commands, controller status reports,
// submission completions and the renewal timer are funneled through a single
// select loop, so no two continuations ever touch the bookkeeping at once.

pub mod fault;
pub mod fixed;
pub mod lease;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::JogConfig;
use crate::driver::{
    DriverError, ExecOutcome, FAULT_CODE_LIMIT, MotionDriver, StatusReport, Submission,
};
use crate::gcode::{Axis, Directive};
use crate::machine::{Machine, SessionState};

use self::fault::FaultClass;
use self::fixed::{FixedMove, FixedMoveQueue};
use self::lease::{JogLease, T_RENEW};

/// Controller parameter for the z pull-up applied between moves. Zeroed for
/// the duration of a jog so manual z motion lands where it was aimed, then
/// put back from config.
pub const PARAM_Z_LIFT: &str = "zl";

const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// One manual motion request, in the shape it arrives off the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum JogCode {
    /// Begin or keep alive a continuous jog. The sign of `speed` picks the
    /// direction of travel.
    Start { axis: Axis, speed: f64 },
    /// Wind down whatever is moving.
    Stop,
    /// Renew the current jog without restating it.
    Maint,
    /// A discrete move of `dist` units, rapid when `speed` is zero.
    Fixed {
        axis: Axis,
        speed: f64,
        #[serde(rename = "dist")]
        distance: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("cannot disconnect while the tool is in motion")]
    StillMoving,
    #[error("jog session is no longer running")]
    Disconnected,
}

enum SessionCommand {
    Execute {
        code: JogCode,
        done: Option<oneshot::Sender<()>>,
    },
    Pause,
    Resume,
    Quit,
    Disconnect {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
}

enum SessionEvent {
    Done {
        id: Uuid,
        outcome: Option<ExecOutcome>,
    },
}

/// What the driver is currently executing for us. At most one submission is
/// ever in flight; everything else waits.
enum Inflight {
    Jog {
        id: Uuid,
        /// `None` once a stop has closed the stream but the tail of the
        /// motion is still draining.
        stream: Option<mpsc::UnboundedSender<Directive>>,
        lease: JogLease,
    },
    Fixed { id: Uuid },
}

impl Inflight {
    fn id(&self) -> Uuid {
        match self {
            Inflight::Jog { id, .. } => *id,
            Inflight::Fixed { id } => *id,
        }
    }
}

/// Cloneable front door to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub async fn execute(&self, code: JogCode) -> Result<(), SessionError> {
        self.send(SessionCommand::Execute { code, done: None }).await
    }

    /// Like `execute`, but also hands back a receiver that fires when the
    /// session next returns to idle. A later request that brings its own
    /// notifier replaces this one, cancelling the receiver.
    pub async fn execute_notify(
        &self,
        code: JogCode,
    ) -> Result<oneshot::Receiver<()>, SessionError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(SessionCommand::Execute {
            code,
            done: Some(done_tx),
        })
        .await?;
        Ok(done_rx)
    }

    /// Decode and run a raw wire command. Unrecognized commands are logged
    /// and dropped rather than bubbled up.
    pub async fn execute_json(&self, raw: serde_json::Value) -> Result<(), SessionError> {
        match serde_json::from_value::<JogCode>(raw) {
            Ok(code) => self.execute(code).await,
            Err(e) => {
                tracing::error!("unrecognized manual command: {e}");
                Ok(())
            }
        }
    }

    /// Feed hold: pause motion where it is.
    pub async fn pause(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Pause).await
    }

    /// Resume motion paused by a feed hold.
    pub async fn resume(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Resume).await
    }

    /// Abandon queued motion on the controller.
    pub async fn quit(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Quit).await
    }

    /// Wind the session down. Refused while the tool is in motion.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Disconnect { respond_to: tx })
            .await?;
        rx.await.map_err(|_| SessionError::Disconnected)?
    }

    async fn send(&self, cmd: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| SessionError::Disconnected)
    }
}

pub struct JogSession {
    machine: Arc<Machine>,
    driver: Arc<dyn MotionDriver>,
    config: JogConfig,
    inflight: Option<Inflight>,
    fixed_queue: FixedMoveQueue,
    pending_jog: Option<(Axis, f64)>,
    renew_at: Option<Instant>,
    idle_notify: Option<oneshot::Sender<()>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl JogSession {
    /// Bind a session to a machine and driver and start its task. The
    /// returned handle is the only way to talk to it.
    pub fn connect(
        machine: Arc<Machine>,
        driver: Arc<dyn MotionDriver>,
        config: JogConfig,
    ) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        // The subscription must exist before connect returns; reports sent
        // while the task waits to be scheduled buffer in the receiver.
        let reports = driver.subscribe();
        let session = JogSession {
            machine,
            driver,
            config,
            inflight: None,
            fixed_queue: FixedMoveQueue::default(),
            pending_jog: None,
            renew_at: None,
            idle_notify: None,
            events_tx,
        };
        tokio::spawn(session.run(commands_rx, events_rx, reports));
        SessionHandle {
            commands: commands_tx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        mut reports: broadcast::Receiver<StatusReport>,
    ) {
        tracing::info!("manual session connected to {}", self.machine.name());
        let mut commands_open = true;
        loop {
            // Parked an hour out when no jog is armed; the guard keeps the
            // arm from being polled in that case.
            let renew_deadline = self
                .renew_at
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                maybe_cmd = commands.recv(), if commands_open => match maybe_cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => commands_open = false,
                },
                maybe_event = events.recv() => {
                    if let Some(SessionEvent::Done { id, outcome }) = maybe_event {
                        self.on_complete(id, outcome).await;
                    }
                },
                report = reports.recv() => match report {
                    Ok(report) => self.on_report(report).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("status feed lagged by {skipped} reports");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("driver status feed closed");
                        break;
                    }
                },
                _ = tokio::time::sleep_until(renew_deadline), if self.renew_at.is_some() => {
                    self.renew_tick().await;
                }
            }
            if !commands_open && self.inflight.is_none() {
                break;
            }
        }
        tracing::debug!("manual session wound down");
    }

    /// Returns false when the session should shut down.
    async fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Execute { code, done } => {
                if let Some(done) = done {
                    self.idle_notify = Some(done);
                }
                if self.machine.is_dead() {
                    tracing::debug!("ignoring {code:?}: machine is dead");
                    return true;
                }
                if self.machine.state().await == SessionState::Stopped {
                    tracing::debug!("ignoring {code:?} while stopped");
                    return true;
                }
                match code {
                    JogCode::Start { axis, speed } => self.start_motion(axis, speed).await,
                    JogCode::Stop => {
                        self.pending_jog = None;
                        self.stop_motion().await;
                    }
                    JogCode::Maint => self.maintain(),
                    JogCode::Fixed {
                        axis,
                        speed,
                        distance,
                    } => {
                        self.fixed_move(FixedMove {
                            axis,
                            speed,
                            distance,
                        })
                        .await;
                    }
                }
                // A notifier attached to a command that leaves nothing in
                // flight resolves now; there is no completion to wait for.
                if self.inflight.is_none()
                    && self.pending_jog.is_none()
                    && self.machine.state().await == SessionState::Idle
                {
                    if let Some(done) = self.idle_notify.take() {
                        let _ = done.send(());
                    }
                }
            }
            SessionCommand::Pause => self.driver.feed_hold().await,
            SessionCommand::Resume => self.driver.resume().await,
            SessionCommand::Quit => self.driver.quit().await,
            SessionCommand::Disconnect { respond_to } => {
                if self.inflight.is_some() {
                    let _ = respond_to.send(Err(SessionError::StillMoving));
                } else {
                    self.change_state(SessionState::Idle, None).await;
                    let _ = respond_to.send(Ok(()));
                    return false;
                }
            }
        }
        true
    }

    async fn start_motion(&mut self, axis: Axis, speed: f64) {
        enum Action {
            Renew,
            Restart,
            Refuse,
            Open,
        }
        let action = match &mut self.inflight {
            Some(Inflight::Jog { lease, stream, .. }) => {
                if stream.is_some() && lease.matches(axis, speed) {
                    lease.renew();
                    Action::Renew
                } else {
                    Action::Restart
                }
            }
            Some(Inflight::Fixed { .. }) => Action::Refuse,
            None => Action::Open,
        };
        match action {
            Action::Renew => tracing::debug!("jog renewed by repeated start"),
            Action::Restart => {
                tracing::info!("changing heading to {axis} at {speed} units/min");
                self.pending_jog = Some((axis, speed));
                self.stop_motion().await;
            }
            Action::Refuse => {
                tracing::warn!("jog request refused: a fixed move is in flight");
            }
            Action::Open => self.open_jog(axis, speed).await,
        }
    }

    async fn open_jog(&mut self, axis: Axis, speed: f64) {
        if let Err(e) = self.try_open_jog(axis, speed).await {
            tracing::error!("could not start jog on {axis}: {e}");
            self.drop_queued_moves();
            self.change_state(SessionState::Idle, None).await;
        }
    }

    async fn try_open_jog(&mut self, axis: Axis, speed: f64) -> Result<(), DriverError> {
        self.driver.set_parameter(PARAM_Z_LIFT, 0.0).await?;
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let submission = match self.driver.run_stream(stream_rx).await {
            Ok(submission) => submission,
            Err(e) => {
                self.restore_z_lift().await;
                return Err(e);
            }
        };
        let id = submission.id;
        self.watch_submission(submission);
        self.inflight = Some(Inflight::Jog {
            id,
            stream: Some(stream_tx),
            lease: JogLease::new(axis, speed),
        });
        self.change_state(SessionState::Manual, None).await;
        tracing::info!("jog started: {axis} at {speed} units/min");
        self.renew_tick().await;
        Ok(())
    }

    /// One renewal period has elapsed. Emit the next batch if the lease was
    /// renewed in time, otherwise wind the jog down.
    async fn renew_tick(&mut self) {
        let batch = match &mut self.inflight {
            Some(Inflight::Jog { lease, .. }) => lease.consume(),
            _ => {
                self.renew_at = None;
                return;
            }
        };
        match batch {
            Some(batch) => {
                if let Some(Inflight::Jog {
                    stream: Some(stream),
                    ..
                }) = &self.inflight
                {
                    for directive in batch {
                        if stream.send(directive).is_err() {
                            tracing::warn!("motion stream closed underneath the session");
                            break;
                        }
                    }
                }
                if let Err(e) = self.driver.prime().await {
                    tracing::warn!("prime failed: {e}");
                }
                self.renew_at = Some(Instant::now() + T_RENEW);
            }
            None => {
                tracing::debug!("jog lease expired");
                self.stop_motion().await;
            }
        }
    }

    async fn stop_motion(&mut self) {
        if self.handle_limit_fault().await {
            return;
        }
        let Some(inflight) = &mut self.inflight else {
            return;
        };
        if let Inflight::Jog { stream, lease, .. } = inflight {
            lease.release();
            // Closing the stream lets buffered motion drain on a segment
            // boundary.
            stream.take();
            self.renew_at = None;
        }
        self.driver.quit().await;
    }

    fn maintain(&mut self) {
        match &mut self.inflight {
            Some(Inflight::Jog { lease, .. }) => lease.renew(),
            _ => tracing::debug!("maintain request with no jog in flight"),
        }
    }

    async fn fixed_move(&mut self, mv: FixedMove) {
        if self.inflight.is_some() {
            tracing::debug!(
                "tool busy, queueing fixed move ({} waiting)",
                self.fixed_queue.len() + 1
            );
            self.fixed_queue.push(mv);
            return;
        }
        self.begin_fixed(mv).await;
    }

    async fn begin_fixed(&mut self, mv: FixedMove) {
        match self.driver.run_list(mv.directives()).await {
            Ok(submission) => {
                let id = submission.id;
                self.watch_submission(submission);
                self.inflight = Some(Inflight::Fixed { id });
                self.change_state(SessionState::Manual, None).await;
                tracing::info!("fixed move: {} {:+.5}", mv.axis, mv.distance);
            }
            Err(e) => {
                tracing::error!("could not submit fixed move: {e}");
                self.drop_queued_moves();
                self.change_state(SessionState::Idle, None).await;
            }
        }
    }

    /// Queued moves only ever drain on the heels of a completion. When a
    /// submission fails to open, no completion is coming, so anything still
    /// waiting is dropped rather than left to run behind a later request.
    fn drop_queued_moves(&mut self) {
        if !self.fixed_queue.is_empty() {
            tracing::warn!("dropping {} queued fixed moves", self.fixed_queue.len());
            self.fixed_queue.clear();
        }
    }

    /// Relay a submission's completion into the event queue so the select
    /// loop stays the only place session state changes.
    fn watch_submission(&self, submission: Submission) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = submission.done.await.ok();
            let _ = events.send(SessionEvent::Done {
                id: submission.id,
                outcome,
            });
        });
    }

    async fn on_complete(&mut self, id: Uuid, outcome: Option<ExecOutcome>) {
        match &self.inflight {
            Some(inflight) if inflight.id() == id => {}
            _ => {
                tracing::debug!("completion for a retired submission");
                return;
            }
        }
        let finished = self.inflight.take();
        self.renew_at = None;
        match finished {
            Some(Inflight::Jog { .. }) => {
                let final_state = outcome.and_then(|o| o.final_state);
                tracing::info!(?final_state, "jog stream finished");
                self.restore_z_lift().await;
            }
            Some(Inflight::Fixed { .. }) => tracing::debug!("fixed move finished"),
            None => return,
        }

        if self.machine.is_dead() {
            self.pending_jog = None;
            return;
        }

        if let Some((axis, speed)) = self.pending_jog.take() {
            self.open_jog(axis, speed).await;
            return;
        }
        if let Some(mv) = self.fixed_queue.pop_next() {
            self.begin_fixed(mv).await;
            return;
        }
        self.change_state(SessionState::Idle, None).await;
    }

    async fn on_report(&mut self, report: StatusReport) {
        match fault::classify(&report) {
            FaultClass::Fatal { state } => {
                tracing::error!(?state, "fatal controller fault");
                self.machine
                    .die("A fatal controller fault has occurred. You must restart your tool.")
                    .await;
            }
            FaultClass::AlarmCheck => {
                if self.handle_limit_fault().await {
                    return;
                }
                match self.driver.last_fault().await {
                    Some(fault) => tracing::warn!(
                        "controller alarm with unhandled fault {}: {}",
                        fault.code,
                        fault.message
                    ),
                    None => tracing::warn!("controller alarm with no fault record"),
                }
                self.machine.merge_report(&report).await;
            }
            FaultClass::Routine => self.machine.merge_report(&report).await,
        }
    }

    /// Check the stored fault record for a tripped travel limit. Returns true
    /// when one was found and the session has moved to Stopped.
    async fn handle_limit_fault(&mut self) -> bool {
        let Some(fault) = self.driver.last_fault().await else {
            return false;
        };
        if fault.code != FAULT_CODE_LIMIT {
            return false;
        }
        let message = fault::clean_limit_message(&fault.message);
        tracing::warn!("limit tripped: {message}");
        self.driver.clear_last_fault().await;
        self.enter_stopped(message).await;
        true
    }

    async fn enter_stopped(&mut self, message: String) {
        self.pending_jog = None;
        self.renew_at = None;
        if let Some(inflight) = self.inflight.take() {
            // The alarm has already halted the controller; dropping the
            // stream sender just retires our side of it.
            if let Inflight::Jog { .. } = inflight {
                self.restore_z_lift().await;
            }
        }
        self.change_state(SessionState::Stopped, Some(message)).await;
    }

    async fn restore_z_lift(&mut self) {
        if let Err(e) = self
            .driver
            .set_parameter(PARAM_Z_LIFT, self.config.z_lift)
            .await
        {
            tracing::warn!("could not restore z lift: {e}");
        }
    }

    async fn change_state(&mut self, state: SessionState, error: Option<String>) {
        if state == SessionState::Idle {
            if let Some(done) = self.idle_notify.take() {
                let _ = done.send(());
            }
        }
        self.machine.set_state(state, error).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_command_parses_from_wire_shape() {
        let code: JogCode =
            serde_json::from_value(serde_json::json!({"cmd": "start", "axis": "x", "speed": 600.0}))
                .unwrap();
        assert_eq!(
            code,
            JogCode::Start {
                axis: Axis::X,
                speed: 600.0
            }
        );
    }

    #[test]
    fn fixed_command_uses_dist_on_the_wire() {
        let code: JogCode = serde_json::from_value(
            serde_json::json!({"cmd": "fixed", "axis": "Y", "speed": 300.0, "dist": -5.0}),
        )
        .unwrap();
        assert_eq!(
            code,
            JogCode::Fixed {
                axis: Axis::Y,
                speed: 300.0,
                distance: -5.0
            }
        );
    }

    #[test]
    fn bare_commands_parse() {
        let stop: JogCode = serde_json::from_value(serde_json::json!({"cmd": "stop"})).unwrap();
        assert_eq!(stop, JogCode::Stop);
        let maint: JogCode = serde_json::from_value(serde_json::json!({"cmd": "maint"})).unwrap();
        assert_eq!(maint, JogCode::Maint);
    }

    #[test]
    fn unknown_commands_fail_to_parse() {
        let result = serde_json::from_value::<JogCode>(serde_json::json!({"cmd": "warble"}));
        assert!(result.is_err());
    }
}
