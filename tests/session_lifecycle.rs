// Session lifecycle: disconnect rules, idle notifiers, wire-shaped commands
// and driver passthroughs.
use std::sync::Arc;
use std::time::Duration;

use jogwheel::config::JogConfig;
use jogwheel::driver::MotionDriver;
use jogwheel::driver::sim::SimDriver;
use jogwheel::gcode::Axis;
use jogwheel::machine::{Machine, SessionState};
use jogwheel::session::{JogCode, JogSession, SessionError, SessionHandle};

const DRAIN_MS: u64 = 50;

fn connect_rig() -> (Arc<Machine>, Arc<SimDriver>, SessionHandle) {
    let machine = Machine::new("bench");
    let sim = SimDriver::with_exec_delay(Duration::from_millis(DRAIN_MS));
    let driver: Arc<dyn MotionDriver> = sim.clone();
    let session = JogSession::connect(Arc::clone(&machine), driver, JogConfig { z_lift: 0.5 });
    (machine, sim, session)
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_refused_while_moving() {
    let (machine, _sim, session) = connect_rig();

    session
        .execute(JogCode::Start {
            axis: Axis::X,
            speed: 600.0,
        })
        .await
        .unwrap();
    advance(5).await;

    assert_eq!(
        session.disconnect().await,
        Err(SessionError::StillMoving)
    );

    // Let the lease expire and the tail drain, then it goes through.
    advance(600).await;
    assert_eq!(session.disconnect().await, Ok(()));
    assert_eq!(machine.state().await, SessionState::Idle);

    // The session task is gone now.
    assert_eq!(
        session.execute(JogCode::Maint).await,
        Err(SessionError::Disconnected)
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_when_idle_goes_straight_through() {
    let (machine, _sim, session) = connect_rig();
    advance(1).await;

    assert_eq!(session.disconnect().await, Ok(()));
    assert_eq!(machine.state().await, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn notifier_fires_when_the_tool_returns_to_idle() {
    let (_machine, _sim, session) = connect_rig();

    let done = session
        .execute_notify(JogCode::Fixed {
            axis: Axis::Y,
            speed: 0.0,
            distance: 10.0,
        })
        .await
        .unwrap();

    assert_eq!(done.await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn notifier_resolves_immediately_when_nothing_moves() {
    let (_machine, _sim, session) = connect_rig();
    advance(1).await;

    let done = session.execute_notify(JogCode::Stop).await.unwrap();
    assert_eq!(done.await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn a_newer_notifier_replaces_the_old_one() {
    let (_machine, _sim, session) = connect_rig();

    let first = session
        .execute_notify(JogCode::Fixed {
            axis: Axis::X,
            speed: 0.0,
            distance: 1.0,
        })
        .await
        .unwrap();
    let second = session
        .execute_notify(JogCode::Fixed {
            axis: Axis::X,
            speed: 0.0,
            distance: 2.0,
        })
        .await
        .unwrap();

    // The first receiver is cancelled, the second fires once both moves are
    // done and the tool is idle again.
    assert!(first.await.is_err());
    assert_eq!(second.await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn stop_notifier_fires_after_wind_down() {
    let (machine, _sim, session) = connect_rig();

    session
        .execute(JogCode::Start {
            axis: Axis::X,
            speed: 600.0,
        })
        .await
        .unwrap();
    advance(5).await;

    let done = session.execute_notify(JogCode::Stop).await.unwrap();
    assert_eq!(done.await, Ok(()));
    assert_eq!(machine.state().await, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn wire_commands_drive_the_session() {
    let (_machine, sim, session) = connect_rig();

    session
        .execute_json(serde_json::json!({"cmd": "start", "axis": "x", "speed": 600.0}))
        .await
        .unwrap();
    advance(5).await;
    assert_eq!(sim.stats().await.streams_opened, 1);

    // Unknown commands are logged and dropped, never fatal.
    session
        .execute_json(serde_json::json!({"cmd": "warble"}))
        .await
        .unwrap();
    advance(5).await;
    assert_eq!(sim.stats().await.streams_opened, 1);
}

#[tokio::test(start_paused = true)]
async fn pause_resume_and_quit_reach_the_driver() {
    let (_machine, sim, session) = connect_rig();

    session
        .execute(JogCode::Start {
            axis: Axis::X,
            speed: 600.0,
        })
        .await
        .unwrap();
    advance(5).await;

    session.pause().await.unwrap();
    session.resume().await.unwrap();
    session.quit().await.unwrap();
    advance(5).await;

    let stats = sim.stats().await;
    assert_eq!(stats.holds, 1);
    assert_eq!(stats.resumes, 1);
    assert_eq!(stats.quits, 1);
    // None of those touch the jog bookkeeping; the stream is still open.
    assert_eq!(stats.streams_open, 1);
}
