// src/main.rs - interactive console for driving a tool by hand
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use jogwheel::config::Config;
use jogwheel::driver::MotionDriver;
use jogwheel::driver::serial::SerialDriver;
use jogwheel::driver::sim::SimDriver;
use jogwheel::gcode::Axis;
use jogwheel::machine::Machine;
use jogwheel::session::{JogCode, JogSession, SessionError, SessionHandle};

#[derive(Debug, Parser)]
#[command(name = "jog-host", about = "Manual motion console for a CNC tool")]
struct Args {
    /// Configuration file
    #[arg(default_value = "jog.toml")]
    config: PathBuf,

    /// Drive the built-in simulated controller instead of a serial port
    #[arg(long)]
    sim: bool,

    /// Override the configured serial port
    #[arg(long)]
    port: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) if args.sim => {
            tracing::warn!("using default config: {e}");
            Config::default()
        }
        Err(e) => {
            tracing::error!("failed to load config from {}: {e}", args.config.display());
            // The cast keeps the async block's error type at the boxed trait
            // object; a bare Box::new would pin it to this one error type.
            return Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>);
        }
    };

    let machine = Machine::new(&config.machine.name);

    let driver: Arc<dyn MotionDriver> = if args.sim {
        tracing::info!("driving the built-in simulated controller");
        let sim = SimDriver::new();
        sim.spawn_demo_feed(Duration::from_millis(500));
        sim
    } else {
        let port = args.port.as_deref().unwrap_or(&config.controller.port);
        SerialDriver::connect(port, config.controller.baud_rate)?
    };

    let session = JogSession::connect(
        Arc::clone(&machine),
        Arc::clone(&driver),
        config.jog.clone(),
    );

    watch_machine(&machine);

    println!(
        "jog-host console for {} (type 'help' for commands)",
        machine.name()
    );
    run_console(session).await?;

    Ok(())
}

/// Log session state changes and operator-facing messages as they happen.
fn watch_machine(machine: &Arc<Machine>) {
    let mut updates = machine.subscribe();
    tokio::spawn(async move {
        let mut last_state = None;
        loop {
            match updates.recv().await {
                Ok(status) => {
                    if last_state != Some(status.state) {
                        last_state = Some(status.state);
                        match &status.error {
                            Some(message) => {
                                tracing::info!("state: {} ({message})", status.state)
                            }
                            None => tracing::info!("state: {}", status.state),
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[derive(Debug)]
enum ConsoleCmd {
    Code(JogCode),
    Pause,
    Resume,
    Quit,
    Exit,
    Help,
}

async fn run_console(session: SessionHandle) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let cmd = match parse_console(line) {
            Ok(cmd) => cmd,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };
        let result = match cmd {
            ConsoleCmd::Code(code) => session.execute(code).await,
            ConsoleCmd::Pause => session.pause().await,
            ConsoleCmd::Resume => session.resume().await,
            ConsoleCmd::Quit => session.quit().await,
            ConsoleCmd::Help => {
                print_help();
                Ok(())
            }
            ConsoleCmd::Exit => match session.disconnect().await {
                Ok(()) => break,
                Err(SessionError::StillMoving) => {
                    println!("the tool is still moving; 'stop' first");
                    continue;
                }
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            tracing::error!("session is gone: {e}");
            break;
        }
    }
    Ok(())
}

fn parse_console(line: &str) -> Result<ConsoleCmd, String> {
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or_default();
    let cmd = match verb {
        "start" => ConsoleCmd::Code(JogCode::Start {
            axis: parse_axis(words.next())?,
            speed: parse_number(words.next(), "speed")?,
        }),
        "stop" => ConsoleCmd::Code(JogCode::Stop),
        "maint" => ConsoleCmd::Code(JogCode::Maint),
        "fixed" => ConsoleCmd::Code(JogCode::Fixed {
            axis: parse_axis(words.next())?,
            speed: parse_number(words.next(), "speed")?,
            distance: parse_number(words.next(), "distance")?,
        }),
        "pause" => ConsoleCmd::Pause,
        "resume" => ConsoleCmd::Resume,
        "quit" => ConsoleCmd::Quit,
        "exit" => ConsoleCmd::Exit,
        "help" => ConsoleCmd::Help,
        other => return Err(format!("unknown command: {other} (try 'help')")),
    };
    if words.next().is_some() {
        return Err(format!("too many arguments for '{verb}'"));
    }
    Ok(cmd)
}

fn parse_axis(word: Option<&str>) -> Result<Axis, String> {
    let raw = word.ok_or("missing axis")?;
    raw.parse().map_err(|e| format!("{e}"))
}

fn parse_number(word: Option<&str>, what: &str) -> Result<f64, String> {
    let raw = word.ok_or_else(|| format!("missing {what}"))?;
    raw.parse().map_err(|_| format!("bad {what}: {raw}"))
}

fn print_help() {
    println!("start <axis> <speed>          hold a continuous jog; resend to keep it alive");
    println!("maint                         renew the current jog without restating it");
    println!("stop                          wind down motion");
    println!("fixed <axis> <speed> <dist>   discrete move; speed 0 for a rapid");
    println!("pause / resume                feed hold and release");
    println!("quit                          flush queued motion on the controller");
    println!("exit                          leave the console");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_parses_into_a_jog_code() {
        match parse_console("start x 600") {
            Ok(ConsoleCmd::Code(JogCode::Start { axis, speed })) => {
                assert_eq!(axis, Axis::X);
                assert_eq!(speed, 600.0);
            }
            other => panic!("expected a start code, got {other:?}"),
        }
    }

    #[test]
    fn fixed_takes_axis_speed_and_distance() {
        match parse_console("fixed y 300 -5") {
            Ok(ConsoleCmd::Code(JogCode::Fixed { axis, speed, distance })) => {
                assert_eq!(axis, Axis::Y);
                assert_eq!(speed, 300.0);
                assert_eq!(distance, -5.0);
            }
            other => panic!("expected a fixed code, got {other:?}"),
        }
    }

    #[test]
    fn bare_verbs_parse() {
        assert!(matches!(
            parse_console("stop"),
            Ok(ConsoleCmd::Code(JogCode::Stop))
        ));
        assert!(matches!(
            parse_console("maint"),
            Ok(ConsoleCmd::Code(JogCode::Maint))
        ));
        assert!(matches!(parse_console("pause"), Ok(ConsoleCmd::Pause)));
        assert!(matches!(parse_console("exit"), Ok(ConsoleCmd::Exit)));
    }

    #[test]
    fn missing_arguments_are_reported() {
        assert_eq!(parse_console("start").unwrap_err(), "missing axis");
        assert_eq!(parse_console("start x").unwrap_err(), "missing speed");
        assert_eq!(parse_console("fixed x 300").unwrap_err(), "missing distance");
    }

    #[test]
    fn stray_arguments_are_reported() {
        assert_eq!(
            parse_console("stop now").unwrap_err(),
            "too many arguments for 'stop'"
        );
    }

    #[test]
    fn unknown_verbs_name_the_offender() {
        let err = parse_console("warble").unwrap_err();
        assert!(err.contains("warble"), "unexpected message: {err}");
    }
}
