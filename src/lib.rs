//! Host-side manual motion control for CNC tools.
//!
//! The pieces fit together like this: a [`driver`] owns the controller link
//! and fans out status reports, a [`machine::Machine`] holds the shared
//! status snapshot, and a [`session::JogSession`] drives manual motion on
//! top of both, renewing continuous jogs tick by tick and queueing fixed
//! moves while the tool is busy.

pub mod config;
pub mod driver;
pub mod gcode;
pub mod machine;
pub mod session;

pub use config::{Config, JogConfig};
pub use driver::{ControllerFault, ControllerState, MotionDriver, StatusReport};
pub use gcode::{Axis, Directive};
pub use machine::{Machine, MachineStatus, SessionState};
pub use session::{JogCode, JogSession, SessionError, SessionHandle};
