//! Motion-control runtime for a multi-axis helical fabrication machine.
//!
//! A G-code interpreter coordinates three stepper axis groups over an
//! I2C drive bus and a continuously spinning rotary axis behind a
//! serial coprocessor, with process-wide cooperative abort handling.

pub mod abort;
pub mod axis;
pub mod config;
pub mod coproc;
pub mod gcode;
pub mod homing;
pub mod interpreter;
pub mod peripherals;
pub mod runtime;
pub mod stepper;

pub use abort::AbortSignal;
pub use axis::Axis;
pub use config::MachineConfig;
pub use interpreter::{Flow, Interpreter, Machine};
