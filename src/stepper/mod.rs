//! Stepper drive bus: frame protocol, per-drive client and axis grouping.

pub mod driver;
pub mod protocol;

pub use driver::{AxisGroup, I2cStepperBus, StepperBus, StepperError, TicDrive};
