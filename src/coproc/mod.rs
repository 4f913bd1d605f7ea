//! Rotary coprocessor: wire format, host-side link client, and the
//! portable control-loop logic that defines the protocol's behavior.

pub mod controller;
pub mod link;
pub mod wire;

pub use controller::{ThetaController, WideEncoder, ZeroState};
pub use link::{CoprocError, CoprocLink};
pub use wire::ImuSample;
