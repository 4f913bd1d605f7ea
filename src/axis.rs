// Logical machine axes.
//
// R, T and Z are linear/rotary stepper groups; A is the continuously
// spinning axis driven through the rotary coprocessor and has no stepper
// drives of its own.

use std::fmt;

use crate::config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// In/out rotation carriage (paired drives).
    R,
    /// Left/right translation (paired drives).
    T,
    /// Vertical (four drives).
    Z,
    /// Continuous rotation, coprocessor-controlled.
    A,
}

impl Axis {
    /// The stepper-driven axes, in the fixed homing/zeroing order.
    pub const LINEAR: [Axis; 3] = [Axis::R, Axis::T, Axis::Z];

    pub fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'R' => Some(Axis::R),
            'T' => Some(Axis::T),
            'Z' => Some(Axis::Z),
            'A' => Some(Axis::A),
            _ => None,
        }
    }

    pub fn letter(self) -> char {
        match self {
            Axis::R => 'R',
            Axis::T => 'T',
            Axis::Z => 'Z',
            Axis::A => 'A',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Programmed feed rates.
///
/// R/T/Z feeds are in drive step-rate units; A is in RPM. The global feed
/// propagates to R/T/Z when set, but never to A.
#[derive(Debug, Clone, Copy)]
pub struct Feeds {
    pub global: f64,
    pub r: f64,
    pub t: f64,
    pub z: f64,
    pub a_rpm: f64,
}

impl Default for Feeds {
    fn default() -> Self {
        Self {
            global: config::DEFAULT_GLOBAL_FEED,
            r: config::DEFAULT_GLOBAL_FEED,
            t: config::DEFAULT_GLOBAL_FEED,
            z: config::DEFAULT_GLOBAL_FEED,
            a_rpm: config::DEFAULT_A_FEED_RPM,
        }
    }
}

impl Feeds {
    /// Set the global feed and propagate it to the linear axes.
    pub fn set_global(&mut self, feed: f64) {
        self.global = feed;
        self.r = feed;
        self.t = feed;
        self.z = feed;
    }

    pub fn set_linear(&mut self, axis: Axis, feed: f64) {
        match axis {
            Axis::R => self.r = feed,
            Axis::T => self.t = feed,
            Axis::Z => self.z = feed,
            Axis::A => self.a_rpm = feed,
        }
    }

    /// Resolved feed for a linear axis (per-axis override, which tracks the
    /// global feed until explicitly overridden).
    pub fn linear(&self, axis: Axis) -> f64 {
        match axis {
            Axis::R => self.r,
            Axis::T => self.t,
            Axis::Z => self.z,
            Axis::A => self.a_rpm,
        }
    }
}
