// Rotary-axis control loop, expressed as portable logic.
//
// This is the behavioral contract of the coprocessor firmware: a 20 ms
// velocity PID over the spindle encoder, 32-bit widening of the 16-bit
// hardware counters, and the two-edge beam-break zeroing state machine.
// Keeping it free of hardware types lets the link layer be tested
// against the real dispatcher over an in-memory loopback.

use tracing::debug;

use super::wire::{self, ImuSample, ENCODER_COUNT};

pub const PID_KP: f64 = 0.06;
pub const PID_KI: f64 = 0.005;
pub const PID_KD: f64 = 0.0;
/// Control period in seconds (one `tick` per 20 ms).
pub const PID_DT: f64 = 0.02;
pub const DUTY_MAX: f64 = 255.0;
/// Maximum duty change per tick.
pub const DUTY_SLEW_MAX: i32 = 5;
/// Spindle speed commanded during zeroing, in pulses/second (10 RPM).
pub const ZEROING_VELOCITY_PPS: i32 = 40_904;
/// Beam-break events closer together than this are switch bounce.
pub const BEAM_DEBOUNCE_MS: u64 = 2_000;
/// Index of the spindle encoder among the five counters.
pub const THETA_ENCODER: usize = 2;
/// Fraction of a revolution the spindle must travel before the second
/// beam-break is armed.
pub const LOOP_ARM_FRACTION: f64 = 0.85;

const COUNTER_HIGH_LIMIT: i32 = 32_767;
const COUNTER_LOW_LIMIT: i32 = -32_768;

/// 16-bit hardware counter widened to a 32-bit accumulator.
///
/// The hardware clears its count to zero when it reaches either limit;
/// the widening adds the value the counter held at the instant of the
/// wrap, so the sum reconstructs the true cumulative pulse count exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct WideEncoder {
    raw: i32,
    total: i32,
}

impl WideEncoder {
    pub fn value(&self) -> i32 {
        self.total + self.raw
    }

    pub fn clear(&mut self) {
        self.raw = 0;
        self.total = 0;
    }

    /// Apply one quadrature pulse in either direction.
    pub fn step(&mut self, dir: i32) {
        self.raw += dir.signum();
        if self.raw >= COUNTER_HIGH_LIMIT {
            self.total += COUNTER_HIGH_LIMIT;
            self.raw = 0;
        } else if self.raw <= COUNTER_LOW_LIMIT {
            self.total += COUNTER_LOW_LIMIT;
            self.raw = 0;
        }
    }

    /// Apply a burst of pulses.
    pub fn advance(&mut self, delta: i32) {
        for _ in 0..delta.abs() {
            self.step(delta.signum());
        }
    }
}

/// Zeroing state machine.
///
/// Armed by the start command; the first qualifying beam-break resets
/// the counter, `Loop` waits out most of a revolution so the same flag
/// edge cannot double-trigger, and the second break yields the measured
/// offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroState {
    Idle,
    Fall1,
    Loop,
    Fall2,
}

/// Drive output computed by one PID tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveOutput {
    pub duty: u8,
    pub forward: bool,
}

pub struct ThetaController {
    encoders: [WideEncoder; ENCODER_COUNT],
    counts_per_rev: i32,

    desired_velocity: i32,
    pid_enabled: bool,
    integral: f64,
    prev_error: f64,
    last_command: i32,
    prev_encoder: i32,
    manual_forward: bool,

    zero_state: ZeroState,
    zero_measurement: i32,
    last_beam_break_ms: Option<u64>,

    imu_sample: ImuSample,
}

impl ThetaController {
    pub fn new(counts_per_rev: i32) -> Self {
        Self {
            encoders: Default::default(),
            counts_per_rev,
            desired_velocity: 0,
            pid_enabled: false,
            integral: 0.0,
            prev_error: 0.0,
            last_command: 0,
            prev_encoder: 0,
            manual_forward: true,
            zero_state: ZeroState::Idle,
            zero_measurement: 0,
            last_beam_break_ms: None,
            imu_sample: ImuSample::default(),
        }
    }

    pub fn encoder_mut(&mut self, index: usize) -> &mut WideEncoder {
        &mut self.encoders[index]
    }

    pub fn encoder_value(&self, index: usize) -> i32 {
        self.encoders[index].value()
    }

    pub fn zero_state(&self) -> ZeroState {
        self.zero_state
    }

    pub fn zero_measurement(&self) -> i32 {
        self.zero_measurement
    }

    pub fn pid_enabled(&self) -> bool {
        self.pid_enabled
    }

    /// Latest balance-sensor reading served to `CMD_IMU` requests.
    pub fn set_imu_sample(&mut self, sample: ImuSample) {
        self.imu_sample = sample;
    }

    fn reset_pid(&mut self) {
        self.integral = 0.0;
        self.prev_error = 0.0;
        self.last_command = 0;
    }

    /// One 20 ms control period.
    ///
    /// Enabled: standard PID on measured pulses/second, output slew-limited
    /// and split into magnitude (duty) and sign (direction). Disabled: the
    /// last manual duty and direction hold, and the velocity baseline keeps
    /// tracking the encoder so re-enabling sees no spurious spike.
    pub fn tick(&mut self) -> DriveOutput {
        self.poll_zeroing();
        let current = self.encoders[THETA_ENCODER].value();

        let forward = if self.pid_enabled {
            let measured = f64::from(current - self.prev_encoder) / PID_DT;
            let error = f64::from(self.desired_velocity) - measured;
            self.integral += error * PID_DT;
            let derivative = (error - self.prev_error) / PID_DT;
            self.prev_error = error;

            let mut out = PID_KP * error + PID_KI * self.integral + PID_KD * derivative;
            out = out.clamp(-DUTY_MAX, DUTY_MAX);
            let step = (out as i32 - self.last_command).clamp(-DUTY_SLEW_MAX, DUTY_SLEW_MAX);
            self.last_command += step;
            self.last_command >= 0
        } else {
            self.manual_forward
        };
        self.prev_encoder = current;

        DriveOutput {
            duty: self.last_command.unsigned_abs().min(255) as u8,
            forward,
        }
    }

    /// Poll side of the zeroing machine; call once per control period.
    fn poll_zeroing(&mut self) {
        if self.zero_state == ZeroState::Loop {
            let travelled = self.encoders[THETA_ENCODER].value();
            let threshold = (f64::from(self.counts_per_rev) * LOOP_ARM_FRACTION) as i32;
            if travelled > threshold {
                self.zero_state = ZeroState::Fall2;
            }
        }
    }

    /// A falling edge from the beam-break sensor.
    ///
    /// Returns the 1-byte completion marker to transmit when the second
    /// qualifying break finishes a measurement.
    pub fn beam_break(&mut self, now_ms: u64) -> Option<u8> {
        if let Some(last) = self.last_beam_break_ms {
            if now_ms.saturating_sub(last) < BEAM_DEBOUNCE_MS {
                return None;
            }
        }
        self.last_beam_break_ms = Some(now_ms);

        match self.zero_state {
            ZeroState::Fall1 => {
                self.encoders[THETA_ENCODER].clear();
                self.zero_state = ZeroState::Loop;
                None
            }
            ZeroState::Fall2 => {
                self.zero_measurement = self.encoders[THETA_ENCODER].value();
                self.encoders[THETA_ENCODER].clear();
                self.reset_pid();
                self.zero_state = ZeroState::Idle;
                debug!(measurement = self.zero_measurement, "zeroing complete");
                Some(1)
            }
            ZeroState::Idle | ZeroState::Loop => None,
        }
    }

    /// Dispatch one 6-byte command frame; returns the bytes to transmit
    /// back, exactly as they appear on the wire.
    pub fn handle_frame(&mut self, frame: &[u8; wire::COMMAND_LEN]) -> Vec<u8> {
        self.poll_zeroing();
        let sub = frame[1];
        match frame[0] {
            wire::CMD_ENCODER_POSITION => {
                if sub == wire::ENCODER_ALL {
                    let mut out = Vec::with_capacity(4 * ENCODER_COUNT);
                    for enc in &self.encoders {
                        out.extend_from_slice(&enc.value().to_le_bytes());
                    }
                    out
                } else if (sub as usize) < ENCODER_COUNT {
                    self.encoders[sub as usize].value().to_le_bytes().to_vec()
                } else {
                    Vec::new()
                }
            }
            wire::CMD_DC_DRIVER => {
                // Raw drive access drops back to open loop; the manual
                // duty and direction hold until the next command.
                if self.pid_enabled {
                    self.reset_pid();
                    self.pid_enabled = false;
                }
                match sub {
                    wire::DC_SUB_PWM => self.last_command = i32::from(frame[2]),
                    wire::DC_SUB_DIR => self.manual_forward = frame[2] != 0,
                    _ => {}
                }
                Vec::new()
            }
            wire::CMD_THETA_VEL if sub == wire::THETA_VEL_SET => {
                self.reset_pid();
                let velocity = i32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
                if velocity == 0 {
                    self.pid_enabled = false;
                } else {
                    self.desired_velocity = velocity;
                    self.pid_enabled = true;
                }
                vec![1]
            }
            wire::CMD_THETA_ZERO => match sub {
                wire::THETA_ZERO_START => {
                    self.reset_pid();
                    self.desired_velocity = ZEROING_VELOCITY_PPS;
                    self.pid_enabled = true;
                    self.zero_state = ZeroState::Fall1;
                    Vec::new()
                }
                wire::THETA_ZERO_STATUS => {
                    vec![u8::from(self.zero_measurement != 0)]
                }
                wire::THETA_ZERO_READ => self.zero_measurement.to_le_bytes().to_vec(),
                _ => Vec::new(),
            },
            wire::CMD_IMU => match sub {
                wire::IMU_SUB_GET_SAMPLE => {
                    let mut out =
                        wire::frame_packet(wire::PACKET_TYPE_SAMPLE, &self.imu_sample.to_bytes());
                    out.extend(wire::frame_packet(
                        wire::PACKET_TYPE_ACK,
                        &[wire::CMD_IMU, wire::IMU_SUB_GET_SAMPLE, 1],
                    ));
                    out
                }
                wire::IMU_SUB_START_CALIB
                | wire::IMU_SUB_START_STREAM
                | wire::IMU_SUB_STOP_STREAM => {
                    wire::frame_packet(wire::PACKET_TYPE_ACK, &[wire::CMD_IMU, sub, 1])
                }
                _ => Vec::new(),
            },
            other => {
                debug!("unknown command byte 0x{other:02X}");
                Vec::new()
            }
        }
    }
}
