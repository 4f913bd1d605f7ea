// Rotary coprocessor serial wire format.
//
// Host-to-coprocessor commands are fixed 6-byte frames:
// `[command, subcommand, value...]` where the value is either a single
// byte (remainder zero-padded) or a 32-bit little-endian word. Replies
// come back two ways: raw little-endian values for encoder and zeroing
// queries, and framed packets (`'I' 'M' type length payload`) for the
// balance-sensor exchange.

use std::fmt;

pub const COMMAND_LEN: usize = 6;

/// Command bytes.
pub const CMD_ENCODER_POSITION: u8 = 0x10;
pub const ENCODER_ALL: u8 = 0xFF;
pub const ENCODER_COUNT: usize = 5;

pub const CMD_DC_DRIVER: u8 = 0x20;
pub const DC_SUB_PWM: u8 = 0x01;
pub const DC_SUB_DIR: u8 = 0x02;

pub const CMD_THETA_VEL: u8 = 0x30;
pub const THETA_VEL_SET: u8 = 0x01;

pub const CMD_THETA_ZERO: u8 = 0x40;
pub const THETA_ZERO_START: u8 = 0x01;
pub const THETA_ZERO_STATUS: u8 = 0x02;
pub const THETA_ZERO_READ: u8 = 0x03;

pub const CMD_IMU: u8 = 0x50;
pub const IMU_SUB_GET_SAMPLE: u8 = 0x01;
pub const IMU_SUB_START_STREAM: u8 = 0x02;
pub const IMU_SUB_STOP_STREAM: u8 = 0x03;
pub const IMU_SUB_START_CALIB: u8 = 0x04;

/// Framed packet sync and types.
pub const SYNC0: u8 = b'I';
pub const SYNC1: u8 = b'M';
pub const PACKET_TYPE_ACK: u8 = 0xA0;
pub const PACKET_TYPE_SAMPLE: u8 = 0xA1;
pub const PACKET_TYPE_STATUS: u8 = 0xA2;

pub const IMU_SAMPLE_LEN: usize = 44;

/// Command carrying a one-byte value.
pub fn simple_command(command: u8, subcommand: u8, value: u8) -> [u8; COMMAND_LEN] {
    [command, subcommand, value, 0, 0, 0]
}

/// Command carrying a 32-bit little-endian value.
pub fn value_command(command: u8, subcommand: u8, value: i32) -> [u8; COMMAND_LEN] {
    let v = value.to_le_bytes();
    [command, subcommand, v[0], v[1], v[2], v[3]]
}

/// One balance-sensor reading.
///
/// The derived mass/angle pair describes the counterweight that would
/// cancel the measured radial imbalance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImuSample {
    pub timestamp_us: u32,
    pub ax: f32,
    pub ay: f32,
    pub az: f32,
    pub gx: f32,
    pub gy: f32,
    pub gz: f32,
    pub omega: f32,
    pub radial_accel: f32,
    pub corrective_mass_g: f32,
    pub corrective_angle_deg: f32,
}

impl ImuSample {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() != IMU_SAMPLE_LEN {
            return None;
        }
        let f = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&payload[i..i + 4]);
            f32::from_le_bytes(b)
        };
        let mut ts = [0u8; 4];
        ts.copy_from_slice(&payload[0..4]);
        Some(Self {
            timestamp_us: u32::from_le_bytes(ts),
            ax: f(4),
            ay: f(8),
            az: f(12),
            gx: f(16),
            gy: f(20),
            gz: f(24),
            omega: f(28),
            radial_accel: f(32),
            corrective_mass_g: f(36),
            corrective_angle_deg: f(40),
        })
    }

    pub fn to_bytes(&self) -> [u8; IMU_SAMPLE_LEN] {
        let mut out = [0u8; IMU_SAMPLE_LEN];
        out[0..4].copy_from_slice(&self.timestamp_us.to_le_bytes());
        for (i, v) in [
            self.ax,
            self.ay,
            self.az,
            self.gx,
            self.gy,
            self.gz,
            self.omega,
            self.radial_accel,
            self.corrective_mass_g,
            self.corrective_angle_deg,
        ]
        .into_iter()
        .enumerate()
        {
            let at = 4 + i * 4;
            out[at..at + 4].copy_from_slice(&v.to_le_bytes());
        }
        out
    }
}

impl fmt::Display for ImuSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "t={}us accel=({:.3},{:.3},{:.3}) gyro=({:.3},{:.3},{:.3}) \
             omega={:.3} radial={:.3} mass={:.2}g angle={:.2}deg",
            self.timestamp_us,
            self.ax,
            self.ay,
            self.az,
            self.gx,
            self.gy,
            self.gz,
            self.omega,
            self.radial_accel,
            self.corrective_mass_g,
            self.corrective_angle_deg,
        )
    }
}

/// A decoded framed packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// `[command, subcommand, ok]` acknowledgment.
    Ack { command: u8, subcommand: u8, ok: bool },
    Sample(ImuSample),
    /// Free-text status line from the coprocessor.
    Status(String),
    /// Well-framed but unrecognized; carried for logging.
    Unknown { packet_type: u8, payload: Vec<u8> },
}

/// Classify a framed packet body.
pub fn classify(packet_type: u8, payload: &[u8]) -> Packet {
    match packet_type {
        PACKET_TYPE_ACK if payload.len() >= 3 => Packet::Ack {
            command: payload[0],
            subcommand: payload[1],
            ok: payload[2] != 0,
        },
        PACKET_TYPE_SAMPLE => match ImuSample::parse(payload) {
            Some(sample) => Packet::Sample(sample),
            None => Packet::Unknown {
                packet_type,
                payload: payload.to_vec(),
            },
        },
        PACKET_TYPE_STATUS => Packet::Status(String::from_utf8_lossy(payload).into_owned()),
        _ => Packet::Unknown {
            packet_type,
            payload: payload.to_vec(),
        },
    }
}

/// Build a framed packet (used by tests and the control-loop responder).
pub fn frame_packet(packet_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.push(SYNC0);
    out.push(SYNC1);
    out.push(packet_type);
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    out
}
