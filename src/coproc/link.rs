// Host-side client for the rotary coprocessor serial link.
//
// Commands go out as fixed 6-byte frames. Simple replies come back as
// raw little-endian values; balance-sensor traffic uses framed packets
// that the client must resynchronize on. Every read carries an explicit
// deadline so a silent coprocessor fails the call instead of hanging
// the interpreter thread.

use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use serialport::{self, SerialPort};
use tracing::{debug, info, warn};

use super::wire::{self, ImuSample, Packet};
use crate::abort::AbortSignal;

pub const ACK_TIMEOUT: Duration = Duration::from_millis(500);
pub const SAMPLE_TIMEOUT: Duration = Duration::from_millis(500);
pub const CALIBRATION_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const ZERO_COMPLETE_TIMEOUT: Duration = Duration::from_secs(20);
pub const ZERO_COMPLETE_POLL: Duration = Duration::from_millis(200);
const PORT_TIMEOUT: Duration = Duration::from_millis(100);
const READ_RETRY: Duration = Duration::from_millis(2);

#[derive(Debug, thiserror::Error)]
pub enum CoprocError {
    #[error("failed to open coprocessor port {port}: {source}")]
    Open {
        port: String,
        source: serialport::Error,
    },

    #[error("coprocessor I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("encoder index {0} out of range (0-4)")]
    InvalidEncoder(u8),

    #[error("coprocessor rejected command 0x{command:02X}/0x{subcommand:02X}")]
    Nack { command: u8, subcommand: u8 },

    #[error("malformed coprocessor payload: {0}")]
    BadPayload(String),

    #[error("aborted while waiting on coprocessor")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, CoprocError>;

pub struct CoprocLink<P> {
    port: P,
}

impl CoprocLink<Box<dyn SerialPort>> {
    pub fn open(port_name: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(port_name, baud)
            .timeout(PORT_TIMEOUT)
            .open()
            .map_err(|e| CoprocError::Open {
                port: port_name.to_string(),
                source: e,
            })?;
        Ok(Self { port })
    }
}

impl<P: Read + Write> CoprocLink<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }

    fn send(&mut self, frame: [u8; wire::COMMAND_LEN]) -> Result<()> {
        self.port.write_all(&frame)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read exactly `dst.len()` bytes before `deadline`, retrying short
    /// and timed-out reads.
    fn read_exact_deadline(
        &mut self,
        dst: &mut [u8],
        deadline: Instant,
        what: &'static str,
    ) -> Result<()> {
        let mut offset = 0;
        while offset < dst.len() {
            match self.port.read(&mut dst[offset..]) {
                Ok(0) => {}
                Ok(n) => {
                    offset += n;
                    continue;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(CoprocError::Io(e)),
            }
            if Instant::now() >= deadline {
                return Err(CoprocError::Timeout(what));
            }
            thread::sleep(READ_RETRY);
        }
        Ok(())
    }

    fn read_i32(&mut self, deadline: Instant, what: &'static str) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_exact_deadline(&mut buf, deadline, what)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Position of one encoder accumulator.
    pub fn encoder_position(&mut self, encoder: u8) -> Result<i32> {
        if encoder as usize >= wire::ENCODER_COUNT {
            return Err(CoprocError::InvalidEncoder(encoder));
        }
        self.send(wire::simple_command(wire::CMD_ENCODER_POSITION, encoder, 0))?;
        self.read_i32(Instant::now() + ACK_TIMEOUT, "encoder position")
    }

    /// All five encoder accumulators in index order.
    pub fn all_encoder_positions(&mut self) -> Result<[i32; wire::ENCODER_COUNT]> {
        self.send(wire::simple_command(
            wire::CMD_ENCODER_POSITION,
            wire::ENCODER_ALL,
            0,
        ))?;
        let mut buf = [0u8; 4 * wire::ENCODER_COUNT];
        self.read_exact_deadline(&mut buf, Instant::now() + ACK_TIMEOUT, "encoder positions")?;
        let mut out = [0i32; wire::ENCODER_COUNT];
        for (i, chunk) in buf.chunks_exact(4).enumerate() {
            out[i] = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(out)
    }

    /// Raw open-loop drive duty; disables the velocity loop.
    pub fn set_dc_pwm(&mut self, duty: u8) -> Result<()> {
        self.send(wire::simple_command(wire::CMD_DC_DRIVER, wire::DC_SUB_PWM, duty))
    }

    pub fn set_dc_dir(&mut self, forward: bool) -> Result<()> {
        self.send(wire::simple_command(
            wire::CMD_DC_DRIVER,
            wire::DC_SUB_DIR,
            u8::from(forward),
        ))
    }

    /// Closed-loop spindle velocity in pulses/second; zero stops and
    /// disables the loop.
    pub fn set_theta_velocity(&mut self, velocity: i32) -> Result<()> {
        self.send(wire::value_command(
            wire::CMD_THETA_VEL,
            wire::THETA_VEL_SET,
            velocity,
        ))?;
        // The ack is best-effort: consume it to keep the byte stream in
        // sync, but a missing ack only logs.
        let mut ack = [0u8; 1];
        match self.read_exact_deadline(&mut ack, Instant::now() + ACK_TIMEOUT, "velocity ack") {
            Ok(()) if ack[0] != 0 => {}
            Ok(()) => warn!("spindle velocity command not acknowledged"),
            Err(CoprocError::Timeout(_)) => warn!("no ack for spindle velocity command"),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Kick off the beam-break zeroing cycle; completion is observed via
    /// [`wait_theta_zero_complete`](Self::wait_theta_zero_complete) or
    /// by polling [`theta_zeroed`](Self::theta_zeroed).
    pub fn start_theta_zero(&mut self) -> Result<()> {
        self.send(wire::simple_command(
            wire::CMD_THETA_ZERO,
            wire::THETA_ZERO_START,
            0,
        ))
    }

    /// True once a zeroing measurement exists. A silent coprocessor
    /// reads as not-zeroed rather than an error.
    pub fn theta_zeroed(&mut self) -> Result<bool> {
        self.send(wire::simple_command(
            wire::CMD_THETA_ZERO,
            wire::THETA_ZERO_STATUS,
            0,
        ))?;
        let mut status = [0u8; 1];
        match self.read_exact_deadline(&mut status, Instant::now() + ACK_TIMEOUT, "zero status") {
            Ok(()) => Ok(status[0] != 0),
            Err(CoprocError::Timeout(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Pulses accumulated between the two zeroing beam-breaks.
    pub fn theta_zero_measurement(&mut self) -> Result<i32> {
        self.send(wire::simple_command(
            wire::CMD_THETA_ZERO,
            wire::THETA_ZERO_READ,
            0,
        ))?;
        self.read_i32(Instant::now() + ACK_TIMEOUT, "zero measurement")
    }

    /// Block until the 1-byte completion marker arrives, checking the
    /// abort flag between polls.
    pub fn wait_theta_zero_complete(&mut self, abort: &AbortSignal) -> Result<()> {
        let deadline = Instant::now() + ZERO_COMPLETE_TIMEOUT;
        loop {
            if abort.abort_requested() {
                return Err(CoprocError::Aborted);
            }
            let mut marker = [0u8; 1];
            let poll_deadline = (Instant::now() + ZERO_COMPLETE_POLL).min(deadline);
            match self.read_exact_deadline(&mut marker, poll_deadline, "zero completion") {
                Ok(()) if marker[0] != 0 => return Ok(()),
                Ok(()) => continue,
                Err(CoprocError::Timeout(what)) => {
                    if Instant::now() >= deadline {
                        return Err(CoprocError::Timeout(what));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One balance-sensor sample: a SAMPLE packet followed by its ACK.
    pub fn imu_sample(&mut self) -> Result<ImuSample> {
        self.send(wire::simple_command(
            wire::CMD_IMU,
            wire::IMU_SUB_GET_SAMPLE,
            0,
        ))?;
        let deadline = Instant::now() + SAMPLE_TIMEOUT;
        loop {
            match self.read_packet(deadline, "balance sample")? {
                Packet::Sample(sample) => {
                    self.wait_imu_ack(wire::IMU_SUB_GET_SAMPLE, deadline)?;
                    return Ok(sample);
                }
                Packet::Status(msg) => info!("coprocessor: {msg}"),
                Packet::Ack {
                    subcommand: wire::IMU_SUB_GET_SAMPLE,
                    ok: false,
                    ..
                } => {
                    return Err(CoprocError::Nack {
                        command: wire::CMD_IMU,
                        subcommand: wire::IMU_SUB_GET_SAMPLE,
                    });
                }
                other => debug!("ignoring packet while waiting for sample: {other:?}"),
            }
        }
    }

    /// Ask the coprocessor to recalibrate its balance sensor.
    pub fn request_imu_calibration(&mut self) -> Result<()> {
        self.send(wire::simple_command(
            wire::CMD_IMU,
            wire::IMU_SUB_START_CALIB,
            0,
        ))?;
        self.wait_imu_ack(wire::IMU_SUB_START_CALIB, Instant::now() + CALIBRATION_TIMEOUT)
    }

    fn wait_imu_ack(&mut self, subcommand: u8, deadline: Instant) -> Result<()> {
        loop {
            match self.read_packet(deadline, "balance ack")? {
                Packet::Ack {
                    command: wire::CMD_IMU,
                    subcommand: sub,
                    ok,
                } if sub == subcommand => {
                    return if ok {
                        Ok(())
                    } else {
                        Err(CoprocError::Nack {
                            command: wire::CMD_IMU,
                            subcommand,
                        })
                    };
                }
                Packet::Status(msg) => info!("coprocessor: {msg}"),
                other => debug!("ignoring packet while waiting for ack: {other:?}"),
            }
        }
    }

    /// Read one framed packet, resynchronizing on the sync bytes.
    fn read_packet(&mut self, deadline: Instant, what: &'static str) -> Result<Packet> {
        loop {
            let mut byte = [0u8; 1];
            self.read_exact_deadline(&mut byte, deadline, what)?;
            if byte[0] != wire::SYNC0 {
                continue;
            }
            let mut rest = [0u8; 3];
            self.read_exact_deadline(&mut rest, deadline, what)?;
            if rest[0] != wire::SYNC1 {
                continue;
            }
            let packet_type = rest[1];
            let mut payload = vec![0u8; rest[2] as usize];
            self.read_exact_deadline(&mut payload, deadline, what)?;
            return Ok(wire::classify(packet_type, &payload));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coproc::controller::THETA_ENCODER;
    use crate::coproc::testing::LoopbackPort;

    const COUNTS_PER_REV: i32 = 245_426;

    #[test]
    fn encoder_reads_round_trip() {
        let port = LoopbackPort::new(COUNTS_PER_REV);
        let controller = port.controller.clone();
        let mut link = CoprocLink::new(port);
        controller.borrow_mut().encoder_mut(0).advance(1_500);
        controller.borrow_mut().encoder_mut(THETA_ENCODER).advance(-42);
        assert_eq!(link.encoder_position(0).unwrap(), 1_500);
        assert_eq!(link.encoder_position(THETA_ENCODER as u8).unwrap(), -42);
        let all = link.all_encoder_positions().unwrap();
        assert_eq!(all, [1_500, 0, -42, 0, 0]);
    }

    #[test]
    fn invalid_encoder_index_sends_nothing() {
        let port = LoopbackPort::new(COUNTS_PER_REV);
        let frames = port.frames.clone();
        let mut link = CoprocLink::new(port);
        assert!(matches!(
            link.encoder_position(5),
            Err(CoprocError::InvalidEncoder(5))
        ));
        assert!(frames.borrow().is_empty());
    }

    #[test]
    fn velocity_ack_is_consumed_keeping_the_stream_in_sync() {
        let port = LoopbackPort::new(COUNTS_PER_REV);
        let controller = port.controller.clone();
        let mut link = CoprocLink::new(port);
        link.set_theta_velocity(40_904).unwrap();
        assert!(controller.borrow().pid_enabled());
        // A follow-up read must see its own reply, not a stale ack byte.
        controller.borrow_mut().encoder_mut(1).advance(9);
        assert_eq!(link.encoder_position(1).unwrap(), 9);
    }

    #[test]
    fn zeroing_cycle_end_to_end() {
        let port = LoopbackPort::new(COUNTS_PER_REV);
        let controller = port.controller.clone();
        let rx = port.rx.clone();
        let mut link = CoprocLink::new(port);

        link.start_theta_zero().unwrap();
        assert!(!link.theta_zeroed().unwrap());

        {
            let mut ctl = controller.borrow_mut();
            ctl.beam_break(5_000);
            ctl.encoder_mut(THETA_ENCODER).advance(245_426);
            ctl.tick();
            if let Some(marker) = ctl.beam_break(10_000) {
                rx.borrow_mut().push_back(marker);
            }
        }

        let abort = AbortSignal::new();
        link.wait_theta_zero_complete(&abort).unwrap();
        assert!(link.theta_zeroed().unwrap());
        assert_eq!(link.theta_zero_measurement().unwrap(), 245_426);
    }

    #[test]
    fn abort_interrupts_zero_wait() {
        let mut link = CoprocLink::new(LoopbackPort::new(COUNTS_PER_REV));
        let abort = AbortSignal::new();
        abort.request_abort();
        assert!(matches!(
            link.wait_theta_zero_complete(&abort),
            Err(CoprocError::Aborted)
        ));
    }

    #[test]
    fn imu_sample_round_trips_through_framing() {
        let port = LoopbackPort::new(COUNTS_PER_REV);
        let controller = port.controller.clone();
        let mut link = CoprocLink::new(port);
        let sample = ImuSample {
            timestamp_us: 7_000,
            omega: 3.5,
            corrective_mass_g: 21.0,
            corrective_angle_deg: 135.0,
            ..ImuSample::default()
        };
        controller.borrow_mut().set_imu_sample(sample);
        assert_eq!(link.imu_sample().unwrap(), sample);
    }

    #[test]
    fn imu_resyncs_past_garbage_bytes() {
        let port = LoopbackPort::new(COUNTS_PER_REV);
        port.controller.borrow_mut().set_imu_sample(ImuSample {
            timestamp_us: 1,
            ..ImuSample::default()
        });
        port.rx.borrow_mut().extend([0x00, 0xFF, 0x07]);
        let mut link = CoprocLink::new(port);
        assert_eq!(link.imu_sample().unwrap().timestamp_us, 1);
    }

    #[test]
    fn calibration_ack_accepted() {
        let mut link = CoprocLink::new(LoopbackPort::new(COUNTS_PER_REV));
        link.request_imu_calibration().unwrap();
    }

    /// Accepts writes, never answers.
    struct SilentPort;

    impl Write for SilentPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Read for SilentPort {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(std::io::ErrorKind::TimedOut))
        }
    }

    #[test]
    fn silent_port_times_out_instead_of_hanging() {
        let mut link = CoprocLink::new(SilentPort);
        let err = link.theta_zero_measurement();
        assert!(matches!(err, Err(CoprocError::Timeout(_))));
    }

    #[test]
    fn silent_port_reads_as_not_zeroed() {
        let mut link = CoprocLink::new(SilentPort);
        assert!(!link.theta_zeroed().unwrap());
    }
}
