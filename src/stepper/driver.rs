// Stepper drive client and axis grouping.
//
// One `TicDrive` per physical drive, bound to a fixed bus address for its
// whole lifetime. Mechanically paired drives are wrapped in an `AxisGroup`
// that applies every command to all members in order.

use embedded_hal::i2c::I2c;
use linux_embedded_hal::I2cdev;
use tracing::debug;

use super::protocol::{self as proto};
use crate::config::DriveTuning;

#[derive(Debug, thiserror::Error)]
pub enum StepperError {
    #[error("failed to open stepper bus {path}: {detail}")]
    Open { path: String, detail: String },
    #[error("bus transfer failed for drive at 0x{addr:02X}: {detail}")]
    Transfer { addr: u8, detail: String },
    #[error("step mode {0} is out of range (0-{max})", max = proto::STEP_MODE_MAX)]
    StepModeRange(u8),
}

pub type Result<T> = std::result::Result<T, StepperError>;

/// Point-to-point channel to a single drive.
///
/// A write is one atomic 5-byte transaction; a read is a 2-byte request
/// plus a 4-byte response in a single combined transaction. Any transfer
/// of the wrong length is a hard fault, never retried here.
pub trait StepperBus {
    fn transfer_write(&mut self, frame: &[u8; 5]) -> Result<()>;
    fn transfer_read(&mut self, request: &[u8; 2]) -> Result<[u8; 4]>;
}

/// Linux I2C-backed bus channel.
pub struct I2cStepperBus {
    dev: I2cdev,
    addr: u8,
}

impl I2cStepperBus {
    pub fn open(path: &str, addr: u8) -> Result<Self> {
        let dev = I2cdev::new(path).map_err(|e| StepperError::Open {
            path: path.to_string(),
            detail: format!("{e:?}"),
        })?;
        Ok(Self { dev, addr })
    }
}

impl StepperBus for I2cStepperBus {
    fn transfer_write(&mut self, frame: &[u8; 5]) -> Result<()> {
        self.dev
            .write(self.addr, frame)
            .map_err(|e| StepperError::Transfer {
                addr: self.addr,
                detail: format!("{e:?}"),
            })
    }

    fn transfer_read(&mut self, request: &[u8; 2]) -> Result<[u8; 4]> {
        let mut response = [0u8; 4];
        self.dev
            .write_read(self.addr, request, &mut response)
            .map_err(|e| StepperError::Transfer {
                addr: self.addr,
                detail: format!("{e:?}"),
            })?;
        Ok(response)
    }
}

/// Client for one stepper drive.
pub struct TicDrive<B> {
    bus: B,
    name: String,
    max_velocity: u32,
}

impl<B: StepperBus> TicDrive<B> {
    /// Bind a drive and push its motion configuration.
    ///
    /// Fails hard on an unusable step mode or any configuration transfer
    /// error; a half-configured drive is not usable.
    pub fn new(bus: B, name: &str, tuning: &DriveTuning) -> Result<Self> {
        if tuning.step_mode > proto::STEP_MODE_MAX {
            return Err(StepperError::StepModeRange(tuning.step_mode));
        }
        let mut drive = Self {
            bus,
            name: name.to_string(),
            max_velocity: tuning.max_velocity,
        };
        drive.set_step_mode(tuning.step_mode)?;
        drive.set_max_acceleration(tuning.max_acceleration)?;
        drive.set_max_deceleration(tuning.max_deceleration)?;
        drive.set_max_speed(tuning.max_velocity)?;
        drive.set_current_limit(proto::current_limit_from_ma(tuning.max_current_ma))?;
        debug!(drive = %drive.name, "drive configured");
        Ok(drive)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured velocity cap; speed commands never exceed this.
    pub fn max_velocity(&self) -> u32 {
        self.max_velocity
    }

    fn command(&mut self, opcode: u8, value: i32) -> Result<()> {
        self.bus.transfer_write(&proto::write_frame(opcode, value))
    }

    fn read_variable(&mut self, variable: u8) -> Result<i32> {
        let response = self.bus.transfer_read(&proto::read_request(variable))?;
        Ok(proto::decode_response(response))
    }

    pub fn exit_safe_start(&mut self) -> Result<()> {
        self.command(proto::OP_EXIT_SAFE_START, 0)
    }

    pub fn enter_safe_start(&mut self) -> Result<()> {
        self.command(proto::OP_ENTER_SAFE_START, 0)
    }

    pub fn reset_command_timeout(&mut self) -> Result<()> {
        self.command(proto::OP_RESET_COMMAND_TIMEOUT, 0)
    }

    pub fn energize(&mut self) -> Result<()> {
        self.command(proto::OP_ENERGIZE, 0)
    }

    pub fn deenergize(&mut self) -> Result<()> {
        self.command(proto::OP_DEENERGIZE, 0)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.command(proto::OP_RESET, 0)
    }

    pub fn clear_driver_error(&mut self) -> Result<()> {
        self.command(proto::OP_CLEAR_DRIVER_ERROR, 0)
    }

    pub fn set_target_position(&mut self, position: i32) -> Result<()> {
        self.command(proto::OP_SET_TARGET_POSITION, position)
    }

    pub fn set_target_velocity(&mut self, velocity: i32) -> Result<()> {
        self.command(proto::OP_SET_TARGET_VELOCITY, velocity)
    }

    pub fn halt_and_set_position(&mut self, position: i32) -> Result<()> {
        self.command(proto::OP_HALT_AND_SET_POSITION, position)
    }

    pub fn halt_and_hold(&mut self) -> Result<()> {
        self.command(proto::OP_HALT_AND_HOLD, 0)
    }

    pub fn go_home(&mut self, direction: u8) -> Result<()> {
        self.command(proto::OP_GO_HOME, direction as i32)
    }

    /// Clamped to the configured cap so a feed can never out-run the drive.
    pub fn set_max_speed(&mut self, speed: u32) -> Result<()> {
        let speed = speed.min(self.max_velocity);
        self.command(proto::OP_SET_MAX_SPEED, speed as i32)
    }

    pub fn set_starting_speed(&mut self, speed: u32) -> Result<()> {
        self.command(proto::OP_SET_STARTING_SPEED, speed as i32)
    }

    pub fn set_max_acceleration(&mut self, accel: u32) -> Result<()> {
        self.command(proto::OP_SET_MAX_ACCELERATION, accel as i32)
    }

    pub fn set_max_deceleration(&mut self, decel: u32) -> Result<()> {
        self.command(proto::OP_SET_MAX_DECELERATION, decel as i32)
    }

    pub fn set_step_mode(&mut self, mode: u8) -> Result<()> {
        if mode > proto::STEP_MODE_MAX {
            return Err(StepperError::StepModeRange(mode));
        }
        self.command(proto::OP_SET_STEP_MODE, mode as i32)
    }

    pub fn set_current_limit(&mut self, limit: u8) -> Result<()> {
        self.command(proto::OP_SET_CURRENT_LIMIT, limit as i32)
    }

    pub fn set_decay_mode(&mut self, mode: u8) -> Result<()> {
        self.command(proto::OP_SET_DECAY_MODE, mode as i32)
    }

    pub fn set_agc_option(&mut self, option: u8) -> Result<()> {
        self.command(proto::OP_SET_AGC_OPTION, option as i32)
    }

    pub fn set_command_timeout(&mut self, timeout_ms: u32) -> Result<()> {
        self.command(
            proto::OP_SET_COMMAND_TIMEOUT,
            proto::command_timeout_payload(timeout_ms),
        )
    }

    pub fn current_position(&mut self) -> Result<i32> {
        self.read_variable(proto::VAR_CURRENT_POSITION)
    }

    pub fn target_position(&mut self) -> Result<i32> {
        self.read_variable(proto::VAR_TARGET_POSITION)
    }

    pub fn current_velocity(&mut self) -> Result<i32> {
        self.read_variable(proto::VAR_CURRENT_VELOCITY)
    }

    pub fn target_velocity(&mut self) -> Result<i32> {
        self.read_variable(proto::VAR_TARGET_VELOCITY)
    }

    pub fn misc_flags(&mut self) -> Result<u32> {
        Ok(self.read_variable(proto::VAR_MISC_FLAGS)? as u32)
    }

    pub fn is_homing(&mut self) -> Result<bool> {
        Ok(self.misc_flags()? & proto::MISC_FLAG_HOMING != 0)
    }

    pub fn variable(&mut self, variable: u8) -> Result<i32> {
        self.read_variable(variable)
    }
}

/// 1-4 mechanically paired drives commanded as one logical axis.
///
/// Every operation is applied to all members in construction order; the
/// first drive is the representative for position readbacks.
pub struct AxisGroup<B> {
    name: crate::axis::Axis,
    drives: Vec<TicDrive<B>>,
}

impl<B: StepperBus> AxisGroup<B> {
    pub fn new(name: crate::axis::Axis, drives: Vec<TicDrive<B>>) -> Self {
        debug_assert!(!drives.is_empty() && drives.len() <= 4);
        Self { name, drives }
    }

    pub fn axis(&self) -> crate::axis::Axis {
        self.name
    }

    pub fn drives_mut(&mut self) -> impl Iterator<Item = &mut TicDrive<B>> {
        self.drives.iter_mut()
    }

    fn representative(&mut self) -> &mut TicDrive<B> {
        &mut self.drives[0]
    }

    pub fn set_target_position(&mut self, position: i32) -> Result<()> {
        for drive in &mut self.drives {
            drive.set_target_position(position)?;
        }
        Ok(())
    }

    pub fn set_max_speed(&mut self, speed: u32) -> Result<()> {
        for drive in &mut self.drives {
            drive.set_max_speed(speed)?;
        }
        Ok(())
    }

    pub fn set_target_velocity(&mut self, velocity: i32) -> Result<()> {
        for drive in &mut self.drives {
            drive.set_target_velocity(velocity)?;
        }
        Ok(())
    }

    pub fn energize(&mut self) -> Result<()> {
        for drive in &mut self.drives {
            drive.energize()?;
        }
        Ok(())
    }

    pub fn deenergize(&mut self) -> Result<()> {
        for drive in &mut self.drives {
            drive.deenergize()?;
        }
        Ok(())
    }

    pub fn exit_safe_start(&mut self) -> Result<()> {
        for drive in &mut self.drives {
            drive.exit_safe_start()?;
        }
        Ok(())
    }

    pub fn halt_and_hold(&mut self) -> Result<()> {
        for drive in &mut self.drives {
            drive.halt_and_hold()?;
        }
        Ok(())
    }

    pub fn halt_and_set_position(&mut self, position: i32) -> Result<()> {
        for drive in &mut self.drives {
            drive.halt_and_set_position(position)?;
        }
        Ok(())
    }

    pub fn go_home(&mut self, direction: u8) -> Result<()> {
        for drive in &mut self.drives {
            drive.go_home(direction)?;
        }
        Ok(())
    }

    /// Clear any latched error and re-arm the group for motion.
    pub fn ensure_ready(&mut self) -> Result<()> {
        for drive in &mut self.drives {
            drive.clear_driver_error()?;
            drive.exit_safe_start()?;
            drive.energize()?;
            drive.reset_command_timeout()?;
        }
        Ok(())
    }

    /// Position of the representative drive.
    pub fn current_position(&mut self) -> Result<i32> {
        self.representative().current_position()
    }

    pub fn target_position(&mut self) -> Result<i32> {
        self.representative().target_position()
    }

    /// Representative drive has reached its commanded target.
    pub fn at_target(&mut self) -> Result<bool> {
        let rep = self.representative();
        Ok(rep.current_position()? == rep.target_position()?)
    }

    /// Any member still running its homing cycle.
    pub fn any_homing(&mut self) -> Result<bool> {
        for drive in &mut self.drives {
            if drive.is_homing()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Every member within `tolerance` steps of `target`.
    pub fn all_within(&mut self, target: i32, tolerance: i32) -> Result<bool> {
        for drive in &mut self.drives {
            if (drive.current_position()? - target).abs() > tolerance {
                return Ok(false);
            }
        }
        Ok(true)
    }
}


#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use crate::axis::Axis;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn construction_pushes_tuning() {
        let state = Rc::new(RefCell::new(MockBusState::default()));
        let _drive = drive(0x10, &state);
        let s = state.borrow();
        assert_eq!(
            s.opcodes_for(0x10),
            vec![
                proto::OP_SET_STEP_MODE,
                proto::OP_SET_MAX_ACCELERATION,
                proto::OP_SET_MAX_DECELERATION,
                proto::OP_SET_MAX_SPEED,
                proto::OP_SET_CURRENT_LIMIT,
            ]
        );
        assert_eq!(s.last_value(0x10, proto::OP_SET_STEP_MODE), Some(4));
        assert_eq!(s.last_value(0x10, proto::OP_SET_CURRENT_LIMIT), Some(28));
    }

    #[test]
    fn construction_rejects_bad_step_mode() {
        let state = Rc::new(RefCell::new(MockBusState::default()));
        let bad = DriveTuning {
            step_mode: 10,
            ..tuning()
        };
        let result = TicDrive::new(MockBus::new(0x10, state), "bad", &bad);
        assert!(matches!(result, Err(StepperError::StepModeRange(10))));
    }

    #[test]
    fn speed_commands_clamp_to_cap() {
        let state = Rc::new(RefCell::new(MockBusState::default()));
        let mut d = drive(0x10, &state);
        d.set_max_speed(u32::MAX).unwrap();
        assert_eq!(
            state.borrow().last_value(0x10, proto::OP_SET_MAX_SPEED),
            Some(450_000_000)
        );
    }

    #[test]
    fn reads_decode_little_endian() {
        let state = Rc::new(RefCell::new(MockBusState::default()));
        let mut d = drive(0x10, &state);
        state
            .borrow_mut()
            .set_variable(0x10, proto::VAR_CURRENT_POSITION, -12_345);
        assert_eq!(d.current_position().unwrap(), -12_345);
    }

    #[test]
    fn group_commands_reach_every_member() {
        let state = Rc::new(RefCell::new(MockBusState::default()));
        let mut group = AxisGroup::new(Axis::R, vec![drive(0x0E, &state), drive(0x12, &state)]);
        group.set_target_position(6_000).unwrap();
        let s = state.borrow();
        assert_eq!(s.last_value(0x0E, proto::OP_SET_TARGET_POSITION), Some(6_000));
        assert_eq!(s.last_value(0x12, proto::OP_SET_TARGET_POSITION), Some(6_000));
    }

    #[test]
    fn group_position_comes_from_representative() {
        let state = Rc::new(RefCell::new(MockBusState::default()));
        let mut group = AxisGroup::new(Axis::R, vec![drive(0x0E, &state), drive(0x12, &state)]);
        state
            .borrow_mut()
            .set_variable(0x0E, proto::VAR_CURRENT_POSITION, 5_000);
        state
            .borrow_mut()
            .set_variable(0x12, proto::VAR_CURRENT_POSITION, 4_999);
        assert_eq!(group.current_position().unwrap(), 5_000);
    }

    #[test]
    fn homing_flag_checks_all_members() {
        let state = Rc::new(RefCell::new(MockBusState::default()));
        let mut group = AxisGroup::new(Axis::T, vec![drive(0x0F, &state), drive(0x13, &state)]);
        assert!(!group.any_homing().unwrap());
        state
            .borrow_mut()
            .set_variable(0x13, proto::VAR_MISC_FLAGS, proto::MISC_FLAG_HOMING as i32);
        assert!(group.any_homing().unwrap());
    }

    #[test]
    fn transfer_fault_propagates() {
        let state = Rc::new(RefCell::new(MockBusState::default()));
        let mut bus = MockBus::new(0x10, state);
        bus.fail_transfers = true;
        let result = TicDrive::new(bus, "broken", &tuning());
        assert!(matches!(result, Err(StepperError::Transfer { .. })));
    }
}
