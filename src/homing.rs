// Homing routine for a stepper axis group.
//
// Drives the group's homing cycle in lockstep: all members seek the
// endstop, then move to the configured offset which becomes the logical
// origin. Aborts are honored at every polling step.

use std::time::Duration;

use tracing::info;

use crate::abort::AbortSignal;
use crate::config::HomingParams;
use crate::stepper::{AxisGroup, StepperBus};

/// Offset-settling tolerance in steps.
const SETTLE_TOLERANCE: i32 = 1;
const HOMING_POLL: Duration = Duration::from_millis(100);
const SETTLE_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum HomingError {
    #[error(transparent)]
    Stepper(#[from] crate::stepper::StepperError),
    #[error("homing aborted")]
    Aborted,
}

/// Home every drive in the group, then settle on the configured offset.
///
/// Blocks until all members are within [`SETTLE_TOLERANCE`] of the
/// offset, polling the abort flag throughout.
pub fn home_group<B: StepperBus>(
    group: &mut AxisGroup<B>,
    params: HomingParams,
    abort: &AbortSignal,
) -> Result<(), HomingError> {
    info!(axis = %group.axis(), direction = params.direction, "homing axis");
    group.go_home(params.direction)?;

    while group.any_homing()? {
        if abort.abort_requested() {
            return Err(HomingError::Aborted);
        }
        std::thread::sleep(HOMING_POLL);
    }

    group.set_target_position(params.offset)?;
    while !group.all_within(params.offset, SETTLE_TOLERANCE)? {
        if abort.abort_requested() {
            return Err(HomingError::Aborted);
        }
        std::thread::sleep(SETTLE_POLL);
    }
    info!(axis = %group.axis(), offset = params.offset, "axis homed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::Axis;
    use crate::stepper::driver::mock::{drive, MockBusState};
    use crate::stepper::protocol as proto;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn homes_and_settles_on_offset() {
        let state = Rc::new(RefCell::new(MockBusState::default()));
        let mut group = AxisGroup::new(Axis::R, vec![drive(0x0E, &state), drive(0x12, &state)]);
        // Drives are idle and already report the offset position.
        for addr in [0x0E, 0x12] {
            state
                .borrow_mut()
                .set_variable(addr, proto::VAR_CURRENT_POSITION, -283_000);
        }

        let params = HomingParams {
            direction: 1,
            offset: -283_000,
        };
        home_group(&mut group, params, &AbortSignal::new()).unwrap();

        let s = state.borrow();
        for addr in [0x0E, 0x12] {
            assert_eq!(s.last_value(addr, proto::OP_GO_HOME), Some(1));
            assert_eq!(
                s.last_value(addr, proto::OP_SET_TARGET_POSITION),
                Some(-283_000)
            );
        }
    }

    #[test]
    fn settle_accepts_one_step_of_slack() {
        let state = Rc::new(RefCell::new(MockBusState::default()));
        let mut group = AxisGroup::new(Axis::T, vec![drive(0x0F, &state)]);
        state
            .borrow_mut()
            .set_variable(0x0F, proto::VAR_CURRENT_POSITION, -335_287);

        let params = HomingParams {
            direction: 1,
            offset: -335_288,
        };
        home_group(&mut group, params, &AbortSignal::new()).unwrap();
    }

    #[test]
    fn abort_interrupts_an_active_homing_cycle() {
        let state = Rc::new(RefCell::new(MockBusState::default()));
        let mut group = AxisGroup::new(Axis::Z, vec![drive(0x10, &state)]);
        // Drive reports a homing cycle that never finishes.
        state.borrow_mut().set_variable(
            0x10,
            proto::VAR_MISC_FLAGS,
            proto::MISC_FLAG_HOMING as i32,
        );

        let abort = AbortSignal::new();
        abort.request_abort();
        let params = HomingParams {
            direction: 0,
            offset: 24_025,
        };
        assert!(matches!(
            home_group(&mut group, params, &abort),
            Err(HomingError::Aborted)
        ));
    }
}
