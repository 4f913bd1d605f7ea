// G-code interpreter and axis coordinator.
//
// One command at a time: M-codes act immediately, G-codes may start
// motion and are followed by a polling wait until every stepper group
// reaches its target. The abort flag is honored between commands, inside
// dwells, and at every wait poll.

use std::io::{Read, Write};

use tracing::warn;

use crate::abort::AbortSignal;
use crate::axis::{Axis, Feeds};
use crate::config::{self, MachineConfig};
use crate::coproc::{CoprocError, CoprocLink};
use crate::cprintln;
use crate::gcode::{self, FeedWord, GcodeError, Head, ParsedLine};
use crate::homing::{self, HomingError};
use crate::peripherals::{Illumination, Projector};
use crate::stepper::{AxisGroup, StepperBus, StepperError};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Parse(#[from] GcodeError),
    #[error(transparent)]
    Stepper(#[from] StepperError),
    #[error(transparent)]
    Coproc(#[from] CoprocError),
    /// A drive stopped answering while motion was in flight. Unlike a
    /// fault during command issue, this flushes the pending queue.
    #[error("transport fault during motion wait: {0}")]
    MotionWait(StepperError),
    #[error("command aborted")]
    Aborted,
}

impl From<HomingError> for CommandError {
    fn from(e: HomingError) -> Self {
        match e {
            HomingError::Stepper(e) => CommandError::Stepper(e),
            HomingError::Aborted => CommandError::Aborted,
        }
    }
}

/// What the caller should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// The three stepper axis groups.
pub struct Machine<B> {
    pub r: AxisGroup<B>,
    pub t: AxisGroup<B>,
    pub z: AxisGroup<B>,
}

impl<B: StepperBus> Machine<B> {
    fn group_mut(&mut self, axis: Axis) -> Option<&mut AxisGroup<B>> {
        match axis {
            Axis::R => Some(&mut self.r),
            Axis::T => Some(&mut self.t),
            Axis::Z => Some(&mut self.z),
            Axis::A => None,
        }
    }
}

pub struct Interpreter<B, P> {
    machine: Machine<B>,
    link: CoprocLink<P>,
    led: Box<dyn Illumination>,
    projector: Box<dyn Projector>,
    config: MachineConfig,
    abort: AbortSignal,
    feeds: Feeds,
    absolute_mode: bool,
}

impl<B: StepperBus, P: Read + Write> Interpreter<B, P> {
    pub fn new(
        machine: Machine<B>,
        link: CoprocLink<P>,
        led: Box<dyn Illumination>,
        projector: Box<dyn Projector>,
        config: MachineConfig,
        abort: AbortSignal,
    ) -> Self {
        Self {
            machine,
            link,
            led,
            projector,
            config,
            abort,
            feeds: Feeds::default(),
            absolute_mode: true,
        }
    }

    pub fn machine_mut(&mut self) -> &mut Machine<B> {
        &mut self.machine
    }

    pub fn link_mut(&mut self) -> &mut CoprocLink<P> {
        &mut self.link
    }

    pub fn feeds(&self) -> &Feeds {
        &self.feeds
    }

    /// Execute one raw console line.
    pub fn execute(&mut self, raw: &str) -> Result<Flow, CommandError> {
        let line = gcode::strip_comment_and_trim(raw);
        let Some(parsed) = gcode::parse_line(line)? else {
            return Ok(Flow::Continue);
        };
        match parsed.head {
            Some(Head::M(m)) => self.run_m(m, &parsed),
            Some(Head::G(g)) => {
                // F words change feed state before the command they
                // arrived on runs.
                for word in &parsed.feeds {
                    self.apply_feed_word(*word);
                }
                self.run_g(g, &parsed)?;
                self.wait_for_motion()?;
                Ok(Flow::Continue)
            }
            None => Ok(Flow::Continue),
        }
    }

    fn apply_feed_word(&mut self, word: FeedWord) {
        match word {
            FeedWord::Global(v) => {
                self.feeds.set_global(v);
                cprintln!("F: global feed set to {v}");
            }
            FeedWord::PerAxis(Axis::A, rpm) => {
                if !(config::A_RPM_MIN..=config::A_RPM_MAX).contains(&rpm) {
                    cprintln!(
                        "[RANGE] FA {rpm} RPM not in [{}, {}], ignoring",
                        config::A_RPM_MIN,
                        config::A_RPM_MAX
                    );
                } else {
                    self.feeds.set_linear(Axis::A, rpm);
                    cprintln!("FA: rotation feed set to {rpm} RPM");
                }
            }
            FeedWord::PerAxis(axis, v) => {
                let cap = self.config.linear_cap(axis).unwrap_or(0);
                if v < 0.0 || v > f64::from(cap) {
                    cprintln!("[RANGE] F{axis} {v} not in [0, {cap}], ignoring");
                } else {
                    self.feeds.set_linear(axis, v);
                    cprintln!("F{axis}: feed set to {v}");
                }
            }
        }
    }

    // ----- G-codes -----

    fn run_g(&mut self, g: u16, line: &ParsedLine) -> Result<(), CommandError> {
        match g {
            0 => self.g0_rapid(line),
            1 => self.g1_feed_move(line),
            4 => self.g4_dwell(line),
            5 => self.g5_wait_steady(),
            6 => {
                cprintln!("G6: wait until print completion (stub)");
                Ok(())
            }
            28 => self.g28_home(),
            33 => self.g33_rotate(line),
            90 => {
                self.absolute_mode = true;
                cprintln!("G90: absolute positioning");
                Ok(())
            }
            91 => {
                self.absolute_mode = false;
                cprintln!("G91: relative positioning");
                Ok(())
            }
            92 => self.g92_zero(line),
            other => {
                cprintln!("unknown/unsupported G{other}");
                Ok(())
            }
        }
    }

    /// Target in steps, honoring G90/G91. A failed position read in
    /// relative mode falls back to zero; this is deliberate and loud.
    fn resolve_target(&mut self, axis: Axis, value: f64) -> i32 {
        if self.absolute_mode {
            return value as i32;
        }
        let current = match self.machine.group_mut(axis) {
            Some(group) => match group.current_position() {
                Ok(pos) => pos,
                Err(e) => {
                    warn!(%axis, "position read failed: {e}");
                    cprintln!("could not read {axis} position, assuming 0 for relative move");
                    0
                }
            },
            None => 0,
        };
        current + value as i32
    }

    fn g0_rapid(&mut self, line: &ParsedLine) -> Result<(), CommandError> {
        for axis in Axis::LINEAR {
            let Some(value) = line.param(axis.letter()) else {
                continue;
            };
            let target = self.resolve_target(axis, value);
            let cap = self.config.linear_cap(axis).unwrap_or(0);
            let Some(group) = self.machine.group_mut(axis) else {
                continue;
            };
            group.ensure_ready()?;
            group.set_max_speed(cap)?;
            group.set_target_position(target)?;
            cprintln!("[G0] {axis} rapid -> {target} @ {cap}");
        }
        Ok(())
    }

    fn g1_feed_move(&mut self, line: &ParsedLine) -> Result<(), CommandError> {
        for axis in Axis::LINEAR {
            let Some(value) = line.param(axis.letter()) else {
                continue;
            };
            let target = self.resolve_target(axis, value);
            self.move_axis(axis, target)?;
        }
        Ok(())
    }

    fn move_axis(&mut self, axis: Axis, target: i32) -> Result<(), CommandError> {
        let feed = self.feeds.linear(axis);
        let cap = self.config.linear_cap(axis).unwrap_or(0);
        let Some(group) = self.machine.group_mut(axis) else {
            return Ok(());
        };
        group.ensure_ready()?;

        if feed < 0.0 || feed > cap as f64 {
            cprintln!("[RANGE] axis {axis} feed {feed} out of range [0, {cap}], skipping move");
            return Ok(());
        }
        if feed == 0.0 {
            cprintln!("[WARN] axis {axis} feed is 0, skipping move");
            return Ok(());
        }
        group.set_max_speed(feed as u32)?;
        group.set_target_position(target)?;
        cprintln!("[G1] {axis} -> {target} @ {feed}");
        Ok(())
    }

    fn g4_dwell(&mut self, line: &ParsedLine) -> Result<(), CommandError> {
        let ms = line.param('P').unwrap_or(0.0).max(0.0) as u64;
        cprintln!("G4: dwell {ms} ms");
        if !self.abort.wait_or_abort(
            std::time::Duration::from_millis(ms),
            config::ABORT_POLL,
        ) {
            return Err(CommandError::Aborted);
        }
        Ok(())
    }

    fn g5_wait_steady(&mut self) -> Result<(), CommandError> {
        let rpm = self.feeds.linear(Axis::A);
        if !(config::A_RPM_MIN..=config::A_RPM_MAX).contains(&rpm) {
            cprintln!(
                "[RANGE] A feed {rpm} RPM not in [{}, {}], cannot wait",
                config::A_RPM_MIN,
                config::A_RPM_MAX
            );
            return Ok(());
        }
        cprintln!("G5: wait for A steady-state ({rpm} rpm)");
        // Spin-up settles well within a second at these speeds.
        if !self.abort.wait_or_abort(
            std::time::Duration::from_millis(1_000),
            config::ABORT_POLL,
        ) {
            return Err(CommandError::Aborted);
        }
        Ok(())
    }

    fn g28_home(&mut self) -> Result<(), CommandError> {
        cprintln!("G28: homing R/T/Z");
        // Force caps so homing is never limited by an earlier G1 feed.
        for axis in Axis::LINEAR {
            let cap = self.config.linear_cap(axis).unwrap_or(0);
            if let Some(group) = self.machine.group_mut(axis) {
                group.set_max_speed(cap)?;
            }
        }
        for axis in Axis::LINEAR {
            let Some(params) = self.config.homing(axis) else {
                continue;
            };
            if let Some(group) = self.machine.group_mut(axis) {
                homing::home_group(group, params, &self.abort)?;
            }
        }
        Ok(())
    }

    fn g33_rotate(&mut self, line: &ParsedLine) -> Result<(), CommandError> {
        let rpm = line.param('A').unwrap_or(0.0);
        if !(config::A_RPM_MIN..=config::A_RPM_MAX).contains(&rpm) {
            cprintln!(
                "[RANGE] G33 A {rpm} RPM not in [{}, {}], skipping",
                config::A_RPM_MIN,
                config::A_RPM_MAX
            );
            return Ok(());
        }
        let pps = self.config.rpm_to_pps(rpm);
        self.link.set_theta_velocity(pps)?;
        self.feeds.set_linear(Axis::A, rpm);
        cprintln!("G33: A -> {rpm} rpm ({pps} pps)");
        Ok(())
    }

    fn g92_zero(&mut self, line: &ParsedLine) -> Result<(), CommandError> {
        let mut named = Vec::new();
        for axis in Axis::LINEAR {
            if line.param(axis.letter()).is_some() || line.axis_flags.contains(&axis) {
                named.push(axis);
            }
        }
        let axes: &[Axis] = if named.is_empty() { &Axis::LINEAR } else { &named };
        for &axis in axes {
            if let Some(group) = self.machine.group_mut(axis) {
                group.halt_and_set_position(0)?;
                cprintln!("G92: zeroed axis {axis}");
            }
        }
        Ok(())
    }

    // ----- M-codes -----

    fn run_m(&mut self, m: u16, line: &ParsedLine) -> Result<Flow, CommandError> {
        match m {
            17 => {
                self.machine.r.energize()?;
                self.machine.t.energize()?;
                self.machine.z.energize()?;
                cprintln!("M17: motors enabled");
                Ok(Flow::Continue)
            }
            18 => {
                self.m18_disable(&line.axis_flags)?;
                cprintln!("M18: motors disabled");
                Ok(Flow::Continue)
            }
            30 => {
                cprintln!("M30: program complete");
                Ok(Flow::Quit)
            }
            112 => {
                cprintln!("M112: EMERGENCY STOP");
                self.safety_stop();
                Ok(Flow::Quit)
            }
            114 => {
                self.m114_report();
                Ok(Flow::Continue)
            }
            116 => {
                self.m116_feed_report();
                Ok(Flow::Continue)
            }
            200 => {
                self.led.configure();
                self.led.set_current_ma(config::LED_DEFAULT_CURRENT_MA);
                self.projector.configure();
                cprintln!("M200: projector on (configured)");
                Ok(Flow::Continue)
            }
            201 => {
                self.projector.power_down();
                self.led.stop();
                cprintln!("M201: projector off");
                Ok(Flow::Continue)
            }
            205 => {
                self.m205_led_current(line);
                Ok(Flow::Continue)
            }
            210 => {
                match self.link.imu_sample() {
                    Ok(sample) => cprintln!("[IMU] {sample}"),
                    Err(e) => cprintln!("[IMU] failed to retrieve sample: {e}"),
                }
                Ok(Flow::Continue)
            }
            211 => {
                cprintln!("M211: requesting IMU calibration");
                match self.link.request_imu_calibration() {
                    Ok(()) => cprintln!("[IMU] calibration complete"),
                    Err(e) => cprintln!("[IMU] calibration failed: {e}"),
                }
                Ok(Flow::Continue)
            }
            other => {
                cprintln!("unknown M{other}");
                Ok(Flow::Continue)
            }
        }
    }

    /// Disable the named axes, or everything when none are named. The
    /// spindle is stopped either way.
    fn m18_disable(&mut self, axes: &[Axis]) -> Result<(), CommandError> {
        if axes.is_empty() {
            for axis in Axis::LINEAR {
                if let Some(group) = self.machine.group_mut(axis) {
                    group.deenergize()?;
                }
            }
        } else {
            for &axis in axes {
                if let Some(group) = self.machine.group_mut(axis) {
                    group.deenergize()?;
                }
            }
        }
        self.link.set_theta_velocity(0)?;
        Ok(())
    }

    fn m114_report(&mut self) {
        cprintln!("---- M114 ----");
        for axis in Axis::LINEAR {
            let Some(group) = self.machine.group_mut(axis) else {
                continue;
            };
            for drive in group.drives_mut() {
                let name = drive.name().to_string();
                match (drive.current_position(), drive.target_position()) {
                    (Ok(cur), Ok(tgt)) => cprintln!("{name}  cur={cur}  tgt={tgt}"),
                    (Err(e), _) | (_, Err(e)) => cprintln!("{name}  [read error] {e}"),
                }
            }
        }
        cprintln!("--------------");
    }

    fn m116_feed_report(&mut self) {
        let rt_cap = self.config.linear_cap(Axis::R).unwrap_or(0);
        let z_cap = self.config.linear_cap(Axis::Z).unwrap_or(0);
        cprintln!("---- M116: feed rates ----");
        cprintln!(
            "F (global): {}  [applies to R/T/Z unless overridden]",
            self.feeds.global
        );
        cprintln!("FR (R)    : {}  [range 0 .. {rt_cap}]", self.feeds.r);
        cprintln!("FT (T)    : {}  [range 0 .. {rt_cap}]", self.feeds.t);
        cprintln!("FZ (Z)    : {}  [range 0 .. {z_cap}]", self.feeds.z);
        cprintln!(
            "FA (A)    : {} rpm  [range {} .. {} rpm]",
            self.feeds.a_rpm,
            config::A_RPM_MIN,
            config::A_RPM_MAX
        );
        cprintln!("--------------------------");
    }

    fn m205_led_current(&mut self, line: &ParsedLine) {
        let Some(current_ma) = line.param('S') else {
            cprintln!("M205: provide current via S parameter (e.g. M205 S450)");
            return;
        };
        if current_ma < 0.0 {
            cprintln!("M205: provide current via S parameter (e.g. M205 S450)");
            return;
        }
        if current_ma > f64::from(config::LED_MAX_CURRENT_MA) {
            cprintln!(
                "M205: requested {current_ma} mA exceeds {} mA limit",
                config::LED_MAX_CURRENT_MA
            );
            return;
        }
        self.led.set_current_ma(current_ma as u32);
        cprintln!("M205: LED current set to {} mA", current_ma as u32);
    }

    // ----- waits and safety -----

    /// Block until every stepper group reports current == target.
    ///
    /// Abort halts all motion and fails the command; a transport fault
    /// during the wait does the same so a silent drive cannot leave the
    /// machine running open-loop.
    fn wait_for_motion(&mut self) -> Result<(), CommandError> {
        loop {
            if self.abort.abort_requested() {
                cprintln!("ABORT: halting all motion");
                self.halt_all();
                return Err(CommandError::Aborted);
            }
            let settled = self.all_at_target();
            match settled {
                Ok(true) => return Ok(()),
                Ok(false) => std::thread::sleep(config::MOTION_POLL),
                Err(e) => {
                    cprintln!("transport fault during motion wait: {e}");
                    self.halt_all();
                    return Err(CommandError::MotionWait(e));
                }
            }
        }
    }

    fn all_at_target(&mut self) -> Result<bool, StepperError> {
        Ok(self.machine.r.at_target()?
            && self.machine.t.at_target()?
            && self.machine.z.at_target()?)
    }

    /// Best-effort halt of every group; failures are logged, not
    /// propagated, because this runs on error paths.
    pub fn halt_all(&mut self) {
        for axis in Axis::LINEAR {
            if let Some(group) = self.machine.group_mut(axis) {
                if let Err(e) = group.halt_and_hold() {
                    warn!(%axis, "halt failed: {e}");
                }
            }
        }
    }

    /// Abort/emergency shutdown: halt motion, stop the spindle, power
    /// down the optics. Best-effort throughout.
    pub fn safety_stop(&mut self) {
        self.halt_all();
        if let Err(e) = self.link.set_theta_velocity(0) {
            warn!("failed to stop spindle: {e}");
        }
        self.projector.power_down();
        self.led.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coproc::controller::ThetaController;
    use crate::coproc::testing::LoopbackPort;
    use crate::coproc::wire;
    use crate::peripherals::testing::{
        EventLog, PeripheralEvent, RecordingIllumination, RecordingProjector,
    };
    use crate::stepper::driver::mock::{MockBus, MockBusState};
    use crate::stepper::protocol as proto;
    use crate::stepper::TicDrive;
    use std::cell::RefCell;
    use std::rc::Rc;

    const RT_ADDRS: [u8; 2] = [0x0E, 0x12];
    const T_ADDRS: [u8; 2] = [0x0F, 0x13];
    const Z_ADDRS: [u8; 4] = [0x10, 0x11, 0x14, 0x15];

    struct Harness {
        interp: Interpreter<MockBus, LoopbackPort>,
        bus: Rc<RefCell<MockBusState>>,
        controller: Rc<RefCell<ThetaController>>,
        frames: Rc<RefCell<Vec<[u8; wire::COMMAND_LEN]>>>,
        events: EventLog,
        abort: AbortSignal,
    }

    fn drive(addr: u8, state: &Rc<RefCell<MockBusState>>, tuning: &crate::config::DriveTuning) -> TicDrive<MockBus> {
        TicDrive::new(MockBus::new(addr, state.clone()), &format!("drive_{addr:02X}"), tuning)
            .unwrap()
    }

    fn harness() -> Harness {
        let config = MachineConfig::default();
        let bus = Rc::new(RefCell::new(MockBusState::default()));
        let machine = Machine {
            r: AxisGroup::new(
                Axis::R,
                RT_ADDRS.iter().map(|&a| drive(a, &bus, &config.rt)).collect(),
            ),
            t: AxisGroup::new(
                Axis::T,
                T_ADDRS.iter().map(|&a| drive(a, &bus, &config.rt)).collect(),
            ),
            z: AxisGroup::new(
                Axis::Z,
                Z_ADDRS.iter().map(|&a| drive(a, &bus, &config.z)).collect(),
            ),
        };

        let port = LoopbackPort::new(config.counts_per_rev);
        let controller = port.controller.clone();
        let frames = port.frames.clone();

        let events: EventLog = Rc::new(RefCell::new(Vec::new()));
        let abort = AbortSignal::new();
        let interp = Interpreter::new(
            machine,
            CoprocLink::new(port),
            Box::new(RecordingIllumination(events.clone())),
            Box::new(RecordingProjector(events.clone())),
            config,
            abort.clone(),
        );
        // Drop the tuning frames pushed by TicDrive construction so tests
        // observe only the traffic caused by the commands they execute.
        bus.borrow_mut().writes.clear();
        Harness {
            interp,
            bus,
            controller,
            frames,
            events,
            abort,
        }
    }

    fn set_position(h: &Harness, addr: u8, pos: i32) {
        let mut s = h.bus.borrow_mut();
        s.set_variable(addr, proto::VAR_CURRENT_POSITION, pos);
        s.set_variable(addr, proto::VAR_TARGET_POSITION, pos);
    }

    #[test]
    fn relative_rapid_targets_offset_on_both_drives_at_cap() {
        let mut h = harness();
        for addr in RT_ADDRS {
            set_position(&h, addr, 5_000);
        }
        h.interp.execute("G91").unwrap();
        h.interp.execute("G0 R1000").unwrap();
        let s = h.bus.borrow();
        for addr in RT_ADDRS {
            assert_eq!(s.last_value(addr, proto::OP_SET_TARGET_POSITION), Some(6_000));
            assert_eq!(
                s.last_value(addr, proto::OP_SET_MAX_SPEED),
                Some(450_000_000)
            );
        }
    }

    #[test]
    fn absolute_move_ignores_current_position() {
        let mut h = harness();
        for addr in T_ADDRS {
            set_position(&h, addr, 5_000);
        }
        h.interp.execute("G0 T-250").unwrap();
        let s = h.bus.borrow();
        for addr in T_ADDRS {
            assert_eq!(s.last_value(addr, proto::OP_SET_TARGET_POSITION), Some(-250));
        }
    }

    #[test]
    fn zero_feed_skips_the_move() {
        let mut h = harness();
        // FR0 is accepted as a feed value but a zero-feed move is skipped.
        h.interp.execute("G1 R100 FR0").unwrap();
        let s = h.bus.borrow();
        assert_eq!(s.last_value(0x0E, proto::OP_SET_TARGET_POSITION), None);
    }

    #[test]
    fn over_cap_feed_word_is_rejected_not_clamped() {
        let mut h = harness();
        h.interp.execute("G1 Z-200 FZ200000000").unwrap();
        // Feed stays at default; move runs at the default feed.
        assert_eq!(h.interp.feeds().z, config::DEFAULT_GLOBAL_FEED);
        let s = h.bus.borrow();
        for addr in Z_ADDRS {
            assert_eq!(s.last_value(addr, proto::OP_SET_TARGET_POSITION), Some(-200));
            assert_eq!(s.last_value(addr, proto::OP_SET_MAX_SPEED), Some(100_000));
        }
    }

    #[test]
    fn g33_in_range_enables_the_spindle_loop() {
        let mut h = harness();
        h.interp.execute("G33 A10").unwrap();
        assert!(h.controller.borrow().pid_enabled());
        assert_eq!(h.interp.feeds().a_rpm, 10.0);
        let frames = h.frames.borrow();
        assert_eq!(
            frames.last(),
            Some(&wire::value_command(
                wire::CMD_THETA_VEL,
                wire::THETA_VEL_SET,
                40_904
            ))
        );
    }

    #[test]
    fn g33_out_of_range_sends_no_frame() {
        let mut h = harness();
        h.interp.execute("G33 A75").unwrap();
        assert!(h.frames.borrow().is_empty());
        assert!(!h.controller.borrow().pid_enabled());
        assert_eq!(h.interp.feeds().a_rpm, config::DEFAULT_A_FEED_RPM);
    }

    #[test]
    fn g92_without_axes_zeroes_all_linear_groups() {
        let mut h = harness();
        h.interp.execute("G92").unwrap();
        let s = h.bus.borrow();
        for addr in RT_ADDRS.iter().chain(&T_ADDRS).chain(&Z_ADDRS) {
            assert_eq!(s.last_value(*addr, proto::OP_HALT_AND_SET_POSITION), Some(0));
        }
    }

    #[test]
    fn g92_with_axis_zeroes_only_that_group() {
        let mut h = harness();
        h.interp.execute("G92 R").unwrap();
        let s = h.bus.borrow();
        for addr in RT_ADDRS {
            assert_eq!(s.last_value(addr, proto::OP_HALT_AND_SET_POSITION), Some(0));
        }
        for addr in T_ADDRS.iter().chain(&Z_ADDRS) {
            assert_eq!(s.last_value(*addr, proto::OP_HALT_AND_SET_POSITION), None);
        }
    }

    #[test]
    fn dwell_is_cut_short_by_abort() {
        let mut h = harness();
        h.abort.request_abort();
        assert!(matches!(
            h.interp.execute("G4 P10000"),
            Err(CommandError::Aborted)
        ));
    }

    #[test]
    fn m18_without_axes_disables_everything_and_stops_spindle() {
        let mut h = harness();
        h.interp.execute("G33 A10").unwrap();
        assert!(h.controller.borrow().pid_enabled());
        h.interp.execute("M18").unwrap();
        let s = h.bus.borrow();
        for addr in RT_ADDRS.iter().chain(&T_ADDRS).chain(&Z_ADDRS) {
            assert!(s.opcodes_for(*addr).contains(&proto::OP_DEENERGIZE));
        }
        assert!(!h.controller.borrow().pid_enabled());
    }

    #[test]
    fn m18_with_axis_list_is_selective() {
        let mut h = harness();
        h.interp.execute("M18 R").unwrap();
        let s = h.bus.borrow();
        for addr in RT_ADDRS {
            assert!(s.opcodes_for(addr).contains(&proto::OP_DEENERGIZE));
        }
        for addr in T_ADDRS.iter().chain(&Z_ADDRS) {
            assert!(!s.opcodes_for(*addr).contains(&proto::OP_DEENERGIZE));
        }
    }

    #[test]
    fn m205_accepts_in_range_current() {
        let mut h = harness();
        h.interp.execute("M205 S450").unwrap();
        assert_eq!(
            h.events.borrow().as_slice(),
            &[PeripheralEvent::LedCurrent(450)]
        );
    }

    #[test]
    fn m205_rejects_over_limit_current() {
        let mut h = harness();
        h.interp.execute("M205 S40000").unwrap();
        assert!(h.events.borrow().is_empty());
    }

    #[test]
    fn m200_and_m201_drive_the_optics() {
        let mut h = harness();
        h.interp.execute("M200").unwrap();
        h.interp.execute("M201").unwrap();
        assert_eq!(
            h.events.borrow().as_slice(),
            &[
                PeripheralEvent::LedConfigured,
                PeripheralEvent::LedCurrent(config::LED_DEFAULT_CURRENT_MA),
                PeripheralEvent::ProjectorConfigured,
                PeripheralEvent::ProjectorPoweredDown,
                PeripheralEvent::LedStopped,
            ]
        );
    }

    #[test]
    fn m30_quits_and_m_codes_skip_the_motion_wait() {
        let mut h = harness();
        // A pending mismatch would hang a G-code wait; M30 must not wait.
        h.bus
            .borrow_mut()
            .set_variable(0x0E, proto::VAR_CURRENT_POSITION, 1);
        assert_eq!(h.interp.execute("M30").unwrap(), Flow::Quit);
    }

    #[test]
    fn m112_stops_motion_spindle_and_optics() {
        let mut h = harness();
        h.interp.execute("G33 A10").unwrap();
        assert_eq!(h.interp.execute("M112").unwrap(), Flow::Quit);
        let s = h.bus.borrow();
        for addr in RT_ADDRS.iter().chain(&T_ADDRS).chain(&Z_ADDRS) {
            assert!(s.opcodes_for(*addr).contains(&proto::OP_HALT_AND_HOLD));
        }
        assert!(!h.controller.borrow().pid_enabled());
        assert!(h
            .events
            .borrow()
            .contains(&PeripheralEvent::ProjectorPoweredDown));
        assert!(h.events.borrow().contains(&PeripheralEvent::LedStopped));
    }

    #[test]
    fn abort_during_motion_wait_halts_all_groups() {
        let mut h = harness();
        // Leave a target mismatch so the wait loop runs, then abort.
        h.bus
            .borrow_mut()
            .set_variable(0x0E, proto::VAR_CURRENT_POSITION, 1);
        h.abort.request_abort();
        let result = h.interp.execute("G1 R100");
        assert!(matches!(result, Err(CommandError::Aborted)));
        let s = h.bus.borrow();
        for addr in RT_ADDRS.iter().chain(&T_ADDRS).chain(&Z_ADDRS) {
            assert!(s.opcodes_for(*addr).contains(&proto::OP_HALT_AND_HOLD));
        }
    }

    #[test]
    fn write_fault_while_issuing_a_command_is_a_plain_stepper_error() {
        let mut h = harness();
        h.bus.borrow_mut().fail_writes = true;
        // The fault surfaces as a per-command error, not a motion-wait
        // fault, so the caller keeps processing queued commands.
        assert!(matches!(
            h.interp.execute("G1 R100"),
            Err(CommandError::Stepper(_))
        ));
    }

    #[test]
    fn read_fault_during_motion_wait_halts_all_groups() {
        let mut h = harness();
        h.bus.borrow_mut().fail_reads = true;
        let result = h.interp.execute("G1 R100");
        assert!(matches!(result, Err(CommandError::MotionWait(_))));
        let s = h.bus.borrow();
        for addr in RT_ADDRS.iter().chain(&T_ADDRS).chain(&Z_ADDRS) {
            assert!(s.opcodes_for(*addr).contains(&proto::OP_HALT_AND_HOLD));
        }
    }

    #[test]
    fn comments_and_blank_lines_are_no_ops() {
        let mut h = harness();
        assert_eq!(h.interp.execute("; just a comment").unwrap(), Flow::Continue);
        assert_eq!(h.interp.execute("   ").unwrap(), Flow::Continue);
        assert!(h.bus.borrow().writes.is_empty());
    }

    #[test]
    fn unknown_head_is_a_parse_error() {
        let mut h = harness();
        assert!(matches!(
            h.interp.execute("X99"),
            Err(CommandError::Parse(_))
        ));
    }
}
