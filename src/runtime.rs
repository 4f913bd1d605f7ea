// Process wiring and the operator REPL.
//
// Startup brings the eight stepper drives online, opens the coprocessor
// link, homes the linear axes, then drains console lines through the
// interpreter one command at a time. The queue survives per-command
// errors; aborts and transport faults flush it.

use std::collections::VecDeque;
use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use crate::abort::{restore_terminal, AbortSignal, ConsoleEvent, ConsoleListener};
use crate::axis::Axis;
use crate::config::{self, ConfigError, MachineConfig};
use crate::coproc::{CoprocError, CoprocLink};
use crate::homing::{self, HomingError};
use crate::interpreter::{CommandError, Flow, Interpreter, Machine};
use crate::peripherals::{Illumination, LogIllumination, LogProjector, Projector};
use crate::stepper::{AxisGroup, I2cStepperBus, StepperError, TicDrive};
use crate::{cprint, cprintln};

#[derive(Parser, Debug)]
#[command(name = "helical-motion-runtime", about = "Motion-control runtime")]
pub struct Cli {
    /// JSON machine-config file; built-in defaults apply otherwise.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the stepper bus device path.
    #[arg(long)]
    pub stepper_bus: Option<String>,

    /// Override the coprocessor serial port.
    #[arg(long)]
    pub coproc_port: Option<String>,

    /// Skip the homing cycle at startup.
    #[arg(long)]
    pub skip_homing: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Stepper(#[from] StepperError),
    #[error(transparent)]
    Coproc(#[from] CoprocError),
    #[error(transparent)]
    Homing(#[from] HomingError),
    #[error("console setup failed: {0}")]
    Io(#[from] std::io::Error),
}

fn open_drive(
    bus_path: &str,
    addr: u8,
    name: &str,
    tuning: &config::DriveTuning,
) -> Result<TicDrive<I2cStepperBus>, StepperError> {
    let bus = I2cStepperBus::open(bus_path, addr)?;
    TicDrive::new(bus, name, tuning)
}

fn build_machine(cfg: &MachineConfig) -> Result<Machine<I2cStepperBus>, StepperError> {
    let bus = &cfg.stepper_bus;
    Ok(Machine {
        r: AxisGroup::new(
            Axis::R,
            vec![
                open_drive(bus, config::ADDR_TW_R, "tw_r", &cfg.rt)?,
                open_drive(bus, config::ADDR_CW_R, "cw_r", &cfg.rt)?,
            ],
        ),
        t: AxisGroup::new(
            Axis::T,
            vec![
                open_drive(bus, config::ADDR_TW_T, "tw_t", &cfg.rt)?,
                open_drive(bus, config::ADDR_CW_T, "cw_t", &cfg.rt)?,
            ],
        ),
        z: AxisGroup::new(
            Axis::Z,
            vec![
                open_drive(bus, config::ADDR_TW_Z1, "tw_z1", &cfg.z)?,
                open_drive(bus, config::ADDR_TW_Z2, "tw_z2", &cfg.z)?,
                open_drive(bus, config::ADDR_CW_Z1, "cw_z1", &cfg.z)?,
                open_drive(bus, config::ADDR_CW_Z2, "cw_z2", &cfg.z)?,
            ],
        ),
    })
}

pub fn run(cli: Cli) -> Result<(), RuntimeError> {
    let mut cfg = match &cli.config {
        Some(path) => MachineConfig::load(path)?,
        None => MachineConfig::default(),
    };
    if let Some(bus) = cli.stepper_bus {
        cfg.stepper_bus = bus;
    }
    if let Some(port) = cli.coproc_port {
        cfg.coproc_port = port;
    }

    info!(bus = %cfg.stepper_bus, port = %cfg.coproc_port, "bringing machine online");
    let mut machine = build_machine(&cfg)?;
    let link = CoprocLink::open(&cfg.coproc_port, cfg.coproc_baud)?;

    for group in [&mut machine.r, &mut machine.t, &mut machine.z] {
        group.exit_safe_start()?;
        group.energize()?;
        group.set_target_velocity(0)?;
    }

    let abort = AbortSignal::new();
    let listener = ConsoleListener::spawn(abort.clone())?;

    let result = startup_and_repl(machine, link, cfg, abort, &listener, cli.skip_homing);
    restore_terminal();
    result
}

fn startup_and_repl(
    mut machine: Machine<I2cStepperBus>,
    link: CoprocLink<Box<dyn serialport::SerialPort>>,
    cfg: MachineConfig,
    abort: AbortSignal,
    listener: &ConsoleListener,
    skip_homing: bool,
) -> Result<(), RuntimeError> {
    if skip_homing {
        cprintln!("skipping homing (--skip-homing)");
    } else {
        cprintln!("homing R/T/Z ...");
        abort.set_busy(true);
        for axis in Axis::LINEAR {
            let group = match axis {
                Axis::R => &mut machine.r,
                Axis::T => &mut machine.t,
                Axis::Z => &mut machine.z,
                Axis::A => continue,
            };
            if let Some(params) = cfg.homing(axis) {
                homing::home_group(group, params, &abort)?;
            }
        }
        abort.set_busy(false);
        cprintln!("homing complete");
    }

    let mut led: Box<dyn Illumination> = Box::new(LogIllumination);
    let mut projector: Box<dyn Projector> = Box::new(LogProjector);
    led.configure();
    led.set_current_ma(config::LED_DEFAULT_CURRENT_MA);
    projector.configure();

    let mut interp = Interpreter::new(machine, link, led, projector, cfg, abort.clone());

    cprintln!("G-code ready. Examples: `G0 R100 T100 Z100`, `G1 Z-200 FR120000`, `G33 A9`, `M114`, `M112`.");
    cprintln!("Comments with ';' are ignored. Space aborts motion. Ctrl-D to exit.");

    let mut queue: VecDeque<String> = VecDeque::new();
    loop {
        cprint!("> ");
        match listener.recv() {
            ConsoleEvent::Eof => break,
            ConsoleEvent::Line(line) => queue.push_back(line),
        }

        while let Some(command) = queue.pop_front() {
            // Lines typed while a command runs pile up behind it.
            while let Some(ConsoleEvent::Line(line)) = listener.try_recv() {
                queue.push_back(line);
            }

            if abort.abort_requested() {
                cprintln!("ABORT: clearing command queue");
                queue.clear();
                interp.safety_stop();
                abort.clear_abort();
                break;
            }

            cprintln!("executing: {command}");
            abort.set_busy(true);
            let result = interp.execute(&command);
            abort.set_busy(false);

            match result {
                Ok(Flow::Continue) => cprintln!("--- command complete ---"),
                Ok(Flow::Quit) => {
                    shutdown(&mut interp);
                    return Ok(());
                }
                Err(CommandError::Aborted) => {
                    cprintln!("ABORT: clearing command queue");
                    queue.clear();
                    interp.safety_stop();
                    abort.clear_abort();
                    break;
                }
                Err(e @ CommandError::MotionWait(_)) => {
                    // A drive that stops answering mid-move is unsafe to
                    // keep feeding commands; flush everything pending.
                    // Faults while merely issuing a command are reported
                    // below and the queue keeps going.
                    error!("stepper transport fault: {e}");
                    cprintln!("!! {e}, clearing command queue");
                    queue.clear();
                    break;
                }
                Err(e) => {
                    cprintln!("!! {e}");
                }
            }
        }
    }

    shutdown(&mut interp);
    Ok(())
}

fn shutdown<B: crate::stepper::StepperBus, P: std::io::Read + std::io::Write>(
    interp: &mut Interpreter<B, P>,
) {
    cprintln!("shutting down");
    interp.safety_stop();
    let machine = interp.machine_mut();
    for group in [&mut machine.r, &mut machine.t, &mut machine.z] {
        if let Err(e) = group.deenergize() {
            error!("failed to de-energize {}: {e}", group.axis());
        }
    }
}
