// Seams for the projection-side peripherals.
//
// The illumination and projector drivers are external collaborators
// with fixed command sequences and no feedback; the interpreter only
// needs on/off/current control, so they sit behind traits and the
// default implementations log the requested transitions.

use tracing::info;

/// LED illumination source.
pub trait Illumination {
    fn configure(&mut self);
    fn set_current_ma(&mut self, current_ma: u32);
    fn stop(&mut self);
}

/// DLP projector video path.
pub trait Projector {
    fn configure(&mut self);
    fn power_down(&mut self);
}

#[derive(Debug, Default)]
pub struct LogIllumination;

impl Illumination for LogIllumination {
    fn configure(&mut self) {
        info!("illumination configured");
    }

    fn set_current_ma(&mut self, current_ma: u32) {
        info!(current_ma, "illumination current set");
    }

    fn stop(&mut self) {
        info!("illumination stopped");
    }
}

#[derive(Debug, Default)]
pub struct LogProjector;

impl Projector for LogProjector {
    fn configure(&mut self) {
        info!("projector configured");
    }

    fn power_down(&mut self) {
        info!("projector powered down");
    }
}
