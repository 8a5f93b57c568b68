//! External per-stage override surface.

use super::payload::Payload;

/// An external handler that may short-circuit any stage.
///
/// Each method receives the stage input and a slot for the output. Returning
/// `true` means the plugin produced the output and the stage's built-in
/// compute must be skipped; `false` falls through to the built-in kernel.
/// The default implementations never intervene.
pub trait Plugin: Send + Sync {
    fn on_rectify(&self, _input: &Payload, _output: &mut Option<Payload>) -> bool {
        false
    }

    fn on_disparity(&self, _input: &Payload, _output: &mut Option<Payload>) -> bool {
        false
    }

    fn on_disparity_normalized(&self, _input: &Payload, _output: &mut Option<Payload>) -> bool {
        false
    }

    fn on_points(&self, _input: &Payload, _output: &mut Option<Payload>) -> bool {
        false
    }

    fn on_depth(&self, _input: &Payload, _output: &mut Option<Payload>) -> bool {
        false
    }
}
