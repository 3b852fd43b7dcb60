// Subprocess Controller
//
// Spawns the assistant program, feeds stdout through the stream parser and
// terminates it on request, timeout or cancellation.

pub mod controller;

pub use controller::{
    ControllerOptions, ControllerProgress, DEFAULT_GRACE_PERIOD, DEFAULT_TIMEOUT, StopReason,
    SubprocessController,
};
