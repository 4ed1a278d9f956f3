#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Concrete rig collaborators: Bpod-style capability objects, a simulated
//! state-machine runtime and the OSC trial-info sink.

pub mod devices;
pub mod error;
pub mod osc;
pub mod sim;

pub use devices::{BpodRotaryEncoder, BpodValve, SoftCodeSound};
pub use error::{HwError, Result};
pub use osc::{OscArg, OscSink, encode_message, trial_info_messages};
pub use sim::{Behavior, Idle, SimulatedRuntime, SimulatedSubject, SubjectParams};
