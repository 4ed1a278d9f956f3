#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Trial engine for closed-loop wheel tasks (hardware-agnostic).
//!
//! The engine draws trial parameters, describes each trial as a state machine
//! for the controller, and books the outcome the controller reports. All rig
//! access goes through the capability traits in `trialrig_traits`.
//!
//! ## Architecture
//!
//! - **Sequencing**: `TrialSequencer` draws contrast, side, quiescent period
//!   and stimulus phase; the biased task adds probability-left blocks
//!   (`blocks`), the training task a curriculum (`training`).
//! - **State machines**: `TrialStateMachineBuilder` turns a `TrialRecord`
//!   into the per-trial machine; `Spacer` emits the session-start marker.
//! - **Valve**: `ValveCalibration` maps open time to volume and back.
//! - **Session**: `Session` runs the loop, honours `.pause`/`.stop` and the
//!   automatic `StopCriteria`.

pub mod atomic;
pub mod blocks;
pub mod builder;
pub mod config;
pub mod conversions;
pub mod error;
pub mod fsm;
pub mod mocks;
pub mod sampling;
pub mod sequencer;
pub mod session;
pub mod spacer;
pub mod training;
pub mod trial;
pub mod valve;

pub use crate::blocks::{BlockRecord, BlockSchedule};
pub use crate::builder::{Missing, SessionBuilder, Set};
pub use crate::error::{BuildError, Report, Result, RigError};
pub use crate::fsm::{TrialEnv, TrialStateMachineBuilder};
pub use crate::sequencer::TrialSequencer;
pub use crate::session::{Session, SessionFlags, SessionReport, StopCriteria, StopReason};
pub use crate::spacer::Spacer;
pub use crate::training::{AdaptiveTrainingController, SessionSummary, TrainingState};
pub use crate::trial::{Outcome, TrialRecord, decode_outcome};
pub use crate::valve::{Valve, ValveCalibration};
