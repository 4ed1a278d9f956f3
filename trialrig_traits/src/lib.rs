//! Seam types shared between the trial engine and the rig hardware.
//!
//! Nothing here depends on a concrete device: the engine describes trials as
//! [`StateMachine`] values and talks to the rig through the capability traits
//! below, which the hardware crate (or a test double) implements.

pub mod clock;
pub mod fsm;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use fsm::{EXIT_STATE, OutputAction, RawTrialData, StateMachine, StateSpec, TUP};

/// Executes one state machine description on the real-time controller.
///
/// `run` blocks until the machine reaches `exit` and returns the per-state
/// timestamps recorded by the controller.
pub trait StateMachineRuntime {
    fn run(
        &mut self,
        sm: &StateMachine,
    ) -> Result<RawTrialData, Box<dyn std::error::Error + Send + Sync>>;
}

/// Per-trial stimulus parameters broadcast to the visual stimulus renderer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialInfo {
    pub trial_num: i32,
    pub position: i32,
    pub stim_phase: f32,
    pub contrast: f32,
    pub stim_freq: f32,
    pub stim_angle: f32,
    pub stim_gain: f32,
    pub stim_sigma: f32,
    pub stim_reverse: i32,
}

pub trait TrialInfoSink {
    fn send(&mut self, info: &TrialInfo) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Reward valve output line.
pub trait RewardValve {
    fn open_action(&self) -> OutputAction;
}

/// Commands relayed to the stimulus renderer through the encoder module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StimCommand {
    Show,
    Hide,
    ClosedLoop,
    Freeze,
}

pub trait RotaryEncoder {
    fn reset_action(&self) -> OutputAction;
    fn stim_action(&self, cmd: StimCommand) -> OutputAction;
    /// Event emitted when the wheel crosses `threshold_deg`, if that threshold is armed.
    fn threshold_event(&self, threshold_deg: i32) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoundCue {
    Stop,
    Tone,
    Noise,
}

pub trait SoundCard {
    fn cue_action(&self, cue: SoundCue) -> OutputAction;
}
