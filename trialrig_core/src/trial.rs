//! Per-trial record and the decoder for the controller's terminal branch.

use serde::Serialize;
use trialrig_traits::{RawTrialData, TrialInfo};

use crate::error::{Result, RigError};

/// Terminal branch a trial ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Correct,
    Error,
    NoGo,
}

impl Outcome {
    pub const ALL: [Self; 3] = [Self::Correct, Self::Error, Self::NoGo];

    /// Name of the state whose visit identifies this outcome.
    pub fn state_name(self) -> &'static str {
        match self {
            Self::Correct => "correct",
            Self::Error => "error",
            Self::NoGo => "no_go",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.state_name())
    }
}

/// Exactly one of `correct`, `error` and `no_go` must have been entered.
pub fn decode_outcome(raw: &RawTrialData) -> Result<Outcome> {
    let visited: Vec<Outcome> = Outcome::ALL
        .into_iter()
        .filter(|o| raw.visited(o.state_name()))
        .collect();
    match visited.as_slice() {
        [one] => Ok(*one),
        [] => Err(RigError::protocol("trial reached no terminal branch", raw).into()),
        many => Err(RigError::protocol(
            format!(
                "trial reached {} terminal branches: {}",
                many.len(),
                many.iter().copied().map(Outcome::state_name).collect::<Vec<_>>().join(", ")
            ),
            raw,
        )
        .into()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialRecord {
    pub trial_num: u32,
    pub block_num: Option<usize>,
    pub block_trial_num: Option<usize>,
    pub stim_probability_left: f64,
    /// Stimulus azimuth in degrees; never 0.
    pub position: i32,
    /// Unsigned contrast.
    pub contrast: f64,
    pub quiescent_period: f64,
    pub stim_phase: f64,
    pub stim_gain: f64,
    pub stim_sigma: f64,
    pub stim_angle: f64,
    pub stim_freq: f64,
    pub stim_reverse: bool,
    pub reward_amount_ul: f64,
    pub reward_valve_time_s: f64,
    pub training_phase: Option<u8>,
    pub debias_trial: bool,
    pub outcome: Option<Outcome>,
    pub trial_correct: bool,
    /// -1 left, +1 right, 0 no response.
    pub response_side: i8,
    pub response_time: Option<f64>,
}

impl TrialRecord {
    pub fn signed_contrast(&self) -> f64 {
        self.contrast * f64::from(self.position.signum())
    }

    pub fn is_completed(&self) -> bool {
        self.outcome.is_some()
    }

    /// Values broadcast to the stimulus renderer before the trial runs.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn trial_info(&self) -> TrialInfo {
        TrialInfo {
            trial_num: self.trial_num as i32,
            position: self.position,
            stim_phase: self.stim_phase as f32,
            contrast: self.contrast as f32,
            stim_freq: self.stim_freq as f32,
            stim_angle: self.stim_angle as f32,
            stim_gain: self.stim_gain as f32,
            stim_sigma: self.stim_sigma as f32,
            stim_reverse: i32::from(self.stim_reverse),
        }
    }
}
