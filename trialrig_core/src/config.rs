//! Configuration types for the trial engine.
//!
//! These are the runtime structs handed to the sequencer, the controller and
//! the FSM builder. They are separate from the TOML-deserialized config in
//! `trialrig_config` and are built once at startup (see `conversions`).

pub use trialrig_config::{DebiasWindow, ProbabilityType, TaskKind};

use crate::sampling::TruncExp;

/// Parameters drawn or copied into every trial record.
#[derive(Debug, Clone)]
pub struct SamplerCfg {
    /// `[left, right]` stimulus positions (deg azimuth).
    pub positions: [i32; 2],
    /// Signed contrasts available to the training curriculum.
    pub contrasts: Vec<f64>,
    /// Unsigned contrasts drawn by the biased task.
    pub contrast_set: Vec<f64>,
    pub probability_type: ProbabilityType,
    /// Designated contrast for `ProbabilityType::Biased`; negative counts from the end.
    pub probability_index: isize,
    pub probability_weight: f64,
    /// Fixed part of the quiescent period; a truncated exponential draw is added.
    pub quiescent_base: f64,
    pub quiescent_extra: TruncExp,
    pub stim_gain: f64,
    pub stim_sigma: f64,
    pub stim_angle: f64,
    pub stim_freq: f64,
    pub stim_reverse: bool,
    pub reward_amount_ul: f64,
}

impl Default for SamplerCfg {
    fn default() -> Self {
        Self {
            positions: [-35, 35],
            contrasts: vec![
                -1.0, -0.5, -0.25, -0.125, -0.0625, 0.0, 0.0625, 0.125, 0.25, 0.5, 1.0,
            ],
            contrast_set: vec![1.0, 0.25, 0.125, 0.0625, 0.0],
            probability_type: ProbabilityType::Uniform,
            probability_index: -1,
            probability_weight: 0.5,
            quiescent_base: 0.2,
            quiescent_extra: TruncExp {
                scale: 0.35,
                min: 0.2,
                max: 0.5,
            },
            stim_gain: 4.0,
            stim_sigma: 7.0,
            stim_angle: 0.0,
            stim_freq: 0.1,
            stim_reverse: false,
            reward_amount_ul: 1.5,
        }
    }
}

/// Probability-left block structure of the biased task.
#[derive(Debug, Clone)]
pub struct BlockCfg {
    /// Block 0 is 50/50 with a fixed length and block 1 draws from `probability_set`.
    pub init_5050: bool,
    pub init_5050_len: usize,
    pub probability_set: Vec<f64>,
    pub length: TruncExp,
}

impl Default for BlockCfg {
    fn default() -> Self {
        Self {
            init_5050: true,
            init_5050_len: 90,
            probability_set: vec![0.2, 0.8],
            length: TruncExp {
                scale: 60.0,
                min: 20.0,
                max: 100.0,
            },
        }
    }
}

/// Curriculum graduation and debiasing.
#[derive(Debug, Clone)]
pub struct TrainingCfg {
    pub debias: bool,
    pub debias_window: DebiasWindow,
    pub debias_min_contrast: f64,
    pub debias_sigma: f64,
    /// Rolling window per signed contrast.
    pub perf_window: usize,
    /// Inclusive fraction correct required in every graduating bucket.
    pub perf_criterion: f64,
    /// Trials spent in phases 2..=4 before moving on.
    pub trials_per_phase: u32,
}

impl Default for TrainingCfg {
    fn default() -> Self {
        Self {
            debias: true,
            debias_window: DebiasWindow::Last10,
            debias_min_contrast: 0.5,
            debias_sigma: 0.5,
            perf_window: 50,
            perf_criterion: 0.8,
            trials_per_phase: 200,
        }
    }
}

/// Session-start adjustments derived from the previous session.
#[derive(Debug, Clone)]
pub struct AdaptiveCfg {
    pub reward: bool,
    pub reward_init_ul: f64,
    pub reward_min_ul: f64,
    pub reward_max_ul: f64,
    pub reward_step_ul: f64,
    pub reward_trials_crit: u32,
    /// mL of water per gram of body weight per day.
    pub water_ml_per_g: f64,
    pub gain: bool,
    pub gain_init: f64,
    pub gain_min: f64,
    pub gain_trials_crit: u32,
}

impl Default for AdaptiveCfg {
    fn default() -> Self {
        Self {
            reward: true,
            reward_init_ul: 3.0,
            reward_min_ul: 1.5,
            reward_max_ul: 3.0,
            reward_step_ul: 0.1,
            reward_trials_crit: 200,
            water_ml_per_g: 1.0 / 25.0,
            gain: true,
            gain_init: 8.0,
            gain_min: 4.0,
            gain_trials_crit: 200,
        }
    }
}

/// State timers in seconds.
#[derive(Debug, Clone, Copy)]
pub struct FsmTimings {
    pub session_delay_start: f64,
    pub stim_on: f64,
    pub interactive_delay: f64,
    pub tone: f64,
    pub encoder_rearm: f64,
    pub response_window: f64,
    pub feedback_correct_delay: f64,
    pub feedback_error_delay: f64,
    pub feedback_nogo_delay: f64,
    pub hide_stim: f64,
    pub iti_delay: f64,
}

impl Default for FsmTimings {
    fn default() -> Self {
        Self {
            session_delay_start: 0.0,
            stim_on: 0.1,
            interactive_delay: 0.0,
            tone: 0.1,
            encoder_rearm: 0.05,
            response_window: 60.0,
            feedback_correct_delay: 1.0,
            feedback_error_delay: 2.0,
            feedback_nogo_delay: 2.0,
            hide_stim: 0.1,
            iti_delay: 0.5,
        }
    }
}

/// Controller channel and event names the trial machine is wired to.
#[derive(Debug, Clone)]
pub struct RigWiring {
    pub sync_channel: String,
    pub tone_onset_event: String,
    pub photodiode_events: Vec<String>,
    pub camera_ready_event: String,
    pub camera_trigger_softcode: u8,
    /// `[left, right]` wheel thresholds that count as movement during quiescence.
    pub quiescence_thresholds: [i32; 2],
}

impl Default for RigWiring {
    fn default() -> Self {
        Self {
            sync_channel: "BNC1".to_string(),
            tone_onset_event: "BNC2High".to_string(),
            photodiode_events: vec!["BNC1High".to_string(), "BNC1Low".to_string()],
            camera_ready_event: "Port1In".to_string(),
            camera_trigger_softcode: 4,
            quiescence_thresholds: [-2, 2],
        }
    }
}
