//! Training curriculum and session-to-session adaptation.
//!
//! `AdaptiveTrainingController` owns the persisted `TrainingState`: the
//! training phase (which contrasts may be drawn), trials spent per phase, and
//! the reward volume and wheel gain carried over from the previous session.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use eyre::WrapErr;
use serde::{Deserialize, Serialize};

use crate::atomic::write_atomic;
use crate::config::{AdaptiveCfg, TrainingCfg};
use crate::error::{Result, RigError};

pub const MAX_TRAINING_PHASE: u8 = 5;
pub const TRAINING_PHASES: usize = MAX_TRAINING_PHASE as usize + 1;

/// Buckets that must reach criterion to leave phase 0.
const PHASE0_BUCKETS: [f64; 4] = [-1.0, -0.5, 0.5, 1.0];
/// Buckets that must reach criterion to leave phase 1.
const PHASE1_BUCKETS: [f64; 2] = [-0.25, 0.25];

const CONTRAST_EPS: f64 = 1e-9;

/// What the next session needs to know about the last one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub ntrials: u32,
    pub ntrials_correct: u32,
    pub water_delivered_ul: f64,
    pub subject_weight_g: Option<f64>,
    pub reward_amount_ul: f64,
    pub stim_gain: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingState {
    pub training_phase: u8,
    pub phase_trials: [u32; TRAINING_PHASES],
    pub adaptive_reward_ul: f64,
    pub adaptive_gain: f64,
    pub last_session: Option<SessionSummary>,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            training_phase: 0,
            phase_trials: [0; TRAINING_PHASES],
            adaptive_reward_ul: 3.0,
            adaptive_gain: 8.0,
            last_session: None,
        }
    }
}

impl TrainingState {
    /// Read the state file, or start fresh when it does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no training state yet; starting at phase 0");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(RigError::from)
            .wrap_err_with(|| format!("read training state {}", path.display()))?;
        let state: Self = toml::from_str(&text).map_err(|e| {
            RigError::Config(format!("parse training state {}: {e}", path.display()))
        })?;
        if state.training_phase > MAX_TRAINING_PHASE {
            return Err(RigError::Config(format!(
                "training state {}: training_phase {} exceeds {MAX_TRAINING_PHASE}",
                path.display(),
                state.training_phase
            ))
            .into());
        }
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| RigError::Config(format!("serialize training state: {e}")))?;
        write_atomic(path, text.as_bytes())
            .map_err(RigError::from)
            .wrap_err_with(|| format!("write training state {}", path.display()))?;
        Ok(())
    }
}

/// Rolling fraction correct per signed contrast.
#[derive(Debug, Clone)]
pub struct PerformanceTracker {
    window: usize,
    buckets: BTreeMap<i64, VecDeque<bool>>,
}

fn bucket_key(signed_contrast: f64) -> i64 {
    (signed_contrast * 10_000.0).round() as i64
}

impl PerformanceTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            buckets: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, signed_contrast: f64, correct: bool) {
        let q = self.buckets.entry(bucket_key(signed_contrast)).or_default();
        if q.len() == self.window {
            q.pop_front();
        }
        q.push_back(correct);
    }

    /// Fraction correct over the window, `None` if the contrast was never shown.
    pub fn performance(&self, signed_contrast: f64) -> Option<f64> {
        let q = self.buckets.get(&bucket_key(signed_contrast))?;
        if q.is_empty() {
            return None;
        }
        Some(q.iter().filter(|&&c| c).count() as f64 / q.len() as f64)
    }

    fn all_at_criterion(&self, contrasts: &[f64], criterion: f64) -> bool {
        contrasts
            .iter()
            .all(|&c| self.performance(c).is_some_and(|p| p >= criterion))
    }
}

/// Signed contrasts that may be drawn in `phase`.
pub fn contrasts_for_phase(contrasts: &[f64], phase: u8) -> Vec<f64> {
    let keep = |c: f64| match phase {
        0 => c >= 0.5 - CONTRAST_EPS,
        1 => c >= 0.25 - CONTRAST_EPS,
        2 => c >= 0.125 - CONTRAST_EPS,
        3 => c >= 0.0625 - CONTRAST_EPS,
        4 => true,
        _ => (c - 0.5).abs() > CONTRAST_EPS,
    };
    contrasts.iter().copied().filter(|c| keep(c.abs())).collect()
}

/// Reward volume for the coming session from the previous one.
///
/// More than `reward_trials_crit` trials lowers the volume by one step;
/// otherwise an underfed subject (less than `water_ml_per_g` mL per gram
/// delivered) gets one step more. The result is clamped to
/// `[reward_min_ul, reward_max_ul]`.
pub fn compute_adaptive_reward_volume(
    cfg: &AdaptiveCfg,
    subject_weight_g: Option<f64>,
    reward_ul: f64,
    delivered_ul: f64,
    ntrials: u32,
) -> f64 {
    let mut reward = reward_ul;
    if ntrials > cfg.reward_trials_crit {
        reward -= cfg.reward_step_ul;
    } else if let Some(w) = subject_weight_g
        && w * cfg.water_ml_per_g > delivered_ul / 1000.0
    {
        reward += cfg.reward_step_ul;
    }
    reward.clamp(cfg.reward_min_ul, cfg.reward_max_ul)
}

pub fn adaptive_gain(cfg: &AdaptiveCfg, last: Option<&SessionSummary>) -> f64 {
    match last {
        Some(s) if s.ntrials >= cfg.gain_trials_crit => cfg.gain_min,
        Some(s) => s.stim_gain,
        None => cfg.gain_init,
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveTrainingController {
    cfg: TrainingCfg,
    adaptive: AdaptiveCfg,
    state: TrainingState,
    perf: PerformanceTracker,
}

impl AdaptiveTrainingController {
    /// Resume from `state` and derive this session's reward and gain.
    pub fn new(cfg: TrainingCfg, adaptive: AdaptiveCfg, mut state: TrainingState) -> Result<Self> {
        if state.training_phase > MAX_TRAINING_PHASE {
            return Err(RigError::Config(format!(
                "training phase {} exceeds {MAX_TRAINING_PHASE}",
                state.training_phase
            ))
            .into());
        }
        let last = state.last_session.as_ref();
        state.adaptive_reward_ul = match last {
            Some(s) if adaptive.reward => compute_adaptive_reward_volume(
                &adaptive,
                s.subject_weight_g,
                s.reward_amount_ul,
                s.water_delivered_ul,
                s.ntrials,
            ),
            _ => adaptive.reward_init_ul,
        };
        state.adaptive_gain = if adaptive.gain {
            adaptive_gain(&adaptive, last)
        } else {
            adaptive.gain_init
        };
        tracing::info!(
            training_phase = state.training_phase,
            adaptive_reward_ul = state.adaptive_reward_ul,
            adaptive_gain = state.adaptive_gain,
            "training controller ready"
        );
        Ok(Self {
            perf: PerformanceTracker::new(cfg.perf_window),
            cfg,
            adaptive,
            state,
        })
    }

    pub fn config(&self) -> &TrainingCfg {
        &self.cfg
    }

    pub fn training_phase(&self) -> u8 {
        self.state.training_phase
    }

    pub fn adaptive_reward_ul(&self) -> f64 {
        self.state.adaptive_reward_ul
    }

    pub fn adaptive_gain(&self) -> f64 {
        self.state.adaptive_gain
    }

    pub fn phase_trials(&self) -> &[u32; TRAINING_PHASES] {
        &self.state.phase_trials
    }

    pub fn performance(&self, signed_contrast: f64) -> Option<f64> {
        self.perf.performance(signed_contrast)
    }

    pub fn allowed_contrasts(&self, contrasts: &[f64]) -> Vec<f64> {
        contrasts_for_phase(contrasts, self.state.training_phase)
    }

    pub fn count_trial(&mut self) {
        let p = usize::from(self.state.training_phase);
        self.state.phase_trials[p] = self.state.phase_trials[p].saturating_add(1);
    }

    pub fn record_trial(&mut self, signed_contrast: f64, correct: bool) {
        self.perf.record(signed_contrast, correct);
    }

    /// Advance at most one phase. Returns whether the phase changed.
    pub fn check_training_phase(&mut self) -> bool {
        let phase = self.state.training_phase;
        let graduate = match phase {
            0 => self
                .perf
                .all_at_criterion(&PHASE0_BUCKETS, self.cfg.perf_criterion),
            1 => self
                .perf
                .all_at_criterion(&PHASE1_BUCKETS, self.cfg.perf_criterion),
            p if p < MAX_TRAINING_PHASE => {
                self.state.phase_trials[usize::from(p)] >= self.cfg.trials_per_phase
            }
            _ => false,
        };
        if graduate {
            self.state.training_phase = phase + 1;
            tracing::info!(
                from = phase,
                to = phase + 1,
                trials_in_phase = self.state.phase_trials[usize::from(phase)],
                "training phase advanced"
            );
        }
        graduate
    }

    /// Close the session and return the state to persist.
    pub fn end_session(mut self, summary: SessionSummary) -> TrainingState {
        tracing::debug!(
            ntrials = summary.ntrials,
            water_delivered_ul = summary.water_delivered_ul,
            reward_step_ul = self.adaptive.reward_step_ul,
            "training session closed"
        );
        self.state.last_session = Some(summary);
        self.state
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }
}
