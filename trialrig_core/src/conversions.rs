//! Conversions from the deserialized `trialrig_config` sections into the
//! runtime structs of this crate.

use crate::config::{AdaptiveCfg, BlockCfg, FsmTimings, RigWiring, SamplerCfg, TrainingCfg};
use crate::error::{Report, RigError};
use crate::sampling::TruncExp;
use crate::spacer::Spacer;
use crate::valve::ValveCalibration;

// ── SamplerCfg ───────────────────────────────────────────────────────────────

impl TryFrom<&trialrig_config::TaskCfg> for SamplerCfg {
    type Error = Report;

    fn try_from(c: &trialrig_config::TaskCfg) -> Result<Self, Report> {
        let positions: [i32; 2] = c.stim_positions.as_slice().try_into().map_err(|_| {
            RigError::Config(format!(
                "exactly two stimulus positions are required, got {}",
                c.stim_positions.len()
            ))
        })?;
        let q = c.quiescent_extra;
        Ok(Self {
            positions,
            contrasts: c.contrasts.clone(),
            contrast_set: c.contrast_set.clone(),
            probability_type: c.contrast_set_probability_type,
            probability_index: c.probability_index as isize,
            probability_weight: c.probability_weight,
            quiescent_base: c.quiescent_period,
            quiescent_extra: TruncExp::new(q.scale, q.min, q.max)?,
            stim_gain: c.stim_gain,
            stim_sigma: c.stim_sigma,
            stim_angle: c.stim_angle,
            stim_freq: c.stim_freq,
            stim_reverse: c.stim_reverse,
            reward_amount_ul: c.reward_amount_ul,
        })
    }
}

// ── FsmTimings ───────────────────────────────────────────────────────────────

impl From<&trialrig_config::TaskCfg> for FsmTimings {
    fn from(c: &trialrig_config::TaskCfg) -> Self {
        Self {
            session_delay_start: c.session_delay_start,
            interactive_delay: c.interactive_delay,
            response_window: c.response_window,
            feedback_correct_delay: c.feedback_correct_delay,
            feedback_error_delay: c.feedback_error_delay,
            feedback_nogo_delay: c.feedback_nogo_delay,
            iti_delay: c.iti_delay,
            ..Self::default()
        }
    }
}

// ── BlockCfg ─────────────────────────────────────────────────────────────────

impl TryFrom<&trialrig_config::BlocksCfg> for BlockCfg {
    type Error = Report;

    fn try_from(c: &trialrig_config::BlocksCfg) -> Result<Self, Report> {
        Ok(Self {
            init_5050: c.init_5050,
            init_5050_len: c.init_5050_len,
            probability_set: c.probability_set.clone(),
            length: TruncExp::new(c.len_factor, c.len_min, c.len_max)?,
        })
    }
}

// ── TrainingCfg / AdaptiveCfg ────────────────────────────────────────────────

impl From<&trialrig_config::TrainingCfg> for TrainingCfg {
    fn from(c: &trialrig_config::TrainingCfg) -> Self {
        Self {
            debias: c.debias,
            debias_window: c.debias_window,
            debias_min_contrast: c.debias_min_contrast,
            debias_sigma: c.debias_sigma,
            perf_window: c.perf_window,
            perf_criterion: c.perf_criterion,
            trials_per_phase: c.trials_per_phase,
        }
    }
}

impl From<&trialrig_config::AdaptiveCfg> for AdaptiveCfg {
    fn from(c: &trialrig_config::AdaptiveCfg) -> Self {
        Self {
            reward: c.reward,
            reward_init_ul: c.reward_init_ul,
            reward_min_ul: c.reward_min_ul,
            reward_max_ul: c.reward_max_ul,
            reward_step_ul: c.reward_step_ul,
            reward_trials_crit: c.reward_trials_crit,
            water_ml_per_g: c.water_ml_per_g,
            gain: c.gain,
            gain_init: c.gain_init,
            gain_min: c.gain_min,
            gain_trials_crit: c.gain_trials_crit,
        }
    }
}

// ── RigWiring ────────────────────────────────────────────────────────────────

impl From<&trialrig_config::HardwareCfg> for RigWiring {
    fn from(c: &trialrig_config::HardwareCfg) -> Self {
        Self {
            sync_channel: c.sync_channel.clone(),
            tone_onset_event: c.tone_onset_event.clone(),
            photodiode_events: c.photodiode_events.clone(),
            camera_ready_event: c.camera_ready_event.clone(),
            camera_trigger_softcode: c.camera_trigger_softcode,
            quiescence_thresholds: c.quiescence_thresholds,
        }
    }
}

// ── Spacer ───────────────────────────────────────────────────────────────────

impl TryFrom<&trialrig_config::SpacerCfg> for Spacer {
    type Error = Report;

    fn try_from(c: &trialrig_config::SpacerCfg) -> Result<Self, Report> {
        Self::new(c.dt_start, c.dt_end, c.n_pulses, c.tup)
    }
}

// ── ValveCalibration ─────────────────────────────────────────────────────────

impl TryFrom<&trialrig_config::PersistedCalibration> for ValveCalibration {
    type Error = Report;

    fn try_from(c: &trialrig_config::PersistedCalibration) -> Result<Self, Report> {
        let cal = Self::new(c.open_times_ms.clone(), c.volumes_ul.clone())?;
        Ok(match &c.date {
            Some(d) => cal.with_date(d.clone()),
            None => cal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_over() {
        let cfg = trialrig_config::Config::default();
        let sampler = SamplerCfg::try_from(&cfg.task).unwrap();
        assert_eq!(sampler.positions, [-35, 35]);
        assert_eq!(sampler.contrast_set, SamplerCfg::default().contrast_set);
        let blocks = BlockCfg::try_from(&cfg.blocks).unwrap();
        assert_eq!(blocks.init_5050_len, 90);
        assert_eq!(blocks.length, BlockCfg::default().length);
        let timings = FsmTimings::from(&cfg.task);
        assert_eq!(timings.response_window, 60.0);
        assert_eq!(timings.stim_on, 0.1);
        let spacer = Spacer::try_from(&cfg.spacer).unwrap();
        assert_eq!(spacer, Spacer::default());
    }

    #[test]
    fn three_positions_are_rejected() {
        let mut cfg = trialrig_config::Config::default();
        cfg.task.stim_positions = vec![-35, 0, 35];
        assert!(SamplerCfg::try_from(&cfg.task).is_err());
    }

    #[test]
    fn persisted_calibration_keeps_date() {
        let p = trialrig_config::PersistedCalibration {
            open_times_ms: vec![50.0, 100.0, 150.0],
            volumes_ul: vec![4.0, 9.0, 14.0],
            date: Some("2024-03-01".into()),
        };
        let cal = ValveCalibration::try_from(&p).unwrap();
        assert_eq!(cal.date(), Some("2024-03-01"));
        assert!(cal.is_calibrated());
    }
}
