//! Trial sequencing: draws the parameters of each trial and books its outcome.

use std::f64::consts::TAU;

use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use trialrig_traits::RawTrialData;

use crate::blocks::{BlockRecord, BlockSchedule};
use crate::config::{BlockCfg, DebiasWindow, SamplerCfg};
use crate::error::{Result, RigError};
use crate::sampling::{draw_contrast, uniform_choice, weighted_choice};
use crate::training::{
    AdaptiveTrainingController, MAX_TRAINING_PHASE, SessionSummary, TrainingState,
    contrasts_for_phase,
};
use crate::trial::{Outcome, TrialRecord, decode_outcome};

/// Responded trials considered by the `last10` debias window.
const DEBIAS_RECENT: usize = 10;

#[derive(Debug)]
enum Task {
    Biased(BlockSchedule),
    Training(Box<AdaptiveTrainingController>),
}

#[derive(Debug)]
pub struct TrialSequencer {
    sampler: SamplerCfg,
    task: Task,
    rng: StdRng,
    trials: Vec<TrialRecord>,
    ntrials_correct: u32,
    water_delivered_ul: f64,
}

fn validate_sampler(cfg: &SamplerCfg) -> Result<()> {
    let [left, right] = cfg.positions;
    if left == 0 || right == 0 || left == right {
        return Err(RigError::Config(format!(
            "stimulus positions must be two distinct non-zero sides, got {:?}",
            cfg.positions
        ))
        .into());
    }
    Ok(())
}

impl TrialSequencer {
    /// Biased task: probability-left blocks, contrast from `contrast_set`.
    pub fn biased(sampler: SamplerCfg, blocks: BlockCfg, rng: StdRng) -> Result<Self> {
        validate_sampler(&sampler)?;
        if sampler.contrast_set.is_empty() {
            return Err(RigError::Config("contrast_set is empty".into()).into());
        }
        Ok(Self::with_task(sampler, Task::Biased(BlockSchedule::new(blocks)?), rng))
    }

    /// Training task: contrasts narrowed by the controller's phase.
    pub fn training(
        sampler: SamplerCfg,
        controller: AdaptiveTrainingController,
        rng: StdRng,
    ) -> Result<Self> {
        validate_sampler(&sampler)?;
        for phase in 0..=MAX_TRAINING_PHASE {
            if contrasts_for_phase(&sampler.contrasts, phase).is_empty() {
                return Err(RigError::Config(format!(
                    "no configured contrast is allowed in training phase {phase}"
                ))
                .into());
            }
        }
        Ok(Self::with_task(
            sampler,
            Task::Training(Box::new(controller)),
            rng,
        ))
    }

    fn with_task(sampler: SamplerCfg, task: Task, rng: StdRng) -> Self {
        Self {
            sampler,
            task,
            rng,
            trials: Vec::new(),
            ntrials_correct: 0,
            water_delivered_ul: 0.0,
        }
    }

    /// Draw the next trial. The previous one must have been completed.
    pub fn next_trial(&mut self) -> Result<&TrialRecord> {
        if let Some(prev) = self.trials.last()
            && !prev.is_completed()
        {
            return Err(RigError::Protocol {
                message: format!(
                    "next_trial called before trial {} was completed",
                    prev.trial_num
                ),
                raw: None,
            }
            .into());
        }
        let trial_num = u32::try_from(self.trials.len())
            .map_err(|_| RigError::Config("trial counter overflow".into()))?;
        let s = &self.sampler;
        let quiescent_period = s.quiescent_base + s.quiescent_extra.sample(&mut self.rng)?;
        let stim_phase = self.rng.gen_range(0.0..TAU);

        let mut record = TrialRecord {
            trial_num,
            block_num: None,
            block_trial_num: None,
            stim_probability_left: 0.5,
            position: s.positions[0],
            contrast: 0.0,
            quiescent_period,
            stim_phase,
            stim_gain: s.stim_gain,
            stim_sigma: s.stim_sigma,
            stim_angle: s.stim_angle,
            stim_freq: s.stim_freq,
            stim_reverse: s.stim_reverse,
            reward_amount_ul: s.reward_amount_ul,
            reward_valve_time_s: 0.0,
            training_phase: None,
            debias_trial: false,
            outcome: None,
            trial_correct: false,
            response_side: 0,
            response_time: None,
        };

        match &mut self.task {
            Task::Biased(blocks) => {
                let block = blocks.advance(&mut self.rng)?;
                let contrast = draw_contrast(
                    &mut self.rng,
                    &s.contrast_set,
                    s.probability_type,
                    s.probability_index,
                    s.probability_weight,
                )?;
                let pleft = block.probability_left;
                record.block_num = Some(block.block_num);
                record.block_trial_num = Some(blocks.block_trial_num());
                record.stim_probability_left = pleft;
                record.contrast = contrast;
                record.position = weighted_choice(&mut self.rng, &s.positions, &[pleft, 1.0 - pleft])?;
            }
            Task::Training(ctrl) => {
                ctrl.count_trial();
                ctrl.check_training_phase();
                let signed = uniform_choice(&mut self.rng, &ctrl.allowed_contrasts(&s.contrasts))?;
                record.contrast = signed.abs();
                record.position = s.positions[usize::from(signed > 0.0)];
                record.training_phase = Some(ctrl.training_phase());
                record.reward_amount_ul = ctrl.adaptive_reward_ul();
                record.stim_gain = ctrl.adaptive_gain();

                let cfg = ctrl.config();
                if let Some(prev) = self.trials.last()
                    && cfg.debias
                    && ctrl.training_phase() < MAX_TRAINING_PHASE
                    && !prev.trial_correct
                    && prev.contrast >= cfg.debias_min_contrast
                {
                    let avg_right = right_fraction(&self.trials, cfg.debias_window);
                    let normal = Normal::new(avg_right, cfg.debias_sigma).map_err(|e| {
                        RigError::Config(format!("debias distribution: {e}"))
                    })?;
                    let draw = normal.sample(&mut self.rng);
                    record.contrast = prev.contrast;
                    record.position = s.positions[usize::from(draw >= 0.5)];
                    record.debias_trial = true;
                }
            }
        }

        tracing::debug!(
            trial_num,
            position = record.position,
            contrast = record.contrast,
            quiescent_period = record.quiescent_period,
            debias = record.debias_trial,
            "trial drawn"
        );
        self.trials.push(record);
        self.current()
            .ok_or_else(|| RigError::Config("trial table is empty".into()).into())
    }

    /// Book the controller's report for the current trial.
    pub fn trial_completed(&mut self, raw: &RawTrialData) -> Result<&TrialRecord> {
        let Some(trial) = self.trials.last_mut() else {
            return Err(RigError::protocol("trial_completed called before next_trial", raw).into());
        };
        if trial.is_completed() {
            return Err(RigError::protocol(
                format!("trial {} was already completed", trial.trial_num),
                raw,
            )
            .into());
        }
        let outcome = decode_outcome(raw)?;
        if trial.position == 0 {
            return Err(RigError::protocol(
                format!("trial {} has no stimulus side", trial.trial_num),
                raw,
            )
            .into());
        }
        trial.response_time = match (raw.first_visit("closed_loop"), raw.first_visit("stim_on")) {
            (Some(cl), Some(on)) => Some(cl[1] - on[0]),
            _ => None,
        };
        let side = trial.position.signum() as i8;
        match outcome {
            Outcome::Correct => {
                trial.trial_correct = true;
                trial.response_side = -side;
                self.ntrials_correct += 1;
            }
            Outcome::Error => trial.response_side = side,
            Outcome::NoGo => trial.response_side = 0,
        }
        if !trial.trial_correct {
            trial.reward_amount_ul = 0.0;
        }
        trial.outcome = Some(outcome);
        self.water_delivered_ul += trial.reward_amount_ul;

        if let Task::Training(ctrl) = &mut self.task {
            ctrl.record_trial(trial.signed_contrast(), trial.trial_correct);
        }
        tracing::debug!(
            trial_num = trial.trial_num,
            %outcome,
            response_time = trial.response_time,
            "trial booked"
        );
        Ok(trial)
    }

    /// Record how long the valve will open for the current trial's reward.
    pub fn set_reward_valve_time(&mut self, seconds: f64) {
        if let Some(t) = self.trials.last_mut() {
            t.reward_valve_time_s = seconds;
        }
    }

    pub fn current(&self) -> Option<&TrialRecord> {
        self.trials.last()
    }

    pub fn trials(&self) -> &[TrialRecord] {
        &self.trials
    }

    pub fn blocks(&self) -> &[BlockRecord] {
        match &self.task {
            Task::Biased(b) => b.blocks(),
            Task::Training(_) => &[],
        }
    }

    pub fn controller(&self) -> Option<&AdaptiveTrainingController> {
        match &self.task {
            Task::Training(c) => Some(&**c),
            Task::Biased(_) => None,
        }
    }

    pub fn ntrials_correct(&self) -> u32 {
        self.ntrials_correct
    }

    pub fn water_delivered_ul(&self) -> f64 {
        self.water_delivered_ul
    }

    pub fn summary(&self, subject_weight_g: Option<f64>) -> SessionSummary {
        let completed = self.trials.iter().filter(|t| t.is_completed()).count();
        SessionSummary {
            ntrials: u32::try_from(completed).unwrap_or(u32::MAX),
            ntrials_correct: self.ntrials_correct,
            water_delivered_ul: self.water_delivered_ul,
            subject_weight_g,
            reward_amount_ul: self
                .controller()
                .map_or(self.sampler.reward_amount_ul, AdaptiveTrainingController::adaptive_reward_ul),
            stim_gain: self
                .controller()
                .map_or(self.sampler.stim_gain, AdaptiveTrainingController::adaptive_gain),
        }
    }

    /// Close a training session; `None` for the biased task.
    pub fn into_training_state(self, subject_weight_g: Option<f64>) -> Option<TrainingState> {
        let summary = self.summary(subject_weight_g);
        match self.task {
            Task::Training(c) => Some(c.end_session(summary)),
            Task::Biased(_) => None,
        }
    }
}

/// Fraction of rightward responses, no-go trials counting as not rightward.
///
/// The recent window always divides by its full length, so a short history
/// reads as if padded with no-go trials. The full window is 0.5 with no trials.
fn right_fraction(trials: &[TrialRecord], window: DebiasWindow) -> f64 {
    let is_right = |t: &&TrialRecord| t.response_side == 1;
    match window {
        DebiasWindow::Last10 => {
            trials.iter().rev().take(DEBIAS_RECENT).filter(is_right).count() as f64
                / DEBIAS_RECENT as f64
        }
        DebiasWindow::Full if trials.is_empty() => 0.5,
        DebiasWindow::Full => trials.iter().filter(is_right).count() as f64 / trials.len() as f64,
    }
}
