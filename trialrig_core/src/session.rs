//! Session loop: one trial at a time, with pause/stop flags checked between
//! trials.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use trialrig_traits::{
    Clock, EXIT_STATE, RotaryEncoder, SoundCard, StateMachineRuntime, TrialInfoSink,
};

use crate::builder::{Missing, SessionBuilder};
use crate::config::{FsmTimings, RigWiring};
use crate::error::{Result, RigError};
use crate::fsm::{TrialEnv, TrialStateMachineBuilder};
use crate::sequencer::TrialSequencer;
use crate::spacer::Spacer;
use crate::training::{SessionSummary, TrainingState};
use crate::trial::TrialRecord;
use crate::valve::Valve;

/// Marker files in the session directory.
#[derive(Debug, Clone)]
pub struct SessionFlags {
    dir: PathBuf,
}

impl SessionFlags {
    pub const PAUSE: &'static str = ".pause";
    pub const STOP: &'static str = ".stop";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pause_path(&self) -> PathBuf {
        self.dir.join(Self::PAUSE)
    }

    pub fn stop_path(&self) -> PathBuf {
        self.dir.join(Self::STOP)
    }

    pub fn paused(&self) -> bool {
        self.pause_path().exists()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_path().exists()
    }

    /// Create `.stop`; the loop ends after the trial in flight.
    pub fn request_stop(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.stop_path(), b"")
    }

    /// Remove `.stop` if present. Returns whether a file was removed.
    pub fn clear_stop(&self) -> std::io::Result<bool> {
        match std::fs::remove_file(self.stop_path()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxTrials,
    StopFlag,
    /// Too few trials by the time `StopCriteria::min_trials_within` elapsed.
    LowTrialRate,
    /// Recent response times are far slower than the session's.
    Inactive,
    MaxDuration,
}

/// Automatic end-of-session rules, checked after every trial.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopCriteria {
    pub min_trials: usize,
    pub min_trials_within: Duration,
    /// Recent trials whose median response time is compared with the session's.
    pub inactivity_window: usize,
    pub inactivity_factor: f64,
    pub max_duration: Duration,
}

impl Default for StopCriteria {
    fn default() -> Self {
        Self {
            min_trials: 400,
            min_trials_within: Duration::from_secs(45 * 60),
            inactivity_window: 20,
            inactivity_factor: 5.0,
            max_duration: Duration::from_secs(90 * 60),
        }
    }
}

impl StopCriteria {
    /// First rule met after `ntrials` trials and `elapsed` session time.
    ///
    /// Rules are checked in order: trial rate, inactivity (only once more than
    /// `min_trials` are done), then total duration.
    pub fn check(
        &self,
        elapsed: Duration,
        ntrials: usize,
        response_times: &[f64],
    ) -> Option<StopReason> {
        if elapsed >= self.min_trials_within && ntrials <= self.min_trials {
            return Some(StopReason::LowTrialRate);
        }
        if ntrials > self.min_trials
            && self.inactivity_window > 0
            && response_times.len() >= self.inactivity_window
            && let Some(recent) =
                median(&response_times[response_times.len() - self.inactivity_window..])
            && let Some(overall) = median(response_times)
            && recent > overall * self.inactivity_factor
        {
            return Some(StopReason::Inactive);
        }
        if elapsed > self.max_duration {
            return Some(StopReason::MaxDuration);
        }
        None
    }
}

/// Median of the finite values; mean of the middle pair for even counts.
fn median(values: &[f64]) -> Option<f64> {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    if v.is_empty() {
        return None;
    }
    v.sort_by(f64::total_cmp);
    let mid = v.len() / 2;
    Some(if v.len() % 2 == 0 {
        (v[mid - 1] + v[mid]) / 2.0
    } else {
        v[mid]
    })
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub summary: SessionSummary,
    pub stop_reason: Option<StopReason>,
    /// State to persist for the next training session.
    pub training_state: Option<TrainingState>,
}

pub struct Session {
    pub(crate) runtime: Box<dyn StateMachineRuntime>,
    pub(crate) sink: Option<Box<dyn TrialInfoSink>>,
    pub(crate) encoder: Box<dyn RotaryEncoder>,
    pub(crate) sound: Box<dyn SoundCard>,
    pub(crate) valve: Valve,
    pub(crate) sequencer: TrialSequencer,
    pub(crate) spacer: Option<Spacer>,
    pub(crate) timings: FsmTimings,
    pub(crate) wiring: RigWiring,
    pub(crate) flags: SessionFlags,
    pub(crate) clock: Box<dyn Clock + Send + Sync>,
    pub(crate) poll_interval: Duration,
    pub(crate) max_trials: usize,
    pub(crate) subject_weight_g: Option<f64>,
    pub(crate) stop_criteria: Option<StopCriteria>,
    pub(crate) stop_reason: Option<StopReason>,
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("trials", &self.sequencer.trials().len())
            .field("session_dir", &self.flags.dir())
            .field("max_trials", &self.max_trials)
            .field("spacer", &self.spacer.is_some())
            .field("stop_criteria", &self.stop_criteria)
            .finish()
    }
}

impl Session {
    pub fn builder() -> SessionBuilder<Missing, Missing, Missing> {
        SessionBuilder::default()
    }

    pub fn sequencer(&self) -> &TrialSequencer {
        &self.sequencer
    }

    pub fn flags(&self) -> &SessionFlags {
        &self.flags
    }

    /// Run trials until `max_trials` (0 = no limit), a `.stop` flag, or one of
    /// the automatic stopping criteria when they are enabled.
    ///
    /// `on_trial` sees every completed trial. A stale `.stop` left by an
    /// earlier session is removed before the first trial.
    pub fn run(&mut self, mut on_trial: impl FnMut(&TrialRecord)) -> Result<StopReason> {
        if self.flags.clear_stop().map_err(RigError::from)? {
            tracing::warn!(path = %self.flags.stop_path().display(), "removed stale stop flag");
        }
        let started = self.clock.now();
        self.send_spacer()?;
        let reason = loop {
            if self.max_trials > 0 && self.sequencer.trials().len() >= self.max_trials {
                break StopReason::MaxTrials;
            }
            let record = self.run_trial()?;
            on_trial(&record);
            self.wait_while_paused();
            if self.flags.stop_requested() {
                self.flags.clear_stop().map_err(RigError::from)?;
                tracing::info!(trial_num = record.trial_num, "stop flag found; ending session");
                break StopReason::StopFlag;
            }
            if let Some(reason) = self.check_stop_criteria(started) {
                tracing::warn!(
                    trial_num = record.trial_num,
                    reason = ?reason,
                    elapsed_ms = self.clock.ms_since(started),
                    "automatic stopping criterion met; ending session"
                );
                break reason;
            }
        };
        self.stop_reason = Some(reason);
        Ok(reason)
    }

    /// Send the spacer machine that marks the session start on the sync line.
    pub fn send_spacer(&mut self) -> Result<()> {
        let Some(spacer) = self.spacer else {
            return Ok(());
        };
        let sm = spacer.state_machine(&self.wiring.sync_channel, EXIT_STATE);
        self.runtime
            .run(&sm)
            .map_err(|e| RigError::Collaborator(format!("spacer run: {e}")))?;
        tracing::info!(
            pulses = spacer.pulse_times().len(),
            channel = %self.wiring.sync_channel,
            "spacer sent"
        );
        Ok(())
    }

    /// Draw, run and book one trial.
    pub fn run_trial(&mut self) -> Result<TrialRecord> {
        let record = self.sequencer.next_trial()?.clone();
        let builder = TrialStateMachineBuilder::new(
            &self.timings,
            &self.wiring,
            &*self.encoder,
            &*self.sound,
            &self.valve,
        );
        let reward_time = builder.reward_open_time(&record)?;
        let sm = builder.build(&record, TrialEnv::for_record(&record))?;
        self.sequencer.set_reward_valve_time(reward_time);

        if let Some(sink) = self.sink.as_mut() {
            sink.send(&record.trial_info()).map_err(|e| {
                RigError::Collaborator(format!("trial info for trial {}: {e}", record.trial_num))
            })?;
        }
        let raw = self.runtime.run(&sm).map_err(|e| {
            RigError::Collaborator(format!("state machine run for trial {}: {e}", record.trial_num))
        })?;
        let done = self.sequencer.trial_completed(&raw)?.clone();

        tracing::info!(
            trial_num = done.trial_num,
            block_num = done.block_num,
            contrast = done.signed_contrast(),
            position = done.position,
            outcome = ?done.outcome,
            response_time = done.response_time,
            training_phase = done.training_phase,
            ntrials_correct = self.sequencer.ntrials_correct(),
            water_delivered_ul = self.sequencer.water_delivered_ul(),
            "trial completed"
        );
        Ok(done)
    }

    fn check_stop_criteria(&self, started: Instant) -> Option<StopReason> {
        let criteria = self.stop_criteria?;
        let trials = self.sequencer.trials();
        let response_times: Vec<f64> = trials.iter().filter_map(|t| t.response_time).collect();
        criteria.check(
            self.clock.now().saturating_duration_since(started),
            trials.len(),
            &response_times,
        )
    }

    fn wait_while_paused(&self) {
        if !self.flags.paused() {
            return;
        }
        tracing::info!(path = %self.flags.pause_path().display(), "session paused");
        let start = self.clock.now();
        while self.flags.paused() {
            self.clock.sleep(self.poll_interval);
        }
        tracing::info!(paused_ms = self.clock.ms_since(start), "session resumed");
    }

    /// Close the session and hand back what should be persisted.
    pub fn finish(self) -> SessionReport {
        let summary = self.sequencer.summary(self.subject_weight_g);
        let training_state = self.sequencer.into_training_state(self.subject_weight_g);
        tracing::info!(
            ntrials = summary.ntrials,
            ntrials_correct = summary.ntrials_correct,
            water_delivered_ul = summary.water_delivered_ul,
            "session finished"
        );
        SessionReport {
            summary,
            stop_reason: self.stop_reason,
            training_state,
        }
    }
}
