//! Type-state builder for `Session`.
//!
//! `build()` only exists once the runtime, rotary encoder and sound card are
//! set; `try_build()` is always available and checks the rest at run time.

use std::marker::PhantomData;
use std::path::PathBuf;
use std::time::Duration;

use trialrig_traits::{
    Clock, MonotonicClock, RotaryEncoder, SoundCard, StateMachineRuntime, TrialInfoSink,
};

use crate::config::{FsmTimings, RigWiring};
use crate::error::{BuildError, Result};
use crate::sequencer::TrialSequencer;
use crate::session::{Session, SessionFlags, StopCriteria};
use crate::spacer::Spacer;
use crate::valve::Valve;

// ── Type-state markers ───────────────────────────────────────────────────────

pub struct Missing;
pub struct Set;

/// Builder for `Session`. Type parameters track runtime, encoder and sound card.
pub struct SessionBuilder<R, E, S> {
    runtime: Option<Box<dyn StateMachineRuntime>>,
    encoder: Option<Box<dyn RotaryEncoder>>,
    sound: Option<Box<dyn SoundCard>>,
    sink: Option<Box<dyn TrialInfoSink>>,
    valve: Option<Valve>,
    sequencer: Option<TrialSequencer>,
    spacer: Option<Spacer>,
    timings: FsmTimings,
    wiring: RigWiring,
    session_dir: PathBuf,
    clock: Option<Box<dyn Clock + Send + Sync>>,
    poll_interval: Duration,
    max_trials: usize,
    subject_weight_g: Option<f64>,
    stop_criteria: Option<StopCriteria>,
    _r: PhantomData<R>,
    _e: PhantomData<E>,
    _s: PhantomData<S>,
}

impl Default for SessionBuilder<Missing, Missing, Missing> {
    fn default() -> Self {
        Self {
            runtime: None,
            encoder: None,
            sound: None,
            sink: None,
            valve: None,
            sequencer: None,
            spacer: Some(Spacer::default()),
            timings: FsmTimings::default(),
            wiring: RigWiring::default(),
            session_dir: PathBuf::from("."),
            clock: None,
            poll_interval: Duration::from_secs(1),
            max_trials: 0,
            subject_weight_g: None,
            stop_criteria: Some(StopCriteria::default()),
            _r: PhantomData,
            _e: PhantomData,
            _s: PhantomData,
        }
    }
}

impl<R, E, S> SessionBuilder<R, E, S> {
    fn retag<R2, E2, S2>(self) -> SessionBuilder<R2, E2, S2> {
        SessionBuilder {
            runtime: self.runtime,
            encoder: self.encoder,
            sound: self.sound,
            sink: self.sink,
            valve: self.valve,
            sequencer: self.sequencer,
            spacer: self.spacer,
            timings: self.timings,
            wiring: self.wiring,
            session_dir: self.session_dir,
            clock: self.clock,
            poll_interval: self.poll_interval,
            max_trials: self.max_trials,
            subject_weight_g: self.subject_weight_g,
            stop_criteria: self.stop_criteria,
            _r: PhantomData,
            _e: PhantomData,
            _s: PhantomData,
        }
    }

    pub fn with_runtime(
        mut self,
        runtime: impl StateMachineRuntime + 'static,
    ) -> SessionBuilder<Set, E, S> {
        self.runtime = Some(Box::new(runtime));
        self.retag()
    }

    pub fn with_encoder(mut self, encoder: impl RotaryEncoder + 'static) -> SessionBuilder<R, Set, S> {
        self.encoder = Some(Box::new(encoder));
        self.retag()
    }

    pub fn with_sound(mut self, sound: impl SoundCard + 'static) -> SessionBuilder<R, E, Set> {
        self.sound = Some(Box::new(sound));
        self.retag()
    }

    pub fn with_sink(mut self, sink: impl TrialInfoSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn with_valve(mut self, valve: Valve) -> Self {
        self.valve = Some(valve);
        self
    }

    pub fn with_sequencer(mut self, sequencer: TrialSequencer) -> Self {
        self.sequencer = Some(sequencer);
        self
    }

    /// `None` skips the start-of-session spacer.
    pub fn with_spacer(mut self, spacer: Option<Spacer>) -> Self {
        self.spacer = spacer;
        self
    }

    pub fn with_timings(mut self, timings: FsmTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_wiring(mut self, wiring: RigWiring) -> Self {
        self.wiring = wiring;
        self
    }

    pub fn with_session_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.session_dir = dir.into();
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Some(Box::new(clock));
        self
    }

    pub fn with_poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    /// 0 runs until a stop flag.
    pub fn with_max_trials(mut self, n: usize) -> Self {
        self.max_trials = n;
        self
    }

    pub fn with_subject_weight_g(mut self, w: Option<f64>) -> Self {
        self.subject_weight_g = w;
        self
    }

    /// Toggle the default automatic stopping criteria.
    pub fn with_automatic_stopping(mut self, enabled: bool) -> Self {
        self.stop_criteria = enabled.then(StopCriteria::default);
        self
    }

    /// `None` disables automatic stopping.
    pub fn with_stop_criteria(mut self, criteria: Option<StopCriteria>) -> Self {
        self.stop_criteria = criteria;
        self
    }

    pub fn try_build(self) -> Result<Session> {
        let runtime = self
            .runtime
            .ok_or_else(|| eyre::Report::new(BuildError::MissingRuntime))?;
        let encoder = self
            .encoder
            .ok_or_else(|| eyre::Report::new(BuildError::MissingEncoder))?;
        let sound = self
            .sound
            .ok_or_else(|| eyre::Report::new(BuildError::MissingSound))?;
        let valve = self
            .valve
            .ok_or_else(|| eyre::Report::new(BuildError::MissingValve))?;
        let sequencer = self
            .sequencer
            .ok_or_else(|| eyre::Report::new(BuildError::MissingSequencer))?;

        if self.poll_interval.is_zero() {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "poll interval must be > 0",
            )));
        }
        let t = &self.timings;
        let timers = [
            t.session_delay_start,
            t.stim_on,
            t.interactive_delay,
            t.tone,
            t.encoder_rearm,
            t.response_window,
            t.feedback_correct_delay,
            t.feedback_error_delay,
            t.feedback_nogo_delay,
            t.hide_stim,
            t.iti_delay,
        ];
        if timers.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "state timers must be finite and >= 0",
            )));
        }
        if let Some(c) = &self.stop_criteria
            && !(c.inactivity_factor.is_finite() && c.inactivity_factor > 0.0)
        {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "inactivity factor must be finite and > 0",
            )));
        }
        if self.wiring.sync_channel.is_empty() {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "sync channel must be set",
            )));
        }

        Ok(Session {
            runtime,
            sink: self.sink,
            encoder,
            sound,
            valve,
            sequencer,
            spacer: self.spacer,
            timings: self.timings,
            wiring: self.wiring,
            flags: SessionFlags::new(self.session_dir),
            clock: self
                .clock
                .unwrap_or_else(|| Box::new(MonotonicClock::new())),
            poll_interval: self.poll_interval,
            max_trials: self.max_trials,
            subject_weight_g: self.subject_weight_g,
            stop_criteria: self.stop_criteria,
            stop_reason: None,
        })
    }
}

impl SessionBuilder<Set, Set, Set> {
    pub fn build(self) -> Result<Session> {
        self.try_build()
    }
}
