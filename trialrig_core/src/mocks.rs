//! Test doubles for driving the engine without a controller.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use trialrig_traits::{
    EXIT_STATE, OutputAction, RawTrialData, RewardValve, RotaryEncoder, SoundCard, SoundCue,
    StateMachine, StateMachineRuntime, StateSpec, StimCommand, TUP, TrialInfo, TrialInfoSink,
};

use crate::trial::Outcome;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Encoder with a fixed set of armed thresholds; events are named `wheel_<deg>`.
#[derive(Debug, Clone)]
pub struct FixedEncoder {
    pub thresholds: Vec<i32>,
}

impl Default for FixedEncoder {
    fn default() -> Self {
        Self {
            thresholds: vec![-35, 35, -2, 2],
        }
    }
}

impl RotaryEncoder for FixedEncoder {
    fn reset_action(&self) -> OutputAction {
        OutputAction::new("Encoder", 0)
    }

    fn stim_action(&self, cmd: StimCommand) -> OutputAction {
        let code = match cmd {
            StimCommand::Show => 1,
            StimCommand::Hide => 2,
            StimCommand::ClosedLoop => 3,
            StimCommand::Freeze => 4,
        };
        OutputAction::new("Encoder", code)
    }

    fn threshold_event(&self, threshold_deg: i32) -> Option<String> {
        self.thresholds
            .contains(&threshold_deg)
            .then(|| format!("wheel_{threshold_deg}"))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FixedSound;

impl SoundCard for FixedSound {
    fn cue_action(&self, cue: SoundCue) -> OutputAction {
        let code = match cue {
            SoundCue::Stop => 0,
            SoundCue::Tone => 1,
            SoundCue::Noise => 2,
        };
        OutputAction::new("Sound", code)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FixedValve;

impl RewardValve for FixedValve {
    fn open_action(&self) -> OutputAction {
        OutputAction::new("Valve", 255)
    }
}

fn choose(state: &StateSpec, outcome: Outcome) -> Option<(&str, &str)> {
    let by_target = |target: &str| {
        state
            .transitions
            .iter()
            .find(|(_, t)| t.as_str() == target)
            .map(|(e, t)| (e.as_str(), t.as_str()))
    };
    if state.name == "closed_loop" {
        return match outcome {
            Outcome::Correct => by_target("freeze_reward"),
            Outcome::Error => by_target("freeze_error"),
            Outcome::NoGo => by_target("no_go"),
        };
    }
    state
        .next_state(TUP)
        .map(|t| (TUP, t))
        .or_else(|| state.transitions.iter().next().map(|(e, t)| (e.as_str(), t.as_str())))
}

/// Walk `sm` as if the subject produced `outcome`: timers run out everywhere
/// except in `closed_loop`, and a state without a timeout takes its first
/// transition. Unvisited states are reported as `[NaN, NaN]`.
pub fn raw_for_outcome(sm: &StateMachine, outcome: Outcome) -> RawTrialData {
    let mut raw = RawTrialData::default();
    for s in sm.states() {
        raw.states.insert(s.name.clone(), Vec::new());
    }
    let mut t = 0.0;
    let mut current = sm.first();
    let mut steps = 0usize;
    while let Some(state) = current {
        let dwell = if state.name == "closed_loop" && outcome != Outcome::NoGo {
            0.4
        } else {
            state.timer_s
        };
        if let Some(v) = raw.states.get_mut(&state.name) {
            v.push([t, t + dwell]);
        }
        t += dwell;
        steps += 1;
        let Some((event, next)) = choose(state, outcome) else {
            break;
        };
        if event != TUP {
            raw.events.entry(event.to_string()).or_default().push(t);
        }
        if next == EXIT_STATE || steps > 10_000 {
            break;
        }
        current = sm.state(next);
    }
    for v in raw.states.values_mut() {
        if v.is_empty() {
            v.push([f64::NAN, f64::NAN]);
        }
    }
    raw
}

#[derive(Debug, Clone)]
enum Step {
    Outcome(Outcome),
    Raw(RawTrialData),
    Fail(String),
}

/// Runtime that plays back a script of outcomes, raw payloads or failures.
///
/// Machines without a `closed_loop` state (e.g. the spacer) do not consume a
/// script step. Once the script is exhausted every trial ends in `fallback`.
#[derive(Debug)]
pub struct ScriptedRuntime {
    script: VecDeque<Step>,
    fallback: Outcome,
    machines: Arc<Mutex<Vec<StateMachine>>>,
}

impl Default for ScriptedRuntime {
    fn default() -> Self {
        Self::new([])
    }
}

impl ScriptedRuntime {
    pub fn new(outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        Self {
            script: outcomes.into_iter().map(Step::Outcome).collect(),
            fallback: Outcome::Correct,
            machines: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_fallback(mut self, outcome: Outcome) -> Self {
        self.fallback = outcome;
        self
    }

    /// Queue a raw payload returned verbatim for the next trial.
    pub fn then_raw(mut self, raw: RawTrialData) -> Self {
        self.script.push_back(Step::Raw(raw));
        self
    }

    /// Queue a collaborator failure for the next trial.
    pub fn then_fail(mut self, message: impl Into<String>) -> Self {
        self.script.push_back(Step::Fail(message.into()));
        self
    }

    /// Every machine received so far, shared with the runtime.
    pub fn machines(&self) -> Arc<Mutex<Vec<StateMachine>>> {
        Arc::clone(&self.machines)
    }
}

impl StateMachineRuntime for ScriptedRuntime {
    fn run(&mut self, sm: &StateMachine) -> Result<RawTrialData, BoxError> {
        self.machines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sm.clone());
        if sm.state("closed_loop").is_none() {
            return Ok(raw_for_outcome(sm, self.fallback));
        }
        match self.script.pop_front() {
            Some(Step::Outcome(o)) => Ok(raw_for_outcome(sm, o)),
            Some(Step::Raw(raw)) => Ok(raw),
            Some(Step::Fail(msg)) => Err(Box::new(std::io::Error::other(msg))),
            None => Ok(raw_for_outcome(sm, self.fallback)),
        }
    }
}

/// Sink that keeps every broadcast for inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<TrialInfo>>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<TrialInfo> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TrialInfoSink for RecordingSink {
    fn send(&mut self, info: &TrialInfo) -> Result<(), BoxError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*info);
        Ok(())
    }
}
