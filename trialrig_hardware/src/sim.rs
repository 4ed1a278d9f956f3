//! Simulated state-machine runtime.
//!
//! Walks a `StateMachine` from its first state. In every state a `Behavior`
//! may propose one input event with a latency; the event wins when the state
//! listens for it and it arrives before the timer, otherwise the timer
//! expires (`Tup`). Timestamps are seconds from machine start.

use std::collections::BTreeMap;

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use trialrig_traits::{EXIT_STATE, RawTrialData, StateMachine, StateMachineRuntime, StateSpec, TUP};

use crate::error::{HwError, Result};

/// Upper bound on state transitions in one run.
pub const MAX_TRANSITIONS: usize = 100_000;

/// Source of input events for the simulated runtime.
pub trait Behavior {
    /// `(event, latency_s)` the subject or rig produces in `state`, if any.
    fn propose(&mut self, state: &StateSpec) -> Option<(String, f64)>;
}

/// Behaviour parameters of the simulated subject.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubjectParams {
    pub p_correct: f64,
    pub p_nogo: f64,
    /// Chance of moving the wheel during each quiescent wait.
    pub p_fidget: f64,
    /// Mean reaction time in the response window.
    pub reaction_s: f64,
    /// Delay before the camera reports ready on the first trial.
    pub camera_delay_s: f64,
}

impl Default for SubjectParams {
    fn default() -> Self {
        Self {
            p_correct: 0.8,
            p_nogo: 0.05,
            p_fidget: 0.1,
            reaction_s: 0.4,
            camera_delay_s: 0.1,
        }
    }
}

/// Random subject that reads its options off the transition map: it turns
/// the wheel towards the branch leading to `freeze_reward` with `p_correct`.
#[derive(Debug, Clone)]
pub struct SimulatedSubject {
    params: SubjectParams,
    rng: StdRng,
}

impl SimulatedSubject {
    pub fn new(params: SubjectParams, rng: StdRng) -> Self {
        Self { params, rng }
    }

    pub fn seeded(params: SubjectParams, seed: u64) -> Self {
        Self::new(params, StdRng::seed_from_u64(seed))
    }
}

fn event_to(state: &StateSpec, target: &str) -> Option<String> {
    state
        .transitions
        .iter()
        .find(|(e, t)| e.as_str() != TUP && t.as_str() == target)
        .map(|(e, _)| e.clone())
}

impl Behavior for SimulatedSubject {
    fn propose(&mut self, state: &StateSpec) -> Option<(String, f64)> {
        let p = self.params;
        if let (Some(reward), Some(error)) = (
            event_to(state, "freeze_reward"),
            event_to(state, "freeze_error"),
        ) {
            if self.rng.gen_bool(p.p_nogo.clamp(0.0, 1.0)) {
                return None;
            }
            let latency = p.reaction_s * self.rng.gen_range(0.5..1.5);
            let ev = if self.rng.gen_bool(p.p_correct.clamp(0.0, 1.0)) {
                reward
            } else {
                error
            };
            return Some((ev, latency));
        }
        if state.next_state(TUP).is_none() {
            let ev = state.transitions.keys().next()?.clone();
            return Some((ev, p.camera_delay_s));
        }
        if let Some(ev) = event_to(state, "reset_rotary_encoder")
            && self.rng.gen_bool(p.p_fidget.clamp(0.0, 1.0))
        {
            let latency = state.timer_s * self.rng.gen_range(0.0..1.0);
            return Some((ev, latency));
        }
        None
    }
}

/// Behaviour that never produces an event.
#[derive(Debug, Clone, Copy, Default)]
pub struct Idle;

impl Behavior for Idle {
    fn propose(&mut self, _state: &StateSpec) -> Option<(String, f64)> {
        None
    }
}

#[derive(Debug)]
pub struct SimulatedRuntime<B> {
    behavior: B,
    runs: u64,
}

impl<B: Behavior> SimulatedRuntime<B> {
    pub fn new(behavior: B) -> Self {
        Self { behavior, runs: 0 }
    }

    pub fn runs(&self) -> u64 {
        self.runs
    }

    pub fn execute(&mut self, sm: &StateMachine) -> Result<RawTrialData> {
        if let Some((state, event, target)) = sm.dangling_transitions().into_iter().next() {
            return Err(HwError::UnknownState {
                state,
                event,
                target,
            });
        }
        let mut state = sm.first().ok_or(HwError::EmptyMachine)?;
        let mut visits: BTreeMap<String, Vec<[f64; 2]>> = BTreeMap::new();
        let mut events: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut t = 0.0;

        for _ in 0..MAX_TRANSITIONS {
            let timeout = state.next_state(TUP);
            let fired = self.behavior.propose(state).and_then(|(ev, latency)| {
                let next = state.next_state(&ev)?;
                let in_time = timeout.is_none() || latency < state.timer_s;
                (in_time && latency >= 0.0).then(|| (ev, latency, next.to_string()))
            });
            let (end, next) = match (fired, timeout) {
                (Some((ev, latency, next)), _) => {
                    let at = t + latency;
                    events.entry(ev).or_default().push(at);
                    (at, next)
                }
                (None, Some(next)) => (t + state.timer_s, next.to_string()),
                (None, None) => return Err(HwError::Stuck(state.name.clone())),
            };
            tracing::trace!(state = %state.name, start = t, end, next = %next, "sim transition");
            visits.entry(state.name.clone()).or_default().push([t, end]);
            t = end;
            if next == EXIT_STATE {
                for s in sm.states() {
                    visits
                        .entry(s.name.clone())
                        .or_insert_with(|| vec![[f64::NAN, f64::NAN]]);
                }
                self.runs += 1;
                tracing::debug!(run = self.runs, duration_s = t, "sim machine exited");
                return Ok(RawTrialData {
                    states: visits,
                    events,
                });
            }
            state = sm.state(&next).ok_or_else(|| HwError::UnknownState {
                state: state.name.clone(),
                event: TUP.to_string(),
                target: next.clone(),
            })?;
        }
        Err(HwError::Runaway(MAX_TRANSITIONS))
    }
}

impl<B: Behavior> StateMachineRuntime for SimulatedRuntime<B> {
    fn run(
        &mut self,
        sm: &StateMachine,
    ) -> std::result::Result<RawTrialData, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.execute(sm)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Proposes a fixed event in every state.
    struct Always(&'static str, f64);

    impl Behavior for Always {
        fn propose(&mut self, _state: &StateSpec) -> Option<(String, f64)> {
            Some((self.0.to_string(), self.1))
        }
    }

    fn race() -> StateMachine {
        let mut sm = StateMachine::new();
        sm.add_state(StateSpec::new("wait", 1.0).on(TUP, "late").on("Port1In", "early"));
        sm.add_state(StateSpec::new("early", 0.5).on(TUP, EXIT_STATE));
        sm.add_state(StateSpec::new("late", 0.5).on(TUP, EXIT_STATE));
        sm
    }

    #[test]
    fn event_before_timer_wins() {
        let raw = SimulatedRuntime::new(Always("Port1In", 0.3))
            .execute(&race())
            .unwrap();
        assert_eq!(raw.first_visit("wait"), Some([0.0, 0.3]));
        assert!(raw.visited("early"));
        assert!(!raw.visited("late"));
        assert_eq!(raw.events["Port1In"], vec![0.3]);
    }

    #[test]
    fn timer_wins_over_late_event() {
        let raw = SimulatedRuntime::new(Always("Port1In", 1.5))
            .execute(&race())
            .unwrap();
        assert!(raw.visited("late"));
        assert!(!raw.visited("early"));
        assert!(raw.first_visit("early").is_none());
        assert!(raw.states["early"][0][0].is_nan());
        assert!(raw.events.is_empty());
    }

    #[test]
    fn unlisted_event_is_ignored() {
        let raw = SimulatedRuntime::new(Always("BNC1High", 0.1))
            .execute(&race())
            .unwrap();
        assert_eq!(raw.first_visit("late"), Some([1.0, 1.5]));
    }

    #[test]
    fn dangling_target_is_rejected() {
        let mut sm = StateMachine::new();
        sm.add_state(StateSpec::new("a", 0.1).on(TUP, "b"));
        assert!(matches!(
            SimulatedRuntime::new(Idle).execute(&sm),
            Err(HwError::UnknownState { .. })
        ));
        assert!(matches!(
            SimulatedRuntime::new(Idle).execute(&StateMachine::new()),
            Err(HwError::EmptyMachine)
        ));
    }

    #[test]
    fn waiting_state_without_event_is_stuck() {
        let mut sm = StateMachine::new();
        sm.add_state(StateSpec::new("camera", 0.0).on("Port1In", EXIT_STATE));
        assert!(matches!(
            SimulatedRuntime::new(Idle).execute(&sm),
            Err(HwError::Stuck(_))
        ));
    }

    #[test]
    fn self_loop_without_exit_runs_away() {
        let mut sm = StateMachine::new();
        sm.add_state(StateSpec::new("a", 0.0).on(TUP, "a"));
        assert!(matches!(
            SimulatedRuntime::new(Idle).execute(&sm),
            Err(HwError::Runaway(_))
        ));
    }
}
