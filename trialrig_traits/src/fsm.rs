//! Plain-data description of a per-trial finite state machine.
//!
//! A machine is an ordered list of states. Each state has a timer, a map from
//! input event to next state, and the output actions fired on entry. The
//! distinguished event [`TUP`] means the state timer expired; [`EXIT_STATE`]
//! terminates the machine.

use std::collections::BTreeMap;

pub const TUP: &str = "Tup";
pub const EXIT_STATE: &str = "exit";

/// One `(channel, value)` pair set on state entry, e.g. `("BNC1", 255)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputAction {
    pub channel: String,
    pub value: u8,
}

impl OutputAction {
    pub fn new(channel: impl Into<String>, value: u8) -> Self {
        Self {
            channel: channel.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateSpec {
    pub name: String,
    pub timer_s: f64,
    pub transitions: BTreeMap<String, String>,
    pub outputs: Vec<OutputAction>,
}

impl StateSpec {
    pub fn new(name: impl Into<String>, timer_s: f64) -> Self {
        Self {
            name: name.into(),
            timer_s,
            transitions: BTreeMap::new(),
            outputs: Vec::new(),
        }
    }

    /// Add a transition; a later call for the same event replaces the earlier one.
    pub fn on(mut self, event: impl Into<String>, next: impl Into<String>) -> Self {
        self.transitions.insert(event.into(), next.into());
        self
    }

    pub fn output(mut self, action: OutputAction) -> Self {
        self.outputs.push(action);
        self
    }

    pub fn next_state(&self, event: &str) -> Option<&str> {
        self.transitions.get(event).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateMachine {
    states: Vec<StateSpec>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_state(&mut self, state: StateSpec) {
        self.states.push(state);
    }

    pub fn states(&self) -> &[StateSpec] {
        &self.states
    }

    pub fn state(&self, name: &str) -> Option<&StateSpec> {
        self.states.iter().find(|s| s.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.states.iter().map(|s| s.name.as_str())
    }

    /// The entry state; the controller always starts with the first added state.
    pub fn first(&self) -> Option<&StateSpec> {
        self.states.first()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// `(state, event, target)` for every transition whose target is neither a
    /// declared state nor `exit`.
    pub fn dangling_transitions(&self) -> Vec<(String, String, String)> {
        let mut out = Vec::new();
        for s in &self.states {
            for (event, target) in &s.transitions {
                if target != EXIT_STATE && self.state(target).is_none() {
                    out.push((s.name.clone(), event.clone(), target.clone()));
                }
            }
        }
        out
    }
}

/// Timestamps reported by the controller after a machine ran to `exit`.
///
/// Times are seconds from machine start. Every declared state has an entry;
/// states that were never entered hold a single `[NaN, NaN]` visit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTrialData {
    pub states: BTreeMap<String, Vec<[f64; 2]>>,
    pub events: BTreeMap<String, Vec<f64>>,
}

impl RawTrialData {
    pub fn first_visit(&self, state: &str) -> Option<[f64; 2]> {
        self.states
            .get(state)?
            .iter()
            .copied()
            .find(|v| !v[0].is_nan())
    }

    pub fn visited(&self, state: &str) -> bool {
        self.first_visit(state).is_some()
    }

    pub fn visit_count(&self, state: &str) -> usize {
        self.states
            .get(state)
            .map_or(0, |v| v.iter().filter(|v| !v[0].is_nan()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dangling_transitions_ignore_exit() {
        let mut sm = StateMachine::new();
        sm.add_state(StateSpec::new("a", 0.1).on(TUP, "b"));
        sm.add_state(StateSpec::new("b", 0.1).on(TUP, EXIT_STATE).on("Port1In", "nowhere"));
        let d = sm.dangling_transitions();
        assert_eq!(
            d,
            vec![("b".to_string(), "Port1In".to_string(), "nowhere".to_string())]
        );
        assert_eq!(sm.first().map(|s| s.name.as_str()), Some("a"));
    }

    #[test]
    fn unvisited_states_are_nan_marked() {
        let mut raw = RawTrialData::default();
        raw.states.insert("error".into(), vec![[f64::NAN, f64::NAN]]);
        raw.states.insert("correct".into(), vec![[1.0, 1.5]]);
        assert!(!raw.visited("error"));
        assert!(raw.visited("correct"));
        assert!(!raw.visited("missing"));
        assert_eq!(raw.first_visit("correct"), Some([1.0, 1.5]));
    }
}
