//! Per-trial state machine construction.
//!
//! The builder only talks to capability objects (`RotaryEncoder`,
//! `SoundCard`, `Valve`) and never to a concrete device, so the same machine
//! can be handed to the real controller or the simulated runtime.

use trialrig_traits::{
    EXIT_STATE, OutputAction, RotaryEncoder, SoundCard, SoundCue, StateMachine, StateSpec,
    StimCommand, TUP,
};

use crate::config::{FsmTimings, RigWiring};
use crate::error::{Result, RigError};
use crate::trial::TrialRecord;
use crate::valve::Valve;

/// Environment flags that change the machine's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrialEnv {
    /// Insert the camera wait and start delay before the first trial.
    pub first_trial: bool,
    /// Swap which wheel direction counts as reward and which as error.
    pub stim_reverse: bool,
}

impl TrialEnv {
    pub fn for_record(record: &TrialRecord) -> Self {
        Self {
            first_trial: record.trial_num == 0,
            stim_reverse: record.stim_reverse,
        }
    }
}

pub struct TrialStateMachineBuilder<'a> {
    timings: &'a FsmTimings,
    wiring: &'a RigWiring,
    encoder: &'a dyn RotaryEncoder,
    sound: &'a dyn SoundCard,
    valve: &'a Valve,
}

impl<'a> TrialStateMachineBuilder<'a> {
    pub fn new(
        timings: &'a FsmTimings,
        wiring: &'a RigWiring,
        encoder: &'a dyn RotaryEncoder,
        sound: &'a dyn SoundCard,
        valve: &'a Valve,
    ) -> Self {
        Self {
            timings,
            wiring,
            encoder,
            sound,
            valve,
        }
    }

    /// Valve open time (s) for the record's reward volume.
    pub fn reward_open_time(&self, record: &TrialRecord) -> Result<f64> {
        self.valve.open_time_s(record.reward_amount_ul)
    }

    fn threshold_event(&self, threshold_deg: i32) -> Result<String> {
        self.encoder.threshold_event(threshold_deg).ok_or_else(|| {
            RigError::Config(format!(
                "rotary encoder has no event armed for threshold {threshold_deg} deg"
            ))
            .into()
        })
    }

    fn sync(&self) -> OutputAction {
        OutputAction::new(&self.wiring.sync_channel, 255)
    }

    pub fn build(&self, record: &TrialRecord, env: TrialEnv) -> Result<StateMachine> {
        let t = self.timings;
        let reward_time = self.reward_open_time(record)?;
        if !(reward_time >= 0.0) {
            return Err(RigError::Domain(format!(
                "reward valve open time must be >= 0 s, got {reward_time} for {} µL",
                record.reward_amount_ul
            ))
            .into());
        }
        let correct_delay = t.feedback_correct_delay - reward_time;
        if correct_delay < 0.0 {
            return Err(RigError::Config(format!(
                "reward valve open time {reward_time:.3}s exceeds feedback_correct_delay {:.3}s",
                t.feedback_correct_delay
            ))
            .into());
        }

        let mut event_error = self.threshold_event(record.position)?;
        let mut event_reward = self.threshold_event(-record.position)?;
        if env.stim_reverse {
            std::mem::swap(&mut event_error, &mut event_reward);
        }
        let [q_left, q_right] = self.wiring.quiescence_thresholds;
        let move_left = self.threshold_event(q_left)?;
        let move_right = self.threshold_event(q_right)?;

        let mut sm = StateMachine::new();
        if env.first_trial {
            sm.add_state(
                StateSpec::new("trial_start", 0.0)
                    .on(&self.wiring.camera_ready_event, "delay_initiation")
                    .output(OutputAction::new(
                        "SoftCode",
                        self.wiring.camera_trigger_softcode,
                    ))
                    .output(self.sync()),
            );
            sm.add_state(
                StateSpec::new("delay_initiation", t.session_delay_start)
                    .on(TUP, "reset_rotary_encoder"),
            );
        } else {
            sm.add_state(
                StateSpec::new("trial_start", 0.0)
                    .on(TUP, "reset_rotary_encoder")
                    .output(self.sound.cue_action(SoundCue::Stop))
                    .output(self.sync()),
            );
        }

        sm.add_state(
            StateSpec::new("reset_rotary_encoder", 0.0)
                .on(TUP, "quiescent_period")
                .output(self.encoder.reset_action()),
        );
        // any wheel movement restarts the wait
        sm.add_state(
            StateSpec::new("quiescent_period", record.quiescent_period)
                .on(TUP, "stim_on")
                .on(move_left, "reset_rotary_encoder")
                .on(move_right, "reset_rotary_encoder"),
        );
        let mut stim_on = StateSpec::new("stim_on", t.stim_on)
            .on(TUP, "interactive_delay")
            .output(self.encoder.stim_action(StimCommand::Show));
        for ev in &self.wiring.photodiode_events {
            stim_on = stim_on.on(ev, "interactive_delay");
        }
        sm.add_state(stim_on);
        sm.add_state(StateSpec::new("interactive_delay", t.interactive_delay).on(TUP, "play_tone"));
        sm.add_state(
            StateSpec::new("play_tone", t.tone)
                .on(TUP, "reset2_rotary_encoder")
                .on(&self.wiring.tone_onset_event, "reset2_rotary_encoder")
                .output(self.sound.cue_action(SoundCue::Tone)),
        );
        sm.add_state(
            StateSpec::new("reset2_rotary_encoder", t.encoder_rearm)
                .on(TUP, "closed_loop")
                .output(self.encoder.reset_action()),
        );
        sm.add_state(
            StateSpec::new("closed_loop", t.response_window)
                .on(TUP, "no_go")
                .on(event_error, "freeze_error")
                .on(event_reward, "freeze_reward")
                .output(self.encoder.stim_action(StimCommand::ClosedLoop)),
        );
        sm.add_state(
            StateSpec::new("no_go", t.feedback_nogo_delay)
                .on(TUP, "exit_state")
                .output(self.encoder.stim_action(StimCommand::Hide))
                .output(self.sound.cue_action(SoundCue::Noise)),
        );
        sm.add_state(
            StateSpec::new("freeze_error", 0.0)
                .on(TUP, "error")
                .output(self.encoder.stim_action(StimCommand::Freeze)),
        );
        sm.add_state(
            StateSpec::new("error", t.feedback_error_delay)
                .on(TUP, "hide_stim")
                .output(self.sound.cue_action(SoundCue::Noise)),
        );
        sm.add_state(
            StateSpec::new("freeze_reward", 0.0)
                .on(TUP, "reward")
                .output(self.encoder.stim_action(StimCommand::Freeze)),
        );
        sm.add_state(
            StateSpec::new("reward", reward_time)
                .on(TUP, "correct")
                .output(self.valve.open_action())
                .output(self.sync()),
        );
        sm.add_state(StateSpec::new("correct", correct_delay).on(TUP, "hide_stim"));
        let mut hide = StateSpec::new("hide_stim", t.hide_stim)
            .on(TUP, "exit_state")
            .output(self.encoder.stim_action(StimCommand::Hide));
        for ev in &self.wiring.photodiode_events {
            hide = hide.on(ev, "exit_state");
        }
        sm.add_state(hide);
        sm.add_state(
            StateSpec::new("exit_state", t.iti_delay)
                .on(TUP, EXIT_STATE)
                .output(self.sync()),
        );
        Ok(sm)
    }
}
