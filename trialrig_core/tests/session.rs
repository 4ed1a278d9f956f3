use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use trialrig_core::config::{AdaptiveCfg, BlockCfg, SamplerCfg, TrainingCfg};
use trialrig_core::mocks::{FixedEncoder, FixedSound, FixedValve, RecordingSink, ScriptedRuntime};
use trialrig_core::{
    AdaptiveTrainingController, BuildError, Outcome, RigError, Session, SessionFlags,
    StopCriteria, StopReason, TrainingState, TrialSequencer, Valve, ValveCalibration,
};
use trialrig_traits::{ManualClock, RawTrialData};

fn valve() -> Valve {
    let cal = ValveCalibration::new(vec![50.0, 100.0, 150.0, 200.0], vec![4.0, 9.0, 14.0, 19.0])
        .unwrap();
    Valve::new(cal, FixedValve)
}

fn biased() -> TrialSequencer {
    TrialSequencer::biased(
        SamplerCfg::default(),
        BlockCfg::default(),
        StdRng::seed_from_u64(21),
    )
    .unwrap()
}

fn session(
    dir: &std::path::Path,
    runtime: ScriptedRuntime,
    seq: TrialSequencer,
    max_trials: usize,
) -> Session {
    Session::builder()
        .with_runtime(runtime)
        .with_encoder(FixedEncoder::default())
        .with_sound(FixedSound)
        .with_valve(valve())
        .with_sequencer(seq)
        .with_session_dir(dir)
        .with_clock(ManualClock::new())
        .with_max_trials(max_trials)
        .build()
        .unwrap()
}

#[test]
fn runs_spacer_then_trials_up_to_the_limit() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = ScriptedRuntime::new([Outcome::Correct, Outcome::Error, Outcome::NoGo]);
    let machines = runtime.machines();
    let sink = RecordingSink::default();
    let mut s = Session::builder()
        .with_runtime(runtime)
        .with_encoder(FixedEncoder::default())
        .with_sound(FixedSound)
        .with_sink(sink.clone())
        .with_valve(valve())
        .with_sequencer(biased())
        .with_session_dir(dir.path())
        .with_max_trials(5)
        .build()
        .unwrap();

    let mut seen = Vec::new();
    let reason = s.run(|t| seen.push(t.outcome)).unwrap();
    assert_eq!(reason, StopReason::MaxTrials);
    assert_eq!(
        seen,
        vec![
            Some(Outcome::Correct),
            Some(Outcome::Error),
            Some(Outcome::NoGo),
            Some(Outcome::Correct),
            Some(Outcome::Correct),
        ]
    );

    let machines = machines.lock().unwrap();
    assert_eq!(machines.len(), 6);
    assert_eq!(machines[0].first().unwrap().name, "spacer_high_00");
    assert!(machines[1].state("delay_initiation").is_some());
    assert!(machines[2].state("delay_initiation").is_none());

    let sent = sink.sent();
    assert_eq!(sent.len(), 5);
    assert_eq!(
        sent.iter().map(|i| i.trial_num).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4]
    );

    let report = s.finish();
    assert_eq!(report.summary.ntrials, 5);
    assert_eq!(report.summary.ntrials_correct, 3);
    assert_eq!(report.stop_reason, Some(StopReason::MaxTrials));
    assert!(report.training_state.is_none());
}

#[test]
fn reward_valve_time_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = session(dir.path(), ScriptedRuntime::default(), biased(), 1);
    let rec = s.run_trial().unwrap();
    // 1.5 uL on volume = 0.1 t - 1
    assert!((rec.reward_valve_time_s - 0.025).abs() < 1e-6);
}

#[test]
fn stale_stop_is_cleared_and_new_stop_ends_session() {
    let dir = tempfile::tempdir().unwrap();
    let flags = SessionFlags::new(dir.path());
    flags.request_stop().unwrap();

    let mut s = session(dir.path(), ScriptedRuntime::default(), biased(), 0);
    let mut n = 0;
    let reason = s
        .run(|t| {
            n += 1;
            if t.trial_num == 2 {
                flags.request_stop().unwrap();
            }
        })
        .unwrap();
    assert_eq!(reason, StopReason::StopFlag);
    assert_eq!(n, 3);
    assert!(!flags.stop_requested());
}

#[test]
fn pause_blocks_between_trials_until_cleared() {
    let dir = tempfile::tempdir().unwrap();
    let flags = SessionFlags::new(dir.path());
    let pause = flags.pause_path();
    let hook_pause = pause.clone();
    let clock = ManualClock::new().with_sleep_hook(move |n| {
        if n == 3 {
            std::fs::remove_file(&hook_pause).unwrap();
        }
    });
    let handle = clock.clone();

    let mut s = Session::builder()
        .with_runtime(ScriptedRuntime::default())
        .with_encoder(FixedEncoder::default())
        .with_sound(FixedSound)
        .with_valve(valve())
        .with_sequencer(biased())
        .with_session_dir(dir.path())
        .with_clock(clock)
        .with_poll_interval(Duration::from_millis(1000))
        .with_max_trials(2)
        .build()
        .unwrap();

    let reason = s
        .run(|t| {
            if t.trial_num == 0 {
                std::fs::write(&pause, b"").unwrap();
            }
        })
        .unwrap();
    assert_eq!(reason, StopReason::MaxTrials);
    assert_eq!(handle.sleep_count(), 3);
    assert_eq!(handle.offset(), Duration::from_secs(3));
    assert_eq!(s.sequencer().trials().len(), 2);
}

#[test]
fn runtime_failure_surfaces_as_collaborator_error() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = ScriptedRuntime::new([Outcome::Correct]).then_fail("controller unplugged");
    let mut s = session(dir.path(), runtime, biased(), 0);
    let err = s.run(|_| {}).unwrap_err();
    match err.downcast_ref::<RigError>() {
        Some(RigError::Collaborator(msg)) => assert!(msg.contains("controller unplugged")),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(s.sequencer().trials().len(), 2);
}

#[test]
fn missing_terminal_branch_aborts_with_raw_payload() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = ScriptedRuntime::default().then_raw(RawTrialData::default());
    let mut s = session(dir.path(), runtime, biased(), 0);
    let err = s.run(|_| {}).unwrap_err();
    let rig = err.downcast_ref::<RigError>().unwrap();
    assert!(matches!(rig, RigError::Protocol { .. }));
    assert!(rig.raw().is_some());
}

#[test]
fn training_session_persists_state() {
    let dir = tempfile::tempdir().unwrap();
    let ctrl = AdaptiveTrainingController::new(
        TrainingCfg::default(),
        AdaptiveCfg::default(),
        TrainingState::default(),
    )
    .unwrap();
    let seq =
        TrialSequencer::training(SamplerCfg::default(), ctrl, StdRng::seed_from_u64(2)).unwrap();
    let mut s = Session::builder()
        .with_runtime(ScriptedRuntime::default())
        .with_encoder(FixedEncoder::default())
        .with_sound(FixedSound)
        .with_valve(valve())
        .with_sequencer(seq)
        .with_session_dir(dir.path())
        .with_spacer(None)
        .with_subject_weight_g(Some(22.5))
        .with_max_trials(4)
        .build()
        .unwrap();
    s.run(|_| {}).unwrap();
    let report = s.finish();
    let state = report.training_state.unwrap();
    let path = dir.path().join("training_state.toml");
    state.save(&path).unwrap();
    let back = TrainingState::load_or_default(&path).unwrap();
    let last = back.last_session.unwrap();
    assert_eq!(last.ntrials, 4);
    assert_eq!(last.subject_weight_g, Some(22.5));
}

#[test]
fn builder_reports_missing_parts() {
    let err = Session::builder().try_build().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::MissingRuntime)
    ));

    let err = Session::builder()
        .with_runtime(ScriptedRuntime::default())
        .with_encoder(FixedEncoder::default())
        .with_sound(FixedSound)
        .with_sequencer(biased())
        .build()
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::MissingValve)
    ));

    let err = Session::builder()
        .with_runtime(ScriptedRuntime::default())
        .with_encoder(FixedEncoder::default())
        .with_sound(FixedSound)
        .with_valve(valve())
        .with_sequencer(biased())
        .with_poll_interval(Duration::ZERO)
        .build()
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::InvalidConfig(_))
    ));
}

#[test]
fn spacer_can_be_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = ScriptedRuntime::default();
    let machines = runtime.machines();
    let mut s = Session::builder()
        .with_runtime(runtime)
        .with_encoder(FixedEncoder::default())
        .with_sound(FixedSound)
        .with_valve(valve())
        .with_sequencer(biased())
        .with_session_dir(dir.path())
        .with_spacer(None)
        .with_max_trials(1)
        .build()
        .unwrap();
    s.run(|_| {}).unwrap();
    assert_eq!(machines.lock().unwrap().len(), 1);
}

fn timed_session(runtime: ScriptedRuntime, clock: ManualClock, dir: &std::path::Path) -> Session {
    Session::builder()
        .with_runtime(runtime)
        .with_encoder(FixedEncoder::default())
        .with_sound(FixedSound)
        .with_valve(valve())
        .with_sequencer(biased())
        .with_session_dir(dir)
        .with_spacer(None)
        .with_clock(clock)
        .build()
        .unwrap()
}

#[test]
fn slow_session_stops_on_low_trial_rate() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new();
    let handle = clock.clone();
    let mut s = timed_session(ScriptedRuntime::default(), clock, dir.path());
    let reason = s.run(|_| handle.advance(Duration::from_secs(10 * 60))).unwrap();
    // 50 min after the fifth trial, far below 400 trials
    assert_eq!(reason, StopReason::LowTrialRate);
    assert_eq!(s.sequencer().trials().len(), 5);
    assert_eq!(s.finish().stop_reason, Some(StopReason::LowTrialRate));
}

#[test]
fn long_session_stops_after_max_duration() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new();
    let handle = clock.clone();
    let mut s = timed_session(ScriptedRuntime::default(), clock, dir.path());
    let reason = s
        .run(|t| {
            if t.trial_num == 450 {
                handle.advance(Duration::from_secs(91 * 60));
            }
        })
        .unwrap();
    assert_eq!(reason, StopReason::MaxDuration);
    assert_eq!(s.sequencer().trials().len(), 451);
}

#[test]
fn slowing_responses_stop_an_inactive_subject() {
    let dir = tempfile::tempdir().unwrap();
    // 401 quick responses, then trials that run into the response window
    let runtime =
        ScriptedRuntime::new(vec![Outcome::Correct; 401]).with_fallback(Outcome::NoGo);
    let mut s = timed_session(runtime, ManualClock::new(), dir.path());
    let reason = s.run(|_| {}).unwrap();
    assert_eq!(reason, StopReason::Inactive);
    // the recent median turns once 10 of the last 20 are no-go
    assert_eq!(s.sequencer().trials().len(), 411);
}

#[test]
fn automatic_stopping_can_be_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new();
    let handle = clock.clone();
    let mut s = Session::builder()
        .with_runtime(ScriptedRuntime::default())
        .with_encoder(FixedEncoder::default())
        .with_sound(FixedSound)
        .with_valve(valve())
        .with_sequencer(biased())
        .with_session_dir(dir.path())
        .with_spacer(None)
        .with_clock(clock)
        .with_automatic_stopping(false)
        .with_max_trials(6)
        .build()
        .unwrap();
    let reason = s.run(|_| handle.advance(Duration::from_secs(60 * 60))).unwrap();
    assert_eq!(reason, StopReason::MaxTrials);
}

#[test]
fn stop_criteria_follow_rule_order() {
    let c = StopCriteria::default();
    let min = |m: u64| Duration::from_secs(m * 60);
    assert_eq!(c.check(min(44), 10, &[]), None);
    assert_eq!(c.check(min(45), 400, &[]), Some(StopReason::LowTrialRate));
    assert_eq!(c.check(min(45), 401, &[]), None);
    assert_eq!(c.check(min(91), 10, &[]), Some(StopReason::LowTrialRate));
    assert_eq!(c.check(min(91), 401, &[]), Some(StopReason::MaxDuration));

    let mut rts = vec![0.5; 400];
    rts.extend([3.0; 20]);
    assert_eq!(c.check(min(10), 420, &rts), Some(StopReason::Inactive));
    // inactivity needs more than 400 trials
    assert_eq!(c.check(min(10), 400, &rts[20..]), None);
    rts.truncate(405);
    assert_eq!(c.check(min(10), 405, &rts), None);
}

#[test]
fn invalid_inactivity_factor_is_rejected() {
    let err = Session::builder()
        .with_runtime(ScriptedRuntime::default())
        .with_encoder(FixedEncoder::default())
        .with_sound(FixedSound)
        .with_valve(valve())
        .with_sequencer(biased())
        .with_stop_criteria(Some(StopCriteria {
            inactivity_factor: f64::NAN,
            ..StopCriteria::default()
        }))
        .build()
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::InvalidConfig(_))
    ));
}
