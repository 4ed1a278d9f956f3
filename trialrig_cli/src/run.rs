//! Config mapping, collaborator assembly and the `run` session.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use trialrig_config::{Config, TaskKind};
use trialrig_core::config::{BlockCfg, FsmTimings, RigWiring, SamplerCfg};
use trialrig_core::error::{Result, RigError};
use trialrig_core::{
    AdaptiveTrainingController, Session, SessionReport, Spacer, StopReason, TrainingState,
    TrialRecord, TrialSequencer, Valve, ValveCalibration,
};
use trialrig_hardware::{
    BpodRotaryEncoder, BpodValve, OscSink, SimulatedRuntime, SimulatedSubject, SoftCodeSound,
    SubjectParams,
};

pub struct RunArgs {
    pub session_dir: PathBuf,
    pub trials: Option<usize>,
    pub seed: Option<u64>,
    pub state: Option<PathBuf>,
    pub subject_weight_g: Option<f64>,
}

/// Load every `--config` layer, validate, and report failures as configuration errors.
pub fn load_config(paths: &[PathBuf]) -> Result<Config> {
    let cfg = if paths.is_empty() {
        Config::default()
    } else {
        trialrig_config::load_layered(paths).map_err(|e| RigError::Config(format!("{e:#}")))?
    };
    cfg.validate()
        .map_err(|e| RigError::Config(format!("{e:#}")))?;
    Ok(cfg)
}

/// A CSV given on the command line wins over `[valve.calibration]`.
pub fn load_calibration(cfg: &Config, csv: Option<&Path>) -> Result<ValveCalibration> {
    if let Some(path) = csv {
        let rows = trialrig_config::load_calibration_csv(path)
            .map_err(|e| RigError::Config(format!("{e:#}")))?;
        tracing::info!(path = %path.display(), samples = rows.len(), "valve calibration loaded");
        return ValveCalibration::from_rows(&rows);
    }
    match &cfg.valve.calibration {
        Some(persisted) => {
            let cal = ValveCalibration::try_from(persisted)?;
            tracing::info!(
                samples = persisted.open_times_ms.len(),
                date = cal.date().unwrap_or("unknown"),
                "valve calibration loaded from config"
            );
            Ok(cal)
        }
        None => {
            tracing::warn!("no valve calibration; rewarded trials will fail");
            Ok(ValveCalibration::uncalibrated())
        }
    }
}

fn rng_for(seed: Option<u64>) -> StdRng {
    seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64)
}

/// Biased or training sequencer per `task.kind`. The training controller
/// resumes from `state` when the file exists.
pub fn build_sequencer(
    cfg: &Config,
    seed: Option<u64>,
    state: Option<&Path>,
) -> Result<TrialSequencer> {
    let sampler = SamplerCfg::try_from(&cfg.task)?;
    let rng = rng_for(seed);
    match cfg.task.kind {
        TaskKind::Biased => {
            TrialSequencer::biased(sampler, BlockCfg::try_from(&cfg.blocks)?, rng)
        }
        TaskKind::Training => {
            let state = match state {
                Some(p) => TrainingState::load_or_default(p)?,
                None => TrainingState::default(),
            };
            tracing::info!(
                training_phase = state.training_phase,
                reward_ul = state.adaptive_reward_ul,
                "training state"
            );
            let controller = AdaptiveTrainingController::new(
                (&cfg.training).into(),
                (&cfg.adaptive).into(),
                state,
            )?;
            TrialSequencer::training(sampler, controller, rng)
        }
    }
}

pub fn build_encoder(cfg: &Config) -> Result<BpodRotaryEncoder> {
    Ok(BpodRotaryEncoder::new(
        cfg.hardware.encoder_serial.clone(),
        cfg.hardware.encoder_thresholds.clone(),
    )?)
}

pub fn build_valve(cfg: &Config, calibration: Option<&Path>) -> Result<Valve> {
    Ok(Valve::new(
        load_calibration(cfg, calibration)?,
        BpodValve::new(cfg.valve.channel.clone()),
    ))
}

pub fn spacer(cfg: &Config) -> Result<Option<Spacer>> {
    if !cfg.spacer.enabled {
        return Ok(None);
    }
    Spacer::try_from(&cfg.spacer).map(Some)
}

fn subject_params(cfg: &Config) -> SubjectParams {
    let s = &cfg.simulation;
    SubjectParams {
        p_correct: s.p_correct,
        p_nogo: s.p_nogo,
        p_fidget: s.p_fidget,
        reaction_s: s.reaction_s,
        camera_delay_s: s.camera_delay_s,
    }
}

/// Assemble a session from config and CLI overrides.
pub fn build_session(cfg: &Config, calibration: Option<&Path>, args: &RunArgs) -> Result<Session> {
    let seed = args.seed.or(cfg.session.seed);
    let sequencer = build_sequencer(cfg, seed, args.state.as_deref())?;
    let subject = SimulatedSubject::new(
        subject_params(cfg),
        rng_for(seed.map(|s| s.wrapping_add(1))),
    );

    let mut builder = Session::builder()
        .with_runtime(SimulatedRuntime::new(subject))
        .with_encoder(build_encoder(cfg)?)
        .with_sound(SoftCodeSound)
        .with_valve(build_valve(cfg, calibration)?)
        .with_sequencer(sequencer)
        .with_spacer(spacer(cfg)?)
        .with_timings(FsmTimings::from(&cfg.task))
        .with_wiring(RigWiring::from(&cfg.hardware))
        .with_session_dir(args.session_dir.clone())
        .with_poll_interval(Duration::from_millis(cfg.session.poll_interval_ms))
        .with_max_trials(args.trials.unwrap_or(cfg.session.max_trials))
        .with_automatic_stopping(cfg.session.automatic_stopping)
        .with_subject_weight_g(args.subject_weight_g.or(cfg.session.subject_weight_g));
    if let Some(addr) = cfg.hardware.renderer_addr.as_deref() {
        let sink = OscSink::connect(addr)?;
        tracing::info!(target = %sink.target(), "broadcasting trial info");
        builder = builder.with_sink(sink);
    }
    builder.build()
}

fn print_trial(rec: &TrialRecord, json: bool) {
    if json {
        match serde_json::to_string(rec) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, trial_num = rec.trial_num, "trial not serializable"),
        }
        return;
    }
    let outcome = rec
        .outcome
        .map_or_else(|| "-".to_string(), |o| o.to_string());
    let rt = rec
        .response_time
        .map_or_else(|| "-".to_string(), |t| format!("{t:.3}s"));
    println!(
        "trial {:>4}  contrast {:+.4}  {:<7}  rt {:>7}  reward {:.2} uL",
        rec.trial_num,
        rec.signed_contrast(),
        outcome,
        rt,
        rec.reward_amount_ul
    );
}

/// Run the session, then persist the training state when `--state` was given.
pub fn run_session(
    cfg: &Config,
    calibration: Option<&Path>,
    args: &RunArgs,
    json: bool,
) -> Result<SessionReport> {
    let mut session = build_session(cfg, calibration, args)?;

    let flags = session.flags().clone();
    ctrlc::set_handler(move || {
        tracing::warn!("interrupt received; stopping after the current trial");
        if let Err(e) = flags.request_stop() {
            tracing::error!(error = %e, "could not create stop flag");
        }
    })
    .map_err(|e| RigError::Collaborator(format!("install signal handler: {e}")))?;

    let reason = session.run(|rec| print_trial(rec, json))?;
    let report = session.finish();

    if let (Some(path), Some(state)) = (args.state.as_deref(), report.training_state.as_ref()) {
        state.save(path)?;
        tracing::info!(path = %path.display(), phase = state.training_phase, "training state saved");
    }

    let s = &report.summary;
    if json {
        println!(
            "{}",
            serde_json::json!({
                "summary": s,
                "stop_reason": reason,
            })
        );
    } else {
        let why = match reason {
            StopReason::MaxTrials => "trial limit reached",
            StopReason::StopFlag => "stop requested",
            StopReason::LowTrialRate => "too few trials in the first 45 min",
            StopReason::Inactive => "subject seems inactive",
            StopReason::MaxDuration => "more than 90 min since session start",
        };
        println!(
            "session complete ({why}): {} trials, {} correct, {:.1} uL delivered",
            s.ntrials, s.ntrials_correct, s.water_delivered_ul
        );
    }
    Ok(report)
}
