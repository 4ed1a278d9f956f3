#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod cli;
mod error_fmt;
mod logging;
mod run;

use clap::Parser;
use eyre::WrapErr;
use serde_json::json;
use trialrig_config::Config;
use trialrig_core::config::{FsmTimings, RigWiring};
use trialrig_core::error::Result;
use trialrig_core::{TrialEnv, TrialStateMachineBuilder};
use trialrig_hardware::SoftCodeSound;
use trialrig_traits::StateMachine;

use crate::cli::{Cli, Commands, JSON_MODE};
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};
use crate::run::RunArgs;

fn main() {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);
    if let Err(e) = real_main(cli) {
        tracing::error!(error = %e, "trialrig failed");
        if JSON_MODE.get().copied().unwrap_or(false) {
            eprintln!("{}", format_error_json(&e));
        } else {
            eprintln!("{}", humanize(&e));
        }
        std::process::exit(exit_code_for_error(&e));
    }
}

fn real_main(cli: Cli) -> Result<()> {
    color_eyre::install()?;
    let cfg = run::load_config(&cli.config)?;
    let level = cli
        .log_level
        .clone()
        .or_else(|| cfg.logging.level.clone())
        .unwrap_or_else(|| "info".to_string());
    logging::init(cli.json, &level, &cfg.logging).wrap_err("logging setup")?;

    let calibration = cli.calibration.as_deref();
    match cli.cmd {
        Commands::Run {
            session_dir,
            trials,
            seed,
            state,
            subject_weight_g,
        } => {
            let args = RunArgs {
                session_dir,
                trials,
                seed,
                state,
                subject_weight_g,
            };
            run::run_session(&cfg, calibration, &args, cli.json)?;
        }
        Commands::Spacer { template, fs } => print_spacer(&cfg, template, fs, cli.json)?,
        Commands::Valve { ul, ms } => convert_valve(&cfg, calibration, ul, ms, cli.json)?,
        Commands::CheckConfig => check_config(&cfg, calibration, cli.json)?,
        Commands::Fsm { seed } => print_fsm(&cfg, calibration, seed, cli.json)?,
    }
    Ok(())
}

fn print_spacer(cfg: &Config, template: bool, fs: f64, json: bool) -> Result<()> {
    let spacer = trialrig_core::Spacer::try_from(&cfg.spacer)?;
    if template {
        if !(fs.is_finite() && fs > 0.0) {
            eyre::bail!("--fs must be > 0");
        }
        let samples = spacer.generate_template(fs);
        if json {
            println!("{}", json!({ "fs": fs, "template": samples }));
        } else {
            for v in samples {
                println!("{v}");
            }
        }
        return Ok(());
    }
    let times = spacer.pulse_times();
    if json {
        println!("{}", json!({ "tup": spacer.tup(), "pulse_times": times }));
    } else {
        for t in times {
            println!("{t:.4}");
        }
    }
    Ok(())
}

fn convert_valve(
    cfg: &Config,
    calibration: Option<&std::path::Path>,
    ul: Option<f64>,
    ms: Option<f64>,
    json: bool,
) -> Result<()> {
    let cal = run::load_calibration(cfg, calibration)?;
    let (volume_ul, open_time_ms) = match (ul, ms) {
        (Some(ul), _) => (ul, cal.ul2ms(ul)?),
        (None, Some(ms)) => (cal.ms2ul(ms)?, ms),
        (None, None) => eyre::bail!("pass --ul or --ms"),
    };
    if json {
        println!(
            "{}",
            json!({
                "volume_ul": volume_ul,
                "open_time_ms": open_time_ms,
                "calibration_date": cal.date(),
            })
        );
    } else {
        println!("{volume_ul:.3} uL <-> {open_time_ms:.2} ms");
    }
    Ok(())
}

fn check_config(cfg: &Config, calibration: Option<&std::path::Path>, json: bool) -> Result<()> {
    run::build_sequencer(cfg, Some(0), None)?;
    run::build_encoder(cfg)?;
    let spacer = run::spacer(cfg)?;
    let valve = run::build_valve(cfg, calibration)?;
    let calibrated = valve.calibration().is_calibrated();
    if json {
        println!(
            "{}",
            json!({
                "ok": true,
                "task": format!("{:?}", cfg.task.kind).to_lowercase(),
                "spacer": spacer.is_some(),
                "valve_calibrated": calibrated,
            })
        );
    } else {
        println!(
            "configuration OK (task: {:?}, spacer: {}, valve calibrated: {calibrated})",
            cfg.task.kind,
            if spacer.is_some() { "on" } else { "off" },
        );
    }
    Ok(())
}

fn print_fsm(
    cfg: &Config,
    calibration: Option<&std::path::Path>,
    seed: Option<u64>,
    json: bool,
) -> Result<()> {
    let mut sequencer = run::build_sequencer(cfg, seed.or(cfg.session.seed), None)?;
    let record = sequencer.next_trial()?.clone();
    let encoder = run::build_encoder(cfg)?;
    let sound = SoftCodeSound;
    let valve = run::build_valve(cfg, calibration)?;
    let timings = FsmTimings::from(&cfg.task);
    let wiring = RigWiring::from(&cfg.hardware);
    let builder = TrialStateMachineBuilder::new(&timings, &wiring, &encoder, &sound, &valve);
    let sm = builder.build(&record, TrialEnv::for_record(&record))?;
    if json {
        println!("{}", fsm_json(&sm));
    } else {
        print_fsm_text(&sm);
    }
    Ok(())
}

fn fsm_json(sm: &StateMachine) -> serde_json::Value {
    let states: Vec<_> = sm
        .states()
        .iter()
        .map(|s| {
            json!({
                "name": s.name,
                "timer_s": s.timer_s,
                "transitions": s.transitions,
                "outputs": s.outputs.iter().map(|o| json!([o.channel, o.value])).collect::<Vec<_>>(),
            })
        })
        .collect();
    json!({ "states": states })
}

fn print_fsm_text(sm: &StateMachine) {
    for s in sm.states() {
        let transitions: Vec<String> = s
            .transitions
            .iter()
            .map(|(e, t)| format!("{e}->{t}"))
            .collect();
        let outputs: Vec<String> = s
            .outputs
            .iter()
            .map(|o| format!("{}={}", o.channel, o.value))
            .collect();
        println!(
            "{:<22} {:>8.3}s  [{}]  {{{}}}",
            s.name,
            s.timer_s,
            transitions.join(", "),
            outputs.join(", ")
        );
    }
}
