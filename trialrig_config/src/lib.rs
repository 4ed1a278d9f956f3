#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas and valve-calibration parsing for the trial engine.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - Several TOML files can be layered; later files override earlier ones key by key.
//! - Calibration CSV loader enforces headers; fitting happens in the core crate.
use serde::Deserialize;
use std::path::Path;

/// Calibration CSV schema.
///
/// Expected headers:
/// open_time_ms,volume_ul
///
/// Example:
/// open_time_ms,volume_ul
/// 50,4.0
/// 100,9.0
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct CalibrationRow {
    pub open_time_ms: f64,
    pub volume_ul: f64,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Graduated curriculum with debiasing and adaptive reward/gain
    #[default]
    Training,
    /// Probability-left blocks over a fixed contrast set
    Biased,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProbabilityType {
    #[default]
    Uniform,
    /// One designated contrast gets a fraction of the mass of the others
    #[serde(alias = "skew_zero")]
    Biased,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DebiasWindow {
    /// Last 10 trials, no-go included
    #[default]
    Last10,
    /// Every trial of the session
    Full,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionCfg {
    pub subject: String,
    /// RNG seed; entropy-seeded when absent
    pub seed: Option<u64>,
    /// Stop after this many trials (0 = run until stopped)
    pub max_trials: usize,
    /// Pause-flag polling cadence between trials
    pub poll_interval_ms: u64,
    /// Body weight used by the adaptive reward rule at the next session
    pub subject_weight_g: Option<f64>,
    /// End the session on low trial rate, inactivity or overlong duration
    pub automatic_stopping: bool,
}

impl Default for SessionCfg {
    fn default() -> Self {
        Self {
            subject: "subject".to_string(),
            seed: None,
            max_trials: 0,
            poll_interval_ms: 1000,
            subject_weight_g: None,
            automatic_stopping: true,
        }
    }
}

/// Truncated exponential `min <= x <= max`, x ~ Exp(mean = scale).
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct TruncExpCfg {
    pub scale: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for TruncExpCfg {
    fn default() -> Self {
        Self {
            scale: 0.35,
            min: 0.2,
            max: 0.5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TaskCfg {
    pub kind: TaskKind,
    pub stim_positions: Vec<i32>,
    /// Signed contrasts available to the training curriculum
    pub contrasts: Vec<f64>,
    /// Unsigned contrasts drawn by the biased task
    pub contrast_set: Vec<f64>,
    pub contrast_set_probability_type: ProbabilityType,
    /// Designated contrast for the biased probability type; negative counts from the end
    pub probability_index: i32,
    pub probability_weight: f64,
    pub quiescent_period: f64,
    pub quiescent_extra: TruncExpCfg,
    pub response_window: f64,
    pub interactive_delay: f64,
    pub session_delay_start: f64,
    pub feedback_correct_delay: f64,
    pub feedback_error_delay: f64,
    pub feedback_nogo_delay: f64,
    pub iti_delay: f64,
    pub stim_gain: f64,
    pub stim_sigma: f64,
    pub stim_angle: f64,
    pub stim_freq: f64,
    pub stim_reverse: bool,
    /// Reward for the biased task; the training task uses the adaptive amount
    pub reward_amount_ul: f64,
}

impl Default for TaskCfg {
    fn default() -> Self {
        Self {
            kind: TaskKind::Training,
            stim_positions: vec![-35, 35],
            contrasts: vec![
                -1.0, -0.5, -0.25, -0.125, -0.0625, 0.0, 0.0625, 0.125, 0.25, 0.5, 1.0,
            ],
            contrast_set: vec![1.0, 0.25, 0.125, 0.0625, 0.0],
            contrast_set_probability_type: ProbabilityType::Uniform,
            probability_index: -1,
            probability_weight: 0.5,
            quiescent_period: 0.2,
            quiescent_extra: TruncExpCfg::default(),
            response_window: 60.0,
            interactive_delay: 0.0,
            session_delay_start: 0.0,
            feedback_correct_delay: 1.0,
            feedback_error_delay: 2.0,
            feedback_nogo_delay: 2.0,
            iti_delay: 0.5,
            stim_gain: 4.0,
            stim_sigma: 7.0,
            stim_angle: 0.0,
            stim_freq: 0.1,
            stim_reverse: false,
            reward_amount_ul: 1.5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BlocksCfg {
    /// First block is 50/50 with a fixed length
    pub init_5050: bool,
    pub init_5050_len: usize,
    pub probability_set: Vec<f64>,
    pub len_factor: f64,
    pub len_min: f64,
    pub len_max: f64,
}

impl Default for BlocksCfg {
    fn default() -> Self {
        Self {
            init_5050: true,
            init_5050_len: 90,
            probability_set: vec![0.2, 0.8],
            len_factor: 60.0,
            len_min: 20.0,
            len_max: 100.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrainingCfg {
    pub debias: bool,
    pub debias_window: DebiasWindow,
    /// Only errors on contrasts at or above this magnitude are repeated
    pub debias_min_contrast: f64,
    pub debias_sigma: f64,
    /// Rolling window per signed contrast for graduation
    pub perf_window: usize,
    pub perf_criterion: f64,
    /// Trials within phases 2..=4 before moving on
    pub trials_per_phase: u32,
}

impl Default for TrainingCfg {
    fn default() -> Self {
        Self {
            debias: true,
            debias_window: DebiasWindow::Last10,
            debias_min_contrast: 0.5,
            debias_sigma: 0.5,
            perf_window: 50,
            perf_criterion: 0.8,
            trials_per_phase: 200,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AdaptiveCfg {
    pub reward: bool,
    pub reward_init_ul: f64,
    pub reward_min_ul: f64,
    pub reward_max_ul: f64,
    pub reward_step_ul: f64,
    /// Previous-session trial count above which the reward is lowered
    pub reward_trials_crit: u32,
    /// Daily water requirement, mL per gram of body weight
    pub water_ml_per_g: f64,
    pub gain: bool,
    pub gain_init: f64,
    pub gain_min: f64,
    pub gain_trials_crit: u32,
}

impl Default for AdaptiveCfg {
    fn default() -> Self {
        Self {
            reward: true,
            reward_init_ul: 3.0,
            reward_min_ul: 1.5,
            reward_max_ul: 3.0,
            reward_step_ul: 0.1,
            reward_trials_crit: 200,
            water_ml_per_g: 1.0 / 25.0,
            gain: true,
            gain_init: 8.0,
            gain_min: 4.0,
            gain_trials_crit: 200,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct SpacerCfg {
    pub dt_start: f64,
    pub dt_end: f64,
    pub n_pulses: usize,
    pub tup: f64,
    /// Send the spacer sequence before the first trial
    pub enabled: bool,
}

impl Default for SpacerCfg {
    fn default() -> Self {
        Self {
            dt_start: 0.02,
            dt_end: 0.4,
            n_pulses: 8,
            tup: 0.05,
            enabled: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HardwareCfg {
    pub sync_channel: String,
    pub tone_onset_event: String,
    pub photodiode_events: Vec<String>,
    pub camera_ready_event: String,
    pub camera_trigger_softcode: u8,
    pub encoder_serial: String,
    pub encoder_thresholds: Vec<i32>,
    pub quiescence_thresholds: [i32; 2],
    /// Visual stimulus renderer (OSC over UDP)
    pub renderer_addr: Option<String>,
}

impl Default for HardwareCfg {
    fn default() -> Self {
        Self {
            sync_channel: "BNC1".to_string(),
            tone_onset_event: "BNC2High".to_string(),
            photodiode_events: vec!["BNC1High".to_string(), "BNC1Low".to_string()],
            camera_ready_event: "Port1In".to_string(),
            camera_trigger_softcode: 4,
            encoder_serial: "Serial1".to_string(),
            encoder_thresholds: vec![-35, 35, -2, 2],
            quiescence_thresholds: [-2, 2],
            renderer_addr: None,
        }
    }
}

/// Behaviour of the simulated subject used when no controller is attached.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct SimulationCfg {
    pub p_correct: f64,
    pub p_nogo: f64,
    /// Chance of a wheel twitch during each quiescent period
    pub p_fidget: f64,
    pub reaction_s: f64,
    pub camera_delay_s: f64,
}

impl Default for SimulationCfg {
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

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ValveCfg {
    pub channel: String,
    pub calibration: Option<PersistedCalibration>,
}

impl Default for ValveCfg {
    fn default() -> Self {
        Self {
            channel: "Valve1".to_string(),
            calibration: None,
        }
    }
}

/// Persisted valve calibration: the raw samples and the date they were taken.
/// The curve itself is always refitted from the samples.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PersistedCalibration {
    pub open_times_ms: Vec<f64>,
    pub volumes_ul: Vec<f64>,
    #[serde(default)]
    pub date: Option<String>,
}

impl PersistedCalibration {
    pub fn rows(&self) -> Vec<CalibrationRow> {
        self.open_times_ms
            .iter()
            .zip(&self.volumes_ul)
            .map(|(&open_time_ms, &volume_ul)| CalibrationRow {
                open_time_ms,
                volume_ul,
            })
            .collect()
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub session: SessionCfg,
    pub task: TaskCfg,
    pub blocks: BlocksCfg,
    pub training: TrainingCfg,
    pub adaptive: AdaptiveCfg,
    pub spacer: SpacerCfg,
    pub hardware: HardwareCfg,
    pub simulation: SimulationCfg,
    pub valve: ValveCfg,
    pub logging: Logging,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

/// Deep-merge `overlay` into `base`. Tables merge key by key; any other value
/// in `overlay` replaces the one in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(dst)), toml::Value::Table(src)) => merge_tables(dst, src),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Load and merge TOML files in priority order (later paths win), then
/// deserialize the result once into a `Config`.
pub fn load_layered<P: AsRef<Path>>(paths: &[P]) -> eyre::Result<Config> {
    let mut merged = toml::Table::new();
    for p in paths {
        let path = p.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("read config {:?}: {}", path, e))?;
        let layer: toml::Table =
            toml::from_str(&text).map_err(|e| eyre::eyre!("parse config {:?}: {}", path, e))?;
        merge_tables(&mut merged, layer);
    }
    toml::Value::Table(merged)
        .try_into::<Config>()
        .map_err(|e| eyre::eyre!("invalid configuration: {}", e))
}

pub fn load_calibration_csv(path: &Path) -> eyre::Result<Vec<CalibrationRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open calibration CSV {:?}: {}", path, e))?;

    // Enforce exact headers
    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let expected = ["open_time_ms", "volume_ul"];
    let actual: Vec<String> = headers.iter().map(ToString::to_string).collect();
    if actual != expected {
        eyre::bail!(
            "calibration CSV must have headers 'open_time_ms,volume_ul', got: {}",
            actual.join(",")
        );
    }

    let mut rows = Vec::new();
    for (idx, rec) in rdr.deserialize::<CalibrationRow>().enumerate() {
        match rec {
            Ok(row) => rows.push(row),
            Err(e) => {
                eyre::bail!("invalid CSV row {}: {}", idx + 2, e);
            }
        }
    }
    if rows.is_empty() {
        eyre::bail!("calibration CSV {:?} has no samples", path);
    }
    validate_calibration_rows(&rows)?;
    Ok(rows)
}

fn validate_calibration_rows(rows: &[CalibrationRow]) -> eyre::Result<()> {
    for (i, r) in rows.iter().enumerate() {
        if !(r.open_time_ms.is_finite() && r.volume_ul.is_finite()) {
            eyre::bail!("calibration sample {} is not finite", i);
        }
        if r.open_time_ms < 0.0 || r.volume_ul < 0.0 {
            eyre::bail!("calibration sample {} must be >= 0", i);
        }
    }
    Ok(())
}

fn check_non_negative(name: &str, v: f64) -> eyre::Result<()> {
    if !v.is_finite() || v < 0.0 {
        eyre::bail!("{name} must be >= 0");
    }
    Ok(())
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Session
        if self.session.poll_interval_ms == 0 {
            eyre::bail!("session.poll_interval_ms must be >= 1");
        }
        if let Some(w) = self.session.subject_weight_g
            && !(w.is_finite() && w > 0.0)
        {
            eyre::bail!("session.subject_weight_g must be > 0");
        }

        // Task
        let t = &self.task;
        if t.stim_positions.len() != 2 {
            eyre::bail!(
                "task.stim_positions must have exactly 2 entries, got {}",
                t.stim_positions.len()
            );
        }
        if t.stim_positions.contains(&0) || t.stim_positions[0] == t.stim_positions[1] {
            eyre::bail!("task.stim_positions must be two distinct non-zero positions");
        }
        if t.contrasts.is_empty() {
            eyre::bail!("task.contrasts must not be empty");
        }
        if t.contrasts.iter().any(|c| !(-1.0..=1.0).contains(c)) {
            eyre::bail!("task.contrasts must be in [-1.0, 1.0]");
        }
        if t.contrast_set.is_empty() {
            eyre::bail!("task.contrast_set must not be empty");
        }
        if t.contrast_set.iter().any(|c| !(0.0..=1.0).contains(c)) {
            eyre::bail!("task.contrast_set must be in [0.0, 1.0]");
        }
        let n = i64::try_from(t.contrast_set.len()).unwrap_or(i64::MAX);
        let idx = i64::from(t.probability_index);
        if idx >= n || idx < -n {
            eyre::bail!("task.probability_index out of range for task.contrast_set");
        }
        if !(t.probability_weight.is_finite() && t.probability_weight > 0.0) {
            eyre::bail!("task.probability_weight must be > 0");
        }
        let q = t.quiescent_extra;
        if !(q.scale.is_finite() && q.scale > 0.0) {
            eyre::bail!("task.quiescent_extra.scale must be > 0");
        }
        check_non_negative("task.quiescent_extra.min", q.min)?;
        if !(q.max.is_finite() && q.max >= q.min) {
            eyre::bail!("task.quiescent_extra.max must be >= min");
        }
        if !(t.response_window.is_finite() && t.response_window > 0.0) {
            eyre::bail!("task.response_window must be > 0");
        }
        for (name, v) in [
            ("task.quiescent_period", t.quiescent_period),
            ("task.interactive_delay", t.interactive_delay),
            ("task.session_delay_start", t.session_delay_start),
            ("task.feedback_correct_delay", t.feedback_correct_delay),
            ("task.feedback_error_delay", t.feedback_error_delay),
            ("task.feedback_nogo_delay", t.feedback_nogo_delay),
            ("task.iti_delay", t.iti_delay),
            ("task.reward_amount_ul", t.reward_amount_ul),
        ] {
            check_non_negative(name, v)?;
        }

        // Blocks
        let b = &self.blocks;
        if b.probability_set.is_empty() {
            eyre::bail!("blocks.probability_set must not be empty");
        }
        if b.probability_set.iter().any(|p| !(0.0..=1.0).contains(p)) {
            eyre::bail!("blocks.probability_set must be in [0.0, 1.0]");
        }
        if !(b.len_factor.is_finite() && b.len_factor > 0.0) {
            eyre::bail!("blocks.len_factor must be > 0");
        }
        if !(b.len_min.is_finite() && b.len_min >= 1.0) {
            eyre::bail!("blocks.len_min must be >= 1");
        }
        if !(b.len_max.is_finite() && b.len_max >= b.len_min) {
            eyre::bail!("blocks.len_max must be >= blocks.len_min");
        }
        if b.init_5050 && b.init_5050_len == 0 {
            eyre::bail!("blocks.init_5050_len must be >= 1");
        }

        // Training
        let tr = &self.training;
        if tr.perf_window == 0 {
            eyre::bail!("training.perf_window must be >= 1");
        }
        if !(tr.perf_criterion > 0.0 && tr.perf_criterion <= 1.0) {
            eyre::bail!("training.perf_criterion must be in (0.0, 1.0]");
        }
        if tr.trials_per_phase == 0 {
            eyre::bail!("training.trials_per_phase must be >= 1");
        }
        if !(tr.debias_sigma.is_finite() && tr.debias_sigma > 0.0) {
            eyre::bail!("training.debias_sigma must be > 0");
        }

        // Adaptive
        let a = &self.adaptive;
        if !(a.reward_step_ul.is_finite() && a.reward_step_ul > 0.0) {
            eyre::bail!("adaptive.reward_step_ul must be > 0");
        }
        check_non_negative("adaptive.reward_min_ul", a.reward_min_ul)?;
        if !(a.reward_max_ul.is_finite() && a.reward_max_ul >= a.reward_min_ul) {
            eyre::bail!("adaptive.reward_max_ul must be >= adaptive.reward_min_ul");
        }
        if !(a.reward_min_ul..=a.reward_max_ul).contains(&a.reward_init_ul) {
            eyre::bail!("adaptive.reward_init_ul must be within [reward_min_ul, reward_max_ul]");
        }
        if !(a.water_ml_per_g.is_finite() && a.water_ml_per_g > 0.0) {
            eyre::bail!("adaptive.water_ml_per_g must be > 0");
        }
        if !(a.gain_min.is_finite() && a.gain_min > 0.0) {
            eyre::bail!("adaptive.gain_min must be > 0");
        }
        if !(a.gain_init.is_finite() && a.gain_init > 0.0) {
            eyre::bail!("adaptive.gain_init must be > 0");
        }

        // Spacer
        let s = &self.spacer;
        if s.n_pulses == 0 {
            eyre::bail!("spacer.n_pulses must be >= 1");
        }
        if !(s.tup.is_finite() && s.tup > 0.0) {
            eyre::bail!("spacer.tup must be > 0");
        }
        check_non_negative("spacer.dt_start", s.dt_start)?;
        check_non_negative("spacer.dt_end", s.dt_end)?;

        // Hardware
        let h = &self.hardware;
        if h.sync_channel.is_empty() {
            eyre::bail!("hardware.sync_channel must not be empty");
        }
        for p in &t.stim_positions {
            if !h.encoder_thresholds.contains(p) || !h.encoder_thresholds.contains(&-p) {
                eyre::bail!("hardware.encoder_thresholds must include +/-{}", p.abs());
            }
        }
        for q in h.quiescence_thresholds {
            if !h.encoder_thresholds.contains(&q) {
                eyre::bail!("hardware.encoder_thresholds must include quiescence threshold {q}");
            }
        }

        // Simulation
        let sim = &self.simulation;
        for (name, p) in [
            ("simulation.p_correct", sim.p_correct),
            ("simulation.p_nogo", sim.p_nogo),
            ("simulation.p_fidget", sim.p_fidget),
        ] {
            if !(0.0..=1.0).contains(&p) {
                eyre::bail!("{name} must be in [0.0, 1.0]");
            }
        }
        check_non_negative("simulation.reaction_s", sim.reaction_s)?;
        check_non_negative("simulation.camera_delay_s", sim.camera_delay_s)?;

        // Valve
        if let Some(cal) = &self.valve.calibration {
            if cal.open_times_ms.len() != cal.volumes_ul.len() {
                eyre::bail!(
                    "valve.calibration has {} open times but {} volumes",
                    cal.open_times_ms.len(),
                    cal.volumes_ul.len()
                );
            }
            validate_calibration_rows(&cal.rows())?;
        }

        Ok(())
    }
}
