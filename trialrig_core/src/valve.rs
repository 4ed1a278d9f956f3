//! Reward valve calibration: open time (ms) to delivered volume (µL).
//!
//! The curve is `volume = a + b·t + c·t²`, fitted by least squares under
//! `b >= 0, c >= 0` so that it stays monotonic over the calibrated range.
//! Only the raw samples are persisted; the coefficients are refitted on load.

use trialrig_config::CalibrationRow;
use trialrig_traits::{OutputAction, RewardValve};

use crate::error::{Result, RigError};

/// Samples required before the curve is considered calibrated.
pub const MIN_SAMPLES: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct ValveCalibration {
    open_times_ms: Vec<f64>,
    volumes_ul: Vec<f64>,
    /// `[a, b, c]`; NaN when uncalibrated.
    coeffs: [f64; 3],
    date: Option<String>,
}

impl Default for ValveCalibration {
    fn default() -> Self {
        Self::uncalibrated()
    }
}

impl ValveCalibration {
    pub fn uncalibrated() -> Self {
        Self {
            open_times_ms: Vec::new(),
            volumes_ul: Vec::new(),
            coeffs: [f64::NAN; 3],
            date: None,
        }
    }

    pub fn new(open_times_ms: Vec<f64>, volumes_ul: Vec<f64>) -> Result<Self> {
        if open_times_ms.len() != volumes_ul.len() {
            return Err(RigError::Config(format!(
                "valve calibration has {} open times but {} volumes",
                open_times_ms.len(),
                volumes_ul.len()
            ))
            .into());
        }
        for (i, (t, v)) in open_times_ms.iter().zip(&volumes_ul).enumerate() {
            if !(t.is_finite() && v.is_finite() && *t >= 0.0 && *v >= 0.0) {
                return Err(RigError::Config(format!(
                    "valve calibration sample {i} must be finite and >= 0, got ({t}, {v})"
                ))
                .into());
            }
        }
        let coeffs = if open_times_ms.len() < MIN_SAMPLES {
            [f64::NAN; 3]
        } else {
            fit_monotonic_quadratic(&open_times_ms, &volumes_ul)?
        };
        Ok(Self {
            open_times_ms,
            volumes_ul,
            coeffs,
            date: None,
        })
    }

    pub fn from_rows(rows: &[CalibrationRow]) -> Result<Self> {
        let (t, v) = rows.iter().map(|r| (r.open_time_ms, r.volume_ul)).unzip();
        Self::new(t, v)
    }

    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }

    pub fn date(&self) -> Option<&str> {
        self.date.as_deref()
    }

    pub fn is_calibrated(&self) -> bool {
        self.coeffs.iter().all(|c| c.is_finite())
    }

    pub fn coefficients(&self) -> [f64; 3] {
        self.coeffs
    }

    pub fn samples(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.open_times_ms
            .iter()
            .copied()
            .zip(self.volumes_ul.iter().copied())
    }

    /// Volume delivered for an opening of `open_time_ms`. NaN when uncalibrated.
    pub fn ms2ul(&self, open_time_ms: f64) -> Result<f64> {
        if !(open_time_ms >= 0.0) {
            return Err(RigError::Domain(format!(
                "valve open time must be >= 0 ms, got {open_time_ms}"
            ))
            .into());
        }
        let [a, b, c] = self.coeffs;
        Ok(a + b * open_time_ms + c * open_time_ms * open_time_ms)
    }

    /// Opening time delivering `volume_ul`: the largest real root of
    /// `a + b·t + c·t² = volume_ul`.
    pub fn ul2ms(&self, volume_ul: f64) -> Result<f64> {
        if !(volume_ul > 0.0) {
            return Err(
                RigError::Domain(format!("volume must be > 0 µL, got {volume_ul}")).into(),
            );
        }
        if !self.is_calibrated() {
            return Err(RigError::Config(format!(
                "valve is not calibrated (need at least {MIN_SAMPLES} samples, have {})",
                self.open_times_ms.len()
            ))
            .into());
        }
        let [a, b, c] = self.coeffs;
        let root = largest_real_root(c, b, a - volume_ul).ok_or_else(|| {
            RigError::Domain(format!(
                "volume {volume_ul} µL is not reachable by the calibration curve"
            ))
        })?;
        // Below the fitted intercept the curve only reaches the volume at t < 0.
        if root < 0.0 {
            return Err(RigError::Domain(format!(
                "volume {volume_ul} µL is below the calibration intercept {a:.3} µL"
            ))
            .into());
        }
        Ok(root)
    }
}

/// Largest real root of `c·t² + b·t + k = 0`, if any.
fn largest_real_root(c: f64, b: f64, k: f64) -> Option<f64> {
    if c == 0.0 {
        return if b == 0.0 { None } else { Some(-k / b) };
    }
    let disc = b * b - 4.0 * c * k;
    if disc < 0.0 {
        return None;
    }
    // Stable form: avoids cancellation when c is tiny relative to b.
    let q = -0.5 * (b + b.signum() * disc.sqrt());
    if q == 0.0 {
        return Some(0.0);
    }
    [q / c, k / q]
        .into_iter()
        .filter(|r| r.is_finite())
        .reduce(f64::max)
}

/// Least squares for `a + b·t + c·t²` with `b, c >= 0`.
///
/// The constrained optimum is the unconstrained solution on some subset of
/// free terms, so every subset containing `a` is solved and the feasible one
/// with the smallest residual wins.
fn fit_monotonic_quadratic(t: &[f64], v: &[f64]) -> Result<[f64; 3]> {
    // Work on t / t_max to keep the normal equations well conditioned.
    let scale = t.iter().copied().fold(0.0f64, f64::max);
    let scale = if scale > 0.0 { scale } else { 1.0 };
    let u: Vec<f64> = t.iter().map(|x| x / scale).collect();

    const SUBSETS: [&[usize]; 4] = [&[0, 1, 2], &[0, 1], &[0, 2], &[0]];
    let mut best: Option<([f64; 3], f64)> = None;
    for cols in SUBSETS {
        let Some(sol) = solve_subset(&u, v, cols) else {
            continue;
        };
        if sol[1] < -1e-12 || sol[2] < -1e-12 {
            continue;
        }
        let coef = [sol[0], sol[1].max(0.0), sol[2].max(0.0)];
        let sse: f64 = u
            .iter()
            .zip(v)
            .map(|(x, y)| {
                let r = y - (coef[0] + coef[1] * x + coef[2] * x * x);
                r * r
            })
            .sum();
        if best.as_ref().is_none_or(|(_, b)| sse < *b - 1e-12) {
            best = Some((coef, sse));
        }
    }
    let ([a, bu, cu], _) = best.ok_or_else(|| {
        RigError::Config("valve calibration samples do not determine a curve".into())
    })?;
    Ok([a, bu / scale, cu / (scale * scale)])
}

/// Unconstrained least squares over the basis columns in `cols` (0: 1, 1: u, 2: u²).
/// Returns the full coefficient vector with unused terms at 0, or None if singular.
fn solve_subset(u: &[f64], v: &[f64], cols: &[usize]) -> Option<[f64; 3]> {
    let k = cols.len();
    if u.len() < k {
        return None;
    }
    let basis = |x: f64, j: usize| x.powi(i32::try_from(j).unwrap_or(0));
    let mut m = [[0.0f64; 4]; 3];
    for (r, &jr) in cols.iter().enumerate() {
        for (c, &jc) in cols.iter().enumerate() {
            m[r][c] = u.iter().map(|&x| basis(x, jr) * basis(x, jc)).sum();
        }
        m[r][k] = u.iter().zip(v).map(|(&x, &y)| basis(x, jr) * y).sum();
    }
    let x = gauss_solve(&mut m, k)?;
    let mut out = [0.0; 3];
    for (i, &j) in cols.iter().enumerate() {
        out[j] = x[i];
    }
    Some(out)
}

/// Gaussian elimination with partial pivoting on an augmented `k x (k+1)` system.
fn gauss_solve(m: &mut [[f64; 4]; 3], k: usize) -> Option<[f64; 3]> {
    let norm = m
        .iter()
        .take(k)
        .flat_map(|row| row.iter().take(k))
        .fold(0.0f64, |acc, x| acc.max(x.abs()));
    if norm == 0.0 {
        return None;
    }
    for col in 0..k {
        let pivot = (col..k).max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))?;
        if m[pivot][col].abs() < 1e-10 * norm {
            return None;
        }
        m.swap(col, pivot);
        for row in (col + 1)..k {
            let f = m[row][col] / m[col][col];
            for c in col..=k {
                m[row][c] -= f * m[col][c];
            }
        }
    }
    let mut x = [0.0; 3];
    for row in (0..k).rev() {
        let mut s = m[row][k];
        for c in (row + 1)..k {
            s -= m[row][c] * x[c];
        }
        x[row] = s / m[row][row];
    }
    Some(x)
}

/// Calibrated reward valve: the fitted curve plus the output line that opens it.
pub struct Valve {
    calibration: ValveCalibration,
    line: Box<dyn RewardValve>,
}

impl core::fmt::Debug for Valve {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Valve")
            .field("calibration", &self.calibration)
            .field("action", &self.line.open_action())
            .finish()
    }
}

impl Valve {
    pub fn new(calibration: ValveCalibration, line: impl RewardValve + 'static) -> Self {
        Self {
            calibration,
            line: Box::new(line),
        }
    }

    pub fn calibration(&self) -> &ValveCalibration {
        &self.calibration
    }

    pub fn open_action(&self) -> OutputAction {
        self.line.open_action()
    }

    /// Seconds the valve stays open to deliver `volume_ul`; zero volume keeps it shut.
    pub fn open_time_s(&self, volume_ul: f64) -> Result<f64> {
        if volume_ul == 0.0 {
            return Ok(0.0);
        }
        Ok(self.calibration.ul2ms(volume_ul)? / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> ValveCalibration {
        ValveCalibration::new(vec![50.0, 100.0, 150.0, 200.0], vec![4.0, 9.0, 14.0, 19.0])
            .unwrap()
    }

    #[test]
    fn linear_samples_round_trip() {
        let cal = linear();
        assert!(cal.is_calibrated());
        for t in (50..=200).step_by(25) {
            let t = f64::from(t);
            let v = 0.1 * t - 1.0;
            assert!((cal.ms2ul(t).unwrap() - v).abs() < 1e-3);
            assert!((cal.ul2ms(v).unwrap() - t).abs() < 1e-3);
        }
    }

    #[test]
    fn concave_samples_clamp_curvature_to_zero() {
        // sqrt-like data would need c < 0; constrained fit falls back to a line
        let cal = ValveCalibration::new(
            vec![10.0, 20.0, 40.0, 80.0],
            vec![3.0, 4.2, 6.0, 8.5],
        )
        .unwrap();
        let [_, b, c] = cal.coefficients();
        assert!(b > 0.0);
        assert_eq!(c, 0.0);
    }

    #[test]
    fn convex_samples_keep_curvature() {
        let t = [20.0, 40.0, 60.0, 80.0, 100.0];
        let v: Vec<f64> = t.iter().map(|x| 0.5 + 0.01 * x + 0.001 * x * x).collect();
        let cal = ValveCalibration::new(t.to_vec(), v).unwrap();
        let [a, b, c] = cal.coefficients();
        assert!((a - 0.5).abs() < 1e-6);
        assert!((b - 0.01).abs() < 1e-6);
        assert!((c - 0.001).abs() < 1e-8);
        assert!((cal.ul2ms(0.5 + 0.6 + 3.6).unwrap() - 60.0).abs() < 1e-6);
    }

    #[test]
    fn too_few_samples_is_uncalibrated() {
        let cal = ValveCalibration::new(vec![50.0], vec![4.0]).unwrap();
        assert!(!cal.is_calibrated());
        assert!(cal.ms2ul(10.0).unwrap().is_nan());
        let err = cal.ul2ms(3.0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RigError>(),
            Some(RigError::Config(_))
        ));
    }

    #[test]
    fn negative_inputs_are_domain_errors() {
        let cal = linear();
        for err in [cal.ms2ul(-1.0).unwrap_err(), cal.ul2ms(-1.0).unwrap_err()] {
            assert!(matches!(
                err.downcast_ref::<RigError>(),
                Some(RigError::Domain(_))
            ));
        }
        assert!(cal.ul2ms(0.0).is_err());
    }

    #[test]
    fn volume_below_intercept_is_a_domain_error() {
        // 0.1 µL/ms with a 1 µL intercept: 0.5 µL would need t = -5 ms
        let cal =
            ValveCalibration::new(vec![50.0, 100.0, 150.0, 200.0], vec![6.0, 11.0, 16.0, 21.0])
                .unwrap();
        let err = cal.ul2ms(0.5).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RigError>(),
            Some(RigError::Domain(_))
        ));
        assert!((cal.ul2ms(1.5).unwrap() - 5.0).abs() < 1e-6);
        let valve = Valve::new(cal, crate::mocks::FixedValve);
        assert!(valve.open_time_s(0.5).is_err());
        assert_eq!(valve.open_time_s(0.0).unwrap(), 0.0);
    }

    #[test]
    fn mismatched_samples_are_rejected() {
        assert!(ValveCalibration::new(vec![1.0, 2.0], vec![1.0]).is_err());
        assert!(ValveCalibration::new(vec![-1.0, 2.0], vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn largest_root_prefers_positive_branch() {
        // t^2 - 4 = 0
        assert_eq!(largest_real_root(1.0, 0.0, -4.0), Some(2.0));
        assert_eq!(largest_real_root(0.0, 2.0, -4.0), Some(2.0));
        assert_eq!(largest_real_root(1.0, 0.0, 4.0), None);
    }
}
