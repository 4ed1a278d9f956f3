//! Spacer: a chirp-coded pulse train marking a boundary on the sync line.
//!
//! Inter-pulse intervals sweep up from `dt_start` to `dt_end` and back down,
//! which keeps autocorrelation side-lobes low so the sequence can be located
//! in an acquisition trace by cross-correlation.

use trialrig_traits::{OutputAction, StateMachine, StateSpec, TUP};

use crate::error::{Result, RigError};

/// Default detection threshold on the template-normalized cross-correlation.
pub const DETECTION_THRESHOLD: f64 = 0.9;

/// Samples zeroed on each side of a candidate peak before measuring side-lobes.
pub const PEAK_EXCLUSION: usize = 100;

/// Largest side-lobe, as a fraction of the peak, a detection may leave.
pub const SIDELOBE_RATIO: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Spacer {
    dt_start: f64,
    dt_end: f64,
    n_pulses: usize,
    tup: f64,
}

impl Default for Spacer {
    fn default() -> Self {
        Self {
            dt_start: 0.02,
            dt_end: 0.4,
            n_pulses: 8,
            tup: 0.05,
        }
    }
}

impl Spacer {
    /// Fails when consecutive pulses would overlap (some gap <= `tup`).
    pub fn new(dt_start: f64, dt_end: f64, n_pulses: usize, tup: f64) -> Result<Self> {
        if n_pulses == 0 {
            return Err(RigError::Config("spacer needs at least one pulse".into()).into());
        }
        if !(tup.is_finite() && tup > 0.0 && dt_start.is_finite() && dt_end.is_finite()) {
            return Err(RigError::Config(format!(
                "spacer timings must be finite with tup > 0, got dt_start={dt_start} dt_end={dt_end} tup={tup}"
            ))
            .into());
        }
        let s = Self {
            dt_start,
            dt_end,
            n_pulses,
            tup,
        };
        let times = s.pulse_times();
        if let Some(w) = times.windows(2).find(|w| w[1] - w[0] <= tup) {
            return Err(RigError::Config(format!(
                "spacer pulses are overlapping: gap {:.4}s between onsets {:.4}s and {:.4}s does not exceed tup={tup}s",
                w[1] - w[0],
                w[0],
                w[1]
            ))
            .into());
        }
        Ok(s)
    }

    pub fn tup(&self) -> f64 {
        self.tup
    }

    pub fn n_pulses(&self) -> usize {
        self.n_pulses
    }

    /// Pulse onset times in seconds, strictly increasing, `2 * n_pulses - 1` long.
    pub fn pulse_times(&self) -> Vec<f64> {
        let n = self.n_pulses;
        let mut gaps: Vec<f64> = (0..n)
            .map(|i| {
                let lin = if n == 1 {
                    self.dt_start
                } else if i == n - 1 {
                    self.dt_end
                } else {
                    self.dt_start + i as f64 * ((self.dt_end - self.dt_start) / (n - 1) as f64)
                };
                lin + self.tup
            })
            .collect();
        let down: Vec<f64> = gaps.iter().rev().skip(1).copied().collect();
        gaps.extend(down);
        let mut acc = 0.0;
        gaps.iter()
            .map(|g| {
                acc += g;
                acc
            })
            .collect()
    }

    /// 0/1 step signal sampled at `fs` Hz: high for `tup` from every onset,
    /// padded by `10 * tup` after the last onset.
    pub fn generate_template(&self, fs: f64) -> Vec<f64> {
        let times = self.pulse_times();
        let last = times.last().copied().unwrap_or(0.0);
        let ns = ((last + self.tup * 10.0) * fs) as usize;
        let mut edges = vec![0.0f64; ns];
        for &t in &times {
            if let Some(e) = edges.get_mut((t * fs) as usize) {
                *e = 1.0;
            }
        }
        for &t in &times {
            if let Some(e) = edges.get_mut(((t + self.tup) * fs) as usize) {
                *e = -1.0;
            }
        }
        let mut level = 0.0;
        edges
            .iter()
            .map(|e| {
                level += e;
                level
            })
            .collect()
    }

    /// Largest autocorrelation side-lobe of the template relative to its peak,
    /// ignoring lags within `exclusion` samples of zero.
    pub fn sidelobe_ratio(&self, fs: f64, exclusion: usize) -> f64 {
        let sig = self.generate_template(fs);
        let energy: f64 = sig.iter().map(|x| x * x).sum();
        if energy == 0.0 {
            return 0.0;
        }
        let zero_lag = sig.len() - 1;
        correlate_full(&sig, &sig)
            .iter()
            .enumerate()
            .filter(|(i, _)| i.abs_diff(zero_lag) >= exclusion)
            .map(|(_, c)| (c / energy).abs())
            .fold(0.0, f64::max)
    }

    /// Onset times (seconds from the start of `signal`) of every spacer found.
    ///
    /// The cross-correlation with the template is normalized by the template
    /// sum and only lags where the template lies entirely inside `signal` are
    /// searched. Each contiguous run above `threshold` yields one candidate at
    /// its maximum. A candidate is accepted when, with [`PEAK_EXCLUSION`]
    /// samples on either side of it zeroed, nothing within one template length
    /// reaches [`SIDELOBE_RATIO`] of the peak.
    pub fn find_spacers(&self, signal: &[f64], fs: f64, threshold: f64) -> Vec<f64> {
        let template = self.generate_template(fs);
        let norm: f64 = template.iter().sum();
        let m = template.len();
        if norm == 0.0 || signal.len() < m {
            return Vec::new();
        }
        let xcor: Vec<f64> = correlate_full(signal, &template)
            .into_iter()
            .map(|c| c / norm)
            .collect();
        // full overlap: lag 0 sits at index m - 1, the last lag at signal.len() - 1
        let lag0 = m - 1;
        let full = &xcor[lag0..signal.len()];

        let mut candidates = Vec::new();
        let mut run: Option<(usize, f64)> = None;
        for (i, &c) in full.iter().enumerate() {
            if c > threshold {
                match run {
                    Some((_, best)) if best >= c => {}
                    _ => run = Some((i + lag0, c)),
                }
            } else if let Some(peak) = run.take() {
                candidates.push(peak);
            }
        }
        candidates.extend(run);

        candidates
            .into_iter()
            .filter(|&(peak, value)| {
                let lo = peak.saturating_sub(m);
                let hi = (peak + m).min(xcor.len() - 1);
                let mut window = xcor[lo..=hi].to_vec();
                let (z_lo, z_hi) = (
                    (peak - lo).saturating_sub(PEAK_EXCLUSION),
                    (peak - lo + PEAK_EXCLUSION).min(window.len() - 1),
                );
                window[z_lo..=z_hi].fill(0.0);
                let sidelobe = window.iter().copied().map(f64::abs).fold(0.0, f64::max);
                let accepted = sidelobe < SIDELOBE_RATIO * value;
                if !accepted {
                    tracing::debug!(
                        lag = peak - lag0,
                        peak = value,
                        sidelobe,
                        "spacer candidate rejected"
                    );
                }
                accepted
            })
            .map(|(peak, _)| (peak - lag0) as f64 / fs)
            .collect()
    }

    /// Append `spacer_high_NN` / `spacer_low_NN` states driving `sync_channel`;
    /// the last low state hands over to `next_state`.
    pub fn add_spacer_states(&self, sm: &mut StateMachine, sync_channel: &str, next_state: &str) {
        let times = self.pulse_times();
        let n = times.len();
        for (i, t) in times.iter().enumerate() {
            let next_onset = times.get(i + 1).copied().unwrap_or(t + 2.0 * self.tup);
            let next = if i + 1 < n {
                format!("spacer_high_{:02}", i + 1)
            } else {
                next_state.to_string()
            };
            sm.add_state(
                StateSpec::new(format!("spacer_high_{i:02}"), self.tup)
                    .on(TUP, format!("spacer_low_{i:02}"))
                    .output(OutputAction::new(sync_channel, 255)),
            );
            sm.add_state(
                StateSpec::new(format!("spacer_low_{i:02}"), next_onset - t - self.tup)
                    .on(TUP, next),
            );
        }
    }

    pub fn state_machine(&self, sync_channel: &str, next_state: &str) -> StateMachine {
        let mut sm = StateMachine::new();
        self.add_spacer_states(&mut sm, sync_channel, next_state);
        sm
    }
}

/// Cross-correlation in "full" mode: `out[k + m - 1] = Σ_n a[n + k] · v[n]`
/// for every lag `k` in `-(m - 1)..a.len()`, where `m = v.len()`.
pub fn correlate_full(a: &[f64], v: &[f64]) -> Vec<f64> {
    let (na, m) = (a.len(), v.len());
    if na == 0 || m == 0 {
        return Vec::new();
    }
    (0..na + m - 1)
        .map(|idx| {
            // v[n] overlaps a[n + idx - (m - 1)]
            let n_lo = (m - 1).saturating_sub(idx);
            let n_hi = m.min(na + m - 1 - idx);
            (n_lo..n_hi)
                .map(|n| a[n + idx + 1 - m] * v[n])
                .sum()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use trialrig_traits::EXIT_STATE;

    #[test]
    fn correlate_full_matches_reference() {
        let c = correlate_full(&[1.0, 2.0, 3.0], &[0.0, 1.0, 0.5]);
        assert_eq!(c, vec![0.5, 2.0, 3.5, 3.0, 0.0]);
    }

    #[test]
    fn default_pulse_train_shape() {
        let s = Spacer::default();
        let t = s.pulse_times();
        assert_eq!(t.len(), 15);
        assert!((t[0] - 0.07).abs() < 1e-12);
        assert!((t[14] - 3.71).abs() < 1e-9);
        assert!(t.windows(2).all(|w| w[1] - w[0] > s.tup()));
        // the gap before each onset, t[0] included, mirrors around the middle pulse
        let gaps: Vec<f64> = std::iter::once(t[0])
            .chain(t.windows(2).map(|w| w[1] - w[0]))
            .collect();
        for i in 0..gaps.len() {
            assert!((gaps[i] - gaps[gaps.len() - 1 - i]).abs() < 1e-9, "{gaps:?}");
        }
        assert!((gaps[7] - (0.4 + 0.05)).abs() < 1e-12);
    }

    #[test]
    fn pulse_times_are_the_cumulative_mirrored_sweep() {
        let s = Spacer::default();
        let up: Vec<f64> = (0..8)
            .map(|i| 0.02 + (0.4 - 0.02) * f64::from(i) / 7.0 + 0.05)
            .collect();
        let mut expected = Vec::new();
        let mut acc = 0.0;
        for g in up.iter().chain(up[..7].iter().rev()) {
            acc += g;
            expected.push(acc);
        }
        let t = s.pulse_times();
        assert_eq!(t.len(), expected.len());
        for (a, b) in t.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-9, "{t:?} != {expected:?}");
        }
    }

    #[test]
    fn template_is_high_for_tup_per_pulse() {
        let s = Spacer::default();
        let tpl = s.generate_template(1000.0);
        assert_eq!(tpl.len(), 4210);
        assert_eq!(tpl.iter().sum::<f64>(), 750.0);
        assert!(tpl.iter().all(|&x| x == 0.0 || x == 1.0));
    }

    #[test]
    fn autocorrelation_sidelobes_stay_below_30_percent() {
        let r = Spacer::default().sidelobe_ratio(1000.0, 100);
        assert!(r < 0.3, "side-lobe ratio {r}");
    }

    #[test]
    fn overlapping_pulses_fail_at_construction() {
        let err = Spacer::new(0.0, 0.0, 4, 0.05).unwrap_err();
        assert!(err.to_string().contains("overlapping"));
        assert!(matches!(
            err.downcast_ref::<RigError>(),
            Some(RigError::Config(_))
        ));
        assert!(Spacer::new(0.02, 0.4, 0, 0.05).is_err());
    }

    #[test]
    fn single_pulse_is_valid() {
        let s = Spacer::new(0.1, 0.1, 1, 0.05).unwrap();
        assert_eq!(s.pulse_times().len(), 1);
    }

    #[test]
    fn finds_embedded_spacers() {
        let s = Spacer::default();
        let fs = 1000.0;
        let tpl = s.generate_template(fs);
        let mut signal = vec![0.0; 2000];
        signal.extend(&tpl);
        signal.extend(vec![0.0; 3000]);
        signal.extend(&tpl);
        signal.extend(vec![0.0; 500]);
        let found = s.find_spacers(&signal, fs, DETECTION_THRESHOLD);
        let second = (2000 + tpl.len() + 3000) as f64 / fs;
        assert_eq!(found.len(), 2, "{found:?}");
        assert!((found[0] - 2.0).abs() < 1e-9);
        assert!((found[1] - second).abs() < 1e-9);
    }

    #[test]
    fn weak_signal_is_not_detected() {
        let s = Spacer::default();
        let signal: Vec<f64> = s
            .generate_template(1000.0)
            .iter()
            .map(|x| x * 0.5)
            .collect();
        assert!(s.find_spacers(&signal, 1000.0, DETECTION_THRESHOLD).is_empty());
    }

    #[test]
    fn stuck_high_line_is_not_a_spacer() {
        let s = Spacer::default();
        let signal = vec![1.0; 20_000];
        assert!(s.find_spacers(&signal, 1000.0, DETECTION_THRESHOLD).is_empty());
    }

    #[test]
    fn truncated_spacer_at_trace_start_is_ignored() {
        // the trace begins 70 ms into a spacer: only partial-overlap lags could match it
        let s = Spacer::default();
        let tpl = s.generate_template(1000.0);
        let mut signal = tpl[70..].to_vec();
        signal.extend(vec![0.0; 6000]);
        let found = s.find_spacers(&signal, 1000.0, DETECTION_THRESHOLD);
        assert!(found.iter().all(|&t| t >= 0.0), "{found:?}");
        assert!(found.is_empty(), "{found:?}");
    }

    #[test]
    fn trace_shorter_than_template_finds_nothing() {
        let s = Spacer::default();
        let tpl = s.generate_template(1000.0);
        assert!(s.find_spacers(&tpl[..tpl.len() - 1], 1000.0, DETECTION_THRESHOLD).is_empty());
        assert_eq!(s.find_spacers(&tpl, 1000.0, DETECTION_THRESHOLD), vec![0.0]);
    }

    #[test]
    fn spacer_states_chain_to_next_state() {
        let s = Spacer::default();
        let sm = s.state_machine("BNC1", EXIT_STATE);
        assert_eq!(sm.len(), 30);
        assert_eq!(sm.first().unwrap().name, "spacer_high_00");
        let last = &sm.states()[29];
        assert_eq!(last.name, "spacer_low_14");
        assert_eq!(last.next_state(TUP), Some(EXIT_STATE));
        assert!((last.timer_s - s.tup()).abs() < 1e-12);
        assert!(sm.dangling_transitions().is_empty());
        let total: f64 = sm.states().iter().map(|st| st.timer_s).sum();
        let t = s.pulse_times();
        assert!((total - (t[14] + 2.0 * s.tup() - t[0])).abs() < 1e-9);
        assert_eq!(
            sm.states()[0].outputs,
            vec![OutputAction::new("BNC1", 255)]
        );
    }
}
