use proptest::prelude::*;
use trialrig_core::config::{AdaptiveCfg, TrainingCfg};
use trialrig_core::sampling::biased_probs;
use trialrig_core::training::MAX_TRAINING_PHASE;
use trialrig_core::{AdaptiveTrainingController, Spacer, TrainingState, ValveCalibration};

const SIGNED: [f64; 11] = [
    -1.0, -0.5, -0.25, -0.125, -0.0625, 0.0, 0.0625, 0.125, 0.25, 0.5, 1.0,
];

prop_compose! {
    // (signed contrast index, correct) pairs, biased towards correct answers
    fn trial_stream()(
        v in prop::collection::vec((0usize..SIGNED.len(), prop::bool::weighted(0.85)), 1..1500)
    ) -> Vec<(f64, bool)> {
        v.into_iter().map(|(i, c)| (SIGNED[i], c)).collect()
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn training_phase_is_monotonic_and_steps_by_one(stream in trial_stream()) {
        let mut c = AdaptiveTrainingController::new(
            TrainingCfg::default(),
            AdaptiveCfg::default(),
            TrainingState::default(),
        ).unwrap();
        let mut prev = c.training_phase();
        for (signed, correct) in stream {
            c.count_trial();
            c.check_training_phase();
            let now = c.training_phase();
            prop_assert!(now == prev || now == prev + 1, "{prev} -> {now}");
            prop_assert!(now <= MAX_TRAINING_PHASE);
            prev = now;
            c.record_trial(signed, correct);
        }
    }

    #[test]
    fn biased_probabilities_are_normalized(
        n in 1usize..12,
        idx_seed in any::<usize>(),
        p in 0.01f64..10.0,
    ) {
        let idx = (idx_seed % n) as isize;
        let probs = biased_probs(n, idx, p).unwrap();
        prop_assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        prop_assert!(probs.iter().all(|&x| x > 0.0));
        // negative indices address the same slot from the end
        let from_end = biased_probs(n, idx - n as isize, p).unwrap();
        prop_assert_eq!(probs, from_end);
    }

    #[test]
    fn calibration_inverts_within_range(
        a in 0.0f64..2.0,
        b in 0.01f64..0.2,
        c in 0.0f64..0.001,
        t in 20.0f64..200.0,
    ) {
        let ts = [20.0, 60.0, 100.0, 150.0, 200.0];
        let vs: Vec<f64> = ts.iter().map(|x| a + b * x + c * x * x).collect();
        let cal = ValveCalibration::new(ts.to_vec(), vs).unwrap();
        let v = cal.ms2ul(t).unwrap();
        let back = cal.ul2ms(v).unwrap();
        prop_assert!((back - t).abs() < 1e-4, "t={t} back={back}");
    }

    #[test]
    fn spacer_pulses_strictly_increase(
        dt_start in 0.005f64..0.2,
        span in 0.0f64..0.5,
        n in 1usize..12,
        tup in 0.005f64..0.08,
    ) {
        let s = Spacer::new(dt_start, dt_start + span, n, tup).unwrap();
        let t = s.pulse_times();
        prop_assert_eq!(t.len(), 2 * n - 1);
        prop_assert!(t.windows(2).all(|w| w[1] - w[0] > tup));
    }
}
