#![no_main]
use libfuzzer_sys::fuzz_target;
use trialrig_core::ValveCalibration;

fuzz_target!(|input: (Vec<(f64, f64)>, f64)| {
    let (samples, volume) = input;
    let (t, v) = samples.into_iter().unzip();
    let Ok(cal) = ValveCalibration::new(t, v) else {
        return;
    };
    // Fitting and inversion may reject input but must not panic.
    if let Ok(ms) = cal.ul2ms(volume) {
        assert!(ms >= 0.0, "negative open time {ms} for {volume} uL");
    }
    let _ = cal.ms2ul(volume.abs());
});
