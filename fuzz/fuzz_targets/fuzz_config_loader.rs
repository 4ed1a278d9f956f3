#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parse errors and validation errors are fine; panics are not.
    let Ok(cfg) = trialrig_config::load_toml(data) else {
        return;
    };
    if cfg.validate().is_err() {
        return;
    }
    // A validated config must convert into the runtime structs without panicking.
    let _ = trialrig_core::config::SamplerCfg::try_from(&cfg.task);
    let _ = trialrig_core::config::BlockCfg::try_from(&cfg.blocks);
    let _ = trialrig_core::Spacer::try_from(&cfg.spacer);
});
