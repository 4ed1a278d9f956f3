//! Bpod-style capability objects: rotary encoder module, soft-code sound
//! cues and the reward valve line.

use trialrig_traits::{OutputAction, RewardValve, RotaryEncoder, SoundCard, SoundCue, StimCommand};

use crate::error::{HwError, Result};

/// Rotary encoder module on a state-machine serial port.
///
/// Armed thresholds fire `<module>_<n>` events, `n` being the 1-based index
/// of the threshold in the armed list.
#[derive(Debug, Clone)]
pub struct BpodRotaryEncoder {
    serial: String,
    module: String,
    thresholds: Vec<i32>,
}

impl BpodRotaryEncoder {
    pub const DEFAULT_MODULE: &'static str = "RotaryEncoder1";

    pub fn new(serial: impl Into<String>, thresholds: Vec<i32>) -> Result<Self> {
        let mut sorted = thresholds.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if thresholds.is_empty() || sorted.len() != thresholds.len() {
            return Err(HwError::Thresholds(thresholds));
        }
        Ok(Self {
            serial: serial.into(),
            module: Self::DEFAULT_MODULE.to_string(),
            thresholds,
        })
    }

    pub fn thresholds(&self) -> &[i32] {
        &self.thresholds
    }
}

impl Default for BpodRotaryEncoder {
    fn default() -> Self {
        Self {
            serial: "Serial1".to_string(),
            module: Self::DEFAULT_MODULE.to_string(),
            thresholds: vec![-35, 35, -2, 2],
        }
    }
}

impl RotaryEncoder for BpodRotaryEncoder {
    fn reset_action(&self) -> OutputAction {
        OutputAction::new(&self.serial, 1)
    }

    fn stim_action(&self, cmd: StimCommand) -> OutputAction {
        let byte = match cmd {
            StimCommand::Show => 2,
            StimCommand::Hide => 3,
            StimCommand::ClosedLoop => 4,
            StimCommand::Freeze => 5,
        };
        OutputAction::new(&self.serial, byte)
    }

    fn threshold_event(&self, threshold_deg: i32) -> Option<String> {
        self.thresholds
            .iter()
            .position(|&t| t == threshold_deg)
            .map(|i| format!("{}_{}", self.module, i + 1))
    }
}

/// Sound cues triggered through state-machine soft codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftCodeSound;

impl SoundCard for SoftCodeSound {
    fn cue_action(&self, cue: SoundCue) -> OutputAction {
        let code = match cue {
            SoundCue::Stop => 1,
            SoundCue::Tone => 2,
            SoundCue::Noise => 3,
        };
        OutputAction::new("SoftCode", code)
    }
}

#[derive(Debug, Clone)]
pub struct BpodValve {
    channel: String,
}

impl BpodValve {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

impl Default for BpodValve {
    fn default() -> Self {
        Self::new("Valve1")
    }
}

impl RewardValve for BpodValve {
    fn open_action(&self) -> OutputAction {
        OutputAction::new(&self.channel, 255)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(-35, Some("RotaryEncoder1_1"))]
    #[case(35, Some("RotaryEncoder1_2"))]
    #[case(-2, Some("RotaryEncoder1_3"))]
    #[case(2, Some("RotaryEncoder1_4"))]
    #[case(10, None)]
    fn default_threshold_events(#[case] deg: i32, #[case] event: Option<&str>) {
        let enc = BpodRotaryEncoder::default();
        assert_eq!(enc.threshold_event(deg).as_deref(), event);
    }

    #[test]
    fn serial_commands() {
        let enc = BpodRotaryEncoder::default();
        assert_eq!(enc.reset_action(), OutputAction::new("Serial1", 1));
        assert_eq!(
            enc.stim_action(StimCommand::ClosedLoop),
            OutputAction::new("Serial1", 4)
        );
        assert_eq!(
            SoftCodeSound.cue_action(SoundCue::Noise),
            OutputAction::new("SoftCode", 3)
        );
        assert_eq!(BpodValve::default().open_action(), OutputAction::new("Valve1", 255));
    }

    #[test]
    fn duplicate_thresholds_are_rejected() {
        assert!(matches!(
            BpodRotaryEncoder::new("Serial1", vec![2, 2]),
            Err(HwError::Thresholds(_))
        ));
        assert!(BpodRotaryEncoder::new("Serial1", vec![]).is_err());
    }
}
