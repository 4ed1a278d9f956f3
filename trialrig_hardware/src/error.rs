use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("state machine is empty")]
    EmptyMachine,
    #[error("state '{state}' sends '{event}' to unknown state '{target}'")]
    UnknownState {
        state: String,
        event: String,
        target: String,
    },
    #[error("state '{0}' has no timeout and no event arrived")]
    Stuck(String),
    #[error("state machine did not exit after {0} transitions")]
    Runaway(usize),
    #[error("rotary encoder thresholds must be distinct, got {0:?}")]
    Thresholds(Vec<i32>),
    #[error("osc: {0}")]
    Osc(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
