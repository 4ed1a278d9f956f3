use thiserror::Error;
use trialrig_traits::RawTrialData;

#[derive(Debug, Error, Clone)]
pub enum RigError {
    /// Bad or missing configuration; fatal at startup or first use.
    #[error("configuration error: {0}")]
    Config(String),
    /// The controller did not follow the trial contract. `raw` holds what it reported.
    #[error("protocol violation: {message}")]
    Protocol {
        message: String,
        raw: Option<Box<RawTrialData>>,
    },
    /// A value outside the domain of a model (e.g. negative volume).
    #[error("domain error: {0}")]
    Domain(String),
    /// Failure reported by the controller, renderer link or another collaborator.
    #[error("collaborator error: {0}")]
    Collaborator(String),
    #[error("io error: {0}")]
    Io(String),
}

impl RigError {
    pub fn protocol(message: impl Into<String>, raw: &RawTrialData) -> Self {
        Self::Protocol {
            message: message.into(),
            raw: Some(Box::new(raw.clone())),
        }
    }

    /// Raw controller payload attached to a protocol violation.
    pub fn raw(&self) -> Option<&RawTrialData> {
        match self {
            Self::Protocol { raw, .. } => raw.as_deref(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing state machine runtime")]
    MissingRuntime,
    #[error("missing rotary encoder")]
    MissingEncoder,
    #[error("missing sound card")]
    MissingSound,
    #[error("missing reward valve")]
    MissingValve,
    #[error("missing trial sequencer")]
    MissingSequencer,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
