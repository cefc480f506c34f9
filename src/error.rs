use thiserror::Error;

/// Failures raised by a provider adapter for one model call.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request aborted")]
    Aborted,
    #[error("{0} api key missing")]
    MissingApiKey(&'static str),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to decode provider response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Failures raised by the screen capability.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComputerError {
    #[error("no capture source available")]
    CaptureUnavailable,
    #[error("unsupported action: {0}")]
    Unsupported(String),
    #[error("input injection failed: {0}")]
    Input(String),
    #[error("computer error: {0}")]
    Other(String),
}

/// Fatal turn errors. Everything recoverable is absorbed by the loop and only logged.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no output from model")]
    NoModelOutput,
    #[error("safety check not acknowledged: {message}")]
    UnacknowledgedSafetyCheck { message: String },
    #[error("blocked destination: {url}")]
    BlockedDestination { url: String },
    #[error("output {output_id} does not answer call {call_id}")]
    UnlinkedOutput { call_id: String, output_id: String },
    #[error("unknown screen action: {0}")]
    UnknownAction(String),
    #[error("iteration limit of {0} reached")]
    IterationLimit(usize),
    #[error("a turn is already running")]
    TurnInProgress,
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("capability error: {0}")]
    Capability(#[from] ComputerError),
}
