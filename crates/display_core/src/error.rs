use shared::domain::RegistrationNumber;
use thiserror::Error;

/// Returned by an operation that noticed its cancellation token fired.
///
/// The coordinator treats it as a superseded call, never as a failure.
#[derive(Debug, Clone, Copy, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("invalid snapshot endpoint '{path}': {source}")]
    Endpoint {
        path: String,
        source: url::ParseError,
    },
    #[error("snapshot request {path} failed with status {status}")]
    Status { path: String, status: u16 },
    #[error("snapshot request {path} failed with status {status}: {code:?}: {message}")]
    Api {
        path: String,
        status: u16,
        code: shared::error::ErrorCode,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("undecodable push frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid push payload for {event}: {reason}")]
    InvalidPayload { event: &'static str, reason: String },
    #[error("push url must start with http:// or https://, got '{0}'")]
    UnsupportedScheme(String),
    #[error("invalid push url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RosterError {
    #[error("contestant {0} is eliminated but has no elimination round")]
    MissingEliminationRound(RegistrationNumber),
    #[error("contestant {0} has an elimination round but is not eliminated")]
    UnexpectedEliminationRound(RegistrationNumber),
    #[error("contestant {0} is rescued but has no rescue round")]
    MissingRescueRound(RegistrationNumber),
    #[error("contestant {0} has a rescue round but is not rescued")]
    UnexpectedRescueRound(RegistrationNumber),
    #[error("roster delta references unknown contestant {0}")]
    UnknownContestant(RegistrationNumber),
    #[error("registration number must start at 1")]
    ZeroRegistrationNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("control payload for {mode} must be a JSON object")]
    PayloadNotObject { mode: shared::domain::RenderMode },
}
