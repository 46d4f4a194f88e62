use thiserror::Error;

/// Every failure a tracker backend can surface to its caller.
///
/// Transport errors never leave an adapter as-is; they are classified into
/// one of these kinds first.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Token or credential rejected by the remote service. Cached
    /// credentials are already cleared when this is returned.
    #[error("authentication expired, please login again")]
    AuthExpired,
    /// Timeout or connectivity loss. Nothing was mutated, retry later.
    #[error("tracker unreachable: {0}")]
    Transient(String),
    /// The service answered with something we don't understand.
    #[error("unexpected response from tracker: {0}")]
    RemoteProtocol(String),
    /// The remote entry does not exist.
    #[error("remote entry not found")]
    NotFound,
    /// Local track data is insufficient to sync.
    #[error("invalid track: {0}")]
    Validation(String),
    #[error("not logged in")]
    NoCredentials,
    #[error("credential store error: {0}")]
    Store(String),
}

impl Error {
    /// Whether the same call may succeed on a later trigger without user action.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Error::RemoteProtocol(format!("{e}"));
        }

        match e.status().map(|status| status.as_u16()) {
            Some(401) | Some(403) => return Error::AuthExpired,
            Some(404) => return Error::NotFound,
            _ => {}
        }

        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            Error::Transient(format!("{e}"))
        } else {
            Error::RemoteProtocol(format!("{e}"))
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::RemoteProtocol(format!("{e}"))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Transient("request timed out".to_string())
    }
}
