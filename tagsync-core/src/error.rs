use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network failure (or repeated 5xx) that outlived every retry. The
    /// transport error itself is logged, never carried.
    #[error("can't reach remote")]
    Unreachable,
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("invalid response payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("response is missing the {0} header")]
    MissingHeader(&'static str),
    #[error("no usable credentials configured")]
    MissingCredentials,
    #[error("refreshable credentials require an app key")]
    MissingAppKey,
    #[error("authorization was not started: no PKCE verifier is pending")]
    MissingVerifier,
}

impl RemoteError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RemoteError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, RemoteError::Unreachable)
    }

    /// Path lookup failures are reported as 409 with a `not_found` summary.
    pub fn is_not_found(&self) -> bool {
        match self {
            RemoteError::Api { status, body } => {
                (*status == StatusCode::CONFLICT || *status == StatusCode::NOT_FOUND)
                    && body.contains("not_found")
            }
            _ => false,
        }
    }

    pub(crate) fn is_cursor_reset(&self) -> bool {
        match self {
            RemoteError::Api { status, body } => {
                *status == StatusCode::CONFLICT && body.contains("reset")
            }
            _ => false,
        }
    }
}
