use thiserror::Error;

/// Errors returned by [`crate::ParseHubClient`].
#[derive(Debug, Error)]
pub enum ParseHubError {
    /// The request never produced an HTTP response (DNS, connect, timeout, TLS).
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// The API answered with a non-success status code.
    #[error("ParseHub API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The API answered 2xx but the body did not match the expected shape.
    #[error("unexpected response body: {0}")]
    Decode(#[source] reqwest::Error),
}

impl ParseHubError {
    /// True when the provider could not be reached at all.
    ///
    /// Callers use this to tell "could not ask" apart from "the job failed".
    pub fn is_transport(&self) -> bool {
        matches!(self, ParseHubError::Transport(_))
    }
}

impl From<reqwest::Error> for ParseHubError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ParseHubError::Decode(err)
        } else if let Some(status) = err.status() {
            ParseHubError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ParseHubError::Transport(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, ParseHubError>;
