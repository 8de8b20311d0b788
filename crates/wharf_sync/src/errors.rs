use thiserror;

use wharf_core::Error as CoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("http client error")]
    Reqwest(#[from] reqwest::Error),

    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("upstream authentication failed: {0}")]
    Auth(String),

    #[error("invalid tag pattern")]
    Pattern(#[from] regex::Error),

    #[error("signer failed: {0}")]
    Signer(String),

    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("json error")]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl Error {
    /// Whether a retry might succeed: network failures, 5xx responses and
    /// throttling. Other 4xx responses are final for the request.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Reqwest(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Upstream { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            _ => false,
        }
    }
}

impl From<Error> for CoreError {
    fn from(e: Error) -> CoreError {
        match e {
            Error::Core(core) => core,
            other => CoreError::UpstreamError(format!("{other}")),
        }
    }
}
