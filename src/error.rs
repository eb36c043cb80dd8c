use derive_more::From;
use k8s_openapi::serde_json;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Json(serde_json::Error),

    #[from]
    Kube(kube::Error),

    #[from]
    Infer(kube::config::InferConfigError),

    #[from]
    HttpHeader(hyper::http::Error),

    #[from]
    Join(tokio::task::JoinError),

    /// Object lacks the metadata needed to derive its store key
    InvalidObject(String),

    /// A list response did not report the resource version it was served at
    MissingResourceVersion,

    /// The sync loop gave up after too many consecutive failures
    RetriesExhausted { attempts: u32, last_error: String },

    /// Custom error message
    Custom(String),
}

/// Coarse classification of failures at the transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Forbidden,
    Timeout,
    StaleResourceVersion,
    Decode,
    Other,
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Kube(kube::Error::Api(response)) => match response.code {
                404 => ErrorKind::NotFound,
                409 => ErrorKind::Conflict,
                401 | 403 => ErrorKind::Forbidden,
                410 => ErrorKind::StaleResourceVersion,
                408 | 504 => ErrorKind::Timeout,
                _ if response.reason == "Expired" || response.reason == "Gone" => {
                    ErrorKind::StaleResourceVersion
                }
                _ if response.reason == "Timeout" => ErrorKind::Timeout,
                _ => ErrorKind::Other,
            },
            Self::Kube(kube::Error::HyperError(e)) if e.is_timeout() => ErrorKind::Timeout,
            Self::Kube(kube::Error::SerdeError(_) | kube::Error::FromUtf8(_)) | Self::Json(_) => {
                ErrorKind::Decode
            }
            Self::Kube(kube::Error::LinesCodecMaxLineLengthExceeded) => ErrorKind::Decode,
            Self::InvalidObject(_) | Self::MissingResourceVersion => ErrorKind::Decode,
            _ => ErrorKind::Other,
        }
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.kind() == ErrorKind::StaleResourceVersion
    }

    /// Errors that no amount of relisting or rewatching will fix: bad
    /// credentials, missing permissions, or an unusable kubeconfig.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Kube(kube::Error::Auth(_) | kube::Error::InferConfig(_)) | Self::Infer(_) => {
                true
            }
            Self::RetriesExhausted { .. } => true,
            _ => self.kind() == ErrorKind::Forbidden,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::InvalidObject(message) => write!(fmt, "invalid object: {message}"),
            Self::MissingResourceVersion => write!(fmt, "list response carried no resourceVersion"),
            Self::RetriesExhausted {
                attempts,
                last_error,
            } => write!(
                fmt,
                "gave up after {attempts} consecutive failures, last error: {last_error}"
            ),
            Self::Custom(message) => write!(fmt, "{message}"),
            _ => write!(fmt, "{self:?}"),
        }
    }
}

impl std::error::Error for Error {}
