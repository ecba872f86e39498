use std::io::Error as IoError;
use std::time::Duration;

use http::StatusCode;

use k8_config::ConfigError;

pub type Result<T, E = ClientError> = core::result::Result<T, E>;

/// Broad category of a [`ClientError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Authentication,
    Client,
    Server,
    UnexpectedResponse,
    Generic,
}

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("authentication failed ({status}) for {path}: {body}")]
    Authentication {
        path: String,
        status: StatusCode,
        body: String,
    },
    #[error("exec credential helper {command} failed (exit {code:?}): {stderr}")]
    ExecFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("exec credential helper {command} returned malformed output: {msg}")]
    ExecOutput { command: String, msg: String },
    #[error("not found {path}: {body}")]
    NotFound { path: String, body: String },
    #[error("conflict {path}: {body}")]
    Conflict { path: String, body: String },
    #[error("resource version expired {path}: {body}")]
    Gone { path: String, body: String },
    #[error("client error ({status}) for {path}: {body}")]
    Client {
        path: String,
        status: StatusCode,
        body: String,
    },
    #[error("server error ({status}) for {path}: {body}")]
    Server {
        path: String,
        status: StatusCode,
        body: String,
    },
    #[error("unexpected response ({status}) for {path}: {body}")]
    UnexpectedResponse {
        path: String,
        status: StatusCode,
        body: String,
    },
    #[error("transport error for {path}: {source}")]
    Transport {
        path: String,
        source: reqwest::Error,
    },
    #[error("tls setup: {0}")]
    Tls(String),
    #[error("timed out after {0:?} waiting for a pooled connection")]
    PoolExhausted(Duration),
    #[error("connection pool closed")]
    PoolClosed,
    #[error("malformed watch stream on {path}: {msg}")]
    MalformedStream { path: String, msg: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("watch on {path} gave up after {retries} retries: {last}")]
    RetriesExhausted {
        path: String,
        retries: u32,
        last: Box<ClientError>,
    },
}

impl ClientError {
    /// map a non-success status to its error, `None` for 2xx and 3xx
    pub fn from_status(path: &str, status: StatusCode, body: String) -> Option<Self> {
        if status.is_success() || status.is_redirection() {
            return None;
        }

        let path = path.to_owned();
        Some(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Self::Authentication { path, status, body }
            }
            StatusCode::NOT_FOUND => Self::NotFound { path, body },
            StatusCode::CONFLICT => Self::Conflict { path, body },
            StatusCode::GONE => Self::Gone { path, body },
            s if s.is_client_error() => Self::Client { path, status, body },
            s if s.is_server_error() => Self::Server { path, status, body },
            _ => Self::UnexpectedResponse { path, status, body },
        })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Authentication { .. } | Self::ExecFailed { .. } | Self::ExecOutput { .. } => {
                ErrorKind::Authentication
            }
            Self::NotFound { .. }
            | Self::Conflict { .. }
            | Self::Gone { .. }
            | Self::Client { .. } => ErrorKind::Client,
            Self::Server { .. } => ErrorKind::Server,
            Self::UnexpectedResponse { .. } => ErrorKind::UnexpectedResponse,
            Self::RetriesExhausted { last, .. } => last.kind(),
            _ => ErrorKind::Generic,
        }
    }

    /// http status behind this error, if it came from a response
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Authentication { status, .. }
            | Self::Client { status, .. }
            | Self::Server { status, .. }
            | Self::UnexpectedResponse { status, .. } => Some(*status),
            Self::NotFound { .. } => Some(StatusCode::NOT_FOUND),
            Self::Conflict { .. } => Some(StatusCode::CONFLICT),
            Self::Gone { .. } => Some(StatusCode::GONE),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone { .. })
    }

    pub fn is_auth(&self) -> bool {
        self.kind() == ErrorKind::Authentication
    }
}

#[cfg(test)]
mod test {

    use http::StatusCode;

    use super::ClientError;
    use super::ErrorKind;

    fn kind_of(code: u16) -> Option<ErrorKind> {
        let status = StatusCode::from_u16(code).expect("status");
        ClientError::from_status("/api/v1/pods", status, "body".to_owned()).map(|e| e.kind())
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(kind_of(200), None);
        assert_eq!(kind_of(201), None);
        assert_eq!(kind_of(304), None);
        assert_eq!(kind_of(401), Some(ErrorKind::Authentication));
        assert_eq!(kind_of(403), Some(ErrorKind::Authentication));
        assert_eq!(kind_of(404), Some(ErrorKind::Client));
        assert_eq!(kind_of(409), Some(ErrorKind::Client));
        assert_eq!(kind_of(410), Some(ErrorKind::Client));
        assert_eq!(kind_of(422), Some(ErrorKind::Client));
        assert_eq!(kind_of(500), Some(ErrorKind::Server));
        assert_eq!(kind_of(503), Some(ErrorKind::Server));
        assert_eq!(kind_of(101), Some(ErrorKind::UnexpectedResponse));
    }

    #[test]
    fn test_error_keeps_context() {
        let err = ClientError::from_status("/api/v1/pods/x", StatusCode::GONE, "too old".to_owned())
            .expect("error");
        assert!(err.is_gone());
        assert_eq!(err.status_code(), Some(StatusCode::GONE));
        let msg = err.to_string();
        assert!(msg.contains("/api/v1/pods/x"));
        assert!(msg.contains("too old"));

        let err = ClientError::from_status("/x", StatusCode::NOT_FOUND, String::new()).expect("err");
        assert!(err.is_not_found());
        let err = ClientError::from_status("/x", StatusCode::CONFLICT, String::new()).expect("err");
        assert!(err.is_conflict());
    }
}
