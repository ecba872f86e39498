use std::io::Error as IoError;
use std::path::PathBuf;

use base64::DecodeError;
use serde_yaml::Error as SerdeYamlError;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("config file {path:?}: {source}")]
    IoError { path: PathBuf, source: IoError },
    #[error("failed to parse kubeconfig: {0}")]
    SerdeError(#[from] SerdeYamlError),
    #[error("invalid base64 in {field}: {source}")]
    Base64 {
        field: &'static str,
        source: DecodeError,
    },
    #[error("no current context")]
    NoCurrentContext,
    #[error("context {0} not found")]
    ContextNotFound(String),
    #[error("cluster {0} not found")]
    ClusterNotFound(String),
    #[error("user {0} not found")]
    UserNotFound(String),
    #[error("home directory not found")]
    NoHomeDir,
    #[error("in-cluster environment variable {0} not set")]
    MissingEnv(&'static str),
}

impl ConfigError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: IoError) -> Self {
        Self::IoError {
            path: path.into(),
            source,
        }
    }
}
