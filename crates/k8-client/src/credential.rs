use std::fmt;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tempfile::TempPath;
use tracing::debug;

use crate::Result;

/// Authentication mode a credential resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Token,
    ClientCertificate,
    Basic,
    Anonymous,
}

/// Authentication material used to sign requests.
///
/// Files materialized from inline certificate data are owned by the credential
/// and removed once the last clone is dropped.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<PathBuf>,
    #[serde(skip)]
    temp_files: Vec<Arc<TempPath>>,
}

impl Credential {
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Default::default()
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            ..Default::default()
        }
    }

    pub fn client_certificate(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self {
            client_certificate: Some(cert.into()),
            client_key: Some(key.into()),
            ..Default::default()
        }
    }

    /// active mode; token beats certificate beats basic auth
    pub fn mode(&self) -> AuthMode {
        if self.token.is_some() {
            AuthMode::Token
        } else if self.client_certificate.is_some() && self.client_key.is_some() {
            AuthMode::ClientCertificate
        } else if self.username.is_some() && self.password.is_some() {
            AuthMode::Basic
        } else {
            AuthMode::Anonymous
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.mode() == AuthMode::Anonymous
    }

    /// write inline PEM data to a private temporary file and keep it for the
    /// lifetime of this credential
    pub(crate) fn materialize(&mut self, prefix: &str, pem: &[u8]) -> Result<PathBuf> {
        let mut file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".pem")
            .tempfile()?;
        file.write_all(pem)?;
        file.flush()?;

        let temp_path = file.into_temp_path();
        let path = temp_path.to_path_buf();
        debug!(?path, "materialized certificate data");
        self.temp_files.push(Arc::new(temp_path));
        Ok(path)
    }

    /// true if any certificate file belongs to this credential
    pub fn owns_temp_files(&self) -> bool {
        !self.temp_files.is_empty()
    }

    pub fn temp_file_paths(&self) -> impl Iterator<Item = &Path> {
        self.temp_files.iter().map(|p| -> &Path { p })
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
            && self.username == other.username
            && self.password == other.password
            && self.client_certificate == other.client_certificate
            && self.client_key == other.client_key
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("mode", &self.mode())
            .field("username", &self.username)
            .field("client_certificate", &self.client_certificate)
            .field("client_key", &self.client_key)
            .finish()
    }
}
