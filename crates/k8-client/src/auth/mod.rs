mod exec;

pub use exec::DEFAULT_EXEC_API_VERSION;
pub use exec::ExecCredential;
pub use exec::ExecCredentialStatus;

use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;
use tracing::instrument;

use k8_config::ExecConfig;
use k8_config::UserDetail;

use crate::ClientError;
use crate::Credential;
use crate::CredentialCache;
use crate::Result;
use crate::cache::key_for;

/// Ways a user entry can authenticate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStrategy {
    Exec,
    Token,
    ClientCertificate,
    Basic,
}

/// highest priority first
pub const STRATEGY_ORDER: [AuthStrategy; 4] = [
    AuthStrategy::Exec,
    AuthStrategy::Token,
    AuthStrategy::ClientCertificate,
    AuthStrategy::Basic,
];

impl AuthStrategy {
    pub fn applies(&self, user: &UserDetail) -> bool {
        match self {
            Self::Exec => user.exec.is_some(),
            Self::Token => user.token.is_some() || user.token_file.is_some(),
            Self::ClientCertificate => {
                (user.client_certificate.is_some() || user.client_certificate_data.is_some())
                    && (user.client_key.is_some() || user.client_key_data.is_some())
            }
            Self::Basic => user.username.is_some() && user.password.is_some(),
        }
    }
}

/// first strategy in priority order that the user entry supports
pub fn select_strategy(user: &UserDetail) -> Option<AuthStrategy> {
    STRATEGY_ORDER.into_iter().find(|s| s.applies(user))
}

/// Turns configured user entries into a [`Credential`]
#[derive(Debug, Clone, Default)]
pub struct CredentialResolver {
    cache: Option<CredentialCache>,
}

impl CredentialResolver {
    pub fn new(cache: CredentialCache) -> Self {
        Self { cache: Some(cache) }
    }

    /// resolver that always runs exec helpers
    pub fn without_cache() -> Self {
        Self { cache: None }
    }

    /// resolver using the per-user cache directory when one exists
    pub fn with_default_cache() -> Self {
        Self {
            cache: CredentialCache::default_dir().map(CredentialCache::new),
        }
    }

    pub fn cache(&self) -> Option<&CredentialCache> {
        self.cache.as_ref()
    }

    #[instrument(skip(self, user))]
    pub async fn resolve(&self, user: &UserDetail) -> Result<Credential> {
        let Some(strategy) = select_strategy(user) else {
            debug!("no credentials configured, using anonymous access");
            return Ok(Credential::default());
        };
        debug!(?strategy, "resolving credential");

        match strategy {
            AuthStrategy::Exec => match &user.exec {
                Some(exec) => self.resolve_exec(exec).await,
                None => Ok(Credential::default()),
            },
            AuthStrategy::Token => resolve_token(user).await,
            AuthStrategy::ClientCertificate => resolve_client_certificate(user),
            AuthStrategy::Basic => match (&user.username, &user.password) {
                (Some(username), Some(password)) => {
                    Ok(Credential::basic(username.clone(), password.clone()))
                }
                _ => Ok(Credential::default()),
            },
        }
    }

    /// exec helper credential, served from cache while it has not expired
    pub async fn resolve_exec(&self, exec: &ExecConfig) -> Result<Credential> {
        let key = key_for(&exec.command, &exec.args);
        if let Some(cache) = &self.cache {
            if let Some(credential) = cache.get(&key).await {
                debug!(key, "using cached exec credential");
                return Ok(credential);
            }
        }

        let status = exec::execute(exec).await?;
        let mut credential = Credential::default();
        credential.token = status.token.clone();

        if credential.token.is_none() {
            if let (Some(cert), Some(key_data)) =
                (&status.client_certificate_data, &status.client_key_data)
            {
                let cert = exec::pem_bytes(cert, "clientCertificateData")?;
                let key_data = exec::pem_bytes(key_data, "clientKeyData")?;
                credential.client_certificate = Some(credential.materialize("k8-exec-cert", &cert)?);
                credential.client_key = Some(credential.materialize("k8-exec-key", &key_data)?);
            }
        }

        // certificate credentials point at temp files which do not outlive this process
        if credential.token.is_some() {
            if let Some(cache) = &self.cache {
                cache.set(&key, &credential, status.expiration_timestamp).await;
            }
        }

        Ok(credential)
    }
}

async fn resolve_token(user: &UserDetail) -> Result<Credential> {
    if let Some(path) = &user.token_file {
        let token = read_token_file(path).await?;
        return Ok(Credential::token(token));
    }

    match &user.token {
        Some(token) => Ok(Credential::token(token.clone())),
        None => Ok(Credential::default()),
    }
}

/// read a bearer token file, surrounding whitespace is not part of the token
pub async fn read_token_file(path: impl Into<PathBuf>) -> Result<String> {
    let path = path.into();
    let token = tokio::fs::read_to_string(&path).await?;
    let token = token.trim();
    if token.is_empty() {
        return Err(ClientError::InvalidRequest(format!(
            "token file {} is empty",
            path.display()
        )));
    }
    Ok(token.to_owned())
}

fn resolve_client_certificate(user: &UserDetail) -> Result<Credential> {
    let mut credential = Credential::default();

    let cert = match (&user.client_certificate_data, &user.client_certificate) {
        (Some(data), _) => {
            let pem = decode_data(data, "client-certificate-data")?;
            credential.materialize("k8-client-cert", &pem)?
        }
        (None, Some(path)) => PathBuf::from(path),
        (None, None) => return Ok(credential),
    };

    let key = match (&user.client_key_data, &user.client_key) {
        (Some(data), _) => {
            let pem = decode_data(data, "client-key-data")?;
            credential.materialize("k8-client-key", &pem)?
        }
        (None, Some(path)) => PathBuf::from(path),
        (None, None) => return Ok(credential),
    };

    credential.client_certificate = Some(cert);
    credential.client_key = Some(key);
    Ok(credential)
}

fn decode_data(data: &str, field: &'static str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data.trim())
        .map_err(|source| ClientError::Config(k8_config::ConfigError::Base64 { field, source }))
}
