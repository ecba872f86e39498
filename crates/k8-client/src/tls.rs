use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;
use std::path::Path;

use reqwest::Certificate;
use reqwest::ClientBuilder;
use reqwest::Identity;
use tracing::debug;
use tracing::warn;

use k8_config::K8Config;

use crate::ClientError;
use crate::Credential;
use crate::Result;

/// TLS material for talking to the API server
#[derive(Clone, Default)]
pub struct TlsConfig {
    ca_pem: Option<Vec<u8>>,
    insecure_skip_verify: bool,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("custom_ca", &self.ca_pem.is_some())
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .finish()
    }
}

impl TlsConfig {
    pub fn with_ca(ca_pem: Vec<u8>) -> Self {
        Self {
            ca_pem: Some(ca_pem),
            insecure_skip_verify: false,
        }
    }

    /// trust any server certificate
    pub fn insecure() -> Self {
        Self {
            ca_pem: None,
            insecure_skip_verify: true,
        }
    }

    pub fn from_k8_config(config: &K8Config) -> Result<Self> {
        match config {
            K8Config::Pod(pod) => Ok(Self::with_ca(pod.ca.clone())),
            K8Config::KubeConfig(ctx) => Ok(Self {
                ca_pem: ctx.cluster.ca()?,
                insecure_skip_verify: ctx.cluster.insecure(),
            }),
        }
    }

    /// configure the transport; plain http servers get no TLS setup at all
    pub(crate) fn apply(
        &self,
        mut builder: ClientBuilder,
        api_path: &str,
        credential: &Credential,
    ) -> Result<ClientBuilder> {
        if !requires_tls(api_path) {
            debug!(api_path, "plain http endpoint, skipping tls");
            return Ok(builder);
        }

        builder = builder.use_rustls_tls();

        match &self.ca_pem {
            Some(pem) => {
                let certs = Certificate::from_pem_bundle(pem)
                    .map_err(|err| ClientError::Tls(format!("invalid ca bundle: {err}")))?;
                if certs.is_empty() {
                    return Err(ClientError::Tls("no ca certificate found".to_owned()));
                }
                debug!(count = certs.len(), "trusting cluster ca");
                for cert in certs {
                    builder = builder.add_root_certificate(cert);
                }
            }
            None => debug!("no cluster ca, using default trust roots"),
        }

        if self.insecure_skip_verify {
            warn!("server certificate verification disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        if let (Some(cert), Some(key)) = (&credential.client_certificate, &credential.client_key) {
            builder = builder.identity(retrieve_identity(cert, key)?);
            debug!("using client certificate");
        }

        Ok(builder)
    }
}

pub fn requires_tls(api_path: &str) -> bool {
    !api_path.starts_with("http://")
}

fn retrieve_identity(cert: &Path, key: &Path) -> Result<Identity> {
    let mut pem = std::fs::read(key)?;
    pem.push(b'\n');
    pem.extend(std::fs::read(cert)?);
    Identity::from_pem(&pem).map_err(|err| ClientError::Tls(format!("invalid client certificate: {err}")))
}

/// true if the error chain was caused by the TLS layer
pub fn is_tls_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if err.downcast_ref::<rustls::Error>().is_some() {
            return true;
        }
        // io::Error::source skips the error it wraps, descend into it directly
        current = match err.downcast_ref::<IoError>() {
            Some(io) => io.get_ref().map(|inner| inner as &(dyn StdError + 'static)),
            None => err.source(),
        };
    }
    false
}
