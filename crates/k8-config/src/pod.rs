use std::env;
use std::fs::read;
use std::fs::read_to_string;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;

use crate::ConfigError;

pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const TOKEN_FILE: &str = "token";
const CA_FILE: &str = "ca.crt";
const NAMESPACE_FILE: &str = "namespace";

const HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
const PORT_ENV: &str = "KUBERNETES_SERVICE_PORT";

/// Configuration available to a pod running inside the cluster
#[derive(Debug, Clone, PartialEq)]
pub struct PodConfig {
    pub ca: Vec<u8>,
    pub namespace: String,
    pub token_file: PathBuf,
    pub api_path: String,
}

impl PodConfig {
    /// true if a service account is mounted at the default location
    pub fn is_available() -> bool {
        Path::new(SERVICE_ACCOUNT_DIR).join(TOKEN_FILE).exists()
    }

    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(SERVICE_ACCOUNT_DIR)
    }

    /// load from a mounted service account directory
    pub fn load_from<P: AsRef<Path>>(dir: P) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        debug!(?dir, "loading pod config");

        let host = env::var(HOST_ENV).map_err(|_| ConfigError::MissingEnv(HOST_ENV))?;
        let port = env::var(PORT_ENV).map_err(|_| ConfigError::MissingEnv(PORT_ENV))?;

        let ca_path = dir.join(CA_FILE);
        let ca = read(&ca_path).map_err(|err| ConfigError::io(&ca_path, err))?;

        let ns_path = dir.join(NAMESPACE_FILE);
        let namespace = read_to_string(&ns_path)
            .map_err(|err| ConfigError::io(&ns_path, err))?
            .trim()
            .to_owned();

        Ok(Self {
            ca,
            namespace,
            token_file: dir.join(TOKEN_FILE),
            api_path: api_path(&host, &port),
        })
    }
}

fn api_path(host: &str, port: &str) -> String {
    // ipv6 service hosts must be bracketed
    if host.contains(':') {
        format!("https://[{host}]:{port}")
    } else {
        format!("https://{host}:{port}")
    }
}

#[cfg(test)]
mod test {

    use super::api_path;

    #[test]
    fn test_api_path() {
        assert_eq!(api_path("10.0.0.1", "443"), "https://10.0.0.1:443");
        assert_eq!(api_path("fd00::1", "443"), "https://[fd00::1]:443");
    }
}
