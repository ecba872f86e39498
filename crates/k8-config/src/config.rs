use std::env;
use std::fs::read;
use std::fs::read_to_string;
use std::path::Path;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dirs::home_dir;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::ConfigError;

pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub cluster: ClusterDetail,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterDetail {
    pub insecure_skip_tls_verify: Option<bool>,
    pub certificate_authority: Option<String>,
    pub certificate_authority_data: Option<String>,
    pub server: String,
}

impl ClusterDetail {
    /// PEM bytes of the certificate authority, inline data wins over the file
    pub fn ca(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        if let Some(data) = &self.certificate_authority_data {
            return STANDARD
                .decode(data.trim())
                .map(Some)
                .map_err(|source| ConfigError::Base64 {
                    field: "certificate-authority-data",
                    source,
                });
        }

        match &self.certificate_authority {
            Some(path) => read(path).map(Some).map_err(|err| ConfigError::io(path, err)),
            None => Ok(None),
        }
    }

    pub fn insecure(&self) -> bool {
        self.insecure_skip_tls_verify.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub name: String,
    pub context: ContextDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDetail {
    pub cluster: String,
    pub user: String,
    pub namespace: Option<String>,
}

impl ContextDetail {
    pub fn namespace(&self) -> &str {
        match &self.namespace {
            Some(nm) => nm,
            None => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub user: UserDetail,
}

/// Authentication entries of a kubeconfig user.
///
/// More than one entry may be set; the client picks one by priority.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserDetail {
    pub client_certificate: Option<String>,
    pub client_certificate_data: Option<String>,
    pub client_key: Option<String>,
    pub client_key_data: Option<String>,
    pub token: Option<String>,
    #[serde(rename = "tokenFile")]
    pub token_file: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub exec: Option<ExecConfig>,
}

impl std::fmt::Debug for UserDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserDetail")
            .field("client_certificate", &self.client_certificate)
            .field("client_certificate_data", &self.client_certificate_data.is_some())
            .field("client_key", &self.client_key)
            .field("client_key_data", &self.client_key_data.is_some())
            .field("token", &self.token.is_some())
            .field("token_file", &self.token_file)
            .field("username", &self.username)
            .field("password", &self.password.is_some())
            .field("exec", &self.exec)
            .finish()
    }
}

/// External credential helper
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecConfig {
    pub api_version: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<ExecEnvVar>,
    pub install_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecEnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KubeConfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub clusters: Vec<Cluster>,
    pub contexts: Vec<Context>,
    pub current_context: String,
    pub kind: String,
    pub users: Vec<User>,
}

impl KubeConfig {
    /// read from $KUBECONFIG (first entry) or from home directory
    pub fn from_home() -> Result<Self, ConfigError> {
        Self::from_file(Self::default_path()?)
    }

    pub fn default_path() -> Result<PathBuf, ConfigError> {
        if let Some(paths) = env::var_os(KUBECONFIG_ENV) {
            if let Some(first) = env::split_paths(&paths).next() {
                return Ok(first);
            }
        }

        let home_dir = home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home_dir.join(".kube").join("config"))
    }

    pub fn from_file<T: AsRef<Path>>(path: T) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        debug!(?path_ref, "loading kubeconfig");
        let file_str = read_to_string(path_ref).map_err(|err| ConfigError::io(path_ref, err))?;
        Self::from_yaml(&file_str)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn current_context(&self) -> Option<&Context> {
        self.contexts.iter().find(|c| c.name == self.current_context)
    }

    pub fn current_cluster(&self) -> Option<&Cluster> {
        let ctx = self.current_context()?;
        self.clusters.iter().find(|c| c.name == ctx.context.cluster)
    }

    pub fn current_user(&self) -> Option<&User> {
        let ctx = self.current_context()?;
        self.users.iter().find(|c| c.name == ctx.context.user)
    }
}

/// kubeconfig resolved to the current context
#[derive(Debug, Clone, PartialEq)]
pub struct KubeContext {
    pub namespace: String,
    pub api_path: String,
    pub cluster: ClusterDetail,
    pub user: UserDetail,
}

impl TryFrom<KubeConfig> for KubeContext {
    type Error = ConfigError;

    fn try_from(config: KubeConfig) -> Result<Self, Self::Error> {
        let ctx = config
            .current_context()
            .ok_or(ConfigError::NoCurrentContext)?;
        let cluster = config
            .current_cluster()
            .ok_or_else(|| ConfigError::ClusterNotFound(ctx.context.cluster.clone()))?;
        let user = config
            .current_user()
            .ok_or_else(|| ConfigError::UserNotFound(ctx.context.user.clone()))?;

        Ok(Self {
            namespace: ctx.context.namespace().to_owned(),
            api_path: cluster.cluster.server.trim_end_matches('/').to_owned(),
            cluster: cluster.cluster.clone(),
            user: user.user.clone(),
        })
    }
}
