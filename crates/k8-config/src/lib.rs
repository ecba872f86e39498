mod config;
mod error;
mod pod;

pub use config::*;
pub use error::ConfigError;
pub use pod::PodConfig;
pub use pod::SERVICE_ACCOUNT_DIR;

use tracing::debug;

/// Where the client gets its cluster and user settings from
#[derive(Debug, Clone, PartialEq)]
pub enum K8Config {
    Pod(PodConfig),
    KubeConfig(KubeContext),
}

impl K8Config {
    /// in-cluster service account if mounted, kubeconfig otherwise
    pub fn load() -> Result<Self, ConfigError> {
        if PodConfig::is_available() {
            debug!("service account found, using pod config");
            Ok(Self::Pod(PodConfig::load()?))
        } else {
            debug!("no service account, using kubeconfig");
            let config = KubeConfig::from_home()?;
            Ok(Self::KubeConfig(KubeContext::try_from(config)?))
        }
    }

    pub fn api_path(&self) -> &str {
        match self {
            Self::Pod(pod) => &pod.api_path,
            Self::KubeConfig(ctx) => &ctx.api_path,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Self::Pod(pod) => &pod.namespace,
            Self::KubeConfig(ctx) => &ctx.namespace,
        }
    }

    /// user entry; a pod authenticates with its projected service account token
    pub fn user(&self) -> UserDetail {
        match self {
            Self::Pod(pod) => UserDetail {
                token_file: Some(pod.token_file.to_string_lossy().into_owned()),
                ..Default::default()
            },
            Self::KubeConfig(ctx) => ctx.user.clone(),
        }
    }
}
