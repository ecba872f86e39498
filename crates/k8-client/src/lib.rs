mod auth;
mod cache;
mod client;
mod credential;
mod error;
mod manager;
mod meta;
mod options;
mod pool;
mod rotation;
mod tls;
mod uri;
mod watch;

pub use auth::AuthStrategy;
pub use auth::CredentialResolver;
pub use auth::DEFAULT_EXEC_API_VERSION;
pub use auth::ExecCredential;
pub use auth::ExecCredentialStatus;
pub use auth::STRATEGY_ORDER;
pub use auth::read_token_file;
pub use auth::select_strategy;
pub use cache::CredentialCache;
pub use cache::key_for;
pub use client::K8Client;
pub use credential::AuthMode;
pub use credential::Credential;
pub use error::ClientError;
pub use error::ErrorKind;
pub use error::Result;
pub use manager::ApiRequest;
pub use manager::ApiResponse;
pub use manager::ConnectionManager;
pub use manager::ConnectionManagerBuilder;
pub use manager::JSON_CONTENT_TYPE;
pub use manager::StreamResponse;
pub use manager::TokenReloader;
pub use meta::K8List;
pub use meta::K8Status;
pub use meta::K8Watch;
pub use meta::ListMeta;
pub use meta::ObjectMeta;
pub use options::ApplyOptions;
pub use options::ListOptions;
pub use options::PatchMergeType;
pub use pool::ConnectionPool;
pub use pool::DEFAULT_CHECKOUT_TIMEOUT;
pub use pool::DEFAULT_CONNECT_TIMEOUT;
pub use pool::DEFAULT_POOL_SIZE;
pub use pool::DEFAULT_REQUEST_TIMEOUT;
pub use pool::PoolConfig;
pub use pool::PooledConnection;
pub use rotation::ChangeEvent;
pub use rotation::ChangeKind;
pub use rotation::ChangeSource;
pub use rotation::DEFAULT_POLL_INTERVAL;
pub use rotation::PollingSource;
pub use rotation::ROTATION_MARKER;
pub use rotation::TokenRotationWatcher;
pub use rotation::is_rotation;
pub use rotation::native_source;
pub use tls::TlsConfig;
pub use tls::is_tls_error;
pub use uri::ApiResource;
pub use watch::DEFAULT_BACKOFF_CAP;
pub use watch::DEFAULT_BACKOFF_FLOOR;
pub use watch::GONE_CURSOR;
pub use watch::RetryState;
pub use watch::UNBOUNDED_RETRIES;
pub use watch::WatchOptions;
pub use watch::WatchStream;

#[cfg(target_os = "linux")]
pub use rotation::InotifySource;

pub use k8_config;
