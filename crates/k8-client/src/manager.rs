//!
//! # Connection manager
//!
//! Owns the live credential and connection pool and dispatches every request
//! to the API server. Reloads swap both under a single lock; requests already
//! holding a connection from the previous pool finish on it.
//!
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_lock::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use http::Method;
use http::StatusCode;
use http::header::ACCEPT;
use http::header::CONTENT_TYPE;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use k8_config::ExecConfig;
use k8_config::K8Config;
use k8_config::UserDetail;

use crate::AuthStrategy;
use crate::ClientError;
use crate::ConnectionPool;
use crate::Credential;
use crate::CredentialResolver;
use crate::PoolConfig;
use crate::PooledConnection;
use crate::Result;
use crate::TlsConfig;
use crate::auth::read_token_file;
use crate::auth::select_strategy;
use crate::tls::is_tls_error;
use crate::tls::requires_tls;

pub const JSON_CONTENT_TYPE: &str = "application/json";

// a retired pool is replaced by the time we look again, a few attempts is plenty
const MAX_CHECKOUT_ATTEMPTS: usize = 3;

/// Something that can refresh credentials and rebuild connections on demand
#[async_trait]
pub trait TokenReloader: Send + Sync {
    /// returns the generation now live
    async fn reload(&self) -> Result<u64>;
}

/// Where a fresh token comes from on reload
#[derive(Debug, Clone)]
enum TokenSource {
    Static,
    File(PathBuf),
    Exec(ExecConfig),
}

impl TokenSource {
    fn for_user(user: &UserDetail) -> Self {
        match (select_strategy(user), &user.exec, &user.token_file) {
            (Some(AuthStrategy::Exec), Some(exec), _) => Self::Exec(exec.clone()),
            (Some(AuthStrategy::Token), _, Some(path)) => Self::File(PathBuf::from(path)),
            _ => Self::Static,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RequestTimeout {
    Default,
    After(Duration),
    Never,
}

struct LiveState {
    credential: Arc<Credential>,
    pool: Arc<ConnectionPool>,
    generation: u64,
}

/// A single API call
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Bytes>,
    content_type: String,
    check_status: bool,
    timeout: RequestTimeout,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: vec![],
            body: None,
            content_type: JSON_CONTENT_TYPE.to_owned(),
            check_status: true,
            timeout: RequestTimeout::Default,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(mut self, pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.query.extend(pairs);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self.content_type = content_type.into();
        self
    }

    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.body(bytes, JSON_CONTENT_TYPE))
    }

    /// hand non-success statuses back instead of mapping them to errors
    pub fn unchecked(mut self) -> Self {
        self.check_status = false;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = RequestTimeout::After(timeout);
        self
    }

    /// for streams the server closes on its own schedule
    pub fn without_timeout(mut self) -> Self {
        self.timeout = RequestTimeout::Never;
        self
    }
}

/// Fully read response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Response whose body is read incrementally.
///
/// Keeps its pooled connection checked out until dropped.
#[derive(Debug)]
pub struct StreamResponse {
    path: String,
    response: reqwest::Response,
    _conn: PooledConnection,
}

impl StreamResponse {
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// next piece of the body, `None` once the server has finished
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.response
            .chunk()
            .await
            .map_err(|source| ClientError::Transport {
                path: self.path.clone(),
                source,
            })
    }

    pub async fn text(self) -> Result<String> {
        let path = self.path;
        self.response
            .text()
            .await
            .map_err(|source| ClientError::Transport { path, source })
    }

    /// error for a non-success response, the body is best effort
    pub(crate) async fn into_status_error(self) -> ClientError {
        let path = self.path.clone();
        let status = self.status();
        let body = match self.text().await {
            Ok(body) => body,
            Err(err) => {
                debug!(%path, %status, %err, "unable to read error body");
                String::new()
            }
        };
        ClientError::from_status(&path, status, body.clone())
            .unwrap_or(ClientError::UnexpectedResponse { path, status, body })
    }
}

/// Builder for [`ConnectionManager`]
pub struct ConnectionManagerBuilder {
    api_path: String,
    tls: Option<TlsConfig>,
    pool_config: PoolConfig,
    resolver: CredentialResolver,
    credential: Option<Credential>,
    user: Option<UserDetail>,
}

impl ConnectionManagerBuilder {
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    pub fn resolver(mut self, resolver: CredentialResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// fixed credential, reload only rebuilds the pool
    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// resolve the credential from a configured user entry
    pub fn user(mut self, user: UserDetail) -> Self {
        self.user = Some(user);
        self
    }

    pub async fn build(self) -> Result<ConnectionManager> {
        let api_path = self.api_path.trim_end_matches('/').to_owned();
        if !(api_path.starts_with("https://") || api_path.starts_with("http://")) {
            return Err(ClientError::InvalidRequest(format!(
                "api server address must be http or https: {api_path}"
            )));
        }

        let (credential, token_source) = match (self.credential, &self.user) {
            (Some(credential), _) => (credential, TokenSource::Static),
            (None, Some(user)) => (
                self.resolver.resolve(user).await?,
                TokenSource::for_user(user),
            ),
            (None, None) => (Credential::default(), TokenSource::Static),
        };

        let tls = match self.tls {
            Some(tls) => tls,
            None => {
                if requires_tls(&api_path) {
                    debug!("no tls config supplied, using default trust roots");
                }
                TlsConfig::default()
            }
        };

        let pool = ConnectionPool::build(0, &api_path, &self.pool_config, &tls, &credential)?;
        debug!(%api_path, mode = ?credential.mode(), ?token_source, "connection manager ready");

        Ok(ConnectionManager {
            api_path,
            tls,
            pool_config: self.pool_config,
            resolver: self.resolver,
            token_source,
            state: Mutex::new(LiveState {
                credential: Arc::new(credential),
                pool: Arc::new(pool),
                generation: 0,
            }),
            reload: Mutex::new(()),
        })
    }
}

/// Authenticated, pooled access to one API server
pub struct ConnectionManager {
    api_path: String,
    tls: TlsConfig,
    pool_config: PoolConfig,
    resolver: CredentialResolver,
    token_source: TokenSource,
    state: Mutex<LiveState>,
    /// serializes reloads; requests only take `state`
    reload: Mutex<()>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("api_path", &self.api_path)
            .field("tls", &self.tls)
            .field("token_source", &self.token_source)
            .finish()
    }
}

impl ConnectionManager {
    pub fn builder(api_path: impl Into<String>) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            api_path: api_path.into(),
            tls: None,
            pool_config: PoolConfig::default(),
            resolver: CredentialResolver::default(),
            credential: None,
            user: None,
        }
    }

    pub async fn from_config(
        config: &K8Config,
        resolver: CredentialResolver,
        pool_config: PoolConfig,
    ) -> Result<Self> {
        Self::builder(config.api_path())
            .tls(TlsConfig::from_k8_config(config)?)
            .pool_config(pool_config)
            .resolver(resolver)
            .user(config.user())
            .build()
            .await
    }

    pub fn api_path(&self) -> &str {
        &self.api_path
    }

    pub fn pool_config(&self) -> &PoolConfig {
        &self.pool_config
    }

    /// token file backing the credential, if any
    pub fn token_file(&self) -> Option<&Path> {
        match &self.token_source {
            TokenSource::File(path) => Some(path),
            _ => None,
        }
    }

    pub async fn current_token(&self) -> Option<String> {
        self.state.lock().await.credential.token.clone()
    }

    pub async fn credential(&self) -> Arc<Credential> {
        self.state.lock().await.credential.clone()
    }

    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }

    /// re-read the token source and swap in a new pool
    #[instrument(skip(self))]
    pub async fn reload_token_and_pool(&self) -> Result<u64> {
        let _reload = self.reload.lock().await;
        self.rebuild().await
    }

    /// reload only if nobody has since `seen`
    pub async fn reload_if_generation(&self, seen: u64) -> Result<u64> {
        let _reload = self.reload.lock().await;
        let live = self.generation().await;
        if live != seen {
            debug!(seen, live, "already reloaded");
            return Ok(live);
        }
        self.rebuild().await
    }

    /// caller holds `reload`, so the generation cannot move underneath
    async fn rebuild(&self) -> Result<u64> {
        let (current, generation) = {
            let state = self.state.lock().await;
            (state.credential.clone(), state.generation + 1)
        };

        // resolved without holding `state`, requests keep using the live pool meanwhile
        let credential = match &self.token_source {
            TokenSource::Static => current,
            TokenSource::File(path) => {
                let mut credential = (*current).clone();
                credential.token = Some(read_token_file(path).await?);
                Arc::new(credential)
            }
            TokenSource::Exec(exec) => Arc::new(self.resolver.resolve_exec(exec).await?),
        };

        let pool = Arc::new(ConnectionPool::build(
            generation,
            &self.api_path,
            &self.pool_config,
            &self.tls,
            &credential,
        )?);

        let old = {
            let mut state = self.state.lock().await;
            state.credential = credential;
            state.generation = generation;
            std::mem::replace(&mut state.pool, pool)
        };
        old.retire();

        info!(generation, "reloaded token and connection pool");
        Ok(generation)
    }

    /// check out a connection from the live pool together with the credential
    /// that was live at the same instant
    async fn checkout(&self) -> Result<(PooledConnection, Arc<Credential>)> {
        let mut attempts = 0;
        loop {
            let (pool, credential) = {
                let state = self.state.lock().await;
                (state.pool.clone(), state.credential.clone())
            };
            match pool.checkout().await {
                Ok(conn) => return Ok((conn, credential)),
                Err(ClientError::PoolClosed) if attempts < MAX_CHECKOUT_ATTEMPTS => {
                    attempts += 1;
                    trace!(generation = pool.generation(), "pool retired, moving to live pool");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn prepare(
        &self,
        conn: &PooledConnection,
        credential: &Credential,
        request: &ApiRequest,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.api_path, request.path);
        let mut builder = conn
            .client()
            .request(request.method.clone(), url)
            .header(ACCEPT, JSON_CONTENT_TYPE);

        match request.timeout {
            RequestTimeout::Default => builder = builder.timeout(self.pool_config.request_timeout),
            RequestTimeout::After(timeout) => builder = builder.timeout(timeout),
            RequestTimeout::Never => {}
        }

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        if let Some(token) = &credential.token {
            builder = builder.bearer_auth(token);
        } else if let (Some(username), Some(password)) = (&credential.username, &credential.password) {
            builder = builder.basic_auth(username, Some(password));
        }

        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, request.content_type.as_str())
                .body(body.clone());
        }

        builder
    }

    /// send the request; a GET failing in the TLS layer is retried once after a reload
    async fn execute(&self, request: &ApiRequest) -> Result<(reqwest::Response, PooledConnection)> {
        let mut retried = false;
        loop {
            let (conn, credential) = self.checkout().await?;
            let generation = conn.generation();

            match self.prepare(&conn, &credential, request).send().await {
                Ok(response) => {
                    trace!(status = %response.status(), generation, "response");
                    return Ok((response, conn));
                }
                Err(err) if request.method == Method::GET && !retried && is_tls_error(&err) => {
                    warn!(generation, %err, "tls failure, reloading credentials and retrying");
                    drop(conn);
                    self.reload_if_generation(generation).await?;
                    retried = true;
                }
                Err(source) => {
                    return Err(ClientError::Transport {
                        path: request.path.clone(),
                        source,
                    });
                }
            }
        }
    }

    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let (response, conn) = self.execute(&request).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|source| ClientError::Transport {
                path: request.path.clone(),
                source,
            })?;
        drop(conn);

        debug!(%status, len = body.len(), "request complete");
        if request.check_status {
            let text = String::from_utf8_lossy(&body).into_owned();
            if let Some(err) = ClientError::from_status(&request.path, status, text) {
                return Err(err);
            }
        }

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    /// like [`send`](Self::send) but leaves the body on the wire
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn stream(&self, request: ApiRequest) -> Result<StreamResponse> {
        let (response, conn) = self.execute(&request).await?;
        let status = response.status();
        let stream = StreamResponse {
            path: request.path.clone(),
            response,
            _conn: conn,
        };

        if !request.check_status || status.is_success() || status.is_redirection() {
            return Ok(stream);
        }

        Err(stream.into_status_error().await)
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.send(ApiRequest::get(path)).await
    }

    pub async fn post(&self, path: &str, body: impl Into<Bytes>, content_type: &str) -> Result<ApiResponse> {
        self.send(ApiRequest::new(Method::POST, path).body(body, content_type))
            .await
    }

    pub async fn put(&self, path: &str, body: impl Into<Bytes>, content_type: &str) -> Result<ApiResponse> {
        self.send(ApiRequest::new(Method::PUT, path).body(body, content_type))
            .await
    }

    pub async fn patch(&self, path: &str, body: impl Into<Bytes>, content_type: &str) -> Result<ApiResponse> {
        self.send(ApiRequest::new(Method::PATCH, path).body(body, content_type))
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.send(ApiRequest::new(Method::DELETE, path)).await
    }
}

#[async_trait]
impl TokenReloader for ConnectionManager {
    async fn reload(&self) -> Result<u64> {
        self.reload_token_and_pool().await
    }
}

#[cfg(test)]
mod test {

    use k8_config::ExecConfig;
    use k8_config::UserDetail;

    use super::ApiRequest;
    use super::ConnectionManager;
    use super::TokenSource;
    use crate::Credential;

    #[test]
    fn test_token_source_follows_strategy() {
        let user = UserDetail {
            token: Some("t".to_owned()),
            token_file: Some("/var/run/token".to_owned()),
            ..Default::default()
        };
        assert!(matches!(TokenSource::for_user(&user), TokenSource::File(_)));

        let user = UserDetail {
            token_file: Some("/var/run/token".to_owned()),
            exec: Some(ExecConfig::default()),
            ..Default::default()
        };
        assert!(matches!(TokenSource::for_user(&user), TokenSource::Exec(_)));

        let user = UserDetail {
            token: Some("t".to_owned()),
            ..Default::default()
        };
        assert!(matches!(TokenSource::for_user(&user), TokenSource::Static));
    }

    #[test]
    fn test_request_builder() {
        let req = ApiRequest::get("/api/v1/pods")
            .query(vec![("limit".to_owned(), "5".to_owned())])
            .unchecked();
        assert_eq!(req.path(), "/api/v1/pods");
        assert!(!req.check_status);
        assert_eq!(req.query.len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_unknown_scheme() {
        let err = ConnectionManager::builder("ftp://server")
            .build()
            .await
            .expect_err("bad scheme");
        assert!(err.to_string().contains("ftp://server"));
    }

    #[tokio::test]
    async fn test_static_reload_bumps_generation() {
        let manager = ConnectionManager::builder("http://127.0.0.1:1/")
            .credential(Credential::token("abc"))
            .build()
            .await
            .expect("manager");
        assert_eq!(manager.api_path(), "http://127.0.0.1:1");
        assert_eq!(manager.generation().await, 0);

        assert_eq!(manager.reload_token_and_pool().await.expect("reload"), 1);
        assert_eq!(manager.current_token().await.as_deref(), Some("abc"));

        // stale generation is a no-op
        assert_eq!(manager.reload_if_generation(0).await.expect("noop"), 1);
        assert_eq!(manager.reload_if_generation(1).await.expect("reload"), 2);
    }
}
