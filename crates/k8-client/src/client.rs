use std::fmt::Debug;
use std::sync::Arc;

use http::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use k8_config::K8Config;

use crate::ApiRequest;
use crate::ApiResource;
use crate::ApplyOptions;
use crate::ClientError;
use crate::ConnectionManager;
use crate::CredentialResolver;
use crate::K8List;
use crate::K8Status;
use crate::ListOptions;
use crate::PatchMergeType;
use crate::PoolConfig;
use crate::Result;
use crate::TokenRotationWatcher;
use crate::WatchOptions;
use crate::WatchStream;

/// K8 cluster accessible thru API
#[derive(Debug)]
pub struct K8Client {
    manager: Arc<ConnectionManager>,
    watcher: Option<TokenRotationWatcher>,
    namespace: String,
}

impl K8Client {
    /// load using default k8 config
    pub async fn try_default() -> Result<Self> {
        let config = K8Config::load()?;
        Self::new(config).await
    }

    pub async fn new(config: K8Config) -> Result<Self> {
        Self::with_options(config, CredentialResolver::with_default_cache(), PoolConfig::default()).await
    }

    pub async fn with_options(
        config: K8Config,
        resolver: CredentialResolver,
        pool_config: PoolConfig,
    ) -> Result<Self> {
        let manager = ConnectionManager::from_config(&config, resolver, pool_config).await?;
        Ok(Self::from_manager(Arc::new(manager), config.namespace()))
    }

    /// wrap an existing manager; a token file behind it is watched for rotation
    pub fn from_manager(manager: Arc<ConnectionManager>, namespace: impl Into<String>) -> Self {
        let watcher = manager.token_file().and_then(|token_file| {
            match TokenRotationWatcher::start(token_file, manager.clone()) {
                Ok(watcher) => Some(watcher),
                Err(err) => {
                    warn!(%err, ?token_file, "token rotation not followed, using current credentials");
                    None
                }
            }
        });

        Self {
            manager,
            watcher,
            namespace: namespace.into(),
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// namespace of the current context
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_watching_token(&self) -> bool {
        self.watcher.as_ref().is_some_and(TokenRotationWatcher::is_running)
    }

    /// reload credentials and connections now
    pub async fn reload(&self) -> Result<u64> {
        self.manager.reload_token_and_pool().await
    }

    /// retrieval a single item
    pub async fn retrieve_item<T>(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let path = resource.item_path(namespace, name);
        debug!(%path, "retrieving item");
        self.manager.get(&path).await?.json()
    }

    /// one page of items
    pub async fn retrieve_items<T>(
        &self,
        resource: &ApiResource,
        namespace: &str,
        options: &ListOptions,
    ) -> Result<K8List<T>>
    where
        T: DeserializeOwned,
    {
        let path = resource.items_path(namespace);
        debug!(%path, ?options, "retrieving items");
        let request = ApiRequest::get(path).query(options.query_pairs());
        self.manager.send(request).await?.json()
    }

    /// every item across all pages; the returned list carries the resource version of
    /// the last page
    pub async fn list_all<T>(
        &self,
        resource: &ApiResource,
        namespace: &str,
        options: ListOptions,
    ) -> Result<K8List<T>>
    where
        T: DeserializeOwned,
    {
        let mut options = ListOptions {
            continu: None,
            watch: None,
            ..options
        };
        let mut items = vec![];
        let mut pages = 0;

        loop {
            let page: K8List<T> = self.retrieve_items(resource, namespace, &options).await?;
            pages += 1;
            items.extend(page.items);
            let next = page.metadata.continu.clone().filter(|c| !c.is_empty());
            trace!(pages, count = items.len(), more = next.is_some(), "list page");

            match next {
                Some(token) => options.continu = Some(token),
                None => {
                    debug!(pages, count = items.len(), "listed all items");
                    return Ok(K8List {
                        api_version: page.api_version,
                        kind: page.kind,
                        metadata: page.metadata,
                        items,
                    });
                }
            }
        }
    }

    /// create new object
    pub async fn create_item<T, R>(&self, resource: &ApiResource, namespace: &str, value: &T) -> Result<R>
    where
        T: Serialize + Debug,
        R: DeserializeOwned,
    {
        let path = resource.items_path(namespace);
        debug!(%path, "creating");
        trace!(?value, "create");
        let request = ApiRequest::new(Method::POST, path).json(value)?;
        self.manager.send(request).await?.json()
    }

    /// replace existing object
    pub async fn replace_item<T, R>(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        value: &T,
    ) -> Result<R>
    where
        T: Serialize + Debug,
        R: DeserializeOwned,
    {
        let path = resource.item_path(namespace, name);
        debug!(%path, "replacing");
        trace!(?value, "replace");
        let request = ApiRequest::new(Method::PUT, path).json(value)?;
        self.manager.send(request).await?.json()
    }

    /// patch existing object
    pub async fn patch_item<R>(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Value,
        merge_type: PatchMergeType,
    ) -> Result<R>
    where
        R: DeserializeOwned,
    {
        if merge_type == PatchMergeType::Apply {
            return Err(ClientError::InvalidRequest(
                "server side apply needs a field manager, use apply_item".to_owned(),
            ));
        }

        let path = resource.item_path(namespace, name);
        debug!(%path, ?merge_type, "patching");
        trace!(%patch, "patch");
        let request = ApiRequest::new(Method::PATCH, path)
            .body(serde_json::to_vec(patch)?, merge_type.content_type());
        self.manager.send(request).await?.json()
    }

    /// server side apply
    pub async fn apply_item<T, R>(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        value: &T,
        options: &ApplyOptions,
    ) -> Result<R>
    where
        T: Serialize + Debug,
        R: DeserializeOwned,
    {
        if options.field_manager.is_empty() {
            return Err(ClientError::InvalidRequest("field manager must not be empty".to_owned()));
        }

        let path = resource.item_path(namespace, name);
        debug!(%path, field_manager = %options.field_manager, force = options.force, "applying");
        trace!(?value, "apply");
        // json is valid yaml
        let request = ApiRequest::new(Method::PATCH, path)
            .query(options.query_pairs())
            .body(serde_json::to_vec(value)?, PatchMergeType::Apply.content_type());
        self.manager.send(request).await?.json()
    }

    pub async fn delete_item(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<K8Status> {
        let path = resource.item_path(namespace, name);
        debug!(%path, "deleting");
        self.manager.delete(&path).await?.json()
    }

    /// watch from the given options, reconnecting as needed
    pub fn watch<T>(&self, resource: &ApiResource, namespace: &str, options: WatchOptions) -> WatchStream<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        WatchStream::new(self.manager.clone(), resource.items_path(namespace), options)
    }

    /// stream items since resource versions
    pub fn watch_stream_since<T>(
        &self,
        resource: &ApiResource,
        namespace: &str,
        resource_version: Option<String>,
    ) -> WatchStream<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let options = WatchOptions {
            resource_version,
            ..Default::default()
        };
        self.watch(resource, namespace, options)
    }

    /// current items plus a watch picking up right after them
    pub async fn watch_from_now<T>(
        &self,
        resource: &ApiResource,
        namespace: &str,
        options: WatchOptions,
    ) -> Result<(K8List<T>, WatchStream<T>)>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let list_options = ListOptions {
            label_selector: options.label_selector.clone(),
            field_selector: options.field_selector.clone(),
            ..Default::default()
        };
        let list: K8List<T> = self.list_all(resource, namespace, list_options).await?;
        let options = WatchOptions {
            resource_version: list.metadata.resource_version.clone(),
            ..options
        };
        debug!(resource_version = ?options.resource_version, "watching from list");
        let stream = self.watch(resource, namespace, options);
        Ok((list, stream))
    }

    /// stop following token rotation
    pub async fn close(mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }
        debug!("client closed");
    }
}
