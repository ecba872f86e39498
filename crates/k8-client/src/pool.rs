use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::trace;

use crate::ClientError;
use crate::Credential;
use crate::Result;
use crate::TlsConfig;

pub const DEFAULT_POOL_SIZE: usize = 16;
pub const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    pub checkout_timeout: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_SIZE,
            checkout_timeout: DEFAULT_CHECKOUT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Bounded set of keep-alive connections to one API server.
///
/// At most `max_size` requests hold a connection at any time. Once retired, the
/// pool waits for every checked out connection to come back and then closes.
#[derive(Debug)]
pub struct ConnectionPool {
    generation: u64,
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    config: PoolConfig,
    retired: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn build(
        generation: u64,
        api_path: &str,
        config: &PoolConfig,
        tls: &TlsConfig,
        credential: &Credential,
    ) -> Result<Self> {
        let max_size = config.max_size.max(1);
        let builder = reqwest::Client::builder()
            .pool_max_idle_per_host(max_size)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .connect_timeout(config.connect_timeout)
            .tcp_keepalive(IDLE_TIMEOUT);
        let client = tls
            .apply(builder, api_path, credential)?
            .build()
            .map_err(|err| ClientError::Tls(format!("unable to build http client: {err}")))?;

        debug!(generation, max_size, "built connection pool");
        Ok(Self {
            generation,
            client,
            permits: Arc::new(Semaphore::new(max_size)),
            config: PoolConfig {
                max_size,
                ..config.clone()
            },
            retired: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// no longer the live pool, new checkouts are refused
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// retired and every connection has been returned
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// connections currently checked out
    pub fn in_use(&self) -> usize {
        self.config.max_size - self.permits.available_permits()
    }

    /// wait for a free connection, up to the checkout timeout
    pub async fn checkout(&self) -> Result<PooledConnection> {
        if self.is_retired() {
            return Err(ClientError::PoolClosed);
        }

        let acquire = self.permits.clone().acquire_owned();
        let permit = match timeout(self.config.checkout_timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ClientError::PoolClosed),
            Err(_) => return Err(ClientError::PoolExhausted(self.config.checkout_timeout)),
        };

        // pool may have been retired while we were queued
        if self.is_retired() {
            return Err(ClientError::PoolClosed);
        }

        trace!(generation = self.generation, "checked out connection");
        Ok(PooledConnection {
            client: self.client.clone(),
            generation: self.generation,
            _permit: permit,
        })
    }

    /// stop handing out connections once the ones already out are returned
    pub(crate) fn retire(self: Arc<Self>) {
        let generation = self.generation;
        let max_size = self.config.max_size as u32;
        self.retired.store(true, Ordering::SeqCst);
        debug!(generation, in_use = self.in_use(), "retiring connection pool");

        tokio::spawn(async move {
            match self.permits.clone().acquire_many_owned(max_size).await {
                Ok(_all) => {
                    self.closed.store(true, Ordering::SeqCst);
                    self.permits.close();
                    info!(generation, "connection pool drained and closed");
                }
                Err(_) => debug!(generation, "connection pool already closed"),
            }
        });
    }
}

/// A connection checked out of a [`ConnectionPool`], returned on drop
#[derive(Debug)]
pub struct PooledConnection {
    client: reqwest::Client,
    generation: u64,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod test {

    use std::sync::Arc;
    use std::time::Duration;

    use super::ConnectionPool;
    use super::PoolConfig;
    use crate::ClientError;
    use crate::Credential;
    use crate::TlsConfig;

    fn pool(max_size: usize) -> Arc<ConnectionPool> {
        let config = PoolConfig {
            max_size,
            checkout_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        Arc::new(
            ConnectionPool::build(
                0,
                "http://127.0.0.1:1",
                &config,
                &TlsConfig::default(),
                &Credential::default(),
            )
            .expect("pool"),
        )
    }

    #[tokio::test]
    async fn test_checkout_is_bounded() {
        let pool = pool(2);
        let first = pool.checkout().await.expect("first");
        let _second = pool.checkout().await.expect("second");
        assert_eq!(pool.in_use(), 2);

        let err = pool.checkout().await.expect_err("exhausted");
        assert!(matches!(err, ClientError::PoolExhausted(_)));

        drop(first);
        pool.checkout().await.expect("returned connection is reused");
    }

    #[tokio::test]
    async fn test_retired_pool_drains_then_closes() {
        let pool = pool(2);
        let held = pool.checkout().await.expect("held");

        pool.clone().retire();
        assert!(matches!(pool.checkout().await, Err(ClientError::PoolClosed)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pool.is_closed(), "in-flight connection keeps pool open");

        drop(held);
        for _ in 0..50 {
            if pool.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(pool.is_closed());
    }
}
