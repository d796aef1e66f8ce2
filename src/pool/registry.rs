//! Registry of exclusive pools keyed by endpoint.

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::conn_pool::{ConnectionPool, PoolShared, PoolStats};
use super::connection::PooledConnection;
use super::health::HealthChecker;
use super::{GetOptions, PoolConfig, PoolError};
use crate::endpoint::{EndpointKey, Network};
use crate::transport::{Dialer, NetDialer};

/// Lazily creates one [`ConnectionPool`] per `(network, address, protocol)`.
///
/// Pools remove themselves from the registry when they close, either through
/// [`ConnectionPool::close`] or after the inactivity timeout.
pub struct Pool {
    pools: Arc<DashMap<EndpointKey, ConnectionPool>>,
    config: PoolConfig,
    dialer: Arc<dyn Dialer>,
    checker: Option<Arc<dyn HealthChecker>>,
}

impl Pool {
    /// Registry dialing through [`NetDialer`]
    pub fn new(config: PoolConfig) -> Self {
        Self::with_dialer(config, Arc::new(NetDialer::default()))
    }

    pub fn with_dialer(config: PoolConfig, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            pools: Arc::new(DashMap::new()),
            config,
            dialer,
            checker: None,
        }
    }

    /// Use `checker` instead of the built-in health checker for new pools
    pub fn with_health_checker(mut self, checker: Arc<dyn HealthChecker>) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquire a connection to `address` over `network`, creating the
    /// endpoint's pool on first use
    pub async fn get(
        &self,
        network: &str,
        address: &str,
        protocol: &str,
        opts: &GetOptions,
    ) -> Result<PooledConnection, PoolError> {
        let network: Network = network
            .parse()
            .map_err(|e: crate::endpoint::EndpointError| PoolError::Config(e.to_string()))?;
        let key = EndpointKey::new(network, address, protocol);
        self.get_by_key(&key, opts).await
    }

    pub async fn get_by_key(
        &self,
        key: &EndpointKey,
        opts: &GetOptions,
    ) -> Result<PooledConnection, PoolError> {
        let pool = self.pool_for(key)?;
        pool.get(opts).await
    }

    /// The live pool for `key`, creating it if missing or closed
    pub fn pool_for(&self, key: &EndpointKey) -> Result<ConnectionPool, PoolError> {
        // The read guard must be gone before `entry` locks the same shard
        let existing = self.pools.get(key).map(|p| p.value().clone());
        if let Some(pool) = existing {
            if !pool.is_closed() {
                return Ok(pool);
            }
        }

        match self.pools.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    return Ok(entry.get().clone());
                }
                let pool = self.create_pool(key)?;
                entry.insert(pool.clone());
                Ok(pool)
            }
            Entry::Vacant(entry) => {
                let pool = self.create_pool(key)?;
                entry.insert(pool.clone());
                Ok(pool)
            }
        }
    }

    fn create_pool(&self, key: &EndpointKey) -> Result<ConnectionPool, PoolError> {
        let pool = match &self.checker {
            Some(checker) => ConnectionPool::with_health_checker(
                key.clone(),
                self.config.clone(),
                Arc::clone(&self.dialer),
                Arc::clone(checker),
            )?,
            None => ConnectionPool::new(key.clone(), self.config.clone(), Arc::clone(&self.dialer))?,
        };

        let pools = Arc::downgrade(&self.pools);
        let this = pool.downgrade();
        pool.set_on_destroy(Box::new(move |key| unregister(&pools, &this, key)));

        debug!(endpoint = %key, "Registered connection pool");
        Ok(pool)
    }

    /// Stats for one endpoint's pool, if it exists
    pub fn stats(&self, key: &EndpointKey) -> Option<PoolStats> {
        self.pools.get(key).map(|p| p.value().stats())
    }

    /// Close and drop the pool for `key`
    pub fn remove(&self, key: &EndpointKey) -> bool {
        match self.pools.remove(key) {
            Some((_, pool)) => {
                pool.close();
                true
            }
            None => false,
        }
    }

    /// Number of registered pools
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn keys(&self) -> Vec<EndpointKey> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }

    /// Close every pool and empty the registry
    pub fn close_all(&self) {
        let pools: Vec<ConnectionPool> = self.pools.iter().map(|e| e.value().clone()).collect();
        self.pools.clear();
        for pool in &pools {
            pool.close();
        }
        if !pools.is_empty() {
            info!(pools = pools.len(), "Closed all connection pools");
        }
    }
}

/// Remove `key` only if it still maps to the pool that closed
fn unregister(
    pools: &Weak<DashMap<EndpointKey, ConnectionPool>>,
    this: &Weak<PoolShared>,
    key: &EndpointKey,
) {
    if let Some(pools) = pools.upgrade() {
        if pools.remove_if(key, |_, pool| pool.ptr_eq(this)).is_some() {
            debug!(endpoint = %key, "Unregistered closed connection pool");
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("pools", &self.pools.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.close_all();
    }
}
