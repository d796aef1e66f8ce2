use anyhow::{Context, Result};
use std::sync::Arc;

use crate::codec::StreamFramed;
use crate::config::Config;
use crate::mux::Multiplexed;
use crate::pool::Pool;
use crate::transport::{Dialer, NetDialer};

/// Pools shared by every CLI command
///
/// Clones share the same registries, so connections dialed by one command are
/// reused by the next.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<Config>,
    pub pool: Arc<Pool>,
    pub mux: Arc<Multiplexed>,
}

impl Core {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_dialer(config, Arc::new(NetDialer::default()))
    }

    pub fn with_dialer(config: Config, dialer: Arc<dyn Dialer>) -> Result<Self> {
        let pool_config = config.pool.to_pool_config()?;
        let mux_config = config.mux.to_mux_config()?;

        let pool = Pool::with_dialer(pool_config, Arc::clone(&dialer));
        let mux = Multiplexed::with_dialer(mux_config, dialer)
            .context("Failed to create multiplexed pool")?
            .with_parser(Arc::new(StreamFramed::default()));

        Ok(Self {
            config: Arc::new(config),
            pool: Arc::new(pool),
            mux: Arc::new(mux),
        })
    }

    /// Close every pooled and multiplexed connection
    pub fn shutdown(&self) {
        self.pool.close_all();
        self.mux.close_all();
    }
}
