//! Registry of connection sets keyed by endpoint.

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::conn_set::{ConnSet, MuxStats};
use super::physical::DriverContext;
use super::virtual_conn::VirtualConnection;
use super::{MuxConfig, MuxError, MuxOptions};
use crate::codec::FrameParser;
use crate::endpoint::{EndpointError, EndpointKey, Network};
use crate::transport::{Dialer, NetDialer};

type SetMap = DashMap<EndpointKey, Arc<ConnSet>>;

/// Multiplexed connection pool.
///
/// Lazily opens a connection set per endpoint. Sets whose connections have
/// all failed for good remove themselves and are recreated on the next
/// request.
pub struct Multiplexed {
    sets: Arc<SetMap>,
    config: Arc<MuxConfig>,
    dialer: Arc<dyn Dialer>,
    parser: Option<Arc<dyn FrameParser>>,
}

impl Multiplexed {
    /// Pool dialing through [`NetDialer`]
    pub fn new(config: MuxConfig) -> Result<Self, MuxError> {
        Self::with_dialer(config, Arc::new(NetDialer::default()))
    }

    pub fn with_dialer(config: MuxConfig, dialer: Arc<dyn Dialer>) -> Result<Self, MuxError> {
        config.validate()?;
        Ok(Self {
            sets: Arc::new(DashMap::new()),
            config: Arc::new(config),
            dialer,
            parser: None,
        })
    }

    /// Default parser for endpoints whose options carry none
    pub fn with_parser(mut self, parser: Arc<dyn FrameParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Open stream `stream_id` to `address`.
    ///
    /// Reusing the id of a stream still open on the chosen physical
    /// connection cancels that stream with [`MuxError::DuplicateStreamId`].
    pub fn get_stream(
        &self,
        network: &str,
        address: &str,
        stream_id: u32,
        opts: &MuxOptions,
    ) -> Result<VirtualConnection, MuxError> {
        let network: Network = network
            .parse()
            .map_err(|e: EndpointError| MuxError::Config(e.to_string()))?;
        let key = EndpointKey::new(network, address, opts.protocol.clone());

        // One retry covers a set expelled between lookup and use
        let set = self.set_for(&key, opts)?;
        match set.new_stream(stream_id) {
            Err(MuxError::ConnClosed) if set.is_expelled() => {
                let set = self.set_for(&key, opts)?;
                set.new_stream(stream_id)
            }
            result => result,
        }
    }

    /// Same as [`get_stream`](Self::get_stream)
    pub fn get_mux_conn(
        &self,
        network: &str,
        address: &str,
        stream_id: u32,
        opts: &MuxOptions,
    ) -> Result<VirtualConnection, MuxError> {
        self.get_stream(network, address, stream_id, opts)
    }

    fn set_for(&self, key: &EndpointKey, opts: &MuxOptions) -> Result<Arc<ConnSet>, MuxError> {
        // Release the shard read guard before `entry` write-locks it
        let existing = self.sets.get(key).map(|s| Arc::clone(s.value()));
        if let Some(set) = existing {
            if !set.is_expelled() {
                return Ok(set);
            }
        }

        match self.sets.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_expelled() {
                    return Ok(Arc::clone(entry.get()));
                }
                let set = self.create_set(key, opts)?;
                entry.insert(Arc::clone(&set));
                Ok(set)
            }
            Entry::Vacant(entry) => {
                let set = self.create_set(key, opts)?;
                entry.insert(Arc::clone(&set));
                Ok(set)
            }
        }
    }

    fn create_set(&self, key: &EndpointKey, opts: &MuxOptions) -> Result<Arc<ConnSet>, MuxError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(MuxError::Config(
                "multiplexed connections must be opened inside a tokio runtime".into(),
            ));
        }
        let parser = opts
            .parser
            .clone()
            .or_else(|| self.parser.clone())
            .ok_or_else(|| MuxError::Config(format!("no frame parser configured for {key}")))?;

        let ctx = Arc::new(DriverContext {
            dialer: Arc::clone(&self.dialer),
            parser,
            local_addr: opts.local_addr,
        });
        let set = ConnSet::new(key.clone(), Arc::clone(&self.config), ctx);

        let sets = Arc::downgrade(&self.sets);
        let this = Arc::downgrade(&set);
        set.set_on_expelled(Box::new(move |key| unregister(&sets, &this, key)));

        debug!(endpoint = %key, "Registered connection set");
        Ok(set)
    }

    pub fn stats(&self, key: &EndpointKey) -> Option<MuxStats> {
        self.sets.get(key).map(|s| s.value().stats())
    }

    /// Number of endpoints with a live connection set
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Shut down every physical connection and empty the registry
    pub fn close_all(&self) {
        let sets: Vec<Arc<ConnSet>> = self.sets.iter().map(|e| Arc::clone(e.value())).collect();
        self.sets.clear();
        for set in &sets {
            set.close();
        }
        if !sets.is_empty() {
            info!(sets = sets.len(), "Closed all connection sets");
        }
    }
}

fn unregister(sets: &Weak<SetMap>, this: &Weak<ConnSet>, key: &EndpointKey) {
    if let Some(sets) = sets.upgrade() {
        let removed = sets.remove_if(key, |_, set| std::ptr::eq(Arc::as_ptr(set), this.as_ptr()));
        if removed.is_some() {
            debug!(endpoint = %key, "Removed expelled connection set");
        }
    }
}

impl std::fmt::Debug for Multiplexed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexed")
            .field("sets", &self.sets.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Drop for Multiplexed {
    fn drop(&mut self) {
        self.close_all();
    }
}
