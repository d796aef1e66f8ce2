//! connpool - connection pooling and stream multiplexing for client transports

pub mod cli;
pub mod codec;
pub mod config;
pub mod core;
pub mod endpoint;
pub mod error;
pub mod mux;
pub mod pool;
pub mod server;
pub mod transport;

pub use crate::config::Config;
pub use crate::core::Core;
pub use endpoint::{EndpointKey, Network};
pub use error::ErrorKind;
pub use mux::{MuxConfig, MuxError, MuxOptions, Multiplexed, VirtualConnection};
pub use pool::{ConnectionPool, GetOptions, Pool, PoolConfig, PoolError, PooledConnection};
