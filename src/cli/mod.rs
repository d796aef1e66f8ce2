//! CLI commands for the connpool binary
//!
//! # Usage
//!
//! ```bash
//! # Start a loopback echo target
//! connpool echo --listen 127.0.0.1:7000
//!
//! # Exclusive pool round trips
//! connpool probe --endpoint tcp://127.0.0.1:7000 --requests 100
//!
//! # Concurrent multiplexed streams
//! connpool mux-probe --endpoint tcp://127.0.0.1:7000 --streams 32
//! ```

pub mod commands;
