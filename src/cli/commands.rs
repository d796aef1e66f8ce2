use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::codec::{LengthDelimited, StreamFramed};
use crate::core::Core;
use crate::endpoint::EndpointKey;
use crate::pool::GetOptions;

/// Send `requests` length-delimited frames through the exclusive pool, one
/// connection checkout per request, and verify every echo
pub async fn cmd_probe(core: &Core, endpoint: &str, requests: usize, payload: &str) -> Result<()> {
    let key = EndpointKey::from_url(endpoint).context("Invalid endpoint")?;
    let opts = GetOptions::default().with_framer(Arc::new(LengthDelimited::default()));
    let frame = LengthDelimited::encode(payload.as_bytes());

    let started = Instant::now();
    for i in 0..requests {
        let mut conn = core
            .pool
            .get_by_key(&key, &opts)
            .await
            .context(format!("Failed to acquire connection for request {}", i))?;

        conn.write_all_frame(&frame).await?;
        let reply = conn.read_frame().await?;
        if reply.as_ref() != payload.as_bytes() {
            anyhow::bail!("Request {} echoed {} bytes that differ from the payload", i, reply.len());
        }
        debug!(request = i, reused = conn.is_reused(), "Round trip complete");
        conn.release();
    }
    let elapsed = started.elapsed();

    println!("{} round trips to {} in {:?}", requests, key, elapsed);
    if let Some(stats) = core.pool.stats(&key) {
        println!(
            "dialed: {}  reused: {}  idle: {}  in use: {}  dial failures: {}",
            stats.total_dialed, stats.total_reused, stats.idle, stats.in_use, stats.dial_failures
        );
    }
    Ok(())
}

/// Open `streams` virtual connections concurrently, each sending one
/// stream-framed message and waiting for its echo
pub async fn cmd_mux_probe(core: &Core, endpoint: &str, streams: u32, payload: &str) -> Result<()> {
    let key = EndpointKey::from_url(endpoint).context("Invalid endpoint")?;
    let opts = crate::mux::MuxOptions::default().with_protocol(key.protocol.clone());

    let started = Instant::now();
    let mut tasks = JoinSet::new();
    for stream_id in 1..=streams {
        let mut stream = core
            .mux
            .get_stream(key.network.as_str(), &key.address, stream_id, &opts)
            .context(format!("Failed to open stream {}", stream_id))?;
        let frame = StreamFramed::encode(stream_id, payload.as_bytes());

        tasks.spawn(async move {
            stream.write(frame).await?;
            let reply = stream.read().await?;
            let (id, body) = StreamFramed::decode_frame(&reply)?;
            anyhow::ensure!(id == stream_id, "Stream {} received a reply for {}", stream_id, id);
            Ok::<usize, anyhow::Error>(body.len())
        });
    }

    let mut bytes = 0usize;
    while let Some(result) = tasks.join_next().await {
        bytes += result.context("Stream task panicked")??;
    }
    let elapsed = started.elapsed();

    info!(endpoint = %key, streams, "Multiplexed probe finished");
    println!("{} streams ({} bytes echoed) to {} in {:?}", streams, bytes, key, elapsed);
    if let Some(stats) = core.mux.stats(&key) {
        println!(
            "physical connections: {}  idle: {}  open streams: {}  reconnects: {}",
            stats.connections, stats.idle_connections, stats.streams, stats.reconnects
        );
    }
    Ok(())
}
