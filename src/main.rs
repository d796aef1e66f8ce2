use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use connpool::{cli, config, server, Core};

#[derive(Parser)]
#[command(name = "connpool")]
#[command(version, about = "Connection pool and stream multiplexing probes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (environment variables are used when omitted)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a loopback echo server
    Echo {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:7000")]
        listen: String,

        /// Echo UDP datagrams instead of TCP streams
        #[arg(long)]
        udp: bool,
    },

    /// Round trips through the exclusive connection pool
    Probe {
        /// Target endpoint (tcp://host:port, unix:///path)
        #[arg(long)]
        endpoint: String,

        /// Number of sequential requests
        #[arg(long, default_value = "10")]
        requests: usize,

        /// Payload sent with every request
        #[arg(long, default_value = "ping")]
        payload: String,
    },

    /// Concurrent streams through the multiplexed pool
    MuxProbe {
        /// Target endpoint (tcp://host:port, udp://host:port)
        #[arg(long)]
        endpoint: String,

        /// Number of concurrent streams
        #[arg(long, default_value = "16")]
        streams: u32,

        /// Payload sent on every stream
        #[arg(long, default_value = "ping")]
        payload: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // The echo server needs no pools
    if let Commands::Echo { listen, udp } = &cli.command {
        return server::run_echo_server(listen, *udp).await;
    }

    let config = config::load_config(cli.config.as_deref())?;
    let core = Core::new(config)?;

    let result = match cli.command {
        Commands::Probe {
            endpoint,
            requests,
            payload,
        } => cli::commands::cmd_probe(&core, &endpoint, requests, &payload).await,
        Commands::MuxProbe {
            endpoint,
            streams,
            payload,
        } => cli::commands::cmd_mux_probe(&core, &endpoint, streams, &payload).await,
        Commands::Echo { .. } => Ok(()),
    };

    core.shutdown();
    result
}
