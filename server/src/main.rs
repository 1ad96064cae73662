use clap::Parser;
use log::info;
use server::{Server, ServerConfig, ServerError, SessionStore, TcpTransport};
use std::time::Duration;

/// Main-method of the application. Parses command-line arguments, binds the
/// transport, and runs the tick loop until ctrl-c. Bind failure is the only
/// fatal error; everything later is handled inside the loop.
#[tokio::main]
async fn main() -> Result<(), ServerError> {
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "0.0.0.0")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value_t = shared::DEFAULT_PORT)]
        port: u16,
        /// Tick rate (updates per second)
        #[clap(short, long, default_value = "50")]
        tick_rate: u32,
        /// Minimum milliseconds between position broadcasts per client
        #[clap(long, default_value = "100")]
        update_interval_ms: u64,
        /// Leave the originating client out of its own position broadcasts
        #[clap(long)]
        exclude_originator: bool,
        /// Seconds of silence before a connection is considered dead
        #[clap(long, default_value = "30")]
        idle_timeout_secs: u64,
        /// Seed for spawn randomness (omit for entropy)
        #[clap(long)]
        seed: Option<u64>,
    }

    env_logger::init();
    let args = Args::parse();

    let address = format!("{}:{}", args.host, args.port);
    let transport =
        TcpTransport::bind(&address, Duration::from_secs(args.idle_timeout_secs)).await?;
    info!("listening on {}", transport.local_addr());

    let config = ServerConfig {
        tick_rate: args.tick_rate,
        include_originator: !args.exclude_originator,
        min_update_interval: Duration::from_millis(args.update_interval_ms),
    };
    let sessions = match args.seed {
        Some(seed) => SessionStore::with_seed(seed),
        None => SessionStore::new(),
    };

    let mut server = Server::with_sessions(transport, config, sessions);
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            shutdown.shutdown();
        }
    });

    server.run().await;
    Ok(())
}
