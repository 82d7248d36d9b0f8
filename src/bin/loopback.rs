//! h3conn loopback
//!
//! Runs a client and a server connection over an in-process session pair:
//! - Exchanges SETTINGS and prints what each side received
//! - Sends a few request streams from client to server and echoes them back
//! - Opens one application stream type and checks it reaches the server

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use h3conn::{
    config::{generate_example_config, Config},
    transport::MemorySession,
    Connection, ErrorCode, StreamType,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// WebTransport unidirectional stream type
const WEBTRANSPORT_STREAM: StreamType = StreamType(0x54);

/// h3conn loopback - HTTP/3 connection layer over an in-process transport
#[derive(Parser, Debug)]
#[command(name = "h3conn-loopback")]
#[command(about = "Exercise the HTTP/3 connection layer over an in-process transport")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Write an example configuration file to this path and exit
    #[arg(long)]
    generate_config: Option<String>,

    /// Disable transport datagram support
    #[arg(long)]
    no_datagrams: bool,

    /// Number of request streams to send
    #[arg(short = 'n', long, default_value_t = 3)]
    requests: usize,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Log level (trace, debug, info, warn, error), overrides config
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.generate_config {
        generate_example_config()
            .save(path)
            .context("Failed to write example configuration")?;
        println!("Wrote example configuration to {}", path);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    if args.no_datagrams {
        config.memory.datagrams = false;
    }

    // Initialize logging
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    let subscriber = tracing_subscriber::fmt().with_env_filter(level);
    if config.logging.format == "compact" {
        subscriber.compact().init();
    } else {
        subscriber.init();
    }

    info!("h3conn loopback v{}", h3conn::VERSION);

    tokio::time::timeout(Duration::from_secs(args.timeout), run(&config, args.requests))
        .await
        .map_err(|_| anyhow!("Loopback timed out after {}s", args.timeout))?
}

async fn run(config: &Config, requests: usize) -> Result<()> {
    let (client_session, server_session) = MemorySession::pair(&config.memory);

    let client = Connection::open_with_config(client_session, None, &config.connection)
        .await
        .context("Failed to open client connection")?;
    let server = Connection::accept_with_config(server_session, None, &config.connection)
        .await
        .context("Failed to accept server connection")?;

    let (from_server, from_client) = tokio::try_join!(client.peer_settings(), server.peer_settings())
        .context("SETTINGS exchange failed")?;
    info!("Client received {}", from_server);
    info!("Server received {}", from_client);
    info!(
        "HTTP datagrams: {}",
        if from_server.datagrams_enabled() && from_client.datagrams_enabled() {
            "enabled"
        } else {
            "disabled"
        }
    );

    let echo = tokio::spawn(async move {
        for _ in 0..requests {
            let mut stream = server.accept_request_stream().await?;
            let mut request = Vec::new();
            stream.read_to_end(&mut request).await?;
            debug!("Server got {} bytes on stream {}", request.len(), stream.id());
            stream.write_all(&request).await?;
            stream.shutdown().await?;
        }

        let mut typed = server.accept_typed_stream().await?;
        let mut payload = Vec::new();
        typed.read_to_end(&mut payload).await?;
        info!(
            "Server accepted {} ({} bytes)",
            typed.stream_type(),
            payload.len()
        );
        Ok::<_, h3conn::Error>(server)
    });

    for i in 0..requests {
        let mut stream = client.open_request_stream().await?;
        let request = format!("request {}", i);
        stream.write_all(request.as_bytes()).await?;
        stream.shutdown().await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        if response != request.as_bytes() {
            return Err(anyhow!("Stream {} echoed unexpected data", stream.id()));
        }
        info!("Stream {} echoed {:?}", stream.id(), request);
    }

    let mut typed = client.open_typed_stream(WEBTRANSPORT_STREAM).await?;
    typed.write_all(b"loopback").await?;
    typed.shutdown().await?;
    drop(typed);

    let server = echo.await.context("Server task failed")??;

    client.close(ErrorCode::NO_ERROR, "loopback finished");
    server.session().closed().await;
    info!("Connection closed");
    Ok(())
}
