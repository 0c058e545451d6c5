//! unichat Gateway Binary
//!
//! # Usage
//! ```bash
//! unichat-gateway [--config gateway.json] [--port 8787] [--host 127.0.0.1] [--verbose]
//! ```

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use unichat_gateway::{Gateway, GatewayConfig};

/// unichat Gateway - merged live chat from Twitch, YouTube and Kick
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Port to listen on, overrides the configuration file
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to, overrides the configuration file
    #[arg(long)]
    host: Option<String>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    dotenvy::dotenv().ok();

    // RUST_LOG wins over the verbose flag
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    let mut config = match args.config.as_deref() {
        Some(path) => GatewayConfig::from_file(path).with_context(|| format!("loading {}", path))?,
        None => GatewayConfig::default(),
    }
    .apply_env();
    if let Some(host) = args.host {
        config = config.with_host(host);
    }
    if let Some(port) = args.port {
        config = config.with_port(port);
    }

    print_banner(&config);

    let gateway = Gateway::new(config).context("building gateway")?;
    let state = gateway.state();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received");
            state.shutdown.cancel();
        }
    });

    gateway.start().await?;
    Ok(())
}

fn print_banner(config: &GatewayConfig) {
    println!();
    println!("╔═══════════════════════════════════════════════════════════════╗");
    println!("║               unichat gateway - live chat, merged             ║");
    println!("╚═══════════════════════════════════════════════════════════════╝");
    println!();
    println!("HTTP Endpoints  (http://{}:{})", config.host, config.port);
    println!("   ├─ GET  /api/aggregate     - merged chat stream (SSE)");
    println!("   ├─ POST /api/poll/start    - run one YouTube poll cycle");
    println!("   ├─ POST /api/webhooks/kick - Kick webhook receiver");
    println!("   ├─ GET  /api/kick/stream   - Kick relay only (SSE)");
    println!("   ├─ GET  /api/youtube/stream - YouTube relay only (SSE)");
    println!("   ├─ GET  /health            - Health check");
    println!("   └─ GET  /status            - Gateway status");
    println!();
    println!(
        "Coordination store: {}",
        if config.store.remote().is_some() { "shared (REST)" } else { "in-memory" }
    );
    println!("Kick transport: {:?}", config.platforms.kick_transport);
    println!("Press Ctrl+C to stop the gateway");
    println!();
}
