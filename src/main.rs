use claude_bridge::backend::Backends;
use claude_bridge::config::config_search_paths;
use claude_bridge::{build_router, logging, AppState, Gateway, GatewayConfig};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "claude-bridge",
    about = "Anthropic Messages API gateway for OpenAI-compatible backends",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Log level (overrides config; RUST_LOG wins over both)
    #[arg(long)]
    log_level: Option<String>,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.show_config_paths {
        println!("Config search paths (first match wins):");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = GatewayConfig::find_and_load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    logging::init(&config.log_level);

    let client = reqwest::Client::builder()
        .connect_timeout(config.request_timeout())
        .build()?;
    let backend_key_configured = config.backend_endpoint()?.has_api_key();
    let backends = Backends::from_config(&config, client)?;
    let gateway = Gateway::from_config(&config, backends);

    let client_api_key = config.client_api_key();
    if client_api_key.is_none() {
        warn!(
            var = %config.client_api_key_env,
            "No client API key configured, inbound requests are not authenticated"
        );
    }

    info!("claude-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("  Backend:   {}", config.backend.base_url);
    info!("  Large:     {}", config.tiers.large.model);
    info!("  Middle:    {}", config.tiers.middle.model);
    info!("  Small:     {}", config.tiers.small.model);
    info!("  Tokens:    {}..={}", config.tokens.min, config.tokens.max);
    info!("  Timeout:   {}s", config.request_timeout_secs);

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState {
        gateway,
        client_api_key,
        backend_key_configured,
        shutdown: shutdown.clone(),
    });

    let app = build_router(state);
    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  To use with Claude Code:");
    info!("    ANTHROPIC_BASE_URL=http://localhost:{} claude", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        return shutdown.cancelled().await;
    }
    info!("Shutting down, closing active streams");
    shutdown.cancel();
}
