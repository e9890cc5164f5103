//! nexus-gateway: authenticated, rate-limited, cached front door for chat
//! completion providers.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Parser;

use nexus_gateway::gateway::logging::init_tracing;
use nexus_gateway::gateway::{Env, GatewayConfig, GatewayHttpState, http};

#[path = "nexus_gateway/attach.rs"]
mod attach;

const DEFAULT_DOTENV: &str = ".env";

#[derive(Debug, Parser)]
#[command(name = "nexus-gateway", version)]
#[command(about = "LLM gateway with quotas, rate limiting and response caching")]
struct Cli {
    /// TOML config file. Environment variables override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Dotenv file layered over the process environment. Defaults to `./.env`
    /// when present.
    #[arg(long)]
    dotenv: Option<PathBuf>,
    /// Listen address, overrides PORT and NEXUS_LISTEN.
    #[arg(long)]
    listen: Option<String>,
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let env = load_env(cli.dotenv.as_deref())?;
    let mut config = GatewayConfig::load(cli.config.as_deref(), &env)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    config.json_logs |= cli.json_logs;

    init_tracing(config.json_logs)?;

    let gateway = attach::build_gateway(&config)?;
    let mut state = GatewayHttpState::new(gateway).with_upgrade_limit(config.upgrade_limit);
    if let Some(token) = config.admin_token.as_deref() {
        state = state.with_admin_token(token);
    }
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(
        listen = %config.listen,
        version = env!("CARGO_PKG_VERSION"),
        "nexus-gateway listening"
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

fn load_env(path: Option<&Path>) -> Result<Env, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        return Ok(Env::load_dotenv(path)?);
    }
    let default = Path::new(DEFAULT_DOTENV);
    if default.is_file() {
        return Ok(Env::load_dotenv(default)?);
    }
    Ok(Env::default())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
