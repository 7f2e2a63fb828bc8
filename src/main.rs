use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use parlor_core::generator::ReplyGenerator;
use parlor_core::{AdminKey, ApiKey};
use parlor_llm::{AnthropicGenerator, SilentGenerator};
use parlor_server::ServerConfig;
use parlor_store::Database;
use parlor_telemetry::LogConfig;

const DEFAULT_MODEL: &str = "claude-3-5-haiku-20241022";

#[derive(Parser, Debug)]
#[command(name = "parlor", about = "WebSocket chat server with AI-backed replies")]
struct Cli {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on. Falls back to PARLOR_PORT, then 9090.
    #[arg(long)]
    port: Option<u16>,

    /// SQLite database path. Falls back to PARLOR_DB, then ~/.parlor/parlor.db.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    parlor_telemetry::init_logging(&LogConfig {
        json_output: cli.json_logs,
        ..LogConfig::default()
    });

    tracing::info!("Starting Parlor server");

    let defaults = ServerConfig::default();
    let port = match cli.port {
        Some(port) => port,
        None => match env_var("PARLOR_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid PARLOR_PORT value {raw:?}"))?,
            None => defaults.port,
        },
    };

    let db_path = match cli.db.or_else(|| env_var("PARLOR_DB").map(PathBuf::from)) {
        Some(path) => path,
        None => {
            let dir = dirs_home().join(".parlor");
            std::fs::create_dir_all(&dir).context("failed to create data directory")?;
            dir.join("parlor.db")
        }
    };
    let db = Database::open(&db_path).context("failed to open database")?;

    let generator: Arc<dyn ReplyGenerator> = match env_var("ANTHROPIC_API_KEY") {
        Some(key) => {
            let model = env_var("PARLOR_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
            tracing::info!(model = %model, "Using Anthropic reply generator");
            Arc::new(AnthropicGenerator::new(ApiKey::new(key), model))
        }
        None => {
            tracing::warn!("ANTHROPIC_API_KEY not set, visitor messages will get no AI replies");
            Arc::new(SilentGenerator)
        }
    };

    let admin_key = env_var("PARLOR_ADMIN_KEY").map(AdminKey::new);
    if admin_key.is_none() {
        tracing::warn!("PARLOR_ADMIN_KEY not set, admin features are disabled");
    }

    let config = ServerConfig {
        host: cli.host,
        port,
        admin_key,
        ..defaults
    };
    let _handle = parlor_server::start(config, db, generator)
        .await
        .context("failed to start server")?;

    tracing::info!(port = port, "Parlor server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    Ok(())
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
