//! sqlscout main binary.

use anyhow::Result;
use clap::{Parser, Subcommand};
use scout_app::config::{ConnectorMode, ScoutConfig};
use scout_app::dev_backends::DevSqlConnector;
use scout_app::server;
use scout_tools::SqlConnector;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sqlscout", version, about = "Diagnostic chat agent for SQL Server")]
struct Cli {
    /// Path to the config file (default: sqlscout.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the sqlscout server (default).
    Serve,
    /// Validate config and report what would run.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve);

    match command {
        Command::Serve => {
            let (cfg, path) = ScoutConfig::load(cli.config).await?;
            tracing::info!(config_path = %path.display(), "starting server");
            let connector = build_connector(&cfg)?;
            server::serve(cfg, connector).await
        }
        Command::Doctor => {
            let (cfg, path) = ScoutConfig::load(cli.config).await?;
            let llm_configured = cfg.llm.client().is_some();
            if !llm_configured {
                tracing::warn!(
                    "llm backend not configured; chat turns will fail with a configuration error"
                );
            }
            tracing::info!(
                config_path = %path.display(),
                model = ?cfg.llm.model,
                llm_configured,
                role = ?cfg.agent.role,
                max_rounds = cfg.agent.max_rounds,
                database_mode = ?cfg.database.mode,
                bind = %cfg.server.bind,
                store_path = %cfg.server.store_path().display(),
                "config ok"
            );
            Ok(())
        }
    }
}

fn build_connector(cfg: &ScoutConfig) -> Result<Arc<dyn SqlConnector>> {
    match cfg.database.mode {
        ConnectorMode::Dev => Ok(Arc::new(DevSqlConnector::new(
            cfg.database.dev_databases.clone(),
        ))),
        ConnectorMode::External => Err(anyhow::anyhow!(
            "database.mode = \"external\" requires linking a SqlConnector implementation \
             and starting the server through scout_app::server::serve"
        )),
    }
}

fn init_tracing() -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info,scout_app=debug,scout_tools=debug,scout_llm=debug"),
    };
    let log_format = std::env::var("SQLSCOUT_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .flatten_event(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported SQLSCOUT_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
