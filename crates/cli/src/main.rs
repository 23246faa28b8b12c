mod config;
mod error;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use databricks::{DatabricksClient, INSTRUCTIONS, register_all};
use mcp::{ListToolsResult, McpServer, ServerOptions, Tool, TransportKind};
use runtime::{Dispatcher, Lifecycle, Redactor, ToolRegistry};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use config::{Config, FileConfig, Overrides};
use error::{Error, Result};

#[derive(Parser)]
#[command(name = "databricks-mcp")]
#[command(about = "MCP server exposing Databricks workspace operations as tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Transport to serve: stdio, sse or streamable-http
    #[arg(long, global = true)]
    transport: Option<TransportKind>,

    /// Address to listen on for network transports
    #[arg(long, global = true)]
    host: Option<String>,

    /// Port to listen on for network transports
    #[arg(long, global = true)]
    port: Option<u16>,

    /// TOML file with default settings
    #[arg(long, global = true, env = "DATABRICKS_MCP_CONFIG")]
    config: Option<PathBuf>,

    /// Env file to load instead of ./.env
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve MCP clients (the default)
    Serve,
    /// Print the tool catalog as JSON and exit
    ListTools,
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    };
    // A stdin read parked on a blocking thread would otherwise keep the
    // runtime alive after a signal-driven shutdown.
    std::process::exit(code);
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    load_env_file(cli.env_file.as_deref())?;
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let overrides = Overrides {
        transport: cli.transport,
        host: cli.host,
        port: cli.port,
    };
    let config = Config::from_env(file, overrides)?;

    init_logging(&config.log_filter)?;

    match cli.command {
        Some(Commands::Serve) | None => cmd_serve(config).await,
        Some(Commands::ListTools) => cmd_list_tools(config),
    }
}

/// Load `path`, or `./.env` if present. Existing variables win.
fn load_env_file(path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => {
            dotenvy::from_path(path).map_err(|source| Error::EnvFile {
                path: path.to_path_buf(),
                source,
            })?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }
    Ok(())
}

/// Logs go to stderr; stdout belongs to the stdio transport.
fn init_logging(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter).map_err(|e| Error::Logging(e.to_string()))?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}

fn build_dispatcher(config: &Config) -> Result<Dispatcher> {
    let client = DatabricksClient::new(config.credentials.clone())?;
    info!(workspace = client.host(), "databricks client ready");

    let mut registry = ToolRegistry::new();
    register_all(&mut registry, Arc::new(client))?;

    Ok(Dispatcher::new(registry)
        .with_timeout(config.request_timeout)
        .with_redactor(Redactor::new().with_secret(config.credentials.token())))
}

fn cmd_list_tools(config: Config) -> Result<()> {
    let dispatcher = build_dispatcher(&config)?;
    let listing = ListToolsResult {
        tools: dispatcher.registry().list().map(Tool::from).collect(),
    };
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

async fn cmd_serve(config: Config) -> Result<()> {
    let dispatcher = build_dispatcher(&config)?;
    let lifecycle = Lifecycle::new();
    let server = McpServer::new(
        dispatcher,
        lifecycle.clone(),
        ServerOptions {
            instructions: Some(INSTRUCTIONS.to_string()),
            session_idle: config.session_idle,
            ..Default::default()
        },
    );

    let addr = if config.transport.is_network() {
        resolve(&config.server_host, config.server_port).await?
    } else {
        SocketAddr::from(([127, 0, 0, 1], 0))
    };

    lifecycle.mark_ready()?;
    info!(transport = %config.transport, "server ready");

    let transport = config.transport;
    let mut serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve(transport, addr).await }
    });

    let finished = tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            None
        }
        joined = &mut serving => {
            info!("transport closed");
            Some(joined)
        }
    };

    let outcome = lifecycle.drain(config.shutdown_grace).await?;
    info!(?outcome, "drained");

    let served = match finished {
        Some(joined) => joined,
        None => serving.await,
    };
    served??;
    info!("stopped");
    Ok(())
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| Error::Resolve(format!("{host}:{port}")))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "databricks-mcp",
            "list-tools",
            "--transport",
            "sse",
            "--port",
            "9000",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Commands::ListTools)));
        assert_eq!(cli.transport, Some(TransportKind::Sse));
        assert_eq!(cli.port, Some(9000));
    }

    #[test]
    fn serve_is_the_default() {
        let cli = Cli::try_parse_from(["databricks-mcp"]).unwrap();
        assert!(cli.command.is_none());
        assert!(Cli::try_parse_from(["databricks-mcp", "--transport", "ws"]).is_err());
    }

    #[test]
    fn catalog_lists_without_network() {
        let config = Config::from_lookup(FileConfig::default(), Overrides::default(), |name| {
            match name {
                "DATABRICKS_HOST" => Some("adb-1.azuredatabricks.net".to_string()),
                "DATABRICKS_TOKEN" => Some("dapi-secret".to_string()),
                _ => None,
            }
        })
        .unwrap();
        let dispatcher = build_dispatcher(&config).unwrap();
        let tools: Vec<Tool> = dispatcher.registry().list().map(Tool::from).collect();
        assert_eq!(tools.len(), 16);
        assert_eq!(tools[0].name, "list_clusters");
        assert_eq!(tools[0].input_schema["type"], "object");
    }

    #[tokio::test]
    async fn resolves_literal_addresses() {
        let addr = resolve("127.0.0.1", 8000).await.unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 8000)));
    }
}
