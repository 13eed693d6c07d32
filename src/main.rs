//! mcp-multiclient
//!
//! Connects to every configured MCP server, lists the unified tool set and
//! optionally invokes one tool.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use mcp_multiclient::{
    config::{AppConfig, Cli, LogFormat, LogSettings},
    mcp::McpClient,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(settings: &LogSettings) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.filter)
            .with_context(|| format!("invalid log filter '{}'", settings.filter))?,
    };
    let registry = tracing_subscriber::registry().with(filter);

    // stdout is reserved for tool output.
    match settings.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .try_init()?,
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenv();

    let cli = Cli::parse();
    let config = AppConfig::from_cli(&cli).context("failed to load configuration")?;
    init_tracing(&config.log)?;

    info!(
        name: "mcp.config.loaded",
        server_count = config.servers.len(),
        collision_policy = ?config.client.collision_policy,
        "configuration loaded"
    );
    if config.servers.is_empty() {
        warn!("no MCP servers configured");
    }

    let client = McpClient::new(config.client_options());
    let summary = client.start(config.servers.clone()).await;

    for (name, ready) in &summary.ready {
        info!(
            name: "mcp.server.summary",
            server = %name,
            transport = %ready.transport,
            tool_count = ready.tool_count,
            collisions = ready.collisions.len(),
            "server ready"
        );
    }
    for name in summary.failed.keys() {
        warn!(name: "mcp.server.summary", server = %name, "server failed");
    }

    let tools = client.tools();
    println!("Available tools: {:?}", tools.names());

    let outcome = match &cli.call {
        Some(tool) => call_once(&client, tool, cli.args.as_deref()).await,
        None => Ok(()),
    };

    client.shutdown().await;
    outcome
}

async fn call_once(client: &McpClient, tool: &str, args: Option<&str>) -> anyhow::Result<()> {
    let arguments: serde_json::Value = match args {
        Some(raw) => serde_json::from_str(raw).context("--args is not valid JSON")?,
        None => serde_json::json!({}),
    };
    let result = client
        .call_tool(tool, arguments)
        .await
        .with_context(|| format!("calling tool '{tool}' failed"))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
