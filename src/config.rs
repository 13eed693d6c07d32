use crate::mcp::{ClientIdentity, ClientOptions, CollisionPolicy, ServerConfig, policy::Timeouts};
use clap::{Parser, ValueEnum};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path (JSON, YAML or TOML). Defaults to ./mcp.{json,yaml,toml} when present.
    #[arg(short, long, env = "MCP_CONFIG")]
    pub config: Option<String>,

    /// Log output format
    #[arg(long, env = "MCP_LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,

    /// Default per-call timeout in milliseconds
    #[arg(long)]
    pub call_timeout_ms: Option<u64>,

    /// Default connect timeout in milliseconds
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Call this tool once the servers are up
    #[arg(long)]
    pub call: Option<String>,

    /// JSON arguments for --call
    #[arg(long, requires = "call")]
    pub args: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default, alias = "mcpServers", alias = "mcpservers")]
    pub servers: BTreeMap<String, ServerConfig>,
    pub client: ClientSettings,
    pub log: LogSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientSettings {
    pub call_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub collision_policy: CollisionPolicy,
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub format: LogFormat,
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub filter: String,
}

fn millis(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Self::from_cli(&cli)
    }

    /// Layering, lowest first: defaults, config file, `MCP__*` environment,
    /// command line.
    pub fn from_cli(cli: &Cli) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder()
            .set_default("client.call_timeout_ms", 60_000_i64)?
            .set_default("client.connect_timeout_ms", 30_000_i64)?
            .set_default("client.collision_policy", "reject_later")?
            .set_default("client.name", env!("CARGO_PKG_NAME"))?
            .set_default("log.format", LogFormat::default().as_str())?
            .set_default("log.filter", "info")?;

        builder = match &cli.config {
            Some(path) => builder.add_source(File::with_name(path)),
            None => builder.add_source(File::with_name("mcp").required(false)),
        };

        // E.g. MCP__CLIENT__CALL_TIMEOUT_MS=5000 or MCP__SERVERS__DOCS__URL=...
        builder = builder.add_source(
            Environment::with_prefix("MCP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(format) = cli.log_format {
            builder = builder.set_override("log.format", format.as_str())?;
        }
        if let Some(ms) = cli.call_timeout_ms {
            builder = builder.set_override("client.call_timeout_ms", millis(ms))?;
        }
        if let Some(ms) = cli.connect_timeout_ms {
            builder = builder.set_override("client.connect_timeout_ms", millis(ms))?;
        }

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config.with_env_expanded())
    }

    fn with_env_expanded(mut self) -> Self {
        self.servers = self
            .servers
            .into_iter()
            .map(|(name, server)| (name, server.with_env_expanded()))
            .collect();
        self
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            collision_policy: self.client.collision_policy,
            timeouts: Timeouts {
                connect: Duration::from_millis(self.client.connect_timeout_ms),
                call: Duration::from_millis(self.client.call_timeout_ms),
            },
            client_info: ClientIdentity::new(self.client.name.clone(), env!("CARGO_PKG_VERSION")),
        }
    }
}
