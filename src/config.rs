use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_yaml;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Raindrop caps `perpage` at 50.
pub const MAX_PAGE_SIZE: u32 = 50;

#[derive(Parser, Debug)]
#[command(name = "marksync")]
#[command(about = "Forwards new and changed Raindrop bookmarks to Pocket")]
#[command(
    long_about = "Forwards new and changed Raindrop bookmarks to Pocket.\n\n\
    Runs are not guarded against each other: two instances sharing one ledger \
    may forward the same bookmark twice."
)]
pub struct Cli {
    #[arg(short = 'c', long = "config", global = true)]
    pub config_path: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long = "json-logs", global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create the local ledger if it does not exist yet
    Init,
    /// Record every current bookmark as seen without forwarding anything
    MarkAllSeen {
        #[arg(long)]
        max_pages: Option<u32>,
    },
    /// Forward new and changed bookmarks (default)
    Sync {
        /// Ignore the stored watermark and re-evaluate the whole collection
        #[arg(long)]
        full: bool,
        #[arg(long)]
        max_pages: Option<u32>,
    },
    /// Show ledger size and watermark
    Status,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Sync {
            full: false,
            max_pages: None,
        })
    }
}

pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".marksync")
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.yaml")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub token: String,
    #[serde(default)]
    pub collection_id: i64,
    #[serde(default = "default_source_url")]
    pub base_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    pub consumer_key: String,
    pub access_token: String,
    #[serde(default = "default_sink_url")]
    pub base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            path: default_ledger_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub watermark_overlap_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            timeout_seconds: default_timeout(),
        }
    }
}

fn default_source_url() -> String {
    "https://api.raindrop.io/rest/v1".to_string()
}

fn default_sink_url() -> String {
    "https://getpocket.com/v3".to_string()
}

fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}

fn default_max_pages() -> u32 {
    20
}

fn default_ledger_path() -> String {
    "db.sqlite3".to_string()
}

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub http: HttpConfig,
    /// Directory relative ledger paths resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Config {
    pub fn new(path: &str) -> Result<Self> {
        let mut cfg = Config::load_config(path)?;
        cfg.base_dir = Path::new(path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(cfg)
    }

    /// Builds a configuration from the environment alone.
    pub fn from_env() -> Result<Self> {
        let collection_id = match env::var("RAINDROP_COLLECTION_ID") {
            Ok(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("RAINDROP_COLLECTION_ID is not an integer: {raw:?}"))?,
            Err(_) => 0,
        };

        Ok(Config {
            source: SourceConfig {
                token: env::var("RAINDROP_TOKEN").unwrap_or_default(),
                collection_id,
                base_url: default_source_url(),
                page_size: default_page_size(),
                max_pages: default_max_pages(),
            },
            sink: SinkConfig {
                consumer_key: env::var("POCKET_CONSUMER_KEY").unwrap_or_default(),
                access_token: env::var("POCKET_ACCESS_TOKEN").unwrap_or_default(),
                base_url: default_sink_url(),
            },
            ledger: LedgerConfig {
                path: env::var("MARKSYNC_DB").unwrap_or_else(|_| default_ledger_path()),
            },
            sync: SyncConfig::default(),
            http: HttpConfig::default(),
            base_dir: PathBuf::from("."),
        })
    }

    /// `--config` if given, then the default config file if present, then
    /// the environment.
    pub fn resolve(config_path: Option<&str>) -> Result<Self> {
        if let Some(path) = config_path {
            return Config::new(path).with_context(|| format!("failed to load config file {path}"));
        }

        let default_path = default_config_path();
        if default_path.exists() {
            let path = default_path.to_string_lossy().to_string();
            return Config::new(&path).with_context(|| format!("failed to load config file {path}"));
        }

        tracing::debug!("no config file found, reading configuration from the environment");
        Config::from_env()
    }

    pub fn ledger_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.ledger.path);
        if path.is_absolute() {
            path
        } else {
            self.base_dir.join(path)
        }
    }

    /// Checks that the ledger can be located. Credentials are only needed for
    /// commands that talk to the services, see `validate_remote`.
    pub fn validate_ledger(&self) -> Result<()> {
        if self.ledger.path.trim().is_empty() {
            bail!("ledger.path must not be empty");
        }
        Ok(())
    }

    pub fn validate_remote(&self) -> Result<()> {
        self.validate_ledger()?;
        if self.source.token.trim().is_empty() {
            bail!("source.token is empty, set RAINDROP_TOKEN or source.token in the config file");
        }
        if self.sink.consumer_key.trim().is_empty() || self.sink.access_token.trim().is_empty() {
            bail!("sink credentials are empty, set POCKET_CONSUMER_KEY and POCKET_ACCESS_TOKEN");
        }
        if self.source.page_size == 0 || self.source.page_size > MAX_PAGE_SIZE {
            bail!("source.page_size must be between 1 and {}", MAX_PAGE_SIZE);
        }
        if self.source.max_pages == 0 {
            bail!("source.max_pages must be at least 1");
        }
        if self.http.timeout_seconds == 0 {
            bail!("http.timeout_seconds must be at least 1");
        }
        Ok(())
    }

    fn load_config(path: &str) -> Result<Config> {
        let yaml_str = fs::read_to_string(path)?;
        let yaml_with_env = Config::substitute_env_vars(&yaml_str)?;
        Config::parse(&yaml_with_env)
    }

    fn parse(yaml: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    fn substitute_env_vars(yaml_str: &str) -> Result<String> {
        let mut result = yaml_str.to_string();
        let mut offset = 0;

        while let Some(start) = result[offset..].find("${") {
            let actual_start = offset + start;
            if let Some(end) = result[actual_start..].find("}") {
                let var_name = &result[actual_start + 2..actual_start + end];

                // ${VAR:-default}
                let env_value = if let Some(default_start) = var_name.find(":-") {
                    let actual_var = &var_name[..default_start];
                    let default_val = &var_name[default_start + 2..];
                    env::var(actual_var).unwrap_or_else(|_| default_val.to_string())
                } else {
                    env::var(var_name).unwrap_or_else(|_| {
                        tracing::warn!("environment variable '{}' not found", var_name);
                        String::new()
                    })
                };

                result.replace_range(actual_start..actual_start + end + 1, &env_value);
                offset = actual_start + env_value.len();
            } else {
                break;
            }
        }

        Ok(result)
    }
}
