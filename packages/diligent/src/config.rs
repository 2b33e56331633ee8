use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [server]
//                    port = 5000
//
//   env var:         DILIGENT_SERVER__PORT=5000   (double underscore = nesting)
//
//   (single underscore stays within field names: DILIGENT_CLIENT__SERVER_URL)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub client: ClientFileConfig,
    #[serde(default)]
    pub database: DatabaseFileConfig,
}

/// Server tuning knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-connection queue of frames waiting to be written to a websocket.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// Chat client settings (lives under `[client]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientFileConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ClientFileConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl ClientFileConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Database location (lives under `[database]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DatabaseFileConfig {
    /// Defaults to `<data_dir>/diligent.db`
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    5000
}
fn default_outbound_buffer() -> usize {
    256
}
fn default_server_url() -> String {
    "http://127.0.0.1:5000".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}

/// Build a figment that layers: defaults → config.toml → DILIGENT_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `DILIGENT_SERVER__PORT=8080`  →  `server.port = 8080`
///   `DILIGENT_CLIENT__SERVER_URL=http://host:5000`  →  `client.server_url = ...`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("DILIGENT_").split("__"))
}

// =============================================================================
// Directory layout config (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct DiligentConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub logs_dir: PathBuf,
    pub file: FileConfig,
}

impl DiligentConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".diligent"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let logs_dir = data_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))?;

        let file: FileConfig = load_config(&data_dir)
            .extract()
            .context("Invalid configuration")?;

        let db_path = file
            .database
            .path
            .clone()
            .unwrap_or_else(|| data_dir.join("diligent.db"));

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            data_dir,
            db_path,
            logs_dir,
            file,
        })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    pub fn chat_log_path(&self) -> PathBuf {
        self.logs_dir.join("chat.log")
    }
}
