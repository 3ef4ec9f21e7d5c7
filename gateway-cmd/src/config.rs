//! Ambient workspace loader: the minimal JSON file that lets the
//! process start with a non-empty connection set. Distinct from, and
//! narrower than, the out-of-scope YAML workspace importer — this
//! loader accepts already-resolved entities with concrete ids, the same
//! shape CM's CRUD operations already expect.

use gateway_core::model::{AlertRule, Bridge, Connection, Environment, Tag};
use gateway_core::virtual_server::Block;
use serde::Deserialize;
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read workspace file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse workspace file: {0}")]
    ParseJson(#[from] serde_json::Error),
}

fn default_poll_interval_ms() -> u64 {
    gateway_core::polling::default_interval_ms()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDef {
    #[serde(flatten)]
    pub connection: Connection,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub auto_connect: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_virtual_host() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServerConfig {
    #[serde(default = "default_virtual_host")]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub blocks: Vec<Block>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub name: Option<String>,
    #[serde(default)]
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub connections: Vec<ConnectionDef>,
    #[serde(default)]
    pub bridges: Vec<Bridge>,
    #[serde(default)]
    pub alert_rules: Vec<AlertRule>,
    pub virtual_server: Option<VirtualServerConfig>,
    /// Where the ring-buffer database file lives; `:memory:` if omitted.
    pub rbs_path: Option<String>,
}

impl Workspace {
    pub async fn load(path: &str) -> Result<Self, ConfigError> {
        let mut bytes = fs::read(path).await?;
        // strip UTF-8 BOM (EF BB BF)
        if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
            bytes.drain(..3);
        }
        while matches!(bytes.first(), Some(b' ' | b'\n' | b'\r' | b'\t')) {
            bytes.drain(..1);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}
