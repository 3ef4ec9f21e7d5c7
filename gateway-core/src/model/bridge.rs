use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// `{{placeholder}}` template; rendered against the MQTT topic or the
    /// OPC UA nodeId depending on the target protocol.
    pub topic_or_node_template: String,
    pub payload_template: String,
}

fn default_queue_max() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeOptions {
    /// 0/None means unlimited.
    pub max_messages_per_sec: Option<u32>,
    #[serde(default)]
    pub include_bad: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default = "default_queue_max")]
    pub queue_max: usize,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_backoff_ms() -> u64 {
    2000
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            max_messages_per_sec: None,
            include_bad: false,
            paused: false,
            queue_max: default_queue_max(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeStatus {
    Idle,
    Active,
    Paused,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bridge {
    pub id: Uuid,
    pub source_connection_id: Uuid,
    pub source_tag_ids: Vec<Uuid>,
    pub target_connection_id: Uuid,
    pub target_config: TargetConfig,
    pub options: BridgeOptions,
    pub status: BridgeStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeStats {
    pub forwarded_count: u64,
    pub dropped_count: u64,
    pub error_count: u64,
    pub last_forward_at: Option<i64>,
    pub last_error: Option<String>,
}
