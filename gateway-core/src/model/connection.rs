use gateway_proto::ByteOrder;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    ModbusTcp,
    Mqtt,
    Opcua,
}

fn default_modbus_port() -> u16 {
    502
}
fn default_unit_id() -> u8 {
    1
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_max_gap() -> u16 {
    10
}
fn default_max_registers() -> u16 {
    125
}
fn default_batch_read_enabled() -> bool {
    true
}
fn default_session_timeout_ms() -> u32 {
    60_000
}
fn default_publishing_interval_ms() -> u32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReadConfig {
    #[serde(default = "default_batch_read_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_gap")]
    pub max_gap: u16,
    #[serde(default = "default_max_registers")]
    pub max_registers: u16,
}

impl Default for BatchReadConfig {
    fn default() -> Self {
        Self { enabled: true, max_gap: default_max_gap(), max_registers: default_max_registers() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusTcpConfig {
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub default_byte_order: ByteOrder,
    #[serde(default)]
    pub batch_read: BatchReadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: Option<bool>,
    pub ca_cert: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum OpcUaSecurityMode {
    None,
    Sign,
    SignAndEncrypt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpcUaConfig {
    /// "opc.tcp://host:port[/path]"
    pub endpoint_url: String,
    pub security_mode: OpcUaSecurityMode,
    pub security_policy: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub certificate_id: Option<String>,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    #[serde(default = "default_publishing_interval_ms")]
    pub publishing_interval_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "kebab-case")]
pub enum ProtocolConfig {
    ModbusTcp(ModbusTcpConfig),
    Mqtt(MqttConfig),
    Opcua(OpcUaConfig),
}

impl ProtocolConfig {
    pub fn protocol(&self) -> Protocol {
        match self {
            ProtocolConfig::ModbusTcp(_) => Protocol::ModbusTcp,
            ProtocolConfig::Mqtt(_) => Protocol::Mqtt,
            ProtocolConfig::Opcua(_) => Protocol::Opcua,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub name: String,
    pub config: ProtocolConfig,
    /// Milliseconds since epoch.
    pub created_at: i64,
}

impl Connection {
    pub fn protocol(&self) -> Protocol {
        self.config.protocol()
    }
}

/// Rolling counters the adapter maintains and CM exposes read-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub connected_at: Option<i64>,
    pub last_success_at: Option<i64>,
    pub last_error_at: Option<i64>,
    pub last_error_message: Option<String>,
    pub request_count: u64,
    pub error_count: u64,
    pub latency_ms: Option<u64>,
    /// Rolling mean of the last 10 successful-read latencies.
    recent_latencies_ms: Vec<u64>,
}

const LATENCY_WINDOW: usize = 10;

impl ConnectionMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }

    pub fn latency_avg_ms(&self) -> Option<f64> {
        if self.recent_latencies_ms.is_empty() {
            None
        } else {
            Some(self.recent_latencies_ms.iter().sum::<u64>() as f64 / self.recent_latencies_ms.len() as f64)
        }
    }

    pub fn record_success(&mut self, now_ms: i64, latency_ms: u64) {
        self.request_count += 1;
        self.last_success_at = Some(now_ms);
        self.latency_ms = Some(latency_ms);
        self.recent_latencies_ms.push(latency_ms);
        if self.recent_latencies_ms.len() > LATENCY_WINDOW {
            self.recent_latencies_ms.remove(0);
        }
    }

    pub fn record_error(&mut self, now_ms: i64, message: impl Into<String>) {
        self.request_count += 1;
        self.error_count += 1;
        self.last_error_at = Some(now_ms);
        self.last_error_message = Some(message.into());
    }
}
