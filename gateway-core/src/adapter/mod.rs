//! Protocol Adapter layer: one implementation per protocol behind a
//! single capability-set trait, plus a factory registry keyed by protocol.

mod backoff;
pub mod modbus;
pub mod mqtt;
pub mod opcua;
mod state;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{Connection, ConnectionMetrics, ConnectionStatus, DataType, Protocol, Quality, Tag, Value};

/// Per-tag outcome of a `read_tags` call. Exactly one per enabled tag of
/// matching protocol, in input order.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub tag_id: Uuid,
    pub value: Value,
    pub quality: Quality,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Good,
    Bad,
}

#[derive(Debug, Clone)]
pub struct WriteResult {
    pub status: WriteStatus,
    pub error: Option<String>,
}

impl WriteResult {
    pub fn ok() -> Self {
        Self { status: WriteStatus::Good, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { status: WriteStatus::Bad, error: Some(error.into()) }
    }
}

/// Secrets resolved by CM from the out-of-scope vault just before
/// `connect`, never stored on `Connection` itself.
#[derive(Debug, Clone, Default)]
pub struct Credential {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Observer-side events an adapter emits; CM subscribes and fans them out.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    StatusChanged { status: ConnectionStatus, error: Option<String> },
    DataReceived(Vec<crate::model::DataPoint>),
    Error(String),
    MetricsUpdated(ConnectionMetrics),
}

/// The capability set every protocol implements. Adapters are
/// constructed per-connection by a registry factory and own their session
/// for the connection's lifetime.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Idempotent when already connected; drives the status machine.
    async fn connect(&self, credential: &Credential) -> crate::error::Result<()>;
    /// Never fails observably; errors are logged, not propagated.
    async fn disconnect(&self);
    /// Exactly one result per enabled tag whose address kind matches this
    /// adapter's protocol, in input order.
    async fn read_tags(&self, tags: &[Tag]) -> Vec<ReadResult>;
    async fn write(&self, tag: &Tag, value: Value, data_type: Option<DataType>) -> WriteResult;
    /// Writes to a target identified only by a rendered address/topic/nodeId
    /// string plus a rendered text payload — no pre-existing Tag. Used by
    /// the Bridge Engine, whose `targetConfig` templates render directly
    /// against a topic or node id (§4.6).
    async fn write_raw(&self, target: &str, payload: &str) -> WriteResult;
    /// Terminal; only reachable state after this call.
    async fn dispose(&self);
    fn status(&self) -> ConnectionStatus;
    fn metrics(&self) -> ConnectionMetrics;
    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent>;
}

pub type AdapterFactory = fn(&Connection) -> Box<dyn ProtocolAdapter>;

/// Protocol → factory lookup CM uses to build a fresh adapter for a new
/// connection.
pub struct AdapterRegistry {
    factories: HashMap<Protocol, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn with_builtin_protocols() -> Self {
        let mut factories: HashMap<Protocol, AdapterFactory> = HashMap::new();
        factories.insert(Protocol::ModbusTcp, modbus::build as AdapterFactory);
        factories.insert(Protocol::Mqtt, mqtt::build as AdapterFactory);
        factories.insert(Protocol::Opcua, opcua::build as AdapterFactory);
        Self { factories }
    }

    pub fn build(&self, connection: &Connection) -> Option<Box<dyn ProtocolAdapter>> {
        self.factories.get(&connection.protocol()).map(|f| f(connection))
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_builtin_protocols()
    }
}

pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}
