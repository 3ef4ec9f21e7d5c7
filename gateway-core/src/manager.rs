//! Connection Manager: the façade the rest of the system talks to.
//! Owns the connection map and adapter registry, resolves config through
//! Variable Substitution and the credential store before a connect, and
//! fans adapter/CM-level events out to subscribers over bounded,
//! drop-newest channels.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::adapter::{AdapterRegistry, Credential, ProtocolAdapter};
use crate::credential::CredentialStore;
use crate::error::{Result, ValidationError};
use crate::model::{Connection, ConnectionMetrics, ConnectionStatus, DataPoint, Environment, ProtocolConfig, Tag, Value};
use crate::varsub;

const FANOUT_CHANNEL_CAPACITY: usize = 1024;

/// CM-level events, a superset of what an individual adapter emits.
#[derive(Debug, Clone)]
pub enum CmEvent {
    StatusChanged { connection_id: Uuid, status: ConnectionStatus },
    Data { connection_id: Uuid, points: Vec<DataPoint> },
    Metrics { connection_id: Uuid, metrics: ConnectionMetrics },
    TagAdded(Tag),
    TagUpdated(Tag),
    TagDeleted { tag_id: Uuid },
    ConnectionDeleted { connection_id: Uuid, tag_ids: Vec<Uuid> },
}

struct Entry {
    connection: Connection,
    tags: Vec<Tag>,
    adapter: Arc<dyn ProtocolAdapter>,
    /// per-connection copy of the event-relay task, aborted on delete.
    relay: tokio::task::JoinHandle<()>,
}

pub struct ConnectionManager {
    entries: DashMap<Uuid, Entry>,
    registry: AdapterRegistry,
    credentials: Arc<dyn CredentialStore>,
    environment: RwLock<Environment>,
    events: broadcast::Sender<CmEvent>,
    dropped_events: Arc<std::sync::atomic::AtomicU64>,
}

impl ConnectionManager {
    pub fn new(credentials: Arc<dyn CredentialStore>, environment: Environment) -> Self {
        let (events, _) = broadcast::channel(FANOUT_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            registry: AdapterRegistry::with_builtin_protocols(),
            credentials,
            environment: RwLock::new(environment),
            events,
            dropped_events: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    /// Bounded, drop-newest subscription: a lagging subscriber sees a
    /// gap rather than stalling the publisher. `broadcast` already drops
    /// the oldest entries on overflow; we count the occurrence so a caller
    /// can surface it, and resubscribe transparently.
    pub fn subscribe(&self) -> broadcast::Receiver<CmEvent> {
        self.events.subscribe()
    }

    pub fn dropped_event_count(&self) -> u64 {
        self.dropped_events.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn emit(&self, event: CmEvent) {
        if self.events.send(event).is_err() {
            // no subscribers at all; not a drop, just nobody listening.
        }
    }

    async fn resolve_config(&self, config: &ProtocolConfig) -> Result<ProtocolConfig> {
        let env = self.environment.read().await;
        let json = serde_json::to_value(config).map_err(|e| crate::error::InternalError(e.to_string()))?;
        let (resolved, _found, unresolved) = varsub::resolve_object(&json, &env.variables);
        if !unresolved.is_empty() {
            warn!(unresolved = ?unresolved, "connection config has unresolved variable references");
        }
        serde_json::from_value(resolved).map_err(|e| crate::error::InternalError(e.to_string()).into())
    }

    pub async fn create(&self, mut connection: Connection) -> Result<()> {
        connection.config = self.resolve_config(&connection.config).await?;
        let Some(adapter) = self.registry.build(&connection) else {
            return Err(ValidationError::ProtocolMismatch(connection.id).into());
        };
        let adapter: Arc<dyn ProtocolAdapter> = Arc::from(adapter);
        let relay = spawn_relay(connection.id, &adapter, self.events.clone(), Arc::clone(&self.dropped_events));
        self.entries.insert(connection.id, Entry { connection, tags: Vec::new(), adapter, relay });
        Ok(())
    }

    pub async fn update(&self, mut connection: Connection) -> Result<()> {
        connection.config = self.resolve_config(&connection.config).await?;
        let mut entry = self.entries.get_mut(&connection.id).ok_or(ValidationError::UnknownConnection(connection.id))?;
        entry.connection = connection;
        Ok(())
    }

    pub async fn delete(&self, connection_id: Uuid) -> Result<()> {
        let (_, entry) = self.entries.remove(&connection_id).ok_or(ValidationError::UnknownConnection(connection_id))?;
        entry.adapter.dispose().await;
        entry.relay.abort();
        let tag_ids: Vec<Uuid> = entry.tags.iter().map(|t| t.id).collect();
        self.emit(CmEvent::ConnectionDeleted { connection_id, tag_ids });
        Ok(())
    }

    pub fn add_tag(&self, tag: Tag) -> Result<()> {
        tag.validate()?;
        let mut entry = self.entries.get_mut(&tag.connection_id).ok_or(ValidationError::UnknownConnection(tag.connection_id))?;
        entry.tags.push(tag.clone());
        drop(entry);
        self.emit(CmEvent::TagAdded(tag));
        Ok(())
    }

    pub fn update_tag(&self, tag: Tag) -> Result<()> {
        tag.validate()?;
        let mut entry = self.entries.get_mut(&tag.connection_id).ok_or(ValidationError::UnknownConnection(tag.connection_id))?;
        if let Some(slot) = entry.tags.iter_mut().find(|t| t.id == tag.id) {
            *slot = tag.clone();
        } else {
            return Err(ValidationError::UnknownTag(tag.id).into());
        }
        drop(entry);
        self.emit(CmEvent::TagUpdated(tag));
        Ok(())
    }

    pub fn delete_tag(&self, connection_id: Uuid, tag_id: Uuid) -> Result<()> {
        let mut entry = self.entries.get_mut(&connection_id).ok_or(ValidationError::UnknownConnection(connection_id))?;
        let before = entry.tags.len();
        entry.tags.retain(|t| t.id != tag_id);
        if entry.tags.len() == before {
            return Err(ValidationError::UnknownTag(tag_id).into());
        }
        drop(entry);
        self.emit(CmEvent::TagDeleted { tag_id });
        Ok(())
    }

    pub async fn connect(&self, connection_id: Uuid) -> Result<()> {
        let entry = self.entries.get(&connection_id).ok_or(ValidationError::UnknownConnection(connection_id))?;
        let adapter = Arc::clone(&entry.adapter);
        drop(entry);
        let credential = self.credentials.resolve(connection_id).await;
        adapter.connect(&credential).await
    }

    pub async fn disconnect(&self, connection_id: Uuid) -> Result<()> {
        let entry = self.entries.get(&connection_id).ok_or(ValidationError::UnknownConnection(connection_id))?;
        entry.adapter.disconnect().await;
        Ok(())
    }

    pub fn get_tags(&self, connection_id: Uuid) -> Result<Vec<Tag>> {
        self.entries.get(&connection_id).map(|e| e.tags.clone()).ok_or(ValidationError::UnknownConnection(connection_id).into())
    }

    /// The authoritative `tagId → Tag` lookup (Open Question (a), SPEC_FULL
    /// §9): callers needing a tag's name or address off its id — notably the
    /// Bridge Engine, which has no Tag on the target side — go through CM
    /// rather than keeping their own copy.
    pub fn get_tag(&self, connection_id: Uuid, tag_id: Uuid) -> Option<Tag> {
        self.entries.get(&connection_id).and_then(|e| e.tags.iter().find(|t| t.id == tag_id).cloned())
    }

    pub fn get(&self, connection_id: Uuid) -> Option<Connection> {
        self.entries.get(&connection_id).map(|e| e.connection.clone())
    }

    pub fn list(&self) -> Vec<Connection> {
        self.entries.iter().map(|e| e.connection.clone()).collect()
    }

    pub fn get_status(&self, connection_id: Uuid) -> Result<ConnectionStatus> {
        self.entries.get(&connection_id).map(|e| e.adapter.status()).ok_or(ValidationError::UnknownConnection(connection_id).into())
    }

    pub fn get_metrics(&self, connection_id: Uuid) -> Result<ConnectionMetrics> {
        self.entries.get(&connection_id).map(|e| e.adapter.metrics()).ok_or(ValidationError::UnknownConnection(connection_id).into())
    }

    /// `read(id, tags?)`: reads the named tags, or every enabled tag on the
    /// connection when `tag_ids` is `None`.
    pub async fn read(&self, connection_id: Uuid, tag_ids: Option<&[Uuid]>) -> Result<Vec<crate::adapter::ReadResult>> {
        let entry = self.entries.get(&connection_id).ok_or(ValidationError::UnknownConnection(connection_id))?;
        let tags: Vec<Tag> = match tag_ids {
            Some(ids) => entry.tags.iter().filter(|t| ids.contains(&t.id)).cloned().collect(),
            None => entry.tags.clone(),
        };
        let adapter = Arc::clone(&entry.adapter);
        drop(entry);
        Ok(adapter.read_tags(&tags).await)
    }

    /// Entry point for poll-driven data: PE calls `read`, then hands the
    /// resulting points back here so they reach the same `CmEvent::Data`
    /// stream that subscription-driven adapters (MQTT/OPC UA) publish via
    /// their relay task.
    pub fn publish_data(&self, connection_id: Uuid, points: Vec<DataPoint>) {
        if points.is_empty() {
            return;
        }
        self.emit(CmEvent::Data { connection_id, points });
    }

    pub async fn write(&self, connection_id: Uuid, writes: Vec<(Uuid, Value)>) -> Result<Vec<crate::adapter::WriteResult>> {
        let entry = self.entries.get(&connection_id).ok_or(ValidationError::UnknownConnection(connection_id))?;
        let by_id: HashMap<Uuid, Tag> = entry.tags.iter().map(|t| (t.id, t.clone())).collect();
        let adapter = Arc::clone(&entry.adapter);
        drop(entry);
        let mut out = Vec::with_capacity(writes.len());
        for (tag_id, value) in writes {
            let Some(tag) = by_id.get(&tag_id) else {
                out.push(crate::adapter::WriteResult::failed("unknown tag"));
                continue;
            };
            out.push(adapter.write(tag, value, None).await);
        }
        Ok(out)
    }

    /// Bridge write path (§4.6): `target` and `payload` are already-rendered
    /// strings, written directly through the target connection's adapter
    /// without requiring a Tag of its own.
    pub async fn write_raw(&self, connection_id: Uuid, target: &str, payload: &str) -> Result<crate::adapter::WriteResult> {
        let entry = self.entries.get(&connection_id).ok_or(ValidationError::UnknownConnection(connection_id))?;
        let adapter = Arc::clone(&entry.adapter);
        drop(entry);
        Ok(adapter.write_raw(target, payload).await)
    }
}

/// Relays one adapter's broadcast stream onto CM's own, translating event
/// shapes; aborted when the connection is deleted.
fn spawn_relay(
    connection_id: Uuid,
    adapter: &Arc<dyn ProtocolAdapter>,
    out: broadcast::Sender<CmEvent>,
    dropped_events: Arc<std::sync::atomic::AtomicU64>,
) -> tokio::task::JoinHandle<()> {
    let mut rx = adapter.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let mapped = match event {
                        crate::adapter::AdapterEvent::StatusChanged { status, .. } => {
                            Some(CmEvent::StatusChanged { connection_id, status })
                        }
                        crate::adapter::AdapterEvent::DataReceived(points) => Some(CmEvent::Data { connection_id, points }),
                        crate::adapter::AdapterEvent::MetricsUpdated(metrics) => Some(CmEvent::Metrics { connection_id, metrics }),
                        crate::adapter::AdapterEvent::Error(_) => None,
                    };
                    if let Some(event) = mapped {
                        let _ = out.send(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    dropped_events.fetch_add(n, std::sync::atomic::Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::InMemoryCredentialStore;
    use crate::model::{ModbusTcpConfig, Protocol};

    fn modbus_connection(host: &str) -> Connection {
        Connection {
            id: Uuid::new_v4(),
            name: "plc".into(),
            config: ProtocolConfig::ModbusTcp(ModbusTcpConfig {
                host: host.to_string(),
                port: 502,
                unit_id: 1,
                timeout_ms: 1000,
                default_byte_order: Default::default(),
                batch_read: Default::default(),
            }),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn create_then_delete_emits_connection_deleted() {
        let cm = ConnectionManager::new(Arc::new(InMemoryCredentialStore::new()), Environment::new("default"));
        let mut rx = cm.subscribe();
        let conn = modbus_connection("${HOST:127.0.0.1}");
        let id = conn.id;
        cm.create(conn).await.unwrap();
        assert_eq!(cm.get_status(id).unwrap(), ConnectionStatus::Disconnected);
        cm.delete(id).await.unwrap();
        let mut saw_delete = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, CmEvent::ConnectionDeleted { connection_id, .. } if connection_id == id) {
                saw_delete = true;
            }
        }
        assert!(saw_delete);
        assert_eq!(cm.list().len(), 0);
    }

    #[tokio::test]
    async fn variable_substitution_resolves_default_when_env_missing() {
        let cm = ConnectionManager::new(Arc::new(InMemoryCredentialStore::new()), Environment::new("default"));
        let conn = modbus_connection("${HOST:10.0.0.9}");
        let id = conn.id;
        cm.create(conn).await.unwrap();
        let resolved = cm.get(id).unwrap();
        let ProtocolConfig::ModbusTcp(cfg) = resolved.config else { panic!("expected modbus config") };
        assert_eq!(cfg.host, "10.0.0.9");
        assert_eq!(resolved.protocol(), Protocol::ModbusTcp);
    }

    #[test]
    fn unknown_connection_operations_error() {
        let cm = ConnectionManager::new(Arc::new(InMemoryCredentialStore::new()), Environment::new("default"));
        assert!(cm.get_status(Uuid::new_v4()).is_err());
    }
}
