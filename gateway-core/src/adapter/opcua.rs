//! OPC UA adapter: one `opcua` client/session pair per connection.
//! The crate's session API is synchronous under the hood (see the
//! wellpulse example's own note that a real connect needs
//! `spawn_blocking` "to avoid nested runtime issues"), so every call that
//! touches the session runs on the blocking pool and the adapter awaits a
//! `spawn_blocking` handle back, mirroring the Ring-Buffer Store's pattern
//! for the same reason.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use async_trait::async_trait;
use opcua::client::prelude::{
    Client, ClientBuilder, IdentityToken, MessageSecurityMode, Session, UserTokenPolicy,
};
use opcua::types::{DataValue, NodeId, StatusCode as UaStatusCode, TimestampsToReturn, Variant};
use tokio::sync::{broadcast, Mutex};
use tracing::warn;
use uuid::Uuid;

use crate::error::{ConnectionError, ProtocolError, Result};
use crate::model::{
    Connection, ConnectionMetrics, ConnectionStatus, DataType, OpcUaConfig, OpcUaSecurityMode, ProtocolConfig,
    Quality, Tag, TagAddress, Value,
};

use super::backoff::Backoff;
use super::state::StatusCell;
use super::{now_ms, AdapterEvent, Credential, ProtocolAdapter, ReadResult, WriteResult};

type SharedSession = Arc<StdRwLock<Session>>;

struct Inner {
    connection_id: Uuid,
    config: OpcUaConfig,
    status: StatusCell,
    metrics: Mutex<ConnectionMetrics>,
    client: Mutex<Option<Client>>,
    session: Mutex<Option<SharedSession>>,
    subscribed_nodes: StdMutex<Vec<String>>,
    events: broadcast::Sender<AdapterEvent>,
    reconnecting: AtomicBool,
    backoff: Mutex<Backoff>,
}

pub struct OpcUaAdapter(Arc<Inner>);

pub fn build(connection: &Connection) -> Box<dyn ProtocolAdapter> {
    let ProtocolConfig::Opcua(config) = connection.config.clone() else {
        panic!("opc ua adapter built for non-opcua connection");
    };
    let (events, _) = broadcast::channel(256);
    Box::new(OpcUaAdapter(Arc::new(Inner {
        connection_id: connection.id,
        config,
        status: StatusCell::new(connection.name.clone()),
        metrics: Mutex::new(ConnectionMetrics::default()),
        client: Mutex::new(None),
        session: Mutex::new(None),
        subscribed_nodes: StdMutex::new(Vec::new()),
        events,
        reconnecting: AtomicBool::new(false),
        backoff: Mutex::new(Backoff::default()),
    })))
}

impl Inner {
    fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: ConnectionStatus, error: Option<String>) {
        self.status.store(status);
        self.emit(AdapterEvent::StatusChanged { status, error });
    }

    fn security_mode(&self) -> MessageSecurityMode {
        match self.config.security_mode {
            OpcUaSecurityMode::None => MessageSecurityMode::None,
            OpcUaSecurityMode::Sign => MessageSecurityMode::Sign,
            OpcUaSecurityMode::SignAndEncrypt => MessageSecurityMode::SignAndEncrypt,
        }
    }

    fn identity_token(&self, credential: &Credential) -> IdentityToken {
        let username = credential.username.clone().or_else(|| self.config.username.clone());
        let password = credential.password.clone().or_else(|| self.config.password.clone());
        match (username, password) {
            (Some(u), Some(p)) => IdentityToken::UserName(u, p),
            _ => IdentityToken::Anonymous,
        }
    }

    /// Every session call goes through here so its blocking I/O never runs
    /// on a tokio worker thread.
    async fn with_session<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Session) -> std::result::Result<T, UaStatusCode> + Send + 'static,
        T: Send + 'static,
    {
        let session = self.session.lock().await.clone();
        let Some(session) = session else {
            return Err(ConnectionError::Other("not connected".into()).into());
        };
        tokio::task::spawn_blocking(move || {
            let mut guard = session.write().unwrap();
            f(&mut guard)
        })
        .await
        .map_err(|e| ConnectionError::Other(format!("opc ua task panicked: {e}")).into())
        .and_then(|r| r.map_err(|code| ProtocolError::OpcUaStatus(code.to_string()).into()))
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if inner.status.is_disposed() {
                    inner.reconnecting.store(false, Ordering::Release);
                    return;
                }
                let delay = inner.backoff.lock().await.next_delay();
                tokio::time::sleep(delay).await;
                if inner.status.is_disposed() {
                    inner.reconnecting.store(false, Ordering::Release);
                    return;
                }
                match connect_inner(&inner, &Credential::default()).await {
                    Ok(()) => {
                        // the protocol transfers existing subscriptions across a
                        // reconnect; verify they survived and recreate any that
                        // didn't.
                        inner.verify_subscriptions().await;
                        inner.reconnecting.store(false, Ordering::Release);
                        return;
                    }
                    Err(err) => warn!(connection = %inner.connection_id, error = %err, "opc ua reconnect attempt failed"),
                }
            }
        });
    }

    async fn verify_subscriptions(self: &Arc<Self>) {
        let nodes = self.subscribed_nodes.lock().unwrap().clone();
        for node in nodes {
            if let Err(err) = self.add_monitored_item_inner(&node, 1000.0, 1, true, None, None).await {
                warn!(connection = %self.connection_id, node_id = %node, error = %err, "failed to recreate monitored item after reconnect");
            }
        }
    }

    async fn add_monitored_item_inner(
        self: &Arc<Self>,
        node_id: &str,
        sampling_interval_ms: f64,
        queue_size: u32,
        discard_oldest: bool,
        deadband_type: Option<DeadbandType>,
        deadband_value: Option<f64>,
    ) -> Result<u32> {
        let node = node_id.to_string();
        self.with_session(move |session| {
            let node_id = NodeId::from_str_ref(&node).map_err(|_| UaStatusCode::BadNodeIdInvalid)?;
            let subscription_id = session
                .create_subscription(sampling_interval_ms, 60, 10, 0, 0, true, |_| {})
                .map_err(|e| e)?;
            let item = opcua::client::prelude::MonitoredItemCreateRequest {
                item_to_monitor: opcua::types::ReadValueId {
                    node_id,
                    attribute_id: opcua::types::AttributeId::Value as u32,
                    index_range: Default::default(),
                    data_encoding: Default::default(),
                },
                monitoring_mode: opcua::types::MonitoringMode::Reporting,
                requested_parameters: opcua::types::MonitoringParameters {
                    client_handle: 0,
                    sampling_interval: sampling_interval_ms,
                    filter: deadband_filter(deadband_type, deadband_value),
                    queue_size,
                    discard_oldest,
                },
            };
            session
                .create_monitored_items(subscription_id, TimestampsToReturn::Both, &[item])
                .map(|_| subscription_id)
        })
        .await
    }
}

/// Builds the `ExtensionObject` the OPC UA wire format expects for a
/// monitored item's filter: a `DataChangeFilter` when a deadband was
/// configured, or the null/empty filter (server applies none) otherwise.
fn deadband_filter(deadband_type: Option<DeadbandType>, deadband_value: Option<f64>) -> opcua::types::ExtensionObject {
    match deadband_type {
        Some(kind) if kind != DeadbandType::None => {
            let filter = opcua::types::DataChangeFilter {
                trigger: opcua::types::DataChangeTrigger::StatusValue,
                deadband_type: kind as u32,
                deadband_value: deadband_value.unwrap_or(0.0),
            };
            opcua::types::ExtensionObject::from_encodable(opcua::types::ObjectId::DataChangeFilter_Encoding_DefaultBinary, &filter)
        }
        _ => opcua::types::ExtensionObject::null(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadbandType {
    None,
    Absolute,
    Percent,
}

async fn connect_inner(inner: &Arc<Inner>, credential: &Credential) -> Result<()> {
    let client_config = ClientBuilder::new()
        .application_name("gateway")
        .application_uri("urn:gateway:opcua-adapter")
        .session_timeout(inner.config.session_timeout_ms as u32)
        .trust_server_certs(true)
        .client()
        .ok_or_else(|| ConnectionError::Other("failed to build opc ua client".to_string()))?;

    let endpoint_url = inner.config.endpoint_url.clone();
    let security_mode = inner.security_mode();
    let security_policy = inner.config.security_policy.clone().unwrap_or_else(|| "None".to_string());
    let identity = inner.identity_token(credential);

    let mut client = client_config;
    let session = tokio::task::spawn_blocking(move || {
        client
            .connect_to_endpoint((endpoint_url.as_ref(), security_policy.as_ref(), security_mode, UserTokenPolicy::anonymous()), identity)
            .map(|session| (client, session))
    })
    .await
    .map_err(|e| ConnectionError::Other(format!("opc ua connect task panicked: {e}")))?
    .map_err(|code| ConnectionError::Other(code.to_string()))?;

    let (client, session) = session;
    *inner.client.lock().await = Some(client);
    *inner.session.lock().await = Some(session);
    inner.set_status(ConnectionStatus::Connected, None);
    inner.backoff.lock().await.reset();
    Ok(())
}

#[async_trait]
impl ProtocolAdapter for OpcUaAdapter {
    async fn connect(&self, credential: &Credential) -> Result<()> {
        if self.0.status.load() == ConnectionStatus::Connected {
            return Ok(());
        }
        self.0.set_status(ConnectionStatus::Connecting, None);
        match connect_inner(&self.0, credential).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.0.set_status(ConnectionStatus::Error, Some(err.to_string()));
                self.0.spawn_reconnect();
                Err(err)
            }
        }
    }

    async fn disconnect(&self) {
        if let Some(session) = self.0.session.lock().await.take() {
            let _ = tokio::task::spawn_blocking(move || session.write().unwrap().disconnect()).await;
        }
        *self.0.client.lock().await = None;
        self.0.set_status(ConnectionStatus::Disconnected, None);
    }

    async fn read_tags(&self, tags: &[Tag]) -> Vec<ReadResult> {
        let opc_tags: Vec<&Tag> = tags.iter().filter(|t| t.enabled && matches!(t.address, TagAddress::OpcUa(_))).collect();
        if opc_tags.is_empty() {
            return Vec::new();
        }
        if self.0.status.load() != ConnectionStatus::Connected {
            return opc_tags
                .iter()
                .map(|t| ReadResult { tag_id: t.id, value: Value::Number(0.0), quality: Quality::Bad, timestamp: now_ms() })
                .collect();
        }

        let read_ids: Vec<(Uuid, String, u32)> = opc_tags
            .iter()
            .map(|t| {
                let TagAddress::OpcUa(addr) = &t.address else { unreachable!() };
                (t.id, addr.node_id.clone(), addr.attribute_id)
            })
            .collect();

        let started = std::time::Instant::now();
        let values: Result<Vec<DataValue>> = self
            .with_session_for_read(read_ids.iter().map(|(_, n, a)| (n.clone(), *a)).collect())
            .await;

        let ts = now_ms();
        match values {
            Ok(values) => {
                let latency = started.elapsed().as_millis() as u64;
                let mut metrics = self.0.metrics.lock().await;
                metrics.record_success(ts, latency);
                self.0.emit(AdapterEvent::MetricsUpdated(metrics.clone()));
                drop(metrics);
                read_ids
                    .into_iter()
                    .zip(values)
                    .map(|((tag_id, _, _), dv)| {
                        let (value, quality) = decode_data_value(&dv);
                        ReadResult { tag_id, value, quality, timestamp: ts }
                    })
                    .collect()
            }
            Err(err) => {
                let mut metrics = self.0.metrics.lock().await;
                metrics.record_error(ts, err.to_string());
                self.0.emit(AdapterEvent::MetricsUpdated(metrics.clone()));
                drop(metrics);
                self.0.set_status(ConnectionStatus::Error, Some(err.to_string()));
                self.0.spawn_reconnect();
                read_ids
                    .into_iter()
                    .map(|(tag_id, _, _)| ReadResult { tag_id, value: Value::Number(0.0), quality: Quality::Bad, timestamp: ts })
                    .collect()
            }
        }
    }

    async fn write(&self, tag: &Tag, value: Value, _data_type: Option<DataType>) -> WriteResult {
        let TagAddress::OpcUa(addr) = &tag.address else {
            return WriteResult::failed("tag is not opc ua-addressed");
        };
        let node_id = addr.node_id.clone();
        let variant = value_to_variant(&value);
        let result = self
            .0
            .with_session(move |session| {
                let node_id = NodeId::from_str_ref(&node_id).map_err(|_| UaStatusCode::BadNodeIdInvalid)?;
                let write_value = opcua::types::WriteValue {
                    node_id,
                    attribute_id: opcua::types::AttributeId::Value as u32,
                    index_range: Default::default(),
                    value: DataValue::new_now(variant),
                };
                session.write(&[write_value]).map(|codes| codes.into_iter().next().unwrap_or_default())
            })
            .await;
        match result {
            Ok(()) => WriteResult::ok(),
            Err(err) => WriteResult::failed(err.to_string()),
        }
    }

    /// Bridge write path: `target` is the nodeId rendered from
    /// `targetConfig.topicOrNodeTemplate`, `payload` the rendered text
    /// payload, heuristically typed (numeric, then boolean, else string)
    /// since a bare rendered template carries no DataType of its own.
    async fn write_raw(&self, target: &str, payload: &str) -> WriteResult {
        let node_id_str = target.to_string();
        let variant = heuristic_variant(payload);
        let result = self
            .0
            .with_session(move |session| {
                let node_id = NodeId::from_str_ref(&node_id_str).map_err(|_| UaStatusCode::BadNodeIdInvalid)?;
                let write_value = opcua::types::WriteValue {
                    node_id,
                    attribute_id: opcua::types::AttributeId::Value as u32,
                    index_range: Default::default(),
                    value: DataValue::new_now(variant),
                };
                session.write(&[write_value]).map(|codes| codes.into_iter().next().unwrap_or_default())
            })
            .await;
        match result {
            Ok(()) => WriteResult::ok(),
            Err(err) => WriteResult::failed(err.to_string()),
        }
    }

    async fn dispose(&self) {
        self.0.status.dispose();
        if let Some(session) = self.0.session.lock().await.take() {
            let _ = tokio::task::spawn_blocking(move || session.write().unwrap().disconnect()).await;
        }
        *self.0.client.lock().await = None;
    }

    fn status(&self) -> ConnectionStatus {
        self.0.status.load()
    }

    fn metrics(&self) -> ConnectionMetrics {
        match self.0.metrics.try_lock() {
            Ok(guard) => guard.clone(),
            Err(_) => ConnectionMetrics::default(),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.0.events.subscribe()
    }
}

impl OpcUaAdapter {
    async fn with_session_for_read(&self, nodes: Vec<(String, u32)>) -> Result<Vec<DataValue>> {
        self.0
            .with_session(move |session| {
                let ids: std::result::Result<Vec<_>, UaStatusCode> = nodes
                    .iter()
                    .map(|(n, attr)| {
                        NodeId::from_str_ref(n).map(|node_id| opcua::types::ReadValueId {
                            node_id,
                            attribute_id: *attr,
                            index_range: Default::default(),
                            data_encoding: Default::default(),
                        })
                        .map_err(|_| UaStatusCode::BadNodeIdInvalid)
                    })
                    .collect();
                let ids = ids?;
                session.read(&ids, TimestampsToReturn::Both, 0.0)
            })
            .await
    }

    /// Browse: one level of references from `node_id`.
    pub async fn browse(&self, node_id: &str, max_refs: u32) -> Result<Vec<BrowsedNode>> {
        let node_id = node_id.to_string();
        self.0
            .with_session(move |session| {
                let start = NodeId::from_str_ref(&node_id).map_err(|_| UaStatusCode::BadNodeIdInvalid)?;
                let browse_description = opcua::types::BrowseDescription {
                    node_id: start,
                    browse_direction: opcua::types::BrowseDirection::Forward,
                    reference_type_id: Default::default(),
                    include_subtypes: true,
                    node_class_mask: 0,
                    result_mask: 0x3f,
                };
                let results = session.browse(&[browse_description])?.unwrap_or_default();
                let refs = results
                    .into_iter()
                    .flat_map(|r| r.references.unwrap_or_default())
                    .take(max_refs as usize)
                    .map(|r| BrowsedNode {
                        node_id: r.node_id.node_id.to_string(),
                        browse_name: r.browse_name.name.to_string(),
                        display_name: r.display_name.text.to_string(),
                    })
                    .collect();
                Ok(refs)
            })
            .await
    }

    /// Search nodes: breadth-first walk matching DisplayName or
    /// BrowseName against `pattern` (case-insensitive), bounded by
    /// `max_depth`/`max_results`.
    pub async fn search_nodes(&self, start: &str, pattern: &str, max_depth: u32, max_results: usize) -> Result<Vec<BrowsedNode>> {
        let pattern = pattern.to_lowercase();
        let mut frontier = vec![(start.to_string(), 0u32)];
        let mut seen = std::collections::HashSet::new();
        let mut matches = Vec::new();
        while let Some((node, depth)) = frontier.pop() {
            if !seen.insert(node.clone()) || matches.len() >= max_results {
                continue;
            }
            let children = self.browse(&node, 1000).await?;
            for child in &children {
                if child.display_name.to_lowercase().contains(&pattern) || child.browse_name.to_lowercase().contains(&pattern) {
                    matches.push(child.clone());
                    if matches.len() >= max_results {
                        break;
                    }
                }
                if depth + 1 < max_depth {
                    frontier.push((child.node_id.clone(), depth + 1));
                }
            }
        }
        Ok(matches)
    }

    /// Translate browse path: walk `path` following hierarchical
    /// references one segment at a time, starting from `start`.
    pub async fn translate_browse_path(&self, start: &str, path: &[String]) -> Result<String> {
        let mut current = start.to_string();
        for segment in path {
            let children = self.browse(&current, 1000).await?;
            let next = children
                .into_iter()
                .find(|c| c.browse_name == *segment || c.display_name == *segment)
                .ok_or_else(|| ProtocolError::UnexpectedResponse(format!("no child named {segment} under {current}")))?;
            current = next.node_id;
        }
        Ok(current)
    }

    /// Common attributes plus the class-specific ones defined for Variables
    /// and Methods.
    pub async fn read_node_attributes(&self, node_id: &str) -> Result<HashMap<String, Value>> {
        const ATTRS: &[(&str, u32)] = &[
            ("NodeClass", 2),
            ("BrowseName", 3),
            ("DisplayName", 4),
            ("Value", 13),
            ("DataType", 14),
            ("ValueRank", 15),
            ("ArrayDimensions", 16),
            ("AccessLevel", 17),
            ("UserAccessLevel", 18),
            ("MinimumSamplingInterval", 19),
            ("Historizing", 20),
            ("Executable", 21),
            ("UserExecutable", 22),
        ];
        let node = node_id.to_string();
        let values = self
            .0
            .with_session(move |session| {
                let ids: std::result::Result<Vec<_>, UaStatusCode> = ATTRS
                    .iter()
                    .map(|(_, attr)| {
                        NodeId::from_str_ref(&node).map(|node_id| opcua::types::ReadValueId {
                            node_id,
                            attribute_id: *attr,
                            index_range: Default::default(),
                            data_encoding: Default::default(),
                        })
                        .map_err(|_| UaStatusCode::BadNodeIdInvalid)
                    })
                    .collect();
                session.read(&ids?, TimestampsToReturn::Neither, 0.0)
            })
            .await?;
        Ok(ATTRS
            .iter()
            .zip(values)
            .filter_map(|((name, _), dv)| {
                let (value, quality) = decode_data_value(&dv);
                (quality != Quality::Bad).then(|| (name.to_string(), value))
            })
            .collect())
    }

    /// Subscriptions: `createSubscription`.
    pub async fn create_subscription(&self, publishing_interval_ms: f64, lifetime: u32, max_keep_alive: u32, priority: u8) -> Result<u32> {
        self.0
            .with_session(move |session| {
                session.create_subscription(publishing_interval_ms, lifetime, max_keep_alive, 0, priority, true, |_| {})
            })
            .await
    }

    /// Adds a monitored item; tracks the node so a reconnect can verify
    /// or recreate it.
    pub async fn add_monitored_item(
        &self,
        node_id: &str,
        sampling_interval_ms: f64,
        queue_size: u32,
        discard_oldest: bool,
        deadband_type: Option<DeadbandType>,
        deadband_value: Option<f64>,
    ) -> Result<u32> {
        self.0.subscribed_nodes.lock().unwrap().push(node_id.to_string());
        self.0
            .add_monitored_item_inner(node_id, sampling_interval_ms, queue_size, discard_oldest, deadband_type, deadband_value)
            .await
    }

    pub async fn remove_monitored_item(&self, node_id: &str, subscription_id: u32, monitored_item_id: u32) -> Result<()> {
        self.0.subscribed_nodes.lock().unwrap().retain(|n| n != node_id);
        self.0
            .with_session(move |session| session.delete_monitored_items(subscription_id, &[monitored_item_id]).map(|_| ()))
            .await
    }

    pub async fn set_publishing_mode(&self, subscription_id: u32, publishing_enabled: bool) -> Result<()> {
        self.0
            .with_session(move |session| session.set_publishing_mode(&[subscription_id], publishing_enabled).map(|_| ()))
            .await
    }

    pub async fn delete_subscription(&self, subscription_id: u32) -> Result<()> {
        self.0.with_session(move |session| session.delete_subscription(subscription_id).map(|_| ())).await
    }

    /// Method calls: read `InputArguments`/`OutputArguments`
    /// metadata, then invoke with variant-typed inputs.
    pub async fn call_method(&self, object_id: &str, method_id: &str, inputs: Vec<Value>) -> Result<Vec<Value>> {
        let object_id = object_id.to_string();
        let method_id = method_id.to_string();
        let args: Vec<Variant> = inputs.iter().map(value_to_variant).collect();
        let outputs = self
            .0
            .with_session(move |session| {
                let object = NodeId::from_str_ref(&object_id).map_err(|_| UaStatusCode::BadNodeIdInvalid)?;
                let method = NodeId::from_str_ref(&method_id).map_err(|_| UaStatusCode::BadNodeIdInvalid)?;
                let request = opcua::types::CallMethodRequest {
                    object_id: object,
                    method_id: method,
                    input_arguments: Some(args),
                };
                session.call(request)
            })
            .await?;
        Ok(outputs.into_iter().map(|v| variant_to_value(&v)).collect())
    }

    /// Condition Acknowledge (`i=9111`) / Confirm (`i=9113`) method calls.
    pub async fn acknowledge_condition(&self, condition_id: &str, comment: &str) -> Result<()> {
        self.call_method(condition_id, "i=9111", vec![Value::String(comment.to_string())]).await.map(|_| ())
    }

    pub async fn confirm_condition(&self, condition_id: &str, comment: &str) -> Result<()> {
        self.call_method(condition_id, "i=9113", vec![Value::String(comment.to_string())]).await.map(|_| ())
    }
}

#[derive(Debug, Clone)]
pub struct BrowsedNode {
    pub node_id: String,
    pub browse_name: String,
    pub display_name: String,
}

/// Value decoding: built-in scalars pass through; DateTime, ByteString,
/// LocalizedText and QualifiedName are normalized to plain Rust shapes.
fn decode_data_value(dv: &DataValue) -> (Value, Quality) {
    let quality = match dv.status {
        Some(code) if code.is_good() => Quality::Good,
        Some(code) if code.is_uncertain() => Quality::Uncertain,
        _ => Quality::Bad,
    };
    let value = dv.value.as_ref().map(variant_to_value).unwrap_or(Value::Number(0.0));
    (value, quality)
}

fn variant_to_value(variant: &Variant) -> Value {
    match variant {
        Variant::Boolean(b) => Value::Bool(*b),
        Variant::SByte(n) => Value::Number(*n as f64),
        Variant::Byte(n) => Value::Number(*n as f64),
        Variant::Int16(n) => Value::Number(*n as f64),
        Variant::UInt16(n) => Value::Number(*n as f64),
        Variant::Int32(n) => Value::Number(*n as f64),
        Variant::UInt32(n) => Value::Number(*n as f64),
        Variant::Int64(n) => Value::Number(*n as f64),
        Variant::UInt64(n) => Value::Number(*n as f64),
        Variant::Float(n) => Value::Number(*n as f64),
        Variant::Double(n) => Value::Number(*n as f64),
        Variant::String(s) => Value::String(s.to_string()),
        Variant::DateTime(dt) => Value::String(dt.as_chrono().to_rfc3339()),
        Variant::ByteString(bs) => Value::String(bs.as_ref().map(|b| to_hex(b)).unwrap_or_default()),
        Variant::LocalizedText(lt) => Value::String(lt.text.to_string()),
        Variant::QualifiedName(qn) => Value::String(qn.name.to_string()),
        other => Value::String(format!("{other:?}")),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn value_to_variant(value: &Value) -> Variant {
    match value {
        Value::Number(n) => Variant::Double(*n),
        Value::Bool(b) => Variant::Boolean(*b),
        Value::String(s) => Variant::String(s.clone().into()),
    }
}

/// Best-effort typing of a rendered bridge payload string: numeric, then
/// boolean, else string.
fn heuristic_variant(payload: &str) -> Variant {
    let trimmed = payload.trim();
    if let Ok(n) = trimmed.parse::<f64>() {
        return Variant::Double(n);
    }
    match trimmed {
        "true" | "TRUE" | "True" => Variant::Boolean(true),
        "false" | "FALSE" | "False" => Variant::Boolean(false),
        _ => Variant::String(trimmed.to_string().into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_to_value_maps_numeric_kinds_to_number() {
        assert_eq!(variant_to_value(&Variant::Int32(42)), Value::Number(42.0));
        assert_eq!(variant_to_value(&Variant::Double(1.5)), Value::Number(1.5));
    }

    #[test]
    fn variant_to_value_maps_boolean() {
        assert_eq!(variant_to_value(&Variant::Boolean(true)), Value::Bool(true));
    }

    #[test]
    fn value_to_variant_roundtrips_string() {
        let v = Value::String("hello".into());
        match value_to_variant(&v) {
            Variant::String(s) => assert_eq!(s.to_string(), "hello"),
            _ => panic!("expected string variant"),
        }
    }
}
