//! MQTT adapter: a single `rumqttc` client per connection, a
//! background task draining the event loop into a per-tag cache, and a
//! simplified single-level/multi-level topic matcher adapted from the
//! broker-side wildcard grammar.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{broadcast, Mutex};
use tracing::warn;
use uuid::Uuid;

use crate::error::{ConnectionError, Result};
use crate::model::{
    Connection, ConnectionMetrics, ConnectionStatus, DataType, MqttConfig, ProtocolConfig, Quality, Tag,
    TagAddress, Value,
};

use super::backoff::Backoff;
use super::state::StatusCell;
use super::{now_ms, AdapterEvent, Credential, ProtocolAdapter, ReadResult, WriteResult};

#[derive(Clone)]
struct Cached {
    value: Value,
    quality: Quality,
    timestamp: i64,
}

struct Inner {
    connection_id: Uuid,
    config: MqttConfig,
    status: StatusCell,
    metrics: Mutex<ConnectionMetrics>,
    client: Mutex<Option<AsyncClient>>,
    cache: DashMap<String, Cached>,
    events: broadcast::Sender<AdapterEvent>,
    reconnecting: AtomicBool,
    backoff: Mutex<Backoff>,
}

pub struct MqttAdapter(Arc<Inner>);

pub fn build(connection: &Connection) -> Box<dyn ProtocolAdapter> {
    let ProtocolConfig::Mqtt(config) = connection.config.clone() else {
        panic!("mqtt adapter built for non-mqtt connection");
    };
    let (events, _) = broadcast::channel(256);
    Box::new(MqttAdapter(Arc::new(Inner {
        connection_id: connection.id,
        config,
        status: StatusCell::new(connection.name.clone()),
        metrics: Mutex::new(ConnectionMetrics::default()),
        client: Mutex::new(None),
        cache: DashMap::new(),
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

    fn build_options(&self, credential: &Credential) -> std::result::Result<MqttOptions, ConnectionError> {
        let url = url::Url::parse(&self.config.broker_url)
            .map_err(|e| ConnectionError::Other(format!("bad broker_url: {e}")))?;
        let host = url.host_str().ok_or_else(|| ConnectionError::Other("broker_url has no host".into()))?;
        let port = url.port().unwrap_or(if self.config.use_tls.unwrap_or(false) { 8883 } else { 1883 });
        let mut opts = MqttOptions::new(self.config.client_id.clone(), host, port);
        opts.set_keep_alive(Duration::from_secs(30));

        let username = credential.username.clone().or_else(|| self.config.username.clone());
        let password = credential.password.clone().or_else(|| self.config.password.clone());
        if let (Some(u), Some(p)) = (username, password) {
            opts.set_credentials(u, p);
        }
        Ok(opts)
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
                let credential = Credential::default();
                match connect_inner(&inner, &credential).await {
                    Ok(()) => {
                        inner.reconnecting.store(false, Ordering::Release);
                        return;
                    }
                    Err(err) => warn!(connection = %inner.connection_id, error = %err, "mqtt reconnect attempt failed"),
                }
            }
        });
    }
}

async fn connect_inner(inner: &Arc<Inner>, credential: &Credential) -> std::result::Result<(), ConnectionError> {
    let opts = inner.build_options(credential)?;
    let (client, mut eventloop) = AsyncClient::new(opts, 256);
    // re-subscribe every previously tracked topic so a reconnect doesn't
    // silently go deaf on tags that were already cached before the drop.
    for key in subscribed_keys(inner) {
        let _ = client.subscribe(key.pattern, QoS::AtLeastOnce).await;
    }
    *inner.client.lock().await = Some(client);
    inner.set_status(ConnectionStatus::Connected, None);
    inner.backoff.lock().await.reset();

    let task_inner = Arc::clone(inner);
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handle_publish(&task_inner, &publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(err) => {
                    if task_inner.status.is_disposed() {
                        return;
                    }
                    task_inner.set_status(ConnectionStatus::Error, Some(err.to_string()));
                    *task_inner.client.lock().await = None;
                    task_inner.spawn_reconnect();
                    return;
                }
            }
        }
    });
    Ok(())
}

fn handle_publish(inner: &Arc<Inner>, topic: &str, payload: &[u8]) {
    let text = String::from_utf8_lossy(payload);
    let json: Option<serde_json::Value> = serde_json::from_str(&text).ok();
    // matching happens against the registered (pattern, json_path) keys, not
    // the concrete topic, so tags sharing a wildcard subscription all update.
    let now = now_ms();
    for key in subscribed_keys(inner) {
        if !topic_matches(&key.pattern, topic) {
            continue;
        }
        let value = extract_value(&text, json.as_ref(), key.json_path.as_deref());
        let cache_key = cache_key_for(&key.pattern, key.json_path.as_deref());
        inner.cache.insert(
            cache_key,
            Cached { value, quality: Quality::Good, timestamp: now },
        );
    }
}

struct SubKey {
    pattern: String,
    json_path: Option<String>,
}

fn subscribed_keys(inner: &Arc<Inner>) -> Vec<SubKey> {
    inner
        .cache
        .iter()
        .map(|e| parse_cache_key(e.key()))
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect()
}

fn cache_key_for(pattern: &str, json_path: Option<&str>) -> String {
    format!("{pattern}\u{1}{}", json_path.unwrap_or(""))
}

fn parse_cache_key(key: &str) -> Option<SubKey> {
    let mut parts = key.splitn(2, '\u{1}');
    let pattern = parts.next()?.to_string();
    let json_path = parts.next().filter(|s| !s.is_empty()).map(|s| s.to_string());
    Some(SubKey { pattern, json_path })
}

/// Matches a subscription pattern (`+` single-level, `#` trailing
/// multi-level) against a concrete published topic.
fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pat: Vec<&str> = pattern.split('/').collect();
    let top: Vec<&str> = topic.split('/').collect();
    let mut pi = 0;
    let mut ti = 0;
    while pi < pat.len() {
        match pat[pi] {
            "#" => return true,
            "+" => {
                if ti >= top.len() {
                    return false;
                }
                pi += 1;
                ti += 1;
            }
            literal => {
                if ti >= top.len() || top[ti] != literal {
                    return false;
                }
                pi += 1;
                ti += 1;
            }
        }
    }
    ti == top.len()
}

/// Heuristic payload parse: numeric string, `true`/`false`, a JSON path
/// extraction when `json_path` is set, else the raw text.
fn extract_value(text: &str, json: Option<&serde_json::Value>, json_path: Option<&str>) -> Value {
    if let (Some(root), Some(path)) = (json, json_path) {
        if let Some(v) = walk_json_path(root, path) {
            return json_to_value(v);
        }
    }
    if let Some(j) = json {
        return json_to_value(j);
    }
    heuristic_parse(text)
}

fn heuristic_parse(text: &str) -> Value {
    let trimmed = text.trim();
    if let Ok(n) = trimmed.parse::<f64>() {
        return Value::Number(n);
    }
    match trimmed {
        "true" | "TRUE" | "True" | "on" | "ON" | "On" => Value::Bool(true),
        "false" | "FALSE" | "False" | "off" | "OFF" | "Off" => Value::Bool(false),
        _ => Value::String(trimmed.to_string()),
    }
}

fn json_to_value(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => heuristic_parse(s),
        other => Value::String(other.to_string()),
    }
}

/// Dotted/bracketed path, e.g. `data.channels[0].value`.
fn walk_json_path<'a>(root: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = root;
    for segment in path.split('.') {
        let (name, index) = match segment.find('[') {
            Some(idx) => {
                let name = &segment[..idx];
                let idx_str = segment[idx + 1..].trim_end_matches(']');
                (name, idx_str.parse::<usize>().ok())
            }
            None => (segment, None),
        };
        if !name.is_empty() {
            current = current.get(name)?;
        }
        if let Some(i) = index {
            current = current.get(i)?;
        }
    }
    Some(current)
}

#[async_trait]
impl ProtocolAdapter for MqttAdapter {
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
                Err(err.into())
            }
        }
    }

    async fn disconnect(&self) {
        if let Some(client) = self.0.client.lock().await.take() {
            let _ = client.disconnect().await;
        }
        self.0.set_status(ConnectionStatus::Disconnected, None);
    }

    async fn read_tags(&self, tags: &[Tag]) -> Vec<ReadResult> {
        let client_guard = self.0.client.lock().await;
        let mut out = Vec::with_capacity(tags.len());
        for tag in tags {
            let TagAddress::Mqtt(addr) = &tag.address else { continue };
            if !tag.enabled {
                continue;
            }
            let cache_key = cache_key_for(&addr.topic, addr.json_path.as_deref());
            if client_guard.is_some() && !self.0.cache.contains_key(&cache_key) {
                // first sight of this tag: subscribe and placeholder so the
                // background task's subscribed_keys() picks it up.
                if let Some(client) = client_guard.as_ref() {
                    if client.subscribe(addr.topic.clone(), QoS::AtLeastOnce).await.is_err() {
                        continue;
                    }
                }
                self.0.cache.insert(
                    cache_key.clone(),
                    Cached { value: Value::Number(0.0), quality: Quality::Uncertain, timestamp: now_ms() },
                );
            }
            match self.0.cache.get(&cache_key) {
                Some(entry) => out.push(ReadResult {
                    tag_id: tag.id,
                    value: entry.value.clone(),
                    quality: entry.quality,
                    timestamp: entry.timestamp,
                }),
                None => out.push(ReadResult {
                    tag_id: tag.id,
                    value: Value::Number(0.0),
                    quality: Quality::Uncertain,
                    timestamp: now_ms(),
                }),
            }
        }
        out
    }

    async fn write(&self, tag: &Tag, value: Value, _data_type: Option<DataType>) -> WriteResult {
        let TagAddress::Mqtt(addr) = &tag.address else {
            return WriteResult::failed("tag is not mqtt-addressed");
        };
        let client_guard = self.0.client.lock().await;
        let Some(client) = client_guard.as_ref() else {
            return WriteResult::failed("not connected");
        };
        let payload = match &value {
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::String(s) => s.clone(),
        };
        match client.publish(addr.topic.clone(), QoS::AtLeastOnce, false, payload).await {
            Ok(()) => WriteResult::ok(),
            Err(err) => WriteResult::failed(err.to_string()),
        }
    }

    /// Bridge write path: publishes `payload` verbatim to the topic
    /// rendered from `targetConfig.topicTemplate`.
    async fn write_raw(&self, target: &str, payload: &str) -> WriteResult {
        let client_guard = self.0.client.lock().await;
        let Some(client) = client_guard.as_ref() else {
            return WriteResult::failed("not connected");
        };
        match client.publish(target.to_string(), QoS::AtLeastOnce, false, payload.to_string()).await {
            Ok(()) => WriteResult::ok(),
            Err(err) => WriteResult::failed(err.to_string()),
        }
    }

    async fn dispose(&self) {
        self.0.status.dispose();
        if let Some(client) = self.0.client.lock().await.take() {
            let _ = client.disconnect().await;
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_level_wildcard_matches_one_segment() {
        assert!(topic_matches("plant/+/temperature", "plant/line1/temperature"));
        assert!(!topic_matches("plant/+/temperature", "plant/line1/zone2/temperature"));
    }

    #[test]
    fn multi_level_wildcard_matches_remainder() {
        assert!(topic_matches("plant/line1/#", "plant/line1/zone2/temperature"));
        assert!(topic_matches("plant/line1/#", "plant/line1"));
    }

    #[test]
    fn literal_topics_require_exact_match() {
        assert!(topic_matches("plant/line1/temperature", "plant/line1/temperature"));
        assert!(!topic_matches("plant/line1/temperature", "plant/line2/temperature"));
    }

    #[test]
    fn json_path_extracts_nested_numeric_field() {
        let root: serde_json::Value = serde_json::from_str(r#"{"data":{"channels":[{"value":42.5}]}}"#).unwrap();
        let found = walk_json_path(&root, "data.channels[0].value").unwrap();
        assert_eq!(found.as_f64(), Some(42.5));
    }

    #[test]
    fn heuristic_parse_recognizes_bool_and_number() {
        assert_eq!(heuristic_parse("true"), Value::Bool(true));
        assert_eq!(heuristic_parse("12.5"), Value::Number(12.5));
        assert_eq!(heuristic_parse("idle"), Value::String("idle".to_string()));
    }
}
