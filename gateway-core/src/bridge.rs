//! Bridge Engine: forwards DataPoints from a source connection to
//! writes on a target connection, with per-tag rate limiting, template
//! rendering, and a bounded, drop-oldest write queue for when the target
//! is disconnected.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::manager::{CmEvent, ConnectionManager};
use crate::model::{Bridge, BridgeStats, BridgeStatus, DataPoint, Quality, Value};

/// Per-source-tag token bucket for `options.max_messages_per_sec`.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_ms: f64,
    last_refill: i64,
}

impl TokenBucket {
    fn new(per_sec: u32, now_ms: i64) -> Self {
        let capacity = per_sec.max(1) as f64;
        Self { capacity, tokens: capacity, refill_per_ms: capacity / 1000.0, last_refill: now_ms }
    }

    fn allow(&mut self, now_ms: i64) -> bool {
        let elapsed = (now_ms - self.last_refill).max(0) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_per_ms).min(self.capacity);
        self.last_refill = now_ms;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// A pending write whose target/payload templates are already rendered
/// (against the point that produced it), so a retry on reconnect replays
/// exactly what would have been sent at the time.
struct QueuedWrite {
    target: String,
    payload: String,
}

struct Runtime {
    bridge: Bridge,
    stats: BridgeStats,
    buckets: HashMap<Uuid, TokenBucket>,
    queue: VecDeque<QueuedWrite>,
    paused: bool,
    error_until_ms: Option<i64>,
}

pub struct RunningBridge {
    handle: JoinHandle<()>,
    state: Arc<Mutex<Runtime>>,
}

/// Renders `{{placeholder}}` tokens against one forwarded point. Unknown
/// tokens render as the empty string.
fn render_template(template: &str, tag_name: &str, tag_id: Uuid, value: &Value, timestamp: i64, quality: Quality, connection_id: Uuid) -> String {
    let value_str = match value {
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::String(s) => s.clone(),
    };
    let quality_str = match quality {
        Quality::Good => "good",
        Quality::Bad => "bad",
        Quality::Uncertain => "uncertain",
    };
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let Some(end) = rest[start..].find("}}") else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let token = rest[start + 2..start + end].trim();
        let rendered = match token {
            "tagName" => tag_name.to_string(),
            "tagId" => tag_id.to_string(),
            "value" => value_str.clone(),
            "timestamp" => timestamp.to_string(),
            "quality" => quality_str.to_string(),
            "connectionId" => connection_id.to_string(),
            _ => String::new(),
        };
        out.push_str(&rendered);
        rest = &rest[start + end + 2..];
    }
    out.push_str(rest);
    out
}

pub fn start(bridge: Bridge, cm: Arc<ConnectionManager>) -> RunningBridge {
    let mut cm_events = cm.subscribe();
    let source_tags: std::collections::HashSet<Uuid> = bridge.source_tag_ids.iter().copied().collect();
    let source_connection_id = bridge.source_connection_id;
    let options = bridge.options.clone();
    let state = Arc::new(Mutex::new(Runtime {
        bridge,
        stats: BridgeStats::default(),
        buckets: HashMap::new(),
        queue: VecDeque::new(),
        paused: options.paused,
        error_until_ms: None,
    }));
    {
        let mut guard = futures_lock_now(&state);
        guard.bridge.status = BridgeStatus::Active;
    }

    let task_state = Arc::clone(&state);
    let handle = tokio::spawn(async move {
        loop {
            match cm_events.recv().await {
                Ok(CmEvent::Data { connection_id, points }) if connection_id == source_connection_id => {
                    for point in points {
                        if source_tags.contains(&point.tag_id) {
                            handle_point(&task_state, &cm, point).await;
                        }
                    }
                }
                Ok(CmEvent::StatusChanged { connection_id, status }) => {
                    let target_id = task_state.lock().await.bridge.target_connection_id;
                    if connection_id == target_id && status == crate::model::ConnectionStatus::Connected {
                        flush_queue(&task_state, &cm).await;
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    RunningBridge { handle, state }
}

fn futures_lock_now(state: &Arc<Mutex<Runtime>>) -> tokio::sync::MutexGuard<'_, Runtime> {
    state.try_lock().expect("bridge state uncontended at startup")
}

async fn handle_point(state: &Arc<Mutex<Runtime>>, cm: &Arc<ConnectionManager>, point: DataPoint) {
    let mut guard = state.lock().await;
    if guard.paused {
        return;
    }
    if point.quality != Quality::Good && !guard.bridge.options.include_bad {
        guard.stats.dropped_count += 1;
        return;
    }
    if let Some(per_sec) = guard.bridge.options.max_messages_per_sec {
        let now = crate::adapter::now_ms();
        let bucket = guard.buckets.entry(point.tag_id).or_insert_with(|| TokenBucket::new(per_sec, now));
        if !bucket.allow(now) {
            guard.stats.dropped_count += 1;
            return;
        }
    }

    let source_connection_id = guard.bridge.source_connection_id;
    let tag_name = cm.get_tag(source_connection_id, point.tag_id).map(|t| t.name).unwrap_or_else(|| point.tag_id.to_string());
    let target = render_template(
        &guard.bridge.target_config.topic_or_node_template,
        &tag_name,
        point.tag_id,
        &point.value,
        point.timestamp,
        point.quality,
        source_connection_id,
    );
    let payload = render_template(
        &guard.bridge.target_config.payload_template,
        &tag_name,
        point.tag_id,
        &point.value,
        point.timestamp,
        point.quality,
        source_connection_id,
    );

    if let Some(until) = guard.error_until_ms {
        if crate::adapter::now_ms() < until {
            enqueue(&mut guard, target, payload);
            return;
        }
        guard.error_until_ms = None;
        guard.bridge.status = BridgeStatus::Active;
    }
    let target_connection_id = guard.bridge.target_connection_id;
    let backoff_ms = guard.bridge.options.backoff_ms;
    drop(guard);
    write_and_record(state, cm, target_connection_id, target, payload, backoff_ms, point.timestamp).await;
}

async fn write_and_record(
    state: &Arc<Mutex<Runtime>>,
    cm: &Arc<ConnectionManager>,
    target_connection_id: Uuid,
    target: String,
    payload: String,
    backoff_ms: u64,
    timestamp: i64,
) {
    match cm.write_raw(target_connection_id, &target, &payload).await {
        Ok(result) if result.status == crate::adapter::WriteStatus::Good => {
            let mut guard = state.lock().await;
            guard.stats.forwarded_count += 1;
            guard.stats.last_forward_at = Some(timestamp);
        }
        Ok(result) => {
            let message = result.error.unwrap_or_else(|| "write failed".into());
            on_write_failure(state, &message, backoff_ms, target, payload).await;
        }
        Err(err) => {
            on_write_failure(state, &err.to_string(), backoff_ms, target, payload).await;
        }
    }
}

async fn on_write_failure(state: &Arc<Mutex<Runtime>>, message: &str, backoff_ms: u64, target: String, payload: String) {
    let mut guard = state.lock().await;
    guard.stats.error_count += 1;
    guard.stats.last_error = Some(message.to_string());
    guard.bridge.status = BridgeStatus::Error;
    guard.error_until_ms = Some(crate::adapter::now_ms() + backoff_ms as i64);
    enqueue(&mut guard, target, payload);
    warn!(bridge = %guard.bridge.id, error = %message, "bridge write failed, queuing for retry");
}

fn enqueue(runtime: &mut Runtime, target: String, payload: String) {
    if runtime.queue.len() >= runtime.bridge.options.queue_max {
        runtime.queue.pop_front();
        runtime.stats.dropped_count += 1;
    }
    runtime.queue.push_back(QueuedWrite { target, payload });
}

async fn flush_queue(state: &Arc<Mutex<Runtime>>, cm: &Arc<ConnectionManager>) {
    let (target_connection_id, drained): (Uuid, Vec<QueuedWrite>) = {
        let mut guard = state.lock().await;
        (guard.bridge.target_connection_id, guard.queue.drain(..).collect())
    };
    for item in drained {
        match cm.write_raw(target_connection_id, &item.target, &item.payload).await {
            Ok(result) if result.status == crate::adapter::WriteStatus::Good => {
                let mut guard = state.lock().await;
                guard.stats.forwarded_count += 1;
            }
            _ => {
                let mut guard = state.lock().await;
                enqueue(&mut guard, item.target, item.payload);
                break;
            }
        }
    }
}

impl RunningBridge {
    pub async fn pause(&self) {
        let mut guard = self.state.lock().await;
        guard.paused = true;
        guard.bridge.status = BridgeStatus::Paused;
    }

    pub async fn resume(&self) {
        let mut guard = self.state.lock().await;
        guard.paused = false;
        guard.bridge.status = BridgeStatus::Active;
    }

    pub async fn stats(&self) -> BridgeStats {
        self.state.lock().await.stats.clone()
    }

    pub async fn status(&self) -> BridgeStatus {
        self.state.lock().await.bridge.status
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataPoint;

    #[test]
    fn token_bucket_depletes_then_refills() {
        let mut bucket = TokenBucket::new(2, 0);
        assert!(bucket.allow(0));
        assert!(bucket.allow(0));
        assert!(!bucket.allow(0));
        assert!(bucket.allow(1000));
    }

    #[test]
    fn render_template_substitutes_known_tokens_and_blanks_unknown() {
        let id = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let rendered = render_template(
            "plant/{{tagName}}/{{unknownToken}}",
            "tank-level",
            id,
            &Value::Number(42.0),
            1000,
            Quality::Good,
            conn,
        );
        assert_eq!(rendered, "plant/tank-level/");
    }

    #[test]
    fn render_template_renders_value_and_quality() {
        let rendered = render_template("{{value}}:{{quality}}", "t", Uuid::new_v4(), &Value::Bool(true), 0, Quality::Uncertain, Uuid::new_v4());
        assert_eq!(rendered, "true:uncertain");
    }

    #[test]
    fn enqueue_drops_oldest_past_queue_max() {
        let bridge = Bridge {
            id: Uuid::new_v4(),
            source_connection_id: Uuid::new_v4(),
            source_tag_ids: vec![],
            target_connection_id: Uuid::new_v4(),
            target_config: crate::model::TargetConfig { topic_or_node_template: String::new(), payload_template: String::new() },
            options: crate::model::BridgeOptions { queue_max: 2, ..Default::default() },
            status: BridgeStatus::Idle,
        };
        let mut runtime = Runtime {
            bridge,
            stats: BridgeStats::default(),
            buckets: HashMap::new(),
            queue: VecDeque::new(),
            paused: false,
            error_until_ms: None,
        };
        enqueue(&mut runtime, "t/1".into(), "1".into());
        enqueue(&mut runtime, "t/2".into(), "2".into());
        enqueue(&mut runtime, "t/3".into(), "3".into());
        assert_eq!(runtime.queue.len(), 2);
        assert_eq!(runtime.stats.dropped_count, 1);
        assert_eq!(runtime.queue.front().unwrap().target, "t/2");
        let _ = DataPoint::new(Uuid::new_v4(), 0, Value::Number(0.0), Quality::Good);
    }
}
