//! Alert Engine: per-rule NORMAL/TRIGGERED/COOLDOWN state machine,
//! evaluated against CM's data and status-changed events.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::manager::{CmEvent, ConnectionManager};
use crate::model::{
    AlertBinding, AlertCondition, AlertFired, AlertHistoryRow, AlertRule, AlertSeverity, AlertState, ConnectionStatus,
    Quality, RocMode,
};

struct RuleRuntime {
    rule: AlertRule,
    state: AlertState,
    /// when the condition first started holding continuously, for the
    /// `durationMs` hysteresis check.
    holding_since_ms: Option<i64>,
    cooldown_until_ms: Option<i64>,
    roc_window: VecDeque<(i64, f64)>,
}

pub struct AlertEngine {
    rules: Mutex<HashMap<Uuid, RuleRuntime>>,
    history: Mutex<Vec<AlertHistoryRow>>,
    fired: tokio::sync::broadcast::Sender<AlertFired>,
    next_history_id: std::sync::atomic::AtomicU64,
}

impl AlertEngine {
    pub fn new() -> Self {
        let (fired, _) = tokio::sync::broadcast::channel(256);
        Self {
            rules: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            fired,
            next_history_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AlertFired> {
        self.fired.subscribe()
    }

    pub async fn add_rule(&self, rule: AlertRule) {
        self.rules.lock().await.insert(
            rule.id,
            RuleRuntime { rule, state: AlertState::Normal, holding_since_ms: None, cooldown_until_ms: None, roc_window: VecDeque::new() },
        );
    }

    pub async fn remove_rule(&self, rule_id: Uuid) {
        self.rules.lock().await.remove(&rule_id);
    }

    /// Rules bound to a deleted tag or connection auto-disable rather than
    /// being removed outright, so their history remains attributable.
    pub async fn disable_rules_bound_to_tag(&self, tag_id: Uuid) {
        let mut rules = self.rules.lock().await;
        for runtime in rules.values_mut() {
            if matches!(&runtime.rule.binding, AlertBinding::Tag { tag_id: t, .. } if *t == tag_id) {
                runtime.rule.enabled = false;
            }
        }
    }

    pub async fn disable_rules_bound_to_connection(&self, connection_id: Uuid) {
        let mut rules = self.rules.lock().await;
        for runtime in rules.values_mut() {
            if matches!(&runtime.rule.binding, AlertBinding::Connection { connection_id: c, .. } if *c == connection_id) {
                runtime.rule.enabled = false;
            }
        }
    }

    pub async fn history(&self) -> Vec<AlertHistoryRow> {
        self.history.lock().await.clone()
    }

    pub async fn acknowledge(&self, history_id: u64, acked_by: impl Into<String>, now_ms: i64) {
        let mut history = self.history.lock().await;
        if let Some(row) = history.iter_mut().find(|r| r.id == history_id) {
            row.acked = true;
            row.acked_by = Some(acked_by.into());
            row.acked_at = Some(now_ms);
        }
    }

    async fn evaluate_tag(&self, tag_id: Uuid, value: Option<f64>, quality: Quality, now_ms: i64) {
        let mut rules = self.rules.lock().await;
        for runtime in rules.values_mut() {
            let AlertBinding::Tag { tag_id: bound_tag, condition } = &runtime.rule.binding else { continue };
            if *bound_tag != tag_id || !runtime.rule.enabled {
                continue;
            }
            let Some(value) = value else { continue };
            let holds = condition_holds(condition, value, now_ms, &mut runtime.roc_window);
            self.advance(runtime, holds, Some(value), Some(quality), now_ms).await;
        }
    }

    async fn evaluate_connection(&self, connection_id: Uuid, status: ConnectionStatus, now_ms: i64) {
        let mut rules = self.rules.lock().await;
        for runtime in rules.values_mut() {
            let AlertBinding::Connection { connection_id: bound, trigger } = &runtime.rule.binding else { continue };
            if *bound != connection_id || !runtime.rule.enabled {
                continue;
            }
            let holds = trigger.status == status;
            self.advance(runtime, holds, None, None, now_ms).await;
        }
    }

    async fn advance(&self, runtime: &mut RuleRuntime, holds: bool, value: Option<f64>, quality: Option<Quality>, now_ms: i64) {
        match runtime.state {
            AlertState::Normal => {
                if holds {
                    let since = *runtime.holding_since_ms.get_or_insert(now_ms);
                    if now_ms.saturating_sub(since) >= runtime.rule.duration_ms as i64 {
                        self.transition(runtime, AlertState::Triggered, value, quality, now_ms).await;
                        if !runtime.rule.muted {
                            let _ = self.fired.send(AlertFired {
                                rule_id: runtime.rule.id,
                                severity: runtime.rule.severity,
                                value,
                                message: format!("rule {} triggered", runtime.rule.id),
                                timestamp: now_ms,
                            });
                        }
                    }
                } else {
                    runtime.holding_since_ms = None;
                }
            }
            AlertState::Triggered => {
                if !holds {
                    self.transition(runtime, AlertState::Cooldown, value, quality, now_ms).await;
                    runtime.cooldown_until_ms = Some(now_ms + runtime.rule.cooldown_ms as i64);
                }
            }
            AlertState::Cooldown => {
                if runtime.cooldown_until_ms.map(|until| now_ms >= until).unwrap_or(true) {
                    self.transition(runtime, AlertState::Normal, value, quality, now_ms).await;
                    runtime.holding_since_ms = None;
                    runtime.cooldown_until_ms = None;
                }
            }
        }
    }

    async fn transition(&self, runtime: &mut RuleRuntime, to: AlertState, value: Option<f64>, quality: Option<Quality>, now_ms: i64) {
        let from = runtime.state;
        runtime.state = to;
        let id = self.next_history_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.history.lock().await.push(AlertHistoryRow {
            id,
            rule_id: runtime.rule.id,
            timestamp: now_ms,
            from_state: from,
            to_state: to,
            value,
            quality,
            message: format!("{:?} -> {:?}", from, to),
            acked: false,
            acked_by: None,
            acked_at: None,
        });
    }
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn condition_holds(condition: &AlertCondition, value: f64, now_ms: i64, roc_window: &mut VecDeque<(i64, f64)>) -> bool {
    match condition {
        AlertCondition::Threshold { op, value: rhs } => op.apply(value, *rhs),
        AlertCondition::Range { min, max, inside } => {
            let within = value >= *min && value <= *max;
            if *inside {
                within
            } else {
                !within
            }
        }
        AlertCondition::Roc { mode, window_s, threshold } => {
            roc_window.push_back((now_ms, value));
            let cutoff = now_ms - (*window_s as i64) * 1000;
            while roc_window.front().map(|(ts, _)| *ts < cutoff).unwrap_or(false) {
                roc_window.pop_front();
            }
            let Some(&(_, oldest)) = roc_window.front() else { return false };
            let delta = value - oldest;
            match mode {
                RocMode::Absolute => delta.abs() >= *threshold,
                RocMode::Percent => {
                    if oldest == 0.0 {
                        false
                    } else {
                        (delta / oldest).abs() * 100.0 >= *threshold
                    }
                }
            }
        }
    }
}

/// Drives the engine from CM's event stream; spawned once per running
/// gateway instance.
pub fn spawn_driver(engine: Arc<AlertEngine>, cm: Arc<ConnectionManager>) -> JoinHandle<()> {
    let mut rx = cm.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(CmEvent::Data { points, .. }) => {
                    for point in points {
                        let value = point.value.as_f64();
                        engine.evaluate_tag(point.tag_id, value, point.quality, point.timestamp).await;
                    }
                }
                Ok(CmEvent::StatusChanged { connection_id, status }) => {
                    engine.evaluate_connection(connection_id, status, crate::adapter::now_ms()).await;
                }
                Ok(CmEvent::TagDeleted { tag_id }) => {
                    engine.disable_rules_bound_to_tag(tag_id).await;
                }
                Ok(CmEvent::ConnectionDeleted { connection_id, tag_ids }) => {
                    engine.disable_rules_bound_to_connection(connection_id).await;
                    for tag_id in tag_ids {
                        engine.disable_rules_bound_to_tag(tag_id).await;
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StatusTrigger, ThresholdOp};

    fn threshold_rule(tag_id: Uuid, op: ThresholdOp, rhs: f64, duration_ms: u64, cooldown_ms: u64) -> AlertRule {
        AlertRule {
            id: Uuid::new_v4(),
            binding: AlertBinding::Tag { tag_id, condition: AlertCondition::Threshold { op, value: rhs } },
            severity: AlertSeverity::Warning,
            duration_ms,
            cooldown_ms,
            enabled: true,
            muted: false,
            actions: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn triggers_after_hysteresis_then_cools_down() {
        let engine = AlertEngine::new();
        let tag_id = Uuid::new_v4();
        let rule = threshold_rule(tag_id, ThresholdOp::Gt, 100.0, 500, 1000);
        let rule_id = rule.id;
        engine.add_rule(rule).await;

        engine.evaluate_tag(tag_id, Some(150.0), Quality::Good, 0).await;
        assert_eq!(engine.rules.lock().await.get(&rule_id).unwrap().state, AlertState::Normal);

        engine.evaluate_tag(tag_id, Some(150.0), Quality::Good, 600).await;
        assert_eq!(engine.rules.lock().await.get(&rule_id).unwrap().state, AlertState::Triggered);

        engine.evaluate_tag(tag_id, Some(10.0), Quality::Good, 700).await;
        assert_eq!(engine.rules.lock().await.get(&rule_id).unwrap().state, AlertState::Cooldown);

        engine.evaluate_tag(tag_id, Some(10.0), Quality::Good, 2000).await;
        assert_eq!(engine.rules.lock().await.get(&rule_id).unwrap().state, AlertState::Normal);

        let history = engine.history().await;
        assert_eq!(history.len(), 3);
    }

    #[tokio::test]
    async fn muted_rule_transitions_but_does_not_fire() {
        let engine = AlertEngine::new();
        let tag_id = Uuid::new_v4();
        let mut rule = threshold_rule(tag_id, ThresholdOp::Gt, 10.0, 0, 1000);
        rule.muted = true;
        engine.add_rule(rule).await;
        let mut fired = engine.subscribe();
        engine.evaluate_tag(tag_id, Some(20.0), Quality::Good, 0).await;
        assert!(fired.try_recv().is_err());
    }

    #[tokio::test]
    async fn disabled_rule_never_evaluates() {
        let engine = AlertEngine::new();
        let tag_id = Uuid::new_v4();
        let mut rule = threshold_rule(tag_id, ThresholdOp::Gt, 10.0, 0, 1000);
        rule.enabled = false;
        let rule_id = rule.id;
        engine.add_rule(rule).await;
        engine.evaluate_tag(tag_id, Some(20.0), Quality::Good, 0).await;
        assert_eq!(engine.rules.lock().await.get(&rule_id).unwrap().state, AlertState::Normal);
        assert!(engine.history().await.is_empty());
    }

    #[tokio::test]
    async fn roc_absolute_fires_on_large_delta_within_window() {
        let engine = AlertEngine::new();
        let tag_id = Uuid::new_v4();
        let rule = AlertRule {
            id: Uuid::new_v4(),
            binding: AlertBinding::Tag { tag_id, condition: AlertCondition::Roc { mode: RocMode::Absolute, window_s: 10, threshold: 5.0 } },
            severity: AlertSeverity::Critical,
            duration_ms: 0,
            cooldown_ms: 1000,
            enabled: true,
            muted: false,
            actions: serde_json::Value::Null,
        };
        let rule_id = rule.id;
        engine.add_rule(rule).await;
        engine.evaluate_tag(tag_id, Some(10.0), Quality::Good, 0).await;
        engine.evaluate_tag(tag_id, Some(20.0), Quality::Good, 1000).await;
        assert_eq!(engine.rules.lock().await.get(&rule_id).unwrap().state, AlertState::Triggered);
    }

    #[tokio::test]
    async fn connection_status_rule_fires_on_match() {
        let engine = AlertEngine::new();
        let connection_id = Uuid::new_v4();
        let rule = AlertRule {
            id: Uuid::new_v4(),
            binding: AlertBinding::Connection { connection_id, trigger: StatusTrigger { status: ConnectionStatus::Error } },
            severity: AlertSeverity::Critical,
            duration_ms: 0,
            cooldown_ms: 1000,
            enabled: true,
            muted: false,
            actions: serde_json::Value::Null,
        };
        let rule_id = rule.id;
        engine.add_rule(rule).await;
        engine.evaluate_connection(connection_id, ConnectionStatus::Error, 0).await;
        assert_eq!(engine.rules.lock().await.get(&rule_id).unwrap().state, AlertState::Triggered);
    }
}
