use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ConnectionStatus, Quality};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl ThresholdOp {
    pub fn apply(self, value: f64, rhs: f64) -> bool {
        match self {
            ThresholdOp::Gt => value > rhs,
            ThresholdOp::Lt => value < rhs,
            ThresholdOp::Ge => value >= rhs,
            ThresholdOp::Le => value <= rhs,
            ThresholdOp::Eq => value == rhs,
            ThresholdOp::Ne => value != rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RocMode {
    Absolute,
    Percent,
}

/// One of the three condition shapes a tag-bound rule can carry. Evaluated
/// against a running window of `(ts, value)` samples kept by the Alert
/// Engine, not embedded in the rule itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertCondition {
    Threshold { op: ThresholdOp, value: f64 },
    Range { min: f64, max: f64, inside: bool },
    Roc { mode: RocMode, window_s: u64, threshold: f64 },
}

/// What a connection-bound rule compares the connection's live status
/// against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTrigger {
    pub status: ConnectionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "binding", rename_all = "snake_case")]
pub enum AlertBinding {
    Tag { tag_id: Uuid, condition: AlertCondition },
    Connection { connection_id: Uuid, trigger: StatusTrigger },
}

fn default_duration_ms() -> u64 {
    0
}
fn default_cooldown_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: Uuid,
    pub binding: AlertBinding,
    pub severity: AlertSeverity,
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub muted: bool,
    /// Opaque to the core; interpreted by an external notification layer.
    #[serde(default)]
    pub actions: serde_json::Value,
}

fn default_true() -> bool {
    true
}

/// The rule's own state machine position. `Acked` is not a fourth
/// machine state (see Open Question (c)): acknowledgement is recorded only
/// on history rows, this enum stays exactly NORMAL/TRIGGERED/COOLDOWN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Normal,
    Triggered,
    Cooldown,
}

/// One immutable row in the append-only alert history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertHistoryRow {
    pub id: u64,
    pub rule_id: Uuid,
    pub timestamp: i64,
    pub from_state: AlertState,
    pub to_state: AlertState,
    pub value: Option<f64>,
    pub quality: Option<Quality>,
    pub message: String,
    pub acked: bool,
    pub acked_by: Option<String>,
    pub acked_at: Option<i64>,
}

/// Emitted when a rule transitions into `TRIGGERED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertFired {
    pub rule_id: Uuid,
    pub severity: AlertSeverity,
    pub value: Option<f64>,
    pub message: String,
    pub timestamp: i64,
}
