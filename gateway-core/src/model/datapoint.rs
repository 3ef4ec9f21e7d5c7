use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Quality tag attached to every value an adapter produces. Mirrors OPC UA's
/// good/bad/uncertain split so all three protocols can report through one
/// field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Good,
    Bad,
    Uncertain,
}

/// The value carried by a DataPoint. Kept to the three shapes the data
/// model calls for; adapters are responsible for mapping their native wire
/// types onto one of these before a DataPoint is constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Bool(bool),
    String(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.parse().ok(),
        }
    }
}

/// One reading, immutable once emitted. Produced by an adapter (directly,
/// or via the Polling Engine wrapping a `ReadResult`) and consumed by the
/// Ring-Buffer Store, the Bridge Engine, and the Alert Engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPoint {
    pub tag_id: Uuid,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub value: Value,
    pub quality: Quality,
}

impl DataPoint {
    pub fn new(tag_id: Uuid, timestamp: i64, value: Value, quality: Quality) -> Self {
        Self { tag_id, timestamp, value, quality }
    }
}
