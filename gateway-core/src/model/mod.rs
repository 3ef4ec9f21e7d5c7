mod alert;
mod bridge;
mod connection;
mod datapoint;
mod env;
mod tag;

pub use alert::{
    AlertBinding, AlertCondition, AlertFired, AlertHistoryRow, AlertRule, AlertSeverity, AlertState, RocMode,
    StatusTrigger, ThresholdOp,
};
pub use bridge::{Bridge, BridgeOptions, BridgeStats, BridgeStatus, TargetConfig};
pub use connection::{Connection, ConnectionMetrics, ConnectionStatus, Protocol, ProtocolConfig};
pub use datapoint::{DataPoint, Quality, Value};
pub use env::Environment;
pub use tag::{DataType, ModbusAddress, MqttAddress, OpcUaAddress, RegisterType, Tag, TagAddress};
