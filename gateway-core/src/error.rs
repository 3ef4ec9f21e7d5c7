use thiserror::Error;

/// Rejected at an input boundary (tag/connection config that never made it
/// as far as an adapter). Never logged as a stack trace — these are
/// expected, user-facing mistakes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} is required")]
    MissingField { field: &'static str },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("invalid address '{0}'")]
    Address(String),
}

/// Rejected by the Connection Manager before an adapter call is made.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("tag data type {data_type:?} is inconsistent with its address")]
    DataTypeMismatch { data_type: &'static str },
    #[error("connection {0} not found")]
    UnknownConnection(uuid::Uuid),
    #[error("tag {0} not found")]
    UnknownTag(uuid::Uuid),
    #[error("connection {0} protocol does not match tag address kind")]
    ProtocolMismatch(uuid::Uuid),
}

/// The adapter's session failed at the transport level. Status moves to
/// `error`; the adapter retries with its configured backoff; the failure
/// fans out to the Alert Engine via a status-changed event.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection refused")]
    Refused,
    #[error("connection reset")]
    Reset,
    #[error("timed out")]
    TimedOut,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("{0}")]
    Other(String),
}

/// A single protocol operation failed in a way that does not necessarily
/// invalidate the session (bad function code, exception response, bad OPC
/// UA status). Surfaced per-operation.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("modbus exception {0:#04x} on function {1:#04x}")]
    ModbusException(u8, u8),
    #[error("unexpected response shape: {0}")]
    UnexpectedResponse(String),
    #[error("opc ua status {0}")]
    OpcUaStatus(String),
    #[error("address parse error: {0}")]
    Address(String),
}

/// A write failed; does not affect other writes issued in the same batch.
#[derive(Debug, Error)]
#[error("write to {target} failed: {reason}")]
pub struct WriteError {
    pub target: String,
    pub reason: String,
}

/// Logged and counted, never a crash: bridge queue overflow, alert storms.
#[derive(Debug, Error)]
#[error("quota exceeded: {0}")]
pub struct QuotaError(pub String);

/// An invariant was violated inside the gateway itself (batch planner,
/// ring-buffer store). Surfaced at the call site; the caller decides what
/// to do next (there is no generically safe recovery).
#[derive(Debug, Error)]
#[error("internal error: {0}")]
pub struct InternalError(pub String);

/// Umbrella error for call sites that can fail for more than one reason.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error(transparent)]
    Internal(#[from] InternalError),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl ConnectionError {
    /// Classify a raw I/O error by the connection-error set named in the
    /// Modbus TCP section: reset/refused/timed-out/unreachable plus the
    /// tokio-modbus "Port Not Open" string some backends return.
    pub fn classify(err: &std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            ConnectionReset => ConnectionError::Reset,
            ConnectionRefused => ConnectionError::Refused,
            TimedOut => ConnectionError::TimedOut,
            HostUnreachable => ConnectionError::HostUnreachable,
            NetworkUnreachable => ConnectionError::NetworkUnreachable,
            _ => {
                let msg = err.to_string();
                if msg.contains("Port Not Open") {
                    ConnectionError::Other("Port Not Open".into())
                } else {
                    ConnectionError::Other(msg)
                }
            }
        }
    }
}
