//! The gateway engine: protocol adapters, the connection manager that owns
//! them, the polling/bridge/alert engines built on top, and the persistent
//! ring-buffer store. `gateway-cmd` is the process that wires these
//! together; this crate only defines the pieces and their seams.

pub mod adapter;
pub mod alert;
pub mod batch;
pub mod bridge;
pub mod credential;
pub mod error;
pub mod manager;
pub mod model;
pub mod polling;
pub mod rbs;
pub mod varsub;
pub mod virtual_server;
