use std::sync::atomic::{AtomicU8, Ordering};

use tracing::info;

use crate::model::ConnectionStatus;

/// Lock-free status cell every adapter owns. Tracks the four-state
/// `ConnectionStatus` machine plus a terminal `Disposed` value
/// reachable only via `dispose()`.
pub(crate) struct StatusCell {
    raw: AtomicU8,
    label: String,
}

const DISCONNECTED: u8 = 0;
const CONNECTING: u8 = 1;
const CONNECTED: u8 = 2;
const ERROR: u8 = 3;
const DISPOSED: u8 = 4;

impl StatusCell {
    pub(crate) fn new(label: impl Into<String>) -> Self {
        Self { raw: AtomicU8::new(DISCONNECTED), label: label.into() }
    }

    pub(crate) fn load(&self) -> ConnectionStatus {
        decode(self.raw.load(Ordering::Acquire))
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.raw.load(Ordering::Acquire) == DISPOSED
    }

    pub(crate) fn store(&self, to: ConnectionStatus) {
        let from = self.raw.swap(encode(to), Ordering::AcqRel);
        if from != encode(to) {
            info!(connection = %self.label, from = %decode(from), to = %to_str(to), "status transition");
        }
    }

    pub(crate) fn dispose(&self) {
        self.raw.store(DISPOSED, Ordering::Release);
        info!(connection = %self.label, "disposed");
    }
}

fn encode(status: ConnectionStatus) -> u8 {
    match status {
        ConnectionStatus::Disconnected => DISCONNECTED,
        ConnectionStatus::Connecting => CONNECTING,
        ConnectionStatus::Connected => CONNECTED,
        ConnectionStatus::Error => ERROR,
    }
}

fn decode(raw: u8) -> ConnectionStatus {
    match raw {
        CONNECTING => ConnectionStatus::Connecting,
        CONNECTED => ConnectionStatus::Connected,
        ERROR => ConnectionStatus::Error,
        _ => ConnectionStatus::Disconnected,
    }
}

fn to_str(status: ConnectionStatus) -> &'static str {
    match status {
        ConnectionStatus::Disconnected => "disconnected",
        ConnectionStatus::Connecting => "connecting",
        ConnectionStatus::Connected => "connected",
        ConnectionStatus::Error => "error",
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(to_str(*self))
    }
}
