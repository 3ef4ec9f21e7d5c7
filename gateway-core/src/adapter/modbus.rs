//! Modbus TCP adapter: FC01/02/03/04 reads via the Batch Read
//! Planner, FC06/16 writes, exponential-backoff reconnect on the
//! teacher's connection-error set.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::time;
use tokio_modbus::client::{tcp, Context, Reader, Writer};
use tokio_modbus::prelude::SlaveContext;
use tokio_modbus::Slave;
use tracing::warn;
use uuid::Uuid;

use gateway_proto::{bytes_to_words, words_to_bytes_i32, words_to_bytes_u32, words_to_f32, ByteOrder};

use crate::batch::{plan_reads, BatchReadConfig, ReadBatch};
use crate::error::{ConnectionError, Result};
use crate::model::{
    Connection, ConnectionMetrics, ConnectionStatus, DataType, ModbusAddress, ModbusTcpConfig, ProtocolConfig,
    Quality, RegisterType, Tag, TagAddress, Value,
};

use super::backoff::Backoff;
use super::state::StatusCell;
use super::{now_ms, AdapterEvent, Credential, ProtocolAdapter, ReadResult, WriteResult};

struct Inner {
    connection_id: Uuid,
    config: ModbusTcpConfig,
    status: StatusCell,
    metrics: Mutex<ConnectionMetrics>,
    session: Mutex<Option<Context>>,
    events: broadcast::Sender<AdapterEvent>,
    reconnecting: AtomicBool,
    backoff: Mutex<Backoff>,
}

pub struct ModbusTcpAdapter(Arc<Inner>);

pub fn build(connection: &Connection) -> Box<dyn ProtocolAdapter> {
    let ProtocolConfig::ModbusTcp(config) = connection.config.clone() else {
        panic!("modbus adapter built for non-modbus connection");
    };
    let (events, _) = broadcast::channel(256);
    Box::new(ModbusTcpAdapter(Arc::new(Inner {
        connection_id: connection.id,
        config,
        status: StatusCell::new(connection.name.clone()),
        metrics: Mutex::new(ConnectionMetrics::default()),
        session: Mutex::new(None),
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

    async fn connect_once(&self) -> std::io::Result<Context> {
        let addr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad host:port"))?;
        let mut ctx = time::timeout(Duration::from_millis(self.config.timeout_ms), tcp::connect(addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
        ctx.set_slave(Slave(self.config.unit_id));
        Ok(ctx)
    }

    /// Spawns the reconnect loop exactly once; subsequent connection-class
    /// errors observe `reconnecting` already set and do nothing.
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
                time::sleep(delay).await;
                if inner.status.is_disposed() {
                    inner.reconnecting.store(false, Ordering::Release);
                    return;
                }
                match inner.connect_once().await {
                    Ok(ctx) => {
                        *inner.session.lock().await = Some(ctx);
                        inner.set_status(ConnectionStatus::Connected, None);
                        inner.backoff.lock().await.reset();
                        inner.reconnecting.store(false, Ordering::Release);
                        return;
                    }
                    Err(err) => {
                        warn!(connection = %inner.connection_id, error = %err, "modbus reconnect attempt failed");
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ProtocolAdapter for ModbusTcpAdapter {
    async fn connect(&self, _credential: &Credential) -> Result<()> {
        if self.0.status.load() == ConnectionStatus::Connected {
            return Ok(());
        }
        self.0.set_status(ConnectionStatus::Connecting, None);
        match self.0.connect_once().await {
            Ok(ctx) => {
                *self.0.session.lock().await = Some(ctx);
                self.0.set_status(ConnectionStatus::Connected, None);
                self.0.backoff.lock().await.reset();
                Ok(())
            }
            Err(err) => {
                let classified = ConnectionError::classify(&err);
                self.0.set_status(ConnectionStatus::Error, Some(classified.to_string()));
                self.0.spawn_reconnect();
                Err(classified.into())
            }
        }
    }

    async fn disconnect(&self) {
        self.0.reconnecting.store(true, Ordering::Release); // block any in-flight reconnect loop from winning the race
        *self.0.session.lock().await = None;
        self.0.set_status(ConnectionStatus::Disconnected, None);
        self.0.reconnecting.store(false, Ordering::Release);
    }

    async fn read_tags(&self, tags: &[Tag]) -> Vec<ReadResult> {
        let modbus_tags: Vec<Tag> = tags
            .iter()
            .filter(|t| t.enabled && matches!(t.address, TagAddress::Modbus(_)))
            .cloned()
            .collect();
        if modbus_tags.is_empty() {
            return Vec::new();
        }
        let by_id: HashMap<Uuid, &Tag> = modbus_tags.iter().map(|t| (t.id, t)).collect();

        let batch_cfg = BatchReadConfig {
            enabled: self.0.config.batch_read.enabled,
            max_gap: self.0.config.batch_read.max_gap,
            max_registers: self.0.config.batch_read.max_registers,
        };
        let plan = plan_reads(&modbus_tags, &batch_cfg, self.0.config.unit_id);

        let mut out = Vec::with_capacity(modbus_tags.len());
        let mut session = self.0.session.lock().await;
        let Some(ctx) = session.as_mut() else {
            return modbus_tags
                .iter()
                .map(|t| ReadResult { tag_id: t.id, value: Value::Number(0.0), quality: Quality::Bad, timestamp: now_ms() })
                .collect();
        };

        let mut aborted = false;
        for batch in &plan {
            if aborted {
                bad_fill(&mut out, batch, &by_id);
                continue;
            }
            let started = std::time::Instant::now();
            match read_one_batch(ctx, batch).await {
                Ok(raw) => {
                    decode_batch(&mut out, batch, &raw, &by_id, self.0.config.default_byte_order);
                    let latency = started.elapsed().as_millis() as u64;
                    let mut metrics = self.0.metrics.lock().await;
                    metrics.record_success(now_ms(), latency);
                    self.0.emit(AdapterEvent::MetricsUpdated(metrics.clone()));
                }
                Err(err) => {
                    let mut metrics = self.0.metrics.lock().await;
                    metrics.record_error(now_ms(), err.to_string());
                    self.0.emit(AdapterEvent::MetricsUpdated(metrics.clone()));
                    if is_connection_class(&err) {
                        aborted = true;
                    }
                    bad_fill(&mut out, batch, &by_id);
                }
            }
        }

        if aborted {
            *session = None;
            drop(session);
            self.0.set_status(ConnectionStatus::Error, Some("connection lost mid-batch".into()));
            self.0.spawn_reconnect();
        }

        // preserve input order.
        let mut by_tag: HashMap<Uuid, ReadResult> = out.into_iter().map(|r| (r.tag_id, r)).collect();
        modbus_tags.iter().filter_map(|t| by_tag.remove(&t.id)).collect()
    }

    async fn write(&self, tag: &Tag, value: Value, data_type: Option<DataType>) -> WriteResult {
        let TagAddress::Modbus(addr) = &tag.address else {
            return WriteResult::failed("tag is not modbus-addressed");
        };
        let mut session = self.0.session.lock().await;
        let Some(ctx) = session.as_mut() else {
            return WriteResult::failed("not connected");
        };
        let dt = data_type.unwrap_or(tag.data_type);
        let order = addr.byte_order.unwrap_or(self.0.config.default_byte_order);
        let result = write_one(ctx, addr.register_type, addr.address, dt, &value, order).await;
        match result {
            Ok(()) => WriteResult::ok(),
            Err(err) => {
                if is_connection_class(&err) {
                    drop(session);
                    *self.0.session.lock().await = None;
                    self.0.set_status(ConnectionStatus::Error, Some(err.to_string()));
                    self.0.spawn_reconnect();
                }
                WriteResult::failed(err.to_string())
            }
        }
    }

    /// Bridge write path: `target` is a Modicon/IEC reference
    /// (`"40001"`, `"HR0"`, ...) rendered by the Bridge Engine's topic
    /// template, `payload` a numeric string rendered by its payload
    /// template. Always writes a single holding register — bridging onto
    /// bit-addressable or multi-register targets isn't expressible from a
    /// bare address string and isn't attempted.
    async fn write_raw(&self, target: &str, payload: &str) -> WriteResult {
        let (register_type, address) = match ModbusAddress::parse_modicon(target) {
            Ok(v) => v,
            Err(err) => return WriteResult::failed(err.to_string()),
        };
        let Ok(n) = payload.trim().parse::<f64>() else {
            return WriteResult::failed("payload is not numeric");
        };
        let mut session = self.0.session.lock().await;
        let Some(ctx) = session.as_mut() else {
            return WriteResult::failed("not connected");
        };
        let order = self.0.config.default_byte_order;
        match write_one(ctx, register_type, address, DataType::Uint16, &Value::Number(n), order).await {
            Ok(()) => WriteResult::ok(),
            Err(err) => {
                if is_connection_class(&err) {
                    drop(session);
                    *self.0.session.lock().await = None;
                    self.0.set_status(ConnectionStatus::Error, Some(err.to_string()));
                    self.0.spawn_reconnect();
                }
                WriteResult::failed(err.to_string())
            }
        }
    }

    async fn dispose(&self) {
        self.0.status.dispose();
        *self.0.session.lock().await = None;
    }

    fn status(&self) -> ConnectionStatus {
        self.0.status.load()
    }

    fn metrics(&self) -> ConnectionMetrics {
        futures_now(&self.0.metrics)
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.0.events.subscribe()
    }
}

/// `metrics()` is sync in the trait (a cheap snapshot) but the lock is
/// async; `try_lock` is always available here because the only other
/// lockers are brief critical sections inside `read_tags`/`write`.
fn futures_now(lock: &Mutex<ConnectionMetrics>) -> ConnectionMetrics {
    match lock.try_lock() {
        Ok(guard) => guard.clone(),
        Err(_) => ConnectionMetrics::default(),
    }
}

enum RawBatch {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

async fn read_one_batch(ctx: &mut Context, batch: &ReadBatch) -> std::io::Result<RawBatch> {
    match batch.register_type {
        RegisterType::Coil => {
            let data = ctx.read_coils(batch.start_address, batch.length).await?;
            Ok(RawBatch::Bits(data.map_err(exception_to_io)?))
        }
        RegisterType::Discrete => {
            let data = ctx.read_discrete_inputs(batch.start_address, batch.length).await?;
            Ok(RawBatch::Bits(data.map_err(exception_to_io)?))
        }
        RegisterType::Holding => {
            let data = ctx.read_holding_registers(batch.start_address, batch.length).await?;
            Ok(RawBatch::Words(data.map_err(exception_to_io)?))
        }
        RegisterType::Input => {
            let data = ctx.read_input_registers(batch.start_address, batch.length).await?;
            Ok(RawBatch::Words(data.map_err(exception_to_io)?))
        }
    }
}

fn exception_to_io(code: tokio_modbus::ExceptionCode) -> std::io::Error {
    std::io::Error::other(format!("modbus exception: {code:?}"))
}

fn is_connection_class(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(err.kind(), ConnectionReset | ConnectionRefused | TimedOut | HostUnreachable | NetworkUnreachable)
        || err.to_string().contains("Port Not Open")
}

fn bad_fill(out: &mut Vec<ReadResult>, batch: &ReadBatch, by_id: &HashMap<Uuid, &Tag>) {
    for m in &batch.members {
        if by_id.contains_key(&m.tag_id) {
            out.push(ReadResult { tag_id: m.tag_id, value: Value::Number(0.0), quality: Quality::Bad, timestamp: now_ms() });
        }
    }
}

fn decode_batch(out: &mut Vec<ReadResult>, batch: &ReadBatch, raw: &RawBatch, by_id: &HashMap<Uuid, &Tag>, default_order: ByteOrder) {
    let ts = now_ms();
    for m in &batch.members {
        let Some(tag) = by_id.get(&m.tag_id) else { continue };
        let order = match &tag.address {
            TagAddress::Modbus(a) => a.byte_order.unwrap_or(default_order),
            _ => default_order,
        };
        let value = match raw {
            RawBatch::Bits(bits) => {
                let idx = m.offset as usize;
                Value::Bool(bits.get(idx).copied().unwrap_or(false))
            }
            RawBatch::Words(words) => {
                let start = m.offset as usize;
                let end = start + m.length as usize;
                let Some(slice) = words.get(start..end) else {
                    out.push(ReadResult { tag_id: m.tag_id, value: Value::Number(0.0), quality: Quality::Bad, timestamp: ts });
                    continue;
                };
                decode_register_value(tag.data_type, slice, order)
            }
        };
        out.push(ReadResult { tag_id: m.tag_id, value, quality: Quality::Good, timestamp: ts });
    }
}

fn decode_register_value(data_type: DataType, regs: &[u16], order: ByteOrder) -> Value {
    match data_type {
        DataType::Bool => Value::Bool(regs.first().copied().unwrap_or(0) != 0),
        DataType::Int16 => Value::Number(regs.first().copied().unwrap_or(0) as i16 as f64),
        DataType::Uint16 => Value::Number(regs.first().copied().unwrap_or(0) as f64),
        DataType::Int32 => {
            let (r0, r1) = (regs.first().copied().unwrap_or(0), regs.get(1).copied().unwrap_or(0));
            Value::Number(words_to_bytes_i32(r0, r1, order) as f64)
        }
        DataType::Uint32 => {
            let (r0, r1) = (regs.first().copied().unwrap_or(0), regs.get(1).copied().unwrap_or(0));
            Value::Number(words_to_bytes_u32(r0, r1, order) as f64)
        }
        DataType::Float32 => {
            let (r0, r1) = (regs.first().copied().unwrap_or(0), regs.get(1).copied().unwrap_or(0));
            Value::Number(words_to_f32(r0, r1, order) as f64)
        }
        DataType::Int64 | DataType::Uint64 | DataType::Float64 => {
            let mut bytes = [0u8; 8];
            for (i, reg) in regs.iter().take(4).enumerate() {
                bytes[i * 2..i * 2 + 2].copy_from_slice(&reg.to_be_bytes());
            }
            match data_type {
                DataType::Int64 => Value::Number(i64::from_be_bytes(bytes) as f64),
                DataType::Uint64 => Value::Number(u64::from_be_bytes(bytes) as f64),
                DataType::Float64 => Value::Number(f64::from_be_bytes(bytes)),
                _ => unreachable!(),
            }
        }
        DataType::String => {
            let mut s = String::with_capacity(regs.len() * 2);
            for reg in regs {
                let hi = (reg >> 8) as u8;
                let lo = (*reg & 0xFF) as u8;
                if hi != 0 {
                    s.push(hi as char);
                }
                if lo != 0 {
                    s.push(lo as char);
                }
            }
            Value::String(s)
        }
    }
}

async fn write_one(
    ctx: &mut Context,
    register_type: RegisterType,
    address: u16,
    data_type: DataType,
    value: &Value,
    order: ByteOrder,
) -> std::io::Result<()> {
    match register_type {
        RegisterType::Coil => {
            let b = value.as_f64().unwrap_or(0.0) != 0.0;
            ctx.write_single_coil(address, b).await?.map_err(exception_to_io)
        }
        RegisterType::Discrete => Err(std::io::Error::other("discrete inputs are read-only")),
        RegisterType::Holding => {
            let words = encode_registers(data_type, value, order);
            if words.len() == 1 {
                ctx.write_single_register(address, words[0]).await?.map_err(exception_to_io)
            } else {
                ctx.write_multiple_registers(address, &words).await?.map_err(exception_to_io)
            }
        }
        RegisterType::Input => Err(std::io::Error::other("input registers are read-only")),
    }
}

fn encode_registers(data_type: DataType, value: &Value, order: ByteOrder) -> Vec<u16> {
    let n = value.as_f64().unwrap_or(0.0);
    match data_type {
        DataType::Bool | DataType::Int16 | DataType::Uint16 => vec![n as i64 as u16],
        DataType::Int32 | DataType::Uint32 => {
            let (r0, r1) = bytes_to_words(n as i64 as u32, order);
            vec![r0, r1]
        }
        DataType::Float32 => {
            let bits = (n as f32).to_bits();
            let (r0, r1) = bytes_to_words(bits, order);
            vec![r0, r1]
        }
        DataType::Int64 | DataType::Uint64 => {
            let bytes = (n as i64).to_be_bytes();
            bytes.chunks(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect()
        }
        DataType::Float64 => {
            let bytes = n.to_bits().to_be_bytes();
            bytes.chunks(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect()
        }
        DataType::String => Vec::new(),
    }
}
