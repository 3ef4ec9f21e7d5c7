//! Virtual Modbus Server: a TCP test fixture that answers
//! FC03/04/06/16 (Illegal Function otherwise) from register blocks driven
//! by waveform generators, built on gateway-proto's MBAP framing.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use gateway_proto::{FrameError, FunctionCode, MbapFrame, EXCEPTION_ILLEGAL_FUNCTION};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Waveform {
    Constant { offset: f64 },
    Sine { offset: f64, amplitude: f64, period_s: f64 },
    Square { offset: f64, amplitude: f64, period_s: f64 },
    Triangle { offset: f64, amplitude: f64, period_s: f64 },
    Random { min: f64, max: f64 },
}

impl Waveform {
    /// `t` is seconds since the server's epoch.
    fn sample(&self, t: f64) -> f64 {
        match *self {
            Waveform::Constant { offset } => offset,
            Waveform::Sine { offset, amplitude, period_s } => {
                offset + amplitude * (2.0 * std::f64::consts::PI * (t % period_s) / period_s).sin()
            }
            Waveform::Square { offset, amplitude, period_s } => {
                if (t % period_s) < period_s / 2.0 {
                    offset + amplitude
                } else {
                    offset - amplitude
                }
            }
            Waveform::Triangle { offset, amplitude, period_s } => {
                let phase = (t % period_s) / period_s; // 0..1
                let ramp = if phase < 0.5 { phase * 2.0 } else { 2.0 - phase * 2.0 }; // 0..1..0
                offset - amplitude + ramp * 2.0 * amplitude
            }
            Waveform::Random { min, max } => rand::rng().random_range(min..=max),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockKind {
    Holding,
    Input,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub kind: BlockKind,
    pub start_address: u16,
    pub waveforms: Vec<Waveform>,
}

struct ServerState {
    started_at: std::time::Instant,
    holding: HashMap<u16, Waveform>,
    input: HashMap<u16, Waveform>,
    /// last value written/sampled per (kind, address), so reads between
    /// waveform ticks return a stable snapshot rather than resampling.
    holding_values: HashMap<u16, u16>,
    input_values: HashMap<u16, u16>,
}

impl ServerState {
    fn sample_all(&mut self) {
        let t = self.started_at.elapsed().as_secs_f64();
        for (addr, wf) in &self.holding {
            self.holding_values.insert(*addr, wf.sample(t).round() as i64 as u16);
        }
        for (addr, wf) in &self.input {
            self.input_values.insert(*addr, wf.sample(t).round() as i64 as u16);
        }
    }
}

pub struct VirtualModbusServer {
    listener_task: JoinHandle<()>,
    local_addr: std::net::SocketAddr,
    clients: Arc<RwLock<Vec<JoinHandle<()>>>>,
}

impl VirtualModbusServer {
    /// Binds `port`; on `EADDRINUSE` probes upward for the next free port
    /// and returns it as a hint rather than failing silently.
    pub async fn start(host: &str, port: u16, blocks: Vec<Block>) -> io::Result<Self> {
        let listener = match TcpListener::bind((host, port)).await {
            Ok(l) => l,
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                let hint = find_free_port(host, port).await?;
                return Err(io::Error::new(io::ErrorKind::AddrInUse, format!("port {port} in use, next free port is {hint}")));
            }
            Err(err) => return Err(err),
        };
        let local_addr = listener.local_addr()?;

        let mut holding = HashMap::new();
        let mut input = HashMap::new();
        for block in blocks {
            for (i, waveform) in block.waveforms.into_iter().enumerate() {
                let addr = block.start_address + i as u16;
                match block.kind {
                    BlockKind::Holding => {
                        holding.insert(addr, waveform);
                    }
                    BlockKind::Input => {
                        input.insert(addr, waveform);
                    }
                }
            }
        }
        let state = Arc::new(RwLock::new(ServerState {
            started_at: std::time::Instant::now(),
            holding,
            input,
            holding_values: HashMap::new(),
            input_values: HashMap::new(),
        }));

        let tick_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(100));
            loop {
                interval.tick().await;
                tick_state.write().await.sample_all();
            }
        });

        let clients: Arc<RwLock<Vec<JoinHandle<()>>>> = Arc::new(RwLock::new(Vec::new()));
        let accept_clients = Arc::clone(&clients);
        let accept_state = Arc::clone(&state);
        let listener_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "virtual modbus server accepted connection");
                        let client_state = Arc::clone(&accept_state);
                        let handle = tokio::spawn(async move {
                            if let Err(err) = serve_client(stream, client_state).await {
                                debug!(%peer, error = %err, "virtual modbus client disconnected");
                            }
                        });
                        accept_clients.write().await.push(handle);
                    }
                    Err(err) => {
                        warn!(error = %err, "virtual modbus server accept failed");
                        return;
                    }
                }
            }
        });

        Ok(Self { listener_task, local_addr, clients })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Closes all accepted sockets and the listener.
    pub async fn stop_all(self) {
        self.listener_task.abort();
        for handle in self.clients.write().await.drain(..) {
            handle.abort();
        }
    }
}

async fn find_free_port(host: &str, start: u16) -> io::Result<u16> {
    for candidate in start.saturating_add(1)..=u16::MAX {
        if TcpListener::bind((host, candidate)).await.is_ok() {
            return Ok(candidate);
        }
    }
    Err(io::Error::new(io::ErrorKind::AddrInUse, "no free port found"))
}

async fn serve_client(mut stream: TcpStream, state: Arc<RwLock<ServerState>>) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(4096);
    let mut scratch = [0u8; 4096];
    loop {
        let n = stream.read(&mut scratch).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&scratch[..n]);

        loop {
            match MbapFrame::parse(&buf) {
                Ok((frame, consumed)) => {
                    let response = handle_frame(&frame, &state).await;
                    stream.write_all(&response).await?;
                    let _ = buf.split_to(consumed);
                }
                Err(FrameError::TooShort { .. }) => break,
                Err(_) => {
                    buf.clear();
                    break;
                }
            }
        }
    }
}

async fn handle_frame(frame: &MbapFrame, state: &Arc<RwLock<ServerState>>) -> BytesMut {
    let tid = frame.header.transaction_id;
    let unit = frame.header.unit_id;
    match frame.function {
        FunctionCode::ReadHoldingRegisters => read_registers(frame, state, tid, unit, true).await,
        FunctionCode::ReadInputRegisters => read_registers(frame, state, tid, unit, false).await,
        FunctionCode::WriteSingleRegister => write_single_register(frame, state, tid, unit).await,
        FunctionCode::WriteMultipleRegisters => write_multiple_registers(frame, state, tid, unit).await,
        other => MbapFrame::encode_exception(tid, unit, other, EXCEPTION_ILLEGAL_FUNCTION),
    }
}

async fn read_registers(frame: &MbapFrame, state: &Arc<RwLock<ServerState>>, tid: u16, unit: u8, holding: bool) -> BytesMut {
    if frame.payload.len() < 4 {
        return MbapFrame::encode_exception(tid, unit, frame.function, EXCEPTION_ILLEGAL_FUNCTION);
    }
    let start = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
    let count = u16::from_be_bytes([frame.payload[2], frame.payload[3]]);
    let guard = state.read().await;
    let values = if holding { &guard.holding_values } else { &guard.input_values };
    let mut payload = Vec::with_capacity(1 + count as usize * 2);
    payload.push((count * 2) as u8);
    for addr in start..start.saturating_add(count) {
        let v = values.get(&addr).copied().unwrap_or(0);
        payload.extend_from_slice(&v.to_be_bytes());
    }
    MbapFrame::encode_response(tid, unit, frame.function, &payload)
}

async fn write_single_register(frame: &MbapFrame, state: &Arc<RwLock<ServerState>>, tid: u16, unit: u8) -> BytesMut {
    if frame.payload.len() < 4 {
        return MbapFrame::encode_exception(tid, unit, frame.function, EXCEPTION_ILLEGAL_FUNCTION);
    }
    let addr = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
    let value = u16::from_be_bytes([frame.payload[2], frame.payload[3]]);
    let mut guard = state.write().await;
    guard.holding_values.insert(addr, value);
    guard.holding.insert(addr, Waveform::Constant { offset: value as f64 });
    MbapFrame::encode_response(tid, unit, frame.function, &frame.payload)
}

async fn write_multiple_registers(frame: &MbapFrame, state: &Arc<RwLock<ServerState>>, tid: u16, unit: u8) -> BytesMut {
    if frame.payload.len() < 5 {
        return MbapFrame::encode_exception(tid, unit, frame.function, EXCEPTION_ILLEGAL_FUNCTION);
    }
    let addr = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
    let count = u16::from_be_bytes([frame.payload[2], frame.payload[3]]);
    let byte_count = frame.payload[4] as usize;
    if frame.payload.len() < 5 + byte_count || byte_count != count as usize * 2 {
        return MbapFrame::encode_exception(tid, unit, frame.function, EXCEPTION_ILLEGAL_FUNCTION);
    }
    let mut guard = state.write().await;
    for i in 0..count {
        let offset = 5 + i as usize * 2;
        let value = u16::from_be_bytes([frame.payload[offset], frame.payload[offset + 1]]);
        guard.holding_values.insert(addr + i, value);
        guard.holding.insert(addr + i, Waveform::Constant { offset: value as f64 });
    }
    let ack = [frame.payload[0], frame.payload[1], frame.payload[2], frame.payload[3]];
    MbapFrame::encode_response(tid, unit, frame.function, &ack)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_waveform_stays_within_amplitude_band() {
        let wf = Waveform::Sine { offset: 50.0, amplitude: 10.0, period_s: 60.0 };
        for i in 0..120 {
            let v = wf.sample(i as f64 * 0.5);
            assert!((40.0..=60.0).contains(&v), "value {v} out of band");
        }
    }

    #[test]
    fn square_waveform_alternates_between_two_levels() {
        let wf = Waveform::Square { offset: 0.0, amplitude: 5.0, period_s: 10.0 };
        assert_eq!(wf.sample(0.0), 5.0);
        assert_eq!(wf.sample(6.0), -5.0);
    }

    #[test]
    fn triangle_waveform_ramps_linearly() {
        let wf = Waveform::Triangle { offset: 0.0, amplitude: 10.0, period_s: 4.0 };
        assert_eq!(wf.sample(0.0), -10.0);
        assert_eq!(wf.sample(2.0), 10.0);
    }

    #[tokio::test]
    async fn read_holding_registers_returns_sampled_values() {
        let state = Arc::new(RwLock::new(ServerState {
            started_at: std::time::Instant::now(),
            holding: HashMap::from([(0u16, Waveform::Constant { offset: 42.0 })]),
            input: HashMap::new(),
            holding_values: HashMap::from([(0u16, 42u16)]),
            input_values: HashMap::new(),
        }));
        let payload = [0x00, 0x00, 0x00, 0x01];
        let frame = MbapFrame { header: gateway_proto::MbapHeader { transaction_id: 1, protocol_id: 0, length: 6, unit_id: 1 }, function: FunctionCode::ReadHoldingRegisters, payload: payload.to_vec() };
        let response = read_registers(&frame, &state, 1, 1, true).await;
        let (parsed, _) = MbapFrame::parse(&response).unwrap();
        assert_eq!(parsed.payload, vec![2, 0, 42]);
    }

    #[tokio::test]
    async fn unsupported_function_returns_illegal_function_exception() {
        let state = Arc::new(RwLock::new(ServerState {
            started_at: std::time::Instant::now(),
            holding: HashMap::new(),
            input: HashMap::new(),
            holding_values: HashMap::new(),
            input_values: HashMap::new(),
        }));
        let frame = MbapFrame { header: gateway_proto::MbapHeader { transaction_id: 1, protocol_id: 0, length: 2, unit_id: 1 }, function: FunctionCode::ReadCoils, payload: vec![] };
        let response = handle_frame(&frame, &state).await;
        let (parsed, _) = MbapFrame::parse(&response).unwrap();
        assert_eq!(parsed.function.code() & gateway_proto::EXCEPTION_BIT, gateway_proto::EXCEPTION_BIT);
        assert_eq!(parsed.payload, vec![EXCEPTION_ILLEGAL_FUNCTION]);
    }
}
