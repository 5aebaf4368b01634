//! In-process relay gateway simulator
//!
//! Speaks the same RTU-over-TCP framing as a real relay board: FC01, FC05
//! and FC0F on a bank of coils, exception 0x01 for any other function,
//! 0x02 for out-of-range coils and 0x03 for malformed values. Frames with a bad CRC or addressed to
//! another device get no reply, like on a serial bus.
//!
//! Fault knobs cover the cases a client has to survive: going offline,
//! silently ignoring writes, answering slowly and corrupting a response.
//! The simulator serves real TCP sockets through [`RelaySimulator::serve`]
//! or in-memory streams through [`SimulatorConnector`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::codec::{Command, FrameCodec, Response};
use crate::constants::{
    EXCEPTION_ILLEGAL_DATA_ADDRESS, EXCEPTION_ILLEGAL_DATA_VALUE, EXCEPTION_ILLEGAL_FUNCTION,
    MAX_FRAME_SIZE, READ_REQUEST_FRAME_LEN,
};
use crate::error::{ProtocolError, RelayError, RelayResult};
use crate::transport::Connector;

struct SimState {
    codec: FrameCodec,
    coils: Mutex<Vec<bool>>,
    online: AtomicBool,
    ignore_writes: AtomicBool,
    corrupt_next: AtomicBool,
    response_delay: Mutex<Duration>,
    requests: AtomicU64,
    connections: AtomicU64,
}

/// Simulated relay board behind a gateway
#[derive(Clone)]
pub struct RelaySimulator {
    state: Arc<SimState>,
}

impl RelaySimulator {
    pub fn new(device_address: u8, num_coils: u16) -> Self {
        Self {
            state: Arc::new(SimState {
                codec: FrameCodec::new(device_address),
                coils: Mutex::new(vec![false; num_coils as usize]),
                online: AtomicBool::new(true),
                ignore_writes: AtomicBool::new(false),
                corrupt_next: AtomicBool::new(false),
                response_delay: Mutex::new(Duration::ZERO),
                requests: AtomicU64::new(0),
                connections: AtomicU64::new(0),
            }),
        }
    }

    pub fn coils(&self) -> Vec<bool> {
        self.state.coils.lock().clone()
    }

    /// Set a coil directly (0-based), as if switched by hand
    pub fn set_coil(&self, index: usize, value: bool) {
        if let Some(coil) = self.state.coils.lock().get_mut(index) {
            *coil = value;
        }
    }

    /// Offline: refuse new connections and drop open ones on their next
    /// request
    pub fn set_online(&self, online: bool) {
        self.state.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.state.online.load(Ordering::SeqCst)
    }

    /// Acknowledge writes without applying them
    pub fn set_ignore_writes(&self, ignore: bool) {
        self.state.ignore_writes.store(ignore, Ordering::SeqCst);
    }

    pub fn set_response_delay(&self, delay: Duration) {
        *self.state.response_delay.lock() = delay;
    }

    /// Flip a CRC byte of the next response
    pub fn corrupt_next_response(&self) {
        self.state.corrupt_next.store(true, Ordering::SeqCst);
    }

    /// Frames received, answered or not
    pub fn request_count(&self) -> u64 {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Streams accepted
    pub fn connection_count(&self) -> u64 {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// In-memory connector bound to this simulator
    pub fn connector(&self) -> SimulatorConnector {
        SimulatorConnector {
            simulator: self.clone(),
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Answer one request frame; `None` means stay silent
    pub fn handle_frame(&self, frame: &[u8]) -> Option<Bytes> {
        self.state.requests.fetch_add(1, Ordering::SeqCst);
        let codec = &self.state.codec;

        let response = match codec.decode_request(frame) {
            Ok(command) => self.apply(&command),
            Err(ProtocolError::UnsupportedFunction { function }) => Response::Exception {
                function,
                code: EXCEPTION_ILLEGAL_FUNCTION,
            },
            Err(ProtocolError::InvalidPayload { .. }) => Response::Exception {
                function: frame[1],
                code: EXCEPTION_ILLEGAL_DATA_VALUE,
            },
            Err(err) => {
                debug!(error = %err, "Simulator ignoring request");
                return None;
            },
        };

        let mut bytes = codec.encode_response(&response).to_vec();
        if self.state.corrupt_next.swap(false, Ordering::SeqCst) {
            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF;
        }
        Some(Bytes::from(bytes))
    }

    fn apply(&self, command: &Command) -> Response {
        let mut coils = self.state.coils.lock();
        let len = coils.len();
        let in_range = move |start: u16, count: usize| start as usize + count <= len;
        let ignore = self.state.ignore_writes.load(Ordering::SeqCst);

        match command {
            Command::ReadCoils { start, count } => {
                if !in_range(*start, *count as usize) {
                    return illegal_address(command);
                }
                let from = *start as usize;
                Response::Coils(coils[from..from + *count as usize].to_vec())
            },
            Command::WriteCoil { address, value } => {
                if !in_range(*address, 1) {
                    return illegal_address(command);
                }
                if !ignore {
                    coils[*address as usize] = *value;
                }
                Response::CoilWritten {
                    address: *address,
                    value: *value,
                }
            },
            Command::WriteCoils { start, bits } => {
                if !in_range(*start, bits.len()) {
                    return illegal_address(command);
                }
                if !ignore {
                    let from = *start as usize;
                    coils[from..from + bits.len()].copy_from_slice(bits);
                }
                Response::CoilsWritten {
                    start: *start,
                    count: bits.len() as u16,
                }
            },
        }
    }

    /// Serve one client stream until it closes or the simulator goes
    /// offline
    pub async fn serve_stream<S>(&self, mut stream: S) -> RelayResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        let mut frame = Vec::with_capacity(MAX_FRAME_SIZE);

        loop {
            frame.clear();
            frame.resize(READ_REQUEST_FRAME_LEN, 0);
            match stream.read_exact(&mut frame).await {
                Ok(_) => {},
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            let total = FrameCodec::request_len(&frame)?;
            if total > READ_REQUEST_FRAME_LEN {
                frame.resize(total, 0);
                stream
                    .read_exact(&mut frame[READ_REQUEST_FRAME_LEN..])
                    .await?;
            }

            if !self.is_online() {
                debug!("Simulator offline, dropping connection");
                return Ok(());
            }

            let delay = *self.state.response_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if let Some(response) = self.handle_frame(&frame) {
                stream.write_all(&response).await?;
                stream.flush().await?;
            }
        }
    }

    /// Accept TCP clients until the listener fails
    pub async fn serve(self, listener: TcpListener) -> RelayResult<()> {
        info!(addr = ?listener.local_addr().ok(), "Relay simulator listening");
        loop {
            let (socket, peer) = listener.accept().await?;
            if !self.is_online() {
                debug!(%peer, "Simulator offline, refusing client");
                continue;
            }
            debug!(%peer, "Simulator client connected");
            let simulator = self.clone();
            tokio::spawn(async move {
                if let Err(e) = simulator.serve_stream(socket).await {
                    debug!(%peer, error = %e, "Simulator client ended");
                }
            });
        }
    }
}

fn illegal_address(command: &Command) -> Response {
    Response::Exception {
        function: command.function_code(),
        code: EXCEPTION_ILLEGAL_DATA_ADDRESS,
    }
}

/// Connects to a [`RelaySimulator`] over in-memory duplex streams
#[derive(Clone)]
pub struct SimulatorConnector {
    simulator: RelaySimulator,
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl SimulatorConnector {
    pub fn simulator(&self) -> &RelaySimulator {
        &self.simulator
    }

    /// Connect calls made so far, refused ones included
    pub fn connect_attempts(&self) -> usize {
        self.attempts.lock().len()
    }

    /// When each connect call was made
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }
}

impl Connector for SimulatorConnector {
    type Stream = DuplexStream;

    fn connect(&self) -> impl Future<Output = RelayResult<DuplexStream>> + Send {
        self.attempts.lock().push(Instant::now());
        let simulator = self.simulator.clone();

        async move {
            if !simulator.is_online() {
                return Err(RelayError::connection("Connection refused"));
            }
            let (client, server) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                if let Err(e) = simulator.serve_stream(server).await {
                    debug!(error = %e, "Simulator stream ended");
                }
            });
            Ok(client)
        }
    }

    fn endpoint(&self) -> String {
        "simulator".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FC_READ_COILS;

    #[test]
    fn test_handle_read_and_write() {
        let sim = RelaySimulator::new(1, 8);
        let codec = FrameCodec::new(1);

        let write = Command::WriteCoil {
            address: 2,
            value: true,
        };
        let reply = sim.handle_frame(&codec.encode(&write).unwrap()).unwrap();
        assert_eq!(
            codec.decode(&reply, &write).unwrap(),
            Response::CoilWritten {
                address: 2,
                value: true
            }
        );

        let read = Command::ReadCoils { start: 0, count: 8 };
        let reply = sim.handle_frame(&codec.encode(&read).unwrap()).unwrap();
        let Response::Coils(coils) = codec.decode(&reply, &read).unwrap() else {
            panic!("expected coils");
        };
        assert_eq!(coils, vec![false, false, true, false, false, false, false, false]);
        assert_eq!(sim.request_count(), 2);
    }

    #[test]
    fn test_ignore_writes_still_acknowledges() {
        let sim = RelaySimulator::new(1, 4);
        sim.set_ignore_writes(true);
        let codec = FrameCodec::new(1);
        let write = Command::WriteCoils {
            start: 0,
            bits: vec![true; 4],
        };
        let reply = sim.handle_frame(&codec.encode(&write).unwrap()).unwrap();
        assert!(codec.decode(&reply, &write).is_ok());
        assert_eq!(sim.coils(), vec![false; 4]);
    }

    #[test]
    fn test_out_of_range_is_exception() {
        let sim = RelaySimulator::new(1, 4);
        let codec = FrameCodec::new(1);
        let read = Command::ReadCoils { start: 2, count: 4 };
        let reply = sim.handle_frame(&codec.encode(&read).unwrap()).unwrap();
        assert_eq!(
            codec.decode(&reply, &read).unwrap(),
            Response::Exception {
                function: FC_READ_COILS,
                code: EXCEPTION_ILLEGAL_DATA_ADDRESS
            }
        );
    }

    #[test]
    fn test_bad_coil_value_is_exception() {
        let sim = RelaySimulator::new(1, 4);
        let mut frame = vec![0x01, 0x05, 0x00, 0x01, 0x12, 0x34];
        let crc = crate::codec::crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        let reply = sim.handle_frame(&frame).unwrap();
        assert_eq!(&reply[..3], &[0x01, 0x85, EXCEPTION_ILLEGAL_DATA_VALUE]);
        assert_eq!(sim.coils(), vec![false; 4]);
    }

    #[test]
    fn test_other_device_gets_no_reply() {
        let sim = RelaySimulator::new(2, 4);
        let frame = FrameCodec::new(1)
            .encode(&Command::ReadCoils { start: 0, count: 1 })
            .unwrap();
        assert!(sim.handle_frame(&frame).is_none());
    }

    #[test]
    fn test_corrupt_next_response_once() {
        let sim = RelaySimulator::new(1, 4);
        let codec = FrameCodec::new(1);
        let read = Command::ReadCoils { start: 0, count: 4 };
        let frame = codec.encode(&read).unwrap();

        sim.corrupt_next_response();
        let reply = sim.handle_frame(&frame).unwrap();
        assert!(matches!(
            codec.decode(&reply, &read),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
        let reply = sim.handle_frame(&frame).unwrap();
        assert!(codec.decode(&reply, &read).is_ok());
    }

    #[tokio::test]
    async fn test_connector_refuses_when_offline() {
        let sim = RelaySimulator::new(1, 4);
        let connector = sim.connector();
        sim.set_online(false);
        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, RelayError::Connection { .. }));
        assert_eq!(connector.connect_attempts(), 1);
    }
}
