//! Byte-stream endpoints and the master-side transaction layer
//!
//! The MCCS reaches the station's shared serial bus through the
//! ethernet-serial bridge inside the FNDH, so the transport boundary is a
//! plain byte stream: [`ByteStream`] abstracts it, [`TcpEndpoint`] is the
//! production implementation, and [`PipeEndpoint`] emulates the bus
//! in-process the way the original multidrop test rig did.
//!
//! [`AsciiMaster`] is the transaction layer on top: one request paired with
//! one response, a hard deadline per transaction, and tolerance for the
//! noise a half-duplex multidrop bus produces (PDoC turn-on transients,
//! fragments of SID traffic). At most one transaction may be outstanding
//! per endpoint; a second attempt is rejected with [`PasdError::Busy`].

use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};

use crate::error::{PasdError, PasdResult};
use crate::protocol::{self, pdu, Decoded, Frame, FrameDecoder, FunctionCode};
use crate::utils::format::bytes_to_hex;
use crate::{DEFAULT_TIMEOUT_MS, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};

/// Highest register number addressable on any PaSD device
const MAX_REGISTER_NUMBER: u16 = 9999;

/// A raw byte-stream endpoint
///
/// Implementations carry no framing knowledge; the transaction layer owns
/// the [`FrameDecoder`].
#[async_trait]
pub trait ByteStream: Send {
    /// Write the whole buffer to the endpoint
    async fn send(&mut self, data: &[u8]) -> PasdResult<()>;

    /// Read whatever bytes are available, up to `buf.len()`; `Ok(0)` means
    /// the peer closed the stream
    async fn recv(&mut self, buf: &mut [u8]) -> PasdResult<usize>;
}

/// TCP connection to the ethernet-serial bridge
pub struct TcpEndpoint {
    stream: TcpStream,
    peer: String,
}

impl TcpEndpoint {
    /// Connect to a bridge at `host:port`
    pub async fn connect(addr: &str) -> PasdResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| PasdError::connection(format!("failed to connect to {}: {}", addr, e)))?;
        Ok(Self { stream, peer: addr.to_string() })
    }

    /// Address of the bridge this endpoint talks to
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl ByteStream for TcpEndpoint {
    async fn send(&mut self, data: &[u8]) -> PasdResult<()> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> PasdResult<usize> {
        Ok(self.stream.read(buf).await?)
    }
}

/// In-process endpoint pair emulating the serial bus
///
/// Used by the test harnesses to wire an [`AsciiMaster`] to a simulated
/// device without hardware, like the multidrop emulation mode of the
/// original transport.
pub struct PipeEndpoint {
    inner: DuplexStream,
}

impl PipeEndpoint {
    /// Create a connected pair of endpoints
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(capacity);
        (Self { inner: a }, Self { inner: b })
    }
}

#[async_trait]
impl ByteStream for PipeEndpoint {
    async fn send(&mut self, data: &[u8]) -> PasdResult<()> {
        self.inner.write_all(data).await?;
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> PasdResult<usize> {
        Ok(self.inner.read(buf).await?)
    }
}

/// Transaction counters for one endpoint
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

struct Inner<S: ByteStream> {
    stream: S,
    decoder: FrameDecoder,
}

/// Modbus-ASCII master transaction layer
///
/// Owns the outbound endpoint exclusively. All methods take `&self`; the
/// single-flight rule is enforced with a non-blocking lock, so an
/// overlapping call observes [`PasdError::Busy`] instead of queueing behind
/// a transaction it knows nothing about.
pub struct AsciiMaster<S: ByteStream> {
    inner: Mutex<Inner<S>>,
    timeout: Duration,
    stats: StdMutex<TransportStats>,
}

impl<S: ByteStream> AsciiMaster<S> {
    /// Create a master with the default 500 ms transaction deadline
    pub fn new(stream: S) -> Self {
        Self::with_timeout(stream, Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }

    /// Create a master with a custom transaction deadline
    pub fn with_timeout(stream: S, deadline: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner { stream, decoder: FrameDecoder::new() }),
            timeout: deadline,
            stats: StdMutex::new(TransportStats::default()),
        }
    }

    /// Per-transaction deadline currently in force
    pub fn deadline(&self) -> Duration {
        self.timeout
    }

    /// Snapshot of the transaction counters
    pub fn stats(&self) -> TransportStats {
        self.stats.lock().unwrap().clone()
    }

    /// Read `count` holding registers starting at `regnum` (function 0x03)
    pub async fn read_holding(&self, address: u8, regnum: u16, count: u16) -> PasdResult<Vec<u16>> {
        if count == 0 || count > MAX_READ_REGISTERS {
            return Err(PasdError::invalid_range(format!(
                "read count {} outside 1..={}",
                count, MAX_READ_REGISTERS
            )));
        }
        check_register_window(regnum, count)?;

        let request = Frame::new(address, FunctionCode::ReadHoldingRegisters.to_u8(), pdu::read_request(regnum, count));
        let reply = self.transact(request, FunctionCode::ReadHoldingRegisters).await?;
        pdu::parse_read_response(&reply.payload, count)
    }

    /// Write one register (function 0x06); the device must echo the request
    pub async fn write_register(&self, address: u8, regnum: u16, value: u16) -> PasdResult<()> {
        check_register_window(regnum, 1)?;

        let payload = pdu::write_request(regnum, value);
        let request = Frame::new(address, FunctionCode::WriteSingleRegister.to_u8(), payload.clone());
        let reply = self.transact(request, FunctionCode::WriteSingleRegister).await?;
        if reply.payload != payload {
            return Err(PasdError::invalid_range(format!(
                "write echo mismatch on register {}: sent {:02X?}, got {:02X?}",
                regnum, payload, reply.payload
            )));
        }
        Ok(())
    }

    /// Write consecutive registers (function 0x10)
    pub async fn write_registers(&self, address: u8, regnum: u16, values: &[u16]) -> PasdResult<()> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
            return Err(PasdError::invalid_range(format!(
                "write count {} outside 1..={}",
                values.len(),
                MAX_WRITE_REGISTERS
            )));
        }
        check_register_window(regnum, values.len() as u16)?;

        let request = Frame::new(
            address,
            FunctionCode::WriteMultipleRegisters.to_u8(),
            pdu::write_multiple_request(regnum, values),
        );
        let reply = self.transact(request, FunctionCode::WriteMultipleRegisters).await?;
        let expected = pdu::write_multiple_echo(regnum, values.len() as u16);
        if reply.payload != expected {
            return Err(PasdError::invalid_range(format!(
                "multi-write echo mismatch at register {}: got {:02X?}",
                regnum, reply.payload
            )));
        }
        Ok(())
    }

    /// Run one request/response exchange
    async fn transact(&self, request: Frame, function: FunctionCode) -> PasdResult<Frame> {
        let mut inner = self.inner.try_lock().map_err(|_| PasdError::Busy)?;

        let wire = protocol::encode(&request);
        debug!("tx {} -> {}", request.address, bytes_to_hex(&wire));
        {
            let mut stats = self.stats.lock().unwrap();
            stats.requests_sent += 1;
            stats.bytes_sent += wire.len() as u64;
        }
        inner.stream.send(&wire).await?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 512];
        loop {
            // Drain anything already buffered before touching the wire
            loop {
                match inner.decoder.try_next() {
                    Ok(Some(decoded)) => {
                        match self.classify(&request, function, decoded) {
                            Ok(frame) => {
                                self.stats.lock().unwrap().responses_received += 1;
                                return Ok(frame);
                            }
                            Err(err) => {
                                self.stats.lock().unwrap().errors += 1;
                                return Err(err);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        // Decode failures are not retried; resync and surface
                        warn!("frame decode failed mid-transaction: {}", err);
                        inner.decoder.drain_to_start();
                        self.stats.lock().unwrap().errors += 1;
                        return Err(err);
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, inner.stream.recv(&mut buf)).await {
                Ok(Ok(0)) => {
                    self.stats.lock().unwrap().errors += 1;
                    return Err(PasdError::connection("endpoint closed by peer"));
                }
                Ok(Ok(n)) => {
                    self.stats.lock().unwrap().bytes_received += n as u64;
                    inner.decoder.push(&buf[..n]);
                }
                Ok(Err(err)) => {
                    self.stats.lock().unwrap().errors += 1;
                    return Err(err);
                }
                Err(_) => break,
            }
        }

        // Deadline passed: throw away any partial frame so a late reply
        // cannot leak into the next transaction
        inner.decoder.clear();
        let mut stats = self.stats.lock().unwrap();
        stats.timeouts += 1;
        stats.errors += 1;
        Err(PasdError::timeout(
            format!("function {} to station {}", function, request.address),
            self.timeout.as_millis() as u64,
        ))
    }

    /// Pair a decoded frame against the outstanding request
    fn classify(&self, request: &Frame, function: FunctionCode, decoded: Decoded) -> PasdResult<Frame> {
        match decoded {
            Decoded::Frame(frame) => {
                if frame.address != request.address {
                    return Err(PasdError::AddressMismatch {
                        expected: request.address,
                        actual: frame.address,
                    });
                }
                if frame.function != function.to_u8() {
                    return Err(PasdError::FunctionMismatch {
                        expected: function.to_u8(),
                        actual: frame.function,
                    });
                }
                Ok(frame)
            }
            Decoded::Exception { address, function: raw, code } => {
                if address != request.address {
                    return Err(PasdError::AddressMismatch { expected: request.address, actual: address });
                }
                if raw != function.exception_function() {
                    return Err(PasdError::FunctionMismatch {
                        expected: function.exception_function(),
                        actual: raw,
                    });
                }
                Err(PasdError::exception(raw, code))
            }
        }
    }
}

fn check_register_window(regnum: u16, count: u16) -> PasdResult<()> {
    if regnum == 0 || u32::from(regnum) + u32::from(count) - 1 > u32::from(MAX_REGISTER_NUMBER) {
        return Err(PasdError::invalid_range(format!(
            "register window {}..{} outside 1..={}",
            regnum,
            u32::from(regnum) + u32::from(count) - 1,
            MAX_REGISTER_NUMBER
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode, Frame};

    async fn respond(peer: &mut PipeEndpoint, reply: &[u8]) {
        let mut buf = [0u8; 256];
        // Consume the request, then answer
        let _ = peer.recv(&mut buf).await.unwrap();
        peer.send(reply).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_holding_round_trip() {
        let (master_end, mut device_end) = PipeEndpoint::pair(1024);
        let master = AsciiMaster::new(master_end);

        let reply = encode(&Frame::new(1, 0x03, {
            let mut p = vec![4u8];
            p.extend_from_slice(&[0x00, 0x0A, 0x00, 0x0B]);
            p
        }));
        let (got, _) = tokio::join!(master.read_holding(1, 17, 2), respond(&mut device_end, &reply));
        assert_eq!(got.unwrap(), vec![0x000A, 0x000B]);

        let stats = master.stats();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.responses_received, 1);
    }

    #[tokio::test]
    async fn test_exception_reply_surfaces_code() {
        let (master_end, mut device_end) = PipeEndpoint::pair(1024);
        let master = AsciiMaster::new(master_end);

        let reply = encode(&Frame::new(1, 0x86, vec![0x02]));
        let (got, _) = tokio::join!(master.write_register(1, 9000, 1), respond(&mut device_end, &reply));
        assert_eq!(got, Err(PasdError::ExceptionResponse { function: 0x86, code: 0x02 }));
    }

    #[tokio::test]
    async fn test_address_mismatch_detected() {
        let (master_end, mut device_end) = PipeEndpoint::pair(1024);
        let master = AsciiMaster::new(master_end);

        let reply = encode(&Frame::new(7, 0x06, pdu::write_request(22, 1)));
        let (got, _) = tokio::join!(master.write_register(1, 22, 1), respond(&mut device_end, &reply));
        assert_eq!(got, Err(PasdError::AddressMismatch { expected: 1, actual: 7 }));
    }

    #[tokio::test]
    async fn test_timeout_then_clean_read() {
        let (master_end, mut device_end) = PipeEndpoint::pair(1024);
        let master = AsciiMaster::with_timeout(master_end, Duration::from_millis(30));

        // Device sends a partial frame and goes quiet
        let partial = async {
            let mut buf = [0u8; 256];
            let _ = device_end.recv(&mut buf).await.unwrap();
            device_end.send(b":0103").await.unwrap();
        };
        let (got, _) = tokio::join!(master.read_holding(1, 1, 8), partial);
        assert!(matches!(got, Err(PasdError::Timeout { .. })));

        // The next transaction must not consume leftovers from the last one
        let reply = encode(&Frame::new(1, 0x03, {
            let mut p = vec![2u8];
            p.extend_from_slice(&[0x12, 0x34]);
            p
        }));
        let (got, _) = tokio::join!(master.read_holding(1, 22, 1), respond(&mut device_end, &reply));
        assert_eq!(got.unwrap(), vec![0x1234]);
    }

    #[tokio::test]
    async fn test_garbage_before_reply_is_skipped() {
        let (master_end, mut device_end) = PipeEndpoint::pair(1024);
        let master = AsciiMaster::new(master_end);

        let mut reply = b"\x00\xFFnoise".to_vec();
        reply.extend_from_slice(&encode(&Frame::new(1, 0x06, pdu::write_request(22, 1))));
        let (got, _) = tokio::join!(master.write_register(1, 22, 1), respond(&mut device_end, &reply));
        assert!(got.is_ok());
    }

    #[tokio::test]
    async fn test_busy_on_overlapping_transaction() {
        use std::sync::Arc;

        let (master_end, _device_end) = PipeEndpoint::pair(64);
        let master = Arc::new(AsciiMaster::with_timeout(master_end, Duration::from_millis(200)));

        let background = master.clone();
        let first = tokio::spawn(async move { background.read_holding(1, 1, 1).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The first transaction is still waiting on its (absent) reply
        assert_eq!(master.read_holding(1, 22, 1).await, Err(PasdError::Busy));
        assert!(matches!(first.await.unwrap(), Err(PasdError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_count_limits_rejected_before_send() {
        let (master_end, _device_end) = PipeEndpoint::pair(64);
        let master = AsciiMaster::new(master_end);

        assert!(matches!(
            master.read_holding(1, 1, 126).await,
            Err(PasdError::InvalidRange { .. })
        ));
        assert!(matches!(
            master.write_registers(1, 1, &vec![0u16; 124]).await,
            Err(PasdError::InvalidRange { .. })
        ));
        assert!(matches!(
            master.read_holding(1, 9999, 2).await,
            Err(PasdError::InvalidRange { .. })
        ));
        // Nothing went on the wire
        assert_eq!(master.stats().requests_sent, 0);
    }
}
