//! MCCS slave surface for the technician's Service Interface Device
//!
//! The MCCS answers Modbus-ASCII requests at station address 63 on its own
//! network listener, leaving the serial bus untouched. Three register
//! regions are exposed:
//!
//! | registers   | content                                            |
//! |-------------|----------------------------------------------------|
//! | 1..=256     | antenna -> (SMARTbox, port) map, R/W, injective    |
//! | 1001..=1135 | service-log cursor: prime block and message block  |
//! | 1201..=1228 | PDoC -> SMARTbox map, read-only                    |
//!
//! Antenna-map writes are validated against the *resulting* map and
//! applied atomically; an injectivity violation answers exception 0x02
//! with the map unchanged. The service-log cursor is per-connection:
//! a 0x10 prime write sets the filter predicate and starting entry, each
//! exact read of the message block returns one entry and steps the cursor
//! one entry older, and disconnecting forgets the cursor.

use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::error::{PasdError, PasdResult};
use crate::protocol::{self, Decoded, ExceptionCode, Frame, FrameDecoder};
use crate::station::SharedState;
use crate::store::{LogFilter, LogQueryMode, ServiceLogEntry, StationStore};
use crate::utils::Clock;
use crate::{ANTENNA_COUNT, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS, MCCS_ADDRESS, PDOC_PORT_COUNT};

/// First antenna-map register
pub const ANTENNA_REGION_START: u16 = 1;
/// Service-log prime block: antenna number register
pub const ANTNUM_REG: u16 = 1001;
/// Service-log prime block: first chip-ID register (8 registers)
pub const CHIPID_REG: u16 = 1002;
/// Service-log prime block: starting entry number register
pub const LOGNUM_REG: u16 = 1010;
/// First register of the message block
pub const MESSAGE_REG: u16 = 1011;
/// Message block length in registers: text plus trailing timestamp
pub const MESSAGE_REGS: u16 = 125;
/// Registers of NUL-padded message text
pub const MESSAGE_TEXT_REGS: u16 = 123;
/// First PDoC-map register
pub const PDOC_REGION_START: u16 = 1201;

const PRIME_REGS: u16 = 10;
const MESSAGE_REGION_END: u16 = MESSAGE_REG + MESSAGE_REGS - 1;
const PDOC_REGION_END: u16 = PDOC_REGION_START + PDOC_PORT_COUNT as u16 - 1;

/// Slave-surface configuration
#[derive(Debug, Clone)]
pub struct SidServerConfig {
    pub bind_address: SocketAddr,
    /// Modbus station address answered on this listener
    pub listen_address: u8,
    pub max_connections: usize,
}

impl Default for SidServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5100".parse().unwrap(),
            listen_address: MCCS_ADDRESS,
            max_connections: 8,
        }
    }
}

/// Slave-surface counters
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections_count: u64,
    pub total_requests: u64,
    pub exception_replies: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Per-connection service-log cursor
#[derive(Debug, Clone, Default)]
struct SessionCursor {
    filter: Option<LogFilter>,
    lognum: u32,
}

/// The SID-facing Modbus slave server
pub struct SidServer {
    config: SidServerConfig,
    state: SharedState,
    store: Arc<dyn StationStore>,
    clock: Arc<dyn Clock>,
    stats: Arc<StdMutex<ServerStats>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl SidServer {
    pub fn new(
        config: SidServerConfig,
        state: SharedState,
        store: Arc<dyn StationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            state,
            store,
            clock,
            stats: Arc::new(StdMutex::new(ServerStats::default())),
            shutdown_tx: None,
        }
    }

    /// Snapshot of the server counters
    pub fn stats(&self) -> ServerStats {
        self.stats.lock().unwrap().clone()
    }

    /// Bind the listener and start serving; returns the bound address
    pub async fn start(&mut self) -> PasdResult<SocketAddr> {
        let listener = TcpListener::bind(self.config.bind_address).await.map_err(|e| {
            PasdError::connection(format!("failed to bind {}: {}", self.config.bind_address, e))
        })?;
        let local = listener.local_addr()?;
        info!("SID server listening on {} as station {}", local, self.config.listen_address);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let handler = Arc::new(RequestHandler {
            listen_address: self.config.listen_address,
            state: self.state.clone(),
            store: self.store.clone(),
            clock: self.clock.clone(),
            stats: self.stats.clone(),
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                debug!("SID connection from {}", peer);
                                let handler = handler.clone();
                                let shutdown_rx = shutdown_tx.subscribe();
                                tokio::spawn(async move {
                                    handler.handle_client(stream, peer, shutdown_rx).await;
                                });
                            }
                            Err(e) => error!("accept failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("SID server stopping");
                        break;
                    }
                }
            }
        });

        Ok(local)
    }

    /// Stop accepting and tear down client tasks
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

struct RequestHandler {
    listen_address: u8,
    state: SharedState,
    store: Arc<dyn StationStore>,
    clock: Arc<dyn Clock>,
    stats: Arc<StdMutex<ServerStats>>,
}

impl RequestHandler {
    async fn handle_client(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        self.stats.lock().unwrap().connections_count += 1;
        // Cursor state lives and dies with the connection
        let mut cursor = SessionCursor::default();
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 1024];

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = stream.read(&mut buf) => {
                    let n = match result {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            warn!("read error from {}: {}", peer, e);
                            break;
                        }
                    };
                    self.stats.lock().unwrap().bytes_received += n as u64;
                    decoder.push(&buf[..n]);

                    loop {
                        match decoder.try_next() {
                            Ok(Some(decoded)) => {
                                if decoded.address() != self.listen_address {
                                    debug!("ignoring frame for station {}", decoded.address());
                                    continue;
                                }
                                let reply = match decoded {
                                    Decoded::Frame(frame) => self.process(&frame, &mut cursor).await,
                                    // A stray exception frame is not a request
                                    Decoded::Exception { .. } => continue,
                                };
                                let wire = protocol::encode(&reply);
                                if let Err(e) = stream.write_all(&wire).await {
                                    warn!("write error to {}: {}", peer, e);
                                    return;
                                }
                                self.stats.lock().unwrap().bytes_sent += wire.len() as u64;
                            }
                            Ok(None) => break,
                            Err(e) => {
                                // Torn or corrupt frame on the way in; the
                                // decoder has already resynchronised
                                debug!("frame decode error from {}: {}", peer, e);
                            }
                        }
                    }
                }
            }
        }
        debug!("SID connection {} closed", peer);
    }

    fn exception(&self, function: u8, code: ExceptionCode) -> Frame {
        self.stats.lock().unwrap().exception_replies += 1;
        Frame::new(self.listen_address, function | 0x80, vec![code.to_u8()])
    }

    async fn process(&self, frame: &Frame, cursor: &mut SessionCursor) -> Frame {
        self.stats.lock().unwrap().total_requests += 1;
        match frame.function {
            0x03 => self.process_read(frame, cursor).await,
            0x06 => self.process_write_single(frame).await,
            0x10 => self.process_write_multiple(frame, cursor).await,
            other => {
                warn!("unsupported function 0x{:02X} from SID", other);
                self.exception(other, ExceptionCode::IllegalFunction)
            }
        }
    }

    async fn process_read(&self, frame: &Frame, cursor: &mut SessionCursor) -> Frame {
        if frame.payload.len() != 4 {
            return self.exception(frame.function, ExceptionCode::IllegalDataValue);
        }
        let wire = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
        let count = u16::from_be_bytes([frame.payload[2], frame.payload[3]]);
        if count == 0 || count > MAX_READ_REGISTERS || u32::from(wire) + u32::from(count) > 9999 {
            return self.exception(frame.function, ExceptionCode::IllegalDataValue);
        }
        let regnum = wire + 1;
        let end = regnum + count - 1;

        let words: Vec<u16> = if end <= ANTENNA_COUNT as u16 {
            let state = self.state.lock().unwrap();
            state.antennas.words()[(regnum - 1) as usize..end as usize].to_vec()
        } else if regnum >= ANTNUM_REG && end <= LOGNUM_REG {
            prime_words(cursor)[(regnum - ANTNUM_REG) as usize..=(end - ANTNUM_REG) as usize].to_vec()
        } else if regnum == MESSAGE_REG && count == MESSAGE_REGS {
            match self.read_log_block(cursor).await {
                Ok(words) => words,
                Err(PasdError::CursorUnprimed) => {
                    warn!("SID read the log block without priming a cursor");
                    return self.exception(frame.function, ExceptionCode::ServerDeviceFailure);
                }
                Err(e) => {
                    error!("service log query failed: {}", e);
                    return self.exception(frame.function, ExceptionCode::ServerDeviceFailure);
                }
            }
        } else if regnum >= PDOC_REGION_START && end <= PDOC_REGION_END {
            let state = self.state.lock().unwrap();
            state.pdoc.words()[(regnum - PDOC_REGION_START) as usize..=(end - PDOC_REGION_START) as usize]
                .to_vec()
        } else {
            return self.exception(frame.function, ExceptionCode::IllegalDataAddress);
        };

        let mut payload = Vec::with_capacity(1 + words.len() * 2);
        payload.push((words.len() * 2) as u8);
        for w in &words {
            payload.extend_from_slice(&w.to_be_bytes());
        }
        Frame::new(self.listen_address, frame.function, payload)
    }

    /// Serve one log entry under the primed predicate and step the cursor
    async fn read_log_block(&self, cursor: &mut SessionCursor) -> PasdResult<Vec<u16>> {
        let filter = cursor.filter.ok_or(PasdError::CursorUnprimed)?;
        let entry = self
            .store
            .query_log(&filter, cursor.lognum, LogQueryMode::StationOnly)
            .await?;

        let mut words = vec![0u16; MESSAGE_REGS as usize];
        if let Some(entry) = entry {
            let bytes = entry.message.as_bytes();
            for (i, chunk) in bytes.chunks(2).enumerate() {
                let hi = chunk[0];
                let lo = chunk.get(1).copied().unwrap_or(0);
                words[i] = u16::from_be_bytes([hi, lo]);
            }
            let ts = entry.timestamp as u32;
            words[MESSAGE_TEXT_REGS as usize] = (ts >> 16) as u16;
            words[MESSAGE_TEXT_REGS as usize + 1] = ts as u16;
            // Next read returns the next-older entry
            cursor.lognum += 1;
        }
        Ok(words)
    }

    async fn process_write_single(&self, frame: &Frame) -> Frame {
        if frame.payload.len() != 4 {
            return self.exception(frame.function, ExceptionCode::IllegalDataValue);
        }
        let wire = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
        if wire >= 9999 {
            return self.exception(frame.function, ExceptionCode::IllegalDataAddress);
        }
        let regnum = wire + 1;
        let value = u16::from_be_bytes([frame.payload[2], frame.payload[3]]);

        if regnum <= ANTENNA_COUNT as u16 {
            match self.apply_antenna_write(regnum, &[value]).await {
                Ok(()) => Frame::new(self.listen_address, frame.function, frame.payload.clone()),
                Err(e) => self.map_write_exception(frame.function, e),
            }
        } else {
            // Cursor priming is a single 0x10 transaction; the PDoC map is
            // read-only
            self.exception(frame.function, ExceptionCode::IllegalDataAddress)
        }
    }

    async fn process_write_multiple(&self, frame: &Frame, cursor: &mut SessionCursor) -> Frame {
        if frame.payload.len() < 5 {
            return self.exception(frame.function, ExceptionCode::IllegalDataValue);
        }
        let wire = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
        let count = u16::from_be_bytes([frame.payload[2], frame.payload[3]]);
        let byte_count = frame.payload[4] as usize;
        if count == 0
            || count > MAX_WRITE_REGISTERS
            || byte_count != count as usize * 2
            || frame.payload.len() != 5 + byte_count
            || u32::from(wire) + u32::from(count) > 9999
        {
            return self.exception(frame.function, ExceptionCode::IllegalDataValue);
        }
        let regnum = wire + 1;
        let values: Vec<u16> = frame.payload[5..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        let end = regnum + count - 1;

        let echo = protocol::pdu::write_multiple_echo(regnum, count);
        let ok = Frame::new(self.listen_address, frame.function, echo);

        if end <= ANTENNA_COUNT as u16 {
            return match self.apply_antenna_write(regnum, &values).await {
                Ok(()) => ok,
                Err(e) => self.map_write_exception(frame.function, e),
            };
        }

        if regnum == ANTNUM_REG && count >= PRIME_REGS && end <= MESSAGE_REGION_END {
            // Prime the cursor; any registers beyond the prime block are
            // message text to append under the new predicate
            let filter = match parse_prime(&values) {
                Ok(f) => f,
                Err(_) => return self.exception(frame.function, ExceptionCode::IllegalDataValue),
            };
            cursor.filter = Some(filter);
            cursor.lognum = values[(LOGNUM_REG - ANTNUM_REG) as usize] as u32;
            if count > PRIME_REGS {
                if let Err(e) = self.append_entry(&filter, &values[PRIME_REGS as usize..]).await {
                    error!("service log append failed: {}", e);
                    return self.exception(frame.function, ExceptionCode::ServerDeviceFailure);
                }
            }
            return ok;
        }

        if regnum == MESSAGE_REG && end <= MESSAGE_REGION_END {
            // Append under a cursor primed earlier in this session
            let filter = match cursor.filter {
                Some(f) => f,
                None => {
                    warn!("SID wrote the log block without priming a cursor");
                    return self.exception(frame.function, ExceptionCode::ServerDeviceFailure);
                }
            };
            if let Err(e) = self.append_entry(&filter, &values).await {
                error!("service log append failed: {}", e);
                return self.exception(frame.function, ExceptionCode::ServerDeviceFailure);
            }
            return ok;
        }

        self.exception(frame.function, ExceptionCode::IllegalDataAddress)
    }

    /// Validate and apply an antenna-map write atomically, then persist
    async fn apply_antenna_write(&self, regnum: u16, values: &[u16]) -> PasdResult<()> {
        let updated = {
            let state = self.state.lock().unwrap();
            state.antennas.with_write(regnum, values)?
        };
        {
            let mut state = self.state.lock().unwrap();
            state.antennas = updated.clone();
        }
        self.store.save_antenna_map(&updated).await
    }

    fn map_write_exception(&self, function: u8, err: PasdError) -> Frame {
        match err {
            PasdError::MapInconsistent { register, smartbox, port } => {
                warn!(
                    "rejected antenna-map write: register {} duplicates ({}, {})",
                    register, smartbox, port
                );
                self.exception(function, ExceptionCode::IllegalDataAddress)
            }
            PasdError::InvalidRange { message } => {
                warn!("rejected antenna-map write: {}", message);
                self.exception(function, ExceptionCode::IllegalDataValue)
            }
            other => {
                error!("antenna-map write failed: {}", other);
                self.exception(function, ExceptionCode::ServerDeviceFailure)
            }
        }
    }

    /// File a log entry from message-text registers
    async fn append_entry(&self, filter: &LogFilter, text_words: &[u16]) -> PasdResult<()> {
        let mut bytes = Vec::with_capacity(text_words.len() * 2);
        for w in text_words.iter().take(MESSAGE_TEXT_REGS as usize) {
            bytes.extend_from_slice(&w.to_be_bytes());
        }
        let text_end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        let message = String::from_utf8_lossy(&bytes[..text_end]).into_owned();

        self.store
            .append_log(ServiceLogEntry {
                antenna: filter.antenna,
                chipid: filter.chipid,
                timestamp: self.clock.now_unix(),
                message,
            })
            .await
    }
}

/// Current prime-block register contents for a session
fn prime_words(cursor: &SessionCursor) -> [u16; PRIME_REGS as usize] {
    let mut words = [0u16; PRIME_REGS as usize];
    if let Some(filter) = cursor.filter {
        words[0] = filter.antenna;
        for i in 0..8 {
            words[1 + i] = u16::from_be_bytes([filter.chipid[i * 2], filter.chipid[i * 2 + 1]]);
        }
    }
    words[(LOGNUM_REG - ANTNUM_REG) as usize] = cursor.lognum as u16;
    words
}

/// Parse and validate the ten prime registers
fn parse_prime(values: &[u16]) -> PasdResult<LogFilter> {
    let antenna = values[0];
    if antenna as usize > ANTENNA_COUNT {
        return Err(PasdError::invalid_range("antenna number above 256"));
    }
    let mut chipid = [0u8; 16];
    for i in 0..8 {
        let [hi, lo] = values[1 + i].to_be_bytes();
        chipid[i * 2] = hi;
        chipid[i * 2 + 1] = lo;
    }
    let filter = LogFilter { antenna, chipid };
    filter.validate()?;
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::StationState;
    use crate::store::MemoryStore;
    use crate::utils::ManualClock;
    use std::sync::Mutex;

    fn handler() -> (RequestHandler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let handler = RequestHandler {
            listen_address: MCCS_ADDRESS,
            state: Arc::new(Mutex::new(StationState::new())),
            store: store.clone(),
            clock: Arc::new(ManualClock::new(1_614_319_283)),
            stats: Arc::new(StdMutex::new(ServerStats::default())),
        };
        (handler, store)
    }

    fn read_frame(regnum: u16, count: u16) -> Frame {
        Frame::new(MCCS_ADDRESS, 0x03, protocol::pdu::read_request(regnum, count))
    }

    fn write_frame(regnum: u16, values: &[u16]) -> Frame {
        Frame::new(MCCS_ADDRESS, 0x10, protocol::pdu::write_multiple_request(regnum, values))
    }

    fn assert_exception(reply: &Frame, function: u8, code: u8) {
        assert_eq!(reply.function, function | 0x80);
        assert_eq!(reply.payload, vec![code]);
    }

    fn reply_words(reply: &Frame) -> Vec<u16> {
        assert_eq!(reply.payload[0] as usize, reply.payload.len() - 1);
        protocol::pdu::bytes_to_registers(&reply.payload[1..]).unwrap()
    }

    #[tokio::test]
    async fn test_antenna_read_and_write() {
        let (h, _) = handler();
        let mut cursor = SessionCursor::default();

        let reply = h.process(&write_frame(7, &[0x0305]), &mut cursor).await;
        assert_eq!(reply.function, 0x10);

        let reply = h.process(&read_frame(1, 16), &mut cursor).await;
        let words = reply_words(&reply);
        assert_eq!(words[6], 0x0305);
    }

    #[tokio::test]
    async fn test_map_conflict_is_atomic_0x02() {
        let (h, _) = handler();
        let mut cursor = SessionCursor::default();
        h.process(&write_frame(7, &[0x0305]), &mut cursor).await;

        // Antenna 42 claiming (3, 5) must bounce with Illegal Data Address
        let reply = h.process(&write_frame(42, &[0x0305]), &mut cursor).await;
        assert_exception(&reply, 0x10, 0x02);

        let words = reply_words(&h.process(&read_frame(42, 1), &mut cursor).await);
        assert_eq!(words[0], 0);
        let words = reply_words(&h.process(&read_frame(7, 1), &mut cursor).await);
        assert_eq!(words[0], 0x0305);
    }

    #[tokio::test]
    async fn test_malformed_antenna_value_is_0x03() {
        let (h, _) = handler();
        let mut cursor = SessionCursor::default();
        // Port 13 does not exist
        let reply = h.process(&write_frame(9, &[0x030D]), &mut cursor).await;
        assert_exception(&reply, 0x10, 0x03);
    }

    #[tokio::test]
    async fn test_pdoc_region_is_read_only() {
        let (h, _) = handler();
        let mut cursor = SessionCursor::default();
        {
            let mut state = h.state.lock().unwrap();
            state.pdoc.ports[0] = 9;
        }
        let words = reply_words(&h.process(&read_frame(PDOC_REGION_START, 28), &mut cursor).await);
        assert_eq!(words[0], 9);

        let reply = h.process(&write_frame(PDOC_REGION_START, &[1]), &mut cursor).await;
        assert_exception(&reply, 0x10, 0x02);
    }

    #[tokio::test]
    async fn test_undefined_window_is_0x02() {
        let (h, _) = handler();
        let mut cursor = SessionCursor::default();
        // Straddles the antenna region boundary
        let reply = h.process(&read_frame(250, 10), &mut cursor).await;
        assert_exception(&reply, 0x03, 0x02);
    }

    #[tokio::test]
    async fn test_unsupported_function_is_0x01() {
        let (h, _) = handler();
        let mut cursor = SessionCursor::default();
        let reply = h
            .process(&Frame::new(MCCS_ADDRESS, 0x05, vec![0, 0, 0xFF, 0]), &mut cursor)
            .await;
        assert_exception(&reply, 0x05, 0x01);
    }

    #[tokio::test]
    async fn test_prime_constraint_both_nonzero_is_0x03() {
        let (h, _) = handler();
        let mut cursor = SessionCursor::default();
        let mut prime = [0u16; 10];
        prime[0] = 7; // antenna
        prime[1] = 0x0100; // chip ID too
        let reply = h.process(&write_frame(ANTNUM_REG, &prime), &mut cursor).await;
        assert_exception(&reply, 0x10, 0x03);
        assert!(cursor.filter.is_none());
    }

    #[tokio::test]
    async fn test_cursor_unprimed_read_is_0x04() {
        let (h, _) = handler();
        let mut cursor = SessionCursor::default();
        let reply = h.process(&read_frame(MESSAGE_REG, MESSAGE_REGS), &mut cursor).await;
        assert_exception(&reply, 0x03, 0x04);
    }

    #[tokio::test]
    async fn test_cursor_advance_returns_older_entries() {
        let (h, store) = handler();
        let mut cursor = SessionCursor::default();

        for (ts, msg) in [(100, "first"), (200, "second")] {
            store
                .append_log(ServiceLogEntry {
                    antenna: 7,
                    chipid: [0; 16],
                    timestamp: ts,
                    message: msg.into(),
                })
                .await
                .unwrap();
        }

        let mut prime = [0u16; 10];
        prime[0] = 7;
        let reply = h.process(&write_frame(ANTNUM_REG, &prime), &mut cursor).await;
        assert_eq!(reply.function, 0x10);

        // First read: newest entry (LOGNUM 0)
        let words = reply_words(&h.process(&read_frame(MESSAGE_REG, MESSAGE_REGS), &mut cursor).await);
        assert_eq!(&words[0].to_be_bytes(), b"se");
        assert_eq!(words[MESSAGE_TEXT_REGS as usize + 1], 200);

        // Second read advanced to the older entry
        let words = reply_words(&h.process(&read_frame(MESSAGE_REG, MESSAGE_REGS), &mut cursor).await);
        assert_eq!(&words[0].to_be_bytes(), b"fi");
        assert_eq!(words[MESSAGE_TEXT_REGS as usize + 1], 100);

        // Exhausted: all zeros, cursor stays put
        let words = reply_words(&h.process(&read_frame(MESSAGE_REG, MESSAGE_REGS), &mut cursor).await);
        assert!(words.iter().all(|&w| w == 0));
    }

    #[tokio::test]
    async fn test_append_with_prime_in_same_frame() {
        let (h, store) = handler();
        let mut cursor = SessionCursor::default();

        let mut values = vec![0u16; 10];
        values[0] = 12; // antenna 12
        values.extend(protocol::pdu::bytes_to_registers(b"feed replaced\0").unwrap());
        let reply = h.process(&write_frame(ANTNUM_REG, &values), &mut cursor).await;
        assert_eq!(reply.function, 0x10);

        let entry = store
            .query_log(&LogFilter::antenna(12), 0, LogQueryMode::AnyScope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.message, "feed replaced");
        assert_eq!(entry.timestamp, 1_614_319_283);
    }

    #[tokio::test]
    async fn test_append_after_session_prime() {
        let (h, store) = handler();
        let mut cursor = SessionCursor::default();

        let mut prime = [0u16; 10];
        prime[0] = 3;
        h.process(&write_frame(ANTNUM_REG, &prime), &mut cursor).await;

        let text = protocol::pdu::bytes_to_registers(b"checked LNA\0\0\0").unwrap();
        let reply = h.process(&write_frame(MESSAGE_REG, &text), &mut cursor).await;
        assert_eq!(reply.function, 0x10);
        assert_eq!(store.log_len(), 1);

        // Without a prime the same write is refused
        let mut fresh = SessionCursor::default();
        let reply = h.process(&write_frame(MESSAGE_REG, &text), &mut fresh).await;
        assert_exception(&reply, 0x10, 0x04);
    }

    #[tokio::test]
    async fn test_prime_register_readback() {
        let (h, _) = handler();
        let mut cursor = SessionCursor::default();
        let mut prime = [0u16; 10];
        prime[0] = 42;
        prime[9] = 3;
        h.process(&write_frame(ANTNUM_REG, &prime), &mut cursor).await;

        let words = reply_words(&h.process(&read_frame(ANTNUM_REG, 10), &mut cursor).await);
        assert_eq!(words[0], 42);
        assert_eq!(words[9], 3);
    }
}
