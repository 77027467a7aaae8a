//! Modbus-ASCII protocol definitions and frame codec
//!
//! A frame on the PaSD bus is `:` + uppercase ASCII-hex of
//! (station address, function code, payload, LRC) + CR LF. The LRC is the
//! two's-complement of the 8-bit sum over every byte before it, so the sum
//! of a whole valid frame (including the LRC) is zero mod 256.
//!
//! Register numbers travel on the wire as `regnum - 1`; the builders and
//! parsers here take care of that so the rest of the crate deals in 1-based
//! register numbers only.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PasdError, PasdResult};

/// Modbus function codes used on the PaSD bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Convert from a raw byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x06 => Some(FunctionCode::WriteSingleRegister),
            0x10 => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }

    /// Convert to the raw byte
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// The function byte a device uses when reporting an exception
    /// for this function (bit 0x80 set)
    pub fn exception_function(self) -> u8 {
        self.to_u8() | 0x80
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FunctionCode::ReadHoldingRegisters => "Read Holding Registers",
            FunctionCode::WriteSingleRegister => "Write Single Register",
            FunctionCode::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes the PaSD devices and the MCCS slave surface use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
}

impl ExceptionCode {
    /// Convert from a raw byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ExceptionCode::IllegalFunction),
            0x02 => Some(ExceptionCode::IllegalDataAddress),
            0x03 => Some(ExceptionCode::IllegalDataValue),
            0x04 => Some(ExceptionCode::ServerDeviceFailure),
            _ => None,
        }
    }

    /// Convert to the raw byte
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ExceptionCode::IllegalFunction => "Function code not supported by the device",
            ExceptionCode::IllegalDataAddress => "Register window not defined on the device",
            ExceptionCode::IllegalDataValue => "Value not allowable for the target register",
            ExceptionCode::ServerDeviceFailure => "Unrecoverable error while performing the request",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// One Modbus-ASCII frame: station address, function code, payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u8,
    pub function: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame
    pub fn new(address: u8, function: u8, payload: Vec<u8>) -> Self {
        Self { address, function, payload }
    }
}

/// Result of decoding one frame off the wire
///
/// Exception frames (function code with bit 0x80 set, payload of one
/// exception-code byte) are a distinct variant, not a decode error: the
/// frame itself is perfectly well-formed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// An ordinary request or response frame
    Frame(Frame),
    /// An exception response; `function` is the raw byte with 0x80 set
    Exception { address: u8, function: u8, code: u8 },
}

impl Decoded {
    /// Station address of the frame, whichever variant it is
    pub fn address(&self) -> u8 {
        match self {
            Decoded::Frame(f) => f.address,
            Decoded::Exception { address, .. } => *address,
        }
    }
}

/// Compute the LRC over a byte slice
///
/// Two's-complement of the sum, masked to 8 bits. Appending the result to
/// the input makes the whole sequence sum to zero mod 256.
pub fn lrc(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    sum.wrapping_neg()
}

/// Encode a frame to its ASCII wire form, LRC and CRLF included
pub fn encode(frame: &Frame) -> Vec<u8> {
    let mut raw = Vec::with_capacity(2 + frame.payload.len() + 1);
    raw.push(frame.address);
    raw.push(frame.function);
    raw.extend_from_slice(&frame.payload);
    raw.push(lrc(&raw[..]));

    let mut out = Vec::with_capacity(raw.len() * 2 + 3);
    out.push(b':');
    for byte in raw {
        out.push(HEX_DIGITS[(byte >> 4) as usize]);
        out.push(HEX_DIGITS[(byte & 0x0F) as usize]);
    }
    out.push(b'\r');
    out.push(b'\n');
    out
}

const HEX_DIGITS: [u8; 16] = *b"0123456789ABCDEF";

// Uppercase only: tolerating lowercase would let a flipped 0x20 bit in an
// alpha hex digit slip through with the LRC still valid
fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Decode the hex span between `:` and CRLF into a frame
fn decode_hex_span(hex: &[u8]) -> PasdResult<Decoded> {
    if hex.len() % 2 != 0 {
        return Err(PasdError::OddHex { length: hex.len() });
    }
    let mut raw = Vec::with_capacity(hex.len() / 2);
    for (i, pair) in hex.chunks_exact(2).enumerate() {
        let hi = hex_value(pair[0]).ok_or(PasdError::BadHexDigit { byte: pair[0], offset: i * 2 })?;
        let lo = hex_value(pair[1]).ok_or(PasdError::BadHexDigit { byte: pair[1], offset: i * 2 + 1 })?;
        raw.push((hi << 4) | lo);
    }
    if raw.len() < 4 {
        return Err(PasdError::FrameTooShort { length: raw.len() });
    }

    let (body, check) = raw.split_at(raw.len() - 1);
    let expected = lrc(body);
    if check[0] != expected {
        return Err(PasdError::LrcMismatch { expected, actual: check[0] });
    }

    let address = body[0];
    let function = body[1];
    let payload = body[2..].to_vec();

    if function & 0x80 != 0 {
        // Exception frames carry exactly one code byte
        let code = payload.first().copied().unwrap_or(0);
        return Ok(Decoded::Exception { address, function, code });
    }

    Ok(Decoded::Frame(Frame { address, function, payload }))
}

/// Decode one complete frame from a buffer
///
/// The buffer must hold exactly one frame, `:` through CRLF. Leading bytes
/// before the `:` are rejected as [`PasdError::BadStartChar`]; a missing
/// terminator is [`PasdError::MissingCrlf`].
pub fn decode(buf: &[u8]) -> PasdResult<Decoded> {
    if buf.first() != Some(&b':') {
        return Err(PasdError::BadStartChar);
    }
    if buf.len() < 3 || &buf[buf.len() - 2..] != b"\r\n" {
        return Err(PasdError::MissingCrlf);
    }
    decode_hex_span(&buf[1..buf.len() - 2])
}

/// Incremental frame decoder over an inbound byte stream
///
/// Bytes before the next `:` are discarded silently: on the shared bus they
/// are line noise from PDoC turn-on transients, or fragments of traffic
/// belonging to the SID. A `:` arriving inside an unterminated frame
/// resynchronises the decoder and reports the torn frame as
/// [`PasdError::MissingCrlf`].
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(512) }
    }

    /// Append inbound bytes
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Discard everything up to (but not including) the next `:`
    pub fn drain_to_start(&mut self) {
        match self.buf.iter().position(|&b| b == b':') {
            Some(pos) => self.buf.advance(pos),
            None => self.buf.clear(),
        }
    }

    /// Drop everything buffered, stale partial frames included
    ///
    /// Called by the transaction layer after a timeout: whatever is
    /// buffered belongs to a reply that will never be paired, and any
    /// remainder of it that trickles in later carries no `:` so the
    /// garbage skip in [`Self::try_next`] swallows it.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Try to pull one complete frame out of the buffer
    ///
    /// Returns `Ok(None)` when more bytes are needed. Decode failures
    /// consume the offending span so the caller can keep feeding bytes.
    pub fn try_next(&mut self) -> PasdResult<Option<Decoded>> {
        // Skip to the start delimiter
        match self.buf.iter().position(|&b| b == b':') {
            Some(pos) => self.buf.advance(pos),
            None => {
                self.buf.clear();
                return Ok(None);
            }
        }

        // A second ':' before CRLF means the current frame was torn
        if let Some(restart) = self.buf[1..].iter().position(|&b| b == b':') {
            let crlf = find_crlf(&self.buf[..]);
            if crlf.is_none() || crlf.unwrap() > restart + 1 {
                self.buf.advance(restart + 1);
                return Err(PasdError::MissingCrlf);
            }
        }

        let end = match find_crlf(&self.buf[..]) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let frame: Vec<u8> = self.buf.split_to(end + 2).to_vec();
        decode_hex_span(&frame[1..frame.len() - 2]).map(Some)
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Payload builders and parsers for the three supported functions
pub mod pdu {
    use super::*;

    /// 0x03 request payload: wire register number and count
    pub fn read_request(regnum: u16, count: u16) -> Vec<u8> {
        let mut p = Vec::with_capacity(4);
        p.extend_from_slice(&(regnum - 1).to_be_bytes());
        p.extend_from_slice(&count.to_be_bytes());
        p
    }

    /// Parse a 0x03 response payload (byte count + big-endian words)
    pub fn parse_read_response(payload: &[u8], count: u16) -> PasdResult<Vec<u16>> {
        if payload.is_empty() {
            return Err(PasdError::FrameTooShort { length: 0 });
        }
        let byte_count = payload[0] as usize;
        if payload.len() < 1 + byte_count || byte_count != count as usize * 2 {
            return Err(PasdError::invalid_range(format!(
                "read response byte count {} does not match {} registers",
                byte_count, count
            )));
        }
        Ok(payload[1..1 + byte_count]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }

    /// 0x06 request payload; the response must echo it exactly
    pub fn write_request(regnum: u16, value: u16) -> Vec<u8> {
        let mut p = Vec::with_capacity(4);
        p.extend_from_slice(&(regnum - 1).to_be_bytes());
        p.extend_from_slice(&value.to_be_bytes());
        p
    }

    /// 0x10 request payload: wire register number, count, byte count, data
    pub fn write_multiple_request(regnum: u16, values: &[u16]) -> Vec<u8> {
        let mut p = Vec::with_capacity(5 + values.len() * 2);
        p.extend_from_slice(&(regnum - 1).to_be_bytes());
        p.extend_from_slice(&(values.len() as u16).to_be_bytes());
        p.push((values.len() * 2) as u8);
        for v in values {
            p.extend_from_slice(&v.to_be_bytes());
        }
        p
    }

    /// The echo a 0x10 response must carry: wire register number and count
    pub fn write_multiple_echo(regnum: u16, count: u16) -> Vec<u8> {
        let mut p = Vec::with_capacity(4);
        p.extend_from_slice(&(regnum - 1).to_be_bytes());
        p.extend_from_slice(&count.to_be_bytes());
        p
    }

    /// Convert big-endian register words to bytes
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &r in registers {
            bytes.extend_from_slice(&r.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to big-endian register words
    pub fn bytes_to_registers(bytes: &[u8]) -> PasdResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(PasdError::invalid_range("odd byte count for register data"));
        }
        Ok(bytes
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lrc_known_frame() {
        // :010300000008F4 reads 8 registers from regnum 1 on station 1
        let body = [0x01, 0x03, 0x00, 0x00, 0x00, 0x08];
        assert_eq!(lrc(&body), 0xF4);
    }

    #[test]
    fn test_encode_known_frame() {
        let frame = Frame::new(0x01, 0x03, pdu::read_request(1, 8));
        assert_eq!(encode(&frame), b":010300000008F4\r\n");
    }

    #[test]
    fn test_round_trip() {
        let frame = Frame::new(31, 0x10, pdu::write_multiple_request(1001, &[100, 90, 10, 5]));
        let wire = encode(&frame);
        match decode(&wire).unwrap() {
            Decoded::Frame(f) => assert_eq!(f, frame),
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_exception_frame_is_distinct_variant() {
        let wire = encode(&Frame::new(31, 0x83, vec![0x02]));
        match decode(&wire).unwrap() {
            Decoded::Exception { address, function, code } => {
                assert_eq!(address, 31);
                assert_eq!(function, 0x83);
                assert_eq!(code, 0x02);
            }
            other => panic!("expected exception, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_errors_are_distinct() {
        assert_eq!(decode(b"010300000008F4\r\n"), Err(PasdError::BadStartChar));
        assert_eq!(decode(b":010300000008F4"), Err(PasdError::MissingCrlf));
        assert!(matches!(decode(b":0103000F4\r\n"), Err(PasdError::OddHex { .. })));
        assert!(matches!(decode(b":01030000000GF4\r\n"), Err(PasdError::BadHexDigit { .. })));
        assert!(matches!(decode(b":0103F8\r\n"), Err(PasdError::FrameTooShort { length: 3 })));
        assert!(matches!(decode(b":010300000008F5\r\n"), Err(PasdError::LrcMismatch { .. })));
    }

    #[test]
    fn test_single_bit_flip_detected() {
        let wire = encode(&Frame::new(1, 0x03, pdu::read_request(1, 8)));
        // Flip one bit in every hex character position and expect a failure
        for i in 1..wire.len() - 2 {
            for bit in 0..8 {
                let mut corrupted = wire.clone();
                corrupted[i] ^= 1 << bit;
                assert!(
                    decode(&corrupted).is_err(),
                    "bit {} of byte {} survived corruption",
                    bit,
                    i
                );
            }
        }
    }

    #[test]
    fn test_decoder_skips_garbage() {
        let mut dec = FrameDecoder::new();
        dec.push(b"\x00\x00noise");
        dec.push(&encode(&Frame::new(1, 0x06, pdu::write_request(22, 1))));
        let got = dec.try_next().unwrap().unwrap();
        assert_eq!(got.address(), 1);
        assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn test_decoder_incremental() {
        let wire = encode(&Frame::new(2, 0x03, pdu::read_request(1, 59)));
        let mut dec = FrameDecoder::new();
        let (head, tail) = wire.split_at(5);
        dec.push(head);
        assert_eq!(dec.try_next().unwrap(), None);
        dec.push(tail);
        assert!(matches!(dec.try_next().unwrap(), Some(Decoded::Frame(_))));
    }

    #[test]
    fn test_decoder_resyncs_on_torn_frame() {
        let mut dec = FrameDecoder::new();
        dec.push(b":01030000");
        dec.push(&encode(&Frame::new(1, 0x06, pdu::write_request(22, 1))));
        assert_eq!(dec.try_next(), Err(PasdError::MissingCrlf));
        assert!(matches!(dec.try_next().unwrap(), Some(Decoded::Frame(_))));
    }

    #[test]
    fn test_drain_to_start() {
        let mut dec = FrameDecoder::new();
        dec.push(b"AB03");
        dec.drain_to_start();
        assert_eq!(dec.pending(), 0);
        dec.push(b"junk:0103");
        dec.drain_to_start();
        assert_eq!(dec.pending(), 5);
    }

    #[test]
    fn test_pdu_read_response_parse() {
        let payload = [4, 0x12, 0x34, 0x56, 0x78];
        let regs = pdu::parse_read_response(&payload, 2).unwrap();
        assert_eq!(regs, vec![0x1234, 0x5678]);
        assert!(pdu::parse_read_response(&payload, 3).is_err());
    }

    #[test]
    fn test_wire_register_numbering() {
        // regnum 1 is wire address 0
        assert_eq!(pdu::read_request(1, 8), vec![0, 0, 0, 8]);
        assert_eq!(pdu::write_request(1001, 7)[..2], [0x03, 0xE8]);
    }
}
