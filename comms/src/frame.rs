//! # Wire Frame Format
//!
//! Two physical variants share the same control logic. All framing math is
//! expressed in terms of [`WIRE_HEADER_BYTES`] and [`WIRE_CRC_BYTES`].
//!
//! ## Variant A (`scheme-a` feature)
//!
//! ```text
//! ┌─────┬──────┬──────┬───────┬─────────────┬────────┐
//! │ SEQ │ NESN │ DEST │  LEN  │   Payload   │ CRC-8  │
//! │  1  │  1   │  2   │   4   │  0..14 B    │  1 B   │
//! └─────┴──────┴──────┴───────┴─────────────┴────────┘
//! ```
//!
//! ## Variant B (default)
//!
//! ```text
//! ┌─────┬──────┬──────┬────────┬─────────┬─────────────┬─────────┐
//! │ SEQ │ NESN │ DEST │ LEN_hi │ LEN_lo  │   Payload   │ CRC-16  │
//! │  1  │  1   │  2   │   4    │   8     │  0..32 B    │ 2 B, BE │
//! └─────┴──────┴──────┴────────┴─────────┴─────────────┴─────────┘
//! ```
//!
//! LEN counts header plus payload; the CRC is not included.

use heapless::Vec;

use crate::crc;

#[cfg(feature = "scheme-a")]
mod variant {
    pub const WIRE_HEADER_BYTES: usize = 1;
    pub const WIRE_CRC_BYTES: usize = 1;
    pub const WIRE_MAX_PAYLOAD: usize = 14;
}

#[cfg(not(feature = "scheme-a"))]
mod variant {
    pub const WIRE_HEADER_BYTES: usize = 2;
    pub const WIRE_CRC_BYTES: usize = 2;
    pub const WIRE_MAX_PAYLOAD: usize = 32;
}

pub use variant::{WIRE_CRC_BYTES, WIRE_HEADER_BYTES, WIRE_MAX_PAYLOAD};

/// Header plus checksum overhead of every frame
pub const WIRE_NO_OF_BYTES: usize = WIRE_HEADER_BYTES + WIRE_CRC_BYTES;

/// Largest complete frame on the link
pub const WIRE_MAX_FRAME_BYTES: usize = WIRE_NO_OF_BYTES + WIRE_MAX_PAYLOAD;

const SEQ_BIT: u8 = 0x80;
const NESN_BIT: u8 = 0x40;
const DEST_SHIFT: u8 = 4;
const LEN_MASK: u8 = 0x0F;

/// A complete frame held in a fixed buffer
pub type FrameBuf = Vec<u8, WIRE_MAX_FRAME_BYTES>;

/// Errors during frame encoding/decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Payload does not fit in a frame
    TooLarge,
    /// Fewer bytes than header and checksum
    TooShort,
    /// LEN field disagrees with the number of bytes received
    LengthMismatch,
    /// Checksum failed
    BadChecksum,
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrameHeader {
    /// Sender's sequence bit
    pub seq: bool,
    /// Sequence bit the sender expects next from us
    pub nesn: bool,
    /// Raw 2-bit DEST field
    pub address: u8,
    /// Header plus payload length
    pub len: usize,
}

impl FrameHeader {
    /// Header for a frame carrying `payload_len` bytes
    pub fn new(seq: bool, nesn: bool, address: u8, payload_len: usize) -> Self {
        Self {
            seq,
            nesn,
            address: address & 0x03,
            len: WIRE_HEADER_BYTES + payload_len,
        }
    }

    /// Number of payload bytes that follow the header
    pub fn payload_len(&self) -> usize {
        self.len.saturating_sub(WIRE_HEADER_BYTES)
    }

    /// Total frame size including checksum
    pub fn frame_len(&self) -> usize {
        self.len + WIRE_CRC_BYTES
    }

    fn first_byte(&self) -> u8 {
        let mut byte = (self.address & 0x03) << DEST_SHIFT;
        if self.seq {
            byte |= SEQ_BIT;
        }
        if self.nesn {
            byte |= NESN_BIT;
        }
        byte
    }

    /// Write the header into the first [`WIRE_HEADER_BYTES`] of `out`
    #[cfg(feature = "scheme-a")]
    pub fn write(&self, out: &mut [u8]) {
        out[0] = self.first_byte() | (self.len as u8 & LEN_MASK);
    }

    /// Write the header into the first [`WIRE_HEADER_BYTES`] of `out`
    #[cfg(not(feature = "scheme-a"))]
    pub fn write(&self, out: &mut [u8]) {
        out[0] = self.first_byte() | ((self.len >> 8) as u8 & LEN_MASK);
        out[1] = self.len as u8;
    }

    /// Parse a header from the first [`WIRE_HEADER_BYTES`] of `bytes`
    pub fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < WIRE_HEADER_BYTES {
            return None;
        }
        let first = bytes[0];
        #[cfg(feature = "scheme-a")]
        let len = (first & LEN_MASK) as usize;
        #[cfg(not(feature = "scheme-a"))]
        let len = (((first & LEN_MASK) as usize) << 8) | bytes[1] as usize;

        Some(Self {
            seq: first & SEQ_BIT != 0,
            nesn: first & NESN_BIT != 0,
            address: (first >> DEST_SHIFT) & 0x03,
            len,
        })
    }
}

/// Build a complete frame (header, payload, checksum)
pub fn encode(header: &FrameHeader, payload: &[u8]) -> Result<FrameBuf, FrameError> {
    if payload.len() > WIRE_MAX_PAYLOAD {
        return Err(FrameError::TooLarge);
    }

    let header = FrameHeader {
        len: WIRE_HEADER_BYTES + payload.len(),
        ..*header
    };
    let mut frame = FrameBuf::new();
    frame
        .resize_default(WIRE_HEADER_BYTES)
        .map_err(|_| FrameError::TooLarge)?;
    header.write(&mut frame);
    frame
        .extend_from_slice(payload)
        .map_err(|_| FrameError::TooLarge)?;
    append_checksum(&mut frame)?;
    Ok(frame)
}

#[cfg(feature = "scheme-a")]
fn append_checksum(frame: &mut FrameBuf) -> Result<(), FrameError> {
    let crc = crc::crc8(frame);
    frame.push(crc).map_err(|_| FrameError::TooLarge)
}

#[cfg(not(feature = "scheme-a"))]
fn append_checksum(frame: &mut FrameBuf) -> Result<(), FrameError> {
    let crc = crc::crc16(frame);
    frame
        .extend_from_slice(&crc.to_be_bytes())
        .map_err(|_| FrameError::TooLarge)
}

fn checksum_ok(frame: &[u8]) -> bool {
    if cfg!(feature = "scheme-a") {
        crc::crc8_verify(frame)
    } else {
        crc::crc16_verify(frame)
    }
}

/// Verify and split a complete frame into header and payload
pub fn decode(frame: &[u8]) -> Result<(FrameHeader, &[u8]), FrameError> {
    if frame.len() < WIRE_NO_OF_BYTES {
        return Err(FrameError::TooShort);
    }
    if !checksum_ok(frame) {
        return Err(FrameError::BadChecksum);
    }

    let header = FrameHeader::read(frame).ok_or(FrameError::TooShort)?;
    if header.frame_len() != frame.len() || header.len < WIRE_HEADER_BYTES {
        return Err(FrameError::LengthMismatch);
    }
    if header.payload_len() > WIRE_MAX_PAYLOAD {
        return Err(FrameError::TooLarge);
    }

    Ok((header, &frame[WIRE_HEADER_BYTES..header.len]))
}

/// Byte-at-a-time frame assembler for the receive path
///
/// The header's LEN field tells the deframer where the frame ends. A header
/// announcing an impossible length discards the bytes collected so far.
#[derive(Debug, Default)]
pub struct Deframer {
    buf: FrameBuf,
}

impl Deframer {
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Discard any partial frame
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Feed one received byte; returns the frame once it is complete
    pub fn push(&mut self, byte: u8) -> Option<FrameBuf> {
        if self.buf.push(byte).is_err() {
            self.buf.clear();
            return None;
        }

        let header = FrameHeader::read(&self.buf)?;
        let expected = header.frame_len();
        if header.len < WIRE_HEADER_BYTES || expected > WIRE_MAX_FRAME_BYTES {
            log::warn!("Bad frame length {}", header.len);
            self.buf.clear();
            return None;
        }

        if self.buf.len() >= expected {
            Some(core::mem::take(&mut self.buf))
        } else {
            None
        }
    }
}
