//! Typed failure signals for key configuration and packet decoding

use thiserror::Error;

/// A key configuration entry that could not be turned into a usable record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyConfigError {
    #[error("{field}: invalid hex string: {reason}")]
    InvalidHex { field: &'static str, reason: String },

    #[error("{field}: expected {expected} bytes, got {actual}")]
    WrongLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Why a packet (or the message it belongs to) was not fully decoded.
///
/// None of these are fatal: the caller keeps the undecoded bytes and moves on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed {what}: {len} bytes (minimum {min})")]
    Malformed {
        what: &'static str,
        len: usize,
        min: usize,
    },

    #[error("invalid segment {seg_o}/{seg_n}: {reason}")]
    InvalidSegment {
        seg_o: u8,
        seg_n: u8,
        reason: &'static str,
    },

    #[error("reserved access opcode 0x{0:02x}")]
    ReservedOpcode(u8),

    #[error("unknown beacon type 0x{0:02x}")]
    UnknownBeacon(u8),

    #[error("no network key matched NID 0x{nid:02x} (IVI {ivi})")]
    NetworkDecryptFailed { nid: u8, ivi: u8 },

    #[error(
        "no {key_class} key matched message from 0x{src:04x} to 0x{dst:04x} \
         (SeqZero {seq_zero}, IV index 0x{iv_index:08x})"
    )]
    TransportDecryptFailed {
        key_class: &'static str,
        src: u16,
        dst: u16,
        seq_zero: u16,
        iv_index: u32,
    },

    #[error(
        "reassembly incomplete for 0x{src:04x} (SeqZero {seq_zero}, IV index 0x{iv_index:08x}): \
         {segments} segment(s) received"
    )]
    ReassemblyIncomplete {
        src: u16,
        seq_zero: u16,
        iv_index: u32,
        segments: u32,
    },
}
