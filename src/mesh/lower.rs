//! Lower transport PDU headers
//!
//! Access (CTL=0):
//!   unsegmented: SEG=0(1b) AKF(1b) AID(6b) | upper transport PDU
//!   segmented:   SEG=1(1b) AKF(1b) AID(6b) | SZMIC(1b) SeqZero(13b) SegO(5b) SegN(5b) | segment (<=12)
//! Control (CTL=1):
//!   unsegmented: SEG=0(1b) Opcode(7b) | parameters
//!   segmented:   SEG=1(1b) Opcode(7b) | RFU(1b) SeqZero(13b) SegO(5b) SegN(5b) | segment (<=8)

use bytes::Buf;

use crate::error::DecodeError;

pub const ACCESS_SEGMENT_SIZE: usize = 12;
pub const CONTROL_SEGMENT_SIZE: usize = 8;

/// Control opcode of the Segment Acknowledgment message
pub const SEGMENT_ACK_OPCODE: u8 = 0x00;

/// Segmentation fields shared by segmented access and control PDUs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub seq_zero: u16,
    pub seg_o: u8,
    pub seg_n: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerTransportPdu {
    UnsegmentedAccess {
        akf: bool,
        aid: u8,
        upper_pdu: Vec<u8>,
    },
    SegmentedAccess {
        akf: bool,
        aid: u8,
        szmic: bool,
        segment: SegmentHeader,
        data: Vec<u8>,
    },
    UnsegmentedControl {
        opcode: u8,
        parameters: Vec<u8>,
    },
    SegmentedControl {
        opcode: u8,
        segment: SegmentHeader,
        data: Vec<u8>,
    },
}

impl LowerTransportPdu {
    pub fn segment(&self) -> Option<&SegmentHeader> {
        match self {
            LowerTransportPdu::SegmentedAccess { segment, .. }
            | LowerTransportPdu::SegmentedControl { segment, .. } => Some(segment),
            _ => None,
        }
    }
}

/// Parse a lower transport PDU. `ctl` comes from the network header.
pub fn parse(ctl: bool, pdu: &[u8]) -> Result<LowerTransportPdu, DecodeError> {
    if pdu.is_empty() {
        return Err(DecodeError::Malformed {
            what: "lower transport PDU",
            len: 0,
            min: 1,
        });
    }

    let mut buf = pdu;
    let first = buf.get_u8();
    let seg = first & 0x80 != 0;

    if !seg {
        return Ok(if ctl {
            LowerTransportPdu::UnsegmentedControl {
                opcode: first & 0x7F,
                parameters: buf.to_vec(),
            }
        } else {
            LowerTransportPdu::UnsegmentedAccess {
                akf: first & 0x40 != 0,
                aid: first & 0x3F,
                upper_pdu: buf.to_vec(),
            }
        });
    }

    // Segmentation header + at least one byte of segment data
    if buf.remaining() < 4 {
        return Err(DecodeError::Malformed {
            what: "segmented lower transport PDU",
            len: pdu.len(),
            min: 5,
        });
    }

    let fields = buf.get_uint(3) as u32;
    let top_bit = fields & 0x80_0000 != 0;
    let segment = SegmentHeader {
        seq_zero: ((fields >> 10) & 0x1FFF) as u16,
        seg_o: ((fields >> 5) & 0x1F) as u8,
        seg_n: (fields & 0x1F) as u8,
    };
    let data = buf.to_vec();

    Ok(if ctl {
        LowerTransportPdu::SegmentedControl {
            opcode: first & 0x7F,
            segment,
            data,
        }
    } else {
        LowerTransportPdu::SegmentedAccess {
            akf: first & 0x40 != 0,
            aid: first & 0x3F,
            szmic: top_bit,
            segment,
            data,
        }
    })
}

/// Recover the 24-bit sequence number a segmented message was first sent
/// with (SeqAuth) from the SEQ of one of its segments and SeqZero.
pub fn seq_auth(seq: u32, seq_zero: u16) -> u32 {
    let seq = seq & 0xFF_FFFF;
    let candidate = (seq & !0x1FFF) | (seq_zero as u32 & 0x1FFF);
    if candidate > seq {
        candidate.wrapping_sub(0x2000) & 0xFF_FFFF
    } else {
        candidate
    }
}

/// Segment Acknowledgment control message parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAck {
    /// Sent by a Friend on behalf of a Low Power node
    pub obo: bool,
    pub seq_zero: u16,
    /// Bit n set when segment n was received
    pub block_ack: u32,
}

impl SegmentAck {
    pub fn parse(parameters: &[u8]) -> Result<Self, DecodeError> {
        if parameters.len() != 6 {
            return Err(DecodeError::Malformed {
                what: "segment acknowledgment",
                len: parameters.len(),
                min: 6,
            });
        }
        let mut buf = parameters;
        let head = buf.get_u16();
        Ok(SegmentAck {
            obo: head & 0x8000 != 0,
            seq_zero: (head >> 2) & 0x1FFF,
            block_ack: buf.get_u32(),
        })
    }

    /// Segment numbers acknowledged, lowest first
    pub fn acked_segments(&self) -> Vec<u8> {
        (0..32u8).filter(|&n| self.block_ack & (1u32 << n) != 0).collect()
    }
}
