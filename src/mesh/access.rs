//! Access layer opcodes
//!
//!   0xxxxxxx (except 0x7F)      1-octet SIG opcode
//!   10xxxxxx xxxxxxxx           2-octet SIG opcode
//!   11xxxxxx + CompanyID(2, LE) 3-octet vendor opcode

use std::fmt;

use crate::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    OneOctet(u8),
    TwoOctet(u16),
    Vendor { opcode: u8, company_id: u16 },
}

impl Opcode {
    pub fn encoded_len(&self) -> usize {
        match self {
            Opcode::OneOctet(_) => 1,
            Opcode::TwoOctet(_) => 2,
            Opcode::Vendor { .. } => 3,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::OneOctet(op) => write!(f, "0x{:02x}", op),
            Opcode::TwoOctet(op) => write!(f, "0x{:04x}", op),
            Opcode::Vendor { opcode, company_id } => {
                write!(f, "0x{:02x} (company 0x{:04x})", opcode, company_id)
            }
        }
    }
}

/// Split an access payload into its opcode and parameters.
pub fn split_opcode(payload: &[u8]) -> Result<(Opcode, &[u8]), DecodeError> {
    let malformed = |min| DecodeError::Malformed {
        what: "access payload",
        len: payload.len(),
        min,
    };

    let first = *payload.first().ok_or_else(|| malformed(1))?;
    match first >> 6 {
        0b00 | 0b01 => {
            if first == 0x7F {
                return Err(DecodeError::ReservedOpcode(first));
            }
            Ok((Opcode::OneOctet(first), &payload[1..]))
        }
        0b10 => {
            if payload.len() < 2 {
                return Err(malformed(2));
            }
            let opcode = u16::from_be_bytes([payload[0], payload[1]]);
            Ok((Opcode::TwoOctet(opcode), &payload[2..]))
        }
        _ => {
            if payload.len() < 3 {
                return Err(malformed(3));
            }
            let company_id = u16::from_le_bytes([payload[1], payload[2]]);
            Ok((
                Opcode::Vendor {
                    opcode: first,
                    company_id,
                },
                &payload[3..],
            ))
        }
    }
}
