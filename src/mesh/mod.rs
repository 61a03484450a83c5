pub mod access;
pub mod beacon;
pub mod crypto;
pub mod encoder;
pub mod keys;
pub mod lower;
pub mod network;
pub mod pipeline;
pub mod reassembly;
pub mod transport;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Mesh address class, from the top bits of a 16-bit address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Unassigned,
    Unicast,
    Virtual,
    Group,
}

impl From<u16> for AddressType {
    fn from(address: u16) -> Self {
        match address {
            0x0000 => AddressType::Unassigned,
            a if a & 0x8000 == 0 => AddressType::Unicast,
            a if a & 0xC000 == 0x8000 => AddressType::Virtual,
            _ => AddressType::Group,
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::Unassigned => write!(f, "unassigned"),
            AddressType::Unicast => write!(f, "unicast"),
            AddressType::Virtual => write!(f, "virtual"),
            AddressType::Group => write!(f, "group"),
        }
    }
}

pub fn is_unicast(address: u16) -> bool {
    AddressType::from(address) == AddressType::Unicast
}

pub fn is_virtual(address: u16) -> bool {
    AddressType::from(address) == AddressType::Virtual
}

/// First byte of every CCM nonce, selecting the layer it secures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NonceType {
    Network = 0x00,
    Application = 0x01,
    Device = 0x02,
    Proxy = 0x03,
}

/// How a network PDU reached us. Proxy bearer traffic uses the proxy nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bearer {
    #[default]
    Advertising,
    Proxy,
}

impl fmt::Display for Bearer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bearer::Advertising => write!(f, "advertising"),
            Bearer::Proxy => write!(f, "proxy"),
        }
    }
}
