//! Mesh Proxy PDU framing
//!
//! Each UDP datagram carries one Proxy PDU:
//!   SAR(2b) | MessageType(6b) | Data
//!
//! Messages longer than the bearer MTU are split into a First segment, any
//! number of Continuation segments and a Last segment, all with the same
//! message type. Segments from one peer are never interleaved.

use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashMap;
use std::hash::Hash;
use tracing::{debug, warn};

/// Segmentation and reassembly field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Sar {
    Complete = 0b00,
    First = 0b01,
    Continuation = 0b10,
    Last = 0b11,
}

impl From<u8> for Sar {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b00 => Sar::Complete,
            0b01 => Sar::First,
            0b10 => Sar::Continuation,
            _ => Sar::Last,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    NetworkPdu = 0x00,
    MeshBeacon = 0x01,
    ProxyConfiguration = 0x02,
    Provisioning = 0x03,
}

impl TryFrom<u8> for MessageType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MessageType::NetworkPdu),
            0x01 => Ok(MessageType::MeshBeacon),
            0x02 => Ok(MessageType::ProxyConfiguration),
            0x03 => Ok(MessageType::Provisioning),
            _ => Err(anyhow::anyhow!("Unknown proxy message type: 0x{:02x}", value)),
        }
    }
}

/// Parsed Proxy PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPdu {
    pub sar: Sar,
    pub message_type: MessageType,
    pub data: Vec<u8>,
}

impl ProxyPdu {
    /// Parse a raw UDP datagram into a Proxy PDU
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < 2 {
            return Err(anyhow::anyhow!("Proxy PDU too short: {} bytes", data.len()));
        }

        let mut buf = data;
        let header = buf.get_u8();

        Ok(ProxyPdu {
            sar: Sar::from(header >> 6),
            message_type: MessageType::try_from(header & 0x3F)?,
            data: buf.to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(1 + self.data.len());
        buf.put_u8(((self.sar as u8) << 6) | self.message_type as u8);
        buf.put_slice(&self.data);
        buf.to_vec()
    }
}

/// Split a message into Proxy PDUs carrying at most `max_data` bytes each.
pub fn segment(message_type: MessageType, data: &[u8], max_data: usize) -> Vec<ProxyPdu> {
    let max_data = max_data.max(1);
    if data.len() <= max_data {
        return vec![ProxyPdu {
            sar: Sar::Complete,
            message_type,
            data: data.to_vec(),
        }];
    }

    let chunks: Vec<&[u8]> = data.chunks(max_data).collect();
    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| ProxyPdu {
            sar: match i {
                0 => Sar::First,
                i if i == last => Sar::Last,
                _ => Sar::Continuation,
            },
            message_type,
            data: chunk.to_vec(),
        })
        .collect()
}

/// Joins segmented Proxy PDUs, one partial message per peer
#[derive(Debug)]
pub struct ProxySar<K> {
    partial: HashMap<K, (MessageType, BytesMut)>,
}

impl<K> Default for ProxySar<K> {
    fn default() -> Self {
        Self {
            partial: HashMap::new(),
        }
    }
}

impl<K: Hash + Eq + Clone + std::fmt::Debug> ProxySar<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one PDU from `peer`. Returns the full message once it is complete.
    pub fn push(&mut self, peer: &K, pdu: ProxyPdu) -> anyhow::Result<Option<(MessageType, Vec<u8>)>> {
        match pdu.sar {
            Sar::Complete => {
                if self.partial.remove(peer).is_some() {
                    warn!("Discarding unfinished proxy message from {:?}", peer);
                }
                Ok(Some((pdu.message_type, pdu.data)))
            }
            Sar::First => {
                if self.partial.remove(peer).is_some() {
                    warn!("Discarding unfinished proxy message from {:?}", peer);
                }
                self.partial
                    .insert(peer.clone(), (pdu.message_type, BytesMut::from(&pdu.data[..])));
                Ok(None)
            }
            Sar::Continuation | Sar::Last => {
                let Some((message_type, mut buf)) = self.partial.remove(peer) else {
                    return Err(anyhow::anyhow!("{:?} segment without a First segment", pdu.sar));
                };
                if message_type != pdu.message_type {
                    return Err(anyhow::anyhow!(
                        "Proxy segment type {:?} does not match {:?}",
                        pdu.message_type,
                        message_type
                    ));
                }
                buf.put_slice(&pdu.data);

                if pdu.sar == Sar::Last {
                    debug!("Joined {} byte {:?} message", buf.len(), message_type);
                    return Ok(Some((message_type, buf.to_vec())));
                }
                self.partial.insert(peer.clone(), (message_type, buf));
                Ok(None)
            }
        }
    }

    /// Peers with a message in progress
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_network_pdu() {
        let pdu = ProxyPdu::parse(&[0x00, 0x68, 0xEC, 0xA4]).unwrap();
        assert_eq!(pdu.sar, Sar::Complete);
        assert_eq!(pdu.message_type, MessageType::NetworkPdu);
        assert_eq!(pdu.data, vec![0x68, 0xEC, 0xA4]);
        assert_eq!(pdu.encode(), vec![0x00, 0x68, 0xEC, 0xA4]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(ProxyPdu::parse(&[0x00]).is_err());
        assert!(ProxyPdu::parse(&[0x3F, 0x00]).is_err());
    }

    #[test]
    fn test_segment_and_join() {
        let data: Vec<u8> = (0u8..29).collect();
        let pdus = segment(MessageType::NetworkPdu, &data, 10);
        assert_eq!(
            pdus.iter().map(|p| p.sar).collect::<Vec<_>>(),
            vec![Sar::First, Sar::Continuation, Sar::Last]
        );
        assert_eq!(pdus[0].encode()[0], 0x40);
        assert_eq!(pdus[2].encode()[0], 0xC0);

        let mut sar = ProxySar::new();
        let mut joined = None;
        for pdu in pdus {
            let parsed = ProxyPdu::parse(&pdu.encode()).unwrap();
            joined = sar.push(&"peer", parsed).unwrap();
        }
        assert_eq!(joined, Some((MessageType::NetworkPdu, data)));
        assert_eq!(sar.pending(), 0);
    }

    #[test]
    fn test_peers_are_joined_separately() {
        let mut sar = ProxySar::new();
        let a = segment(MessageType::MeshBeacon, &[1, 2, 3, 4], 2);
        let b = segment(MessageType::MeshBeacon, &[9, 8, 7, 6], 2);

        assert_eq!(sar.push(&1, a[0].clone()).unwrap(), None);
        assert_eq!(sar.push(&2, b[0].clone()).unwrap(), None);
        assert_eq!(sar.pending(), 2);
        assert_eq!(
            sar.push(&2, b[1].clone()).unwrap(),
            Some((MessageType::MeshBeacon, vec![9, 8, 7, 6]))
        );
        assert_eq!(
            sar.push(&1, a[1].clone()).unwrap(),
            Some((MessageType::MeshBeacon, vec![1, 2, 3, 4]))
        );
    }

    #[test]
    fn test_out_of_sequence_segments_rejected() {
        let mut sar = ProxySar::new();
        let last = ProxyPdu {
            sar: Sar::Last,
            message_type: MessageType::NetworkPdu,
            data: vec![1],
        };
        assert!(sar.push(&"peer", last).is_err());

        let pdus = segment(MessageType::NetworkPdu, &[1, 2, 3], 2);
        sar.push(&"peer", pdus[0].clone()).unwrap();
        let wrong_type = ProxyPdu {
            message_type: MessageType::MeshBeacon,
            ..pdus[1].clone()
        };
        assert!(sar.push(&"peer", wrong_type).is_err());
        assert_eq!(sar.pending(), 0);
    }
}
