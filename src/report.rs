//! Serializable decode results, one per received packet

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::mesh::beacon::Beacon;
use crate::mesh::keys::KeyStore;
use crate::mesh::network::NetworkPdu;
use crate::mesh::pipeline::{DecodedMessage, Outcome, UpperPayload};
use crate::mesh::{AddressType, Bearer};

/// A decoded (or undecodable) packet
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DecodedPacket {
    /// Timestamp of reception
    pub received_at: DateTime<Utc>,
    /// Peer address or trace file position
    pub source: String,
    pub bearer: Bearer,
    pub status: DecodeStatus,
    /// Packet bytes as received (hex encoded)
    pub raw: String,
    pub network: Option<NetworkReport>,
    pub message: Option<MessageReport>,
    pub beacon: Option<BeaconReport>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecodeStatus {
    Decrypted,
    NoKeyMatch,
    ReassemblyIncomplete,
    /// Authenticated, but the transport PDU is invalid
    Malformed,
    Undecodable,
    Beacon,
}

impl fmt::Display for DecodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecodeStatus::Decrypted => "decrypted",
            DecodeStatus::NoKeyMatch => "no-key-match",
            DecodeStatus::ReassemblyIncomplete => "reassembly-incomplete",
            DecodeStatus::Malformed => "malformed",
            DecodeStatus::Undecodable => "undecodable",
            DecodeStatus::Beacon => "beacon",
        };
        write!(f, "{}", s)
    }
}

/// Network header of an authenticated PDU
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkReport {
    pub nid: u8,
    pub ivi: u8,
    pub ctl: bool,
    pub ttl: u8,
    pub seq: u32,
    /// Source address (e.g. "0x1201")
    pub src: String,
    pub dst: String,
    /// "unicast", "group", "virtual" or "unassigned"
    pub dst_type: String,
    pub iv_index: u32,
}

impl From<&NetworkPdu> for NetworkReport {
    fn from(pdu: &NetworkPdu) -> Self {
        let h = &pdu.header;
        NetworkReport {
            nid: h.nid,
            ivi: h.ivi,
            ctl: h.ctl,
            ttl: h.ttl,
            seq: h.seq,
            src: format!("0x{:04x}", h.src),
            dst: format!("0x{:04x}", h.dst),
            dst_type: AddressType::from(h.dst).to_string(),
            iv_index: pdu.iv_index,
        }
    }
}

/// Upper transport content
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageReport {
    #[serde(rename_all = "kebab-case")]
    Access {
        /// "device" or "application"
        key: String,
        key_index: usize,
        /// Label UUID for virtual destinations (hex encoded)
        label: Option<String>,
        opcode: Option<String>,
        /// Decrypted access payload (hex encoded)
        payload: String,
        reassembled: bool,
    },
    #[serde(rename_all = "kebab-case")]
    Control {
        opcode: u8,
        parameters: String,
        reassembled: bool,
    },
    #[serde(rename_all = "kebab-case")]
    SegmentAck {
        obo: bool,
        seq_zero: u16,
        acked: Vec<u8>,
    },
    /// Payload no configured key could open
    #[serde(rename_all = "kebab-case")]
    Encrypted { upper_pdu: String, reassembled: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BeaconReport {
    #[serde(rename_all = "kebab-case")]
    Unprovisioned {
        uuid: String,
        oob_info: u16,
        uri_hash: Option<String>,
    },
    #[serde(rename_all = "kebab-case")]
    SecureNetwork {
        network_id: String,
        iv_index: u32,
        key_refresh: bool,
        iv_update: bool,
        authenticated: bool,
    },
}

fn message_report(msg: &DecodedMessage) -> MessageReport {
    match &msg.payload {
        UpperPayload::Access { message, opcode } => MessageReport::Access {
            key: message.class.as_str().to_string(),
            key_index: message.key_index,
            label: message.label.map(hex::encode),
            opcode: opcode.map(|o| o.to_string()),
            payload: hex::encode(&message.payload),
            reassembled: msg.reassembled,
        },
        UpperPayload::Control { opcode, parameters } => MessageReport::Control {
            opcode: *opcode,
            parameters: hex::encode(parameters),
            reassembled: msg.reassembled,
        },
        UpperPayload::SegmentAck(ack) => MessageReport::SegmentAck {
            obo: ack.obo,
            seq_zero: ack.seq_zero,
            acked: ack.acked_segments(),
        },
    }
}

impl DecodedPacket {
    fn empty(raw: &[u8], bearer: Bearer, source: &str, status: DecodeStatus) -> Self {
        DecodedPacket {
            received_at: Utc::now(),
            source: source.to_string(),
            bearer,
            status,
            raw: hex::encode(raw),
            network: None,
            message: None,
            beacon: None,
            error: None,
        }
    }

    pub fn from_outcome(outcome: &Outcome, raw: &[u8], bearer: Bearer, source: &str) -> Self {
        let status = match outcome {
            Outcome::Decrypted(_) => DecodeStatus::Decrypted,
            Outcome::NoKeyMatch { .. } => DecodeStatus::NoKeyMatch,
            Outcome::ReassemblyIncomplete { .. } => DecodeStatus::ReassemblyIncomplete,
            Outcome::Malformed { .. } => DecodeStatus::Malformed,
            Outcome::Undecodable { .. } => DecodeStatus::Undecodable,
        };

        let mut report = Self::empty(raw, bearer, source, status);
        report.network = outcome.network().map(NetworkReport::from);
        report.error = outcome.error().map(|e| e.to_string());
        report.message = match outcome {
            Outcome::Decrypted(msg) => Some(message_report(msg)),
            Outcome::NoKeyMatch {
                upper_pdu,
                reassembled,
                ..
            } => Some(MessageReport::Encrypted {
                upper_pdu: hex::encode(upper_pdu),
                reassembled: *reassembled,
            }),
            _ => None,
        };
        report
    }

    pub fn from_beacon(beacon: &Beacon, keys: &KeyStore, raw: &[u8], bearer: Bearer, source: &str) -> Self {
        let mut report = Self::empty(raw, bearer, source, DecodeStatus::Beacon);
        report.beacon = Some(match beacon {
            Beacon::Unprovisioned {
                uuid,
                oob_info,
                uri_hash,
            } => BeaconReport::Unprovisioned {
                uuid: hex::encode(uuid),
                oob_info: *oob_info,
                uri_hash: uri_hash.map(|h| format!("{:08x}", h)),
            },
            Beacon::SecureNetwork(secure) => BeaconReport::SecureNetwork {
                network_id: hex::encode(secure.network_id),
                iv_index: secure.iv_index,
                key_refresh: secure.key_refresh,
                iv_update: secure.iv_update,
                authenticated: secure.authenticate(keys).is_some(),
            },
        });
        report
    }

    pub fn undecodable(raw: &[u8], bearer: Bearer, source: &str, error: impl fmt::Display) -> Self {
        let mut report = Self::empty(raw, bearer, source, DecodeStatus::Undecodable);
        report.error = Some(error.to_string());
        report
    }
}

impl fmt::Display for DecodedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.source, self.status)?;
        if let Some(n) = &self.network {
            write!(
                f,
                " NID=0x{:02x} {} -> {} SEQ=0x{:06x} TTL={}",
                n.nid, n.src, n.dst, n.seq, n.ttl
            )?;
        }
        match &self.message {
            Some(MessageReport::Access {
                key,
                opcode,
                payload,
                reassembled,
                ..
            }) => {
                write!(f, " {} key", key)?;
                if let Some(op) = opcode {
                    write!(f, " opcode={}", op)?;
                }
                write!(f, " payload={}", payload)?;
                if *reassembled {
                    write!(f, " (reassembled)")?;
                }
            }
            Some(MessageReport::Control {
                opcode, parameters, ..
            }) => write!(f, " control opcode=0x{:02x} params={}", opcode, parameters)?,
            Some(MessageReport::SegmentAck { seq_zero, acked, .. }) => {
                write!(f, " segment ack SeqZero={} acked={:?}", seq_zero, acked)?
            }
            Some(MessageReport::Encrypted { upper_pdu, .. }) => write!(f, " encrypted={}", upper_pdu)?,
            None => {}
        }
        match &self.beacon {
            Some(BeaconReport::SecureNetwork {
                network_id,
                iv_index,
                authenticated,
                ..
            }) => write!(
                f,
                " secure beacon network={} IV=0x{:08x} authenticated={}",
                network_id, iv_index, authenticated
            )?,
            Some(BeaconReport::Unprovisioned { uuid, .. }) => write!(f, " unprovisioned device {}", uuid)?,
            None => {}
        }
        if let Some(e) = &self.error {
            write!(f, " ({})", e)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::beacon;
    use crate::mesh::pipeline::Decoder;

    fn sample_keys() -> KeyStore {
        let mut keys = KeyStore::new();
        let key = hex::decode("7dd7364cd842ad18c17c2b820c84c3d6").unwrap();
        keys.add_network(key.try_into().unwrap(), 0x12345678);
        keys
    }

    #[test]
    fn test_control_message_report_json() {
        let raw = hex::decode("68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df").unwrap();
        let mut decoder = Decoder::new(sample_keys());
        let outcome = decoder.decode(&raw, Bearer::Advertising);
        let report = DecodedPacket::from_outcome(&outcome, &raw, Bearer::Advertising, "test");

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "decrypted");
        assert_eq!(json["bearer"], "advertising");
        assert_eq!(json["network"]["src"], "0x1201");
        assert_eq!(json["network"]["dst-type"], "group");
        assert_eq!(json["message"]["type"], "control");
        assert_eq!(json["message"]["parameters"], "4b50057e400000010000");
        assert!(json["received-at"].is_string());

        let line = report.to_string();
        assert!(line.starts_with("[test] decrypted NID=0x68 0x1201 -> 0xfffd"));
    }

    #[test]
    fn test_undecodable_report() {
        let mut decoder = Decoder::new(KeyStore::new());
        let raw = [0x68u8; 20];
        let outcome = decoder.decode(&raw, Bearer::Proxy);
        let report = DecodedPacket::from_outcome(&outcome, &raw, Bearer::Proxy, "test");
        assert_eq!(report.status, DecodeStatus::Undecodable);
        assert!(report.network.is_none());
        assert!(report.error.unwrap().contains("NID 0x68"));
    }

    #[test]
    fn test_malformed_report_keeps_network() {
        use crate::mesh::encoder::NetworkPduBuilder;

        let keys = sample_keys();
        // Segment acknowledgment opcode with truncated parameters
        let raw = NetworkPduBuilder {
            ctl: true,
            ttl: 1,
            seq: 0x000010,
            src: 0x1201,
            dst: 0x0003,
        }
        .build(&keys.networks[0], Bearer::Advertising, &[0x00, 0x01])
        .unwrap();

        let mut decoder = Decoder::new(keys);
        let outcome = decoder.decode(&raw, Bearer::Advertising);
        let report = DecodedPacket::from_outcome(&outcome, &raw, Bearer::Advertising, "test");

        assert_eq!(report.status, DecodeStatus::Malformed);
        assert_eq!(report.network.as_ref().map(|n| n.src.as_str()), Some("0x1201"));
        assert!(report.message.is_none());
        assert!(report.error.is_some());
        assert!(report.to_string().starts_with("[test] malformed NID=0x68 0x1201 -> 0x0003"));
    }

    #[test]
    fn test_beacon_report() {
        let raw = hex::decode("01003ecaff672f673370123456788ea261582f364f6f").unwrap();
        let parsed = beacon::parse(&raw).unwrap();
        let report = DecodedPacket::from_beacon(&parsed, &sample_keys(), &raw, Bearer::Proxy, "test");

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "beacon");
        assert_eq!(json["beacon"]["type"], "secure-network");
        assert_eq!(json["beacon"]["network-id"], "3ecaff672f673370");
        assert_eq!(json["beacon"]["authenticated"], true);
    }
}
