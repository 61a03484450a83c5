//! Per-packet decode pipeline
//!
//! raw bytes -> network layer -> lower transport -> (reassembly) -> upper transport -> access
//!
//! Every packet ends in exactly one [`Outcome`]; nothing here is fatal.

use tracing::{debug, trace, warn};

use super::access::{self, Opcode};
use super::keys::{KeyClass, KeyStore};
use super::lower::{self, LowerTransportPdu, SegmentAck, SegmentHeader, SEGMENT_ACK_OPCODE};
use super::network::{self, NetworkPdu};
use super::reassembly::{Fragment, PduKind, ReassemblyStatus, Reassembler, SessionKey};
use super::transport::{self, DecryptedAccess, UpperTransportContext};
use super::Bearer;
use crate::error::DecodeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpperPayload {
    Access {
        message: DecryptedAccess,
        /// None when the payload does not start with a valid opcode
        opcode: Option<Opcode>,
    },
    Control {
        opcode: u8,
        parameters: Vec<u8>,
    },
    SegmentAck(SegmentAck),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub network: NetworkPdu,
    pub payload: UpperPayload,
    /// Payload was put together from several segments
    pub reassembled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Decrypted(DecodedMessage),
    /// Network layer authenticated, but no device/application key opened the payload
    NoKeyMatch {
        network: NetworkPdu,
        upper_pdu: Vec<u8>,
        reassembled: bool,
        error: DecodeError,
    },
    /// Segment stored; the rest of the message has not been seen yet
    ReassemblyIncomplete {
        network: NetworkPdu,
        error: DecodeError,
    },
    /// Network layer authenticated, but the transport PDU it carries is invalid
    Malformed {
        network: NetworkPdu,
        error: DecodeError,
    },
    Undecodable {
        raw: Vec<u8>,
        error: DecodeError,
    },
}

impl Outcome {
    pub fn network(&self) -> Option<&NetworkPdu> {
        match self {
            Outcome::Decrypted(msg) => Some(&msg.network),
            Outcome::NoKeyMatch { network, .. }
            | Outcome::ReassemblyIncomplete { network, .. }
            | Outcome::Malformed { network, .. } => Some(network),
            Outcome::Undecodable { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&DecodeError> {
        match self {
            Outcome::Decrypted(_) => None,
            Outcome::NoKeyMatch { error, .. }
            | Outcome::ReassemblyIncomplete { error, .. }
            | Outcome::Malformed { error, .. }
            | Outcome::Undecodable { error, .. } => Some(error),
        }
    }
}

fn access_payload(message: DecryptedAccess) -> UpperPayload {
    let opcode = match access::split_opcode(&message.payload) {
        Ok((opcode, _)) => Some(opcode),
        Err(e) => {
            debug!("Access payload without opcode: {}", e);
            None
        }
    };
    UpperPayload::Access { message, opcode }
}

fn control_payload(opcode: u8, parameters: Vec<u8>) -> Result<UpperPayload, DecodeError> {
    if opcode == SEGMENT_ACK_OPCODE {
        return SegmentAck::parse(&parameters).map(UpperPayload::SegmentAck);
    }
    Ok(UpperPayload::Control { opcode, parameters })
}

fn malformed(network: NetworkPdu, error: DecodeError) -> Outcome {
    debug!("Invalid transport PDU from 0x{:04x}: {}", network.header.src, error);
    Outcome::Malformed { network, error }
}

fn access_outcome(
    network: NetworkPdu,
    result: Result<DecryptedAccess, DecodeError>,
    upper_pdu: Vec<u8>,
    reassembled: bool,
) -> Outcome {
    match result {
        Ok(message) => Outcome::Decrypted(DecodedMessage {
            network,
            payload: access_payload(message),
            reassembled,
        }),
        Err(error @ DecodeError::Malformed { .. }) => malformed(network, error),
        Err(error) => Outcome::NoKeyMatch {
            network,
            upper_pdu,
            reassembled,
            error,
        },
    }
}

fn session_key(pdu: &NetworkPdu, segment: &SegmentHeader) -> SessionKey {
    SessionKey {
        src: pdu.header.src,
        seq_auth: lower::seq_auth(pdu.header.seq, segment.seq_zero),
        iv_index: pdu.iv_index,
        net_key_iv_index: pdu.net_key_iv_index,
    }
}

fn incomplete(network: NetworkPdu, key: &SessionKey, received: u32) -> Outcome {
    let error = DecodeError::ReassemblyIncomplete {
        src: key.src,
        seq_zero: key.seq_zero(),
        iv_index: key.iv_index,
        segments: received.count_ones(),
    };
    trace!("{}", error);
    Outcome::ReassemblyIncomplete { network, error }
}

/// Decode one packet, updating reassembly state.
///
/// Delivering the same packets again leaves the state unchanged and reproduces
/// the completed results. A reassembled message that decrypted is not
/// decrypted again; one that no key opened is retried on every delivery.
pub fn decode_packet(packet: &[u8], bearer: Bearer, keys: &KeyStore, reassembler: &mut Reassembler) -> Outcome {
    let network = match network::decrypt(packet, keys, bearer) {
        Ok(pdu) => pdu,
        Err(error) => {
            trace!("Undecodable packet: {}", error);
            return Outcome::Undecodable {
                raw: packet.to_vec(),
                error,
            };
        }
    };

    let lower = match lower::parse(network.header.ctl, &network.transport_pdu) {
        Ok(lower) => lower,
        Err(error) => return malformed(network, error),
    };

    match lower {
        LowerTransportPdu::UnsegmentedControl { opcode, parameters } => match control_payload(opcode, parameters) {
            Ok(payload) => Outcome::Decrypted(DecodedMessage {
                network,
                payload,
                reassembled: false,
            }),
            Err(error) => malformed(network, error),
        },

        LowerTransportPdu::SegmentedControl { opcode, segment, data } => {
            let key = session_key(&network, &segment);
            let fragment = Fragment {
                kind: PduKind::Control,
                seg_o: segment.seg_o,
                seg_n: segment.seg_n,
                data: &data,
            };
            match reassembler.push(key, fragment) {
                Ok(ReassemblyStatus::Complete(parameters)) => match control_payload(opcode, parameters) {
                    Ok(payload) => Outcome::Decrypted(DecodedMessage {
                        network,
                        payload,
                        reassembled: true,
                    }),
                    Err(error) => malformed(network, error),
                },
                Ok(ReassemblyStatus::Incomplete { received, .. }) => incomplete(network, &key, received),
                Err(error) => malformed(network, error),
            }
        }

        LowerTransportPdu::UnsegmentedAccess { akf, aid, upper_pdu } => {
            let ctx = UpperTransportContext {
                class: if akf { KeyClass::Application } else { KeyClass::Device },
                aid,
                szmic: false,
                seq: network.header.seq,
                src: network.header.src,
                dst: network.header.dst,
                iv_index: network.iv_index,
                net_key_iv_index: network.net_key_iv_index,
            };
            let result = transport::decrypt(&upper_pdu, &ctx, keys);
            access_outcome(network, result, upper_pdu, false)
        }

        LowerTransportPdu::SegmentedAccess {
            akf,
            aid,
            szmic,
            segment,
            data,
        } => {
            let key = session_key(&network, &segment);
            let fragment = Fragment {
                kind: PduKind::Access,
                seg_o: segment.seg_o,
                seg_n: segment.seg_n,
                data: &data,
            };
            let upper_pdu = match reassembler.push(key, fragment) {
                Ok(ReassemblyStatus::Complete(upper_pdu)) => upper_pdu,
                Ok(ReassemblyStatus::Incomplete { received, .. }) => return incomplete(network, &key, received),
                Err(error) => {
                    warn!("Dropping segment from 0x{:04x}: {}", network.header.src, error);
                    return malformed(network, error);
                }
            };

            let result = match reassembler.cached_outcome(&key) {
                Some(cached) => {
                    trace!("Reusing upper transport result for SeqZero {}", key.seq_zero());
                    Ok(cached.clone())
                }
                None => {
                    let ctx = UpperTransportContext {
                        class: if akf { KeyClass::Application } else { KeyClass::Device },
                        aid,
                        szmic,
                        seq: key.seq_auth,
                        src: network.header.src,
                        dst: network.header.dst,
                        iv_index: network.iv_index,
                        net_key_iv_index: network.net_key_iv_index,
                    };
                    let result = transport::decrypt(&upper_pdu, &ctx, keys);
                    if let Ok(message) = &result {
                        reassembler.cache_outcome(&key, message.clone());
                    }
                    result
                }
            };

            access_outcome(network, result, upper_pdu, true)
        }
    }
}

/// Decode a proxy configuration message: a network PDU secured with the
/// proxy nonce whose payload is `Opcode(1) | parameters`, with no lower
/// transport header.
pub fn decode_proxy_configuration(packet: &[u8], keys: &KeyStore) -> Outcome {
    let network = match network::decrypt(packet, keys, Bearer::Proxy) {
        Ok(pdu) => pdu,
        Err(error) => {
            return Outcome::Undecodable {
                raw: packet.to_vec(),
                error,
            }
        }
    };

    let (opcode, parameters) = match network.transport_pdu.split_first() {
        Some((&opcode, parameters)) => (opcode, parameters.to_vec()),
        None => {
            let error = DecodeError::Malformed {
                what: "proxy configuration message",
                len: 0,
                min: 1,
            };
            return malformed(network, error);
        }
    };

    Outcome::Decrypted(DecodedMessage {
        network,
        payload: UpperPayload::Control { opcode, parameters },
        reassembled: false,
    })
}

/// Key store plus reassembly state: everything needed to decode a capture
#[derive(Debug, Default)]
pub struct Decoder {
    keys: KeyStore,
    reassembler: Reassembler,
}

impl Decoder {
    pub fn new(keys: KeyStore) -> Self {
        Self {
            keys,
            reassembler: Reassembler::new(),
        }
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    /// Swap in a new key store. Segments already received are kept, but every
    /// message is decrypted again with the new keys.
    pub fn reconfigure(&mut self, keys: KeyStore) {
        self.keys = keys;
        self.reassembler.clear_outcomes();
    }

    pub fn decode(&mut self, packet: &[u8], bearer: Bearer) -> Outcome {
        decode_packet(packet, bearer, &self.keys, &mut self.reassembler)
    }

    pub fn decode_proxy_configuration(&self, packet: &[u8]) -> Outcome {
        decode_proxy_configuration(packet, &self.keys)
    }

    /// Segmented messages still missing segments
    pub fn pending(&self) -> Vec<DecodeError> {
        self.reassembler
            .incomplete()
            .map(|(key, segments)| DecodeError::ReassemblyIncomplete {
                src: key.src,
                seq_zero: key.seq_zero(),
                iv_index: key.iv_index,
                segments,
            })
            .collect()
    }
}
