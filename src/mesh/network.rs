//! Network layer: header deobfuscation and NetMIC verification
//!
//! Network PDU layout:
//!   IVI(1b)|NID(7b) | obfuscated CTL(1b)|TTL(7b) SEQ(3) SRC(2) | encrypted DST(2) TransportPDU | NetMIC(4 or 8)
//!
//! The header is obfuscated with PECB = AES(PrivacyKey, 0x0000000000 || IVIndex || PrivacyRandom),
//! where PrivacyRandom is the first 7 bytes of the encrypted part. DST and the
//! transport PDU are AES-CCM encrypted with EncryptionKey.

use bytes::Buf;
use tracing::{debug, trace};

use super::crypto::{self, Key128, Nonce};
use super::keys::{CandidateKey, KeyStore, NetKeyIvIndex, NetworkKeyRecord};
use super::{Bearer, NonceType};
use crate::error::DecodeError;

/// IVI/NID(1) + header(6) + DST(2) + transport(1) + NetMIC(8 for control)
pub const MIN_NETWORK_PDU_LEN: usize = 18;

/// Deobfuscated network header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkHeader {
    pub ivi: u8,
    pub nid: u8,
    pub ctl: bool,
    pub ttl: u8,
    pub seq: u32,
    pub src: u16,
    pub dst: u16,
}

impl NetworkHeader {
    pub fn net_mic_len(&self) -> usize {
        net_mic_len(self.ctl)
    }
}

pub fn net_mic_len(ctl: bool) -> usize {
    if ctl {
        8
    } else {
        4
    }
}

/// An authenticated network PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPdu {
    pub header: NetworkHeader,
    /// Lower transport PDU (decrypted payload after DST)
    pub transport_pdu: Vec<u8>,
    /// IV index the packet was decrypted with
    pub iv_index: u32,
    /// Network context of the key that authenticated it
    pub net_key_iv_index: NetKeyIvIndex,
}

/// IV index matching the packet's IVI bit: the configured one, or the
/// previous one while an IV update is in progress.
pub fn effective_iv_index(configured: u32, ivi: u8) -> u32 {
    if configured & 1 == (ivi & 1) as u32 {
        configured
    } else {
        configured.wrapping_sub(1)
    }
}

pub fn network_nonce(bearer: Bearer, ctl: bool, ttl: u8, seq: u32, src: u16, iv_index: u32) -> Nonce {
    let mut nonce = [0u8; 13];
    match bearer {
        Bearer::Advertising => {
            nonce[0] = NonceType::Network as u8;
            nonce[1] = ((ctl as u8) << 7) | (ttl & 0x7F);
        }
        Bearer::Proxy => {
            nonce[0] = NonceType::Proxy as u8;
        }
    }
    nonce[2..5].copy_from_slice(&seq.to_be_bytes()[1..]);
    nonce[5..7].copy_from_slice(&src.to_be_bytes());
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
    nonce
}

/// PECB: the keystream that (de)obfuscates header bytes 1..7
pub fn privacy_block(privacy_key: &Key128, iv_index: u32, privacy_random: &[u8]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[5..9].copy_from_slice(&iv_index.to_be_bytes());
    block[9..16].copy_from_slice(&privacy_random[..7]);
    crypto::aes_ecb(privacy_key, &block)
}

impl CandidateKey for NetworkKeyRecord {
    type Context = Bearer;
    type Plaintext = NetworkPdu;

    fn try_decrypt(&self, packet: &[u8], bearer: &Bearer) -> Option<NetworkPdu> {
        if packet.len() < MIN_NETWORK_PDU_LEN {
            return None;
        }

        let ivi = packet[0] >> 7;
        let nid = packet[0] & 0x7F;
        let iv_index = effective_iv_index(self.iv_index(), ivi);

        let pecb = privacy_block(self.privacy_key(), iv_index, &packet[7..14]);
        let mut clear = [0u8; 6];
        for (i, byte) in clear.iter_mut().enumerate() {
            *byte = packet[1 + i] ^ pecb[i];
        }

        let mut buf = &clear[..];
        let ctl_ttl = buf.get_u8();
        let ctl = ctl_ttl & 0x80 != 0;
        let ttl = ctl_ttl & 0x7F;
        let seq = buf.get_uint(3) as u32;
        let src = buf.get_u16();

        let mic_start = packet.len() - net_mic_len(ctl);
        let nonce = network_nonce(*bearer, ctl, ttl, seq, src, iv_index);
        let plaintext = crypto::ccm_decrypt(
            self.encryption_key(),
            &nonce,
            &[],
            &packet[7..mic_start],
            &packet[mic_start..],
        )?;

        let dst = u16::from_be_bytes([plaintext[0], plaintext[1]]);
        Some(NetworkPdu {
            header: NetworkHeader {
                ivi,
                nid,
                ctl,
                ttl,
                seq,
                src,
                dst,
            },
            transport_pdu: plaintext[2..].to_vec(),
            iv_index,
            net_key_iv_index: self.net_key_iv_index(),
        })
    }
}

/// Decrypt a network PDU with the first network key that authenticates it.
///
/// Records whose own IV index matches the IVI bit are tried before those
/// that only reach it as the previous IV index. The same NetKey configured
/// for two IV indexes authenticates under both, and the packet belongs to
/// the record it was actually sent with.
pub fn decrypt(packet: &[u8], keys: &KeyStore, bearer: Bearer) -> Result<NetworkPdu, DecodeError> {
    if packet.len() < MIN_NETWORK_PDU_LEN {
        return Err(DecodeError::Malformed {
            what: "network PDU",
            len: packet.len(),
            min: MIN_NETWORK_PDU_LEN,
        });
    }

    let nid = packet[0] & 0x7F;
    let ivi = packet[0] >> 7;

    let mut candidates: Vec<&NetworkKeyRecord> = keys.network_candidates(nid).collect();
    candidates.sort_by_key(|record| effective_iv_index(record.iv_index(), ivi) != record.iv_index());

    for record in candidates {
        match record.try_decrypt(packet, &bearer) {
            Some(pdu) => {
                debug!(
                    "Network PDU authenticated: NID=0x{:02x} SRC=0x{:04x} DST=0x{:04x} SEQ=0x{:06x}",
                    nid, pdu.header.src, pdu.header.dst, pdu.header.seq
                );
                return Ok(pdu);
            }
            None => {
                trace!("NetMIC mismatch for NID 0x{:02x} candidate", nid);
            }
        }
    }

    Err(DecodeError::NetworkDecryptFailed { nid, ivi })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> KeyStore {
        let mut store = KeyStore::new();
        let key: Key128 = hex::decode("7dd7364cd842ad18c17c2b820c84c3d6")
            .unwrap()
            .try_into()
            .unwrap();
        store.add_network(key, 0x12345678);
        store
    }

    #[test]
    fn test_network_nonce_sample_data() {
        let nonce = network_nonce(Bearer::Advertising, true, 0, 1, 0x1201, 0x12345678);
        assert_eq!(hex::encode(nonce), "00800000011201000012345678");

        let proxy = network_nonce(Bearer::Proxy, true, 0, 1, 0x1201, 0x12345678);
        assert_eq!(hex::encode(proxy), "03000000011201000012345678");
    }

    #[test]
    fn test_decrypt_sample_message_1() {
        let packet = hex::decode("68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df").unwrap();
        let pdu = decrypt(&packet, &sample_store(), Bearer::Advertising).unwrap();

        assert_eq!(pdu.header.nid, 0x68);
        assert_eq!(pdu.header.ivi, 0);
        assert!(pdu.header.ctl);
        assert_eq!(pdu.header.ttl, 0);
        assert_eq!(pdu.header.seq, 1);
        assert_eq!(pdu.header.src, 0x1201);
        assert_eq!(pdu.header.dst, 0xFFFD);
        assert_eq!(hex::encode(&pdu.transport_pdu), "034b50057e400000010000");
        assert_eq!(pdu.iv_index, 0x12345678);
    }

    #[test]
    fn test_decrypt_sample_message_6_segment() {
        let packet = hex::decode("68cab5c5348a230afba8c63d4e686364979deaf4fd40961145939cda0e").unwrap();
        let pdu = decrypt(&packet, &sample_store(), Bearer::Advertising).unwrap();

        assert!(!pdu.header.ctl);
        assert_eq!(pdu.header.ttl, 4);
        assert_eq!(pdu.header.seq, 0x3129AB);
        assert_eq!(pdu.header.src, 0x0003);
        assert_eq!(pdu.header.dst, 0x1201);
        assert_eq!(hex::encode(&pdu.transport_pdu), "8026ac01ee9dddfd2169326d23f3afdf");
    }

    #[test]
    fn test_no_matching_key() {
        let packet = hex::decode("68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df").unwrap();
        let mut store = KeyStore::new();
        store.add_network([0x55u8; 16], 0x12345678);

        assert_eq!(
            decrypt(&packet, &store, Bearer::Advertising),
            Err(DecodeError::NetworkDecryptFailed { nid: 0x68, ivi: 0 })
        );
    }

    #[test]
    fn test_wrong_bearer_fails_authentication() {
        let packet = hex::decode("68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df").unwrap();
        assert!(decrypt(&packet, &sample_store(), Bearer::Proxy).is_err());
    }

    #[test]
    fn test_short_packet_is_malformed() {
        let result = decrypt(&[0x68; 17], &sample_store(), Bearer::Advertising);
        assert!(matches!(result, Err(DecodeError::Malformed { len: 17, .. })));
    }

    #[test]
    fn test_record_for_packet_iv_index_preferred() {
        // Message #1 has IVI 0 and was sent with IV index 0x12345678; the
        // 0x12345679 record also authenticates it as the previous IV index
        let packet = hex::decode("68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df").unwrap();
        let key: Key128 = hex::decode("7dd7364cd842ad18c17c2b820c84c3d6")
            .unwrap()
            .try_into()
            .unwrap();

        for iv_indexes in [[0x12345678, 0x12345679], [0x12345679, 0x12345678]] {
            let mut store = KeyStore::new();
            for iv_index in iv_indexes {
                store.add_network(key, iv_index);
            }
            assert_eq!(store.networks.len(), 2);

            let pdu = decrypt(&packet, &store, Bearer::Advertising).unwrap();
            assert_eq!(pdu.iv_index, 0x12345678);
            assert_eq!(pdu.net_key_iv_index.iv_index, 0x12345678);
        }

        // Alone, the newer record still accepts it
        let mut updated = KeyStore::new();
        updated.add_network(key, 0x12345679);
        let pdu = decrypt(&packet, &updated, Bearer::Advertising).unwrap();
        assert_eq!(pdu.iv_index, 0x12345678);
        assert_eq!(pdu.net_key_iv_index.iv_index, 0x12345679);
    }

    #[test]
    fn test_effective_iv_index() {
        assert_eq!(effective_iv_index(0x12345678, 0), 0x12345678);
        assert_eq!(effective_iv_index(0x12345679, 0), 0x12345678);
        assert_eq!(effective_iv_index(0x12345679, 1), 0x12345679);
        assert_eq!(effective_iv_index(0x12345678, 1), 0x12345677);
    }
}
