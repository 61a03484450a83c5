//! Upper transport decryption
//!
//! Access messages are secured end to end with either the destination or
//! source node's device key (AKF=0) or an application key (AKF=1). The nonce
//! binds the message to its sender, destination and SeqAuth:
//!   type(1) | ASZMIC(1b) pad(7b) | SeqAuth(3) | SRC(2) | DST(2) | IVIndex(4)
//! Messages to a virtual address also authenticate the full Label UUID as
//! additional data.

use tracing::{debug, trace};

use super::crypto::{self, Key128, Nonce};
use super::keys::{CandidateKey, KeyClass, KeyStore, NetKeyIvIndex, TransportCandidate};
use super::NonceType;
use crate::error::DecodeError;

/// Everything from the network and lower transport layers needed to decrypt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpperTransportContext {
    pub class: KeyClass,
    /// Only meaningful for application keys
    pub aid: u8,
    /// 64-bit TransMIC (segmented messages only)
    pub szmic: bool,
    /// SeqAuth for segmented messages, SEQ otherwise
    pub seq: u32,
    pub src: u16,
    pub dst: u16,
    pub iv_index: u32,
    pub net_key_iv_index: NetKeyIvIndex,
}

impl UpperTransportContext {
    pub fn trans_mic_len(&self) -> usize {
        if self.szmic {
            8
        } else {
            4
        }
    }
}

/// A decrypted access payload and the key that opened it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedAccess {
    pub payload: Vec<u8>,
    pub class: KeyClass,
    /// Index into the key store's device or application list
    pub key_index: usize,
    /// Label UUID used as additional data, for virtual destinations
    pub label: Option<Key128>,
}

pub fn transport_nonce(class: KeyClass, szmic: bool, seq: u32, src: u16, dst: u16, iv_index: u32) -> Nonce {
    let mut nonce = [0u8; 13];
    nonce[0] = match class {
        KeyClass::Application => NonceType::Application as u8,
        KeyClass::Device => NonceType::Device as u8,
    };
    nonce[1] = (szmic as u8) << 7;
    nonce[2..5].copy_from_slice(&seq.to_be_bytes()[1..]);
    nonce[5..7].copy_from_slice(&src.to_be_bytes());
    nonce[7..9].copy_from_slice(&dst.to_be_bytes());
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
    nonce
}

impl CandidateKey for TransportCandidate<'_> {
    type Context = UpperTransportContext;
    type Plaintext = Vec<u8>;

    fn try_decrypt(&self, upper_pdu: &[u8], ctx: &UpperTransportContext) -> Option<Vec<u8>> {
        let mic_len = ctx.trans_mic_len();
        if upper_pdu.len() <= mic_len {
            return None;
        }
        let (ciphertext, mic) = upper_pdu.split_at(upper_pdu.len() - mic_len);
        let nonce = transport_nonce(self.class, ctx.szmic, ctx.seq, ctx.src, ctx.dst, ctx.iv_index);
        let aad: &[u8] = match self.label {
            Some(label) => label.label(),
            None => &[],
        };
        crypto::ccm_decrypt(self.key, &nonce, aad, ciphertext, mic)
    }
}

/// Try each candidate in turn; the first whose TransMIC verifies wins.
pub fn decrypt_with<'a>(
    upper_pdu: &[u8],
    ctx: &UpperTransportContext,
    candidates: impl IntoIterator<Item = TransportCandidate<'a>>,
) -> Result<DecryptedAccess, DecodeError> {
    let mic_len = ctx.trans_mic_len();
    if upper_pdu.len() <= mic_len {
        return Err(DecodeError::Malformed {
            what: "upper transport PDU",
            len: upper_pdu.len(),
            min: mic_len + 1,
        });
    }

    for candidate in candidates {
        if let Some(payload) = candidate.try_decrypt(upper_pdu, ctx) {
            debug!(
                "Decrypted {} byte access payload from 0x{:04x} with {} key #{}",
                payload.len(),
                ctx.src,
                candidate.class.as_str(),
                candidate.index
            );
            return Ok(DecryptedAccess {
                payload,
                class: candidate.class,
                key_index: candidate.index,
                label: candidate.label.map(|l| *l.label()),
            });
        }
        trace!(
            "TransMIC mismatch for {} key #{}",
            candidate.class.as_str(),
            candidate.index
        );
    }

    Err(DecodeError::TransportDecryptFailed {
        key_class: ctx.class.as_str(),
        src: ctx.src,
        dst: ctx.dst,
        seq_zero: (ctx.seq & 0x1FFF) as u16,
        iv_index: ctx.iv_index,
    })
}

/// Decrypt an upper transport access PDU against the configured keys.
pub fn decrypt(
    upper_pdu: &[u8],
    ctx: &UpperTransportContext,
    keys: &KeyStore,
) -> Result<DecryptedAccess, DecodeError> {
    let candidates = match ctx.class {
        KeyClass::Application => keys.application_candidates(ctx.net_key_iv_index, ctx.aid, ctx.dst),
        KeyClass::Device => keys.device_candidates(ctx.src, ctx.dst),
    };
    decrypt_with(upper_pdu, ctx, candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h16(s: &str) -> Key128 {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    fn store_with_network() -> (KeyStore, NetKeyIvIndex) {
        let mut store = KeyStore::new();
        let net = store.add_network(h16("7dd7364cd842ad18c17c2b820c84c3d6"), 0x12345678);
        let ctx = store.networks[net].net_key_iv_index();
        (store, ctx)
    }

    fn virtual_ctx(net_key_iv_index: NetKeyIvIndex) -> UpperTransportContext {
        UpperTransportContext {
            class: KeyClass::Application,
            aid: 0x26,
            szmic: false,
            seq: 0x07080D,
            src: 0x1234,
            dst: 0xB529,
            iv_index: 0x12345678,
            net_key_iv_index,
        }
    }

    const VIRTUAL_UPPER_PDU: &str = "638394aff7aa9de840041ae4";

    #[test]
    fn test_device_key_sample_message_6() {
        let (mut store, net) = store_with_network();
        store.add_device(h16("9d6dd0e96eb25dc19a40ed9914f8f03f"), 0x1201);

        let ctx = UpperTransportContext {
            class: KeyClass::Device,
            aid: 0,
            szmic: false,
            seq: 0x3129AB,
            src: 0x0003,
            dst: 0x1201,
            iv_index: 0x12345678,
            net_key_iv_index: net,
        };
        let upper = hex::decode("ee9dddfd2169326d23f3afdfcfdc18c52fdef772e0e17308").unwrap();

        let decrypted = decrypt(&upper, &ctx, &store).unwrap();
        assert_eq!(
            hex::encode(&decrypted.payload),
            "0056341263964771734fbd76e3b40519d1d94a48"
        );
        assert_eq!(decrypted.class, KeyClass::Device);
        assert_eq!(decrypted.label, None);
    }

    #[test]
    fn test_application_key_virtual_destination() {
        let (mut store, net) = store_with_network();
        store.add_application(h16("63964771734fbd76e3b40519d1d94a48"), 0);
        store.add_label(h16("0073e7e4d8b9440faf8415df4c56c0e1"));

        let upper = hex::decode(VIRTUAL_UPPER_PDU).unwrap();
        let decrypted = decrypt(&upper, &virtual_ctx(net), &store).unwrap();
        assert_eq!(hex::encode(&decrypted.payload), "d50a0048656c6c6f");
        assert_eq!(decrypted.label, Some(h16("0073e7e4d8b9440faf8415df4c56c0e1")));
    }

    #[test]
    fn test_aid_collision_tries_every_key() {
        let (mut store, net) = store_with_network();
        // Derives the same AID (0x26) as the real key below
        store.add_application(h16("0000000000000000000000000000004a"), 0);
        store.add_application(h16("63964771734fbd76e3b40519d1d94a48"), 0);
        store.add_label(h16("0073e7e4d8b9440faf8415df4c56c0e1"));
        assert_eq!(store.applications[0].aid(), store.applications[1].aid());

        let upper = hex::decode(VIRTUAL_UPPER_PDU).unwrap();
        let decrypted = decrypt(&upper, &virtual_ctx(net), &store).unwrap();
        assert_eq!(decrypted.key_index, 1);
    }

    #[test]
    fn test_unmatched_label_never_tried() {
        let (mut store, net) = store_with_network();
        store.add_application(h16("63964771734fbd76e3b40519d1d94a48"), 0);
        // Hashes to 0x9a54, not the destination 0xb529
        store.add_label(h16("00000000000000000000000000001001"));

        let ctx = virtual_ctx(net);
        let candidates = store.application_candidates(net, ctx.aid, ctx.dst);
        assert!(candidates.is_empty());

        let upper = hex::decode(VIRTUAL_UPPER_PDU).unwrap();
        assert_eq!(
            decrypt(&upper, &ctx, &store),
            Err(DecodeError::TransportDecryptFailed {
                key_class: "application",
                src: 0x1234,
                dst: 0xB529,
                seq_zero: 0x080D,
                iv_index: 0x12345678,
            })
        );
    }

    #[test]
    fn test_application_key_from_other_network_not_tried() {
        let (mut store, net) = store_with_network();
        let other = store.add_network([0x99u8; 16], 0x12345678);
        store.add_application(h16("63964771734fbd76e3b40519d1d94a48"), other);
        store.add_label(h16("0073e7e4d8b9440faf8415df4c56c0e1"));

        let upper = hex::decode(VIRTUAL_UPPER_PDU).unwrap();
        assert!(decrypt(&upper, &virtual_ctx(net), &store).is_err());
    }

    #[test]
    fn test_szmic_selects_64_bit_mic() {
        let key = [0x5Au8; 16];
        let nonce = transport_nonce(KeyClass::Device, true, 0x000100, 0x0001, 0x0002, 0);
        assert_eq!(nonce[0], 0x02);
        assert_eq!(nonce[1], 0x80);

        let upper = crypto::ccm_encrypt(&key, &nonce, &[], b"\x80\x03hello world", 8).unwrap();
        let mut store = KeyStore::new();
        store.add_device(key, 0x0001);

        let ctx = UpperTransportContext {
            class: KeyClass::Device,
            aid: 0,
            szmic: true,
            seq: 0x000100,
            src: 0x0001,
            dst: 0x0002,
            iv_index: 0,
            net_key_iv_index: NetKeyIvIndex {
                net_key: [0u8; 16],
                iv_index: 0,
            },
        };
        assert_eq!(decrypt(&upper, &ctx, &store).unwrap().payload, b"\x80\x03hello world");

        let short = UpperTransportContext { szmic: false, ..ctx };
        assert!(decrypt(&upper, &short, &store).is_err());
    }

    #[test]
    fn test_too_short_for_mic() {
        let (store, net) = store_with_network();
        let result = decrypt(&[0x01, 0x02, 0x03, 0x04], &virtual_ctx(net), &store);
        assert!(matches!(result, Err(DecodeError::Malformed { min: 5, .. })));
    }
}
