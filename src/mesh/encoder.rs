//! Mesh message encoder for generating traffic
//!
//! Builds obfuscated, encrypted network PDUs from access payloads and control
//! messages, segmenting them the way a sending node would. Used by the
//! simulator and as a source of test traffic for the decoder.
//!
//! Network PDU construction:
//!   1. EncDST || EncTransportPDU || NetMIC = CCM(EncryptionKey, nonce, DST || TransportPDU)
//!   2. PECB = AES(PrivacyKey, 0x0000000000 || IVIndex || EncDST..[0..7])
//!   3. IVI|NID || (CTL|TTL || SEQ || SRC) ^ PECB[0..6] || step 1 output

use anyhow::{anyhow, Result};
use bytes::{BufMut, BytesMut};

use super::crypto::{self, Key128};
use super::keys::{KeyClass, NetworkKeyRecord};
use super::lower::{ACCESS_SEGMENT_SIZE, CONTROL_SEGMENT_SIZE};
use super::network::{net_mic_len, network_nonce, privacy_block};
use super::transport::transport_nonce;
use super::Bearer;

/// Largest upper transport PDU that fits an unsegmented access message
const MAX_UNSEGMENTED_ACCESS: usize = 15;
/// Largest parameter block that fits an unsegmented control message
const MAX_UNSEGMENTED_CONTROL: usize = 11;
const MAX_SEGMENTS: usize = 32;

/// Network header fields for one outgoing PDU
#[derive(Debug, Clone, Copy)]
pub struct NetworkPduBuilder {
    pub ctl: bool,
    pub ttl: u8,
    pub seq: u32,
    pub src: u16,
    pub dst: u16,
}

impl NetworkPduBuilder {
    /// Encrypt and obfuscate `transport_pdu` with `network`'s keys.
    pub fn build(&self, network: &NetworkKeyRecord, bearer: Bearer, transport_pdu: &[u8]) -> Result<Vec<u8>> {
        if transport_pdu.is_empty() {
            return Err(anyhow!("Empty lower transport PDU"));
        }

        let iv_index = network.iv_index();
        let nonce = network_nonce(bearer, self.ctl, self.ttl, self.seq, self.src, iv_index);

        let mut plaintext = BytesMut::with_capacity(2 + transport_pdu.len());
        plaintext.put_u16(self.dst);
        plaintext.put_slice(transport_pdu);
        let encrypted = crypto::ccm_encrypt(
            network.encryption_key(),
            &nonce,
            &[],
            &plaintext,
            net_mic_len(self.ctl),
        )?;

        let pecb = privacy_block(network.privacy_key(), iv_index, &encrypted[..7]);

        let mut header = BytesMut::with_capacity(6);
        header.put_u8(((self.ctl as u8) << 7) | (self.ttl & 0x7F));
        header.put_uint(self.seq as u64 & 0xFF_FFFF, 3);
        header.put_u16(self.src);

        let mut pdu = BytesMut::with_capacity(7 + encrypted.len());
        pdu.put_u8((((iv_index & 1) as u8) << 7) | network.nid());
        for (byte, mask) in header.iter().zip(pecb.iter()) {
            pdu.put_u8(byte ^ mask);
        }
        pdu.put_slice(&encrypted);
        Ok(pdu.to_vec())
    }
}

/// Split `data` into segmented lower transport PDUs.
///
/// `first` is the SEG|AKF|AID or SEG|Opcode byte, `top_bit` is SZMIC (access) or RFU (control).
fn segment(first: u8, top_bit: bool, seq_auth: u32, unit: usize, data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let count = data.len().div_ceil(unit).max(1);
    if count > MAX_SEGMENTS {
        return Err(anyhow!("{} bytes need {} segments (max {})", data.len(), count, MAX_SEGMENTS));
    }

    let seq_zero = seq_auth & 0x1FFF;
    let seg_n = (count - 1) as u32;
    Ok(data
        .chunks(unit)
        .enumerate()
        .map(|(seg_o, chunk)| {
            let fields = ((top_bit as u32) << 23) | (seq_zero << 10) | ((seg_o as u32) << 5) | seg_n;
            let mut pdu = BytesMut::with_capacity(4 + chunk.len());
            pdu.put_u8(0x80 | first);
            pdu.put_uint(fields as u64, 3);
            pdu.put_slice(chunk);
            pdu.to_vec()
        })
        .collect())
}

/// An access message, encrypted with a device or application key
#[derive(Debug, Clone, Copy)]
pub struct AccessMessageBuilder<'a> {
    pub class: KeyClass,
    pub key: &'a Key128,
    /// Label UUID when `dst` is a virtual address
    pub label: Option<&'a Key128>,
    /// Force segmentation even when the message would fit one PDU
    pub segmented: bool,
    /// Use a 64-bit TransMIC (segmented only)
    pub szmic: bool,
    pub ttl: u8,
    pub seq: u32,
    pub src: u16,
    pub dst: u16,
}

impl AccessMessageBuilder<'_> {
    fn aid(&self) -> u8 {
        match self.class {
            KeyClass::Application => crypto::k4(self.key),
            KeyClass::Device => 0,
        }
    }

    /// Upper transport PDU: encrypted payload followed by the TransMIC
    pub fn upper_pdu(&self, iv_index: u32, payload: &[u8]) -> Result<Vec<u8>> {
        let szmic = self.szmic && self.segmented;
        let nonce = transport_nonce(self.class, szmic, self.seq, self.src, self.dst, iv_index);
        let aad: &[u8] = match self.label {
            Some(label) => &label[..],
            None => &[],
        };
        crypto::ccm_encrypt(self.key, &nonce, aad, payload, if szmic { 8 } else { 4 })
    }

    /// Lower transport PDUs, one per segment
    pub fn lower_pdus(&self, iv_index: u32, payload: &[u8]) -> Result<Vec<Vec<u8>>> {
        let upper = self.upper_pdu(iv_index, payload)?;
        let akf = matches!(self.class, KeyClass::Application);
        let first = ((akf as u8) << 6) | self.aid();

        if !self.segmented && upper.len() <= MAX_UNSEGMENTED_ACCESS {
            let mut pdu = Vec::with_capacity(1 + upper.len());
            pdu.push(first);
            pdu.extend_from_slice(&upper);
            return Ok(vec![pdu]);
        }
        if !self.segmented {
            return Err(anyhow!(
                "{} byte upper PDU needs segmentation, which changes its nonce",
                upper.len()
            ));
        }
        segment(first, self.szmic, self.seq, ACCESS_SEGMENT_SIZE, &upper)
    }

    /// Network PDUs ready to transmit. Segment n is sent with SEQ + n.
    pub fn build(&self, network: &NetworkKeyRecord, bearer: Bearer, payload: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.lower_pdus(network.iv_index(), payload)?
            .iter()
            .enumerate()
            .map(|(n, lower)| {
                NetworkPduBuilder {
                    ctl: false,
                    ttl: self.ttl,
                    seq: self.seq + n as u32,
                    src: self.src,
                    dst: self.dst,
                }
                .build(network, bearer, lower)
            })
            .collect()
    }
}

/// A transport control message
#[derive(Debug, Clone, Copy)]
pub struct ControlMessageBuilder {
    pub opcode: u8,
    pub ttl: u8,
    pub seq: u32,
    pub src: u16,
    pub dst: u16,
}

impl ControlMessageBuilder {
    pub fn lower_pdus(&self, parameters: &[u8]) -> Result<Vec<Vec<u8>>> {
        let opcode = self.opcode & 0x7F;
        if parameters.len() <= MAX_UNSEGMENTED_CONTROL {
            let mut pdu = Vec::with_capacity(1 + parameters.len());
            pdu.push(opcode);
            pdu.extend_from_slice(parameters);
            return Ok(vec![pdu]);
        }
        segment(opcode, false, self.seq, CONTROL_SEGMENT_SIZE, parameters)
    }

    pub fn build(&self, network: &NetworkKeyRecord, bearer: Bearer, parameters: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.lower_pdus(parameters)?
            .iter()
            .enumerate()
            .map(|(n, lower)| {
                NetworkPduBuilder {
                    ctl: true,
                    ttl: self.ttl,
                    seq: self.seq + n as u32,
                    src: self.src,
                    dst: self.dst,
                }
                .build(network, bearer, lower)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h16(s: &str) -> Key128 {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    fn sample_network() -> NetworkKeyRecord {
        NetworkKeyRecord::new(h16("7dd7364cd842ad18c17c2b820c84c3d6"), 0x12345678)
    }

    fn hexes(pdus: &[Vec<u8>]) -> Vec<String> {
        pdus.iter().map(hex::encode).collect()
    }

    #[test]
    fn test_network_pdu_sample_message_1() {
        let builder = NetworkPduBuilder {
            ctl: true,
            ttl: 0,
            seq: 1,
            src: 0x1201,
            dst: 0xFFFD,
        };
        let transport = hex::decode("034b50057e400000010000").unwrap();
        let pdu = builder.build(&sample_network(), Bearer::Advertising, &transport).unwrap();
        assert_eq!(
            hex::encode(pdu),
            "68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df"
        );
    }

    #[test]
    fn test_device_key_message_6_segments() {
        let dev_key = h16("9d6dd0e96eb25dc19a40ed9914f8f03f");
        let builder = AccessMessageBuilder {
            class: KeyClass::Device,
            key: &dev_key,
            label: None,
            segmented: true,
            szmic: false,
            ttl: 4,
            seq: 0x3129AB,
            src: 0x0003,
            dst: 0x1201,
        };
        let payload = hex::decode("0056341263964771734fbd76e3b40519d1d94a48").unwrap();

        assert_eq!(
            hex::encode(builder.upper_pdu(0x12345678, &payload).unwrap()),
            "ee9dddfd2169326d23f3afdfcfdc18c52fdef772e0e17308"
        );
        assert_eq!(
            hexes(&builder.lower_pdus(0x12345678, &payload).unwrap()),
            vec!["8026ac01ee9dddfd2169326d23f3afdf", "8026ac21cfdc18c52fdef772e0e17308"]
        );
        assert_eq!(
            hexes(&builder.build(&sample_network(), Bearer::Advertising, &payload).unwrap()),
            vec![
                "68cab5c5348a230afba8c63d4e686364979deaf4fd40961145939cda0e",
                "681615b5dd4a846cae0c032bf0746f44f1b8cc8ce5edc57e55beed49c0",
            ]
        );
    }

    #[test]
    fn test_application_key_virtual_destination() {
        let app_key = h16("63964771734fbd76e3b40519d1d94a48");
        let label = h16("0073e7e4d8b9440faf8415df4c56c0e1");
        let builder = AccessMessageBuilder {
            class: KeyClass::Application,
            key: &app_key,
            label: Some(&label),
            segmented: false,
            szmic: false,
            ttl: 3,
            seq: 0x07080D,
            src: 0x1234,
            dst: 0xB529,
        };
        let payload = hex::decode("d50a0048656c6c6f").unwrap();

        assert_eq!(
            hexes(&builder.lower_pdus(0x12345678, &payload).unwrap()),
            vec!["66638394aff7aa9de840041ae4"]
        );
        assert_eq!(
            hexes(&builder.build(&sample_network(), Bearer::Advertising, &payload).unwrap()),
            vec!["6847d35fbd071945b56bfa0b75472f895903ac52518400b1c7bf"]
        );
    }

    #[test]
    fn test_oversized_unsegmented_access_rejected() {
        let key = [0x11u8; 16];
        let builder = AccessMessageBuilder {
            class: KeyClass::Device,
            key: &key,
            label: None,
            segmented: false,
            szmic: false,
            ttl: 5,
            seq: 1,
            src: 0x0001,
            dst: 0x0002,
        };
        assert!(builder.lower_pdus(0, &[0u8; 11]).is_ok());
        assert!(builder.lower_pdus(0, &[0u8; 12]).is_err());
    }

    #[test]
    fn test_segmented_control_message() {
        let builder = ControlMessageBuilder {
            opcode: 0x0A,
            ttl: 5,
            seq: 0x000100,
            src: 0x1201,
            dst: 0x0003,
        };
        let params = hex::decode("0102030405060708090a0b0c").unwrap();

        assert_eq!(
            hexes(&builder.lower_pdus(&params).unwrap()),
            vec!["8a0400010102030405060708", "8a040021090a0b0c"]
        );
        assert_eq!(
            hexes(&builder.build(&sample_network(), Bearer::Advertising, &params).unwrap()),
            vec![
                "686baefdcf091b52f71a58c6d12f8841efdf532b1dd7a4bff21a113d05",
                "68466b0fb5b5b07916a2bb54737078cfec28014ee9b52a0074",
            ]
        );
    }

    #[test]
    fn test_too_many_segments() {
        assert!(segment(0x00, false, 0, ACCESS_SEGMENT_SIZE, &[0u8; 32 * 12]).is_ok());
        assert!(segment(0x00, false, 0, ACCESS_SEGMENT_SIZE, &[0u8; 32 * 12 + 1]).is_err());
    }
}
