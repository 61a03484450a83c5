//! Mesh security toolbox
//!
//! Every key the decoder uses is derived from a configured 128-bit key with
//! AES-CMAC:
//! - `s1`: salt generation, CMAC keyed with all zeros
//! - `k1`: beacon key derivation
//! - `k2`: NID, EncryptionKey and PrivacyKey from a NetKey
//! - `k3`: 64-bit Network ID from a NetKey
//! - `k4`: 6-bit AID from an AppKey
//!
//! plus the two block cipher modes used on the wire: AES-ECB for header
//! obfuscation and AES-CCM (13-byte nonce, 32- or 64-bit MIC) for payloads.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::AeadInPlace;
use ccm::consts::{U13, U4, U8};
use ccm::Ccm;
use cmac::{Cmac, Mac};

use crate::error::KeyConfigError;

pub type Key128 = [u8; 16];

/// CCM nonce used by all mesh layers
pub type Nonce = [u8; 13];

type AesCcmMic32 = Ccm<Aes128, U4, U13>;
type AesCcmMic64 = Ccm<Aes128, U8, U13>;

/// k2 identity input for master security credentials
pub const MASTER_CREDENTIALS: [u8; 1] = [0x00];

/// Material derived from a NetKey by k2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkMaterial {
    pub nid: u8,
    pub encryption_key: Key128,
    pub privacy_key: Key128,
}

/// AES-CMAC over the concatenation of `parts`.
pub fn aes_cmac(key: &Key128, parts: &[&[u8]]) -> Key128 {
    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key));
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// s1 salt generation function
pub fn s1(message: &[u8]) -> Key128 {
    aes_cmac(&[0u8; 16], &[message])
}

pub fn k1(n: &[u8], salt: &Key128, p: &[u8]) -> Key128 {
    let t = aes_cmac(salt, &[n]);
    aes_cmac(&t, &[p])
}

pub fn k2(n: &Key128, p: &[u8]) -> NetworkMaterial {
    let t = aes_cmac(&s1(b"smk2"), &[n]);
    let t1 = aes_cmac(&t, &[p, &[0x01]]);
    let t2 = aes_cmac(&t, &[&t1, p, &[0x02]]);
    let t3 = aes_cmac(&t, &[&t2, p, &[0x03]]);

    NetworkMaterial {
        nid: t1[15] & 0x7F,
        encryption_key: t2,
        privacy_key: t3,
    }
}

pub fn k3(n: &Key128) -> [u8; 8] {
    let t = aes_cmac(&s1(b"smk3"), &[n]);
    let out = aes_cmac(&t, &[b"id64", &[0x01]]);
    let mut network_id = [0u8; 8];
    network_id.copy_from_slice(&out[8..]);
    network_id
}

pub fn k4(n: &Key128) -> u8 {
    let t = aes_cmac(&s1(b"smk4"), &[n]);
    aes_cmac(&t, &[b"id6", &[0x01]])[15] & 0x3F
}

/// Beacon key used to authenticate secure network beacons
pub fn beacon_key(net_key: &Key128) -> Key128 {
    k1(net_key, &s1(b"nkbk"), b"id128\x01")
}

/// Derive NID, EncryptionKey and PrivacyKey from a raw network key.
pub fn derive_network_material(raw: &[u8]) -> Result<NetworkMaterial, KeyConfigError> {
    let key = key128("network key", raw)?;
    Ok(k2(&key, &MASTER_CREDENTIALS))
}

/// Derive the AID of a raw application key.
pub fn derive_application_material(raw: &[u8]) -> Result<u8, KeyConfigError> {
    let key = key128("application key", raw)?;
    Ok(k4(&key))
}

/// Derive the virtual address a Label UUID hashes to.
///
/// The top bit is always set, which keeps virtual addresses clear of the
/// unicast and group ranges.
pub fn derive_label_hash(raw: &[u8]) -> Result<u16, KeyConfigError> {
    let label = key128("label UUID", raw)?;
    Ok(virtual_address(&label))
}

pub fn virtual_address(label: &Key128) -> u16 {
    let hash = aes_cmac(&s1(b"vtad"), &[label]);
    hash[15] as u16 | (((hash[14] & 0x3F) as u16) << 8) | 0x8000
}

fn key128(field: &'static str, raw: &[u8]) -> Result<Key128, KeyConfigError> {
    raw.try_into().map_err(|_| KeyConfigError::WrongLength {
        field,
        expected: 16,
        actual: raw.len(),
    })
}

/// Encrypt a single block with AES-128 (ECB, no chaining).
pub fn aes_ecb(key: &Key128, block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut block = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// AES-CCM decrypt and verify. `mic` must be 4 or 8 bytes.
///
/// Returns `None` on tag mismatch; a wrong key is the common case during
/// trial decryption and is not an error.
pub fn ccm_decrypt(key: &Key128, nonce: &Nonce, aad: &[u8], ciphertext: &[u8], mic: &[u8]) -> Option<Vec<u8>> {
    let nonce = GenericArray::from_slice(nonce);
    let key = GenericArray::from_slice(key);
    let mut buffer = ciphertext.to_vec();

    let verified = match mic.len() {
        4 => AesCcmMic32::new(key)
            .decrypt_in_place_detached(nonce, aad, &mut buffer, GenericArray::from_slice(mic))
            .is_ok(),
        8 => AesCcmMic64::new(key)
            .decrypt_in_place_detached(nonce, aad, &mut buffer, GenericArray::from_slice(mic))
            .is_ok(),
        _ => false,
    };

    verified.then_some(buffer)
}

/// AES-CCM encrypt, returning `ciphertext || mic`.
pub fn ccm_encrypt(
    key: &Key128,
    nonce: &Nonce,
    aad: &[u8],
    plaintext: &[u8],
    mic_len: usize,
) -> anyhow::Result<Vec<u8>> {
    let nonce = GenericArray::from_slice(nonce);
    let key = GenericArray::from_slice(key);
    let mut buffer = plaintext.to_vec();

    let tag = match mic_len {
        4 => AesCcmMic32::new(key)
            .encrypt_in_place_detached(nonce, aad, &mut buffer)
            .map(|tag| tag.to_vec()),
        8 => AesCcmMic64::new(key)
            .encrypt_in_place_detached(nonce, aad, &mut buffer)
            .map(|tag| tag.to_vec()),
        other => return Err(anyhow::anyhow!("Unsupported MIC size: {} bytes", other)),
    }
    .map_err(|_| anyhow::anyhow!("CCM encryption failed for {} byte payload", plaintext.len()))?;

    buffer.extend_from_slice(&tag);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h16(s: &str) -> Key128 {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_s1_sample_data() {
        assert_eq!(s1(b"test"), h16("b73cefbd641ef2ea598c2b6efb62f79c"));
    }

    #[test]
    fn test_k1_sample_data() {
        let out = k1(
            &h16("3216d1509884b533248541792b877f98"),
            &h16("2ba14ffa0df84a2831938d57d276cab4"),
            &hex::decode("5a09d60797eeb4478aada59db3352a0d").unwrap(),
        );
        assert_eq!(out, h16("f6ed15a8934afbe7d83e8dcb57fcf5d7"));
    }

    #[test]
    fn test_k2_sample_data() {
        let material = k2(&h16("f7a2a44f8e8a8029064f173ddc1e2b00"), &MASTER_CREDENTIALS);
        assert_eq!(material.nid, 0x7F);
        assert_eq!(material.encryption_key, h16("9f589181a0f50de73c8070c7a6d27f46"));
        assert_eq!(material.privacy_key, h16("4c715bd4a64b938f99b453351653124f"));
    }

    #[test]
    fn test_k3_sample_data() {
        let network_id = k3(&h16("f7a2a44f8e8a8029064f173ddc1e2b00"));
        assert_eq!(hex::encode(network_id), "ff046958233db014");
    }

    #[test]
    fn test_k4_sample_data() {
        assert_eq!(k4(&h16("3216d1509884b533248541792b877f98")), 0x38);
    }

    #[test]
    fn test_virtual_address_sample_data() {
        let label = hex::decode("0073e7e4d8b9440faf8415df4c56c0e1").unwrap();
        assert_eq!(derive_label_hash(&label).unwrap(), 0xB529);
    }

    #[test]
    fn test_network_material_is_deterministic() {
        let raw = hex::decode("7dd7364cd842ad18c17c2b820c84c3d6").unwrap();
        let first = derive_network_material(&raw).unwrap();
        let second = derive_network_material(&raw).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.nid, 0x68);
        assert_eq!(first.encryption_key, h16("0953fa93e7caac9638f58820220a398e"));
        assert_eq!(first.privacy_key, h16("8b84eedec100067d670971dd2aa700cf"));
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        assert_eq!(
            derive_network_material(&[0u8; 15]),
            Err(KeyConfigError::WrongLength {
                field: "network key",
                expected: 16,
                actual: 15
            })
        );
        assert!(derive_application_material(&[0u8; 17]).is_err());
        assert!(derive_label_hash(&[]).is_err());
    }

    #[test]
    fn test_beacon_key_sample_data() {
        let key = beacon_key(&h16("7dd7364cd842ad18c17c2b820c84c3d6"));
        assert_eq!(key, h16("5423d967da639a99cb02231a83f7d254"));
    }

    #[test]
    fn test_ccm_rejects_tampered_mic() {
        let key = [0x11u8; 16];
        let nonce = [0x22u8; 13];
        let sealed = ccm_encrypt(&key, &nonce, &[], b"payload", 4).unwrap();
        let (ct, mic) = sealed.split_at(sealed.len() - 4);
        assert_eq!(ccm_decrypt(&key, &nonce, &[], ct, mic).unwrap(), b"payload");

        let mut bad_mic = mic.to_vec();
        bad_mic[0] ^= 0x01;
        assert!(ccm_decrypt(&key, &nonce, &[], ct, &bad_mic).is_none());
        assert!(ccm_decrypt(&[0x12u8; 16], &nonce, &[], ct, mic).is_none());
    }
}
