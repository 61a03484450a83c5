//! Mesh beacons
//!
//! Unprovisioned device beacon:
//!   0x00 | DeviceUUID(16) | OOBInfo(2) | [URIHash(4)]
//! Secure network beacon:
//!   0x01 | Flags(1) | NetworkID(8) | IVIndex(4) | AuthValue(8)
//!
//! AuthValue is the first 8 bytes of CMAC(BeaconKey, Flags || NetworkID || IVIndex).

use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;

use super::crypto::{self, Key128};
use super::keys::{KeyStore, NetworkKeyRecord};
use crate::error::DecodeError;

pub const UNPROVISIONED_BEACON: u8 = 0x00;
pub const SECURE_NETWORK_BEACON: u8 = 0x01;

const SECURE_BEACON_LEN: usize = 22;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Beacon {
    Unprovisioned {
        uuid: Key128,
        oob_info: u16,
        uri_hash: Option<u32>,
    },
    SecureNetwork(SecureNetworkBeacon),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureNetworkBeacon {
    pub key_refresh: bool,
    pub iv_update: bool,
    pub network_id: [u8; 8],
    pub iv_index: u32,
    pub auth: [u8; 8],
}

impl SecureNetworkBeacon {
    /// Build an authenticated beacon for `network`.
    pub fn new(network: &NetworkKeyRecord, key_refresh: bool, iv_update: bool) -> Self {
        let mut beacon = SecureNetworkBeacon {
            key_refresh,
            iv_update,
            network_id: *network.network_id(),
            iv_index: network.iv_index(),
            auth: [0u8; 8],
        };
        beacon.auth = beacon.compute_auth(network.beacon_key());
        beacon
    }

    pub fn flags(&self) -> u8 {
        (self.key_refresh as u8) | ((self.iv_update as u8) << 1)
    }

    fn compute_auth(&self, beacon_key: &Key128) -> [u8; 8] {
        let mac = crypto::aes_cmac(
            beacon_key,
            &[&[self.flags()], &self.network_id, &self.iv_index.to_be_bytes()],
        );
        let mut auth = [0u8; 8];
        auth.copy_from_slice(&mac[..8]);
        auth
    }

    /// Index of the network record that authenticates this beacon, if any.
    pub fn authenticate(&self, keys: &KeyStore) -> Option<usize> {
        let found = keys
            .networks
            .iter()
            .position(|n| *n.network_id() == self.network_id && self.compute_auth(n.beacon_key()) == self.auth);
        if found.is_none() {
            debug!(
                "Secure beacon for network {} not authenticated",
                hex::encode(self.network_id)
            );
        }
        found
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(SECURE_BEACON_LEN);
        buf.put_u8(SECURE_NETWORK_BEACON);
        buf.put_u8(self.flags());
        buf.put_slice(&self.network_id);
        buf.put_u32(self.iv_index);
        buf.put_slice(&self.auth);
        buf.to_vec()
    }
}

/// Parse a mesh beacon (the payload of a beacon advertisement or proxy PDU).
pub fn parse(data: &[u8]) -> Result<Beacon, DecodeError> {
    let mut buf = data;
    if !buf.has_remaining() {
        return Err(DecodeError::Malformed {
            what: "beacon",
            len: 0,
            min: 1,
        });
    }

    match buf.get_u8() {
        UNPROVISIONED_BEACON => {
            if buf.remaining() < 18 {
                return Err(DecodeError::Malformed {
                    what: "unprovisioned device beacon",
                    len: data.len(),
                    min: 19,
                });
            }
            let mut uuid = [0u8; 16];
            buf.copy_to_slice(&mut uuid);
            let oob_info = buf.get_u16();
            let uri_hash = (buf.remaining() >= 4).then(|| buf.get_u32());
            Ok(Beacon::Unprovisioned {
                uuid,
                oob_info,
                uri_hash,
            })
        }
        SECURE_NETWORK_BEACON => {
            if data.len() < SECURE_BEACON_LEN {
                return Err(DecodeError::Malformed {
                    what: "secure network beacon",
                    len: data.len(),
                    min: SECURE_BEACON_LEN,
                });
            }
            let flags = buf.get_u8();
            let mut network_id = [0u8; 8];
            buf.copy_to_slice(&mut network_id);
            let iv_index = buf.get_u32();
            let mut auth = [0u8; 8];
            buf.copy_to_slice(&mut auth);
            Ok(Beacon::SecureNetwork(SecureNetworkBeacon {
                key_refresh: flags & 0x01 != 0,
                iv_update: flags & 0x02 != 0,
                network_id,
                iv_index,
                auth,
            }))
        }
        other => Err(DecodeError::UnknownBeacon(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_BEACON: &str = "01003ecaff672f673370123456788ea261582f364f6f";

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
    fn test_build_secure_beacon() {
        let store = sample_store();
        let beacon = SecureNetworkBeacon::new(&store.networks[0], false, false);
        assert_eq!(hex::encode(beacon.encode()), SAMPLE_BEACON);
    }

    #[test]
    fn test_parse_and_authenticate() {
        let data = hex::decode(SAMPLE_BEACON).unwrap();
        let Beacon::SecureNetwork(beacon) = parse(&data).unwrap() else {
            panic!("Expected secure network beacon");
        };
        assert!(!beacon.key_refresh);
        assert!(!beacon.iv_update);
        assert_eq!(beacon.iv_index, 0x12345678);
        assert_eq!(beacon.authenticate(&sample_store()), Some(0));

        let mut forged = beacon;
        forged.iv_update = true;
        assert_eq!(forged.authenticate(&sample_store()), None);
        assert_eq!(beacon.authenticate(&KeyStore::new()), None);
    }

    #[test]
    fn test_parse_unprovisioned() {
        let mut data = vec![0x00];
        data.extend_from_slice(&[0xAB; 16]);
        data.extend_from_slice(&[0x40, 0x20]);
        assert_eq!(
            parse(&data).unwrap(),
            Beacon::Unprovisioned {
                uuid: [0xAB; 16],
                oob_info: 0x4020,
                uri_hash: None
            }
        );

        data.extend_from_slice(&[0xD9, 0x74, 0x78, 0xB3]);
        match parse(&data).unwrap() {
            Beacon::Unprovisioned { uri_hash, .. } => assert_eq!(uri_hash, Some(0xD97478B3)),
            other => panic!("Expected unprovisioned beacon, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse(&[]).is_err());
        assert_eq!(parse(&[0x05, 0x00]), Err(DecodeError::UnknownBeacon(0x05)));
        assert!(parse(&hex::decode(SAMPLE_BEACON).unwrap()[..21]).is_err());
        assert!(parse(&[0x00; 10]).is_err());
    }
}
