//! Mesh key store
//!
//! Holds the configured network, application, device and virtual label keys
//! together with everything derived from them. A record only exists once all
//! of its raw fields parsed, so every record in the store is usable.
//!
//! - NetKey + IV index: NID, EncryptionKey, PrivacyKey, Network ID, beacon key
//! - AppKey: AID, bound to the network record it was configured with
//! - DevKey: source address of the node it belongs to
//! - Label UUID: virtual address hash

use tracing::{debug, warn};

use super::crypto::{self, Key128};
use super::is_virtual;
use crate::config::{DeviceKeyEntry, KeysConfig, LabelEntry, NetworkKeyEntry};
use crate::error::KeyConfigError;

/// Identifies a (NetKey, IV index) pair.
///
/// Application keys and reassembly sessions are scoped by this value so that
/// material configured for one network is never tried against another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetKeyIvIndex {
    pub net_key: Key128,
    pub iv_index: u32,
}

/// A network key and everything derived from it. Fields are read-only so the
/// derived material always matches the raw key.
#[derive(Debug, Clone)]
pub struct NetworkKeyRecord {
    net_key: Key128,
    iv_index: u32,
    nid: u8,
    encryption_key: Key128,
    privacy_key: Key128,
    network_id: [u8; 8],
    beacon_key: Key128,
}

impl NetworkKeyRecord {
    pub fn new(net_key: Key128, iv_index: u32) -> Self {
        let material = crypto::k2(&net_key, &crypto::MASTER_CREDENTIALS);
        Self {
            net_key,
            iv_index,
            nid: material.nid,
            encryption_key: material.encryption_key,
            privacy_key: material.privacy_key,
            network_id: crypto::k3(&net_key),
            beacon_key: crypto::beacon_key(&net_key),
        }
    }

    pub fn net_key(&self) -> &Key128 {
        &self.net_key
    }

    pub fn iv_index(&self) -> u32 {
        self.iv_index
    }

    pub fn nid(&self) -> u8 {
        self.nid
    }

    pub fn encryption_key(&self) -> &Key128 {
        &self.encryption_key
    }

    pub fn privacy_key(&self) -> &Key128 {
        &self.privacy_key
    }

    pub fn network_id(&self) -> &[u8; 8] {
        &self.network_id
    }

    pub fn beacon_key(&self) -> &Key128 {
        &self.beacon_key
    }

    pub fn net_key_iv_index(&self) -> NetKeyIvIndex {
        NetKeyIvIndex {
            net_key: self.net_key,
            iv_index: self.iv_index,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplicationKeyRecord {
    app_key: Key128,
    aid: u8,
    /// Index of the network record this key was configured with
    network: usize,
    net_key_iv_index: NetKeyIvIndex,
}

impl ApplicationKeyRecord {
    pub fn app_key(&self) -> &Key128 {
        &self.app_key
    }

    pub fn aid(&self) -> u8 {
        self.aid
    }

    pub fn network(&self) -> usize {
        self.network
    }

    pub fn net_key_iv_index(&self) -> NetKeyIvIndex {
        self.net_key_iv_index
    }
}

#[derive(Debug, Clone)]
pub struct DeviceKeyRecord {
    pub dev_key: Key128,
    pub address: u16,
}

#[derive(Debug, Clone)]
pub struct VirtualLabelRecord {
    label: Key128,
    address: u16,
}

impl VirtualLabelRecord {
    pub fn new(label: Key128) -> Self {
        Self {
            label,
            address: crypto::virtual_address(&label),
        }
    }

    pub fn label(&self) -> &Key128 {
        &self.label
    }

    /// Virtual address the label hashes to
    pub fn address(&self) -> u16 {
        self.address
    }
}

/// Which kind of key secured an upper transport PDU (the AKF bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    Device,
    Application,
}

impl KeyClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyClass::Device => "device",
            KeyClass::Application => "application",
        }
    }
}

/// A key that can be trial-decrypted against.
///
/// The decryption engines iterate candidates and keep the first whose MIC
/// verifies; a failed trial just means "not this key".
pub trait CandidateKey {
    type Context: ?Sized;
    type Plaintext;

    fn try_decrypt(&self, ciphertext: &[u8], context: &Self::Context) -> Option<Self::Plaintext>;
}

/// One upper transport trial: a device or application key, plus the label
/// UUID to authenticate with when the destination is a virtual address.
#[derive(Debug, Clone, Copy)]
pub struct TransportCandidate<'a> {
    pub class: KeyClass,
    pub key: &'a Key128,
    pub label: Option<&'a VirtualLabelRecord>,
    /// Index of the record in its key list
    pub index: usize,
}

/// Parse a hex key field, accepting an optional `0x`/`0X` prefix.
pub fn parse_hex_field(
    field: &'static str,
    value: &str,
    expected: usize,
) -> Result<Vec<u8>, KeyConfigError> {
    let value = value.trim();
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);

    let bytes = hex::decode(digits).map_err(|e| KeyConfigError::InvalidHex {
        field,
        reason: e.to_string(),
    })?;

    if bytes.len() != expected {
        return Err(KeyConfigError::WrongLength {
            field,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

fn parse_key(field: &'static str, value: &str) -> Result<Key128, KeyConfigError> {
    let bytes = parse_hex_field(field, value, 16)?;
    let mut key = [0u8; 16];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn parse_u32(field: &'static str, value: &str) -> Result<u32, KeyConfigError> {
    let bytes = parse_hex_field(field, value, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn parse_u16(field: &'static str, value: &str) -> Result<u16, KeyConfigError> {
    let bytes = parse_hex_field(field, value, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// In-memory collection of every configured key record
#[derive(Debug, Default)]
pub struct KeyStore {
    pub networks: Vec<NetworkKeyRecord>,
    pub applications: Vec<ApplicationKeyRecord>,
    pub devices: Vec<DeviceKeyRecord>,
    pub labels: Vec<VirtualLabelRecord>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from configuration. Rejected entries are logged and
    /// returned alongside the store; they never make it into the store.
    pub fn from_config(config: &KeysConfig) -> (Self, Vec<KeyConfigError>) {
        let mut store = KeyStore::new();
        let mut rejected = Vec::new();

        for entry in &config.network {
            if let Err(e) = store.add_network_entry(entry) {
                warn!("Ignoring network key entry: {}", e);
                rejected.push(e);
            }
        }
        for entry in &config.device {
            if let Err(e) = store.add_device_entry(entry) {
                warn!("Ignoring device key entry: {}", e);
                rejected.push(e);
            }
        }
        for entry in &config.label {
            if let Err(e) = store.add_label_entry(entry) {
                warn!("Ignoring label entry: {}", e);
                rejected.push(e);
            }
        }

        debug!(
            "Key store: {} network, {} application, {} device, {} label record(s)",
            store.networks.len(),
            store.applications.len(),
            store.devices.len(),
            store.labels.len()
        );
        (store, rejected)
    }

    /// Add a `{net_key, app_key, iv_index}` configuration entry.
    ///
    /// Every field is validated before anything is inserted.
    pub fn add_network_entry(&mut self, entry: &NetworkKeyEntry) -> Result<(), KeyConfigError> {
        let net_key = parse_key("network key", &entry.net_key)?;
        let iv_index = parse_u32("IV index", &entry.iv_index)?;
        let app_key = match entry.app_key.as_deref().map(str::trim) {
            Some(value) if !value.is_empty() => Some(parse_key("application key", value)?),
            _ => None,
        };

        let network = self.add_network(net_key, iv_index);
        if let Some(app_key) = app_key {
            self.add_application(app_key, network);
        }
        Ok(())
    }

    pub fn add_device_entry(&mut self, entry: &DeviceKeyEntry) -> Result<(), KeyConfigError> {
        let dev_key = parse_key("device key", &entry.dev_key)?;
        let address = parse_u16("source address", &entry.address)?;
        self.add_device(dev_key, address);
        Ok(())
    }

    pub fn add_label_entry(&mut self, entry: &LabelEntry) -> Result<(), KeyConfigError> {
        let label = parse_key("label UUID", &entry.uuid)?;
        self.add_label(label);
        Ok(())
    }

    /// Add a network record, returning its index. Adding the same
    /// (NetKey, IV index) pair twice returns the existing record.
    pub fn add_network(&mut self, net_key: Key128, iv_index: u32) -> usize {
        if let Some(index) = self
            .networks
            .iter()
            .position(|n| n.net_key == net_key && n.iv_index == iv_index)
        {
            return index;
        }
        self.networks.push(NetworkKeyRecord::new(net_key, iv_index));
        self.networks.len() - 1
    }

    /// Bind an application key to the network record at `network`.
    pub fn add_application(&mut self, app_key: Key128, network: usize) {
        let Some(net) = self.networks.get(network) else {
            warn!("Application key bound to unknown network record {}", network);
            return;
        };
        let net_key_iv_index = net.net_key_iv_index();
        if self
            .applications
            .iter()
            .any(|a| a.app_key == app_key && a.net_key_iv_index == net_key_iv_index)
        {
            return;
        }
        self.applications.push(ApplicationKeyRecord {
            app_key,
            aid: crypto::k4(&app_key),
            network,
            net_key_iv_index,
        });
    }

    pub fn add_device(&mut self, dev_key: Key128, address: u16) {
        self.devices.push(DeviceKeyRecord { dev_key, address });
    }

    pub fn add_label(&mut self, label: Key128) {
        self.labels.push(VirtualLabelRecord::new(label));
    }

    /// Network records whose NID matches
    pub fn network_candidates(&self, nid: u8) -> impl Iterator<Item = &NetworkKeyRecord> {
        self.networks.iter().filter(move |n| n.nid == nid)
    }

    /// Label records whose virtual address equals `dst`
    pub fn labels_for(&self, dst: u16) -> impl Iterator<Item = &VirtualLabelRecord> {
        self.labels.iter().filter(move |l| l.address == dst)
    }

    /// Application keys configured for `context` whose AID matches.
    ///
    /// The AID only narrows the search: every matching key is offered.
    pub fn application_candidates(
        &self,
        context: NetKeyIvIndex,
        aid: u8,
        dst: u16,
    ) -> Vec<TransportCandidate<'_>> {
        let keys = self
            .applications
            .iter()
            .enumerate()
            .filter(|(_, a)| a.net_key_iv_index == context && a.aid == aid)
            .map(|(index, a)| (index, &a.app_key));
        self.expand_labels(KeyClass::Application, keys, dst)
    }

    /// Device keys of the sending node, plus those of a unicast destination.
    pub fn device_candidates(&self, src: u16, dst: u16) -> Vec<TransportCandidate<'_>> {
        let dst_is_unicast = super::is_unicast(dst);
        let keys = self
            .devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.address == src || (dst_is_unicast && d.address == dst))
            .map(|(index, d)| (index, &d.dev_key));
        self.expand_labels(KeyClass::Device, keys, dst)
    }

    fn expand_labels<'a>(
        &'a self,
        class: KeyClass,
        keys: impl Iterator<Item = (usize, &'a Key128)>,
        dst: u16,
    ) -> Vec<TransportCandidate<'a>> {
        let mut candidates = Vec::new();
        for (index, key) in keys {
            if is_virtual(dst) {
                for label in self.labels_for(dst) {
                    candidates.push(TransportCandidate {
                        class,
                        key,
                        label: Some(label),
                        index,
                    });
                }
            } else {
                candidates.push(TransportCandidate {
                    class,
                    key,
                    label: None,
                    index,
                });
            }
        }
        candidates
    }
}
