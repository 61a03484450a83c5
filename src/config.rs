use serde::Deserialize;
use std::path::Path;

use crate::mesh::Bearer;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub udp: UdpConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub keys: KeysConfig,
}

#[derive(Debug, Deserialize)]
pub struct UdpConfig {
    pub bind: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DecoderConfig {
    /// Decrypt network PDUs with the proxy nonce instead of the network nonce
    #[serde(default)]
    pub proxy_bearer: bool,
}

impl DecoderConfig {
    pub fn bearer(&self) -> Bearer {
        if self.proxy_bearer {
            Bearer::Proxy
        } else {
            Bearer::Advertising
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// `[[keys.network]]`: a network key, its IV index and an optional application key
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkKeyEntry {
    pub net_key: String,
    #[serde(default)]
    pub app_key: Option<String>,
    pub iv_index: String,
}

/// `[[keys.device]]`: a node's device key and unicast address
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceKeyEntry {
    pub dev_key: String,
    pub address: String,
}

/// `[[keys.label]]`: a virtual address Label UUID
#[derive(Debug, Clone, Deserialize)]
pub struct LabelEntry {
    pub uuid: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    pub network: Vec<NetworkKeyEntry>,
    pub device: Vec<DeviceKeyEntry>,
    pub label: Vec<LabelEntry>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp: UdpConfig {
                bind: "0.0.0.0:1680".to_string(),
            },
            decoder: DecoderConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            keys: KeysConfig::default(),
        }
    }
}
