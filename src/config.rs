//! netBiDiB connection configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::message::UniqueId;

/// Default netBiDiB TCP port
pub const DEFAULT_PORT: u16 = 62875;

/// Default pairing timeout in seconds
pub const DEFAULT_PAIRING_TIMEOUT: u8 = 30;

/// Instance id used when no client id is configured
pub const DEFAULT_INSTANCE_ID: UniqueId = [0x00, 0x20, 0x0D, 0xFB, 0x00, 0x0A, 0x14];

/// netBiDiB configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetBidibConfig {
    /// Emitter name sent with the protocol signature
    pub application_name: String,

    /// User name announced to the peer
    pub username: String,

    /// Hex client id, written into the low bytes of the instance id
    pub client_id: String,

    /// Seconds granted to the peer for confirming a pairing request
    pub pairing_timeout: u8,

    /// Remote host
    pub host_address: String,

    /// Remote port
    pub port_number: u16,

    /// Override for the pairing store directory
    pub pairing_store_directory: Option<PathBuf>,
}

impl Default for NetBidibConfig {
    fn default() -> Self {
        Self {
            application_name: String::new(),
            username: String::new(),
            client_id: String::new(),
            pairing_timeout: DEFAULT_PAIRING_TIMEOUT,
            host_address: "127.0.0.1".to_string(),
            port_number: DEFAULT_PORT,
            pairing_store_directory: None,
        }
    }
}

impl NetBidibConfig {
    /// `host:port` of the remote endpoint
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host_address, self.port_number)
    }

    /// Derive the local instance id from the configured client id.
    ///
    /// The parsed bytes overwrite the tail of [`DEFAULT_INSTANCE_ID`]. An
    /// empty or malformed client id leaves the default untouched.
    pub fn instance_id(&self) -> UniqueId {
        let mut instance_id = DEFAULT_INSTANCE_ID;
        if self.client_id.is_empty() {
            return instance_id;
        }

        match hex::decode(&self.client_id) {
            Ok(client_id) if client_id.len() <= instance_id.len() => {
                let offset = instance_id.len() - client_id.len();
                instance_id[offset..].copy_from_slice(&client_id);
            }
            Ok(client_id) => {
                log::error!(
                    "Could not parse '{}' for custom client id: {} bytes exceed the unique id",
                    self.client_id,
                    client_id.len()
                );
            }
            Err(e) => {
                log::error!(
                    "Could not parse '{}' for custom client id: {}",
                    self.client_id,
                    e
                );
            }
        }

        instance_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_instance_id() {
        let config = NetBidibConfig::default();
        assert_eq!(config.instance_id(), DEFAULT_INSTANCE_ID);
        assert_eq!(hex::encode_upper(config.instance_id()), "00200DFB000A14");
    }

    #[test]
    fn test_client_id_overwrites_tail() {
        let config = NetBidibConfig {
            client_id: "010101".to_string(),
            ..Default::default()
        };
        assert_eq!(hex::encode_upper(config.instance_id()), "00200DFB010101");
    }

    #[test]
    fn test_malformed_client_id_keeps_default() {
        for client_id in ["123", "zz", "0102030405060708"] {
            let config = NetBidibConfig {
                client_id: client_id.to_string(),
                ..Default::default()
            };
            assert_eq!(config.instance_id(), DEFAULT_INSTANCE_ID);
        }
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: NetBidibConfig =
            serde_json::from_str(r#"{"applicationName":"BiDiB-Wizard","clientId":"AB"}"#)
                .unwrap();
        assert_eq!(config.application_name, "BiDiB-Wizard");
        assert_eq!(config.pairing_timeout, DEFAULT_PAIRING_TIMEOUT);
        assert_eq!(config.endpoint(), "127.0.0.1:62875");
    }
}
