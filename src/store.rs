//! Pairing store
//!
//! Keeps the participants this side has completed a pairing with, so a
//! later connection can take the known-peer fast path. The set is written
//! to a JSON array after every change.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::NetBidibConfig;
use crate::error::{NetBidibError, Result};
use crate::message::UniqueId;
use crate::participant::Participant;

/// Default store directory below the user profile
pub fn default_store_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".bidib")
        .join("data")
        .join("netBiDiB")
}

/// Store file name for a client id
pub fn store_file_name(client_id: &str) -> String {
    format!("netBiDiBPairingStore-{}.bidib", client_id)
}

/// Trusted netBiDiB participants
#[derive(Debug, Default)]
pub struct PairingStore {
    participants: Vec<Participant>,
    store_file_path: Option<PathBuf>,
}

impl PairingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the store location from `config` and load it.
    ///
    /// A missing or unreadable file yields an empty trusted set.
    pub fn initialize(&mut self, config: Option<&NetBidibConfig>) -> Result<()> {
        let config = config.ok_or(NetBidibError::InvalidArgument("config"))?;

        let store_directory = config
            .pairing_store_directory
            .clone()
            .unwrap_or_else(default_store_directory);
        let store_file_path = store_directory.join(store_file_name(&config.client_id));

        self.participants.clear();
        if let Err(e) = fs::create_dir_all(&store_directory) {
            log::warn!(
                "Could not create pairing store directory {}: {}",
                store_directory.display(),
                e
            );
        }

        match load_json::<Vec<Option<Participant>>>(&store_file_path) {
            Ok(Some(items)) => {
                self.participants.extend(items.into_iter().flatten());
                log::info!("{} netBiDiB participants loaded.", self.participants.len());
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!(
                    "Could not load participants from {}: {}",
                    store_file_path.display(),
                    e
                );
            }
        }

        self.store_file_path = Some(store_file_path);
        Ok(())
    }

    /// Current trusted participants in insertion order
    pub fn trusted_participants(&self) -> &[Participant] {
        &self.participants
    }

    /// Ids of all trusted participants
    pub fn trusted_ids(&self) -> Vec<UniqueId> {
        self.participants.iter().filter_map(Participant::id).collect()
    }

    /// Path of the backing file, once initialized
    pub fn store_file_path(&self) -> Option<&Path> {
        self.store_file_path.as_deref()
    }

    /// Insert `participant`, replacing an entry with the same id, and save.
    ///
    /// A failed save is logged; the in-memory set keeps the change.
    pub fn add_or_update(&mut self, mut participant: Participant) {
        if let Some(id) = participant.id() {
            if let Some(index) = self.participants.iter().position(|p| p.id() == Some(id)) {
                self.participants.remove(index);
            }
        }

        participant.last_seen = Some(Local::now());
        self.participants.push(participant);
        self.save();
    }

    fn save(&self) {
        let Some(path) = &self.store_file_path else {
            log::warn!("netBiDiB pairing store not initialized, participants not stored");
            return;
        };

        if let Err(e) = save_json(path, &self.participants) {
            log::warn!(
                "netBiDiB participants could not be stored to {}: {}",
                path.display(),
                e
            );
        }
    }
}

/// Read and parse a JSON file; `None` when it does not exist
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

/// Serialize `value` as pretty JSON into `path`
pub fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_for(dir: &TempDir) -> NetBidibConfig {
        NetBidibConfig {
            client_id: "AB".to_string(),
            pairing_store_directory: Some(dir.path().join("store")),
            ..Default::default()
        }
    }

    #[test]
    fn test_initialize_requires_config() {
        let mut store = PairingStore::new();
        assert!(matches!(
            store.initialize(None),
            Err(NetBidibError::InvalidArgument("config"))
        ));
    }

    #[test]
    fn test_initialize_creates_directory() {
        let dir = TempDir::new().unwrap();
        let mut store = PairingStore::new();
        store.initialize(Some(&config_for(&dir))).unwrap();

        assert!(dir.path().join("store").is_dir());
        assert!(store.trusted_participants().is_empty());
        assert_eq!(
            store.store_file_path().unwrap(),
            dir.path().join("store").join("netBiDiBPairingStore-AB.bidib")
        );
    }

    #[test]
    fn test_initialize_loads_participants() {
        let dir = TempDir::new().unwrap();
        let store_dir = dir.path().join("store");
        fs::create_dir_all(&store_dir).unwrap();
        fs::write(
            store_dir.join(store_file_name("AB")),
            r#"[{"productName":"GBMboost","uid":"0x0A000DFA010302","protocolVersion":"0.8"}, null]"#,
        )
        .unwrap();

        let mut store = PairingStore::new();
        store.initialize(Some(&config_for(&dir))).unwrap();

        assert_eq!(store.trusted_participants().len(), 1);
        assert_eq!(store.trusted_ids(), vec![[0x0A, 0, 0x0D, 0xFA, 0x01, 0x03, 0x02]]);
    }

    #[test]
    fn test_corrupt_file_yields_empty_set() {
        let dir = TempDir::new().unwrap();
        let store_dir = dir.path().join("store");
        fs::create_dir_all(&store_dir).unwrap();
        fs::write(store_dir.join(store_file_name("AB")), "{ not json").unwrap();

        let mut store = PairingStore::new();
        store.initialize(Some(&config_for(&dir))).unwrap();
        assert!(store.trusted_participants().is_empty());
    }

    #[test]
    fn test_add_or_update_keeps_one_entry_per_id() {
        let dir = TempDir::new().unwrap();
        let mut store = PairingStore::new();
        store.initialize(Some(&config_for(&dir))).unwrap();

        let mut first = Participant::with_id([1; 7]);
        first.product_name = Some("first".to_string());
        store.add_or_update(first);
        store.add_or_update(Participant::with_id([2; 7]));

        let mut second = Participant::with_uid("0x01010101010101");
        second.product_name = Some("second".to_string());
        store.add_or_update(second);

        let participants = store.trusted_participants();
        assert_eq!(participants.len(), 2);
        assert_eq!(participants[1].product_name.as_deref(), Some("second"));
        assert!(participants[1].last_seen.is_some());

        let mut reloaded = PairingStore::new();
        reloaded.initialize(Some(&config_for(&dir))).unwrap();
        assert_eq!(reloaded.trusted_ids(), vec![[2; 7], [1; 7]]);
    }

    #[test]
    fn test_add_without_initialize_keeps_memory_state() {
        let mut store = PairingStore::new();
        store.add_or_update(Participant::with_id([1; 7]));
        assert_eq!(store.trusted_participants().len(), 1);
    }

    #[test]
    fn test_failed_save_keeps_memory_state() {
        let dir = TempDir::new().unwrap();
        let mut store = PairingStore::new();
        store.initialize(Some(&config_for(&dir))).unwrap();

        let path = store.store_file_path().unwrap().to_path_buf();
        fs::create_dir_all(&path).unwrap();

        store.add_or_update(Participant::with_id([1; 7]));

        assert_eq!(store.trusted_ids(), vec![[1; 7]]);
        assert!(path.is_dir());
    }

    #[test]
    fn test_participants_without_id_never_replace_entries() {
        let dir = TempDir::new().unwrap();
        let mut store = PairingStore::new();
        store.initialize(Some(&config_for(&dir))).unwrap();

        let mut broken = Participant::with_uid("not a uid");
        broken.product_name = Some("broken".to_string());
        store.add_or_update(broken);
        store.add_or_update(Participant::default());

        let participants = store.trusted_participants();
        assert_eq!(participants.len(), 2);
        assert_eq!(participants[0].product_name.as_deref(), Some("broken"));
    }

    #[test]
    fn test_default_store_location() {
        assert!(default_store_directory().ends_with(".bidib/data/netBiDiB"));
        assert_eq!(store_file_name(""), "netBiDiBPairingStore-.bidib");
    }
}
