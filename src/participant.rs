//! netBiDiB participant record
//!
//! A participant is the remote side of a pairing. Its 7-byte unique id is
//! the identity key; the `uid` string (`0x` + hex) is what gets persisted.
//! Either representation may be the source: a participant built from the
//! wire has an `id`, one loaded from the pairing store has a `uid`. The
//! other form is derived on first access and cached.

use std::fmt;

use chrono::{DateTime, Local};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::message::UniqueId;

/// Remote netBiDiB participant
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "ParticipantRecord", into = "ParticipantRecord")]
pub struct Participant {
    id: OnceCell<UniqueId>,
    uid: OnceCell<String>,
    pub product_name: Option<String>,
    pub requestor_name: Option<String>,
    pub user_name: Option<String>,
    pub protocol_version: Option<String>,
    pub last_seen: Option<DateTime<Local>>,
}

impl Participant {
    /// Create a participant from a unique id received on the wire
    pub fn with_id(id: UniqueId) -> Self {
        let participant = Self::default();
        let _ = participant.id.set(id);
        participant
    }

    /// Create a participant from a persisted uid string
    pub fn with_uid(uid: impl Into<String>) -> Self {
        let participant = Self::default();
        let _ = participant.uid.set(uid.into());
        participant
    }

    /// Unique id, parsed from `uid` on first access when only the string is known
    pub fn id(&self) -> Option<UniqueId> {
        if let Some(id) = self.id.get() {
            return Some(*id);
        }

        let uid = self.uid.get()?;
        match parse_uid(uid) {
            Some(id) => Some(*self.id.get_or_init(|| id)),
            None => {
                log::warn!("Participant uid '{}' is not a valid unique id", uid);
                None
            }
        }
    }

    /// Hex form of the unique id, derived from `id` on first access
    pub fn uid(&self) -> Option<&str> {
        if self.uid.get().is_none() {
            let id = self.id.get()?;
            let _ = self.uid.set(format!("0x{}", hex::encode_upper(id)));
        }
        self.uid.get().map(String::as_str)
    }

    /// Replace the identity. The last write wins: any cached `uid` is
    /// discarded and recomputed from the new id.
    pub fn set_id(&mut self, id: UniqueId) {
        self.id = OnceCell::with_value(id);
        self.uid = OnceCell::new();
    }

    /// Replace the identity from a uid string, discarding any cached id
    pub fn set_uid(&mut self, uid: impl Into<String>) {
        self.uid = OnceCell::with_value(uid.into());
        self.id = OnceCell::new();
    }

    /// True for the empty record a reset processor starts with
    pub fn is_empty(&self) -> bool {
        self.id.get().is_none() && self.uid.get().is_none()
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {}",
            self.product_name.as_deref().unwrap_or_default(),
            self.uid().unwrap_or_default()
        )
    }
}

/// Parse `0x0102...` / `0102...` into a unique id using the first 7 bytes
pub fn parse_uid(uid: &str) -> Option<UniqueId> {
    let digits = uid
        .strip_prefix("0x")
        .or_else(|| uid.strip_prefix("0X"))
        .unwrap_or(uid);
    let bytes = hex::decode(digits).ok()?;
    bytes.get(..7)?.try_into().ok()
}

/// Persisted form of a participant
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParticipantRecord {
    #[serde(default)]
    product_name: Option<String>,
    #[serde(default)]
    requestor_name: Option<String>,
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    uid: Option<String>,
    #[serde(default)]
    last_seen: Option<DateTime<Local>>,
    #[serde(default)]
    protocol_version: Option<String>,
}

impl From<ParticipantRecord> for Participant {
    fn from(record: ParticipantRecord) -> Self {
        let mut participant = match record.uid {
            Some(uid) => Participant::with_uid(uid),
            None => Participant::default(),
        };
        participant.product_name = record.product_name;
        participant.requestor_name = record.requestor_name;
        participant.user_name = record.user_name;
        participant.protocol_version = record.protocol_version;
        participant.last_seen = record.last_seen;
        participant
    }
}

impl From<Participant> for ParticipantRecord {
    fn from(participant: Participant) -> Self {
        Self {
            uid: participant.uid().map(str::to_string),
            product_name: participant.product_name,
            requestor_name: participant.requestor_name,
            user_name: participant.user_name,
            last_seen: participant.last_seen,
            protocol_version: participant.protocol_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_derived_from_id() {
        let participant = Participant::with_id([0x0A, 0, 0x0D, 0xFA, 0x01, 0x03, 0x02]);
        assert_eq!(participant.uid(), Some("0x0A000DFA010302"));
    }

    #[test]
    fn test_id_derived_from_uid() {
        let participant = Participant::with_uid("0x0A000DFA010302");
        assert_eq!(participant.id(), Some([0x0A, 0, 0x0D, 0xFA, 0x01, 0x03, 0x02]));

        let participant = Participant::with_uid("0A000DFA01030299");
        assert_eq!(participant.id(), Some([0x0A, 0, 0x0D, 0xFA, 0x01, 0x03, 0x02]));
    }

    #[test]
    fn test_invalid_uid_has_no_id() {
        assert_eq!(Participant::with_uid("0x0A00").id(), None);
        assert_eq!(Participant::with_uid("not hex").id(), None);
        assert!(Participant::default().id().is_none());
        assert!(Participant::default().uid().is_none());
    }

    #[test]
    fn test_last_identity_write_wins() {
        let mut participant = Participant::with_id([1, 1, 1, 1, 1, 1, 1]);
        assert_eq!(participant.uid(), Some("0x01010101010101"));

        participant.set_uid("0x02020202020202");
        assert_eq!(participant.id(), Some([2; 7]));

        participant.set_id([3; 7]);
        assert_eq!(participant.uid(), Some("0x03030303030303"));
    }

    #[test]
    fn test_json_record_shape() {
        let mut participant = Participant::with_id([0, 0, 0x0D, 0xFA, 0x01, 0x03, 0x01]);
        participant.product_name = Some("GBMboost".to_string());
        participant.protocol_version = Some("0.8".to_string());

        let json = serde_json::to_value(&participant).unwrap();
        assert_eq!(json["uid"], "0x00000DFA010301");
        assert_eq!(json["productName"], "GBMboost");
        assert_eq!(json["protocolVersion"], "0.8");

        let restored: Participant = serde_json::from_value(json).unwrap();
        assert_eq!(restored.id(), participant.id());
        assert_eq!(restored.to_string(), "GBMboost - 0x00000DFA010301");
    }
}
