use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp layout used on the wire: four-digit zone offset, no colon.
pub const POINTER_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

/// The pointer record naming the most recent snapshot image and when it was
/// produced. Serialized field names are wire-stable; unknown fields are
/// ignored on read so older nodes keep working against newer writers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestPointer {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
}

impl LatestPointer {
    pub fn new(path: String, produced_at: DateTime<Utc>) -> Self {
        Self {
            path,
            timestamp: produced_at.format(POINTER_TIMESTAMP_FORMAT).to_string(),
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trips_field_for_field() {
        let pointer = LatestPointer {
            path: "backupdir/etcd.snapshot.1700000000".to_string(),
            timestamp: "2023-11-14T22:13:20+0000".to_string(),
        };
        let bytes = pointer.to_bytes().unwrap();
        assert_eq!(LatestPointer::from_slice(&bytes).unwrap(), pointer);
    }

    #[test]
    fn wire_field_names_are_capitalized() {
        let pointer = LatestPointer {
            path: "etcd.snapshot.1".to_string(),
            timestamp: "2023-01-01T00:00:00+0000".to_string(),
        };
        let v: serde_json::Value =
            serde_json::from_slice(&pointer.to_bytes().unwrap()).unwrap();
        assert_eq!(v["Path"], "etcd.snapshot.1");
        assert_eq!(v["Timestamp"], "2023-01-01T00:00:00+0000");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = br#"{"Path":"etcd.snapshot.5","Timestamp":"2023-01-01T00:00:00+0000","Checksum":"abc"}"#;
        let pointer = LatestPointer::from_slice(raw).unwrap();
        assert_eq!(pointer.path, "etcd.snapshot.5");
    }

    #[test]
    fn timestamp_format_has_no_zone_colon() {
        let produced = DateTime::from_timestamp(1700000000, 0).unwrap();
        let pointer = LatestPointer::new("etcd.snapshot.1700000000".to_string(), produced);
        assert_eq!(pointer.timestamp, "2023-11-14T22:13:20+0000");
    }
}
