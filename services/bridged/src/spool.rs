use ferrite::logging;
use ferrite::time::timestamp_millis;
use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// One MQTT publication persisted while the broker is unreachable. Binary
/// fields travel base64-inside-JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolRecord {
    pub topic: String,
    #[serde(with = "ferrite::encoding::base64")]
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    #[serde(default)]
    pub response_topic: Option<String>,
    #[serde(default, with = "opt_base64")]
    pub correlation_data: Option<Vec<u8>>,
    #[serde(default)]
    pub user_properties: Vec<(String, String)>,
}

mod opt_base64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&ferrite::encoding::base64::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(encoded) => ferrite::encoding::base64::decode(&encoded)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// The on-disk publication buffer. One JSON file per record, drained in
/// filename order. Any filesystem error flips the spool into its degraded
/// mode; it never retries by itself, the condition is surfaced through the
/// runtime state instead.
pub struct Spool {
    dir: PathBuf,
    degraded: bool,
    failure_reason: String,
    sequence: u64,
    stored: u64,
    log: logging::Logger,
}

impl Spool {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(dir: PathBuf, log: L) -> Spool {
        let spool_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        let mut spool = Spool {
            dir,
            degraded: false,
            failure_reason: String::new(),
            sequence: 0,
            stored: 0,
            log: spool_log,
        };

        if let Err(error) = fs::create_dir_all(&spool.dir) {
            spool.degrade(format!("spool dir unusable: {}", error));
        } else {
            spool.stored = spool.count_records();
        }

        spool
    }

    #[inline]
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    #[inline]
    pub fn failure_reason(&self) -> &str {
        &self.failure_reason
    }

    /// Records currently on disk.
    #[inline]
    pub fn len(&self) -> u64 {
        self.stored
    }

    /// Persist one record. Returns false when the spool is (or just became)
    /// degraded and the record was not stored.
    pub fn store(&mut self, record: &SpoolRecord) -> bool {
        if self.degraded {
            return false;
        }

        let encoded = match serde_json::to_vec(record) {
            Ok(encoded) => encoded,
            Err(error) => {
                self.degrade(format!("record encode failed: {}", error));
                return false;
            }
        };

        self.sequence += 1;
        let name = format!("{:013}-{:06}.spool", timestamp_millis(), self.sequence);
        let path = self.dir.join(name);

        match fs::write(&path, &encoded) {
            Ok(()) => {
                self.stored += 1;
                logging::trace!(self.log, "record spooled"; "topic" => &record.topic);
                true
            }
            Err(error) => {
                self.degrade(format!("spool write failed: {}", error));
                false
            }
        }
    }

    /// Remove and return the oldest record. `None` when empty or degraded.
    pub fn take_oldest(&mut self) -> Option<SpoolRecord> {
        if self.degraded {
            return None;
        }

        let mut names: Vec<PathBuf> = match fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| {
                    path.extension().map(|ext| ext == "spool").unwrap_or(false)
                })
                .collect(),
            Err(error) => {
                self.degrade(format!("spool dir unreadable: {}", error));
                return None;
            }
        };

        names.sort();
        let path = names.into_iter().next()?;

        let record = match fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<SpoolRecord>(&raw) {
                Ok(record) => Some(record),
                Err(error) => {
                    // One corrupt record is dropped, not a degradation.
                    logging::warn!(self.log, "corrupt spool record dropped";
                                   "path" => %path.display(),
                                   "error" => %error);
                    None
                }
            },
            Err(error) => {
                self.degrade(format!("spool read failed: {}", error));
                return None;
            }
        };

        if let Err(error) = fs::remove_file(&path) {
            self.degrade(format!("spool unlink failed: {}", error));
        }
        self.stored = self.stored.saturating_sub(1);

        record.or_else(|| self.take_oldest())
    }

    fn count_records(&self) -> u64 {
        match fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| {
                    entry
                        .path()
                        .extension()
                        .map(|ext| ext == "spool")
                        .unwrap_or(false)
                })
                .count() as u64,
            Err(_) => 0,
        }
    }

    fn degrade(&mut self, reason: String) {
        if !self.degraded {
            logging::error!(self.log, "spool degraded"; "reason" => &reason);
        }
        self.degraded = true;
        self.failure_reason = reason;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(topic: &str) -> SpoolRecord {
        SpoolRecord {
            topic: topic.to_string(),
            payload: b"payload".to_vec(),
            qos: 0,
            retain: false,
            response_topic: Some("br/reply".to_string()),
            correlation_data: Some(vec![1, 2, 3]),
            user_properties: vec![("bridge-pin".to_string(), "7".to_string())],
        }
    }

    #[test]
    fn test_store_and_drain_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut spool = Spool::new(dir.path().to_path_buf(), None);

        assert!(spool.store(&record("br/a")));
        assert!(spool.store(&record("br/b")));
        assert!(spool.store(&record("br/c")));
        assert_eq!(spool.len(), 3);

        assert_eq!(spool.take_oldest().unwrap().topic, "br/a");
        assert_eq!(spool.take_oldest().unwrap().topic, "br/b");
        assert_eq!(spool.take_oldest().unwrap().topic, "br/c");
        assert!(spool.take_oldest().is_none());
        assert_eq!(spool.len(), 0);
    }

    #[test]
    fn test_record_roundtrip_preserves_binary_fields() {
        let original = record("br/binary");
        let encoded = serde_json::to_string(&original).unwrap();

        // Binary payloads must not appear raw inside the JSON.
        assert!(!encoded.contains("payload\":\"payload"));

        let decoded: SpoolRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_survives_restart() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut spool = Spool::new(dir.path().to_path_buf(), None);
            spool.store(&record("br/persisted"));
        }

        let mut spool = Spool::new(dir.path().to_path_buf(), None);
        assert_eq!(spool.len(), 1);
        assert_eq!(spool.take_oldest().unwrap().topic, "br/persisted");
    }

    #[test]
    fn test_degrades_on_unusable_dir() {
        // A file where the directory should be.
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("spool");
        fs::write(&blocked, b"not a directory").unwrap();

        let mut spool = Spool::new(blocked, None);

        assert!(spool.is_degraded());
        assert!(!spool.failure_reason().is_empty());
        assert!(!spool.store(&record("br/lost")));
        assert!(spool.take_oldest().is_none());
    }

    #[test]
    fn test_corrupt_record_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut spool = Spool::new(dir.path().to_path_buf(), None);

        fs::write(dir.path().join("0000000000000-000000.spool"), b"garbage").unwrap();
        spool.store(&record("br/good"));

        // The corrupt record sorts first, is dropped, the good one survives.
        let record = spool.take_oldest().unwrap();
        assert_eq!(record.topic, "br/good");
        assert!(!spool.is_degraded());
    }
}
