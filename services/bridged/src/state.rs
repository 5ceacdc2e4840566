use ferrite::time::timestamp_millis;
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Process-wide mutable telemetry. Created at daemon start, mutated only on
/// the scheduler thread, exported as consistent snapshots.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    pub link_state: String,
    pub handshake_successes: u64,
    pub handshake_failures: u64,
    pub duplicate_handshakes: u64,
    pub link_resets: u64,
    pub last_mcu_version: String,
    pub session_tag_hex: String,

    pub serial_crc_errors: u64,
    pub serial_malformed_errors: u64,
    pub serial_overflow_errors: u64,

    pub mqtt_connected: bool,
    pub mqtt_queue_size: u64,
    pub mqtt_queue_limit: u64,
    pub mqtt_dropped_messages: u64,

    pub mqtt_spool_enabled: bool,
    pub mqtt_spool_degraded: bool,
    pub mqtt_spool_failure_reason: String,
    pub mqtt_spooled_records: u64,

    pub console_queue_size: u64,
    pub console_queue_limit: u64,
    pub console_dropped_chunks: u64,
    pub console_rx_bytes: u64,
    pub console_tx_bytes: u64,

    pub mailbox_queue_size: u64,
    pub mailbox_out_queue_size: u64,
    pub mailbox_truncated_bytes: u64,

    pub file_storage_bytes_used: u64,
    pub file_write_limit_rejections: u64,
    pub file_storage_limit_rejections: u64,

    pub pending_pin_requests: u64,
    pub pending_pin_request_limit: u64,
    pub pending_pin_overflows: u64,

    pub digital_writes: u64,
    pub digital_reads: u64,
    pub analog_writes: u64,
    pub analog_reads: u64,

    pub process_slots_used: u64,
    pub process_slots_limit: u64,
    pub process_rejections: u64,

    pub topic_rejections: u64,

    pub watchdog_enabled: bool,
    pub watchdog_interval_ms: u64,
    pub watchdog_last_heartbeat_ms: u64,

    pub started_at_ms: u64,
    pub snapshot_sequence: u64,
}

impl RuntimeState {
    pub fn new() -> RuntimeState {
        RuntimeState {
            link_state: "UNSYNCHRONIZED".to_string(),
            handshake_successes: 0,
            handshake_failures: 0,
            duplicate_handshakes: 0,
            link_resets: 0,
            last_mcu_version: String::new(),
            session_tag_hex: String::new(),
            serial_crc_errors: 0,
            serial_malformed_errors: 0,
            serial_overflow_errors: 0,
            mqtt_connected: false,
            mqtt_queue_size: 0,
            mqtt_queue_limit: 0,
            mqtt_dropped_messages: 0,
            mqtt_spool_enabled: true,
            mqtt_spool_degraded: false,
            mqtt_spool_failure_reason: String::new(),
            mqtt_spooled_records: 0,
            console_queue_size: 0,
            console_queue_limit: 0,
            console_dropped_chunks: 0,
            console_rx_bytes: 0,
            console_tx_bytes: 0,
            mailbox_queue_size: 0,
            mailbox_out_queue_size: 0,
            mailbox_truncated_bytes: 0,
            file_storage_bytes_used: 0,
            file_write_limit_rejections: 0,
            file_storage_limit_rejections: 0,
            pending_pin_requests: 0,
            pending_pin_request_limit: 0,
            pending_pin_overflows: 0,
            digital_writes: 0,
            digital_reads: 0,
            analog_writes: 0,
            analog_reads: 0,
            process_slots_used: 0,
            process_slots_limit: 0,
            process_rejections: 0,
            topic_rejections: 0,
            watchdog_enabled: false,
            watchdog_interval_ms: 0,
            watchdog_last_heartbeat_ms: 0,
            started_at_ms: timestamp_millis(),
            snapshot_sequence: 0,
        }
    }

    #[inline]
    pub fn serial_decode_errors(&self) -> u64 {
        self.serial_crc_errors + self.serial_malformed_errors + self.serial_overflow_errors
    }

    #[inline]
    pub fn uptime_secs(&self) -> u64 {
        timestamp_millis().saturating_sub(self.started_at_ms) / 1000
    }

    /// The full JSON snapshot. The sequence number increments per export so
    /// consumers can detect missed snapshots.
    pub fn snapshot_json(&mut self) -> Value {
        self.snapshot_sequence += 1;

        json!({
            "snapshot_sequence": self.snapshot_sequence,
            "generated_at": chrono::Utc::now().to_rfc3339(),
            "uptime_secs": self.uptime_secs(),
            "link": {
                "link_state": self.link_state,
                "handshake_successes": self.handshake_successes,
                "handshake_failures": self.handshake_failures,
                "duplicate_handshakes": self.duplicate_handshakes,
                "link_resets": self.link_resets,
                "last_mcu_version": self.last_mcu_version,
                "session_tag": self.session_tag_hex,
            },
            "serial": {
                "serial_decode_errors": self.serial_decode_errors(),
                "serial_crc_errors": self.serial_crc_errors,
                "serial_malformed_errors": self.serial_malformed_errors,
                "serial_overflow_errors": self.serial_overflow_errors,
            },
            "mqtt": {
                "mqtt_connected": self.mqtt_connected,
                "mqtt_queue_size": self.mqtt_queue_size,
                "mqtt_queue_limit": self.mqtt_queue_limit,
                "mqtt_dropped_messages": self.mqtt_dropped_messages,
                "mqtt_spool_enabled": self.mqtt_spool_enabled,
                "mqtt_spool_degraded": self.mqtt_spool_degraded,
                "mqtt_spool_failure_reason": self.mqtt_spool_failure_reason,
                "mqtt_spooled_records": self.mqtt_spooled_records,
            },
            "console": {
                "console_queue_size": self.console_queue_size,
                "console_queue_limit": self.console_queue_limit,
                "console_dropped_chunks": self.console_dropped_chunks,
                "console_rx_bytes": self.console_rx_bytes,
                "console_tx_bytes": self.console_tx_bytes,
            },
            "mailbox": {
                "mailbox_queue_size": self.mailbox_queue_size,
                "mailbox_out_queue_size": self.mailbox_out_queue_size,
                "mailbox_truncated_bytes": self.mailbox_truncated_bytes,
            },
            "files": {
                "file_storage_bytes_used": self.file_storage_bytes_used,
                "file_write_limit_rejections": self.file_write_limit_rejections,
                "file_storage_limit_rejections": self.file_storage_limit_rejections,
            },
            "gpio": {
                "pending_pin_requests": self.pending_pin_requests,
                "pending_pin_request_limit": self.pending_pin_request_limit,
                "pending_pin_overflows": self.pending_pin_overflows,
                "digital_writes": self.digital_writes,
                "digital_reads": self.digital_reads,
                "analog_writes": self.analog_writes,
                "analog_reads": self.analog_reads,
            },
            "process": {
                "process_slots_used": self.process_slots_used,
                "process_slots_limit": self.process_slots_limit,
                "process_rejections": self.process_rejections,
            },
            "authorization": {
                "topic_rejections": self.topic_rejections,
            },
            "watchdog": {
                "watchdog_enabled": self.watchdog_enabled,
                "watchdog_interval_ms": self.watchdog_interval_ms,
                "watchdog_last_heartbeat_ms": self.watchdog_last_heartbeat_ms,
            },
        })
    }

    /// Prometheus text exposition (format version 0.0.4). Numeric values are
    /// `bridge_<key>` gauges; strings surface as `bridge_info` label pairs.
    pub fn prometheus_text(&self) -> String {
        let mut out = String::with_capacity(2048);

        let gauges: Vec<(&str, u64)> = vec![
            ("handshake_successes", self.handshake_successes),
            ("handshake_failures", self.handshake_failures),
            ("duplicate_handshakes", self.duplicate_handshakes),
            ("link_resets", self.link_resets),
            ("serial_decode_errors", self.serial_decode_errors()),
            ("serial_crc_errors", self.serial_crc_errors),
            ("serial_malformed_errors", self.serial_malformed_errors),
            ("serial_overflow_errors", self.serial_overflow_errors),
            ("mqtt_connected", self.mqtt_connected as u64),
            ("mqtt_queue_size", self.mqtt_queue_size),
            ("mqtt_queue_limit", self.mqtt_queue_limit),
            ("mqtt_dropped_messages", self.mqtt_dropped_messages),
            ("mqtt_spool_enabled", self.mqtt_spool_enabled as u64),
            ("mqtt_spool_degraded", self.mqtt_spool_degraded as u64),
            ("mqtt_spooled_records", self.mqtt_spooled_records),
            ("console_queue_size", self.console_queue_size),
            ("console_queue_limit", self.console_queue_limit),
            ("console_dropped_chunks", self.console_dropped_chunks),
            ("console_rx_bytes", self.console_rx_bytes),
            ("console_tx_bytes", self.console_tx_bytes),
            ("mailbox_queue_size", self.mailbox_queue_size),
            ("mailbox_out_queue_size", self.mailbox_out_queue_size),
            ("mailbox_truncated_bytes", self.mailbox_truncated_bytes),
            ("file_storage_bytes_used", self.file_storage_bytes_used),
            ("file_write_limit_rejections", self.file_write_limit_rejections),
            (
                "file_storage_limit_rejections",
                self.file_storage_limit_rejections,
            ),
            ("pending_pin_requests", self.pending_pin_requests),
            ("pending_pin_request_limit", self.pending_pin_request_limit),
            ("pending_pin_overflows", self.pending_pin_overflows),
            ("digital_writes", self.digital_writes),
            ("digital_reads", self.digital_reads),
            ("analog_writes", self.analog_writes),
            ("analog_reads", self.analog_reads),
            ("process_slots_used", self.process_slots_used),
            ("process_slots_limit", self.process_slots_limit),
            ("process_rejections", self.process_rejections),
            ("topic_rejections", self.topic_rejections),
            ("watchdog_enabled", self.watchdog_enabled as u64),
            ("watchdog_interval_ms", self.watchdog_interval_ms),
            ("watchdog_last_heartbeat_ms", self.watchdog_last_heartbeat_ms),
            ("uptime_secs", self.uptime_secs()),
        ];

        for (key, value) in gauges {
            out.push_str("# TYPE bridge_");
            out.push_str(key);
            out.push_str(" gauge\nbridge_");
            out.push_str(key);
            out.push(' ');
            out.push_str(&value.to_string());
            out.push('\n');
        }

        let infos: Vec<(&str, &str)> = vec![
            ("link_state", &self.link_state),
            ("last_mcu_version", &self.last_mcu_version),
            ("mqtt_spool_failure_reason", &self.mqtt_spool_failure_reason),
            ("session_tag", &self.session_tag_hex),
        ];

        out.push_str("# TYPE bridge_info gauge\n");
        for (key, value) in infos {
            out.push_str(&format!(
                "bridge_info{{key=\"{}\",value=\"{}\"}} 1\n",
                key,
                value.replace('\\', "\\\\").replace('"', "\\\"")
            ));
        }

        out
    }

    /// Writes the JSON snapshot atomically: temp file in the same directory,
    /// then rename over the target.
    pub fn write_snapshot<P: AsRef<Path>>(&mut self, path: P) -> std::io::Result<()> {
        let path = path.as_ref();
        let snapshot = serde_json::to_vec_pretty(&self.snapshot_json())?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&snapshot)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)
    }
}

/// Hex rendering for session tags and similar short binary values.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_sequence_increments() {
        let mut state = RuntimeState::new();

        let first = state.snapshot_json();
        let second = state.snapshot_json();

        assert_eq!(first["snapshot_sequence"], 1);
        assert_eq!(second["snapshot_sequence"], 2);
    }

    #[test]
    fn test_snapshot_carries_counters() {
        let mut state = RuntimeState::new();
        state.serial_crc_errors = 3;
        state.serial_malformed_errors = 2;
        state.pending_pin_overflows = 1;

        let snapshot = state.snapshot_json();

        assert_eq!(snapshot["serial"]["serial_crc_errors"], 3);
        assert_eq!(snapshot["serial"]["serial_decode_errors"], 5);
        assert_eq!(snapshot["gpio"]["pending_pin_overflows"], 1);
    }

    #[test]
    fn test_prometheus_format() {
        let mut state = RuntimeState::new();
        state.link_state = "IDLE".to_string();
        state.mqtt_dropped_messages = 7;

        let text = state.prometheus_text();

        assert!(text.contains("bridge_mqtt_dropped_messages 7\n"));
        assert!(text.contains("bridge_info{key=\"link_state\",value=\"IDLE\"} 1\n"));
        assert!(text.contains("# TYPE bridge_mqtt_dropped_messages gauge\n"));
    }

    #[test]
    fn test_prometheus_escapes_quotes() {
        let mut state = RuntimeState::new();
        state.mqtt_spool_failure_reason = "disk \"full\"".to_string();

        let text = state.prometheus_text();
        assert!(text.contains("value=\"disk \\\"full\\\"\""));
    }

    #[test]
    fn test_atomic_snapshot_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");

        let mut state = RuntimeState::new();
        state.write_snapshot(&path).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["snapshot_sequence"], 1);

        // No temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x00, 0xab, 0xff]), "00abff");
    }
}
