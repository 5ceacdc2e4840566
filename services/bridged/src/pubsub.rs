use crate::topics::TopicRequest;

pub const PROP_REQUEST_TOPIC: &str = "bridge-request-topic";
pub const PROP_PIN: &str = "bridge-pin";
pub const PROP_DATASTORE_KEY: &str = "bridge-datastore-key";
pub const PROP_FILE_PATH: &str = "bridge-file-path";
pub const PROP_PROCESS_PID: &str = "bridge-process-pid";
pub const PROP_STATUS: &str = "bridge-status";
pub const PROP_ERROR: &str = "bridge-error";
pub const PROP_SNAPSHOT: &str = "bridge-snapshot";
pub const PROP_SPOOL: &str = "bridge-spool";
pub const PROP_WATCHDOG_ENABLED: &str = "bridge-watchdog-enabled";
pub const PROP_WATCHDOG_INTERVAL: &str = "bridge-watchdog-interval";

pub const ERR_TOPIC_FORBIDDEN: &str = "topic-action-forbidden";
pub const ERR_DATASTORE_MISS: &str = "datastore-miss";
pub const ERR_PENDING_PIN_OVERFLOW: &str = "pending-pin-overflow";
pub const ERR_UNKNOWN_PID: &str = "unknown-pid";
pub const ERR_RUN_PAYLOAD_TOO_LARGE: &str = "process_run_payload_too_large";
pub const ERR_REQUEST_TIMEOUT: &str = "request-timeout";
pub const ERR_LINK_RESET: &str = "link-reset";

/// Caller identity carried from a request to its response: the MQTT v5
/// response topic and correlation data, preserved verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correlation {
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
}

impl Correlation {
    pub fn is_empty(&self) -> bool {
        self.response_topic.is_none() && self.correlation_data.is_none()
    }
}

/// An outbound MQTT publication. The topic is relative to the configured
/// prefix; the publisher prepends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
    pub correlation: Correlation,
    pub properties: Vec<(String, String)>,
}

impl Publication {
    pub fn new<T: Into<String>, P: Into<Vec<u8>>>(topic: T, payload: P) -> Publication {
        Publication {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
            correlation: Correlation::default(),
            properties: Vec::new(),
        }
    }

    pub fn retained(mut self) -> Publication {
        self.retain = true;
        self
    }

    pub fn with_correlation(mut self, correlation: Correlation) -> Publication {
        self.correlation = correlation;
        self
    }

    pub fn with_property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Publication {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// A per-request error publication on the status topic, with the
    /// caller's correlation preserved.
    pub fn request_error(reason: &str, correlation: Correlation) -> Publication {
        Publication::new("system/status", Vec::new())
            .with_property(PROP_ERROR, reason)
            .with_correlation(correlation)
    }
}

/// An authorised-or-not inbound MQTT request, parsed from its topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub request: TopicRequest,
    pub payload: Vec<u8>,
    pub correlation: Correlation,
}
