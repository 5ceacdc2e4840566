use hashbrown::HashMap;

/// The key/value store resident on the MPU. Both the MCU (over the wire) and
/// MQTT callers read and write the same map; a get never touches the wire.
pub struct Datastore {
    map: HashMap<String, Vec<u8>>,
}

impl Datastore {
    pub fn new() -> Datastore {
        Datastore { map: HashMap::new() }
    }

    /// Idempotent update.
    pub fn put(&mut self, key: &str, value: &[u8]) {
        self.map.insert(key.to_string(), value.to_vec());
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.map.get(key).map(|value| value.as_slice())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
