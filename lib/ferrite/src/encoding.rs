/// Base64 helpers shared by the config and spool layers. The serde entry
/// points are meant for `#[serde(serialize_with, deserialize_with)]` fields
/// that carry binary data inside JSON or TOML documents.
pub mod base64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[inline]
    pub fn encode<T: AsRef<[u8]>>(data: T) -> String {
        ::base64::encode(data)
    }

    #[inline]
    pub fn decode<T: AsRef<[u8]>>(data: T) -> Result<Vec<u8>, ::base64::DecodeError> {
        ::base64::decode(data)
    }

    pub fn serialize<T, S>(data: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = <&str>::deserialize(deserializer)?;
        decode(raw).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::base64;

    #[test]
    fn test_roundtrip() {
        let data = [0u8, 1, 2, 254, 255];
        let encoded = base64::encode(&data);
        assert_eq!(base64::decode(&encoded).unwrap(), &data);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(base64::decode("!!not-base64!!").is_err());
    }
}
