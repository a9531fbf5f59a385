use base64::{Engine as _, engine::general_purpose::STANDARD};

/// Encode raw socket bytes for a JSON frame
pub fn encode_payload(payload: &[u8]) -> String {
    STANDARD.encode(payload)
}

/// Decode a frame payload back to raw socket bytes
pub fn decode_payload(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(encoded)
}

/// `#[serde(with = "...")]` adapter carrying `Vec<u8>` as a base64 string
pub mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::encode_payload(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        super::decode_payload(&encoded).map_err(D::Error::custom)
    }
}
