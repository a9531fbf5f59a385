mod encoding;

pub use encoding::{base64_bytes, decode_payload, encode_payload};
