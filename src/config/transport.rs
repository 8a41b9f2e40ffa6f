//! Cross-process configuration transport.
//!
//! A child process receives its configuration as a single command-line
//! argument: the JSON form of the payload, base64-encoded with the standard
//! alphabet.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ConfigError;

/// Serialize a payload to JSON and base64-encode it.
pub fn encode<T: Serialize>(payload: &T) -> Result<String, ConfigError> {
    let json_bytes = serde_json::to_vec(payload)?;
    Ok(BASE64.encode(json_bytes))
}

/// Decode a base64 argument and parse the JSON payload inside it.
pub fn decode<T: DeserializeOwned>(encoded: &str) -> Result<T, ConfigError> {
    let bytes = BASE64.decode(encoded.trim())?;
    let json = String::from_utf8(bytes)?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_is_base64_of_json() {
        let payload = json!({ "workgroup": { "workers": ["a"] } });
        let encoded = encode(&payload).expect("encode");

        let raw = BASE64.decode(&encoded).expect("valid base64");
        let parsed: serde_json::Value = serde_json::from_slice(&raw).expect("valid json");
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result: Result<serde_json::Value, _> = decode("not base64 at all!");
        assert!(matches!(result, Err(ConfigError::Base64(_))));

        let not_json = BASE64.encode("{ nope");
        let result: Result<serde_json::Value, _> = decode(&not_json);
        assert!(matches!(result, Err(ConfigError::Json(_))));
    }
}
