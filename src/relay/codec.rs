// Payloads cross the JSON API as standard base64

use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::RelayError;

pub fn decode_payload(field: &str, encoded: &str) -> Result<Vec<u8>, RelayError> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| RelayError::InvalidEncoding(format!("{} is not valid base64: {}", field, e)))
}

/// Decode an optional payload; an absent or empty payload means "no data"
pub fn decode_optional(field: &str, encoded: Option<&str>) -> Result<Option<Vec<u8>>, RelayError> {
    match encoded.map(str::trim).filter(|s| !s.is_empty()) {
        Some(encoded) => decode_payload(field, encoded).map(|bytes| Some(bytes).filter(|b| !b.is_empty())),
        None => Ok(None),
    }
}

pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
