//! Wire types exchanged with task-runner workers.
//!
//! Requests and responses are JSON objects with `camelCase` field names.
//! Opaque payloads (`input`, `output`) are carried as base64 strings.

pub mod request;
pub mod response;

pub use request::*;
pub use response::*;

/// Serde adapter for opaque byte payloads encoded as base64 strings.
pub(crate) mod base64_bytes {
    use base64::prelude::BASE64_STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
