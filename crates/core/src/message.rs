//! Incoming workload-inventory messages.
//!
//! Wire format:
//!
//! ```json
//! { "imageCount": 2, "images": { "sha256:aa": {}, "sha256:bb": {} } }
//! ```
//!
//! `images` is required and must contain at least one digest. Unknown
//! attributes are ignored.

use serde::Deserialize;
use serde_json::value::RawValue;
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Error message when the `images` attribute is absent or null.
pub const MISSING_DIGESTS: &str = "missing required attribute 'images'";

/// Error message when the `images` attribute is an empty object.
pub const EMPTY_DIGESTS: &str = "received message does not contain any digest";

/// Digest identifier mapped to its opaque per-image payload.
pub type DigestMap = HashMap<String, Box<RawValue>>;

/// Deserialized message consumed from the incoming topic.
#[derive(Debug, Deserialize)]
pub struct IncomingEvent {
    /// Number of images the producer claims to have sent.
    #[serde(rename = "imageCount", default)]
    pub image_count: i64,
    #[serde(rename = "images", default)]
    pub digests: Option<DigestMap>,
    #[serde(default)]
    pub namespaces: Option<Box<RawValue>>,
}

impl IncomingEvent {
    /// Number of digests carried by the event.
    pub fn digest_count(&self) -> usize {
        self.digests.as_ref().map_or(0, HashMap::len)
    }
}

/// Parses a raw message value and verifies all required attributes.
pub fn parse_message(value: &[u8]) -> Result<IncomingEvent> {
    let event: IncomingEvent = serde_json::from_slice(value)?;

    match event.digests.as_ref() {
        None => Err(Error::validation(MISSING_DIGESTS)),
        Some(digests) if digests.is_empty() => Err(Error::validation(EMPTY_DIGESTS)),
        Some(_) => Ok(event),
    }
}

/// Collects the digest identifiers of an event.
///
/// The result has one entry per key. Ordering follows the map and is not
/// stable between calls.
pub fn extract_digests(digests: &DigestMap) -> Vec<String> {
    digests.keys().cloned().collect()
}
