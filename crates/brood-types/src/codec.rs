//! Sentinel-terminated JSON framing.
//!
//! A frame is one JSON object carrying a `id` field plus the payload's own
//! fields, terminated by [`SENTINEL`]. Decoding an encoded frame yields the
//! original `(id, payload)` pair. Because serde_json escapes control
//! characters inside strings, the sentinel can never appear in a frame body,
//! so frames survive an arbitrary byte-oriented pipe unescaped.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::SENTINEL;

#[derive(Serialize, Deserialize)]
struct Framed<T> {
    id: u64,
    #[serde(flatten)]
    body: T,
}

/// Encode one frame, sentinel included.
///
/// The body must serialize to a JSON object (both wire payloads do).
pub fn encode<T: Serialize>(id: u64, body: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut frame = serde_json::to_vec(&Framed { id, body })?;
    frame.push(SENTINEL);
    Ok(frame)
}

/// Decode one frame; a trailing sentinel is accepted and stripped.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<(u64, T), serde_json::Error> {
    let line = match frame.split_last() {
        Some((&last, rest)) if last == SENTINEL => rest,
        _ => frame,
    };
    let framed: Framed<T> = serde_json::from_slice(line)?;
    Ok((framed.id, framed.body))
}
