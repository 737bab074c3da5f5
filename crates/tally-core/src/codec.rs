//! Descriptor string codec.
//!
//! Descriptors are stored as a JSON array of numbers, written and read
//! with `serde_json`. Older rows written as a bare comma-separated list
//! (no brackets) are still accepted on decode.

use crate::types::{DescriptorError, FaceDescriptor};
use thiserror::Error;

/// Per-component tolerance, relative to the component's magnitude (at
/// least 1), that callers may assume for a round trip.
pub const ROUND_TRIP_TOLERANCE: f32 = 1e-6;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("descriptor string is empty")]
    EmptyInput,
    #[error("descriptor is not a JSON number array: {0}")]
    Json(#[from] serde_json::Error),
    #[error("descriptor component {index} is not a number: {raw:?}")]
    InvalidComponent { index: usize, raw: String },
    #[error("invalid descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
}

/// Serialize a descriptor to its stored string form.
pub fn encode(descriptor: &FaceDescriptor) -> Result<String, CodecError> {
    Ok(serde_json::to_string(descriptor.values())?)
}

/// Parse a stored descriptor string.
pub fn decode(raw: &str) -> Result<FaceDescriptor, CodecError> {
    let trimmed = raw.trim();
    let values = if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<f32>>(trimmed)?
    } else {
        decode_legacy(trimmed)?
    };
    if values.is_empty() {
        return Err(CodecError::EmptyInput);
    }
    Ok(FaceDescriptor::new(values)?)
}

/// Comma-separated components without brackets.
fn decode_legacy(body: &str) -> Result<Vec<f32>, CodecError> {
    if body.is_empty() {
        return Err(CodecError::EmptyInput);
    }
    body.split(',')
        .enumerate()
        .map(|(index, part)| {
            let part = part.trim();
            part.parse::<f32>().map_err(|_| CodecError::InvalidComponent {
                index,
                raw: part.to_string(),
            })
        })
        .collect()
}
