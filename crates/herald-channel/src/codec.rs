use herald_core::PublicationEvent;

use crate::error::{ChannelError, Result};

pub fn encode_event(event: &PublicationEvent) -> Result<Vec<u8>> {
    serde_json::to_vec(event).map_err(|e| ChannelError::Malformed(e.to_string()))
}

/// Decode a payload. Any missing field or non-numeric identifier rejects the
/// whole message.
pub fn decode_event(payload: &[u8]) -> Result<PublicationEvent> {
    serde_json::from_slice(payload).map_err(|e| ChannelError::Malformed(e.to_string()))
}
