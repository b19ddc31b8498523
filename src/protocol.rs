//! Single-byte-tagged messages exchanged with the remote peer.
//!
//! - Handshake: `0x00` (server → client, empty payload)
//! - Audio: `0x01` + one Ogg/Opus chunk (both directions)
//! - Text: `0x02` + UTF-8 fragment (server → client)

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
    Handshake = 0x00,
    Audio = 0x01,
    Text = 0x02,
}

impl TryFrom<u8> for MessageTag {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MessageTag::Handshake),
            0x01 => Ok(MessageTag::Audio),
            0x02 => Ok(MessageTag::Text),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

pub fn encode(tag: MessageTag, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(payload.len() + 1);
    message.push(tag as u8);
    message.extend_from_slice(payload);
    message
}

/// Split a raw message into its tag and payload. The payload borrows from
/// `data` and is empty for a one-byte message.
pub fn decode(data: &[u8]) -> Result<(MessageTag, &[u8]), ProtocolError> {
    let (&first, payload) = data.split_first().ok_or(ProtocolError::Empty)?;
    let tag = MessageTag::try_from(first)?;
    Ok((tag, payload))
}
