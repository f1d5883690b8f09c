//! # Peer Wire Messages
//!
//! Message types and framing for the BitTorrent peer wire protocol. After
//! the handshake, every message exchanged with a peer uses this layout:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length prefix**: 4 bytes (big-endian u32), counts the ID byte plus the payload
//! - **Message ID**: 1 byte identifying the message type
//! - **Payload**: `length - 1` bytes of message-specific data
//!
//! ## Message Types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index (u32) |
//! | 5 | BITFIELD | piece availability bitmap |
//! | 6 | REQUEST | index, begin, length (u32 each) |
//! | 7 | PIECE | index, begin (u32 each), then block bytes |
//! | 8 | CANCEL | same shape as REQUEST |
//!
//! ## Keep-Alive
//!
//! A frame whose length prefix is 0 carries no ID and no payload. Peers send
//! it periodically so idle connections are not reaped. Since the zero-length
//! frame has no ID byte on the wire, the decoder maps it to the reserved
//! [`MESSAGE_KEEPALIVE`] sentinel.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, WriteBytesExt};

type MessageId = u8;
type MessagePayload = Vec<u8>;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
#[allow(dead_code)]
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
#[allow(dead_code)]
pub const MESSAGE_CANCEL: MessageId = 8;
/// Sentinel for a zero-length frame (keep-alive has no ID on the wire).
pub const MESSAGE_KEEPALIVE: MessageId = 255;

/// A single peer wire message, decoded from or ready for the wire.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: MessagePayload,
}

impl Message {
    /// Build a message without a payload.
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a message with a payload.
    pub fn new_with_payload(id: MessageId, payload: MessagePayload) -> Self {
        Message { id, payload }
    }

    /// Build a REQUEST message for one block of a piece.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index.
    /// * `begin` - Byte offset of the block within the piece.
    /// * `length` - Number of bytes requested.
    ///
    pub fn request(index: u32, begin: u32, length: u32) -> Result<Self> {
        let mut payload: Vec<u8> = vec![];
        payload.write_u32::<BigEndian>(index)?;
        payload.write_u32::<BigEndian>(begin)?;
        payload.write_u32::<BigEndian>(length)?;

        Ok(Message::new_with_payload(MESSAGE_REQUEST, payload))
    }

    /// Build a HAVE message announcing a completed piece.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index.
    ///
    pub fn have(index: u32) -> Result<Self> {
        let mut payload: Vec<u8> = vec![];
        payload.write_u32::<BigEndian>(index)?;

        Ok(Message::new_with_payload(MESSAGE_HAVE, payload))
    }

    /// Serialize the message into its wire frame.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        // Length prefix counts the id byte plus the payload
        let message_len = 1 + self.payload.len();

        let mut serialized: Vec<u8> = Vec::with_capacity(4 + message_len);
        serialized.write_u32::<BigEndian>(message_len as u32)?;
        serialized.push(self.id);
        serialized.extend_from_slice(&self.payload);

        Ok(serialized)
    }
}

/// Deserialize a message body (the bytes following the length prefix).
///
/// # Arguments
///
/// * `message_buf` - The message body, id byte first.
///
pub fn deserialize_message(message_buf: &[u8]) -> Result<Message> {
    let Some((&id, payload)) = message_buf.split_first() else {
        return Err(anyhow!("cannot deserialize an empty message body"));
    };

    Ok(Message::new_with_payload(id, payload.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_request_message() {
        let message = Message::request(3, 16384, 16384).unwrap();
        let serialized = message.serialize().unwrap();

        assert_eq!(
            serialized,
            [
                0x00, 0x00, 0x00, 0x0D, // length prefix: 13
                0x06, // id: REQUEST
                0x00, 0x00, 0x00, 0x03, // index: 3
                0x00, 0x00, 0x40, 0x00, // begin: 16384
                0x00, 0x00, 0x40, 0x00, // length: 16384
            ]
        );
    }

    #[test]
    fn serialize_message_without_payload() {
        let message = Message::new(MESSAGE_INTERESTED);
        let serialized = message.serialize().unwrap();

        assert_eq!(serialized, [0x00, 0x00, 0x00, 0x01, 0x02]);
    }

    #[test]
    fn roundtrip_message_with_payload() {
        let message = Message::new_with_payload(MESSAGE_PIECE, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let serialized = message.serialize().unwrap();

        // Skip the 4-byte length prefix, as the session read loop does
        let deserialized = deserialize_message(&serialized[4..]).unwrap();
        assert_eq!(deserialized, message);
    }

    #[test]
    fn deserialize_empty_body_fails() {
        assert!(deserialize_message(&[]).is_err());
    }

    #[test]
    fn serialize_have_message() {
        let message = Message::have(42).unwrap();
        let serialized = message.serialize().unwrap();

        assert_eq!(
            serialized,
            [0x00, 0x00, 0x00, 0x05, 0x04, 0x00, 0x00, 0x00, 0x2A]
        );
    }
}
