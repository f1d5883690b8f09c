//! # BitTorrent Handshake
//!
//! The handshake is the first message exchanged on a fresh peer connection,
//! before any length-prefixed traffic. It is a fixed-shape message:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte, length of the protocol string (19 for the standard protocol)
//! - **pstr**: protocol identifier, "BitTorrent protocol"
//! - **reserved**: 8 bytes, all zeros (extension bits are not negotiated here)
//! - **info_hash**: 20 bytes, SHA-1 of the torrent's info dictionary
//! - **peer_id**: 20 bytes identifying the peer
//!
//! With the standard protocol string the whole message is 68 bytes. The
//! info-hash is the only field a client must validate: a mismatch means the
//! remote is in a different swarm. The protocol string and peer id are
//! informational.

use anyhow::{anyhow, Result};

const PROTOCOL_ID: &str = "BitTorrent protocol";

/// Fixed-size tail of the handshake after the protocol string: 8 reserved
/// bytes, the info-hash and the peer id.
pub const HANDSHAKE_TAIL_LEN: usize = 8 + 20 + 20;

/// A decoded handshake message.
pub struct Handshake {
    /// Length of the protocol identifier string
    pub pstrlen: usize,
    /// Protocol identifier bytes
    pub pstr: Vec<u8>,
    /// 8 reserved bytes (all zeros here)
    pub reserved: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: Vec<u8>,
    /// 20-byte identifier of the peer
    pub peer_id: Vec<u8>,
}

impl Handshake {
    /// Build a handshake with the standard protocol string and zeroed
    /// reserved bytes.
    ///
    /// # Arguments
    ///
    /// * `peer_id` - 20-byte identifier of this client.
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent's info dictionary.
    ///
    pub fn new(peer_id: Vec<u8>, info_hash: Vec<u8>) -> Self {
        let pstr = String::from(PROTOCOL_ID).into_bytes();
        let pstrlen = pstr.len();
        let reserved: Vec<u8> = vec![0; 8];

        Handshake {
            pstrlen,
            pstr,
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Serialize the handshake for transmission.
    ///
    /// Fields are concatenated in wire order, giving `1 + pstrlen + 48`
    /// bytes (68 for the standard protocol string).
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut serialized: Vec<u8> = Vec::with_capacity(1 + self.pstrlen + HANDSHAKE_TAIL_LEN);

        serialized.push(self.pstrlen as u8);
        serialized.extend_from_slice(&self.pstr);
        serialized.extend_from_slice(&self.reserved);
        serialized.extend_from_slice(&self.info_hash);
        serialized.extend_from_slice(&self.peer_id);

        Ok(serialized)
    }
}

/// Deserialize a received handshake.
///
/// # Arguments
///
/// * `buf` - The handshake bytes following the `pstrlen` byte, which the
///   caller has already consumed to size this buffer.
/// * `pstrlen` - Length of the protocol string.
///
pub fn deserialize_handshake(buf: &[u8], pstrlen: usize) -> Result<Handshake> {
    if buf.len() < pstrlen + HANDSHAKE_TAIL_LEN {
        return Err(anyhow!("handshake received from peer is truncated"));
    }

    let pstr = buf[0..pstrlen].to_vec();
    let reserved = buf[pstrlen..(pstrlen + 8)].to_vec();
    let info_hash = buf[(pstrlen + 8)..(pstrlen + 8 + 20)].to_vec();
    let peer_id = buf[(pstrlen + 8 + 20)..(pstrlen + HANDSHAKE_TAIL_LEN)].to_vec();

    Ok(Handshake {
        pstrlen,
        pstr,
        reserved,
        info_hash,
        peer_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_standard_handshake() {
        let info_hash = vec![0xAA; 20];
        let peer_id = vec![0xBB; 20];
        let serialized = Handshake::new(peer_id, info_hash).serialize().unwrap();

        assert_eq!(serialized.len(), 68);
        assert_eq!(serialized[0], 19);
        assert_eq!(&serialized[1..20], b"BitTorrent protocol");
        assert_eq!(&serialized[20..28], &[0; 8]);
        assert_eq!(&serialized[28..48], &[0xAA; 20]);
        assert_eq!(&serialized[48..68], &[0xBB; 20]);
    }

    #[test]
    fn roundtrip_handshake() {
        let info_hash: Vec<u8> = (0..20).collect();
        let peer_id: Vec<u8> = (20..40).collect();
        let handshake = Handshake::new(peer_id.clone(), info_hash.clone());

        let serialized = handshake.serialize().unwrap();
        let pstrlen = serialized[0] as usize;
        let deserialized = deserialize_handshake(&serialized[1..], pstrlen).unwrap();

        assert_eq!(deserialized.pstr, b"BitTorrent protocol");
        assert_eq!(deserialized.info_hash, info_hash);
        assert_eq!(deserialized.peer_id, peer_id);
    }

    #[test]
    fn deserialize_truncated_handshake_fails() {
        let buf = vec![0; 30];
        assert!(deserialize_handshake(&buf, 19).is_err());
    }
}
