//! # Peer Session
//!
//! The client-side state of one connection to a remote peer: connection
//! setup, handshake, message framing, and the small amount of protocol state
//! a leecher needs (the remote's bitfield and whether it is choking us).
//!
//! ## Session Establishment
//!
//! 1. **Dial**: TCP connect with a 5 second timeout
//! 2. **Handshake**: exchanged under a 3 second deadline; the remote's
//!    info-hash must match ours
//! 3. **Bitfield**: the first framed message must be a BITFIELD, read under
//!    a 5 second deadline
//!
//! Any failure along the way drops the peer. After establishment the
//! deadlines are cleared; the per-piece download loop installs its own.
//!
//! ## Stream Abstraction
//!
//! The session does not own a TCP socket directly. It holds any
//! [`PeerStream`], a byte stream with deadline control, and forwards
//! deadline calls to it. Production code connects a `TcpStream`; tests run
//! the same session logic over an in-memory stream.
//!
//! ## Bitfield Encoding
//!
//! Each byte of the bitfield covers 8 pieces, most significant bit first:
//! bit 7 of byte 0 is piece 0, bit 0 of byte 0 is piece 7, and so on.
//! Out-of-range indices are treated as absent and ignored on update, since
//! real swarms occasionally deliver stale HAVE announcements.

use crate::handshake::*;
use crate::message::*;
use crate::peer::*;
use crate::piece::*;

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

use std::io::{Cursor, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

/// TCP connect timeout.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline covering the handshake round trip.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
/// Deadline covering the initial bitfield read.
const BITFIELD_TIMEOUT: Duration = Duration::from_secs(5);

/// A reliable bidirectional byte stream with deadline control.
///
/// This is the seam between the session logic and the transport. The
/// session forwards its deadline calls here, so the same code drives a real
/// socket in production and an in-memory buffer in tests.
pub trait PeerStream: Read + Write + Send {
    /// Set or clear the read and write deadline.
    fn set_deadline(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Tear the stream down. Errors are ignored; the stream is unusable
    /// afterwards either way.
    fn close(&mut self);
}

impl PeerStream for TcpStream {
    fn set_deadline(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.set_read_timeout(timeout).is_err() {
            return Err(anyhow!("could not set read timeout"));
        }
        if self.set_write_timeout(timeout).is_err() {
            return Err(anyhow!("could not set write timeout"));
        }

        Ok(())
    }

    fn close(&mut self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

/// Piece availability advertised by a peer, one bit per piece, MSB first
/// within each byte.
#[derive(Default, Debug, Clone)]
pub struct Bitfield {
    bits: Vec<u8>,
}

impl Bitfield {
    /// An empty bitfield, which reports every piece as absent.
    pub fn new() -> Bitfield {
        Bitfield::default()
    }

    /// Whether the bit at `index` is set. Out-of-range indices are absent.
    pub fn has(&self, index: u32) -> bool {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        if byte_index >= self.bits.len() {
            return false;
        }

        self.bits[byte_index] >> (7 - offset) & 1 != 0
    }

    /// Set the bit at `index`. Out-of-range indices are ignored.
    pub fn set(&mut self, index: u32) {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        if byte_index >= self.bits.len() {
            return;
        }

        self.bits[byte_index] |= 1 << (7 - offset);
    }
}

impl From<Vec<u8>> for Bitfield {
    fn from(bits: Vec<u8>) -> Bitfield {
        Bitfield { bits }
    }
}

/// The state of one peer connection, owned by a single worker.
pub struct Client<S: PeerStream> {
    /// The remote endpoint
    peer: Peer,
    /// 20-byte identifier of this client instance
    peer_id: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: Vec<u8>,
    /// Byte stream to the peer
    conn: S,
    /// Pieces the remote has advertised
    bitfield: Bitfield,
    /// Whether the remote is currently choking us
    choked: bool,
}

impl Client<TcpStream> {
    /// Dial a peer over TCP.
    ///
    /// # Arguments
    ///
    /// * `peer` - The endpoint to connect to.
    /// * `peer_id` - 20-byte identifier of this client.
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent's info dictionary.
    ///
    pub fn connect(peer: Peer, peer_id: Vec<u8>, info_hash: Vec<u8>) -> Result<Client<TcpStream>> {
        let peer_socket = SocketAddr::new(IpAddr::V4(peer.ip), peer.port);
        let conn = match TcpStream::connect_timeout(&peer_socket, DIAL_TIMEOUT) {
            Ok(conn) => conn,
            Err(_) => return Err(anyhow!("could not connect to peer")),
        };

        info!("Connected to peer {}", peer.id);

        Ok(Client::with_stream(conn, peer, peer_id, info_hash))
    }
}

impl<S: PeerStream> Client<S> {
    /// Wrap an already-established stream into a session.
    pub fn with_stream(conn: S, peer: Peer, peer_id: Vec<u8>, info_hash: Vec<u8>) -> Client<S> {
        Client {
            peer,
            peer_id,
            info_hash,
            conn,
            bitfield: Bitfield::new(),
            choked: true,
        }
    }

    /// Whether the remote is choking us. Requests are pointless while true.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Whether the remote has advertised piece `index`.
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has(index)
    }

    /// Forward a deadline change to the underlying stream.
    pub fn set_deadline(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.conn.set_deadline(timeout)
    }

    /// Close the underlying stream.
    pub fn close(&mut self) {
        self.conn.close()
    }

    /// Exchange handshakes with the peer.
    ///
    /// Ours is written first, then the remote's is read and validated. The
    /// whole exchange runs under a 3 second deadline, cleared on success.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, a zero-length protocol string, or an info-hash
    /// that differs from ours. The remote's protocol string and peer id are
    /// only logged.
    pub fn handshake_with_peer(&mut self) -> Result<()> {
        self.conn.set_deadline(Some(HANDSHAKE_TIMEOUT))?;

        // Send our handshake
        let handshake = Handshake::new(self.peer_id.clone(), self.info_hash.clone());
        let handshake_encoded: Vec<u8> = handshake.serialize()?;
        if self.conn.write_all(&handshake_encoded).is_err() {
            return Err(anyhow!("could not send handshake to peer"));
        }

        // Read the remote's
        let pstrlen: usize = self.read_handshake_len()?;
        let mut handshake_buf: Vec<u8> = vec![0; pstrlen + HANDSHAKE_TAIL_LEN];
        if self.conn.read_exact(&mut handshake_buf).is_err() {
            return Err(anyhow!("could not read handshake received from peer"));
        }

        let handshake_decoded: Handshake = deserialize_handshake(&handshake_buf, pstrlen)?;
        if handshake_decoded.info_hash != self.info_hash {
            return Err(anyhow!("handshake info hash mismatch"));
        }

        debug!(
            "Handshake with peer {}: protocol {:?}, remote id {:02x?}",
            self.peer.id,
            String::from_utf8_lossy(&handshake_decoded.pstr),
            handshake_decoded.peer_id
        );

        self.conn.set_deadline(None)?;

        Ok(())
    }

    /// Read the leading `pstrlen` byte of the remote's handshake.
    fn read_handshake_len(&mut self) -> Result<usize> {
        let mut buf = [0; 1];
        if self.conn.read_exact(&mut buf).is_err() {
            return Err(anyhow!(
                "could not read handshake length received from peer"
            ));
        }

        let pstrlen = buf[0];
        if pstrlen == 0 {
            return Err(anyhow!("invalid handshake length received from peer"));
        }

        Ok(pstrlen as usize)
    }

    /// Read the initial BITFIELD message.
    ///
    /// This must be the very first framed message after the handshake. A
    /// keep-alive or any other message id fails the session. Runs under a
    /// 5 second deadline, cleared on success.
    pub fn read_bitfield(&mut self) -> Result<()> {
        self.conn.set_deadline(Some(BITFIELD_TIMEOUT))?;

        let message: Message = self.read_message()?;
        if message.id != MESSAGE_BITFIELD {
            return Err(anyhow!(
                "expected MESSAGE_BITFIELD from peer, got id {}",
                message.id
            ));
        }

        info!("Receive MESSAGE_BITFIELD from peer {}", self.peer.id);

        self.bitfield = Bitfield::from(message.payload);
        self.conn.set_deadline(None)?;

        Ok(())
    }

    /// Read one framed message from the peer.
    ///
    /// A zero-length frame is returned as the keep-alive sentinel.
    pub fn read_message(&mut self) -> Result<Message> {
        let message_len: usize = self.read_message_len()?;

        if message_len == 0 {
            debug!("Receive KEEP_ALIVE from peer {}", self.peer.id);
            return Ok(Message::new(MESSAGE_KEEPALIVE));
        }

        let mut message_buf: Vec<u8> = vec![0; message_len];
        if self.conn.read_exact(&mut message_buf).is_err() {
            return Err(anyhow!("could not read message received from peer"));
        }

        deserialize_message(&message_buf)
    }

    /// Read the 4-byte big-endian length prefix of the next message.
    fn read_message_len(&mut self) -> Result<usize> {
        let mut buf = vec![0; 4];
        if self.conn.read_exact(&mut buf).is_err() {
            return Err(anyhow!("could not read message length received from peer"));
        }

        let mut cursor = Cursor::new(buf);
        let message_len = cursor.read_u32::<BigEndian>()?;

        Ok(message_len as usize)
    }

    /// Serialize and send one message.
    fn send_message(&mut self, message: &Message, name: &str) -> Result<()> {
        let message_encoded = message.serialize()?;

        debug!("Send {} to peer {}", name, self.peer.id);

        if self.conn.write_all(&message_encoded).is_err() {
            return Err(anyhow!("could not send {} to peer", name));
        }

        Ok(())
    }

    /// Tell the peer we want to download from it. Sent exactly once per
    /// session, right after the bitfield.
    pub fn send_interested(&mut self) -> Result<()> {
        self.send_message(&Message::new(MESSAGE_INTERESTED), "MESSAGE_INTERESTED")
    }

    /// Ask the peer for one block of a piece.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index.
    /// * `begin` - Byte offset of the block within the piece.
    /// * `length` - Number of bytes requested.
    ///
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        self.send_message(&Message::request(index, begin, length)?, "MESSAGE_REQUEST")
    }

    /// Announce a piece we completed. Purely informational for a leecher,
    /// but it keeps the swarm's availability accounting honest.
    pub fn send_have(&mut self, index: u32) -> Result<()> {
        self.send_message(&Message::have(index)?, "MESSAGE_HAVE")
    }

    /// Record that the peer choked us.
    pub fn read_choke(&mut self) {
        info!("Receive MESSAGE_CHOKE from peer {}", self.peer.id);
        self.choked = true
    }

    /// Record that the peer unchoked us.
    pub fn read_unchoke(&mut self) {
        info!("Receive MESSAGE_UNCHOKE from peer {}", self.peer.id);
        self.choked = false
    }

    /// Process a HAVE message by marking the piece in the peer's bitfield.
    pub fn read_have(&mut self, message: Message) -> Result<()> {
        if message.id != MESSAGE_HAVE || message.payload.len() != 4 {
            return Err(anyhow!("received invalid MESSAGE_HAVE from peer"));
        }

        let mut payload_cursor = Cursor::new(&message.payload);
        let index = payload_cursor.read_u32::<BigEndian>()?;

        debug!(
            "Receive MESSAGE_HAVE for piece {} from peer {}",
            index, self.peer.id
        );

        self.bitfield.set(index);

        Ok(())
    }

    /// Process a PIECE message by copying its block into the piece buffer.
    ///
    /// The payload is `<index: u32><begin: u32><block bytes>`. The index
    /// must match the task, and the block must fit inside the piece at its
    /// stated offset. The block is placed at that explicit offset, so the
    /// remote is free to answer requests out of order.
    ///
    /// # Errors
    ///
    /// Fails if the payload is shorter than 8 bytes, the index does not
    /// match, or the block overruns the piece.
    pub fn read_piece(&mut self, message: Message, piece_work: &mut PieceWork) -> Result<()> {
        if message.id != MESSAGE_PIECE || message.payload.len() < 8 {
            return Err(anyhow!("received invalid MESSAGE_PIECE from peer"));
        }

        let payload = message.payload;

        let mut payload_cursor = Cursor::new(&payload[0..4]);
        let index = payload_cursor.read_u32::<BigEndian>()?;
        if index != piece_work.index {
            return Err(anyhow!(
                "expected piece {}, got piece {}",
                piece_work.index,
                index
            ));
        }

        let mut payload_cursor = Cursor::new(&payload[4..8]);
        let begin: u32 = payload_cursor.read_u32::<BigEndian>()?;

        let block = &payload[8..];
        let block_len = block.len() as u32;

        // Widen before adding so a hostile offset cannot wrap around
        if begin as u64 + block_len as u64 > piece_work.length as u64 {
            return Err(anyhow!(
                "received block [{}:{}] outside piece of length {}",
                begin,
                begin as u64 + block_len as u64,
                piece_work.length
            ));
        }

        debug!(
            "Download piece {} [{}:{}] from peer {}",
            index,
            begin,
            begin + block_len,
            self.peer.id
        );

        piece_work.data[begin as usize..(begin + block_len) as usize].copy_from_slice(block);
        piece_work.downloaded += block_len;
        piece_work.backlog = piece_work.backlog.saturating_sub(1);

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn bitfield_msb_first_semantics() {
        let mut bitfield = Bitfield::from(vec![0b1010_0000]);

        assert!(bitfield.has(0));
        assert!(!bitfield.has(1));
        assert!(bitfield.has(2));
        for index in 3..8 {
            assert!(!bitfield.has(index));
        }

        bitfield.set(5);
        assert!(bitfield.has(5));
        assert!(bitfield.has(0));
        assert!(bitfield.has(2));
        assert!(!bitfield.has(1));
    }

    #[test]
    fn bitfield_ignores_out_of_range() {
        let mut bitfield = Bitfield::from(vec![0xFF]);

        assert!(!bitfield.has(8));
        assert!(!bitfield.has(1000));

        bitfield.set(8);
        assert!(!bitfield.has(8));
    }

    #[test]
    fn handshake_roundtrip_over_stream() {
        let remote = Handshake::new(vec![0xCC; 20], vec![0xAA; 20]);
        let mut client = test_client(remote.serialize().unwrap());

        client.handshake_with_peer().unwrap();

        // Our handshake was sent first and in full
        let sent = Handshake::new(vec![0xBB; 20], vec![0xAA; 20])
            .serialize()
            .unwrap();
        assert_eq!(client.conn.output, sent);
        assert_eq!(client.conn.output.len(), 68);
    }

    #[test]
    fn handshake_rejects_info_hash_mismatch() {
        let remote = Handshake::new(vec![0xCC; 20], vec![0xEE; 20]);
        let mut client = test_client(remote.serialize().unwrap());

        assert!(client.handshake_with_peer().is_err());
    }

    #[test]
    fn handshake_rejects_zero_pstrlen() {
        let mut client = test_client(vec![0; 68]);

        assert!(client.handshake_with_peer().is_err());
    }

    #[test]
    fn read_message_maps_zero_length_to_keepalive() {
        let mut client = test_client(vec![0, 0, 0, 0]);

        let message = client.read_message().unwrap();
        assert_eq!(message.id, MESSAGE_KEEPALIVE);
        assert!(message.payload.is_empty());
    }

    #[test]
    fn read_bitfield_accepts_only_bitfield_id() {
        let bitfield_msg = Message::new_with_payload(MESSAGE_BITFIELD, vec![0b1000_0000]);
        let mut client = test_client(bitfield_msg.serialize().unwrap());
        client.read_bitfield().unwrap();
        assert!(client.has_piece(0));
        assert!(!client.has_piece(1));

        // A keep-alive first is a protocol error
        let mut client = test_client(vec![0, 0, 0, 0]);
        assert!(client.read_bitfield().is_err());

        // So is any other message id
        let unchoke = Message::new(MESSAGE_UNCHOKE);
        let mut client = test_client(unchoke.serialize().unwrap());
        assert!(client.read_bitfield().is_err());
    }

    #[test]
    fn read_piece_places_block_at_offset() {
        let mut client = test_client(vec![]);
        let mut piece_work = PieceWork::new(7, vec![0; 20], 32);
        piece_work.backlog = 2;

        let mut payload = vec![0, 0, 0, 7, 0, 0, 0, 16];
        payload.extend_from_slice(&[0xAB; 16]);
        let message = Message::new_with_payload(MESSAGE_PIECE, payload);

        client.read_piece(message, &mut piece_work).unwrap();

        assert_eq!(&piece_work.data[16..32], &[0xAB; 16]);
        assert_eq!(&piece_work.data[0..16], &[0; 16]);
        assert_eq!(piece_work.downloaded, 16);
        assert_eq!(piece_work.backlog, 1);
    }

    #[test]
    fn read_piece_rejects_wrong_index() {
        let mut client = test_client(vec![]);
        let mut piece_work = PieceWork::new(7, vec![0; 20], 32);

        let mut payload = vec![0, 0, 0, 8, 0, 0, 0, 0];
        payload.extend_from_slice(&[0xAB; 16]);
        let message = Message::new_with_payload(MESSAGE_PIECE, payload);

        assert!(client.read_piece(message, &mut piece_work).is_err());
    }

    #[test]
    fn read_piece_rejects_overflowing_block() {
        let mut client = test_client(vec![]);
        let mut piece_work = PieceWork::new(7, vec![0; 20], 32);

        // Offset near u32::MAX must not wrap past the bound check
        let mut payload = vec![0, 0, 0, 7, 0xFF, 0xFF, 0xFF, 0xF8];
        payload.extend_from_slice(&[0xAB; 16]);
        let message = Message::new_with_payload(MESSAGE_PIECE, payload);

        assert!(client.read_piece(message, &mut piece_work).is_err());
    }

    #[test]
    fn read_piece_rejects_short_payload() {
        let mut client = test_client(vec![]);
        let mut piece_work = PieceWork::new(7, vec![0; 20], 32);

        let message = Message::new_with_payload(MESSAGE_PIECE, vec![0, 0, 0, 7]);

        assert!(client.read_piece(message, &mut piece_work).is_err());
    }

    #[test]
    fn read_have_sets_bitfield_bit() {
        let bitfield_msg = Message::new_with_payload(MESSAGE_BITFIELD, vec![0x00]);
        let mut client = test_client(bitfield_msg.serialize().unwrap());
        client.read_bitfield().unwrap();

        let have = Message::have(3).unwrap();
        client.read_have(have).unwrap();

        assert!(client.has_piece(3));
        assert!(!client.has_piece(2));
    }
}
