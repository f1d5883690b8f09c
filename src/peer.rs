//! # Peer Endpoints
//!
//! Trackers report peers in a compact binary form, 6 bytes per peer:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! Both fields are big-endian. This module parses that form into [`Peer`]
//! values the workers can dial.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

use std::io::Cursor;
use std::net::Ipv4Addr;

const PEER_SIZE: usize = 6;

type PeerId = u32;

/// A remote peer endpoint discovered through a tracker.
#[derive(Clone)]
pub struct Peer {
    /// Sequential identifier used for logging
    pub id: PeerId,
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// TCP port the peer listens on
    pub port: u16,
}

/// Parse a compact peer list returned by a tracker.
///
/// # Arguments
///
/// * `raw` - Concatenated 6-byte peer entries.
///
/// # Errors
///
/// Fails if the buffer length is not a multiple of 6.
pub fn parse_compact_peers(raw: &[u8]) -> Result<Vec<Peer>> {
    if !raw.len().is_multiple_of(PEER_SIZE) {
        return Err(anyhow!("received invalid peers from tracker"));
    }

    let nb_peers = raw.len() / PEER_SIZE;
    let mut peers: Vec<Peer> = Vec::with_capacity(nb_peers);

    for i in 0..nb_peers {
        let offset = i * PEER_SIZE;

        let ip = Ipv4Addr::new(
            raw[offset],
            raw[offset + 1],
            raw[offset + 2],
            raw[offset + 3],
        );

        let mut port_cursor = Cursor::new(&raw[offset + 4..offset + 6]);
        let port = port_cursor.read_u16::<BigEndian>()?;

        peers.push(Peer {
            id: i as u32,
            ip,
            port,
        });
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_two_peers() {
        let raw = vec![192, 168, 1, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x00, 0x50];
        let peers = parse_compact_peers(&raw).unwrap();

        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].ip, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(peers[0].port, 6881);
        assert_eq!(peers[1].ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(peers[1].port, 80);
    }

    #[test]
    fn parse_empty_peer_list() {
        assert!(parse_compact_peers(&[]).unwrap().is_empty());
    }

    #[test]
    fn parse_truncated_peer_list_fails() {
        let raw = vec![192, 168, 1, 1, 0x1A];
        assert!(parse_compact_peers(&raw).is_err());
    }
}
