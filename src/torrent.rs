//! # Torrent Loading and Download Coordination
//!
//! This module ties the pieces together: parse the metainfo file, announce
//! to the tracker(s) to discover peers, then run the download engine.
//!
//! ## Metainfo Format
//!
//! A metainfo file is a bencoded dictionary:
//!
//! - **announce**: tracker URL (optionally extended by **announce-list** tiers)
//! - **info**: file metadata, containing `length`, `name`, `piece length`
//!   (the key really contains a space) and `pieces`, the concatenated
//!   20-byte SHA-1 digests of every piece
//!
//! The torrent's identity on the wire is the info-hash, the SHA-1 of the
//! re-encoded `info` dictionary. Re-encoding is deterministic because
//! bencode dictionaries are keyed in lexicographic order; the serde struct
//! declares its fields in exactly that order.
//!
//! ## Download Coordination
//!
//! The download is a producer/consumer pipeline:
//!
//! 1. Seed a bounded work queue with one task per piece (the capacity
//!    equals the piece count, so seeding never blocks)
//! 2. Spawn one worker thread per peer
//! 3. Collect verified pieces from the result queue and place each at its
//!    offset in the output buffer
//! 4. After the last piece, raise the shutdown flag so idle workers exit
//!
//! Result order is unconstrained; the piece index alone decides placement.
//! A watchdog bounds how long the collector will wait between results, so a
//! swarm that cannot supply every piece produces an error instead of a
//! silent hang.

use crate::peer::*;
use crate::piece::*;
use crate::worker::*;

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use crossbeam_channel::{bounded, unbounded, RecvTimeoutError};
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;
use url::Url;

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

// Port reported to the tracker (we never actually listen; this client only
// downloads)
const PORT: u16 = 6666;
// Size of a SHA-1 digest in bytes
const SHA1_HASH_SIZE: usize = 20;
// Timeout for a tracker announce request
const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);
// Longest the collector will wait between two results before declaring the
// download stalled
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);

/// A parsed torrent, ready to download.
#[derive(Default, Clone)]
pub struct Torrent {
    /// Tracker tiers for peer discovery, each tier a list of URLs
    tiers: Vec<Vec<String>>,
    /// 20-byte SHA-1 hash of the bencoded info dictionary
    info_hash: Vec<u8>,
    /// One 20-byte SHA-1 digest per piece
    pieces_hashes: Vec<Vec<u8>>,
    /// Size of each piece in bytes, except possibly the last
    piece_length: u32,
    /// Total file size in bytes
    length: u32,
    /// Suggested filename from the metainfo
    name: String,
    /// 20-byte identifier of this client instance, freshly random per run
    peer_id: Vec<u8>,
    /// Peers discovered through the tracker(s)
    peers: Vec<Peer>,
}

/// The `info` dictionary of a metainfo file.
///
/// Field order is the lexicographic key order, which pins the re-encoding
/// used for the info-hash.
#[derive(Deserialize, Serialize)]
struct BencodeInfo {
    // Size of the file in bytes
    #[serde(rename = "length")]
    length: u32,
    // Suggested filename where to save the file
    #[serde(rename = "name")]
    name: String,
    // Size of each piece in bytes
    #[serde(rename = "piece length")]
    piece_length: u32,
    // Concatenation of all 20-byte piece SHA-1 digests
    #[serde(rename = "pieces")]
    pieces: ByteBuf,
}

/// A whole metainfo file.
#[derive(Deserialize, Serialize)]
struct BencodeTorrent {
    // URL of the tracker
    #[serde(default)]
    announce: String,
    // Optional tracker tiers (BEP 12)
    #[serde(rename = "announce-list", default)]
    announce_list: Vec<Vec<String>>,
    // Information about the file
    info: BencodeInfo,
}

/// A tracker announce response.
#[derive(Debug, Deserialize, Serialize)]
struct BencodeTracker {
    // Suggested refresh interval in seconds, unused by a one-shot leecher
    #[allow(dead_code)]
    interval: u32,
    // Compact peer list, 6 bytes per peer
    peers: ByteBuf,
}

impl BencodeInfo {
    /// Hash the re-encoded info dictionary, producing the torrent's
    /// identity on the wire.
    fn hash(&self) -> Result<Vec<u8>> {
        let buf: Vec<u8> = ser::to_bytes::<BencodeInfo>(self)?;

        let mut hasher = Sha1::new();
        hasher.update(&buf);

        Ok(hasher.finish().to_vec())
    }

    /// Split the concatenated `pieces` digests into one hash per piece.
    fn split_pieces_hashes(&self) -> Result<Vec<Vec<u8>>> {
        if !self.pieces.len().is_multiple_of(SHA1_HASH_SIZE) {
            return Err(anyhow!("torrent pieces length is not a multiple of 20"));
        }

        Ok(self
            .pieces
            .chunks(SHA1_HASH_SIZE)
            .map(|chunk| chunk.to_vec())
            .collect())
    }
}

impl Torrent {
    /// Build an empty torrent, to be filled by [`Torrent::open`].
    pub fn new() -> Self {
        Default::default()
    }

    /// The suggested filename from the metainfo.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a metainfo file, then announce to its trackers to discover
    /// peers.
    ///
    /// # Arguments
    ///
    /// * `filepath` - Path to the metainfo file.
    ///
    pub fn open(&mut self, filepath: PathBuf) -> Result<()> {
        let mut file = match File::open(filepath) {
            Ok(file) => file,
            Err(_) => return Err(anyhow!("could not open torrent")),
        };

        let mut buf = vec![];
        if file.read_to_end(&mut buf).is_err() {
            return Err(anyhow!("could not read torrent"));
        }

        let bencode = match de::from_bytes::<BencodeTorrent>(&buf) {
            Ok(bencode) => bencode,
            Err(_) => return Err(anyhow!("could not decode torrent")),
        };

        // Fresh random client id for this run
        let mut peer_id: Vec<u8> = vec![0; 20];
        let mut rng = rand::thread_rng();
        for x in peer_id.iter_mut() {
            *x = rng.gen();
        }

        if !bencode.announce_list.is_empty() {
            // Tiers are shuffled as BEP 12 asks
            self.tiers = bencode.announce_list.clone();
            for tier in &mut self.tiers {
                tier.shuffle(&mut rng);
            }
        } else if !bencode.announce.is_empty() {
            self.tiers = vec![vec![bencode.announce.to_owned()]];
        } else {
            return Err(anyhow!("torrent has no announce or announce-list"));
        }

        self.info_hash = bencode.info.hash()?;
        self.pieces_hashes = bencode.info.split_pieces_hashes()?;
        self.piece_length = bencode.info.piece_length;
        self.length = bencode.info.length;
        self.name = bencode.info.name.to_owned();
        self.peer_id = peer_id.clone();
        self.peers = self.request_peers(peer_id)?;

        Ok(())
    }

    /// Announce to every known tracker in parallel and merge the peer
    /// lists.
    ///
    /// Trackers that fail or return garbage are skipped; only an empty
    /// merged list is an error.
    fn request_peers(&self, peer_id: Vec<u8>) -> Result<Vec<Peer>> {
        let mut unique_urls = HashSet::new();
        for tier in &self.tiers {
            for tracker_url in tier {
                unique_urls.insert(tracker_url.clone());
            }
        }
        let tracker_urls: Vec<String> = unique_urls.into_iter().collect();

        if tracker_urls.is_empty() {
            return Err(anyhow!("no tracker URLs available"));
        }

        let all_peers_bytes = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        for tracker_url in tracker_urls {
            let peer_id = peer_id.clone();
            let info_hash = self.info_hash.clone();
            let length = self.length;
            let all_peers_bytes = Arc::clone(&all_peers_bytes);

            let handle = thread::spawn(move || {
                let full_url =
                    match Torrent::build_tracker_url(&info_hash, &tracker_url, &peer_id, length) {
                        Ok(full_url) => full_url,
                        Err(e) => {
                            warn!("Skipping tracker {}: {}", tracker_url, e);
                            return;
                        }
                    };

                let client = match reqwest::blocking::Client::builder()
                    .timeout(TRACKER_TIMEOUT)
                    .build()
                {
                    Ok(client) => client,
                    Err(_) => return,
                };

                let response = match client.get(&full_url).send() {
                    Ok(response) => match response.bytes() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!("Skipping tracker {}: {}", tracker_url, e);
                            return;
                        }
                    },
                    Err(e) => {
                        warn!("Skipping tracker {}: {}", tracker_url, e);
                        return;
                    }
                };

                let tracker_bencode = match de::from_bytes::<BencodeTracker>(&response) {
                    Ok(bencode) => bencode,
                    Err(e) => {
                        warn!("Skipping tracker {}: {}", tracker_url, e);
                        return;
                    }
                };

                if let Ok(mut guard) = all_peers_bytes.lock() {
                    guard.push(tracker_bencode.peers.to_vec());
                }
            });

            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.join();
        }

        let all_peers_bytes = all_peers_bytes
            .lock()
            .map_err(|_| anyhow!("tracker results lock poisoned"))?;

        let mut all_peers = Vec::new();
        for peers_bytes in all_peers_bytes.iter() {
            match parse_compact_peers(peers_bytes) {
                Ok(mut peers) => all_peers.append(&mut peers),
                Err(e) => {
                    warn!("Ignoring malformed peer list from tracker: {}", e);
                    continue;
                }
            }
        }

        if all_peers.is_empty() {
            return Err(anyhow!("could not get peers from any tracker"));
        }

        // Deduplicate by endpoint, then assign sequential ids for logging
        let mut seen = HashSet::new();
        let mut deduped_peers: Vec<Peer> = Vec::new();
        for peer in all_peers {
            if seen.insert((peer.ip, peer.port)) {
                deduped_peers.push(peer);
            }
        }
        for (i, peer) in deduped_peers.iter_mut().enumerate() {
            peer.id = i as u32;
        }

        info!("Discovered {} peers", deduped_peers.len());

        Ok(deduped_peers)
    }

    /// Build the announce URL for one tracker.
    ///
    /// # Arguments
    ///
    /// * `info_hash` - The 20-byte SHA-1 hash of the info dictionary.
    /// * `announce` - The tracker URL.
    /// * `peer_id` - The 20-byte identifier of this client.
    /// * `length` - Total file size in bytes.
    ///
    fn build_tracker_url(
        info_hash: &[u8],
        announce: &str,
        peer_id: &[u8],
        length: u32,
    ) -> Result<String> {
        /// Encode every byte as %XX; the identifiers are raw binary, which
        /// standard form encoding would mangle
        fn percent_encode_binary(data: &[u8]) -> String {
            const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
            let mut encoded = String::with_capacity(data.len() * 3);

            for &byte in data {
                encoded.push('%');
                encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
                encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
            }

            encoded
        }

        let base_url = match Url::parse(announce) {
            Ok(base_url) => base_url,
            Err(_) => return Err(anyhow!("could not parse tracker url")),
        };

        let query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&compact=1&left={}",
            percent_encode_binary(info_hash),
            percent_encode_binary(peer_id),
            PORT,
            length
        );

        let mut full_url = base_url.to_string();
        if full_url.contains('?') {
            full_url.push('&');
        } else {
            full_url.push('?');
        }
        full_url.push_str(&query);

        Ok(full_url)
    }

    /// Download the whole file, returning the assembled bytes.
    ///
    /// Spawns one worker per peer and collects verified pieces until every
    /// one is in. Fails rather than hangs when the swarm stops producing
    /// results.
    pub fn download(&self) -> Result<Vec<u8>> {
        let nb_pieces = self.pieces_hashes.len();

        println!("Downloading {:?} ({} pieces)", self.name, nb_pieces);

        // Capacity matches the piece count so seeding never blocks, and a
        // requeue can never block either
        let (work_tx, work_rx) = bounded::<PieceWork>(nb_pieces);
        let (result_tx, result_rx) = unbounded::<PieceResult>();
        let shutdown = Arc::new(AtomicBool::new(false));

        // Seed one task per piece, in index order
        for index in 0..nb_pieces {
            let piece_index = index as u32;
            let (begin, end) = self.piece_bounds(piece_index);
            let piece_work = PieceWork::new(
                piece_index,
                self.pieces_hashes[index].clone(),
                end - begin,
            );

            if work_tx.send(piece_work).is_err() {
                return Err(anyhow!("could not seed the work queue"));
            }
        }

        for peer in &self.peers {
            let worker = Worker::new(
                peer.clone(),
                self.peer_id.clone(),
                self.info_hash.clone(),
                work_tx.clone(),
                work_rx.clone(),
                result_tx.clone(),
                Arc::clone(&shutdown),
            );

            thread::spawn(move || {
                worker.start_download();
            });
        }

        // Only the workers hold channel ends now; if they all exit, the
        // result channel disconnects and the collector sees it
        drop(work_tx);
        drop(work_rx);
        drop(result_tx);

        let pb = ProgressBar::new(self.length as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
                .unwrap()
                .progress_chars("#>-"),
        );

        let mut data: Vec<u8> = vec![0; self.length as usize];
        let mut nb_pieces_downloaded = 0;
        while nb_pieces_downloaded < nb_pieces {
            let piece_result: PieceResult = match result_rx.recv_timeout(WATCHDOG_TIMEOUT) {
                Ok(piece_result) => piece_result,
                Err(RecvTimeoutError::Timeout) => {
                    shutdown.store(true, Ordering::Relaxed);
                    return Err(anyhow!(
                        "download stalled with {}/{} pieces downloaded",
                        nb_pieces_downloaded,
                        nb_pieces
                    ));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!(
                        "all peers disconnected with {}/{} pieces downloaded",
                        nb_pieces_downloaded,
                        nb_pieces
                    ));
                }
            };

            let (begin, end) = self.piece_bounds(piece_result.index);
            data[begin as usize..end as usize].copy_from_slice(&piece_result.data);

            pb.inc(piece_result.length as u64);
            nb_pieces_downloaded += 1;

            debug!("Downloaded piece {}/{}", nb_pieces_downloaded, nb_pieces);
        }

        // Tell idle workers the job is done
        shutdown.store(true, Ordering::Relaxed);
        pb.finish();

        Ok(data)
    }

    /// Byte range `[begin, end)` of a piece within the file.
    ///
    /// Consecutive bounds tile the file exactly; the last piece is
    /// truncated to the file length.
    fn piece_bounds(&self, index: u32) -> (u32, u32) {
        let begin = index * self.piece_length;
        let end = begin.saturating_add(self.piece_length).min(self.length);

        (begin, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_bounds_tile_the_file() {
        let mut torrent = Torrent::new();
        torrent.piece_length = 300;
        torrent.length = 1000;

        assert_eq!(torrent.piece_bounds(0), (0, 300));
        assert_eq!(torrent.piece_bounds(1), (300, 600));
        assert_eq!(torrent.piece_bounds(2), (600, 900));
        assert_eq!(torrent.piece_bounds(3), (900, 1000));
    }

    #[test]
    fn piece_bounds_exact_multiple() {
        let mut torrent = Torrent::new();
        torrent.piece_length = 250;
        torrent.length = 1000;

        assert_eq!(torrent.piece_bounds(3), (750, 1000));
    }

    #[test]
    fn split_pieces_hashes_by_twenty_bytes() {
        let mut pieces = vec![0x11; 20];
        pieces.extend_from_slice(&[0x22; 20]);

        let info = BencodeInfo {
            length: 1000,
            name: "test".into(),
            piece_length: 300,
            pieces: ByteBuf::from(pieces),
        };

        let hashes = info.split_pieces_hashes().unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], vec![0x11; 20]);
        assert_eq!(hashes[1], vec![0x22; 20]);
    }

    #[test]
    fn split_pieces_hashes_rejects_ragged_length() {
        let info = BencodeInfo {
            length: 1000,
            name: "test".into(),
            piece_length: 300,
            pieces: ByteBuf::from(vec![0x11; 21]),
        };

        assert!(info.split_pieces_hashes().is_err());
    }

    #[test]
    fn info_reencoding_is_lexicographic() {
        let info = BencodeInfo {
            length: 1000,
            name: "test".into(),
            piece_length: 300,
            pieces: ByteBuf::from(vec![0xAB; 20]),
        };

        let mut expected = b"d6:lengthi1000e4:name4:test12:piece lengthi300e6:pieces20:".to_vec();
        expected.extend_from_slice(&[0xAB; 20]);
        expected.push(b'e');

        assert_eq!(ser::to_bytes(&info).unwrap(), expected);
    }

    #[test]
    fn info_hash_is_stable() {
        let info = BencodeInfo {
            length: 1000,
            name: "test".into(),
            piece_length: 300,
            pieces: ByteBuf::from(vec![0xAB; 20]),
        };

        // Hashing the same dictionary twice gives the same identity
        assert_eq!(info.hash().unwrap(), info.hash().unwrap());
        assert_eq!(info.hash().unwrap().len(), 20);
    }

    #[test]
    fn tracker_url_carries_raw_byte_identifiers() {
        let info_hash = vec![0xAA; 20];
        let peer_id = vec![0x01; 20];

        let full_url = Torrent::build_tracker_url(
            &info_hash,
            "http://tracker.example.org:6969/announce",
            &peer_id,
            12345,
        )
        .unwrap();

        assert!(full_url.starts_with("http://tracker.example.org:6969/announce?"));
        assert!(full_url.contains(&format!("info_hash={}", "%AA".repeat(20))));
        assert!(full_url.contains(&format!("peer_id={}", "%01".repeat(20))));
        assert!(full_url.contains("port=6666"));
        assert!(full_url.contains("uploaded=0"));
        assert!(full_url.contains("downloaded=0"));
        assert!(full_url.contains("compact=1"));
        assert!(full_url.contains("left=12345"));
    }

    #[test]
    fn tracker_url_appends_to_existing_query() {
        let full_url = Torrent::build_tracker_url(
            &[0xAA; 20],
            "http://tracker.example.org/announce?key=abc",
            &[0x01; 20],
            1,
        )
        .unwrap();

        assert!(full_url.contains("announce?key=abc&info_hash="));
    }
}
