//! # Piece Tasks and Results
//!
//! A torrent is downloaded one piece at a time, and each piece travels
//! through the engine as a [`PieceWork`] task. Tasks are seeded into the
//! work queue by the dispatcher, claimed by peer workers, and either turned
//! into a [`PieceResult`] or pushed back for another worker to retry.
//!
//! Besides its identity (index, expected hash, length) a task carries the
//! in-flight download state for the worker currently holding it: the piece
//! buffer, how many bytes have been requested and received, and how many
//! block requests are outstanding.

/// One piece to download, together with its in-flight state.
#[derive(Default, Debug, Clone)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Expected SHA-1 hash of the piece (20 bytes)
    pub hash: Vec<u8>,
    /// Length of the piece in bytes
    pub length: u32,
    /// Piece buffer, filled block by block
    pub data: Vec<u8>,
    /// Number of outstanding block requests
    pub backlog: u32,
    /// Total bytes requested so far
    pub requested: u32,
    /// Total bytes received so far
    pub downloaded: u32,
    /// How many times this task has been pushed back to the work queue
    pub attempts: u32,
}

/// A fully downloaded and hash-verified piece.
#[derive(Default, Debug, Clone)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Length of the piece in bytes
    pub length: u32,
    /// Verified piece data
    pub data: Vec<u8>,
}

impl PieceWork {
    /// Create a task for one piece with a zeroed buffer of the right size.
    pub fn new(index: u32, hash: Vec<u8>, length: u32) -> PieceWork {
        PieceWork {
            index,
            hash,
            length,
            data: vec![0; length as usize],
            backlog: 0,
            requested: 0,
            downloaded: 0,
            attempts: 0,
        }
    }
}

impl PieceResult {
    /// Wrap a completed piece buffer into a result.
    pub fn new(index: u32, length: u32, data: Vec<u8>) -> PieceResult {
        PieceResult {
            index,
            length,
            data,
        }
    }
}
