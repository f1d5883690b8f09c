//! # Peer Worker
//!
//! One worker runs per peer endpoint, each on its own thread. A worker owns
//! its peer session exclusively and coordinates with the dispatcher only
//! through the two channels.
//!
//! ## Lifecycle
//!
//! 1. **Session setup**: dial, handshake, initial bitfield. Any failure
//!    drops the endpoint; nothing needs to be requeued because no task was
//!    held yet.
//! 2. **Interested**: sent once. A pure leecher never sends choke traffic.
//! 3. **Task loop**: pull a piece task, skip-and-requeue if the peer does
//!    not have the piece, otherwise download, verify, and report.
//! 4. **Exit**: when the dispatcher raises the shutdown flag or the work
//!    queue disconnects.
//!
//! ## Per-Piece Download
//!
//! A piece is fetched as 16 KiB blocks requested at sequential offsets, with
//! up to 5 requests in flight. The loop alternates between topping up the
//! request pipeline (while unchoked) and reading one inbound message, under
//! one 15 second deadline for the whole piece.
//!
//! ## Failure Policy
//!
//! - Download error (I/O, timeout, protocol violation): requeue the task,
//!   close the session, exit. The peer has proven unreliable.
//! - Hash mismatch: requeue the task but keep the session. The peer may
//!   still serve other pieces correctly.
//! - Requeueing is capped per task; a task that keeps bouncing is dropped
//!   so workers cannot spin on a piece nobody can serve.

use crate::client::*;
use crate::message::*;
use crate::peer::*;
use crate::piece::*;

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// Maximum number of in-flight block requests per peer
const MAX_BACKLOG: u32 = 5;

// Block size for piece transfer (16 KiB)
const BLOCK_SIZE: u32 = 16384;

// Deadline for downloading one whole piece
const PIECE_TIMEOUT: Duration = Duration::from_secs(15);

// A task requeued more often than this is dropped
const MAX_TASK_REQUEUES: u32 = 1000;

// Pause before requeueing a piece the peer does not have, so a peer that
// lacks most of the torrent does not spin the queue
const MISSING_PIECE_BACKOFF: Duration = Duration::from_millis(50);

// How often an idle worker rechecks the shutdown flag
const TASK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Downloads pieces from a single peer until the work runs out.
pub struct Worker {
    /// The remote endpoint this worker is responsible for
    peer: Peer,
    /// 20-byte identifier of this client instance
    peer_id: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: Vec<u8>,
    /// Sender side of the work queue, used for requeueing
    work_tx: Sender<PieceWork>,
    /// Receiver side of the work queue
    work_rx: Receiver<PieceWork>,
    /// Completed pieces go to the dispatcher through this channel
    result_tx: Sender<PieceResult>,
    /// Raised by the dispatcher once every piece has been collected
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    /// Create a worker for one peer endpoint.
    ///
    /// # Arguments
    ///
    /// * `peer` - The endpoint to download from.
    /// * `peer_id` - 20-byte identifier of this client.
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent's info dictionary.
    /// * `work_tx` / `work_rx` - Both ends of the shared task queue.
    /// * `result_tx` - Channel for completed pieces.
    /// * `shutdown` - Completion flag raised by the dispatcher.
    ///
    pub fn new(
        peer: Peer,
        peer_id: Vec<u8>,
        info_hash: Vec<u8>,
        work_tx: Sender<PieceWork>,
        work_rx: Receiver<PieceWork>,
        result_tx: Sender<PieceResult>,
        shutdown: Arc<AtomicBool>,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            info_hash,
            work_tx,
            work_rx,
            result_tx,
            shutdown,
        }
    }

    /// Run the worker to completion: set up the session, then process tasks
    /// until the download finishes or the peer fails.
    pub fn start_download(&self) {
        let mut client = match Client::connect(
            self.peer.clone(),
            self.peer_id.clone(),
            self.info_hash.clone(),
        ) {
            Ok(client) => client,
            Err(e) => {
                warn!("Dropping peer {}: {}", self.peer.id, e);
                return;
            }
        };

        if let Err(e) = client.handshake_with_peer() {
            warn!("Dropping peer {}: {}", self.peer.id, e);
            return;
        }

        if let Err(e) = client.read_bitfield() {
            warn!("Dropping peer {}: {}", self.peer.id, e);
            return;
        }

        if let Err(e) = client.send_interested() {
            warn!("Dropping peer {}: {}", self.peer.id, e);
            return;
        }

        self.run_task_loop(&mut client);
    }

    /// Pull tasks from the work queue until shutdown.
    fn run_task_loop<S: PeerStream>(&self, client: &mut Client<S>) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                debug!("Worker for peer {} exiting: download complete", self.peer.id);
                return;
            }

            let mut piece_work: PieceWork = match self.work_rx.recv_timeout(TASK_POLL_INTERVAL) {
                Ok(piece_work) => piece_work,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            };

            // The peer does not have this piece, hand it back for another
            // worker. The pause keeps a near-empty peer from cycling the
            // queue at full speed.
            if !client.has_piece(piece_work.index) {
                thread::sleep(MISSING_PIECE_BACKOFF);
                if self.requeue(piece_work).is_err() {
                    return;
                }
                continue;
            }

            if let Err(e) = self.download_piece(client, &mut piece_work) {
                warn!(
                    "Piece {} failed on peer {}: {}",
                    piece_work.index, self.peer.id, e
                );
                let _ = self.requeue(piece_work);
                client.close();
                return;
            }

            if let Err(e) = self.verify_piece_integrity(&piece_work) {
                warn!(
                    "Piece {} from peer {} failed verification: {}",
                    piece_work.index, self.peer.id, e
                );
                if self.requeue(piece_work).is_err() {
                    return;
                }
                continue;
            }

            if client.send_have(piece_work.index).is_err() {
                warn!("Could not announce piece {} to peer {}", piece_work.index, self.peer.id);
            }

            let piece_result =
                PieceResult::new(piece_work.index, piece_work.length, piece_work.data);
            if self.result_tx.send(piece_result).is_err() {
                return;
            }
        }
    }

    /// Push a task back onto the work queue, unless it has already bounced
    /// too many times, in which case it is dropped and the dispatcher's
    /// watchdog will surface the failure.
    fn requeue(&self, mut piece_work: PieceWork) -> Result<()> {
        piece_work.attempts += 1;

        if piece_work.attempts > MAX_TASK_REQUEUES {
            error!(
                "Giving up on piece {} after {} requeues",
                piece_work.index, piece_work.attempts
            );
            return Ok(());
        }

        self.work_tx
            .send(piece_work)
            .map_err(|_| anyhow!("work queue disconnected"))
    }

    /// Download one piece through the pipelined block request loop.
    ///
    /// Blocks are requested at strictly sequential offsets, so the
    /// outstanding requests always form a contiguous prefix of the piece
    /// and tile it exactly once. Inbound blocks are still placed by their
    /// explicit offset, as the remote may answer out of order.
    fn download_piece<S: PeerStream>(
        &self,
        client: &mut Client<S>,
        piece_work: &mut PieceWork,
    ) -> Result<()> {
        client.set_deadline(Some(PIECE_TIMEOUT))?;

        // Reset in-flight state; the task may be a requeued retry
        piece_work.backlog = 0;
        piece_work.requested = 0;
        piece_work.downloaded = 0;

        while piece_work.downloaded < piece_work.length {
            if !client.is_choked() {
                // Top up the request pipeline
                while piece_work.backlog < MAX_BACKLOG && piece_work.requested < piece_work.length
                {
                    let block_size = BLOCK_SIZE.min(piece_work.length - piece_work.requested);

                    client.send_request(piece_work.index, piece_work.requested, block_size)?;

                    piece_work.backlog += 1;
                    piece_work.requested += block_size;
                }
            }

            let message: Message = client.read_message()?;
            match message.id {
                MESSAGE_CHOKE => client.read_choke(),
                MESSAGE_UNCHOKE => client.read_unchoke(),
                MESSAGE_HAVE => client.read_have(message)?,
                MESSAGE_PIECE => client.read_piece(message, piece_work)?,
                MESSAGE_KEEPALIVE => {}
                id => debug!("Ignoring message {} from peer {}", id, self.peer.id),
            }
        }

        client.set_deadline(None)?;

        debug!(
            "Downloaded piece {} from peer {}",
            piece_work.index, self.peer.id
        );

        Ok(())
    }

    /// Check a completed piece against its expected SHA-1 hash.
    fn verify_piece_integrity(&self, piece_work: &PieceWork) -> Result<()> {
        let mut hasher = Sha1::new();
        hasher.update(&piece_work.data);
        let hash = hasher.finish().to_vec();

        if hash != piece_work.hash {
            return Err(anyhow!("piece hash mismatch"));
        }

        Ok(())
    }
}
