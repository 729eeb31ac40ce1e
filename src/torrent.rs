//! The torrent: owns the piece table and the disk task, spawns one peer
//! session per tracker-supplied address and watches for the download's
//! termination condition.
//!
//! In metadata mode it also owns the swap from the metadata piece table
//! to the content piece table once the fetched descriptor hashes to the
//! info hash.

use std::{collections::HashSet, net::SocketAddr, sync::Arc};

use sha1::{Digest, Sha1};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    RwLock,
};

use crate::{
    conf::Conf,
    disk::{Disk, DiskHandle},
    error::{Error, Result},
    metainfo::{Info, Metainfo},
    peer::PeerSession,
    pieces::{ContentPieces, PieceTable},
    storage::StorageInfo,
    PeerId, PieceIndex, Sha1Hash,
};

/// The notifications peer sessions and the disk task send the torrent.
pub(crate) enum Event {
    /// Every metadata piece is present; the descriptor can be assembled.
    MetadataComplete,
    /// The disk task persisted a verified piece.
    PieceWritten(PieceIndex),
    /// The disk task could not persist a piece.
    DiskError(Error),
    /// A peer session terminated, for whatever reason.
    SessionClosed,
}

/// State shared between the torrent and all of its peer sessions.
pub(crate) struct Shared {
    /// The swarm's identity, supplied by the tracker layer.
    pub info_hash: Sha1Hash,
    /// Our own peer id, supplied by the tracker layer.
    pub client_id: PeerId,
    pub conf: Conf,
    /// Whether the download started from an info hash alone and must
    /// fetch the descriptor from the swarm first.
    pub metadata_mode: bool,
    /// The piece table. This single lock carries all cross-session
    /// coordination; see the invariants in [`crate::pieces`].
    pub table: RwLock<PieceTable>,
    pub events: UnboundedSender<Event>,
}

/// A single download: the manager of the piece table, the disk task and
/// the peer sessions.
pub struct Torrent {
    shared: Arc<Shared>,
    events: UnboundedReceiver<Event>,
    addrs: Vec<SocketAddr>,
    /// The descriptor's info dictionary, when it is known up front.
    pending_info: Option<Info>,
    /// Download geometry; set once the content table is installed.
    storage: Option<StorageInfo>,
    disk: Option<DiskHandle>,
    /// The pieces the disk task has confirmed on disk.
    written: HashSet<PieceIndex>,
}

impl Torrent {
    /// Creates a download whose descriptor is already known.
    pub fn from_metainfo(
        conf: Conf,
        info_hash: Sha1Hash,
        client_id: PeerId,
        metainfo: Metainfo,
        addrs: Vec<SocketAddr>,
    ) -> Self {
        let mut torrent = Self::new(conf, info_hash, client_id, addrs, false);
        torrent.pending_info = Some(metainfo.info);
        torrent
    }

    /// Creates a download from a bare info hash; the descriptor is
    /// fetched from the swarm via the metadata extension.
    pub fn from_info_hash(
        conf: Conf,
        info_hash: Sha1Hash,
        client_id: PeerId,
        addrs: Vec<SocketAddr>,
    ) -> Self {
        Self::new(conf, info_hash, client_id, addrs, true)
    }

    fn new(
        conf: Conf,
        info_hash: Sha1Hash,
        client_id: PeerId,
        addrs: Vec<SocketAddr>,
        metadata_mode: bool,
    ) -> Self {
        let (events, event_port) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                info_hash,
                client_id,
                conf,
                metadata_mode,
                table: RwLock::new(PieceTable::Pending),
                events,
            }),
            events: event_port,
            addrs,
            pending_info: None,
            storage: None,
            disk: None,
            written: HashSet::new(),
        }
    }

    /// Runs the download to completion: all declared files on disk with
    /// verified contents.
    pub async fn start(&mut self) -> Result<()> {
        if self.addrs.is_empty() {
            return Err(Error::NoPeers);
        }
        if let Some(info) = self.pending_info.take() {
            self.install_content(&info).await?;
        }

        log::info!(
            "Starting torrent {} with {} peers",
            hex::encode(self.shared.info_hash),
            self.addrs.len()
        );
        let mut live_sessions = 0;
        for addr in self.addrs.drain(..) {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let mut session = PeerSession::new(Arc::clone(&shared), addr);
                match session.start().await {
                    Ok(()) => log::info!("Peer {} session ended", addr),
                    Err(e) => log::warn!("Peer {} session error: {}", addr, e),
                }
                // the torrent may already be gone; nothing left to do then
                let _ = shared.events.send(Event::SessionClosed);
            });
            live_sessions += 1;
        }

        while let Some(event) = self.events.recv().await {
            match event {
                Event::MetadataComplete => self.install_fetched_metadata().await?,
                Event::PieceWritten(index) => {
                    self.written.insert(index);
                    let piece_count =
                        self.storage.as_ref().map(|s| s.piece_count).unwrap_or(0);
                    log::info!("Piece {}/{} written", self.written.len(), piece_count);
                    if piece_count > 0 && self.written.len() == piece_count {
                        if let Some(disk) = &self.disk {
                            let _ = disk.shutdown();
                        }
                        log::info!("Download complete");
                        return Ok(());
                    }
                }
                Event::DiskError(e) => return Err(e),
                Event::SessionClosed => {
                    live_sessions -= 1;
                    if live_sessions == 0
                        && !self.shared.table.read().await.all_complete()
                    {
                        // with a fixed address list and no session left,
                        // the remaining pieces can never arrive
                        return Err(Error::PeersExhausted);
                    }
                }
            }
        }
        // can't happen: the shared state keeps an event sender alive
        Err(Error::Channel)
    }

    /// Assembles the fetched metadata, verifies it against the info hash
    /// and swaps in the content table. A descriptor that does not hash to
    /// the info hash is dropped so the swarm is asked again.
    async fn install_fetched_metadata(&mut self) -> Result<()> {
        let raw = match &*self.shared.table.read().await {
            PieceTable::Metadata(pieces) => pieces.assemble(),
            _ => None,
        };
        let raw = match raw {
            Some(raw) => raw,
            // stale event: a piece is missing again or the table moved on
            None => return Ok(()),
        };

        let digest = Sha1::digest(&raw);
        if digest.as_slice() != self.shared.info_hash {
            log::warn!(
                "Fetched metadata hashes to {}, expected {}; refetching",
                hex::encode(digest),
                hex::encode(self.shared.info_hash)
            );
            let mut table = self.shared.table.write().await;
            if let PieceTable::Metadata(pieces) = &mut *table {
                pieces.reset();
            }
            return Ok(());
        }

        let info = Info::from_bytes(&raw)?;
        log::info!("Metadata verified: {}", info.name);
        self.install_content(&info).await
    }

    /// Builds the storage layout, the disk task and the content piece
    /// table, then publishes the table to the sessions.
    async fn install_content(&mut self, info: &Info) -> Result<()> {
        if matches!(&*self.shared.table.read().await, PieceTable::Content(_)) {
            return Ok(());
        }

        let storage = StorageInfo::new(info)?;
        let (disk, disk_handle) = Disk::new(
            storage.clone(),
            &self.shared.conf.output_dir,
            self.shared.events.clone(),
        )?;
        let pieces = ContentPieces::new(
            &storage,
            &info.pieces,
            self.shared.conf.block_len,
            disk_handle.clone(),
        );

        {
            let mut table = self.shared.table.write().await;
            *table = PieceTable::Content(pieces);
        }
        tokio::spawn(disk.run());

        log::info!(
            "Content table installed: {} pieces of {} bytes, {} bytes total",
            storage.piece_count,
            storage.piece_len,
            storage.total_len
        );
        self.storage = Some(storage);
        self.disk = Some(disk_handle);
        Ok(())
    }
}
