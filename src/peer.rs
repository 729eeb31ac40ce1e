//! The per-peer protocol state machine.
//!
//! Each remote address gets one [`PeerSession`] running on its own task
//! with blocking socket io: connect, handshake, then a read/act loop that
//! drains complete frames, answers a half-received frame with a
//! keep-alive, and otherwise takes the next step of the download
//! (extension metadata request, `interested`, or a block request). The
//! only state a session shares with the rest of the torrent is the piece
//! table.

mod codec;

use std::{collections::HashSet, net::SocketAddr, sync::Arc};

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout},
};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::{
    bencode::{self, Value},
    error::{Error, Result},
    pieces::{MetadataPieces, PieceOutcome, PieceTable},
    torrent::{Event, Shared},
    PieceIndex,
};
use codec::*;

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// The normal state of a session, in which any message may be
    /// exchanged.
    Connected,
}

/// What the session should do after an idle pass.
enum Flow {
    /// Go back to reading from the socket.
    Read,
    /// Re-examine the shared state without touching the socket (used
    /// while waiting for a piece to become reservable or for the
    /// metadata transition).
    Poll,
    /// The download is complete; end the session.
    Stop,
}

pub(crate) struct PeerSession {
    /// Shared state of the torrent this session belongs to.
    shared: Arc<Shared>,
    /// The remote address of the peer.
    addr: SocketAddr,
    state: State,
    /// While the peer is choking us we must not request blocks.
    choking: bool,
    /// The piece indices the remote claims to hold.
    has: HashSet<PieceIndex>,
    /// The single piece this session currently downloads, if any.
    reserved: Option<PieceIndex>,
    /// The offset of the block request awaiting its response.
    in_flight: Option<u32>,
    /// The id the remote assigned to `ut_metadata` messages in its
    /// extension handshake.
    metadata_ext_id: Option<u8>,
}

impl PeerSession {
    pub fn new(shared: Arc<Shared>, addr: SocketAddr) -> Self {
        Self {
            shared,
            addr,
            state: State::Connecting,
            choking: true,
            has: HashSet::new(),
            reserved: None,
            in_flight: None,
            metadata_ext_id: None,
        }
    }

    /// Runs the session until the download completes, the peer misbehaves
    /// or the connection dies. A reservation held at exit is always given
    /// back to the table; the socket closes when the session drops it.
    pub async fn start(&mut self) -> Result<()> {
        let res = self.run().await;
        if let Some(index) = self.reserved.take() {
            self.shared.table.write().await.release(index);
        }
        res
    }

    async fn run(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.state = State::Connecting;
        let socket = timeout(self.shared.conf.read_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| Error::Timeout)??;
        log::info!("Connected to peer {}", self.addr);

        self.state = State::Handshaking;
        let mut socket = Framed::new(socket, HandshakeCodec);
        let handshake = Handshake::new(
            self.shared.info_hash,
            self.shared.client_id,
            self.shared.metadata_mode,
        );
        log::debug!("Sending handshake to peer {}", self.addr);
        socket.send(handshake).await?;

        let peer_handshake =
            match timeout(self.shared.conf.read_timeout, socket.next()).await {
                Ok(Some(handshake)) => handshake?,
                Ok(None) => return Err(Error::Eof),
                Err(_) => return Err(Error::Timeout),
            };
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);
        if peer_handshake.info_hash != self.shared.info_hash {
            log::warn!("Peer {} handshake has a foreign info hash", self.addr);
            return Err(Error::InfoHashMismatch);
        }

        self.state = State::Connected;
        log::info!("Peer {} session state: {:?}", self.addr, self.state);

        // Anything the peer sent after its 68 handshake bytes belongs to
        // the framed stream; FramedParts hands the remainder back.
        let parts = socket.into_parts();
        let mut stream = parts.io;
        let mut buf = parts.read_buf;

        loop {
            while let Some(msg) = PeerCodec.decode(&mut buf)? {
                self.handle_msg(msg).await?;
            }

            if buf.len() >= 4 {
                // a frame's length prefix arrived but its body hasn't;
                // tell the remote we're still here while it finishes
                self.send(&mut stream, Message::KeepAlive).await?;
            } else {
                match self.act(&mut stream).await? {
                    Flow::Read => {}
                    Flow::Poll => continue,
                    Flow::Stop => {
                        log::info!("Peer {} session done, download complete", self.addr);
                        return Ok(());
                    }
                }
            }

            let read = timeout(self.shared.conf.read_timeout, stream.read_buf(&mut buf)).await;
            let n = match read {
                Ok(n) => n?,
                Err(_) => {
                    // a session parked in a read unblocks here; if the
                    // swarm finished in the meantime this is a clean exit
                    if self.shared.table.read().await.all_complete() {
                        return Ok(());
                    }
                    return Err(Error::Timeout);
                }
            };
            if n == 0 {
                if self.shared.table.read().await.all_complete() {
                    return Ok(());
                }
                return Err(Error::Eof);
            }
        }
    }

    async fn send(&self, stream: &mut TcpStream, msg: Message) -> Result<()> {
        let mut out = BytesMut::new();
        PeerCodec.encode(msg, &mut out)?;
        stream.write_all(&out).await?;
        Ok(())
    }

    async fn handle_msg(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                log::debug!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.choking {
                    log::info!("Peer {} choked us", self.addr);
                    self.choking = true;
                    // the peer won't serve the outstanding request; it is
                    // re-sent after the next unchoke
                    self.in_flight = None;
                }
            }
            Message::Unchoke => {
                if self.choking {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.choking = false;
                }
            }
            Message::Have { piece_index } => {
                log::debug!("Peer {} has piece {}", self.addr, piece_index);
                self.has.insert(piece_index);
            }
            Message::Bitfield(bitfield) => {
                // the raw bitfield is padded to a whole byte; spare bits
                // past the piece count are meaningless and the table
                // ignores such indices
                log::info!(
                    "Peer {} sent bitfield with {} pieces",
                    self.addr,
                    bitfield.count_ones()
                );
                self.has.extend(bitfield.iter_ones());
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block(piece_index, offset, data).await?;
            }
            Message::Extended { id, payload } => {
                self.handle_extended(id, &payload).await?;
            }
            Message::Interested | Message::NotInterested => {
                log::debug!("Peer {} toggled interest; we don't serve uploads", self.addr);
            }
            Message::Request(block) | Message::Cancel(block) => {
                log::warn!(
                    "Peer {} sent {:?} but uploading is not supported",
                    self.addr,
                    block
                );
            }
        }
        Ok(())
    }

    /// Stores a received block and, if it was the last one missing,
    /// settles the piece.
    async fn handle_block(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        if self.reserved != Some(piece_index) {
            log::warn!(
                "Peer {} sent a block of piece {} which we did not request",
                self.addr,
                piece_index
            );
            return Err(Error::UnexpectedBlock);
        }
        log::debug!(
            "Received block {}+{} ({} bytes) from peer {}",
            piece_index,
            offset,
            data.len(),
            self.addr
        );
        if self.in_flight == Some(offset) {
            self.in_flight = None;
        }

        let mut table = self.shared.table.write().await;
        let pieces = match &mut *table {
            PieceTable::Content(pieces) => pieces,
            _ => return Ok(()),
        };
        pieces.record_block(piece_index, offset, data);
        match pieces.try_complete(piece_index)? {
            PieceOutcome::Verified => {
                log::info!(
                    "Piece {}/{} verified via peer {}",
                    piece_index + 1,
                    pieces.piece_count(),
                    self.addr
                );
                self.reserved = None;
                self.in_flight = None;
            }
            PieceOutcome::Failed => {
                log::warn!(
                    "Piece {} from peer {} failed verification",
                    piece_index,
                    self.addr
                );
                self.reserved = None;
                self.in_flight = None;
                // don't ask this peer for the same piece again
                self.has.remove(&piece_index);
            }
            PieceOutcome::Incomplete => {}
        }
        Ok(())
    }

    async fn handle_extended(&mut self, id: u8, payload: &[u8]) -> Result<()> {
        if !self.shared.metadata_mode {
            log::debug!("Ignoring extended message from peer {}", self.addr);
            return Ok(());
        }
        if id == EXTENSION_HANDSHAKE_ID {
            self.handle_extension_handshake(payload).await
        } else {
            self.handle_metadata_piece(payload).await
        }
    }

    /// Decodes the peer's extension handshake and, if this session is the
    /// first to learn the metadata size, sizes the metadata table.
    async fn handle_extension_handshake(&mut self, payload: &[u8]) -> Result<()> {
        let dict = bencode::decode(payload)?;
        let m = dict.get(b"m").ok_or(Error::MissingExtensionKey("m"))?;
        let metadata_size = dict
            .get(b"metadata_size")
            .and_then(Value::as_int)
            .ok_or(Error::MissingExtensionKey("metadata_size"))?;
        let ut_metadata = m
            .get(b"ut_metadata")
            .and_then(Value::as_int)
            .ok_or(Error::MissingExtensionKey("ut_metadata"))?;
        if metadata_size <= 0 {
            return Err(Error::Extension("non-positive metadata size"));
        }
        let ut_metadata =
            u8::try_from(ut_metadata).map_err(|_| Error::Extension("bad ut_metadata id"))?;

        let mut table = self.shared.table.write().await;
        if let PieceTable::Pending = &*table {
            let pieces =
                MetadataPieces::new(metadata_size as usize, self.shared.conf.block_len);
            log::info!(
                "Metadata is {} bytes in {} pieces",
                metadata_size,
                pieces.piece_count()
            );
            *table = PieceTable::Metadata(pieces);
        }
        drop(table);

        log::info!(
            "Peer {} speaks ut_metadata as extended id {}",
            self.addr,
            ut_metadata
        );
        self.metadata_ext_id = Some(ut_metadata);
        Ok(())
    }

    /// Handles a `ut_metadata` message: a bencoded dictionary optionally
    /// followed by raw piece bytes. The split point is the decoder's
    /// consumed count, never a scan for a `dictionary` terminator.
    async fn handle_metadata_piece(&mut self, payload: &[u8]) -> Result<()> {
        let (dict, used) = bencode::decode_prefix(payload)?;
        let msg_type = dict
            .get(b"msg_type")
            .and_then(Value::as_int)
            .ok_or(Error::Extension("missing msg_type"))?;
        let index = dict
            .get(b"piece")
            .and_then(Value::as_int)
            .ok_or(Error::Extension("missing piece"))?;
        let index =
            usize::try_from(index).map_err(|_| Error::Extension("negative piece index"))?;

        match msg_type {
            // a request; we don't serve metadata
            0 => log::debug!(
                "Peer {} requested metadata piece {}; not serving",
                self.addr,
                index
            ),
            // data
            1 => {
                let data = payload[used..].to_vec();
                let mut table = self.shared.table.write().await;
                if let PieceTable::Metadata(pieces) = &mut *table {
                    if pieces.store(index, data) {
                        log::info!(
                            "Metadata piece {}/{} received from peer {}",
                            index + 1,
                            pieces.piece_count(),
                            self.addr
                        );
                        if pieces.all_complete() {
                            self.shared
                                .events
                                .send(Event::MetadataComplete)
                                .map_err(|_| Error::Channel)?;
                        }
                    }
                }
            }
            // reject
            2 => log::warn!(
                "Peer {} rejected our request for metadata piece {}",
                self.addr,
                index
            ),
            t => log::warn!("Peer {} sent unknown metadata message type {}", self.addr, t),
        }
        Ok(())
    }

    /// Takes the session's next step once the incoming stream has been
    /// fully drained.
    async fn act(&mut self, stream: &mut TcpStream) -> Result<Flow> {
        enum Mode {
            /// Metadata mode before the extension handshake sized the
            /// table.
            Wait,
            Metadata,
            Content,
        }
        let mode = match &*self.shared.table.read().await {
            PieceTable::Pending => Mode::Wait,
            PieceTable::Metadata(_) => Mode::Metadata,
            PieceTable::Content(_) => Mode::Content,
        };
        match mode {
            Mode::Wait => Ok(Flow::Read),
            Mode::Metadata => self.request_metadata(stream).await,
            Mode::Content => self.request_content(stream).await,
        }
    }

    /// Requests the lowest metadata piece that hasn't arrived yet.
    async fn request_metadata(&mut self, stream: &mut TcpStream) -> Result<Flow> {
        let ext_id = match self.metadata_ext_id {
            Some(ext_id) => ext_id,
            // this peer hasn't sent its extension handshake yet
            None => return Ok(Flow::Read),
        };
        let next = match &*self.shared.table.read().await {
            PieceTable::Metadata(pieces) => pieces.next_missing(),
            _ => None,
        };
        match next {
            Some(index) => {
                log::debug!(
                    "Requesting metadata piece {} from peer {}",
                    index,
                    self.addr
                );
                let mut dict = std::collections::BTreeMap::new();
                dict.insert(b"msg_type".to_vec(), Value::Int(0));
                dict.insert(b"piece".to_vec(), Value::Int(index as i64));
                let payload = bencode::encode(&Value::Dict(dict));
                self.send(stream, Message::Extended { id: ext_id, payload })
                    .await?;
                Ok(Flow::Read)
            }
            None => {
                // every metadata piece is in; give the torrent a moment
                // to verify it and install the content table
                sleep(self.shared.conf.reserve_backoff).await;
                Ok(Flow::Poll)
            }
        }
    }

    /// Keeps the content download moving: asks for permission while
    /// choked, otherwise holds one reservation and one outstanding block
    /// request at a time.
    async fn request_content(&mut self, stream: &mut TcpStream) -> Result<Flow> {
        if self.choking {
            // repeated on every idle pass until the peer unchokes
            log::debug!("Interested in peer {}", self.addr);
            self.send(stream, Message::Interested).await?;
            return Ok(Flow::Read);
        }
        if self.in_flight.is_some() {
            // the block we asked for hasn't arrived yet
            return Ok(Flow::Read);
        }

        let block = {
            let mut table = self.shared.table.write().await;
            let pieces = match &mut *table {
                PieceTable::Content(pieces) => pieces,
                _ => return Ok(Flow::Read),
            };
            if pieces.all_complete() {
                return Ok(Flow::Stop);
            }
            let reserved = match self.reserved {
                Some(index) => Some(index),
                None => {
                    let reserved = pieces.reserve_next(&self.has);
                    if let Some(index) = reserved {
                        log::info!("Peer {} starts piece {}", self.addr, index);
                        self.reserved = reserved;
                    }
                    reserved
                }
            };
            reserved.and_then(|index| pieces.next_request(index))
        };

        match block {
            Some(block) => {
                log::debug!("Requesting block {:?} from peer {}", block, self.addr);
                self.in_flight = Some(block.offset);
                self.send(stream, Message::Request(block)).await?;
                Ok(Flow::Read)
            }
            None => {
                // nothing this peer can give us right now; back off
                // before looking at the table again
                sleep(self.shared.conf.reserve_backoff).await;
                Ok(Flow::Poll)
            }
        }
    }
}
