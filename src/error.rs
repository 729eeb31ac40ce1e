//! The error type shared by all parts of the crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket-level read (or connect) timeout elapsed.
    #[error("peer connection timed out")]
    Timeout,

    /// The peer closed the connection.
    #[error("peer closed the connection")]
    Eof,

    /// The peer's handshake was not a valid BitTorrent handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The info hash in the peer's handshake is not the one we announced.
    #[error("peer handshake info hash does not match ours")]
    InfoHashMismatch,

    #[error("invalid message id {0}")]
    InvalidMessageId(u8),

    /// A message payload was shorter than its id requires.
    #[error("malformed {0} message payload")]
    InvalidPayload(&'static str),

    /// A frame length prefix exceeded the sanity limit.
    #[error("frame of {0} bytes is too large")]
    FrameTooLarge(usize),

    #[error("malformed bencode: {0}")]
    Bencode(&'static str),

    /// The extension handshake lacked a key the metadata exchange needs.
    #[error("extension handshake is missing key {0}")]
    MissingExtensionKey(&'static str),

    /// A `ut_metadata` message did not have the expected shape.
    #[error("malformed extension message: {0}")]
    Extension(&'static str),

    /// The peer sent a block for a piece this session did not request.
    #[error("block does not belong to the requested piece")]
    UnexpectedBlock,

    #[error("malformed metainfo: {0}")]
    Metainfo(String),

    /// The tracker layer supplied an empty peer list.
    #[error("no peers to download from")]
    NoPeers,

    /// Every peer session ended before the download finished.
    #[error("all peer connections closed before the download finished")]
    PeersExhausted,

    /// An internal channel closed, meaning its owning task is gone.
    #[error("internal channel closed")]
    Channel,
}
