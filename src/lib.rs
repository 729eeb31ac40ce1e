//! A download-only BitTorrent V1 client core.
//!
//! Given a swarm of peer addresses and either a parsed metainfo descriptor
//! or just a 20 byte info hash, [`Torrent`] connects to the peers, fetches
//! the descriptor via the `ut_metadata` extension if it has to, downloads
//! all file content, and commits every piece to disk after verifying it
//! against its SHA-1 digest. Tracker communication, magnet URI parsing and
//! progress display are left to the caller.

pub mod bencode;
mod conf;
mod disk;
pub mod error;
pub mod metainfo;
mod peer;
mod pieces;
mod storage;
mod torrent;

use bitvec::prelude::{BitVec, Msb0};

pub use conf::Conf;
pub use error::{Error, Result};
pub use metainfo::{Info, Metainfo};
pub use storage::FileInfo;
pub use torrent::Torrent;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in
/// the source code we use `usize` to be consistent with other index types
/// in Rust.
pub type PieceIndex = usize;

/// The type of a file's index.
pub type FileIndex = usize;

/// The peer ID is an arbitrary 20 byte string, assigned by the tracker
/// layer for the whole session.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least
/// significant bits, that is, where the first highest bit represents the
/// first piece, the second highest element the second piece, and so on
/// (e.g. `0b1100_0001` would mean that we have pieces 0, 1, and 7).
/// A truthy boolean value of a piece's position in this vector means that
/// the peer has the piece, while a falsy value means it doesn't have the
/// piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// The default block length, the widely used and accepted 16 KiB.
pub const BLOCK_LEN: u32 = 0x4000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happens at this block level
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes.
    pub len: u32,
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32, block_len: u32) -> usize {
    // all pieces are a multiple of the block length, except the last one
    // which may be shorter, so we round up before dividing
    (piece_len as usize + block_len as usize - 1) / block_len as usize
}

/// Returns the length of the block at the index in a piece of the given
/// length.
///
/// If the piece is not a multiple of the block length, the last returned
/// value is smaller. In particular, when the piece _is_ an exact multiple,
/// the last block is a full block, never zero bytes.
///
/// # Panics
///
/// Panics if the index multiplied by the block length would exceed the
/// piece length.
pub(crate) fn block_len_at(piece_len: u32, block_len: u32, index: usize) -> u32 {
    let block_offset = index as u32 * block_len;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, block_len)
}
