//! The piece table: the one piece of state all peer sessions share.
//!
//! The table lives behind a single `RwLock` in [`crate::torrent::Shared`].
//! Sessions take the write guard for the whole of a reserve, record or
//! complete transition, which is what makes the at-most-one-reservation
//! rule hold: the reservation check and the flag write are indivisible.
//!
//! Metadata pieces and content pieces are different shapes: a metadata
//! piece is an opaque byte buffer with no digest of its own (the
//! assembled whole is checked against the info hash), while a content
//! piece is a run of blocks verified against a per-piece SHA-1. They are
//! kept as separate table variants rather than one piece type with
//! optional fields.

use std::collections::HashSet;

use sha1::{Digest, Sha1};

use crate::{
    block_count, block_len_at,
    disk::DiskHandle,
    error::Result,
    storage::StorageInfo,
    BlockInfo, PieceIndex, Sha1Hash,
};

pub(crate) enum PieceTable {
    /// Metadata mode before any peer has advertised the metadata size;
    /// the number of pieces is not yet known.
    Pending,
    Metadata(MetadataPieces),
    Content(ContentPieces),
}

impl PieceTable {
    pub fn all_complete(&self) -> bool {
        match self {
            PieceTable::Pending => false,
            PieceTable::Metadata(pieces) => pieces.all_complete(),
            PieceTable::Content(pieces) => pieces.all_complete(),
        }
    }

    /// Clears the reservation a terminating session still holds. Only
    /// content pieces carry reservations.
    pub fn release(&mut self, index: PieceIndex) {
        if let PieceTable::Content(pieces) = self {
            pieces.release(index);
        }
    }
}

/// Fragments of the bencoded `info` dictionary being fetched from the
/// swarm.
pub(crate) struct MetadataPieces {
    pieces: Vec<Option<Vec<u8>>>,
    metadata_size: usize,
}

impl MetadataPieces {
    pub fn new(metadata_size: usize, block_len: u32) -> Self {
        let count = (metadata_size + block_len as usize - 1) / block_len as usize;
        Self {
            pieces: vec![None; count],
            metadata_size,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// The lowest piece that hasn't arrived yet.
    pub fn next_missing(&self) -> Option<PieceIndex> {
        self.pieces.iter().position(Option::is_none)
    }

    /// Stores a received piece. Returns false if the index is out of
    /// bounds or the piece already arrived from another session.
    pub fn store(&mut self, index: PieceIndex, data: Vec<u8>) -> bool {
        match self.pieces.get_mut(index) {
            Some(slot @ None) => {
                *slot = Some(data);
                true
            }
            _ => false,
        }
    }

    pub fn all_complete(&self) -> bool {
        self.pieces.iter().all(Option::is_some)
    }

    /// Concatenates all pieces into the raw descriptor, truncated to the
    /// advertised metadata size. Returns none while pieces are missing.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        let mut raw = Vec::with_capacity(self.metadata_size);
        for piece in &self.pieces {
            raw.extend_from_slice(piece.as_deref()?);
        }
        raw.truncate(self.metadata_size);
        Some(raw)
    }

    /// Drops all received pieces so the swarm is asked again. Used when
    /// the assembled descriptor does not hash to the info hash.
    pub fn reset(&mut self) {
        for piece in &mut self.pieces {
            *piece = None;
        }
    }
}

/// The outcome of offering a piece for completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PieceOutcome {
    /// The piece hashed to its expected digest and was handed to the disk
    /// task.
    Verified,
    /// The piece hashed to something else; its blocks were dropped and
    /// its reservation cleared.
    Failed,
    /// Blocks are still missing.
    Incomplete,
}

struct Piece {
    /// The expected SHA-1 digest of the whole piece.
    expected_hash: Sha1Hash,
    /// The piece's length in bytes.
    len: u32,
    /// Downloaded blocks, in order. An empty slot is a block that hasn't
    /// arrived. Drained once the piece completes.
    blocks: Vec<Option<Vec<u8>>>,
    /// Never reverts to false once set.
    complete: bool,
    /// True while exactly one session is downloading this piece.
    requesting: bool,
}

/// The content pieces of the download proper.
pub(crate) struct ContentPieces {
    pieces: Vec<Piece>,
    block_len: u32,
    complete_count: usize,
    /// Verified pieces are handed to the disk task from within the table
    /// lock, so a piece marked complete has always been offered to the
    /// sink.
    disk: DiskHandle,
}

impl ContentPieces {
    /// Builds the table from the download geometry and the descriptor's
    /// concatenated piece digests.
    pub fn new(
        storage: &StorageInfo,
        piece_hashes: &[u8],
        block_len: u32,
        disk: DiskHandle,
    ) -> Self {
        debug_assert_eq!(piece_hashes.len(), storage.piece_count * 20);
        let pieces = (0..storage.piece_count)
            .map(|index| {
                let mut expected_hash = [0; 20];
                expected_hash.copy_from_slice(&piece_hashes[index * 20..index * 20 + 20]);
                let len = storage.piece_len(index);
                Piece {
                    expected_hash,
                    len,
                    blocks: vec![None; block_count(len, block_len)],
                    complete: false,
                    requesting: false,
                }
            })
            .collect();
        Self {
            pieces,
            block_len,
            complete_count: 0,
            disk,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn all_complete(&self) -> bool {
        self.complete_count == self.pieces.len()
    }

    /// Selects the lowest piece that is incomplete, unreserved and held by
    /// the peer, and reserves it for the caller.
    pub fn reserve_next(&mut self, peer_has: &HashSet<PieceIndex>) -> Option<PieceIndex> {
        let index = self.pieces.iter().enumerate().find_map(|(index, piece)| {
            (!piece.complete && !piece.requesting && peer_has.contains(&index))
                .then_some(index)
        })?;
        self.pieces[index].requesting = true;
        Some(index)
    }

    /// Clears a reservation without completing the piece.
    pub fn release(&mut self, index: PieceIndex) {
        if let Some(piece) = self.pieces.get_mut(index) {
            piece.requesting = false;
        }
    }

    /// Stores a received block inside the piece. Out of range blocks are
    /// dropped.
    pub fn record_block(&mut self, index: PieceIndex, offset: u32, data: Vec<u8>) {
        let block_len = self.block_len;
        let piece = match self.pieces.get_mut(index) {
            Some(piece) if !piece.complete => piece,
            _ => return,
        };
        if let Some(slot) = piece.blocks.get_mut((offset / block_len) as usize) {
            *slot = Some(data);
        } else {
            log::warn!("Dropping block at invalid offset {} in piece {}", offset, index);
        }
    }

    /// The next block to request for the piece: its lowest missing block.
    /// Returns none when every block has arrived.
    pub fn next_request(&self, index: PieceIndex) -> Option<BlockInfo> {
        let piece = self.pieces.get(index)?;
        let block = piece.blocks.iter().position(Option::is_none)?;
        Some(BlockInfo {
            piece_index: index,
            offset: block as u32 * self.block_len,
            len: block_len_at(piece.len, self.block_len, block),
        })
    }

    /// When all blocks of the piece are present, hashes them and either
    /// commits the piece (marked complete, bytes handed to the disk task)
    /// or rolls it back (blocks cleared, reservation released) so another
    /// peer can retry it.
    pub fn try_complete(&mut self, index: PieceIndex) -> Result<PieceOutcome> {
        let piece = match self.pieces.get_mut(index) {
            Some(piece) if !piece.complete => piece,
            _ => return Ok(PieceOutcome::Incomplete),
        };
        if piece.blocks.iter().any(Option::is_none) {
            return Ok(PieceOutcome::Incomplete);
        }

        // taking the blocks both assembles the piece and, on a digest
        // mismatch, leaves the piece rolled back to empty
        let mut data = Vec::with_capacity(piece.len as usize);
        for block in &mut piece.blocks {
            if let Some(block) = block.take() {
                data.extend_from_slice(&block);
            }
        }
        piece.requesting = false;

        let digest = Sha1::digest(&data);
        if digest.as_slice() != piece.expected_hash {
            log::warn!(
                "Piece {} hashed to {} instead of {}",
                index,
                hex::encode(digest),
                hex::encode(piece.expected_hash)
            );
            return Ok(PieceOutcome::Failed);
        }

        piece.complete = true;
        self.complete_count += 1;
        self.disk.write_piece(index, data)?;
        Ok(PieceOutcome::Verified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{disk, metainfo::Info};

    fn test_storage(piece_count: usize, piece_len: u32, last_piece_len: u32) -> StorageInfo {
        let total = piece_len as u64 * (piece_count as u64 - 1) + last_piece_len as u64;
        let info = Info {
            files: None,
            length: Some(total),
            name: "t".into(),
            piece_length: piece_len,
            pieces: vec![0; piece_count * 20],
        };
        StorageInfo::new(&info).unwrap()
    }

    fn content_pieces(
        piece_count: usize,
        piece_len: u32,
        block_len: u32,
        content: &[u8],
    ) -> (ContentPieces, tokio::sync::mpsc::UnboundedReceiver<disk::Command>) {
        let last = content.len() as u32 - piece_len * (piece_count as u32 - 1);
        let storage = test_storage(piece_count, piece_len, last);
        let mut hashes = Vec::new();
        for index in 0..piece_count {
            let start = index * piece_len as usize;
            let end = (start + piece_len as usize).min(content.len());
            hashes.extend_from_slice(&Sha1::digest(&content[start..end]));
        }
        let (disk, port) = DiskHandle::for_tests();
        (ContentPieces::new(&storage, &hashes, block_len, disk), port)
    }

    fn has(indices: &[PieceIndex]) -> HashSet<PieceIndex> {
        indices.iter().copied().collect()
    }

    #[test]
    fn test_reserve_lowest_available_first() {
        let content = vec![7u8; 64];
        let (mut pieces, _port) = content_pieces(4, 16, 16, &content);

        assert_eq!(pieces.reserve_next(&has(&[1, 3])), Some(1));
        // piece 1 is now held, so the same availability yields 3
        assert_eq!(pieces.reserve_next(&has(&[1, 3])), Some(3));
        assert_eq!(pieces.reserve_next(&has(&[1, 3])), None);
        // a peer with nothing we miss gets nothing
        assert_eq!(pieces.reserve_next(&has(&[])), None);

        pieces.release(1);
        assert_eq!(pieces.reserve_next(&has(&[1, 3])), Some(1));
    }

    #[test]
    fn test_verified_piece_is_committed() {
        let content: Vec<u8> = (0u32..48).map(|b| b as u8).collect();
        let (mut pieces, mut port) = content_pieces(3, 16, 8, &content);

        assert_eq!(pieces.reserve_next(&has(&[0, 1, 2])), Some(0));
        assert_eq!(
            pieces.next_request(0),
            Some(BlockInfo { piece_index: 0, offset: 0, len: 8 })
        );
        pieces.record_block(0, 0, content[0..8].to_vec());
        assert_eq!(pieces.try_complete(0).unwrap(), PieceOutcome::Incomplete);
        assert_eq!(
            pieces.next_request(0),
            Some(BlockInfo { piece_index: 0, offset: 8, len: 8 })
        );
        pieces.record_block(0, 8, content[8..16].to_vec());
        assert_eq!(pieces.try_complete(0).unwrap(), PieceOutcome::Verified);
        assert!(!pieces.all_complete());

        // the bytes were offered to the sink
        match port.try_recv().unwrap() {
            disk::Command::WritePiece { index, data } => {
                assert_eq!(index, 0);
                assert_eq!(data, &content[0..16]);
            }
            _ => panic!("expected a piece write"),
        }

        // a committed piece can't be reserved again
        assert_eq!(pieces.reserve_next(&has(&[0])), None);
    }

    #[test]
    fn test_failed_verification_rolls_the_piece_back() {
        let content = vec![3u8; 32];
        let (mut pieces, mut port) = content_pieces(2, 16, 16, &content);

        assert_eq!(pieces.reserve_next(&has(&[0, 1])), Some(0));
        pieces.record_block(0, 0, vec![0xAA; 16]);
        assert_eq!(pieces.try_complete(0).unwrap(), PieceOutcome::Failed);
        assert!(port.try_recv().is_err());

        // the piece is empty and unreserved again
        assert_eq!(
            pieces.next_request(0),
            Some(BlockInfo { piece_index: 0, offset: 0, len: 16 })
        );
        assert_eq!(pieces.reserve_next(&has(&[0])), Some(0));
        pieces.record_block(0, 0, content[0..16].to_vec());
        assert_eq!(pieces.try_complete(0).unwrap(), PieceOutcome::Verified);
    }

    #[test]
    fn test_short_last_piece_geometry() {
        let content = vec![9u8; 16 + 5];
        let (pieces, _port) = content_pieces(2, 16, 8, &content);
        // 5 byte last piece holds a single short block
        assert_eq!(
            pieces.next_request(1),
            Some(BlockInfo { piece_index: 1, offset: 0, len: 5 })
        );
    }

    #[test]
    fn test_all_complete() {
        let content = vec![1u8; 32];
        let (mut pieces, _port) = content_pieces(2, 16, 16, &content);
        assert!(!pieces.all_complete());
        for index in 0..2 {
            assert_eq!(pieces.reserve_next(&has(&[0, 1])), Some(index));
            pieces.record_block(index, 0, content[..16].to_vec());
            assert_eq!(pieces.try_complete(index).unwrap(), PieceOutcome::Verified);
        }
        assert!(pieces.all_complete());
    }

    #[test]
    fn test_metadata_pieces() {
        // 20 bytes of metadata in 8 byte fragments
        let mut pieces = MetadataPieces::new(20, 8);
        assert_eq!(pieces.piece_count(), 3);
        assert_eq!(pieces.next_missing(), Some(0));
        assert!(pieces.store(0, b"01234567".to_vec()));
        assert_eq!(pieces.next_missing(), Some(1));
        // duplicates and out of range indices are dropped
        assert!(!pieces.store(0, b"xxxxxxxx".to_vec()));
        assert!(!pieces.store(3, b"xxxxxxxx".to_vec()));
        assert!(pieces.assemble().is_none());

        assert!(pieces.store(2, b"6789".to_vec()));
        assert!(pieces.store(1, b"89012345".to_vec()));
        assert!(pieces.all_complete());
        assert_eq!(pieces.assemble().unwrap(), b"01234567890123456789".to_vec());

        pieces.reset();
        assert!(!pieces.all_complete());
        assert_eq!(pieces.next_missing(), Some(0));
    }
}
