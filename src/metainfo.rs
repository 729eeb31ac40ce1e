//! Parsing of the metainfo descriptor.
//!
//! A descriptor arrives either as a whole `.torrent` file (a dictionary
//! whose `info` key holds the content description) or, when the download
//! starts from a bare info hash, as the raw bencoded `info` dictionary
//! fetched from the swarm via the metadata extension.

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    Sha1Hash,
};

/// A parsed `.torrent` file.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        serde_bencode::from_bytes(buf).map_err(|e| Error::Metainfo(e.to_string()))
    }
}

/// The `info` dictionary of a descriptor: the content's name, piece
/// geometry, expected piece digests and file list.
///
/// Field order matches the canonical (sorted) bencode key order so that
/// serializing an `Info` produces bytes that hash to its info hash.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    /// Files of a multi-file download. Mutually exclusive with `length`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,
    /// The content length of a single-file download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    /// The concatenation of all pieces' 20 byte SHA-1 digests.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
}

impl Info {
    /// Parses a raw bencoded `info` dictionary, as assembled from
    /// `ut_metadata` pieces.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        serde_bencode::from_bytes(buf).map_err(|e| Error::Metainfo(e.to_string()))
    }

    /// The sum of all file lengths.
    pub fn total_len(&self) -> u64 {
        match (&self.files, self.length) {
            (Some(files), _) => files.iter().map(|f| f.length).sum(),
            (None, Some(length)) => length,
            (None, None) => 0,
        }
    }

    /// The number of pieces declared by the digest string.
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// The expected digest of the piece at the given index.
    pub fn piece_hash(&self, index: usize) -> Option<Sha1Hash> {
        let slice = self.pieces.get(index * 20..index * 20 + 20)?;
        let mut hash = [0; 20];
        hash.copy_from_slice(slice);
        Some(hash)
    }
}

/// One file of a multi-file download.
#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    /// The file's path components below the download's name directory.
    pub path: Vec<String>,
    pub length: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_single_file_info() {
        let raw = b"d6:lengthi32768e4:name6:s1.bin12:piece lengthi16384e\
                    6:pieces40:0123456789012345678901234567890123456789e";
        let info = Info::from_bytes(raw).unwrap();
        assert_eq!(info.name, "s1.bin");
        assert_eq!(info.piece_length, 16384);
        assert_eq!(info.length, Some(32768));
        assert_eq!(info.total_len(), 32768);
        assert_eq!(info.piece_count(), 2);
        assert_eq!(info.piece_hash(0).unwrap(), *b"01234567890123456789");
        assert_eq!(info.piece_hash(1).unwrap(), *b"01234567890123456789");
        assert!(info.piece_hash(2).is_none());
    }

    #[test]
    fn test_parse_multi_file_metainfo() {
        let raw = b"d4:infod5:filesld6:lengthi3e4:pathl1:a1:bee\
                    d6:lengthi7e4:pathl1:cee\
                    e4:name3:dir12:piece lengthi16384e\
                    6:pieces20:01234567890123456789ee";
        let metainfo = Metainfo::from_bytes(raw).unwrap();
        let info = metainfo.info;
        assert_eq!(info.name, "dir");
        assert_eq!(info.length, None);
        let files = info.files.as_ref().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, vec!["a", "b"]);
        assert_eq!(files[0].length, 3);
        assert_eq!(files[1].path, vec!["c"]);
        assert_eq!(info.total_len(), 10);
    }

    // A serialized descriptor must decode back to itself: the metadata
    // fetched from the swarm is hashed byte for byte.
    #[test]
    fn test_info_serialization_round_trips() {
        let info = Info {
            files: None,
            length: Some(123),
            name: "x".into(),
            piece_length: 64,
            pieces: b"01234567890123456789".to_vec(),
        };
        let raw = serde_bencode::to_bytes(&info).unwrap();
        let back = Info::from_bytes(&raw).unwrap();
        assert_eq!(serde_bencode::to_bytes(&back).unwrap(), raw);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Metainfo::from_bytes(b"not bencode").is_err());
        assert!(Info::from_bytes(b"d4:name1:xe").is_err());
    }
}
