//! Storage geometry: where each downloaded byte lands on disk.
//!
//! All files of a download are viewed as one contiguous byte array, in
//! descriptor order. Pieces are cut from that array, so a single piece may
//! straddle several files; [`StorageInfo`] answers which files a byte
//! range touches and [`FileInfo::slice`] where inside a file a write goes.

use std::{
    ops::Range,
    path::{Component, PathBuf},
};

use crate::{
    error::{Error, Result},
    metainfo::Info,
    FileIndex, PieceIndex,
};

/// Information about one of the download's files.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The file's path relative to the output directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The byte offset of the file within the download, when all files are
    /// viewed as a single contiguous byte array. This is always 0 for a
    /// single file download.
    pub offset: u64,
}

impl FileInfo {
    /// Returns the file's one past the last byte's offset in the download.
    pub(crate) fn end(&self) -> u64 {
        self.offset + self.len
    }

    /// Returns the part of this file that overlaps with the `len` bytes
    /// starting at the download-wide `offset`.
    ///
    /// The returned slice is clamped to the end of the file, so `len` may
    /// exceed the file length.
    ///
    /// # Panics
    ///
    /// Panics if `offset` does not fall inside the file.
    pub(crate) fn slice(&self, offset: u64, len: u64) -> FileSlice {
        assert!(
            offset >= self.offset && offset < self.end(),
            "offset must fall inside the file"
        );
        FileSlice {
            offset: offset - self.offset,
            len: len.min(self.end() - offset),
        }
    }
}

/// The location of a range of bytes within a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FileSlice {
    /// The byte offset in file, relative to the file's start.
    pub offset: u64,
    /// The length of the slice, in bytes.
    pub len: u64,
}

/// The piece geometry and file layout of a download, extracted from its
/// descriptor.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece, which may be shorter than the rest if
    /// the download size is not an exact multiple of the piece length.
    pub last_piece_len: u32,
    /// The sum of the length of all files.
    pub total_len: u64,
    /// All files of the download, flattened and in descriptor order.
    /// A single file download is a one element list.
    pub files: Vec<FileInfo>,
}

impl StorageInfo {
    /// Extracts the storage layout from a validated descriptor, rejecting
    /// one whose geometry is inconsistent or whose paths try to escape the
    /// output directory.
    pub fn new(info: &Info) -> Result<Self> {
        if info.piece_length == 0 {
            return Err(Error::Metainfo("piece length is zero".into()));
        }
        if info.pieces.len() % 20 != 0 {
            return Err(Error::Metainfo(
                "piece digest string is not a multiple of 20 bytes".into(),
            ));
        }
        let name = sanitize_component(&info.name)?;

        let mut files = Vec::new();
        let mut offset = 0;
        match (&info.files, info.length) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(Error::Metainfo(
                    "descriptor must declare exactly one of length and files".into(),
                ));
            }
            (None, Some(len)) => {
                files.push(FileInfo {
                    path: PathBuf::from(name),
                    len,
                    offset,
                });
                offset = len;
            }
            (Some(entries), None) => {
                if entries.is_empty() {
                    return Err(Error::Metainfo("empty file list".into()));
                }
                for entry in entries {
                    let mut path = PathBuf::from(name);
                    if entry.path.is_empty() {
                        return Err(Error::Metainfo("file with empty path".into()));
                    }
                    for component in &entry.path {
                        path.push(sanitize_component(component)?);
                    }
                    files.push(FileInfo {
                        path,
                        len: entry.length,
                        offset,
                    });
                    offset += entry.length;
                }
            }
        }

        let total_len = offset;
        if total_len == 0 {
            return Err(Error::Metainfo("download is empty".into()));
        }
        let piece_count = info.piece_count();
        let piece_len = info.piece_length;
        // the digest string must cover the content exactly
        let expected_count =
            (total_len + piece_len as u64 - 1) / piece_len as u64;
        if piece_count as u64 != expected_count {
            return Err(Error::Metainfo(format!(
                "{} piece digests for {} pieces of content",
                piece_count, expected_count
            )));
        }
        let last_piece_len =
            (total_len - piece_len as u64 * (piece_count as u64 - 1)) as u32;

        Ok(Self {
            piece_count,
            piece_len,
            last_piece_len,
            total_len,
            files,
        })
    }

    /// Returns the length of the piece at the given index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        assert!(index < self.piece_count);
        if index == self.piece_count - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    /// Returns the piece's first byte's offset in the download.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }

    /// Returns the indices of the files that overlap with the given
    /// left-inclusive range of download-wide byte offsets.
    pub fn files_overlapping(&self, range: Range<u64>) -> Range<FileIndex> {
        // zero length files never receive bytes and are skipped
        let overlaps =
            |f: &FileInfo| f.len > 0 && f.offset < range.end && range.start < f.end();
        let first = match self.files.iter().position(overlaps) {
            Some(first) => first,
            None => return 0..0,
        };
        // files are contiguous, so the overlapping set is too
        let last = self.files.iter().rposition(overlaps).unwrap_or(first);
        first..last + 1
    }
}

/// Validates a descriptor-supplied path component. Anything that could
/// climb out of the output directory is a malformed descriptor.
fn sanitize_component(component: &str) -> Result<&str> {
    let path: &std::path::Path = component.as_ref();
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(component),
        _ => Err(Error::Metainfo(format!(
            "invalid path component {:?}",
            component
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::File;
    use pretty_assertions::assert_eq;

    fn single_file_info(len: u64, piece_length: u32) -> Info {
        let piece_count = ((len + piece_length as u64 - 1) / piece_length as u64) as usize;
        Info {
            files: None,
            length: Some(len),
            name: "content.bin".into(),
            piece_length,
            pieces: vec![0; piece_count * 20],
        }
    }

    #[test]
    fn test_file_slice() {
        let file = FileInfo {
            path: PathBuf::from("a"),
            len: 500,
            offset: 200,
        };

        // a byte range longer than the file is clamped to the file end
        assert_eq!(
            file.slice(300, 1000),
            FileSlice {
                offset: 100,
                len: 400,
            }
        );
        // a byte range inside the file is returned as is
        assert_eq!(file.slice(300, 10), FileSlice { offset: 100, len: 10 });
        // a byte range equal to the whole file
        assert_eq!(file.slice(200, 500), FileSlice { offset: 0, len: 500 });
    }

    #[test]
    #[should_panic(expected = "offset must fall inside the file")]
    fn test_file_slice_before_file_panics() {
        let file = FileInfo {
            path: PathBuf::from("a"),
            len: 500,
            offset: 200,
        };
        file.slice(100, 400);
    }

    #[test]
    #[should_panic(expected = "offset must fall inside the file")]
    fn test_file_slice_past_file_panics() {
        let file = FileInfo {
            path: PathBuf::from("a"),
            len: 500,
            offset: 200,
        };
        file.slice(700, 400);
    }

    #[test]
    fn test_single_file_layout() {
        let storage = StorageInfo::new(&single_file_info(3 * 16 + 5, 16)).unwrap();
        assert_eq!(storage.piece_count, 4);
        assert_eq!(storage.piece_len(0), 16);
        assert_eq!(storage.piece_len(3), 5);
        assert_eq!(storage.piece_offset(2), 32);
        assert_eq!(storage.files.len(), 1);
        assert_eq!(storage.files[0].path, PathBuf::from("content.bin"));
        // every piece falls in the one file
        assert_eq!(storage.files_overlapping(0..16), 0..1);
        assert_eq!(storage.files_overlapping(48..53), 0..1);
    }

    #[test]
    fn test_exact_multiple_has_full_last_piece() {
        let storage = StorageInfo::new(&single_file_info(4 * 16, 16)).unwrap();
        assert_eq!(storage.piece_count, 4);
        assert_eq!(storage.last_piece_len, 16);
    }

    fn multi_file_info() -> Info {
        // files: (offset, len): (0, 9) (9, 11) (20, 7) (27, 9)
        // pieces of 16 bytes: 0 spans files 0..2, 1 spans files 1..4,
        // 2 is the last 4 bytes of file 3
        Info {
            files: Some(vec![
                File { path: vec!["a".into()], length: 9 },
                File { path: vec!["b".into()], length: 11 },
                File { path: vec!["sub".into(), "c".into()], length: 7 },
                File { path: vec!["d".into()], length: 9 },
            ]),
            length: None,
            name: "dir".into(),
            piece_length: 16,
            pieces: vec![0; 3 * 20],
        }
    }

    #[test]
    fn test_multi_file_layout() {
        let storage = StorageInfo::new(&multi_file_info()).unwrap();
        assert_eq!(storage.total_len, 36);
        assert_eq!(storage.last_piece_len, 4);
        assert_eq!(storage.files[2].path, PathBuf::from("dir/sub/c"));
        assert_eq!(storage.files[3].offset, 27);

        assert_eq!(storage.files_overlapping(0..16), 0..2);
        assert_eq!(storage.files_overlapping(16..32), 1..4);
        assert_eq!(storage.files_overlapping(32..36), 3..4);
        // single bytes
        assert_eq!(storage.files_overlapping(8..9), 0..1);
        assert_eq!(storage.files_overlapping(9..10), 1..2);
        // out of range
        assert_eq!(storage.files_overlapping(36..40), 0..0);
    }

    #[test]
    fn test_rejects_inconsistent_geometry() {
        let mut info = single_file_info(100, 16);
        // 100 bytes of 16 byte pieces needs 7 digests
        info.pieces = vec![0; 6 * 20];
        assert!(StorageInfo::new(&info).is_err());

        let mut info = single_file_info(100, 16);
        info.pieces = vec![0; 21];
        assert!(StorageInfo::new(&info).is_err());

        let mut info = single_file_info(100, 16);
        info.piece_length = 0;
        assert!(StorageInfo::new(&info).is_err());

        let mut info = single_file_info(0, 16);
        info.pieces = Vec::new();
        assert!(StorageInfo::new(&info).is_err());
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let mut info = multi_file_info();
        info.files.as_mut().unwrap()[0].path = vec!["..".into(), "evil".into()];
        assert!(StorageInfo::new(&info).is_err());

        let mut info = multi_file_info();
        info.files.as_mut().unwrap()[0].path = vec!["/etc".into()];
        assert!(StorageInfo::new(&info).is_err());

        let mut info = multi_file_info();
        info.name = "".into();
        assert!(StorageInfo::new(&info).is_err());
    }
}
