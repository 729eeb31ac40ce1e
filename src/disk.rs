//! The disk task: persists verified pieces into the download's files.
//!
//! Sessions never touch the file system; the piece table hands each
//! verified piece to this task over a channel and gets on with the
//! download. Pieces may arrive in any order and may straddle file
//! boundaries; each write lands at the piece's absolute offset within
//! the concatenated content stream.

use std::{
    fs::{self, File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::Path,
    sync::{Arc, Mutex},
};

use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task,
};

use crate::{
    error::{Error, Result},
    storage::{FileInfo, StorageInfo},
    torrent::Event,
    PieceIndex,
};

/// The channel on which the torrent and the piece table talk to the disk
/// task.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_chan: UnboundedSender<Command>,
}

impl DiskHandle {
    /// Queues a verified piece for writing.
    pub fn write_piece(&self, index: PieceIndex, data: Vec<u8>) -> Result<()> {
        self.cmd_chan
            .send(Command::WritePiece { index, data })
            .map_err(|_| Error::Channel)
    }

    /// Eventually shuts down the disk task.
    pub fn shutdown(&self) -> Result<()> {
        self.cmd_chan
            .send(Command::Shutdown)
            .map_err(|_| Error::Channel)
    }

    /// A handle whose commands go to the returned receiver instead of a
    /// disk task.
    #[cfg(test)]
    pub fn for_tests() -> (Self, UnboundedReceiver<Command>) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (Self { cmd_chan }, cmd_port)
    }
}

/// The commands the disk task can receive.
pub(crate) enum Command {
    WritePiece { index: PieceIndex, data: Vec<u8> },
    Shutdown,
}

/// The entity responsible for saving verified pieces to disk.
pub(crate) struct Disk {
    storage: StorageInfo,
    /// Handles of all files in the download, opened up front. Each writer
    /// gets exclusive access to the file handle it needs.
    files: Arc<Vec<Mutex<OutputFile>>>,
    cmd_port: UnboundedReceiver<Command>,
    /// Channel on which the disk task reports written pieces back to the
    /// torrent.
    event_chan: UnboundedSender<Event>,
}

impl Disk {
    /// Creates the download's directory structure, opens (and thereby
    /// creates) every declared file and returns the task alongside a
    /// handle to command it.
    pub fn new(
        storage: StorageInfo,
        output_dir: &Path,
        event_chan: UnboundedSender<Event>,
    ) -> Result<(Self, DiskHandle)> {
        let mut files = Vec::with_capacity(storage.files.len());
        for info in &storage.files {
            let path = output_dir.join(&info.path);
            if let Some(subdir) = path.parent() {
                fs::create_dir_all(subdir)?;
            }
            log::debug!("Opening output file {:?} ({} bytes)", path, info.len);
            let handle = OpenOptions::new().create(true).write(true).open(&path)?;
            files.push(Mutex::new(OutputFile {
                info: info.clone(),
                handle,
            }));
        }

        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        Ok((
            Self {
                storage,
                files: Arc::new(files),
                cmd_port,
                event_chan,
            },
            DiskHandle { cmd_chan },
        ))
    }

    /// Runs the disk task until shutdown or until every command sender is
    /// gone.
    pub async fn run(mut self) {
        log::info!("Starting disk task");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::WritePiece { index, data } => {
                    let offset = self.storage.piece_offset(index);
                    let range = self
                        .storage
                        .files_overlapping(offset..offset + data.len() as u64);
                    let files = Arc::clone(&self.files);

                    // hashing happened in the piece table; this is sync
                    // file io, so keep it off the executor
                    let res = task::spawn_blocking(move || {
                        write_piece(&files[range], offset, &data)
                    })
                    .await
                    .expect("disk write task panicked");

                    let event = match res {
                        Ok(()) => Event::PieceWritten(index),
                        Err(e) => {
                            log::error!("Failed to write piece {}: {}", index, e);
                            Event::DiskError(e)
                        }
                    };
                    if self.event_chan.send(event).is_err() {
                        break;
                    }
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk task");
                    break;
                }
            }
        }
    }
}

/// Writes one piece across the files it overlaps, at the piece's absolute
/// offset within the download.
fn write_piece(
    files: &[Mutex<OutputFile>],
    mut offset: u64,
    data: &[u8],
) -> Result<()> {
    let mut cursor = 0;
    for file in files {
        let mut file = file.lock().expect("file mutex poisoned");
        if file.info.len == 0 {
            continue;
        }
        let slice = file.info.slice(offset, (data.len() - cursor) as u64);
        file.handle.seek(SeekFrom::Start(slice.offset))?;
        file.handle
            .write_all(&data[cursor..cursor + slice.len as usize])?;
        cursor += slice.len as usize;
        offset += slice.len;
    }
    debug_assert_eq!(cursor, data.len());
    Ok(())
}

struct OutputFile {
    info: FileInfo,
    handle: File,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{File as MetaFile, Info};
    use crate::torrent::Event;

    fn multi_file_storage() -> StorageInfo {
        let info = Info {
            files: Some(vec![
                MetaFile { path: vec!["a.bin".into()], length: 10 },
                MetaFile { path: vec!["sub".into(), "b.bin".into()], length: 20 },
                MetaFile { path: vec!["c.bin".into()], length: 6 },
            ]),
            length: None,
            name: "out".into(),
            piece_length: 16,
            pieces: vec![0; 3 * 20],
        };
        StorageInfo::new(&info).unwrap()
    }

    #[tokio::test]
    async fn test_out_of_order_pieces_land_in_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = multi_file_storage();
        let content: Vec<u8> = (0u32..36).map(|b| b as u8).collect();

        let (event_chan, mut events) = mpsc::unbounded_channel();
        let (disk, handle) = Disk::new(storage, dir.path(), event_chan).unwrap();
        let task = tokio::spawn(disk.run());

        // deliver the pieces back to front
        handle.write_piece(2, content[32..36].to_vec()).unwrap();
        handle.write_piece(1, content[16..32].to_vec()).unwrap();
        handle.write_piece(0, content[0..16].to_vec()).unwrap();

        let mut written = Vec::new();
        for _ in 0..3 {
            match events.recv().await.unwrap() {
                Event::PieceWritten(index) => written.push(index),
                _ => panic!("expected a written piece"),
            }
        }
        written.sort_unstable();
        assert_eq!(written, vec![0, 1, 2]);

        handle.shutdown().unwrap();
        task.await.unwrap();

        let base = dir.path().join("out");
        assert_eq!(fs::read(base.join("a.bin")).unwrap(), &content[0..10]);
        assert_eq!(
            fs::read(base.join("sub").join("b.bin")).unwrap(),
            &content[10..30]
        );
        assert_eq!(fs::read(base.join("c.bin")).unwrap(), &content[30..36]);
    }
}
