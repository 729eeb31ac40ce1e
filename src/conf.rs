//! This module defines the types used to configure a download.

use std::{path::PathBuf, time::Duration};

use crate::BLOCK_LEN;

/// The configuration of a single download.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The directory under which a download's files are placed. Multi-file
    /// downloads get a subdirectory named after the torrent so their
    /// entries don't scatter across the output directory.
    pub output_dir: PathBuf,

    /// The length of the blocks pieces are requested in. Metadata pieces
    /// use the same granularity. There is rarely a reason to deviate from
    /// [`BLOCK_LEN`].
    pub block_len: u32,

    /// How long a session blocks on its socket before giving up on the
    /// peer. This is also what unblocks sessions parked in a read when the
    /// download completes underneath them.
    pub read_timeout: Duration,

    /// How long a session sleeps between reservation attempts when no
    /// piece is currently assignable to it.
    pub reserve_backoff: Duration,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// output directory, as it is not sensible to guess that for the user.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            block_len: BLOCK_LEN,
            read_timeout: Duration::from_secs(10),
            reserve_backoff: Duration::from_millis(100),
        }
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self::new("complete")
    }
}
