// SPDX-License-Identifier: Apache-2.0

//! Reader contracts consumed by the buffered line reader and by runners.
//!
//! Optional behaviors (rotation boundaries, lag, line skipping, drained
//! files) are capability probes with default implementations rather than an
//! open interface hierarchy: a source that lacks a capability inherits the
//! no-op default and callers need no downcasts.

pub mod bufreader;
pub mod dirfile;

use std::io;

use serde::{Deserialize, Serialize};

use crate::config::Record;
use crate::error::{Error, Result};

pub use bufreader::BufReader;
pub use dirfile::{DirSource, StartAt};

/// Running stats exposed by readers (and mirrored by parser/sender stages).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatsInfo {
    pub success: u64,
    pub errors: u64,
    #[serde(default)]
    pub last_error: String,
}

/// Backlog information for sources that can measure it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LagInfo {
    pub size: i64,
    pub total: i64,
    pub size_unit: String,
}

/// Records that bytes up to `index` within the reader's buffer came from
/// `source`. Appended when the underlying source rotates mid-buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceIndex {
    pub source: String,
    pub index: usize,
}

/// A byte stream with rotation awareness: the contract the buffered line
/// reader consumes.
pub trait FileSource: Send {
    /// Stable identifier for the logical stream.
    fn name(&self) -> String;

    /// The current underlying physical source (e.g. the file currently
    /// being read in a rotated sequence).
    fn source(&self) -> String;

    /// Read bytes into `buf`. `Ok(0)` means momentarily empty, not end of
    /// stream; a finite source reports its end through an error of kind
    /// `UnexpectedEof`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Checkpoint source-private state (offsets) to the meta store.
    fn sync_meta(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Rotation boundaries for the most recent fetch: `(source, byte count
    /// belonging to the previous source)` pairs. Consumed by the caller.
    fn new_line_bytes_index(&mut self) -> Vec<SourceIndex> {
        Vec::new()
    }

    /// Backlog, for sources that can measure it.
    fn lag(&self) -> Option<LagInfo> {
        None
    }

    /// Line-skip protocol: true when the source attached to a file
    /// mid-stream and the first extracted line may be partial.
    fn is_new_open(&self) -> bool {
        false
    }

    fn set_skipped(&mut self) {}

    /// Files this source has fully consumed since the last call. Feeds the
    /// runner's cleaner.
    fn take_drained(&mut self) -> Vec<String> {
        Vec::new()
    }
}

/// The reader surface a runner drives. Line readers implement `read_line`;
/// data readers (SQL) implement `read_data` and flag themselves through
/// `is_data_reader`. Daemon readers do their work on background tasks
/// started by `start`.
pub trait LogReader: Send {
    fn name(&self) -> String;

    fn source(&self) -> String;

    fn sync_meta(&mut self);

    fn close(&mut self) -> Result<()>;

    fn status(&self) -> StatsInfo {
        StatsInfo::default()
    }

    fn read_line(&mut self) -> Result<String> {
        Err(Error::NotSupport("read_line".into()))
    }

    fn read_data(&mut self) -> Result<Option<(Record, i64)>> {
        Err(Error::NotSupport("read_data".into()))
    }

    fn is_data_reader(&self) -> bool {
        false
    }

    /// Start background tasks for daemon readers.
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Purge reader-private queues and persisted state.
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn lag(&self) -> Option<LagInfo> {
        None
    }

    /// Files fully consumed since the last call, for clean signaling.
    fn take_drained(&mut self) -> Vec<String> {
        Vec::new()
    }
}
