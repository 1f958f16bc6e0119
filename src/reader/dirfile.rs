// SPDX-License-Identifier: Apache-2.0

//! Directory file source: the files of one directory, in name order, read
//! as a single virtual byte stream.
//!
//! The current file is tailed until a successor (a lexically later name)
//! appears; the source then switches files inside a single `read` call and
//! reports the boundary so the buffered reader can keep per-line source
//! attribution exact. Fully consumed files are reported as drained, which
//! feeds the runner's cleaner. The `(file, offset)` position persists
//! through the meta store's offset file.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::meta::Meta;
use crate::reader::{FileSource, LagInfo, SourceIndex};

/// Where to start when no checkpoint exists yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartAt {
    #[default]
    Beginning,
    /// Attach to the newest file at its end. The first extracted line may
    /// be partial, so the line-skip protocol is armed.
    End,
}

impl std::str::FromStr for StartAt {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "beginning" | "oldest" => Ok(StartAt::Beginning),
            "end" | "newest" => Ok(StartAt::End),
            _ => Err(format!(
                "invalid start position '{}', expected beginning or end",
                s
            )),
        }
    }
}

struct OpenFile {
    path: PathBuf,
    file: File,
    offset: u64,
}

pub struct DirSource {
    dir: PathBuf,
    meta: Arc<Meta>,
    current: Option<OpenFile>,
    boundaries: Vec<SourceIndex>,
    drained: Vec<String>,
    new_open: bool,
    start_at: StartAt,
    initialized: bool,
    last_sync: Option<(PathBuf, u64)>,
}

impl DirSource {
    /// Open a source over `dir`, restoring the `(file, offset)` position
    /// from the meta store when present.
    pub fn new(dir: impl Into<PathBuf>, meta: Arc<Meta>, start_at: StartAt) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(Error::LogDirNotExist(dir));
        }

        let mut src = DirSource {
            dir,
            meta,
            current: None,
            boundaries: Vec::new(),
            drained: Vec::new(),
            new_open: false,
            start_at,
            initialized: false,
            last_sync: None,
        };
        src.restore()?;
        Ok(src)
    }

    fn restore(&mut self) -> Result<()> {
        let (stored_path, offset) = match self.meta.read_offset()? {
            Some((p, o)) => (PathBuf::from(p), o.max(0) as u64),
            None => return Ok(()),
        };
        self.initialized = true;

        if stored_path.is_file() {
            let size = fs::metadata(&stored_path)?.len();
            if offset <= size {
                let mut file = File::open(&stored_path)?;
                file.seek(SeekFrom::Start(offset))?;
                info!(
                    runner = self.meta.runner_name(),
                    file = %stored_path.display(),
                    offset,
                    "restored file position"
                );
                self.current = Some(OpenFile {
                    path: stored_path,
                    file,
                    offset,
                });
                return Ok(());
            }
            // shrunk underneath us, likely truncated and rewritten
            warn!(
                runner = self.meta.runner_name(),
                file = %stored_path.display(),
                "checkpointed offset beyond file size, restarting file"
            );
            let file = File::open(&stored_path)?;
            self.current = Some(OpenFile {
                path: stored_path,
                file,
                offset: 0,
            });
            return Ok(());
        }

        // The checkpointed file is gone (rotated away and cleaned); resume
        // at the next file in order, if any.
        if let Some(next) = self.next_file_after(Some(&stored_path))? {
            debug!(
                runner = self.meta.runner_name(),
                next = %next.display(),
                "checkpointed file is gone, resuming at successor"
            );
            self.open_file(next, 0)?;
        }
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with('.') {
                    continue;
                }
            }
            files.push(path);
        }
        files.sort();
        Ok(files)
    }

    /// The first file lexically after `path` (or the first file at all when
    /// `path` is `None`).
    fn next_file_after(&self, path: Option<&Path>) -> Result<Option<PathBuf>> {
        let files = self.list_files()?;
        Ok(match path {
            Some(p) => files.into_iter().find(|f| f.as_path() > p),
            None => files.into_iter().next(),
        })
    }

    fn open_file(&mut self, path: PathBuf, offset: u64) -> Result<()> {
        let mut file = File::open(&path)?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }
        self.current = Some(OpenFile { path, file, offset });
        Ok(())
    }

    /// First-time file selection, honoring `start_at`.
    fn initialize(&mut self) -> Result<()> {
        self.initialized = true;
        let files = self.list_files()?;
        match self.start_at {
            StartAt::Beginning => {
                if let Some(first) = files.into_iter().next() {
                    self.open_file(first, 0)?;
                }
            }
            StartAt::End => {
                if let Some(last) = files.into_iter().next_back() {
                    let size = fs::metadata(&last)?.len();
                    self.open_file(last, size)?;
                    if size > 0 {
                        self.new_open = true;
                    }
                }
            }
        }
        Ok(())
    }

    /// Switch to the successor file, recording the rotation boundary and
    /// marking the old file drained.
    fn rotate_to(&mut self, next: PathBuf) -> Result<()> {
        if let Some(old) = self.current.take() {
            info!(
                runner = self.meta.runner_name(),
                from = %old.path.display(),
                to = %next.display(),
                "rotating to next file"
            );
            self.boundaries.push(SourceIndex {
                source: old.path.display().to_string(),
                index: 0,
            });
            if let Some(name) = old.path.file_name().and_then(|n| n.to_str()) {
                self.drained.push(name.to_string());
            }
        }
        self.open_file(next, 0)
    }
}

impl FileSource for DirSource {
    fn name(&self) -> String {
        format!("dirfile:{}", self.dir.display())
    }

    fn source(&self) -> String {
        match &self.current {
            Some(of) => of.path.display().to_string(),
            None => self.dir.display().to_string(),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.initialized {
            self.initialize()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        }
        if self.current.is_none() {
            if let Ok(Some(first)) = self.next_file_after(None) {
                self.open_file(first, 0)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            } else {
                return Ok(0);
            }
        }

        loop {
            let of = match self.current.as_mut() {
                Some(of) => of,
                None => return Ok(0),
            };
            let n = of.file.read(buf)?;
            if n > 0 {
                of.offset += n as u64;
                return Ok(n);
            }

            // Current file exhausted. Tail it until a successor shows up.
            let current_path = of.path.clone();
            match self
                .next_file_after(Some(&current_path))
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
            {
                Some(next) => {
                    self.rotate_to(next)
                        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
                }
                None => return Ok(0),
            }
        }
    }

    fn sync_meta(&mut self) -> Result<()> {
        if let Some(of) = &self.current {
            let snapshot = (of.path.clone(), of.offset);
            if self.last_sync.as_ref() == Some(&snapshot) {
                return Ok(());
            }
            self.meta
                .write_offset(&of.path.display().to_string(), of.offset as i64)?;
            self.last_sync = Some(snapshot);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.current = None;
        Ok(())
    }

    fn new_line_bytes_index(&mut self) -> Vec<SourceIndex> {
        std::mem::take(&mut self.boundaries)
    }

    fn lag(&self) -> Option<LagInfo> {
        let of = self.current.as_ref()?;
        let mut remaining: i64 = 0;
        let mut total: i64 = 0;
        if let Ok(files) = self.list_files() {
            for f in files {
                let size = fs::metadata(&f).map(|m| m.len()).unwrap_or(0) as i64;
                total += size;
                if f.as_path() > of.path.as_path() {
                    remaining += size;
                } else if f == of.path {
                    remaining += size - of.offset as i64;
                }
            }
        }
        Some(LagInfo {
            size: remaining.max(0),
            total,
            size_unit: "bytes".to_string(),
        })
    }

    fn is_new_open(&self) -> bool {
        self.new_open
    }

    fn set_skipped(&mut self) {
        self.new_open = false;
    }

    fn take_drained(&mut self) -> Vec<String> {
        std::mem::take(&mut self.drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn new_meta(dir: &TempDir) -> Arc<Meta> {
        Arc::new(Meta::new(dir.path().join("meta"), "test", "logs").unwrap())
    }

    fn write_file(dir: &Path, name: &str, content: &str) {
        let mut f = File::create(dir.join(name)).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.sync_all().unwrap();
    }

    fn read_all(src: &mut DirSource) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 32];
        loop {
            match src.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) => panic!("read error: {}", e),
            }
        }
        out
    }

    #[test]
    fn missing_directory_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = DirSource::new(dir.path().join("nope"), new_meta(&dir), StartAt::Beginning);
        assert!(matches!(err, Err(Error::LogDirNotExist(_))));
    }

    #[test]
    fn reads_files_in_name_order() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir(&logs).unwrap();
        write_file(&logs, "a.log", "one\n");
        write_file(&logs, "b.log", "two\n");

        let mut src = DirSource::new(&logs, new_meta(&dir), StartAt::Beginning).unwrap();
        assert_eq!(read_all(&mut src), b"one\ntwo\n");
        assert!(src.source().ends_with("b.log"));
    }

    #[test]
    fn rotation_reports_boundary_and_drained_file() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir(&logs).unwrap();
        write_file(&logs, "a.log", "one\n");

        let mut src = DirSource::new(&logs, new_meta(&dir), StartAt::Beginning).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(src.read(&mut buf).unwrap(), 4);
        assert_eq!(src.read(&mut buf).unwrap(), 0); // tailing a.log

        write_file(&logs, "b.log", "two\n");
        assert_eq!(src.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"two\n");

        let boundaries = src.new_line_bytes_index();
        assert_eq!(boundaries.len(), 1);
        assert!(boundaries[0].source.ends_with("a.log"));
        assert_eq!(boundaries[0].index, 0);
        assert_eq!(src.take_drained(), vec!["a.log".to_string()]);
        assert!(src.take_drained().is_empty());
    }

    #[test]
    fn offset_checkpoint_round_trip() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir(&logs).unwrap();
        write_file(&logs, "a.log", "one\ntwo\n");
        let meta = new_meta(&dir);

        {
            let mut src = DirSource::new(&logs, meta.clone(), StartAt::Beginning).unwrap();
            let mut buf = [0u8; 4];
            assert_eq!(src.read(&mut buf).unwrap(), 4);
            src.sync_meta().unwrap();
        }

        let mut src = DirSource::new(&logs, meta, StartAt::Beginning).unwrap();
        assert_eq!(read_all(&mut src), b"two\n");
    }

    #[test]
    fn restore_skips_to_successor_when_file_is_gone() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir(&logs).unwrap();
        write_file(&logs, "a.log", "one\n");
        let meta = new_meta(&dir);

        {
            let mut src = DirSource::new(&logs, meta.clone(), StartAt::Beginning).unwrap();
            let mut buf = [0u8; 32];
            assert_eq!(src.read(&mut buf).unwrap(), 4);
            src.sync_meta().unwrap();
        }

        fs::remove_file(logs.join("a.log")).unwrap();
        write_file(&logs, "b.log", "two\n");

        let mut src = DirSource::new(&logs, meta, StartAt::Beginning).unwrap();
        assert_eq!(read_all(&mut src), b"two\n");
    }

    #[test]
    fn start_at_end_arms_line_skip() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir(&logs).unwrap();
        write_file(&logs, "a.log", "already-there\n");

        let mut src = DirSource::new(&logs, new_meta(&dir), StartAt::End).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(src.read(&mut buf).unwrap(), 0); // positioned at end
        assert!(src.is_new_open());
        src.set_skipped();
        assert!(!src.is_new_open());
    }

    #[test]
    fn empty_directory_waits_for_files() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir(&logs).unwrap();

        let mut src = DirSource::new(&logs, new_meta(&dir), StartAt::Beginning).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(src.read(&mut buf).unwrap(), 0);

        write_file(&logs, "a.log", "hi\n");
        assert_eq!(src.read(&mut buf).unwrap(), 3);
    }

    #[test]
    fn lag_counts_remaining_bytes() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir(&logs).unwrap();
        write_file(&logs, "a.log", "12345\n");
        write_file(&logs, "b.log", "678\n");

        let mut src = DirSource::new(&logs, new_meta(&dir), StartAt::Beginning).unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(src.read(&mut buf).unwrap(), 6);
        let lag = FileSource::lag(&src).unwrap();
        assert_eq!(lag.size, 4);
        assert_eq!(lag.total, 10);
    }
}
