// SPDX-License-Identifier: Apache-2.0

//! Per-runner on-disk state used for crash-safe resumption.
//!
//! Each runner owns one meta directory holding the buffered reader's
//! snapshot (`buf.meta` + `buf.dat`), the multi-line accumulator
//! (`cache.dat`), a reader-specific offset blob (`file.meta`) and the
//! done-records file. File names are stable across restarts.
//!
//! All writes go through write-to-temp-then-rename so readers never observe
//! a torn file. A snapshot that fails validation is treated as absent and
//! the reader starts fresh.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::error::{Error, Result};

const BUF_META_FILE: &str = "buf.meta";
const BUF_DATA_FILE: &str = "buf.dat";
const CACHE_LINE_FILE: &str = "cache.dat";
const OFFSET_FILE: &str = "file.meta";
const DONE_RECORDS_FILE: &str = "donefile.sql.records";

/// Per-runner state directory.
#[derive(Debug)]
pub struct Meta {
    dir: PathBuf,
    runner_name: String,
    log_path: String,
    encoding: String,
}

impl Meta {
    /// Open (creating if needed) the meta directory for one runner.
    pub fn new(dir: impl Into<PathBuf>, runner_name: &str, log_path: &str) -> Result<Self> {
        Self::with_encoding(dir, runner_name, log_path, "")
    }

    pub fn with_encoding(
        dir: impl Into<PathBuf>,
        runner_name: &str,
        log_path: &str,
        encoding: &str,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            runner_name: runner_name.to_string(),
            log_path: log_path.to_string(),
            encoding: encoding.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn runner_name(&self) -> &str {
        &self.runner_name
    }

    pub fn log_path(&self) -> &str {
        &self.log_path
    }

    /// The configured source encoding; empty means UTF-8.
    pub fn encoding_way(&self) -> &str {
        &self.encoding
    }

    pub fn done_file_path(&self) -> PathBuf {
        self.dir.join(DONE_RECORDS_FILE)
    }

    /// Whether a buffer snapshot exists on disk.
    pub fn is_exist(&self) -> bool {
        self.dir.join(BUF_META_FILE).exists()
    }

    /// Whether the snapshot parses and its cursors are coherent with the
    /// buffer dump. Invalid snapshots trigger fresh-start semantics.
    pub fn is_valid(&self) -> bool {
        let (r, w, len) = match self.read_buf_meta() {
            Ok(Some(t)) => t,
            _ => return false,
        };
        if r > w || w > len {
            return false;
        }
        match fs::metadata(self.dir.join(BUF_DATA_FILE)) {
            Ok(md) => md.len() as usize == len,
            Err(_) => len == 0,
        }
    }

    /// Read the three-integer buffer metadata line. `Ok(None)` when the
    /// file does not exist yet.
    pub fn read_buf_meta(&self) -> Result<Option<(usize, usize, usize)>> {
        let path = self.dir.join(BUF_META_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut parts = raw.split_whitespace();
        let parse = |p: Option<&str>| -> Result<usize> {
            p.ok_or_else(|| Error::Meta(format!("short buf meta in {}", path.display())))?
                .parse::<usize>()
                .map_err(|e| Error::Meta(format!("bad buf meta in {}: {}", path.display(), e)))
        };
        let r = parse(parts.next())?;
        let w = parse(parts.next())?;
        let len = parse(parts.next())?;
        Ok(Some((r, w, len)))
    }

    /// Read the buffer dump into `dst`. Returns the number of bytes read.
    pub fn read_buf(&self, dst: &mut [u8]) -> Result<usize> {
        let mut f = File::open(self.dir.join(BUF_DATA_FILE))?;
        let mut total = 0;
        while total < dst.len() {
            let n = f.read(&mut dst[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Atomically persist the buffer bytes and cursors. The data file is
    /// written before the metadata so a crash between the two leaves the
    /// previous metadata pointing at a longer-or-equal dump.
    pub fn write_buf(&self, buf: &[u8], r: usize, w: usize, len: usize) -> Result<()> {
        atomic_write(&self.dir.join(BUF_DATA_FILE), &buf[..len])?;
        atomic_write(
            &self.dir.join(BUF_META_FILE),
            format!("{} {} {}\n", r, w, len).as_bytes(),
        )
    }

    /// Read the persisted multi-line accumulator. Empty when absent.
    pub fn read_cache_line(&self) -> Result<Vec<u8>> {
        match fs::read(self.dir.join(CACHE_LINE_FILE)) {
            Ok(b) => Ok(b),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_cache_line(&self, line: &[u8]) -> Result<()> {
        atomic_write(&self.dir.join(CACHE_LINE_FILE), line)
    }

    /// Persist a reader-specific offset blob with its count. The format of
    /// the blob is opaque here; readers define their own encoding.
    pub fn write_offset(&self, blob: &str, count: i64) -> Result<()> {
        atomic_write(
            &self.dir.join(OFFSET_FILE),
            format!("{}\n{}\n", blob, count).as_bytes(),
        )
    }

    /// Read back the offset blob. `Ok(None)` when never written.
    pub fn read_offset(&self) -> Result<Option<(String, i64)>> {
        let path = self.dir.join(OFFSET_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut lines = raw.lines();
        let blob = lines
            .next()
            .ok_or_else(|| Error::Meta(format!("empty offset file {}", path.display())))?
            .to_string();
        let count = lines
            .next()
            .ok_or_else(|| Error::Meta(format!("short offset file {}", path.display())))?
            .trim()
            .parse::<i64>()
            .map_err(|e| Error::Meta(format!("bad offset count in {}: {}", path.display(), e)))?;
        Ok(Some((blob, count)))
    }

    /// Remove all persisted state. Used by runner reset and delete.
    pub fn reset(&self) -> Result<()> {
        for name in [
            BUF_META_FILE,
            BUF_DATA_FILE,
            CACHE_LINE_FILE,
            OFFSET_FILE,
            DONE_RECORDS_FILE,
        ] {
            match fs::remove_file(self.dir.join(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(
                        runner = %self.runner_name,
                        file = name,
                        "failed to remove meta file: {}", e
                    );
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

/// Write bytes to `path` atomically via a uniquely named temp file.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let unique = COUNTER.fetch_add(1, Ordering::SeqCst);
    let tmp = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique));

    let mut f = File::create(&tmp)?;
    f.write_all(data)?;
    f.sync_all()?;
    drop(f);

    fs::rename(&tmp, path)?;
    Ok(())
}
