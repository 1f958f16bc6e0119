// SPDX-License-Identifier: Apache-2.0

//! Buffered line reader with crash-safe resumption.
//!
//! Wraps a [`FileSource`] and turns its byte stream into logical lines:
//! single lines delimited by `\n`, or multi-line records grouped by a head
//! pattern. The buffer, cursors and multi-line accumulator checkpoint
//! through the [`Meta`] store so a restarted reader resumes at the exact
//! byte position, including across source rotations.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use encoding_rs::Encoding;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::meta::Meta;
use crate::reader::{FileSource, LagInfo, LogReader, SourceIndex, StatsInfo};

pub const DEFAULT_BUF_SIZE: usize = 4096;
/// Multi-line accumulators beyond this size are flushed as a single line
/// even without a terminating head match.
pub const MAX_HEAD_PATTERN_BUFFER_SIZE: usize = 20 * 1024 * 1024;

const MIN_READ_BUFFER_SIZE: usize = 16;
const MAX_CONSECUTIVE_EMPTY_READS: usize = 10;

/// Snapshot of the last successful checkpoint, used to skip no-op syncs.
#[derive(Default)]
struct LastSync {
    cache: String,
    buf: Vec<u8>,
    r: usize,
    w: usize,
}

pub struct BufReader {
    stopped: Arc<AtomicBool>,
    buf: Vec<u8>,
    /// Read and write cursors; bytes in `buf[r..w]` are fetched but unread.
    r: usize,
    w: usize,
    pending_err: Option<Error>,
    eof_pending: bool,

    rd: Box<dyn FileSource>,
    meta: Arc<Meta>,
    decoder: Option<&'static Encoding>,

    head_pattern: Option<Regex>,
    multi_line_cache: Vec<String>,

    last_sync: LastSync,

    /// Which underlying source the buffered bytes came from, so per-line
    /// attribution stays exact when the buffer spans a rotation.
    source_index: Vec<SourceIndex>,
    latest_source: String,

    pending_drained: Vec<String>,
    stats: StatsInfo,
}

impl BufReader {
    /// Open a reader over `rd`, restoring cursors, buffer and line cache
    /// when the meta directory holds a valid snapshot.
    pub fn open(rd: Box<dyn FileSource>, meta: Arc<Meta>, size: usize) -> Result<Self> {
        let mut size = size.max(MIN_READ_BUFFER_SIZE);

        let mut snapshot = None;
        match meta.read_buf_meta() {
            Ok(Some((r, w, len))) => {
                info!(
                    runner = meta.runner_name(),
                    source = %rd.name(),
                    r, w, len,
                    "restored buf meta"
                );
                if size < len {
                    size = len;
                }
                snapshot = Some((r, w, len));
            }
            Ok(None) => {
                info!(
                    runner = meta.runner_name(),
                    source = %rd.name(),
                    "no buf meta found, starting from zero"
                );
            }
            Err(Error::Meta(msg)) => {
                warn!(
                    runner = meta.runner_name(),
                    "corrupt buf meta, starting from zero: {}", msg
                );
            }
            Err(e) => return Err(e),
        }

        let cache_bytes = match meta.read_cache_line() {
            Ok(b) => b,
            Err(e) => {
                warn!(runner = meta.runner_name(), "line cache unreadable: {}", e);
                Vec::new()
            }
        };

        let decoder = match meta.encoding_way() {
            "" | "utf-8" | "utf8" => None,
            label => match Encoding::for_label(label.as_bytes()) {
                Some(enc) => Some(enc),
                None => {
                    warn!(
                        "encoding {:?} is not supported, reading as utf-8",
                        label
                    );
                    None
                }
            },
        };

        let mut b = BufReader {
            stopped: Arc::new(AtomicBool::new(false)),
            buf: vec![0; size],
            r: 0,
            w: 0,
            pending_err: None,
            eof_pending: false,
            rd,
            meta: meta.clone(),
            decoder,
            head_pattern: None,
            multi_line_cache: Vec::with_capacity(16),
            last_sync: LastSync::default(),
            source_index: Vec::new(),
            latest_source: String::new(),
            pending_drained: Vec::new(),
            stats: StatsInfo::default(),
        };

        if meta.is_exist() && meta.is_valid() {
            if let Some((r, w, _len)) = snapshot {
                b.r = r;
                b.w = w;
                meta.read_buf(&mut b.buf)?;
                debug!(runner = meta.runner_name(), "restored buffer snapshot");
            }
        }
        if !cache_bytes.is_empty() {
            info!(
                runner = meta.runner_name(),
                "restored line cache ({} bytes)",
                cache_bytes.len()
            );
            b.multi_line_cache
                .push(String::from_utf8_lossy(&cache_bytes).into_owned());
        }
        Ok(b)
    }

    /// Switch to multi-line mode: `pattern` matches the head line of each
    /// logical record.
    pub fn set_mode(&mut self, pattern: &str) -> Result<()> {
        let re = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("{} set mode error: {}", self.rd.name(), e)))?;
        self.head_pattern = Some(re);
        Ok(())
    }

    /// Handle for observing the stop flag from the owning runner.
    pub fn stopper(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }

    fn buffered(&self) -> usize {
        self.w - self.r
    }

    /// Shift recorded source boundaries left after compaction and drop the
    /// ones the read cursor has passed.
    fn update_source_index(&mut self) {
        if self.source_index.is_empty() {
            return;
        }
        let r = self.r;
        for si in self.source_index.iter_mut() {
            si.index = si.index.saturating_sub(r);
        }
        self.source_index.retain(|si| si.index > 0);
    }

    /// Pull a new chunk into the buffer. Compacts first, then attempts up
    /// to 10 non-empty reads; records rotation boundaries reported by the
    /// source, translated by the pre-read write cursor.
    fn fill(&mut self) {
        if self.r > 0 {
            self.buf.copy_within(self.r..self.w, 0);
            self.w -= self.r;
            self.update_source_index();
            self.r = 0;
        }

        if self.w >= self.buf.len() {
            self.pending_err = Some(Error::BufferFull);
            return;
        }

        if self.latest_source.is_empty() {
            self.latest_source = self.rd.source();
        }

        for _ in 0..MAX_CONSECUTIVE_EMPTY_READS {
            let n = match self.rd.read(&mut self.buf[self.w..]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.pending_err = Some(Error::Eof);
                    return;
                }
                Err(e) => {
                    self.pending_err = Some(Error::Io(e));
                    return;
                }
            };

            if self.latest_source != self.rd.source() {
                // The buffer now spans two sources; record where the old
                // one's bytes end.
                for v in self.rd.new_line_bytes_index() {
                    self.source_index.push(SourceIndex {
                        source: v.source,
                        index: self.w + v.index,
                    });
                }
                self.latest_source = self.rd.source();
            }

            self.w += n;
            if n > 0 {
                return;
            }
        }
        self.pending_err = Some(Error::NoProgress(MAX_CONSECUTIVE_EMPTY_READS));
    }

    /// Extract bytes up to and including the next `\n`. On a full buffer
    /// with no delimiter, hands out the whole window with `BufferFull`; the
    /// caller concatenates fragments. A momentary-empty source leaves the
    /// partial line buffered and reports `NoProgress` with no data.
    fn read_slice(&mut self) -> (Vec<u8>, Option<Error>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                warn!("buffered reader was stopped while reading");
                return (Vec::new(), None);
            }

            if let Some(i) = self.buf[self.r..self.w].iter().position(|&c| c == b'\n') {
                let line = self.buf[self.r..self.r + i + 1].to_vec();
                self.r += i + 1;
                return (line, None);
            }

            if let Some(err) = self.pending_err.take() {
                if matches!(err, Error::NoProgress(_)) {
                    return (Vec::new(), Some(err));
                }
                let line = self.buf[self.r..self.w].to_vec();
                self.r = self.w;
                return (line, Some(err));
            }

            if self.buffered() >= self.buf.len() {
                let line = self.buf[self.r..self.w].to_vec();
                self.r = self.w;
                return (line, Some(Error::BufferFull));
            }

            self.fill();
        }
    }

    /// Read one full delimited chunk, concatenating buffer-full fragments.
    fn read_bytes(&mut self) -> (Vec<u8>, Option<Error>) {
        let mut full: Vec<Vec<u8>> = Vec::new();
        loop {
            let (frag, err) = self.read_slice();
            match err {
                None => {
                    full.push(frag);
                    return (full.concat(), None);
                }
                Some(Error::BufferFull) => {
                    full.push(frag);
                }
                Some(e) => {
                    full.push(frag);
                    return (full.concat(), Some(e));
                }
            }
        }
    }

    fn decode(&self, bytes: Vec<u8>) -> String {
        match self.decoder {
            Some(enc) => enc.decode(&bytes).0.into_owned(),
            None => String::from_utf8(bytes)
                .unwrap_or_else(|e| String::from_utf8_lossy(&e.into_bytes()).into_owned()),
        }
    }

    fn read_string(&mut self) -> (String, Option<Error>) {
        let (bytes, err) = self.read_bytes();
        (self.decode(bytes), err)
    }

    fn form_multi_line(&self) -> String {
        self.multi_line_cache.concat()
    }

    fn multi_line_cache_size(&self) -> usize {
        self.multi_line_cache.iter().map(String::len).sum()
    }

    /// Accumulate physical lines until the next head-pattern match, then
    /// emit the accumulated logical line. Flushes only on end of stream or
    /// when the accumulator exceeds the size cap.
    fn read_pattern(&mut self, pattern: &Regex) -> (String, Option<Error>) {
        let mut empty_reads = 0;
        loop {
            let (line, err) = self.read_string();
            if !line.is_empty() {
                if self.multi_line_cache.is_empty() {
                    self.multi_line_cache.push(line);
                    continue;
                }
                if pattern.is_match(&line) {
                    let out = self.form_multi_line();
                    self.multi_line_cache.clear();
                    self.multi_line_cache.push(line);
                    return (out, err);
                }
                self.multi_line_cache.push(line);
                empty_reads = 0;
            } else {
                match err {
                    Some(Error::Eof) => {
                        let out = self.form_multi_line();
                        self.multi_line_cache.clear();
                        return (out, Some(Error::Eof));
                    }
                    Some(Error::NoProgress(_)) | None => {
                        empty_reads += 1;
                        if empty_reads > 10 {
                            debug!(
                                runner = self.meta.runner_name(),
                                "read empty line 10 times, returning empty"
                            );
                            return (String::new(), None);
                        }
                    }
                    Some(e) => return (String::new(), Some(e)),
                }
            }

            if self.multi_line_cache_size() > MAX_HEAD_PATTERN_BUFFER_SIZE {
                let out = self.form_multi_line();
                self.multi_line_cache.clear();
                return (out, err);
            }
        }
    }

    /// Read the next logical line. Empty with no error means the source is
    /// momentarily empty; `Error::Eof` is returned only once the source has
    /// ended and the accumulator has been flushed.
    pub fn read_line(&mut self) -> Result<String> {
        if self.eof_pending {
            self.eof_pending = false;
            return Err(Error::Eof);
        }

        let (line, err) = match self.head_pattern.clone() {
            None => self.read_string(),
            Some(pattern) => self.read_pattern(&pattern),
        };

        let line = if !line.is_empty() && self.rd.is_new_open() {
            info!(
                runner = self.meta.runner_name(),
                "skipping first line from freshly opened source"
            );
            self.rd.set_skipped();
            String::new()
        } else {
            line
        };

        match err {
            None => Ok(line),
            Some(Error::NoProgress(_)) => Ok(String::new()),
            Some(Error::Eof) => {
                if line.is_empty() {
                    Err(Error::Eof)
                } else {
                    self.eof_pending = true;
                    Ok(line)
                }
            }
            Some(e) => {
                self.set_stats_error(&e);
                if line.is_empty() {
                    Err(e)
                } else {
                    Ok(line)
                }
            }
        }
    }

    /// The logical source of the bytes currently being handed out: before
    /// the first recorded rotation boundary this is the earlier source.
    pub fn source(&self) -> String {
        for v in &self.source_index {
            if self.r < v.index || (v.index > 0 && self.r == v.index) {
                return v.source.clone();
            }
        }
        self.rd.source()
    }

    pub fn name(&self) -> String {
        self.rd.name()
    }

    /// Checkpoint the buffer, cursors and line cache. Skipped when nothing
    /// changed since the last sync; always delegates to the source's own
    /// checkpoint afterwards.
    pub fn sync_meta(&mut self) {
        let linecache = self.form_multi_line();
        let changed = self.last_sync.cache != linecache
            || self.last_sync.buf != self.buf
            || self.last_sync.r != self.r
            || self.last_sync.w != self.w;

        if changed {
            if let Err(e) = self.meta.write_buf(&self.buf, self.r, self.w, self.buf.len()) {
                error!(
                    runner = self.meta.runner_name(),
                    "cannot write buf meta: {}", e
                );
                return;
            }
            if let Err(e) = self.meta.write_cache_line(linecache.as_bytes()) {
                error!(
                    runner = self.meta.runner_name(),
                    "cannot write line cache: {}", e
                );
                return;
            }
            self.last_sync = LastSync {
                cache: linecache,
                buf: self.buf.clone(),
                r: self.r,
                w: self.w,
            };
        } else {
            debug!(
                runner = self.meta.runner_name(),
                "meta unchanged since last sync, skipping"
            );
        }

        if let Err(e) = self.rd.sync_meta() {
            error!(
                runner = self.meta.runner_name(),
                "cannot write source meta: {}", e
            );
        }
    }

    /// Flag the reader stopped (in-flight reads observe it and return
    /// early), then close the source.
    pub fn close(&mut self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        self.rd.close()
    }

    pub fn lag(&self) -> Option<LagInfo> {
        self.rd.lag()
    }

    pub fn status(&self) -> StatsInfo {
        self.stats.clone()
    }

    fn set_stats_error(&mut self, err: &Error) {
        self.stats.errors += 1;
        self.stats.last_error = err.to_string();
    }
}

impl LogReader for BufReader {
    fn name(&self) -> String {
        BufReader::name(self)
    }

    fn source(&self) -> String {
        BufReader::source(self)
    }

    fn sync_meta(&mut self) {
        BufReader::sync_meta(self)
    }

    fn close(&mut self) -> Result<()> {
        BufReader::close(self)
    }

    fn status(&self) -> StatsInfo {
        BufReader::status(self)
    }

    fn read_line(&mut self) -> Result<String> {
        BufReader::read_line(self)
    }

    fn reset(&mut self) -> Result<()> {
        self.meta.reset()
    }

    fn lag(&self) -> Option<LagInfo> {
        BufReader::lag(self)
    }

    /// Drained files are held back while buffered bytes may still belong to
    /// an earlier source.
    fn take_drained(&mut self) -> Vec<String> {
        let newly = self.rd.take_drained();
        self.pending_drained.extend(newly);
        let earlier_bytes_buffered = self.source_index.iter().any(|si| si.index > self.r);
        if !earlier_bytes_buffered && !self.pending_drained.is_empty() {
            std::mem::take(&mut self.pending_drained)
        } else {
            Vec::new()
        }
    }
}
