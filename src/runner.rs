// SPDX-License-Identifier: Apache-2.0

//! A runner is one end-to-end ingest pipeline: reader, parser and senders,
//! plus its status/error surface and optional cleaner.
//!
//! The pipeline runs on a dedicated OS thread. Each iteration reads a batch
//! of lines (or records, for data readers), parses, fans out to every
//! sender, checkpoints the reader, and emits clean signals for files the
//! reader has fully drained.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cleaner::{CleanInfo, Cleaner};
use crate::config::Record;
use crate::error::Error;
use crate::meta::{atomic_write, Meta};
use crate::parser::Parser;
use crate::reader::{LagInfo, LogReader, StatsInfo};
use crate::sender::Sender;

const DEFAULT_MAX_BATCH: usize = 64;
const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(100);
/// Errors kept per stage in the bounded history.
const ERROR_HISTORY: usize = 10;

const STATUS_BACKUP_FILE: &str = "status.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunningStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerStatus {
    pub name: String,
    pub reader_stats: StatsInfo,
    pub parser_stats: StatsInfo,
    pub sender_stats: HashMap<String, StatsInfo>,
    pub running_status: RunningStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lag: Option<LagInfo>,
}

impl RunnerStatus {
    /// The synthesized status for a configured-but-stopped runner.
    pub fn stopped(name: &str) -> Self {
        RunnerStatus {
            name: name.to_string(),
            reader_stats: StatsInfo::default(),
            parser_stats: StatsInfo::default(),
            sender_stats: HashMap::new(),
            running_status: RunningStatus::Stopped,
            lag: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub timestamp: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorsResult {
    pub read_errors: Vec<ErrorEntry>,
    pub parse_errors: Vec<ErrorEntry>,
    pub send_errors: Vec<ErrorEntry>,
}

#[derive(Default)]
struct Stats {
    reader: StatsInfo,
    parser: StatsInfo,
    senders: HashMap<String, StatsInfo>,
    lag: Option<LagInfo>,
}

#[derive(Default)]
struct ErrorQueues {
    read: VecDeque<ErrorEntry>,
    parse: VecDeque<ErrorEntry>,
    send: VecDeque<ErrorEntry>,
}

impl ErrorQueues {
    fn push(queue: &mut VecDeque<ErrorEntry>, err: &Error) {
        if queue.len() >= ERROR_HISTORY {
            queue.pop_front();
        }
        queue.push_back(ErrorEntry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            error: err.to_string(),
        });
    }
}

struct Shared {
    stats: RwLock<Stats>,
    errors: Mutex<ErrorQueues>,
    running: std::sync::atomic::AtomicBool,
}

pub struct Runner {
    name: String,
    reader: Box<dyn LogReader>,
    parser: Box<dyn Parser>,
    senders: Vec<Box<dyn Sender>>,
    cleaner: Option<Cleaner>,
    meta: Arc<Meta>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    max_batch: usize,
    idle_wait: Duration,
}

impl Runner {
    pub fn new(
        name: impl Into<String>,
        reader: Box<dyn LogReader>,
        parser: Box<dyn Parser>,
        senders: Vec<Box<dyn Sender>>,
        cleaner: Option<Cleaner>,
        meta: Arc<Meta>,
    ) -> Self {
        Runner {
            name: name.into(),
            reader,
            parser,
            senders,
            cleaner,
            meta,
            cancel: CancellationToken::new(),
            shared: Arc::new(Shared {
                stats: RwLock::new(Stats::default()),
                errors: Mutex::new(ErrorQueues::default()),
                running: std::sync::atomic::AtomicBool::new(false),
            }),
            max_batch: DEFAULT_MAX_BATCH,
            idle_wait: DEFAULT_IDLE_WAIT,
        }
    }

    /// The cleaner intent this runner contributes at registration.
    pub fn clean_info(&self) -> CleanInfo {
        self.cleaner
            .as_ref()
            .map(|c| c.info())
            .unwrap_or(CleanInfo {
                enable: false,
                logdir: Default::default(),
            })
    }

    /// Spawn the pipeline on its own thread and return the control handle.
    pub fn spawn(self) -> RunnerHandle {
        let clean_info = self.clean_info();
        let handle = RunnerHandle {
            name: self.name.clone(),
            clean_info,
            cancel: self.cancel.clone(),
            shared: self.shared.clone(),
            meta: self.meta.clone(),
            join: Mutex::new(None),
        };
        self.shared
            .running
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let join = std::thread::Builder::new()
            .name(format!("runner-{}", self.name))
            .spawn(move || self.run())
            .expect("failed to spawn runner thread");
        *handle.join.lock().expect("runner join poisoned") = Some(join);
        handle
    }

    fn record_read_error(&self, err: &Error) {
        let mut stats = self.shared.stats.write().expect("stats poisoned");
        stats.reader.errors += 1;
        stats.reader.last_error = err.to_string();
        drop(stats);
        let mut q = self.shared.errors.lock().expect("errors poisoned");
        ErrorQueues::push(&mut q.read, err);
    }

    fn record_parse_error(&self, err: &Error) {
        let mut stats = self.shared.stats.write().expect("stats poisoned");
        stats.parser.errors += 1;
        stats.parser.last_error = err.to_string();
        drop(stats);
        let mut q = self.shared.errors.lock().expect("errors poisoned");
        ErrorQueues::push(&mut q.parse, err);
    }

    fn record_send_error(&self, sender: &str, err: &Error) {
        let mut stats = self.shared.stats.write().expect("stats poisoned");
        let entry = stats.senders.entry(sender.to_string()).or_default();
        entry.errors += 1;
        entry.last_error = err.to_string();
        drop(stats);
        let mut q = self.shared.errors.lock().expect("errors poisoned");
        ErrorQueues::push(&mut q.send, err);
    }

    fn read_batch(&mut self) -> Vec<Record> {
        let mut lines = Vec::new();
        let mut records = Vec::new();

        if self.reader.is_data_reader() {
            for _ in 0..self.max_batch {
                match self.reader.read_data() {
                    Ok(Some((rec, _bytes))) => records.push(rec),
                    Ok(None) => break,
                    Err(e) => {
                        self.record_read_error(&e);
                        break;
                    }
                }
            }
        } else {
            for _ in 0..self.max_batch {
                match self.reader.read_line() {
                    Ok(line) if line.is_empty() => break,
                    Ok(line) => lines.push(line),
                    Err(Error::Eof) => break,
                    Err(e) => {
                        self.record_read_error(&e);
                        break;
                    }
                }
            }
        }

        if !lines.is_empty() {
            {
                let mut stats = self.shared.stats.write().expect("stats poisoned");
                stats.reader.success += lines.len() as u64;
            }
            match self.parser.parse(lines) {
                Ok(parsed) => {
                    let mut stats = self.shared.stats.write().expect("stats poisoned");
                    stats.parser.success += parsed.len() as u64;
                    drop(stats);
                    records.extend(parsed);
                }
                Err(e) => self.record_parse_error(&e),
            }
        } else if !records.is_empty() {
            let mut stats = self.shared.stats.write().expect("stats poisoned");
            stats.reader.success += records.len() as u64;
        }

        records
    }

    fn dispatch(&mut self, records: Vec<Record>) {
        let mut failures: Vec<(String, Error)> = Vec::new();
        for sender in self.senders.iter_mut() {
            match sender.send(records.clone()) {
                Ok(()) => {
                    let mut stats = self.shared.stats.write().expect("stats poisoned");
                    let entry = stats.senders.entry(sender.name().to_string()).or_default();
                    entry.success += records.len() as u64;
                }
                Err(e) => {
                    error!(runner = %self.name, sender = sender.name(), "send failed: {}", e);
                    failures.push((sender.name().to_string(), e));
                }
            }
        }
        for (name, err) in failures {
            self.record_send_error(&name, &err);
        }
    }

    fn run(mut self) {
        info!(runner = %self.name, reader = %self.reader.name(), "runner started");

        if let Err(e) = self.reader.start() {
            error!(runner = %self.name, "reader failed to start: {}", e);
            self.record_read_error(&e);
            self.shutdown();
            return;
        }

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let records = self.read_batch();
            let idle = records.is_empty();
            if !idle {
                self.dispatch(records);
                let lag = self.reader.lag();
                let mut stats = self.shared.stats.write().expect("stats poisoned");
                stats.lag = lag;
            }

            // Checkpoint before announcing drained files so a restart never
            // resumes inside a file the cleaner may already have removed.
            self.reader.sync_meta();
            if let Some(cleaner) = &self.cleaner {
                for file in self.reader.take_drained() {
                    cleaner.emit(&file);
                }
            }

            if idle {
                std::thread::sleep(self.idle_wait);
            }
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.reader.sync_meta();
        if let Err(e) = self.reader.close() {
            warn!(runner = %self.name, "reader close failed: {}", e);
        }
        for sender in self.senders.iter_mut() {
            if let Err(e) = sender.close() {
                warn!(runner = %self.name, sender = sender.name(), "close failed: {}", e);
            }
        }
        self.shared
            .running
            .store(false, std::sync::atomic::Ordering::SeqCst);
        info!(runner = %self.name, "runner stopped");
    }
}

/// Control surface the manager keeps for a spawned runner.
pub struct RunnerHandle {
    name: String,
    clean_info: CleanInfo,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    meta: Arc<Meta>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl RunnerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clean_info(&self) -> CleanInfo {
        self.clean_info.clone()
    }

    pub fn status(&self) -> RunnerStatus {
        let stats = self.shared.stats.read().expect("stats poisoned");
        let running = self
            .shared
            .running
            .load(std::sync::atomic::Ordering::SeqCst);
        RunnerStatus {
            name: self.name.clone(),
            reader_stats: stats.reader.clone(),
            parser_stats: stats.parser.clone(),
            sender_stats: stats.senders.clone(),
            running_status: if running {
                RunningStatus::Running
            } else {
                RunningStatus::Stopped
            },
            lag: stats.lag.clone(),
        }
    }

    pub fn errors(&self) -> ErrorsResult {
        let q = self.shared.errors.lock().expect("errors poisoned");
        ErrorsResult {
            read_errors: q.read.iter().cloned().collect(),
            parse_errors: q.parse.iter().cloned().collect(),
            send_errors: q.send.iter().cloned().collect(),
        }
    }

    /// Signal the runner to stop and wait up to `grace` for the thread to
    /// finish. A runner that takes longer continues in the background.
    pub fn stop(&self, grace: Duration) {
        self.cancel.cancel();
        let handle = self.join.lock().expect("runner join poisoned").take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + grace;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(
                    runner = %self.name,
                    "runner did not stop within grace period, continuing in background"
                );
            }
        }
    }

    /// Persist the current status snapshot next to the runner's meta, so a
    /// restarted agent can show the last known state.
    pub fn status_backup(&self) {
        let status = self.status();
        let path = self.meta.dir().join(STATUS_BACKUP_FILE);
        match serde_json::to_vec_pretty(&status) {
            Ok(body) => {
                if let Err(e) = atomic_write(&path, &body) {
                    warn!(runner = %self.name, "status backup failed: {}", e);
                }
            }
            Err(e) => warn!(runner = %self.name, "status backup failed: {}", e),
        }
    }

    /// Purge the runner's persisted state. Only meaningful once stopped.
    pub fn reset(&self) -> crate::error::Result<()> {
        debug!(runner = %self.name, "resetting runner state");
        self.meta.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::bounded;
    use crate::parser::RawParser;
    use crate::reader::{BufReader, DirSource, StartAt};
    use crate::sender::CollectSender;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn pipeline(dir: &TempDir, logs: &std::path::Path) -> (Runner, crate::sender::CollectedRecords) {
        let meta = Arc::new(Meta::new(dir.path().join("meta"), "t", "logs").unwrap());
        let source = DirSource::new(logs, meta.clone(), StartAt::Beginning).unwrap();
        let reader = BufReader::open(Box::new(source), meta.clone(), 1024).unwrap();
        let sender = CollectSender::new("collect");
        let records = sender.records();
        let runner = Runner::new(
            "t",
            Box::new(reader),
            Box::new(RawParser::new("raw", false)),
            vec![Box::new(sender)],
            None,
            meta,
        );
        (runner, records)
    }

    #[test]
    fn delivers_lines_in_order_and_stops() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir(&logs).unwrap();
        let mut f = fs::File::create(logs.join("a.log")).unwrap();
        f.write_all(b"L1\nL2\nL3\n").unwrap();
        f.sync_all().unwrap();

        let (runner, records) = pipeline(&dir, &logs);
        let handle = runner.spawn();

        let deadline = Instant::now() + Duration::from_secs(5);
        while records.lock().unwrap().len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        handle.stop(Duration::from_secs(2));

        let got: Vec<String> = records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.get("raw").unwrap().as_str().unwrap().to_string())
            .collect();
        assert_eq!(got, vec!["L1", "L2", "L3"]);

        let status = handle.status();
        assert_eq!(status.running_status, RunningStatus::Stopped);
        assert_eq!(status.reader_stats.success, 3);
    }

    #[test]
    fn status_backup_writes_snapshot() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir(&logs).unwrap();

        let (runner, _records) = pipeline(&dir, &logs);
        let handle = runner.spawn();
        handle.stop(Duration::from_secs(2));
        handle.status_backup();

        let body = fs::read_to_string(dir.path().join("meta").join("status.json")).unwrap();
        assert!(body.contains("\"name\": \"t\""));
    }

    #[test]
    fn clean_signal_emitted_after_rotation() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir(&logs).unwrap();
        fs::write(logs.join("a.log"), "one\n").unwrap();

        let meta = Arc::new(Meta::new(dir.path().join("meta"), "t", "logs").unwrap());
        let source = DirSource::new(&logs, meta.clone(), StartAt::Beginning).unwrap();
        let reader = BufReader::open(Box::new(source), meta.clone(), 1024).unwrap();
        let (tx, rx) = bounded(4);
        let mut spec = crate::config::Spec::new();
        spec.insert("delete_enable".into(), serde_json::json!(true));
        let cleaner = Cleaner::from_spec(Some(&spec), "t", logs.clone(), "dir", tx);
        let sender = CollectSender::new("collect");
        let runner = Runner::new(
            "t",
            Box::new(reader),
            Box::new(RawParser::new("raw", false)),
            vec![Box::new(sender)],
            Some(cleaner),
            meta,
        );
        let handle = runner.spawn();

        // rotation happens once a successor file appears
        std::thread::sleep(Duration::from_millis(200));
        fs::write(logs.join("b.log"), "two\n").unwrap();

        let sig = rx.recv_timeout(Duration::from_secs(5)).expect("clean signal");
        assert_eq!(sig.filename, "a.log");
        handle.stop(Duration::from_secs(2));
    }
}
