// SPDX-License-Identifier: Apache-2.0

//! Scheduled SQL daemon reader.
//!
//! Polls a database on a loop or cron schedule, streams rows to the runner
//! through `read_data`, and checkpoints per-SQL offsets (or per-table
//! done-records in discovery mode) through the meta store. Exactly one task
//! instance runs at a time; a tick that fires while its predecessor is
//! still working is skipped, and outside loop mode that skip is surfaced on
//! the error channel.

pub mod client;
pub mod magic;
pub mod records;

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender};
use crate::config::{spec_bool, spec_i64, spec_str, spec_str_list, Record, Spec};
use crate::error::{Error, Result};
use crate::meta::Meta;
use crate::reader::{LagInfo, LogReader, StatsInfo};

pub use client::{Dialect, SqlClient, SqlRows, SqlValue};
use magic::{check_magic, render_magic, render_sqls, MagicSpec};
use records::{
    append_records_file, restore_records, DbRecords, TableInfo, SQL_OFFSET_CONNECTOR,
};

const STATUS_INIT: u8 = 0;
const STATUS_RUNNING: u8 = 1;
const STATUS_STOPPING: u8 = 2;
const STATUS_STOPPED: u8 = 3;

const LOOP_PREFIX: &str = "loop";
const TASK_RETRIES: usize = 10;
const TASK_RETRY_BACKOFF: Duration = Duration::from_secs(3);
const READ_DATA_TIMEOUT: Duration = Duration::from_secs(1);
const ERR_CHANNEL_CAPACITY: usize = 10;
const WILDCARD: &str = "*";

#[derive(Clone)]
enum ScheduleKind {
    None,
    Loop(Duration),
    Cron(Box<cron::Schedule>),
}

struct ReadInfo {
    data: Record,
    bytes: i64,
}

struct SqlConf {
    dialect: Dialect,
    raw_database: String,
    raw_table: String,
    raw_sqls: String,
    db_schema: String,
    offset_key: String,
    read_batch: i64,
    exec_on_start: bool,
    history_all: bool,
    magic_lag: chrono::Duration,
    schedule: ScheduleKind,
    schemas: HashMap<String, String>,
}

impl SqlConf {
    fn from_spec(spec: &Spec) -> Result<SqlConf> {
        let dialect = Dialect::from_mode(spec_str(spec, "type", "mysql"))?;
        let mut raw_database = spec_str(spec, "database", "").to_string();
        let mut raw_table = spec_str(spec, "table", "").to_string();
        let raw_sqls = spec_str(spec, "sql", "").to_string();

        if raw_database.is_empty() {
            if dialect != Dialect::MySql {
                return Err(Error::Config(format!(
                    "{} reader requires a database",
                    dialect.name()
                )));
            }
            raw_database = WILDCARD.to_string();
        }
        if raw_table.is_empty() {
            raw_table = WILDCARD.to_string();
        }

        if raw_sqls.is_empty() && !(check_magic(&raw_database) && check_magic(&raw_table)) {
            return Err(Error::Config(magic::SUPPORT_REMINDER.to_string()));
        }

        let magic_lag = match spec_str(spec, "magic_lag", "") {
            "" => chrono::Duration::zero(),
            raw => {
                let std = humantime::parse_duration(raw)
                    .map_err(|e| Error::Config(format!("bad magic_lag {:?}: {}", raw, e)))?;
                chrono::Duration::from_std(std)
                    .map_err(|e| Error::Config(format!("bad magic_lag {:?}: {}", raw, e)))?
            }
        };

        let schedule = parse_schedule(spec_str(spec, "cron", ""))?;
        let schemas = schema_check(&spec_str_list(spec, "sql_schema"))?;

        Ok(SqlConf {
            db_schema: spec_str(spec, "schema", dialect.default_schema()).to_string(),
            offset_key: spec_str(spec, "offset_key", "").to_string(),
            read_batch: spec_i64(spec, "read_batch", 100),
            exec_on_start: spec_bool(spec, "exec_on_start", true),
            history_all: spec_bool(spec, "history_all", false),
            dialect,
            raw_database,
            raw_table,
            raw_sqls,
            magic_lag,
            schedule,
            schemas,
        })
    }
}

fn parse_schedule(raw: &str) -> Result<ScheduleKind> {
    if raw.is_empty() {
        return Ok(ScheduleKind::None);
    }
    let lowered = raw.to_lowercase();
    if let Some(rest) = lowered.strip_prefix(LOOP_PREFIX) {
        let rest = rest.trim();
        let duration = if rest.is_empty() {
            Duration::from_secs(1)
        } else {
            humantime::parse_duration(rest)
                .map_err(|e| Error::Config(format!("bad loop duration {:?}: {}", rest, e)))?
        };
        return Ok(ScheduleKind::Loop(duration.max(Duration::from_secs(1))));
    }
    let schedule = cron::Schedule::from_str(raw)
        .map_err(|e| Error::Config(format!("bad cron schedule {:?}: {}", raw, e)))?;
    Ok(ScheduleKind::Cron(Box::new(schedule)))
}

/// Parse `"column type"` pairs; types are string/float/long (or s/f/l).
fn schema_check(raw: &[String]) -> Result<HashMap<String, String>> {
    let mut schemas = HashMap::new();
    for entry in raw {
        let fields: Vec<&str> = entry.split_whitespace().collect();
        if fields.len() != 2 {
            return Err(Error::Config(format!(
                "SQL schema {:?} is not `name type`",
                entry
            )));
        }
        let vtype = match fields[1].to_lowercase().as_str() {
            "string" | "s" => "string",
            "float" | "f" => "float",
            "long" | "l" => "long",
            other => {
                return Err(Error::Config(format!("schema type {:?} not supported", other)));
            }
        };
        schemas.insert(fields[0].to_string(), vtype.to_string());
    }
    Ok(schemas)
}

struct Core {
    meta: Arc<Meta>,
    conf: SqlConf,
    client: Mutex<Box<dyn SqlClient>>,

    status: AtomicU8,
    routine_status: AtomicU8,
    cancel: CancellationToken,

    read_tx: Mutex<Option<BoundedSender<ReadInfo>>>,
    err_tx: Mutex<Option<BoundedSender<Error>>>,

    offsets: Mutex<Vec<i64>>,
    sync_sqls: Mutex<Vec<String>>,
    current_database: Mutex<String>,

    sync_records: DbRecords,
    done_records: DbRecords,
    /// Per-table row totals from the background counting pass. Only the
    /// backlog gauge reads this; the read path never does.
    counted_records: DbRecords,
    last_database: Option<String>,
    last_table: Option<String>,

    current_count: AtomicI64,
    stats: RwLock<StatsInfo>,
}

impl Core {
    fn name(&self) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.conf.raw_sqls.hash(&mut hasher);
        format!(
            "{}_Reader:{}_{:016x}",
            self.conf.dialect.name().to_uppercase(),
            self.conf.raw_database,
            hasher.finish()
        )
    }

    fn is_loop(&self) -> bool {
        matches!(self.conf.schedule, ScheduleKind::Loop(_))
    }

    fn is_scheduled(&self) -> bool {
        !matches!(self.conf.schedule, ScheduleKind::None)
    }

    fn is_stopping(&self) -> bool {
        self.status.load(Ordering::SeqCst) == STATUS_STOPPING
    }

    fn has_stopped(&self) -> bool {
        self.status.load(Ordering::SeqCst) == STATUS_STOPPED
    }

    fn cas_status(&self, from: u8, to: u8) -> bool {
        self.status
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn cas_routine(&self, from: u8, to: u8) -> bool {
        self.routine_status
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn set_stats_error(&self, err: &Error) {
        let mut stats = self.stats.write().expect("stats poisoned");
        stats.errors += 1;
        stats.last_error = err.to_string();
    }

    fn send_error(&self, err: Error) {
        let tx = self.err_tx.lock().expect("err tx poisoned").clone();
        if let Some(tx) = tx {
            let _ = tx.send(err);
        }
    }

    /// Hand one record to the consumer. Blocks until taken (backpressure);
    /// false once the consumer side is gone.
    fn send_record(&self, data: Record, bytes: i64) -> bool {
        let tx = self.read_tx.lock().expect("read tx poisoned").clone();
        match tx {
            Some(tx) => tx.send(ReadInfo { data, bytes }).is_ok(),
            None => false,
        }
    }

    fn close_channels(&self) {
        self.read_tx.lock().expect("read tx poisoned").take();
        self.err_tx.lock().expect("err tx poisoned").take();
    }

    fn query(&self, database: &str, sql: &str) -> Result<SqlRows> {
        debug!(reader = %self.name(), database, sql, "executing query");
        self.client
            .lock()
            .expect("sql client poisoned")
            .query(database, sql)
    }

    // ------------------------------------------------------------------
    // Task lifecycle
    // ------------------------------------------------------------------

    /// One scheduled task instance. Single-flight: a tick that finds the
    /// previous instance still running is skipped.
    fn run(core: &Arc<Core>) {
        if !core.cas_routine(STATUS_INIT, STATUS_RUNNING) {
            if core.is_stopping() || core.has_stopped() {
                warn!(
                    reader = %core.name(),
                    "daemon has stopped, skipping this task"
                );
            } else {
                let msg = format!(
                    "{} is still working on the last task, this tick is skipped",
                    core.name()
                );
                error!("{}", msg);
                if !core.is_loop() {
                    // tell the consumer the schedule is too tight
                    core.send_error(Error::Sql(msg));
                }
            }
            return;
        }

        Core::run_body(core);
        core.finish_task();
    }

    fn finish_task(&self) {
        if self.is_stopping() || self.has_stopped() {
            // the reader was closed while we ran; we own channel teardown
            if self.cas_routine(STATUS_RUNNING, STATUS_STOPPING) {
                self.close_channels();
                self.status.store(STATUS_STOPPED, Ordering::SeqCst);
            }
        } else {
            self.routine_status.store(STATUS_INIT, Ordering::SeqCst);
        }
    }

    fn run_body(core: &Arc<Core>) {
        let now = Utc::now() - core.conf.magic_lag;
        for attempt in 1..=TASK_RETRIES {
            if core.is_stopping() || core.has_stopped() {
                warn!(reader = %core.name(), "daemon stopped, task interrupted");
                return;
            }
            match Core::exec(core, &now) {
                Ok(()) => {
                    debug!(reader = %core.name(), "task executed successfully");
                    return;
                }
                Err(e) => {
                    error!(reader = %core.name(), attempt, "task failed: {}", e);
                    core.set_stats_error(&e);
                    core.send_error(e);
                    if core.is_loop() {
                        // the loop itself is the retry
                        return;
                    }
                    std::thread::sleep(TASK_RETRY_BACKOFF);
                }
            }
        }
        error!(
            reader = %core.name(),
            "task execution failed and gave up after {} tries", TASK_RETRIES
        );
    }

    fn exec(core: &Arc<Core>, now: &DateTime<Utc>) -> Result<()> {
        let dbs: Vec<String> = if !core.conf.raw_sqls.is_empty() {
            vec![render_magic(&core.conf.raw_database, now)]
        } else if core.conf.dialect == Dialect::MySql {
            let dbs = core.discover_databases(now)?;

            // Count the backlog on its own thread while rows stream out;
            // the two passes share nothing but the done-records filter.
            let counter = core.clone();
            let count_dbs = dbs.clone();
            let count_now = *now;
            std::thread::Builder::new()
                .name("sql-count".into())
                .spawn(move || counter.exec_count(&count_dbs, &count_now))
                .expect("failed to spawn sql count thread");

            dbs
        } else {
            vec![render_magic(&core.conf.raw_database, now)]
        };

        for db in dbs {
            if core.is_stopping() || core.has_stopped() {
                warn!(reader = %core.name(), "stopped while iterating databases");
                return Ok(());
            }
            core.exec_read_db(&db, now)?;
        }
        Ok(())
    }

    /// The counting pass: same table discovery as the read pass, but each
    /// table only gets a `Count(*)`. Results land in `counted_records`,
    /// which the backlog gauge sums.
    fn exec_count(&self, dbs: &[String], now: &DateTime<Utc>) {
        for db in dbs {
            if self.is_stopping() || self.has_stopped() {
                return;
            }
            let tables = match self.discover_tables(db, now) {
                Ok(tables) => tables,
                Err(e) => {
                    error!(
                        reader = %self.name(),
                        database = %db,
                        "count pass discovery failed: {}", e
                    );
                    continue;
                }
            };
            for table in tables {
                if self.is_stopping() || self.has_stopped() {
                    return;
                }
                let sql = self.conf.dialect.count_query(&self.conf.db_schema, &table);
                match self.query(db, &sql) {
                    Ok(batch) => {
                        let size = batch
                            .rows
                            .first()
                            .and_then(|row| row.first())
                            .and_then(|v| v.as_long().ok());
                        match size {
                            Some(size) => self.counted_records.set(
                                db,
                                &table,
                                TableInfo { size, offset: -1 },
                            ),
                            None => warn!(
                                reader = %self.name(),
                                table = %table,
                                "count query returned no usable value"
                            ),
                        }
                    }
                    Err(e) => {
                        error!(
                            reader = %self.name(),
                            table = %table,
                            "count query failed: {}", e
                        );
                    }
                }
            }
        }
    }

    fn matches_candidate(&self, spec: &MagicSpec, target: &str, last: Option<&str>) -> bool {
        if !spec.matches_remainder(target) {
            return false;
        }
        if !self.conf.history_all && !self.is_scheduled() {
            // one-shot: the candidate must equal the rendered reference
            return spec.equal_time(target);
        }
        spec.compare_time(target, &spec.rendered, true)
            && self.greater_than_last(spec, target, last)
    }

    fn greater_than_last(&self, spec: &MagicSpec, target: &str, last: Option<&str>) -> bool {
        let Some(last) = last else { return true };
        if last.is_empty() {
            return true;
        }
        if !spec.matches_remainder(last) {
            return false;
        }
        spec.compare_time(target, last, false)
    }

    fn discover_databases(&self, now: &DateTime<Utc>) -> Result<Vec<String>> {
        let query = self
            .conf
            .dialect
            .database_query()
            .ok_or_else(|| Error::NotSupport("database discovery".into()))?;
        let batch = self.query("", query)?;

        let spec = if self.conf.raw_database == WILDCARD {
            None
        } else {
            Some(MagicSpec::compile(&self.conf.raw_database, now)?)
        };

        let mut dbs = Vec::new();
        for row in &batch.rows {
            let Some(first) = row.first() else { continue };
            let name = first.as_text()?;
            if self
                .conf
                .dialect
                .system_databases()
                .contains(&name.to_lowercase().as_str())
            {
                continue;
            }
            if let Some(spec) = &spec {
                if !self.matches_candidate(spec, &name, self.last_database.as_deref()) {
                    continue;
                }
            }
            dbs.push(name);
        }
        info!(reader = %self.name(), ?dbs, "valid databases");
        Ok(dbs)
    }

    fn discover_tables(&self, database: &str, now: &DateTime<Utc>) -> Result<Vec<String>> {
        let query = self.conf.dialect.table_query(database, &self.conf.db_schema);
        let batch = self.query(database, &query)?;

        let spec = if self.conf.raw_table == WILDCARD {
            None
        } else {
            Some(MagicSpec::compile(&self.conf.raw_table, now)?)
        };

        let mut tables = Vec::new();
        for row in &batch.rows {
            let Some(first) = row.first() else { continue };
            let name = first.as_text()?;
            if self.done_records.contains(database, &name) {
                continue;
            }
            if let Some(spec) = &spec {
                if !self.matches_candidate(spec, &name, self.last_table.as_deref()) {
                    continue;
                }
            }
            tables.push(name);
        }
        Ok(tables)
    }

    fn update_offsets(&self, sqls: &[String]) {
        let mut offsets = self.offsets.lock().expect("offsets poisoned");
        let sync = self.sync_sqls.lock().expect("sync sqls poisoned");
        for (idx, sql) in sqls.iter().enumerate() {
            if idx >= offsets.len() {
                offsets.push(0);
                continue;
            }
            if idx >= sync.len() {
                continue;
            }
            if &sync[idx] != sql {
                offsets[idx] = 0;
            }
        }
    }

    fn exec_read_db(&self, database: &str, now: &DateTime<Utc>) -> Result<()> {
        *self.current_database.lock().expect("database poisoned") = database.to_string();

        let mut tables = Vec::new();
        let sqls: Vec<String> = if self.conf.raw_sqls.is_empty() {
            tables = self.discover_tables(database, now)?;
            tables
                .iter()
                .map(|t| {
                    format!(
                        "Select * From {};",
                        self.conf.dialect.quote_table(&self.conf.db_schema, t)
                    )
                })
                .collect()
        } else {
            let rendered = render_sqls(&self.conf.raw_sqls, now);
            self.update_offsets(&rendered);
            rendered
        };

        *self.sync_sqls.lock().expect("sync sqls poisoned") = sqls.clone();
        info!(
            reader = %self.name(),
            database,
            sqls = sqls.len(),
            "starting read pass"
        );

        for (idx, raw_sql) in sqls.iter().enumerate() {
            let table_name = tables.get(idx);
            if let Some(table) = table_name {
                if self.done_records.contains(database, table) {
                    continue;
                }
            }

            let mut total_read = 0i64;
            loop {
                let (exit, is_raw, read_size) = self.exec_read_sql(database, idx, raw_sql)?;
                total_read += read_size;

                if let Some(table) = table_name {
                    let info = TableInfo {
                        size: total_read,
                        offset: -1,
                    };
                    self.sync_records.set(database, table, info);
                    self.done_records.set(database, table, info);
                }

                if self.is_stopping() || self.has_stopped() {
                    warn!(reader = %self.name(), "stopped mid read pass");
                    return Ok(());
                }
                if is_raw || exit {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Execute one (possibly offset-windowed) SQL statement and stream its
    /// rows. Returns `(exit, is_raw, read_size)`.
    fn exec_read_sql(&self, database: &str, idx: usize, raw_sql: &str) -> Result<(bool, bool, i64)> {
        let windowed = !self.conf.offset_key.is_empty();
        let exec_sql = if windowed {
            let from = {
                let offsets = self.offsets.lock().expect("offsets poisoned");
                offsets.get(idx).copied().unwrap_or(0)
            };
            self.conf.dialect.offset_window(
                raw_sql,
                &self.conf.offset_key,
                from,
                from + self.conf.read_batch,
            )
        } else {
            raw_sql.to_string()
        };
        let is_raw = !windowed;

        let batch = self.query(database, &exec_sql)?;
        let offset_key_index = if windowed && !self.conf.raw_sqls.is_empty() {
            batch
                .columns
                .iter()
                .position(|c| c == &self.conf.offset_key)
        } else {
            None
        };

        let mut exit = true;
        let mut read_size = 0i64;
        let mut max_offset = -1i64;

        for row in &batch.rows {
            exit = false;
            let mut rec = Record::new();
            let mut total_bytes = 0i64;

            for (i, col) in batch.columns.iter().enumerate() {
                let Some(val) = row.get(i) else { continue };
                match self.conf.schemas.get(col).map(String::as_str) {
                    Some("long") => match val.as_long() {
                        Ok(v) => {
                            rec.insert(col.clone(), Value::from(v));
                            total_bytes += 8;
                        }
                        Err(e) => {
                            error!(reader = %self.name(), column = col, "{}", e);
                            self.send_error(e);
                        }
                    },
                    Some("float") => match val.as_float() {
                        Ok(v) => {
                            rec.insert(
                                col.clone(),
                                serde_json::Number::from_f64(v)
                                    .map(Value::Number)
                                    .unwrap_or(Value::Null),
                            );
                            total_bytes += 8;
                        }
                        Err(e) => {
                            error!(reader = %self.name(), column = col, "{}", e);
                            self.send_error(e);
                        }
                    },
                    Some("string") => match val.as_text() {
                        Ok(v) => {
                            total_bytes += v.len() as i64;
                            rec.insert(col.clone(), Value::String(v));
                        }
                        Err(e) => {
                            error!(reader = %self.name(), column = col, "{}", e);
                            self.send_error(e);
                        }
                    },
                    _ => {
                        total_bytes += val.byte_size();
                        rec.insert(col.clone(), val.to_json());
                    }
                }
            }

            if self.is_stopping() || self.has_stopped() {
                return Ok((exit, is_raw, read_size));
            }
            if !self.send_record(rec, total_bytes) {
                return Ok((exit, is_raw, read_size));
            }
            self.current_count.fetch_add(1, Ordering::SeqCst);
            read_size += 1;

            if self.conf.history_all || self.conf.raw_sqls.is_empty() {
                continue;
            }
            match offset_key_index {
                Some(ki) => match row.get(ki).map(|v| v.as_long()) {
                    Some(Ok(v)) => {
                        if v > max_offset {
                            max_offset = v;
                        }
                    }
                    _ => {
                        error!(
                            reader = %self.name(),
                            "offset key value did not parse, offset not recorded"
                        );
                    }
                },
                None => {
                    let mut offsets = self.offsets.lock().expect("offsets poisoned");
                    if let Some(slot) = offsets.get_mut(idx) {
                        *slot += 1;
                    }
                }
            }
        }

        if max_offset > 0 {
            let mut offsets = self.offsets.lock().expect("offsets poisoned");
            if idx < offsets.len() {
                offsets[idx] = max_offset + 1;
            }
        }

        if exit && windowed && !self.conf.raw_sqls.is_empty() {
            // Empty window: probe whether anything exists beyond it before
            // giving up.
            let from = {
                let offsets = self.offsets.lock().expect("offsets poisoned");
                offsets.get(idx).copied().unwrap_or(0)
            };
            if let Some(probe_sql) =
                self.conf
                    .dialect
                    .next_record_query(raw_sql, &self.conf.offset_key, from)
            {
                match self.query(database, &probe_sql) {
                    Ok(probe) if !probe.rows.is_empty() => {
                        exit = false;
                        let mut offsets = self.offsets.lock().expect("offsets poisoned");
                        if idx < offsets.len() {
                            offsets[idx] += self.conf.read_batch;
                            if let Some(ki) = probe
                                .columns
                                .iter()
                                .position(|c| c == &self.conf.offset_key)
                            {
                                if let Some(Ok(v)) = probe.rows[0].get(ki).map(|v| v.as_long()) {
                                    if v > offsets[idx] {
                                        offsets[idx] = v;
                                    }
                                }
                            }
                        }
                    }
                    Ok(_) => {
                        debug!(reader = %self.name(), "no data beyond window, done");
                    }
                    Err(e) => {
                        error!(reader = %self.name(), "exit probe failed: {}", e);
                    }
                }
            }
        }

        Ok((exit, is_raw, read_size))
    }

    // ------------------------------------------------------------------
    // Checkpointing
    // ------------------------------------------------------------------

    fn sync_meta(&self) {
        if self.conf.raw_sqls.is_empty() {
            let stamp = Utc::now().to_rfc3339();
            let lines = self.sync_records.snapshot_lines(&stamp);
            if lines.is_empty() {
                self.sync_records.reset();
                return;
            }
            if let Err(e) = append_records_file(&self.meta.done_file_path(), &lines) {
                error!(reader = %self.name(), "sync meta error: {}", e);
            }
            self.sync_records.reset();
            return;
        }

        let sqls = self.sync_sqls.lock().expect("sync sqls poisoned").clone();
        let mut encoded: Vec<String> = sqls.iter().map(|s| s.replace(' ', "@")).collect();
        {
            let offsets = self.offsets.lock().expect("offsets poisoned");
            for off in offsets.iter() {
                encoded.push(off.to_string());
            }
        }
        let all = encoded.join(SQL_OFFSET_CONNECTOR);
        if let Err(e) = self.meta.write_offset(&all, sqls.len() as i64) {
            error!(reader = %self.name(), "sync meta error: {}", e);
        }
    }

    fn close(&self) {
        self.cancel.cancel();
        if !self.cas_status(STATUS_RUNNING, STATUS_STOPPING) {
            // never started (or already on its way down)
            let _ = self.cas_status(STATUS_INIT, STATUS_STOPPED);
            warn!(reader = %self.name(), "reader was not running, close is a flag flip");
        } else {
            info!(reader = %self.name(), "daemon is stopping");
        }
        // If no task instance is mid-flight, tear the channels down here;
        // otherwise the running task does it on its way out.
        if self.cas_routine(STATUS_INIT, STATUS_STOPPING) {
            self.close_channels();
            let _ = self.cas_status(STATUS_STOPPING, STATUS_STOPPED);
        }
    }

    fn cancellable_sleep(&self, duration: Duration) -> bool {
        let deadline = std::time::Instant::now() + duration;
        while std::time::Instant::now() < deadline {
            if self.cancel.is_cancelled() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            std::thread::sleep(remaining.min(Duration::from_millis(50)));
        }
        !self.cancel.is_cancelled()
    }
}

/// The reader handed to runners. Owns the consumer ends of the data/error
/// channels; scheduled tasks run on background threads against the shared
/// core.
pub struct SqlReader {
    core: Arc<Core>,
    read_rx: BoundedReceiver<ReadInfo>,
    err_rx: BoundedReceiver<Error>,
}

impl SqlReader {
    pub fn new(meta: Arc<Meta>, spec: &Spec, client: Box<dyn SqlClient>) -> Result<SqlReader> {
        let conf = SqlConf::from_spec(spec)?;

        // Restore either per-SQL offsets or per-table done-records,
        // depending on the operating mode.
        let (offsets, sync_sqls) = if conf.raw_sqls.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            restore_offsets(&meta, &conf)
        };
        let (done_records, last_database, last_table) = if conf.raw_sqls.is_empty() {
            let restored = restore_records(&meta);
            (restored.records, restored.last_database, restored.last_table)
        } else {
            (DbRecords::default(), None, None)
        };

        // Rendezvous data channel: rows are handed straight to the
        // consumer, which is the backpressure mechanism.
        let (read_tx, read_rx) = bounded::<ReadInfo>(0);
        let (err_tx, err_rx) = bounded::<Error>(ERR_CHANNEL_CAPACITY);

        let core = Arc::new(Core {
            meta,
            conf,
            client: Mutex::new(client),
            status: AtomicU8::new(STATUS_INIT),
            routine_status: AtomicU8::new(STATUS_INIT),
            cancel: CancellationToken::new(),
            read_tx: Mutex::new(Some(read_tx)),
            err_tx: Mutex::new(Some(err_tx)),
            offsets: Mutex::new(offsets),
            sync_sqls: Mutex::new(sync_sqls),
            current_database: Mutex::new(String::new()),
            sync_records: DbRecords::default(),
            done_records,
            counted_records: DbRecords::default(),
            last_database,
            last_table,
            current_count: AtomicI64::new(0),
            stats: RwLock::new(StatsInfo::default()),
        });

        Ok(SqlReader {
            core,
            read_rx,
            err_rx,
        })
    }
}

/// Restore persisted offsets, resetting any slot whose stored SQL no
/// longer matches the freshly templated one.
fn restore_offsets(meta: &Meta, conf: &SqlConf) -> (Vec<i64>, Vec<String>) {
    let now = Utc::now() - conf.magic_lag;
    let sqls = render_sqls(&conf.raw_sqls, &now);
    let mut offsets = vec![0i64; sqls.len()];

    match meta.read_offset() {
        Ok(Some((blob, length))) => {
            let parts: Vec<&str> = blob.split(SQL_OFFSET_CONNECTOR).collect();
            if parts.len() as i64 != 2 * length || sqls.len() as i64 != length {
                warn!(
                    runner = meta.runner_name(),
                    "offset meta does not match current SQL set, omitting"
                );
                return (offsets, sqls);
            }
            for idx in 0..length as usize {
                let stored_sql = parts[idx].replace('@', " ");
                match parts[idx + length as usize].parse::<i64>() {
                    Ok(off) if stored_sql == sqls[idx] => offsets[idx] = off,
                    _ => {
                        warn!(
                            runner = meta.runner_name(),
                            slot = idx,
                            "offset slot is stale, resetting to zero"
                        );
                    }
                }
            }
        }
        Ok(None) => {}
        Err(e) => {
            warn!(runner = meta.runner_name(), "offset meta unreadable: {}", e);
        }
    }
    (offsets, sqls)
}

impl LogReader for SqlReader {
    fn name(&self) -> String {
        self.core.name()
    }

    /// The data source identity, without credentials.
    fn source(&self) -> String {
        let db = self
            .core
            .current_database
            .lock()
            .expect("database poisoned")
            .clone();
        format!("{}_{}", self.core.conf.dialect.name(), db)
    }

    fn sync_meta(&mut self) {
        self.core.sync_meta();
    }

    fn close(&mut self) -> Result<()> {
        self.core.close();
        Ok(())
    }

    fn status(&self) -> StatsInfo {
        self.core.stats.read().expect("stats poisoned").clone()
    }

    fn is_data_reader(&self) -> bool {
        true
    }

    /// Poll the data channel with a short timer so stop signals are
    /// observed promptly even when no rows are flowing.
    fn read_data(&mut self) -> Result<Option<(Record, i64)>> {
        if let Some(err) = self.err_rx.try_recv() {
            return Err(err);
        }
        match self.read_rx.recv_timeout(READ_DATA_TIMEOUT) {
            Some(info) => Ok(Some((info.data, info.bytes))),
            None => Ok(None),
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.core.is_stopping() || self.core.has_stopped() {
            return Err(Error::Sql("reader is stopping or has stopped".into()));
        }
        if !self.core.cas_status(STATUS_INIT, STATUS_RUNNING) {
            warn!(reader = %self.core.name(), "daemon already started");
            return Ok(());
        }

        match self.core.conf.schedule.clone() {
            ScheduleKind::Loop(duration) => {
                let core = self.core.clone();
                std::thread::Builder::new()
                    .name("sql-loop".into())
                    .spawn(move || loop {
                        Core::run(&core);
                        if !core.cancellable_sleep(duration) {
                            core.status.store(STATUS_STOPPED, Ordering::SeqCst);
                            info!(reader = %core.name(), "daemon stopped");
                            return;
                        }
                    })
                    .expect("failed to spawn sql loop thread");
            }
            ScheduleKind::Cron(schedule) => {
                let core = self.core.clone();
                let exec_on_start = self.core.conf.exec_on_start;
                std::thread::Builder::new()
                    .name("sql-cron".into())
                    .spawn(move || {
                        if exec_on_start {
                            Core::run(&core);
                        }
                        loop {
                            let Some(next) = schedule.upcoming(Utc).next() else {
                                return;
                            };
                            while Utc::now() < next {
                                if !core.cancellable_sleep(Duration::from_millis(500)) {
                                    return;
                                }
                            }
                            Core::run(&core);
                        }
                    })
                    .expect("failed to spawn sql cron thread");
            }
            ScheduleKind::None => {
                if self.core.conf.exec_on_start {
                    let core = self.core.clone();
                    std::thread::Builder::new()
                        .name("sql-once".into())
                        .spawn(move || Core::run(&core))
                        .expect("failed to spawn sql task thread");
                }
            }
        }
        info!(reader = %self.core.name(), "daemon started");
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.core.done_records.reset();
        self.core.sync_records.reset();
        self.core.counted_records.reset();
        self.core.meta.reset()
    }

    /// Records-based backlog: the counting pass supplies the total, the
    /// rows actually streamed out drain it. Only discovery mode has a
    /// counting pass, so raw-SQL readers report an empty gauge.
    fn lag(&self) -> Option<LagInfo> {
        let mut lag = LagInfo {
            size: 0,
            total: 0,
            size_unit: "records".to_string(),
        };
        if self.core.conf.raw_sqls.is_empty() {
            let total = self.core.counted_records.total_size();
            let current = self.core.current_count.load(Ordering::SeqCst);
            lag.size = (total - current).max(0);
            lag.total = total;
        }
        Some(lag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Instant;
    use tempfile::TempDir;

    /// Routes catalog and count queries by their SQL text so the counting
    /// thread and the read pass can interleave freely; everything else pops
    /// from the scripted data queue in order.
    struct MockClient {
        databases: SqlRows,
        tables: SqlRows,
        counts: SqlRows,
        data: Mutex<VecDeque<SqlRows>>,
        queries: Arc<Mutex<Vec<String>>>,
    }

    impl MockClient {
        fn new(data: Vec<SqlRows>) -> (Box<dyn SqlClient>, Arc<Mutex<Vec<String>>>) {
            MockClient::with_catalog(SqlRows::default(), SqlRows::default(), SqlRows::default(), data)
        }

        fn with_catalog(
            databases: SqlRows,
            tables: SqlRows,
            counts: SqlRows,
            data: Vec<SqlRows>,
        ) -> (Box<dyn SqlClient>, Arc<Mutex<Vec<String>>>) {
            let queries = Arc::new(Mutex::new(Vec::new()));
            (
                Box::new(MockClient {
                    databases,
                    tables,
                    counts,
                    data: Mutex::new(data.into()),
                    queries: queries.clone(),
                }),
                queries,
            )
        }
    }

    impl SqlClient for MockClient {
        fn query(&mut self, _database: &str, sql: &str) -> Result<SqlRows> {
            self.queries.lock().unwrap().push(sql.to_string());
            if sql.contains("SHOW DATABASES") {
                return Ok(self.databases.clone());
            }
            if sql.contains("INFORMATION_SCHEMA.TABLES") || sql.contains("PG_TABLES") {
                return Ok(self.tables.clone());
            }
            if sql.contains("Count(*)") {
                return Ok(self.counts.clone());
            }
            Ok(self.data.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    fn meta(dir: &TempDir) -> Arc<Meta> {
        Arc::new(Meta::new(dir.path().join("meta"), "sqltest", "sql").unwrap())
    }

    fn id_rows(ids: &[i64]) -> SqlRows {
        SqlRows {
            columns: vec!["id".to_string(), "msg".to_string()],
            rows: ids
                .iter()
                .map(|id| {
                    vec![
                        SqlValue::Long(*id),
                        SqlValue::Text(format!("row-{}", id)),
                    ]
                })
                .collect(),
        }
    }

    fn collect_records(reader: &mut SqlReader, want: usize, within: Duration) -> Vec<Record> {
        let deadline = Instant::now() + within;
        let mut out = Vec::new();
        while out.len() < want && Instant::now() < deadline {
            match reader.read_data() {
                Ok(Some((rec, _))) => out.push(rec),
                Ok(None) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        out
    }

    #[test]
    fn parses_loop_and_cron_schedules() {
        assert!(matches!(parse_schedule("").unwrap(), ScheduleKind::None));
        match parse_schedule("loop 5m").unwrap() {
            ScheduleKind::Loop(d) => assert_eq!(d, Duration::from_secs(300)),
            _ => panic!("expected loop"),
        }
        assert!(matches!(
            parse_schedule("0 0 * * * *").unwrap(),
            ScheduleKind::Cron(_)
        ));
        assert!(parse_schedule("loop nonsense").is_err());
        assert!(parse_schedule("not a schedule").is_err());
    }

    #[test]
    fn schema_check_maps_aliases() {
        let schemas = schema_check(&["id l".to_string(), "name string".to_string()]).unwrap();
        assert_eq!(schemas.get("id").map(String::as_str), Some("long"));
        assert_eq!(schemas.get("name").map(String::as_str), Some("string"));
        assert!(schema_check(&["broken".to_string()]).is_err());
        assert!(schema_check(&["x datetime".to_string()]).is_err());
    }

    fn raw_sql_spec(batch: i64) -> Spec {
        let mut spec = Spec::new();
        spec.insert("type".into(), json!("mysql"));
        spec.insert("database".into(), json!("testdb"));
        spec.insert("sql".into(), json!("select * from t"));
        spec.insert("offset_key".into(), json!("id"));
        spec.insert("read_batch".into(), json!(batch));
        spec.insert("exec_on_start".into(), json!(true));
        spec
    }

    #[test]
    fn streams_rows_and_checkpoints_offsets() {
        let dir = TempDir::new().unwrap();
        let m = meta(&dir);
        // one window of rows, then an empty window and an empty exit probe
        let (client, queries) = MockClient::new(vec![id_rows(&[1, 2]), SqlRows::default(), SqlRows::default()]);
        let mut reader = SqlReader::new(m.clone(), &raw_sql_spec(100), client).unwrap();

        reader.start().unwrap();
        let records = collect_records(&mut reader, 2, Duration::from_secs(10));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("id").unwrap(), 1);
        assert_eq!(
            records[1].get("msg").and_then(Value::as_str),
            Some("row-2")
        );

        // give the task a moment to finish its exit probe
        std::thread::sleep(Duration::from_millis(200));
        reader.sync_meta();
        let (blob, count) = m.read_offset().unwrap().unwrap();
        assert_eq!(count, 1);
        // highest id was 2, so the next window starts at 3
        assert!(blob.ends_with("##3"), "unexpected offset blob {:?}", blob);

        let qs = queries.lock().unwrap();
        assert!(qs[0].contains("WHERE id >= 0 AND id < 100"));
        reader.close().unwrap();
    }

    #[test]
    fn restores_offsets_only_for_matching_sql() {
        let dir = TempDir::new().unwrap();
        let m = meta(&dir);
        m.write_offset("select@*@from@t##42", 1).unwrap();

        let (client, _) = MockClient::new(vec![]);
        let reader = SqlReader::new(m.clone(), &raw_sql_spec(100), client).unwrap();
        assert_eq!(*reader.core.offsets.lock().unwrap(), vec![42]);

        // a different SQL text must reset the slot
        let (client, _) = MockClient::new(vec![]);
        let mut spec = raw_sql_spec(100);
        spec.insert("sql".into(), json!("select * from other"));
        let reader = SqlReader::new(m, &spec, client).unwrap();
        assert_eq!(*reader.core.offsets.lock().unwrap(), vec![0]);
    }

    #[test]
    fn overlapping_tick_surfaces_error_outside_loop_mode() {
        let dir = TempDir::new().unwrap();
        let (client, _) = MockClient::new(vec![]);
        let mut reader = SqlReader::new(meta(&dir), &raw_sql_spec(100), client).unwrap();

        // simulate a task instance still running
        reader
            .core
            .routine_status
            .store(STATUS_RUNNING, Ordering::SeqCst);
        Core::run(&reader.core);

        match reader.read_data() {
            Err(e) => assert!(e.to_string().contains("skipped")),
            other => panic!("expected overlap error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn discovery_counts_backlog_independently_of_consumption() {
        let dir = TempDir::new().unwrap();
        let m = meta(&dir);
        let mut spec = Spec::new();
        spec.insert("type".into(), json!("mysql"));
        spec.insert("exec_on_start".into(), json!(true));

        let (client, queries) = MockClient::with_catalog(
            SqlRows::single_column(vec!["appdb", "information_schema", "mysql"]),
            SqlRows::single_column(vec!["events"]),
            SqlRows {
                columns: vec!["count".to_string()],
                rows: vec![vec![SqlValue::Text("3".to_string())]],
            },
            vec![id_rows(&[1, 2, 3])],
        );
        let mut reader = SqlReader::new(m.clone(), &spec, client).unwrap();
        reader.start().unwrap();

        // The counting pass reports the full backlog while the read pass is
        // still blocked handing over its first row.
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if LogReader::lag(&reader).map(|l| l.total) == Some(3) {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        let lag = LogReader::lag(&reader).unwrap();
        assert_eq!(lag.total, 3);
        assert_eq!(lag.size, 3, "nothing consumed yet, backlog must be full");

        let records = collect_records(&mut reader, 3, Duration::from_secs(10));
        assert_eq!(records.len(), 3);

        // consumption drains the gauge without touching the counted total
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if LogReader::lag(&reader).map(|l| l.size) == Some(0) {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        let lag = LogReader::lag(&reader).unwrap();
        assert_eq!(lag.size, 0);
        assert_eq!(lag.total, 3);

        std::thread::sleep(Duration::from_millis(200));
        reader.sync_meta();
        let done = std::fs::read_to_string(m.done_file_path()).unwrap();
        assert!(done.contains("appdb##events,3,-1"));

        let qs = queries.lock().unwrap();
        assert!(qs.iter().any(|q| q.contains("SHOW DATABASES")));
        assert!(
            qs.iter().any(|q| q == "Select Count(*) From `events`;"),
            "counting pass never issued its count query"
        );
        reader.close().unwrap();
    }

    #[test]
    fn read_data_times_out_quietly_when_idle() {
        let dir = TempDir::new().unwrap();
        let (client, _) = MockClient::new(vec![]);
        let mut spec = raw_sql_spec(100);
        spec.insert("exec_on_start".into(), json!(false));
        let mut reader = SqlReader::new(meta(&dir), &spec, client).unwrap();
        reader.start().unwrap();

        let begin = Instant::now();
        assert!(reader.read_data().unwrap().is_none());
        assert!(begin.elapsed() >= Duration::from_millis(900));
        reader.close().unwrap();
    }
}
