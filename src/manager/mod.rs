// SPDX-License-Identifier: Apache-2.0

//! The supervisor owning the full set of runners.
//!
//! Responsibilities: build runners from configuration files, react to
//! filesystem events on configuration directories (hot reload), coordinate
//! log-file cleanup across runners sharing a directory, persist API-created
//! configurations to the REST directory, and expose the admin lifecycle
//! (add/update/start/stop/reset/delete).
//!
//! Locking: the three runner maps (`runners`, `runner_names`,
//! `runner_configs`) change together under a single RwLock. The watcher map
//! and the clean queues have their own locks because watcher callbacks and
//! clean signals arrive while runner operations are in flight.

pub mod watcher;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use glob::Pattern;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender};
use crate::cleaner::{CleanInfo, CleanSignal, Cleaner, READ_MODE_TAILX};
use crate::config::{
    load_config, save_config, spec_str, RunnerConfig, INNER_USER_AGENT,
};
use crate::error::{Error, Result};
use crate::manager::watcher::{DirWatcher, FileEventKind};
use crate::meta::Meta;
use crate::registry::Registry;
use crate::runner::{Runner, RunnerHandle, RunnerStatus};
use crate::runner::ErrorsResult;

const CONF_SUFFIX: &str = "conf";
const DEFAULT_REST_DIR: &str = ".logshipconfs";
const DEFAULT_DIR_NOT_EXIST_SLEEP: Duration = Duration::from_secs(300);
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);
const WATCHER_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Sender auth tokens to refresh on a running configuration.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub runner_path: String,
    pub sender_index: usize,
    pub sender_tokens: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory where API-created configurations persist.
    pub rest_dir: PathBuf,
    /// Root under which per-runner meta directories are created.
    pub meta_root: PathBuf,
    /// Agent version, injected into sender specs as the user agent.
    pub version: String,
    /// Skip persisting configurations (a backup server holds them).
    pub server_backup: bool,
    /// Retry interval when a runner's log directory is missing at fork
    /// time. Zero means: consult `DIR_NOT_EXIST_SLEEP_TIME` (seconds), then
    /// fall back to 300s.
    pub dir_not_exist_sleep: Duration,
    /// How long to wait for a runner thread when stopping it.
    pub stop_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            rest_dir: PathBuf::new(),
            meta_root: PathBuf::from("meta"),
            version: env!("CARGO_PKG_VERSION").to_string(),
            server_backup: false,
            dir_not_exist_sleep: Duration::ZERO,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Shared per-log-directory deletion gate.
struct CleanQueue {
    cleaner_count: usize,
    file_count: HashMap<String, usize>,
}

#[derive(Default)]
struct RunnerTable {
    runners: HashMap<PathBuf, RunnerHandle>,
    runner_names: HashSet<String>,
    runner_configs: HashMap<PathBuf, RunnerConfig>,
}

struct Inner {
    conf: ManagerConfig,
    registry: Registry,
    table: RwLock<RunnerTable>,
    watchers: Mutex<HashMap<PathBuf, CancellationToken>>,
    clean_queues: Mutex<HashMap<PathBuf, CleanQueue>>,
    clean_tx: BoundedSender<CleanSignal>,
    cancel: CancellationToken,
}

/// Cheaply cloneable handle to the supervisor; threads hold clones.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    pub fn new(conf: ManagerConfig) -> Result<Manager> {
        Manager::with_registry(conf, Registry::default())
    }

    pub fn with_registry(mut conf: ManagerConfig, registry: Registry) -> Result<Manager> {
        if conf.rest_dir.as_os_str().is_empty() {
            conf.rest_dir = std::env::current_dir()?.join(DEFAULT_REST_DIR);
        } else {
            conf.rest_dir = normalize_path(&conf.rest_dir)?;
        }
        if !conf.server_backup {
            if let Err(e) = fs::create_dir_all(&conf.rest_dir) {
                warn!("cannot create rest dir {}: {}", conf.rest_dir.display(), e);
            }
        }
        if conf.dir_not_exist_sleep == Duration::ZERO {
            conf.dir_not_exist_sleep = std::env::var("DIR_NOT_EXIST_SLEEP_TIME")
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_DIR_NOT_EXIST_SLEEP);
        }
        if conf.stop_grace == Duration::ZERO {
            conf.stop_grace = DEFAULT_STOP_GRACE;
        }

        // Rendezvous channel: a clean signal is handed directly to the
        // dispatcher, which applies backpressure to eager cleaners.
        let (clean_tx, clean_rx) = bounded::<CleanSignal>(0);

        let manager = Manager {
            inner: Arc::new(Inner {
                conf,
                registry,
                table: RwLock::new(RunnerTable::default()),
                watchers: Mutex::new(HashMap::new()),
                clean_queues: Mutex::new(HashMap::new()),
                clean_tx,
                cancel: CancellationToken::new(),
            }),
        };
        manager.spawn_clean_dispatcher(clean_rx);
        Ok(manager)
    }

    pub fn rest_dir(&self) -> &Path {
        &self.inner.conf.rest_dir
    }

    // ------------------------------------------------------------------
    // Runner lifecycle
    // ------------------------------------------------------------------

    pub fn is_running(&self, conf_path: &Path) -> bool {
        self.inner
            .table
            .read()
            .expect("runner table poisoned")
            .runners
            .contains_key(conf_path)
    }

    /// Add the runner described by a `.conf` file. Construction happens on
    /// a background thread because a missing log directory is retried with
    /// a long sleep.
    pub fn add(&self, conf_path: &Path) {
        if conf_path.extension().and_then(|e| e.to_str()) != Some(CONF_SUFFIX) {
            warn!("config {:?} does not end with .conf, skipped", conf_path);
            return;
        }
        info!("adding config {:?}", conf_path);
        let abs = match normalize_path(conf_path) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to resolve {:?}: {}", conf_path, e);
                return;
            }
        };
        if self.is_running(&abs) {
            error!("config {:?} has already been added", abs);
            return;
        }
        let mut conf = match load_config(&abs) {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to load config {:?}: {}", abs, e);
                return;
            }
        };

        let mod_time = fs::metadata(&abs)
            .and_then(|md| md.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|e| {
                warn!("failed to get config modtime: {}", e);
                Utc::now()
            });
        conf.create_time = mod_time.to_rfc3339_opts(SecondsFormat::Nanos, true);

        info!("adding runner {:?}", conf.runner_name);
        let mgr = self.clone();
        std::thread::spawn(move || {
            if let Err(e) = mgr.fork_runner(&abs, conf, false) {
                error!("failed to add runner {:?}: {}", abs, e);
            }
        });
    }

    /// The canonical construction step: build and register a runner for
    /// `conf_path`. With `return_on_err` unset, a missing log directory is
    /// retried indefinitely with the configured sleep.
    pub fn fork_runner(
        &self,
        conf_path: &Path,
        mut config: RunnerConfig,
        return_on_err: bool,
    ) -> Result<()> {
        let mut rounds = 0u32;
        let runner = loop {
            if self.is_running(conf_path) {
                let err = Error::Config(format!("{} already added", conf_path.display()));
                if !return_on_err {
                    error!("{}", err);
                }
                return Err(err);
            }

            if config.is_stopped {
                // Record the config so listings show it, but do not start.
                let mut table = self.inner.table.write().expect("runner table poisoned");
                table
                    .runner_configs
                    .insert(conf_path.to_path_buf(), config);
                return Ok(());
            }

            let webornot = if config.is_in_web_folder { "Web" } else { "Terminal" };
            let agent = format!("logship/{} {}", self.inner.conf.version, webornot);
            for sc in config.senders.iter_mut() {
                sc.insert(INNER_USER_AGENT.to_string(), Value::String(agent.clone()));
            }

            match self.build_runner(&config) {
                Ok(runner) => break runner,
                Err(Error::LogDirNotExist(dir)) => {
                    if return_on_err {
                        return Err(Error::LogDirNotExist(dir));
                    }
                    rounds += 1;
                    warn!(
                        "log dir {} does not exist after {} rounds, sleeping {:?} and retrying",
                        dir.display(),
                        rounds,
                        self.inner.conf.dir_not_exist_sleep
                    );
                    if !self.cancellable_sleep(self.inner.conf.dir_not_exist_sleep) {
                        return Err(Error::Config("manager stopped".into()));
                    }
                }
                Err(e) => {
                    let err = Error::Config(format!(
                        "new runner {:?} failed: {}",
                        config.runner_name, e
                    ));
                    if !return_on_err {
                        error!("{}", err);
                    }
                    return Err(err);
                }
            }
        };

        let mut table = self.inner.table.write().expect("runner table poisoned");
        if table.runners.contains_key(conf_path) {
            return Err(Error::Config(format!(
                "config path {:?} already added",
                conf_path
            )));
        }
        if table.runner_names.contains(&config.runner_name) {
            return Err(Error::Config(format!(
                "runner name {:?} already used",
                config.runner_name
            )));
        }

        self.add_clean_queue(&runner.clean_info());
        info!(
            runner = %config.runner_name,
            path = %conf_path.display(),
            "runner added"
        );
        let handle = runner.spawn();
        table.runners.insert(conf_path.to_path_buf(), handle);
        table.runner_names.insert(config.runner_name.clone());
        table
            .runner_configs
            .insert(conf_path.to_path_buf(), config);
        info!(total = table.runners.len(), "runners now active");
        Ok(())
    }

    fn build_runner(&self, config: &RunnerConfig) -> Result<Runner> {
        let name = &config.runner_name;
        if name.is_empty() {
            return Err(Error::Config("runner_name is required".into()));
        }

        let encoding = spec_str(&config.reader, "encoding", "");
        let log_path = spec_str(&config.reader, "log_path", "");
        let meta_dir = match spec_str(&config.reader, "meta_path", "") {
            "" => self
                .inner
                .conf
                .meta_root
                .join(name.replace(['/', '\\'], "_")),
            p => PathBuf::from(p),
        };
        let meta = Arc::new(Meta::with_encoding(meta_dir, name, log_path, encoding)?);

        let reader = self.inner.registry.new_reader(meta.clone(), &config.reader)?;
        let parser = self.inner.registry.new_parser(&config.parser)?;
        let mut senders = Vec::new();
        for sc in &config.senders {
            senders.push(self.inner.registry.new_sender(sc)?);
        }
        if senders.is_empty() {
            senders.push(Box::new(crate::sender::CollectSender::new("discard")) as _);
        }

        let read_mode = spec_str(&config.reader, "type", "dir").to_string();
        let logdir = if log_path.is_empty() {
            PathBuf::new()
        } else {
            normalize_path(Path::new(log_path))?
        };
        let cleaner = Cleaner::from_spec(
            config.cleaner.as_ref(),
            name,
            logdir,
            &read_mode,
            self.inner.clean_tx.clone(),
        );

        Ok(Runner::new(
            name.clone(),
            reader,
            parser,
            senders,
            Some(cleaner),
            meta,
        ))
    }

    fn remove_inner(&self, conf_path: &Path, is_delete: bool) -> Result<RunnerHandle> {
        if conf_path.extension().and_then(|e| e.to_str()) != Some(CONF_SUFFIX) {
            return Err(Error::Config(format!(
                "{} does not end with .conf, skipped",
                conf_path.display()
            )));
        }
        let abs = normalize_path(conf_path)?;
        info!("removing runner for {:?}", abs);

        let mut table = self.inner.table.write().expect("runner table poisoned");
        let handle = table.runners.remove(&abs).ok_or_else(|| {
            Error::Config(format!("{} not added, nothing to do", abs.display()))
        })?;

        self.remove_clean_queue(&handle.clean_info());
        handle.stop(self.inner.conf.stop_grace);
        table.runner_names.remove(handle.name());
        if is_delete {
            table.runner_configs.remove(&abs);
        }
        info!(
            runner = handle.name(),
            total = table.runners.len(),
            "runner removed"
        );
        handle.status_backup();
        Ok(handle)
    }

    /// Remove a runner and forget its configuration.
    pub fn remove(&self, conf_path: &Path) -> Result<()> {
        self.remove_inner(conf_path, true).map(drop)
    }

    /// Remove a runner; keep its configuration when `is_delete` is false.
    pub fn remove_with_config(&self, conf_path: &Path, is_delete: bool) -> Result<()> {
        self.remove_inner(conf_path, is_delete).map(drop)
    }

    // ------------------------------------------------------------------
    // Clean-queue coordination
    // ------------------------------------------------------------------

    fn add_clean_queue(&self, info: &CleanInfo) {
        if !info.enable {
            return;
        }
        let mut queues = self.inner.clean_queues.lock().expect("clean queues poisoned");
        let queue = queues.entry(info.logdir.clone()).or_insert(CleanQueue {
            cleaner_count: 0,
            file_count: HashMap::new(),
        });
        queue.cleaner_count += 1;
        info!(
            logdir = %info.logdir.display(),
            cleaners = queue.cleaner_count,
            "clean queue registered"
        );
    }

    fn remove_clean_queue(&self, info: &CleanInfo) {
        if !info.enable {
            return;
        }
        let mut queues = self.inner.clean_queues.lock().expect("clean queues poisoned");
        match queues.get_mut(&info.logdir) {
            None => {
                error!(
                    "cannot find clean queue {} to remove",
                    info.logdir.display()
                );
            }
            Some(queue) => {
                queue.cleaner_count = queue.cleaner_count.saturating_sub(1);
                info!(
                    logdir = %info.logdir.display(),
                    cleaners = queue.cleaner_count,
                    "clean queue released"
                );
                if queue.cleaner_count == 0 {
                    queues.remove(&info.logdir);
                }
            }
        }
    }

    fn spawn_clean_dispatcher(&self, rx: BoundedReceiver<CleanSignal>) {
        let mgr = self.clone();
        std::thread::Builder::new()
            .name("clean-dispatcher".into())
            .spawn(move || loop {
                if mgr.inner.cancel.is_cancelled() {
                    return;
                }
                match rx.recv_timeout(Duration::from_millis(500)) {
                    Some(sig) => mgr.do_clean(sig),
                    None => {
                        if rx.is_disconnected() {
                            return;
                        }
                    }
                }
            })
            .expect("failed to spawn clean dispatcher");
    }

    /// Apply one clean signal: bump the per-file release count on every
    /// matching queue and delete the file once every queue agrees.
    fn do_clean(&self, sig: CleanSignal) {
        let dir = match normalize_path(&sig.logdir) {
            Ok(d) => d,
            Err(e) => {
                error!("cannot resolve clean dir {}: {}", sig.logdir.display(), e);
                return;
            }
        };
        let file = sig.filename.clone();
        let full = dir.join(&file);

        let mut queues = self.inner.clean_queues.lock().expect("clean queues poisoned");

        let keys: Vec<PathBuf> = if sig.read_mode == READ_MODE_TAILX {
            queues
                .keys()
                .filter(|key| {
                    key.to_str()
                        .and_then(|k| Pattern::new(k).ok())
                        .map(|p| p.matches_path(&full))
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        } else if queues.contains_key(&dir) {
            vec![dir.clone()]
        } else {
            Vec::new()
        };

        if keys.is_empty() {
            error!(
                cleaner = %sig.cleaner_name,
                "clean signal for {} but no queue watches {}",
                file,
                dir.display()
            );
            return;
        }

        let mut can_delete = true;
        for key in &keys {
            let queue = queues.get_mut(key).expect("matched key vanished");
            let count = queue.file_count.get(&file).copied().unwrap_or(0) + 1;
            if count < queue.cleaner_count {
                can_delete = false;
            }
            queue.file_count.insert(file.clone(), count);
        }

        if can_delete {
            match fs::remove_file(&full) {
                Ok(()) => info!("log {} cleaned", full.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("clean {} skipped, file no longer exists", full.display());
                }
                Err(e) => error!("clean {} failed: {}", full.display(), e),
            }
            for key in &keys {
                if let Some(queue) = queues.get_mut(key) {
                    queue.file_count.remove(&file);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Filesystem watching
    // ------------------------------------------------------------------

    /// Start watching the given configuration paths (glob patterns over
    /// directories) and the periodic sweeper that picks up directories
    /// created later.
    pub fn watch(&self, confs_paths: Vec<String>) {
        self.add_watchers(&confs_paths);

        let mgr = self.clone();
        std::thread::Builder::new()
            .name("watcher-sweeper".into())
            .spawn(move || loop {
                if !mgr.cancellable_sleep(WATCHER_SWEEP_INTERVAL) {
                    return;
                }
                let total = mgr.inner.watchers.lock().expect("watchers poisoned").len();
                debug!(total, "sweeping for new conf directories");
                mgr.add_watchers(&confs_paths);
            })
            .expect("failed to spawn watcher sweeper");
    }

    fn add_watchers(&self, confs_paths: &[String]) {
        for pattern in confs_paths {
            let dirs: Vec<PathBuf> = match glob::glob(pattern) {
                Ok(it) => it.filter_map(|r| r.ok()).collect(),
                Err(e) => {
                    error!("bad conf path pattern {:?}: {}", pattern, e);
                    continue;
                }
            };
            if dirs.is_empty() {
                debug!("conf path {:?} matches no directories yet", pattern);
            }
            for dir in dirs {
                if !dir.is_dir() {
                    continue;
                }
                let dir = match normalize_path(&dir) {
                    Ok(d) => d,
                    Err(_) => continue,
                };

                let token = {
                    let mut watchers =
                        self.inner.watchers.lock().expect("watchers poisoned");
                    if watchers.contains_key(&dir) {
                        continue;
                    }
                    let token = self.inner.cancel.child_token();
                    watchers.insert(dir.clone(), token.clone());
                    token
                };

                // Synthesize adds for configs already present.
                match fs::read_dir(&dir) {
                    Ok(entries) => {
                        for entry in entries.flatten() {
                            let path = entry.path();
                            if path.is_dir() {
                                debug!("skipping directory {:?}", path);
                                continue;
                            }
                            self.add(&path);
                        }
                    }
                    Err(e) => {
                        error!("cannot read conf dir {}: {}", dir.display(), e);
                        self.inner
                            .watchers
                            .lock()
                            .expect("watchers poisoned")
                            .remove(&dir);
                        continue;
                    }
                }

                let dir_watcher = match DirWatcher::new(&dir) {
                    Ok(w) => w,
                    Err(e) => {
                        error!("cannot watch {}: {}", dir.display(), e);
                        self.inner
                            .watchers
                            .lock()
                            .expect("watchers poisoned")
                            .remove(&dir);
                        continue;
                    }
                };
                info!("watching conf dir {}", dir.display());

                let mgr = self.clone();
                std::thread::Builder::new()
                    .name("conf-watcher".into())
                    .spawn(move || mgr.handle_events(dir, dir_watcher, token))
                    .expect("failed to spawn watcher thread");
            }
        }
    }

    fn handle_events(&self, dir: PathBuf, watcher: DirWatcher, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                return;
            }
            let event = match watcher.recv_timeout(Duration::from_millis(250)) {
                Ok(Some(ev)) => ev,
                Ok(None) => continue,
                Err(e) => {
                    warn!("watcher channel for {} closed: {}", dir.display(), e);
                    self.inner
                        .watchers
                        .lock()
                        .expect("watchers poisoned")
                        .remove(&dir);
                    return;
                }
            };
            debug!(?event, "conf event");

            match event.kind {
                FileEventKind::Remove | FileEventKind::Rename => {
                    if !dir.exists() {
                        // The watched directory itself is gone: stop
                        // watching and drop every runner rooted under it.
                        warn!("watched conf dir {} is gone, closing watcher", dir.display());
                        self.inner
                            .watchers
                            .lock()
                            .expect("watchers poisoned")
                            .remove(&dir);
                        self.remove_runners_under(&dir);
                        return;
                    }
                    for path in &event.paths {
                        if let Err(e) = self.remove(path) {
                            debug!("remove on event: {}", e);
                        }
                    }
                }
                FileEventKind::Create => {
                    for path in &event.paths {
                        self.add(path);
                    }
                }
                FileEventKind::Modify => {
                    // Hot reload: tear down and rebuild from the new file.
                    for path in &event.paths {
                        if let Err(e) = self.remove(path) {
                            debug!("remove on modify: {}", e);
                        }
                        self.add(path);
                    }
                }
                FileEventKind::Other => {}
            }
        }
    }

    fn remove_runners_under(&self, dir: &Path) {
        let keys: Vec<PathBuf> = {
            let table = self.inner.table.read().expect("runner table poisoned");
            table
                .runners
                .keys()
                .filter(|k| k.starts_with(dir))
                .cloned()
                .collect()
        };
        for key in keys {
            if let Err(e) = self.remove(&key) {
                warn!("removing runner under deleted dir: {}", e);
            }
        }
    }

    /// Re-add every configuration persisted in the REST directory.
    pub fn restore_rest_dir(&self) {
        let entries = match fs::read_dir(&self.inner.conf.rest_dir) {
            Ok(e) => e,
            Err(e) => {
                error!(
                    "cannot read rest dir {}: {}",
                    self.inner.conf.rest_dir.display(),
                    e
                );
                return;
            }
        };
        let mut restored = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                info!("skipping directory {:?}", path);
                continue;
            }
            self.add(&path);
            restored += 1;
        }
        info!(
            restored,
            rest_dir = %self.inner.conf.rest_dir.display(),
            "restored runners from rest dir"
        );
    }

    // ------------------------------------------------------------------
    // Admin API
    // ------------------------------------------------------------------

    fn config_path(&self, name: &str) -> PathBuf {
        self.inner.conf.rest_dir.join(format!("{}.{}", name, CONF_SUFFIX))
    }

    fn get_deep_copy_config(&self, name: &str) -> Result<(PathBuf, RunnerConfig)> {
        let filename = self.config_path(name);
        let table = self.inner.table.read().expect("runner table poisoned");
        match table.runner_configs.get(&filename) {
            Some(conf) => Ok((filename.clone(), conf.clone())),
            None => Err(Error::NotExist(filename.display().to_string())),
        }
    }

    fn set_runner_config(&self, filename: &Path, conf: RunnerConfig) {
        let mut table = self.inner.table.write().expect("runner table poisoned");
        table.runner_configs.insert(filename.to_path_buf(), conf);
    }

    fn backup_runner_config(&self, filename: &Path, conf: &RunnerConfig) -> Result<()> {
        if self.inner.conf.server_backup {
            return Ok(());
        }
        save_config(filename, conf)
    }

    /// API add: fork the runner, then persist its configuration under the
    /// REST directory. A persistence failure rolls the runner back.
    pub fn add_runner(
        &self,
        name: &str,
        mut conf: RunnerConfig,
        create_time: DateTime<Utc>,
    ) -> Result<()> {
        conf.runner_name = name.to_string();
        conf.create_time = create_time.to_rfc3339_opts(SecondsFormat::Nanos, true);
        let filename = self.config_path(name);
        if self.is_running(&filename) {
            return Err(Error::Config(format!("runner {} is running", name)));
        }
        self.fork_runner(&filename, conf.clone(), true)
            .map_err(|e| Error::Config(format!("fork runner {} error: {}", name, e)))?;
        if let Err(e) = self.backup_runner_config(&filename, &conf) {
            // The config file never hit disk, so removal alone restores the
            // pre-call state.
            if let Err(rollback) = self.remove(&filename) {
                error!(
                    "runner {} config backup failed and rollback failed too: {}",
                    name, rollback
                );
            }
            return Err(e);
        }
        Ok(())
    }

    /// API replace: remove, fork the new config, re-fork the old one if the
    /// new fork or its persistence fails.
    pub fn update_runner(&self, name: &str, mut conf: RunnerConfig) -> Result<()> {
        let (filename, old_conf) = self.get_deep_copy_config(name)?;
        conf.runner_name = name.to_string();
        conf.create_time = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);

        if self.is_running(&filename) {
            self.remove(&filename)
                .map_err(|e| Error::Config(format!("remove runner {} error: {}", name, e)))?;
        }
        if let Err(e) = self.fork_runner(&filename, conf.clone(), true) {
            if let Err(rollback) = self.fork_runner(&filename, old_conf, true) {
                error!("update fork failed and rolling back old runner failed: {}", rollback);
            }
            return Err(Error::Config(format!("fork runner {} error: {}", name, e)));
        }
        if let Err(e) = self.backup_runner_config(&filename, &conf) {
            if let Err(rollback) = self.remove(&filename) {
                error!("update backup failed and removal failed: {}", rollback);
            }
            if let Err(rollback) = self.fork_runner(&filename, old_conf, true) {
                error!("update backup failed and rolling back old runner failed: {}", rollback);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Start a currently stopped runner.
    pub fn start_runner(&self, name: &str) -> Result<()> {
        let (filename, mut conf) = self.get_deep_copy_config(name)?;
        if !conf.is_stopped {
            return Err(Error::Config(format!(
                "runner {} has already started",
                name
            )));
        }
        conf.is_stopped = false;
        self.fork_runner(&filename, conf.clone(), true)
            .map_err(|e| Error::Config(format!("fork runner {} error: {}", name, e)))?;
        if let Err(e) = self.backup_runner_config(&filename, &conf) {
            match self.remove_with_config(&filename, false) {
                Ok(()) => {
                    conf.is_stopped = true;
                    self.set_runner_config(&filename, conf);
                }
                Err(rollback) => {
                    error!("start backup failed and rollback failed: {}", rollback);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Stop a currently running runner, keeping its configuration.
    pub fn stop_runner(&self, name: &str) -> Result<()> {
        let (filename, mut conf) = self.get_deep_copy_config(name)?;
        if conf.is_stopped {
            return Err(Error::Config(format!(
                "runner {} has already stopped",
                name
            )));
        }
        conf.is_stopped = true;
        if !self.is_running(&filename) {
            self.set_runner_config(&filename, conf);
            return Ok(());
        }
        self.remove_with_config(&filename, false)
            .map_err(|e| Error::Config(format!("remove runner {} error: {}", name, e)))?;
        self.set_runner_config(&filename, conf.clone());
        if let Err(e) = self.backup_runner_config(&filename, &conf) {
            conf.is_stopped = false;
            if let Err(rollback) = self.fork_runner(&filename, conf, true) {
                error!("stop backup failed and rollback failed: {}", rollback);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Reset a runner's persisted state. A runner is resettable only while
    /// alive, so a stopped one is started first; after the reset the runner
    /// is forked again running.
    pub fn reset_runner(&self, name: &str) -> Result<()> {
        let (filename, mut conf) = self.get_deep_copy_config(name)?;
        if conf.is_stopped {
            conf.is_stopped = false;
            self.fork_runner(&filename, conf.clone(), true).map_err(|e| {
                Error::Config(format!(
                    "start {} for reset error: {}, runner is only resettable while alive",
                    name, e
                ))
            })?;
        }

        let handle = self
            .remove_inner(&filename, true)
            .map_err(|e| Error::Config(format!("remove runner {} for reset error: {}", name, e)))?;

        let reset_result = handle.reset();
        if let Err(e) = &reset_result {
            error!("reset runner {} error: {}", name, e);
        }

        conf.is_stopped = false;
        self.fork_runner(&filename, conf, true).map_err(|e| {
            Error::Config(format!(
                "fork runner {} after reset error: {} (reset result: {:?})",
                name,
                e,
                reset_result.as_ref().err()
            ))
        })?;
        reset_result
    }

    /// Remove the runner, purge its state, and delete the config file from
    /// disk. A failed file deletion rolls the removal back.
    pub fn delete_runner(&self, name: &str) -> Result<()> {
        let (filename, conf) = self.get_deep_copy_config(name)?;
        if conf.is_stopped {
            let mut table = self.inner.table.write().expect("runner table poisoned");
            table.runner_configs.remove(&filename);
        }
        if self.is_running(&filename) {
            let handle = self
                .remove_inner(&filename, true)
                .map_err(|e| Error::Config(format!("remove runner {} error: {}", name, e)))?;
            if let Err(e) = handle.reset() {
                warn!("reset during delete of {} failed: {}", name, e);
            }
        }
        match fs::remove_file(&filename) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                if let Err(rollback) = self.fork_runner(&filename, conf, true) {
                    error!("delete {} failed and rollback failed: {}", name, rollback);
                }
                Err(Error::Config(format!(
                    "remove config file {} error: {}",
                    filename.display(),
                    e
                )))
            }
        }
    }

    /// Refresh sender auth tokens in the stored configurations.
    pub fn update_token(&self, tokens: &[AuthToken]) -> Result<()> {
        let mut table = self.inner.table.write().expect("runner table poisoned");
        for token in tokens {
            let path = normalize_path(Path::new(&token.runner_path))?;
            if let Some(conf) = table.runner_configs.get_mut(&path) {
                if let Some(sc) = conf.senders.get_mut(token.sender_index) {
                    for (k, v) in &token.sender_tokens {
                        sc.insert(k.clone(), Value::String(v.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read-only surfaces
    // ------------------------------------------------------------------

    pub fn status(&self) -> HashMap<String, RunnerStatus> {
        let table = self.inner.table.read().expect("runner table poisoned");
        let mut out = HashMap::new();
        for (key, conf) in &table.runner_configs {
            match table.runners.get(key) {
                Some(handle) => {
                    out.insert(handle.name().to_string(), handle.status());
                }
                None => {
                    out.insert(
                        conf.runner_name.clone(),
                        RunnerStatus::stopped(&conf.runner_name),
                    );
                }
            }
        }
        out
    }

    pub fn errors(&self) -> HashMap<String, ErrorsResult> {
        let table = self.inner.table.read().expect("runner table poisoned");
        let mut out = HashMap::new();
        for (key, conf) in &table.runner_configs {
            match table.runners.get(key) {
                Some(handle) => {
                    out.insert(handle.name().to_string(), handle.errors());
                }
                None => {
                    out.insert(conf.runner_name.clone(), ErrorsResult::default());
                }
            }
        }
        out
    }

    pub fn error(&self, name: &str) -> Result<ErrorsResult> {
        let table = self.inner.table.read().expect("runner table poisoned");
        for handle in table.runners.values() {
            if handle.name() == name {
                return Ok(handle.errors());
            }
        }
        Err(Error::NotExist(name.to_string()))
    }

    /// Deep-copied configurations, with REST-directory entries tagged as
    /// web-folder configs.
    pub fn configs(&self) -> HashMap<PathBuf, RunnerConfig> {
        let table = self.inner.table.read().expect("runner table poisoned");
        let mut out = HashMap::new();
        for (key, conf) in &table.runner_configs {
            let mut conf = conf.clone();
            if key.parent() == Some(self.inner.conf.rest_dir.as_path()) {
                conf.is_in_web_folder = true;
            }
            out.insert(key.clone(), conf);
        }
        out
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop every runner (capturing status), close every watcher, and stop
    /// the clean dispatcher. The clean channel itself is never closed while
    /// producers hold senders; their sends simply start failing once the
    /// dispatcher is gone.
    pub fn stop(&self) -> Result<()> {
        info!("stopping manager");
        self.inner.cancel.cancel();

        let handles: Vec<RunnerHandle> = {
            let mut table = self.inner.table.write().expect("runner table poisoned");
            table.runner_names.clear();
            table.runners.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.stop(self.inner.conf.stop_grace);
            handle.status_backup();
        }

        self.inner.watchers.lock().expect("watchers poisoned").clear();
        Ok(())
    }

    fn cancellable_sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.inner.cancel.is_cancelled() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(remaining.min(Duration::from_millis(50)));
        }
        !self.inner.cancel.is_cancelled()
    }

    #[cfg(test)]
    fn assert_table_coherence(&self) {
        let table = self.inner.table.read().expect("runner table poisoned");
        for (key, handle) in &table.runners {
            assert!(
                table.runner_configs.contains_key(key),
                "runner {:?} missing from configs",
                key
            );
            assert!(
                table.runner_names.contains(handle.name()),
                "runner name {:?} missing from names",
                handle.name()
            );
        }
        assert!(table.runner_names.len() <= table.runner_configs.len());
    }
}

/// Resolve to an absolute, lexically cleaned path without touching the
/// filesystem (the target may already be deleted when we get here).
pub fn normalize_path(path: &Path) -> Result<PathBuf> {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let mut out = PathBuf::new();
    for comp in abs.components() {
        match comp {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}
