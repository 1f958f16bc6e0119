// SPDX-License-Identifier: Apache-2.0

//! Per-runner cleanup signaling.
//!
//! A runner's cleaner announces, per log file, that this runner no longer
//! needs the file. The manager's clean-queue coordinator counts signals
//! across every runner sharing the directory and deletes the file only when
//! all of them have released it.

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::bounded_channel::BoundedSender;
use crate::config::{spec_bool, spec_str, Spec};

/// Read mode whose clean signals match queue keys by glob instead of exact
/// directory equality.
pub const READ_MODE_TAILX: &str = "tailx";

/// Declared intent of a runner's cleaner, contributed at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanInfo {
    pub enable: bool,
    pub logdir: PathBuf,
}

/// One released file: `(dir, file)` plus the emitting cleaner's identity.
#[derive(Debug, Clone)]
pub struct CleanSignal {
    pub cleaner_name: String,
    pub logdir: PathBuf,
    pub filename: String,
    pub read_mode: String,
}

pub struct Cleaner {
    name: String,
    logdir: PathBuf,
    read_mode: String,
    enable: bool,
    tx: BoundedSender<CleanSignal>,
}

impl Cleaner {
    /// Build a cleaner from its config spec. A missing or disabled spec
    /// yields a disabled cleaner that never emits.
    pub fn from_spec(
        spec: Option<&Spec>,
        runner_name: &str,
        logdir: PathBuf,
        read_mode: &str,
        tx: BoundedSender<CleanSignal>,
    ) -> Self {
        let enable = spec.map(|s| spec_bool(s, "delete_enable", false)).unwrap_or(false);
        let name = spec
            .map(|s| spec_str(s, "cleaner_name", runner_name).to_string())
            .unwrap_or_else(|| runner_name.to_string());
        Cleaner {
            name,
            logdir,
            read_mode: read_mode.to_string(),
            enable,
            tx,
        }
    }

    pub fn info(&self) -> CleanInfo {
        CleanInfo {
            enable: self.enable,
            logdir: self.logdir.clone(),
        }
    }

    /// Announce that this runner has drained `filename`. Blocks until the
    /// manager's dispatcher takes the signal; a disconnected dispatcher
    /// (agent shutting down) drops the signal.
    pub fn emit(&self, filename: &str) {
        if !self.enable {
            return;
        }
        let sig = CleanSignal {
            cleaner_name: self.name.clone(),
            logdir: self.logdir.clone(),
            filename: filename.to_string(),
            read_mode: self.read_mode.clone(),
        };
        debug!(
            cleaner = %self.name,
            file = filename,
            "emitting clean signal"
        );
        if self.tx.send(sig).is_err() {
            warn!(
                cleaner = %self.name,
                file = filename,
                "clean dispatcher is gone, dropping signal"
            );
        }
    }
}
