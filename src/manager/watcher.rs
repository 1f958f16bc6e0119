// SPDX-License-Identifier: Apache-2.0

//! Watcher over one configuration directory.
//!
//! Wraps the `notify` crate directly rather than a debouncer: the manager
//! dispatches on the event *kind* (create, modify, remove, rename), which
//! debouncing erases.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Create,
    Modify,
    Remove,
    Rename,
    Other,
}

#[derive(Debug, Clone)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub paths: Vec<PathBuf>,
}

/// Watches a single directory (non-recursively) for configuration changes.
pub struct DirWatcher {
    // Held for its Drop: dropping the watcher stops the OS subscription.
    _watcher: RecommendedWatcher,
    rx: Receiver<std::result::Result<Event, notify::Error>>,
}

impl DirWatcher {
    pub fn new(path: &Path) -> Result<Self> {
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<Event, notify::Error>| {
                let _ = tx.send(res);
            },
        )
        .map_err(|e| Error::Watcher(e.to_string()))?;
        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Watcher(e.to_string()))?;
        Ok(DirWatcher { _watcher: watcher, rx })
    }

    fn convert(event: Event) -> FileEvent {
        let kind = match event.kind {
            EventKind::Create(_) => FileEventKind::Create,
            EventKind::Modify(ModifyKind::Name(_)) => FileEventKind::Rename,
            EventKind::Modify(_) => FileEventKind::Modify,
            EventKind::Remove(_) => FileEventKind::Remove,
            _ => FileEventKind::Other,
        };
        FileEvent {
            kind,
            paths: event.paths,
        }
    }

    /// Wait for the next event. `None` on timeout; `Err` once the watcher
    /// backend is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<FileEvent>> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(event)) => Ok(Some(Self::convert(event))),
            Ok(Err(e)) => {
                warn!("file watcher error: {}", e);
                Ok(None)
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Disconnected),
        }
    }
}
