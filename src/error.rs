// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("meta error: {0}")]
    Meta(String),

    #[error("log directory does not exist: {0}")]
    LogDirNotExist(PathBuf),

    #[error("buffer full")]
    BufferFull,

    #[error("end of stream")]
    Eof,

    #[error("no progress after {0} empty reads")]
    NoProgress(usize),

    #[error("runner {0} not found")]
    NotExist(String),

    #[error("not supported: {0}")]
    NotSupport(String),

    #[error("SQL error: {0}")]
    Sql(String),

    #[error("watcher error: {0}")]
    Watcher(String),

    #[error("channel disconnected")]
    Disconnected,
}

impl Error {
    /// True for conditions a reader surfaces as status without tearing the
    /// runner down.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NoProgress(_) | Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
