// SPDX-License-Identifier: Apache-2.0

//! Parsers turn raw lines into structured records. Only the built-ins the
//! agent itself needs live here; everything else is a plugin registered by
//! the embedder.

mod json;
mod raw;

pub use json::JsonParser;
pub use raw::RawParser;

use crate::config::Record;
use crate::error::Result;

pub trait Parser: Send {
    fn name(&self) -> &str;

    /// Parse a batch of lines. Unparseable lines are the parser's own
    /// business: it may skip them or surface an error for the whole batch.
    fn parse(&self, lines: Vec<String>) -> Result<Vec<Record>>;
}
