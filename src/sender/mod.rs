// SPDX-License-Identifier: Apache-2.0

//! Senders push parsed records downstream. The file sink writes JSON lines;
//! the collector keeps records in memory and doubles as a discard sink and
//! a test double. Anything heavier is a plugin.

mod collect;
mod file;

pub use collect::{CollectSender, CollectedRecords};
pub use file::FileSender;

use crate::config::Record;
use crate::error::Result;

pub trait Sender: Send {
    fn name(&self) -> &str;

    fn send(&mut self, records: Vec<Record>) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}
