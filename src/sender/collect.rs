// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex};

use crate::config::Record;
use crate::error::Result;
use crate::sender::Sender;

/// Shared handle to the records a [`CollectSender`] has accepted.
pub type CollectedRecords = Arc<Mutex<Vec<Record>>>;

/// Keeps every record in memory. Used as the discard sink and as the
/// observable endpoint in tests.
pub struct CollectSender {
    name: String,
    records: CollectedRecords,
}

impl CollectSender {
    pub fn new(name: impl Into<String>) -> Self {
        CollectSender {
            name: name.into(),
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle for observing collected records from outside the runner.
    pub fn records(&self) -> CollectedRecords {
        self.records.clone()
    }
}

impl Sender for CollectSender {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&mut self, records: Vec<Record>) -> Result<()> {
        self.records
            .lock()
            .expect("collector poisoned")
            .extend(records);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collects_records_across_sends() {
        let mut s = CollectSender::new("collect");
        let handle = s.records();

        let mut rec = Record::new();
        rec.insert("raw".into(), json!("a"));
        s.send(vec![rec.clone()]).unwrap();
        s.send(vec![rec]).unwrap();

        assert_eq!(handle.lock().unwrap().len(), 2);
    }
}
