// SPDX-License-Identifier: Apache-2.0

use chrono::Utc;
use serde_json::Value;

use crate::config::{spec_bool, spec_str, Record, Spec};
use crate::error::Result;
use crate::parser::Parser;

/// Emits each line as `{"raw": <line>}`, optionally stamped with the parse
/// timestamp.
pub struct RawParser {
    name: String,
    with_timestamp: bool,
}

impl RawParser {
    pub fn new(name: impl Into<String>, with_timestamp: bool) -> Self {
        RawParser {
            name: name.into(),
            with_timestamp,
        }
    }

    pub fn from_spec(spec: &Spec) -> Self {
        RawParser::new(
            spec_str(spec, "name", "raw"),
            spec_bool(spec, "timestamp", false),
        )
    }
}

impl Parser for RawParser {
    fn name(&self) -> &str {
        &self.name
    }

    fn parse(&self, lines: Vec<String>) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(lines.len());
        for line in lines {
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() {
                continue;
            }
            let mut rec = Record::new();
            rec.insert("raw".to_string(), Value::String(trimmed.to_string()));
            if self.with_timestamp {
                rec.insert(
                    "timestamp".to_string(),
                    Value::String(Utc::now().to_rfc3339()),
                );
            }
            records.push(rec);
        }
        Ok(records)
    }
}
