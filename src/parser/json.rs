// SPDX-License-Identifier: Apache-2.0

use serde_json::Value;
use tracing::debug;

use crate::config::{spec_str, Record, Spec};
use crate::error::Result;
use crate::parser::Parser;

/// Parses each line as a JSON object. Lines that are not objects are
/// skipped with a debug log rather than failing the batch.
pub struct JsonParser {
    name: String,
}

impl JsonParser {
    pub fn new(name: impl Into<String>) -> Self {
        JsonParser { name: name.into() }
    }

    pub fn from_spec(spec: &Spec) -> Self {
        JsonParser::new(spec_str(spec, "name", "json"))
    }
}

impl Parser for JsonParser {
    fn name(&self) -> &str {
        &self.name
    }

    fn parse(&self, lines: Vec<String>) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(lines.len());
        for line in lines {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(Value::Object(map)) => records.push(map),
                Ok(other) => {
                    debug!(parser = %self.name, "skipping non-object JSON value: {}", other);
                }
                Err(e) => {
                    debug!(parser = %self.name, "skipping unparseable line: {}", e);
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_objects_and_skips_garbage() {
        let p = JsonParser::new("json");
        let recs = p
            .parse(vec![
                r#"{"a": 1}"#.to_string(),
                "not json".to_string(),
                r#"[1, 2]"#.to_string(),
                r#"{"b": "x"}"#.to_string(),
            ])
            .unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].get("a").unwrap(), 1);
        assert_eq!(recs[1].get("b").and_then(Value::as_str), Some("x"));
    }
}
