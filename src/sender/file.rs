// SPDX-License-Identifier: Apache-2.0

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use crate::config::{spec_str, Record, Spec};
use crate::error::{Error, Result};
use crate::sender::Sender;

/// Appends records to a file as JSON lines. The sink file is opened lazily
/// on first send so a runner can be configured before the target directory
/// exists.
pub struct FileSender {
    name: String,
    path: PathBuf,
    file: Option<File>,
}

impl FileSender {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        FileSender {
            name: name.into(),
            path: path.into(),
            file: None,
        }
    }

    pub fn from_spec(spec: &Spec) -> Result<Self> {
        let path = spec_str(spec, "file_path", "");
        if path.is_empty() {
            return Err(Error::Config("file sender requires file_path".into()));
        }
        Ok(FileSender::new(spec_str(spec, "name", "file"), path))
    }

    fn ensure_open(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.file = Some(f);
        }
        Ok(self.file.as_mut().expect("just opened"))
    }
}

impl Sender for FileSender {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&mut self, records: Vec<Record>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut body = String::new();
        for rec in &records {
            body.push_str(&serde_json::to_string(rec)?);
            body.push('\n');
        }
        let f = self.ensure_open()?;
        f.write_all(body.as_bytes())?;
        f.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(f) = self.file.take() {
            f.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn writes_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut s = FileSender::new("file", &path);

        let mut rec = Record::new();
        rec.insert("raw".into(), json!("hello"));
        s.send(vec![rec.clone()]).unwrap();
        s.send(vec![rec]).unwrap();
        s.close().unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"raw":"hello"}"#);
    }

    #[test]
    fn creates_missing_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deep/nested/out.jsonl");
        let mut s = FileSender::new("file", &path);
        let mut rec = Record::new();
        rec.insert("raw".into(), json!("x"));
        s.send(vec![rec]).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn spec_without_path_is_rejected() {
        let spec = Spec::new();
        assert!(FileSender::from_spec(&spec).is_err());
    }
}
