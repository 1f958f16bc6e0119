// SPDX-License-Identifier: Apache-2.0

//! Named constructors for reader/parser/sender specs.
//!
//! The manager builds runners through a registry instance, so embedders and
//! tests can add plugin kinds (for instance a SQL reader bound to a
//! concrete client) without touching the manager.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{spec_i64, spec_str, Spec};
use crate::error::{Error, Result};
use crate::meta::Meta;
use crate::parser::{JsonParser, Parser, RawParser};
use crate::reader::bufreader::DEFAULT_BUF_SIZE;
use crate::reader::{BufReader, DirSource, LogReader, StartAt};
use crate::sender::{CollectSender, FileSender, Sender};

pub type ReaderConstructor =
    Box<dyn Fn(Arc<Meta>, &Spec) -> Result<Box<dyn LogReader>> + Send + Sync>;
pub type ParserConstructor = Box<dyn Fn(&Spec) -> Result<Box<dyn Parser>> + Send + Sync>;
pub type SenderConstructor = Box<dyn Fn(&Spec) -> Result<Box<dyn Sender>> + Send + Sync>;

pub struct Registry {
    readers: HashMap<String, ReaderConstructor>,
    parsers: HashMap<String, ParserConstructor>,
    senders: HashMap<String, SenderConstructor>,
}

impl Registry {
    pub fn empty() -> Self {
        Registry {
            readers: HashMap::new(),
            parsers: HashMap::new(),
            senders: HashMap::new(),
        }
    }

    pub fn register_reader(&mut self, kind: impl Into<String>, ctor: ReaderConstructor) {
        self.readers.insert(kind.into(), ctor);
    }

    pub fn register_parser(&mut self, kind: impl Into<String>, ctor: ParserConstructor) {
        self.parsers.insert(kind.into(), ctor);
    }

    pub fn register_sender(&mut self, kind: impl Into<String>, ctor: SenderConstructor) {
        self.senders.insert(kind.into(), ctor);
    }

    pub fn new_reader(&self, meta: Arc<Meta>, spec: &Spec) -> Result<Box<dyn LogReader>> {
        let kind = spec_str(spec, "type", "dir");
        let ctor = self
            .readers
            .get(kind)
            .ok_or_else(|| Error::Config(format!("unknown reader type {:?}", kind)))?;
        ctor(meta, spec)
    }

    pub fn new_parser(&self, spec: &Spec) -> Result<Box<dyn Parser>> {
        let kind = spec_str(spec, "type", "raw");
        let ctor = self
            .parsers
            .get(kind)
            .ok_or_else(|| Error::Config(format!("unknown parser type {:?}", kind)))?;
        ctor(spec)
    }

    pub fn new_sender(&self, spec: &Spec) -> Result<Box<dyn Sender>> {
        let kind = spec_str(spec, "type", "discard");
        let ctor = self
            .senders
            .get(kind)
            .ok_or_else(|| Error::Config(format!("unknown sender type {:?}", kind)))?;
        ctor(spec)
    }
}

impl Default for Registry {
    /// The built-in plugin set: the directory reader, raw/JSON parsers, and
    /// the file/discard senders.
    fn default() -> Self {
        let mut r = Registry::empty();

        r.register_reader(
            "dir",
            Box::new(|meta, spec| {
                let log_path = spec_str(spec, "log_path", "");
                if log_path.is_empty() {
                    return Err(Error::Config("dir reader requires log_path".into()));
                }
                let start_at = spec_str(spec, "read_from", "beginning")
                    .parse::<StartAt>()
                    .map_err(Error::Config)?;
                let source = DirSource::new(log_path, meta.clone(), start_at)?;
                let size = spec_i64(spec, "buffer_size", DEFAULT_BUF_SIZE as i64) as usize;
                let mut reader = BufReader::open(Box::new(source), meta, size)?;
                let head = spec_str(spec, "head_pattern", "");
                if !head.is_empty() {
                    reader.set_mode(head)?;
                }
                Ok(Box::new(reader) as Box<dyn LogReader>)
            }),
        );

        r.register_parser(
            "raw",
            Box::new(|spec| Ok(Box::new(RawParser::from_spec(spec)) as Box<dyn Parser>)),
        );
        r.register_parser(
            "json",
            Box::new(|spec| Ok(Box::new(JsonParser::from_spec(spec)) as Box<dyn Parser>)),
        );

        r.register_sender(
            "file",
            Box::new(|spec| Ok(Box::new(FileSender::from_spec(spec)?) as Box<dyn Sender>)),
        );
        r.register_sender(
            "discard",
            Box::new(|spec| {
                Ok(Box::new(CollectSender::new(spec_str(spec, "name", "discard")))
                    as Box<dyn Sender>)
            }),
        );

        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn unknown_kinds_are_rejected() {
        let dir = TempDir::new().unwrap();
        let meta = Arc::new(Meta::new(dir.path().join("m"), "r", "p").unwrap());
        let reg = Registry::default();

        let mut spec = Spec::new();
        spec.insert("type".into(), json!("nope"));
        assert!(reg.new_reader(meta, &spec).is_err());
        assert!(reg.new_parser(&spec).is_err());
        assert!(reg.new_sender(&spec).is_err());
    }

    #[test]
    fn builds_dir_reader_pipeline() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("logs");
        std::fs::create_dir(&logs).unwrap();
        let meta = Arc::new(Meta::new(dir.path().join("m"), "r", "p").unwrap());
        let reg = Registry::default();

        let mut spec = Spec::new();
        spec.insert("type".into(), json!("dir"));
        spec.insert("log_path".into(), json!(logs.to_str().unwrap()));
        let reader = reg.new_reader(meta, &spec).unwrap();
        assert!(reader.name().starts_with("dirfile:"));
    }

    #[test]
    fn missing_log_dir_surfaces_typed_error() {
        let dir = TempDir::new().unwrap();
        let meta = Arc::new(Meta::new(dir.path().join("m"), "r", "p").unwrap());
        let reg = Registry::default();

        let mut spec = Spec::new();
        spec.insert("type".into(), json!("dir"));
        spec.insert(
            "log_path".into(),
            json!(dir.path().join("missing").to_str().unwrap()),
        );
        let err = match reg.new_reader(meta, &spec) {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::LogDirNotExist(_)));
    }

    #[test]
    fn custom_registration_wins() {
        let mut reg = Registry::empty();
        reg.register_parser(
            "raw",
            Box::new(|_| Ok(Box::new(RawParser::new("custom", true)) as Box<dyn Parser>)),
        );
        let parser = reg.new_parser(&Spec::new()).unwrap();
        assert_eq!(parser.name(), "custom");
    }
}
