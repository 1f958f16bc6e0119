// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios driving the manager with real config files, log
//! directories and file sinks.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tempfile::TempDir;

use logship::config::{RunnerConfig, Spec};
use logship::manager::{Manager, ManagerConfig};
use logship::reader::LogReader;
use logship::registry::Registry;
use logship::sql::{SqlClient, SqlReader, SqlRows, SqlValue};

fn manager_at(root: &Path) -> Manager {
    Manager::new(ManagerConfig {
        rest_dir: root.join("rest"),
        meta_root: root.join("meta"),
        stop_grace: Duration::from_secs(1),
        ..Default::default()
    })
    .unwrap()
}

fn runner_conf(name: &str, logs: &Path, sink: &Path) -> RunnerConfig {
    runner_conf_with(name, logs, sink, |_| {})
}

fn runner_conf_with(
    name: &str,
    logs: &Path,
    sink: &Path,
    tweak: impl FnOnce(&mut RunnerConfig),
) -> RunnerConfig {
    let mut reader = Spec::new();
    reader.insert("type".into(), json!("dir"));
    reader.insert("log_path".into(), json!(logs.to_str().unwrap()));
    let mut sender = Spec::new();
    sender.insert("type".into(), json!("file"));
    sender.insert("file_path".into(), json!(sink.to_str().unwrap()));
    let mut conf = RunnerConfig {
        runner_name: name.into(),
        reader,
        senders: vec![sender],
        ..Default::default()
    };
    tweak(&mut conf);
    conf
}

fn append(path: &Path, content: &str) {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    f.write_all(content.as_bytes()).unwrap();
    f.sync_all().unwrap();
}

/// Raw line values collected by a file sink.
fn sink_lines(path: &Path) -> Vec<String> {
    let Ok(body) = fs::read_to_string(path) else {
        return Vec::new();
    };
    body.lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|v| v.get("raw").and_then(Value::as_str).map(str::to_string))
        .collect()
}

fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

fn write_conf(dir: &Path, conf: &RunnerConfig) -> PathBuf {
    let path = dir.join(format!("{}.conf", conf.runner_name));
    fs::write(&path, serde_json::to_string_pretty(conf).unwrap()).unwrap();
    path
}

#[test]
fn basic_file_ingestion_delivers_lines_in_order() {
    let root = TempDir::new().unwrap();
    let confs = root.path().join("confs");
    let logs = root.path().join("logs");
    let sink = root.path().join("sink.jsonl");
    fs::create_dir_all(&confs).unwrap();
    fs::create_dir_all(&logs).unwrap();

    write_conf(&confs, &runner_conf("s1", &logs, &sink));

    let m = manager_at(root.path());
    m.watch(vec![confs.to_str().unwrap().to_string()]);

    append(&logs.join("a.log"), "L1\nL2\nL3\n");

    assert!(
        wait_until(Duration::from_secs(15), || sink_lines(&sink).len() >= 3),
        "sink never received the lines"
    );
    assert_eq!(sink_lines(&sink), vec!["L1", "L2", "L3"]);
    m.stop().unwrap();
}

#[test]
fn checkpoint_resume_skips_already_sent_lines() {
    let root = TempDir::new().unwrap();
    let logs = root.path().join("logs");
    let sink = root.path().join("sink.jsonl");
    fs::create_dir_all(&logs).unwrap();

    {
        let m = manager_at(root.path());
        m.add_runner("s2", runner_conf("s2", &logs, &sink), Utc::now())
            .unwrap();
        append(&logs.join("a.log"), "L1\nL2\n");
        assert!(wait_until(Duration::from_secs(10), || {
            sink_lines(&sink).len() >= 2
        }));
        m.stop().unwrap();
    }

    // lines written while the agent was down
    append(&logs.join("a.log"), "L3\n");

    {
        let m = manager_at(root.path());
        m.restore_rest_dir();
        assert!(
            wait_until(Duration::from_secs(15), || sink_lines(&sink).len() >= 3),
            "restarted runner never delivered the new line"
        );
        // nothing re-observed, nothing lost
        assert_eq!(sink_lines(&sink), vec!["L1", "L2", "L3"]);
        m.stop().unwrap();
    }
}

#[test]
fn multi_line_records_group_on_head_pattern() {
    let root = TempDir::new().unwrap();
    let logs = root.path().join("logs");
    let sink = root.path().join("sink.jsonl");
    fs::create_dir_all(&logs).unwrap();

    let conf = runner_conf_with("s3", &logs, &sink, |c| {
        c.reader
            .insert("head_pattern".into(), json!(r"^\d{4}-\d{2}-\d{2}"));
    });

    let m = manager_at(root.path());
    m.add_runner("s3", conf, Utc::now()).unwrap();

    append(
        &logs.join("app.log"),
        "2024-01-01 start\n stack line\n2024-01-02 next\n",
    );
    // a later head line flushes the second logical record
    append(&logs.join("app.log"), "2024-01-03 third\n");

    assert!(wait_until(Duration::from_secs(15), || {
        sink_lines(&sink).len() >= 2
    }));
    let lines = sink_lines(&sink);
    assert_eq!(lines[0], "2024-01-01 start\n stack line");
    assert_eq!(lines[1], "2024-01-02 next");
    m.stop().unwrap();
}

#[test]
fn cleaner_deletes_file_only_after_every_runner_released_it() {
    let root = TempDir::new().unwrap();
    let logs = root.path().join("logs");
    let sink1 = root.path().join("sink1.jsonl");
    let sink2 = root.path().join("sink2.jsonl");
    fs::create_dir_all(&logs).unwrap();

    let with_cleaner = |c: &mut RunnerConfig| {
        let mut cleaner = Spec::new();
        cleaner.insert("delete_enable".into(), json!(true));
        c.cleaner = Some(cleaner);
    };

    let m = manager_at(root.path());
    m.add_runner(
        "clean-a",
        runner_conf_with("clean-a", &logs, &sink1, with_cleaner),
        Utc::now(),
    )
    .unwrap();
    m.add_runner(
        "clean-b",
        runner_conf_with("clean-b", &logs, &sink2, with_cleaner),
        Utc::now(),
    )
    .unwrap();

    append(&logs.join("x.log"), "one\n");
    assert!(wait_until(Duration::from_secs(10), || {
        sink_lines(&sink1).contains(&"one".to_string())
            && sink_lines(&sink2).contains(&"one".to_string())
    }));
    // fully read by both, but not yet rotated past: nobody released it
    assert!(logs.join("x.log").exists());

    // a successor file makes both runners drain and release x.log
    append(&logs.join("y.log"), "two\n");
    assert!(
        wait_until(Duration::from_secs(15), || !logs.join("x.log").exists()),
        "x.log should be deleted once both runners signalled"
    );
    m.stop().unwrap();
}

#[test]
fn hot_reload_moves_output_to_the_new_sink() {
    let root = TempDir::new().unwrap();
    let confs = root.path().join("confs");
    let logs = root.path().join("logs");
    let sink1 = root.path().join("sink1.jsonl");
    let sink2 = root.path().join("sink2.jsonl");
    fs::create_dir_all(&confs).unwrap();
    fs::create_dir_all(&logs).unwrap();

    let m = manager_at(root.path());
    m.watch(vec![confs.to_str().unwrap().to_string()]);

    write_conf(&confs, &runner_conf("s5", &logs, &sink1));
    append(&logs.join("a.log"), "L1\n");
    assert!(wait_until(Duration::from_secs(15), || {
        sink_lines(&sink1).contains(&"L1".to_string())
    }));

    // rewrite the config pointing at a different sink
    write_conf(&confs, &runner_conf("s5", &logs, &sink2));
    assert!(
        wait_until(Duration::from_secs(15), || {
            m.configs().values().any(|c| {
                c.senders
                    .first()
                    .and_then(|s| s.get("file_path"))
                    .and_then(Value::as_str)
                    == sink2.to_str()
            })
        }),
        "modified config was never reloaded"
    );

    append(&logs.join("a.log"), "L2\n");
    assert!(wait_until(Duration::from_secs(15), || {
        sink_lines(&sink2).contains(&"L2".to_string())
    }));
    assert!(
        !sink_lines(&sink1).contains(&"L2".to_string()),
        "old sink must not receive lines after reload"
    );
    m.stop().unwrap();
}

#[test]
fn stop_then_start_preserves_offsets() {
    let root = TempDir::new().unwrap();
    let logs = root.path().join("logs");
    let sink = root.path().join("sink.jsonl");
    fs::create_dir_all(&logs).unwrap();

    let m = manager_at(root.path());
    m.add_runner("s6", runner_conf("s6", &logs, &sink), Utc::now())
        .unwrap();

    append(&logs.join("a.log"), "L1\nL2\n");
    assert!(wait_until(Duration::from_secs(10), || {
        sink_lines(&sink).len() >= 2
    }));

    m.stop_runner("s6").unwrap();
    let conf_path = m.rest_dir().join("s6.conf");
    assert!(!m.is_running(&conf_path));

    // lines appended while stopped
    append(&logs.join("a.log"), "L3\nL4\nL5\n");
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(sink_lines(&sink).len(), 2, "stopped runner must not consume");

    m.start_runner("s6").unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        sink_lines(&sink).len() >= 5
    }));
    assert_eq!(sink_lines(&sink), vec!["L1", "L2", "L3", "L4", "L5"]);
    m.stop().unwrap();
}

#[test]
fn double_stop_and_double_start_are_rejected() {
    let root = TempDir::new().unwrap();
    let logs = root.path().join("logs");
    fs::create_dir_all(&logs).unwrap();

    let m = manager_at(root.path());
    m.add_runner(
        "toggle",
        runner_conf("toggle", &logs, &root.path().join("sink.jsonl")),
        Utc::now(),
    )
    .unwrap();

    assert!(m.start_runner("toggle").is_err(), "already running");
    m.stop_runner("toggle").unwrap();
    assert!(m.stop_runner("toggle").is_err(), "already stopped");
    m.start_runner("toggle").unwrap();
    m.stop().unwrap();
}

#[test]
fn failed_persistence_rolls_the_runner_back() {
    let root = TempDir::new().unwrap();
    let logs = root.path().join("logs");
    fs::create_dir_all(&logs).unwrap();

    let m = manager_at(root.path());
    // occupy the config path with a directory so persistence must fail
    fs::create_dir_all(m.rest_dir().join("rb.conf")).unwrap();

    let err = m.add_runner(
        "rb",
        runner_conf("rb", &logs, &root.path().join("sink.jsonl")),
        Utc::now(),
    );
    assert!(err.is_err(), "persistence into a directory must fail");

    // observable state equals the pre-call state
    assert!(!m.is_running(&m.rest_dir().join("rb.conf")));
    assert!(m.configs().is_empty());
    assert!(m.status().is_empty());
    m.stop().unwrap();
}

#[test]
fn update_runner_replaces_configuration() {
    let root = TempDir::new().unwrap();
    let logs = root.path().join("logs");
    let sink1 = root.path().join("sink1.jsonl");
    let sink2 = root.path().join("sink2.jsonl");
    fs::create_dir_all(&logs).unwrap();

    let m = manager_at(root.path());
    m.add_runner("upd", runner_conf("upd", &logs, &sink1), Utc::now())
        .unwrap();
    append(&logs.join("a.log"), "L1\n");
    assert!(wait_until(Duration::from_secs(10), || {
        sink_lines(&sink1).contains(&"L1".to_string())
    }));

    m.update_runner("upd", runner_conf("upd", &logs, &sink2))
        .unwrap();
    append(&logs.join("a.log"), "L2\n");
    assert!(wait_until(Duration::from_secs(10), || {
        sink_lines(&sink2).contains(&"L2".to_string())
    }));
    assert!(!sink_lines(&sink1).contains(&"L2".to_string()));

    // the persisted file reflects the new sink
    let body = fs::read_to_string(m.rest_dir().join("upd.conf")).unwrap();
    assert!(body.contains(sink2.to_str().unwrap()));
    m.stop().unwrap();
}

#[test]
fn delete_runner_removes_config_file_and_state() {
    let root = TempDir::new().unwrap();
    let logs = root.path().join("logs");
    fs::create_dir_all(&logs).unwrap();

    let m = manager_at(root.path());
    m.add_runner(
        "del",
        runner_conf("del", &logs, &root.path().join("sink.jsonl")),
        Utc::now(),
    )
    .unwrap();
    let conf_path = m.rest_dir().join("del.conf");
    assert!(conf_path.exists());

    m.delete_runner("del").unwrap();
    assert!(!conf_path.exists());
    assert!(!m.is_running(&conf_path));
    assert!(m.configs().is_empty());
    m.stop().unwrap();
}

/// Serves a fixed sequence of result sets, then empty ones.
struct ScriptedSqlClient {
    batches: std::collections::VecDeque<SqlRows>,
}

impl SqlClient for ScriptedSqlClient {
    fn query(&mut self, _database: &str, _sql: &str) -> logship::Result<SqlRows> {
        Ok(self.batches.pop_front().unwrap_or_default())
    }
}

#[test]
fn sql_daemon_reader_flows_through_a_runner() {
    let root = TempDir::new().unwrap();
    let sink = root.path().join("sink.jsonl");

    let mut registry = Registry::default();
    registry.register_reader(
        "mysql",
        Box::new(|meta, spec| {
            let rows = SqlRows {
                columns: vec!["id".into(), "msg".into()],
                rows: vec![
                    vec![SqlValue::Long(1), SqlValue::Text("first".into())],
                    vec![SqlValue::Long(2), SqlValue::Text("second".into())],
                ],
            };
            let client = Box::new(ScriptedSqlClient {
                batches: vec![rows].into(),
            });
            Ok(Box::new(SqlReader::new(meta, spec, client)?) as Box<dyn LogReader>)
        }),
    );

    let m = Manager::with_registry(
        ManagerConfig {
            rest_dir: root.path().join("rest"),
            meta_root: root.path().join("meta"),
            stop_grace: Duration::from_secs(3),
            ..Default::default()
        },
        registry,
    )
    .unwrap();

    let mut reader = Spec::new();
    reader.insert("type".into(), json!("mysql"));
    reader.insert("database".into(), json!("appdb"));
    reader.insert("sql".into(), json!("select * from events"));
    reader.insert("offset_key".into(), json!("id"));
    let mut sender = Spec::new();
    sender.insert("type".into(), json!("file"));
    sender.insert("file_path".into(), json!(sink.to_str().unwrap()));
    let conf = RunnerConfig {
        runner_name: "sqlrun".into(),
        reader,
        senders: vec![sender],
        ..Default::default()
    };

    m.add_runner("sqlrun", conf, Utc::now()).unwrap();

    assert!(
        wait_until(Duration::from_secs(15), || {
            fs::read_to_string(&sink).map(|s| s.lines().count()).unwrap_or(0) >= 2
        }),
        "sql rows never reached the sink"
    );
    let body = fs::read_to_string(&sink).unwrap();
    let first: Value = serde_json::from_str(body.lines().next().unwrap()).unwrap();
    assert_eq!(first.get("id").unwrap(), 1);
    assert_eq!(first.get("msg").and_then(Value::as_str), Some("first"));

    m.stop().unwrap();

    // the runner checkpointed the reader's offsets on shutdown
    let offset_meta = root.path().join("meta").join("sqlrun").join("file.meta");
    let blob = fs::read_to_string(&offset_meta).unwrap();
    assert!(blob.contains("select@*@from@events"));
}

#[test]
fn reset_runner_restarts_from_scratch() {
    let root = TempDir::new().unwrap();
    let logs = root.path().join("logs");
    let sink = root.path().join("sink.jsonl");
    fs::create_dir_all(&logs).unwrap();

    let m = manager_at(root.path());
    m.add_runner("rst", runner_conf("rst", &logs, &sink), Utc::now())
        .unwrap();
    append(&logs.join("a.log"), "L1\n");
    assert!(wait_until(Duration::from_secs(10), || {
        sink_lines(&sink).len() >= 1
    }));

    m.reset_runner("rst").unwrap();

    // with its checkpoint purged the runner re-reads from the beginning
    assert!(wait_until(Duration::from_secs(10), || {
        sink_lines(&sink).len() >= 2
    }));
    assert_eq!(sink_lines(&sink), vec!["L1", "L1"]);
    m.stop().unwrap();
}
