// SPDX-License-Identifier: Apache-2.0

//! Runner configuration: the serialized description a runner is built from.
//!
//! Configurations live in `<name>.conf` files as pretty-printed JSON. The
//! reader/parser/sender sections are free-form maps whose interpretation
//! belongs to the plugin named by their `type` key.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Free-form plugin specification.
pub type Spec = serde_json::Map<String, Value>;

/// A parsed record flowing from parser to senders.
pub type Record = serde_json::Map<String, Value>;

/// File permission for persisted configuration files.
#[cfg(unix)]
pub const DEFAULT_FILE_PERM: u32 = 0o644;
/// Directory permission for the REST directory.
#[cfg(unix)]
pub const DEFAULT_DIR_PERM: u32 = 0o755;

/// Key injected into every sender spec so downstream services can identify
/// the agent that produced the data.
pub const INNER_USER_AGENT: &str = "inner_user_agent";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub runner_name: String,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub is_stopped: bool,
    #[serde(default)]
    pub is_in_web_folder: bool,
    #[serde(default)]
    pub reader: Spec,
    #[serde(default)]
    pub parser: Spec,
    #[serde(default)]
    pub senders: Vec<Spec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleaner: Option<Spec>,
}

/// Load a runner configuration from a `.conf` file.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    let raw = fs::read_to_string(path)?;
    let conf: RunnerConfig = serde_json::from_str(&raw)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    Ok(conf)
}

/// Persist a runner configuration as pretty JSON with 0644 permissions.
/// The parent directory is created with 0755 when missing.
pub fn save_config(path: &Path, conf: &RunnerConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(parent, fs::Permissions::from_mode(DEFAULT_DIR_PERM))?;
            }
        }
    }
    let body = serde_json::to_string_pretty(conf)?;
    fs::write(path, body)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(DEFAULT_FILE_PERM))?;
    }
    Ok(())
}

const SCHEMA_FREE_TOKENS_PREFIX: &str = "pandora_schema_free_tokens_";
const LOGDB_TOKENS_PREFIX: &str = "pandora_logdb_tokens_";
const TSDB_TOKENS_PREFIX: &str = "pandora_tsdb_tokens_";
const KODO_TOKENS_PREFIX: &str = "pandora_kodo_tokens_";

/// The closed set of sender-config keys carrying auth material. Stripped
/// from configs handed back to callers; persisted files keep their tokens.
fn secret_key_names(trim_sk: bool) -> Vec<String> {
    let mut names: Vec<String> = [
        "pipeline_get_repo_token",
        "pipeline_post_data_token",
        "pipeline_post_rawtext_data_token",
        "pipeline_create_repo_token",
        "pipeline_update_repo_token",
        "pipeline_get_workflow_token",
        "pipeline_stop_workflow_token",
        "pipeline_start_workflow_token",
        "pipeline_create_workflow_token",
        "pipeline_Get_workflow_status_token",
    ]
    .iter()
    .map(|k| format!("{}{}", SCHEMA_FREE_TOKENS_PREFIX, k))
    .collect();

    names.extend(
        [
            "pipeline_get_repo_token",
            "pipeline_create_repo_token",
            "create_logdb_repo_token",
            "update_logdb_repo_token",
            "get_logdb_repo_token",
            "create_export_token",
            "update_export_token",
            "get_export_token",
            "list_export_token",
        ]
        .iter()
        .map(|k| format!("{}{}", LOGDB_TOKENS_PREFIX, k)),
    );

    names.extend(
        [
            "pipeline_get_repo_token",
            "create_tsdb_repo_token",
            "list_export_token",
            "create_tsdb_series_token",
            "create_export_token",
            "update_export_token",
            "get_export_token",
        ]
        .iter()
        .map(|k| format!("{}{}", TSDB_TOKENS_PREFIX, k)),
    );

    names.extend(
        [
            "pipeline_get_repo_token",
            "create_export_token",
            "update_export_token",
            "get_export_token",
            "list_export_token",
        ]
        .iter()
        .map(|k| format!("{}{}", KODO_TOKENS_PREFIX, k)),
    );

    if trim_sk {
        names.push("pandora_sk".to_string());
    }
    names
}

/// Remove auth tokens from every sender spec. Idempotent: applying it twice
/// yields the same configuration.
pub fn trim_secret_info(mut conf: RunnerConfig, trim_sk: bool) -> RunnerConfig {
    let names = secret_key_names(trim_sk);
    for sc in conf.senders.iter_mut() {
        for key in &names {
            sc.remove(key);
        }
    }
    conf
}

/// Typed accessors over free-form plugin specs, with defaults.
pub fn spec_str<'a>(spec: &'a Spec, key: &str, default: &'a str) -> &'a str {
    spec.get(key).and_then(Value::as_str).unwrap_or(default)
}

pub fn spec_bool(spec: &Spec, key: &str, default: bool) -> bool {
    spec.get(key).and_then(Value::as_bool).unwrap_or(default)
}

pub fn spec_i64(spec: &Spec, key: &str, default: i64) -> i64 {
    spec.get(key).and_then(Value::as_i64).unwrap_or(default)
}

pub fn spec_str_list(spec: &Spec, key: &str) -> Vec<String> {
    spec.get(key)
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sender_with_tokens() -> Spec {
        let mut s = Spec::new();
        s.insert("type".into(), json!("file"));
        s.insert(
            "pandora_schema_free_tokens_pipeline_get_repo_token".into(),
            json!("secret-a"),
        );
        s.insert(
            "pandora_logdb_tokens_create_export_token".into(),
            json!("secret-b"),
        );
        s.insert("pandora_sk".into(), json!("secret-sk"));
        s
    }

    #[test]
    fn trim_removes_token_keys() {
        let conf = RunnerConfig {
            runner_name: "r".into(),
            senders: vec![sender_with_tokens()],
            ..Default::default()
        };
        let trimmed = trim_secret_info(conf, false);
        let sc = &trimmed.senders[0];
        assert!(sc.get("type").is_some());
        assert!(sc
            .get("pandora_schema_free_tokens_pipeline_get_repo_token")
            .is_none());
        assert!(sc.get("pandora_logdb_tokens_create_export_token").is_none());
        // pandora_sk survives unless trim_sk is requested
        assert!(sc.get("pandora_sk").is_some());
    }

    #[test]
    fn trim_sk_removes_secret_key() {
        let conf = RunnerConfig {
            runner_name: "r".into(),
            senders: vec![sender_with_tokens()],
            ..Default::default()
        };
        let trimmed = trim_secret_info(conf, true);
        assert!(trimmed.senders[0].get("pandora_sk").is_none());
    }

    #[test]
    fn trim_is_a_projection() {
        let conf = RunnerConfig {
            runner_name: "r".into(),
            senders: vec![sender_with_tokens()],
            ..Default::default()
        };
        let once = trim_secret_info(conf, true);
        let twice = trim_secret_info(once.clone(), true);
        assert_eq!(
            serde_json::to_string(&once).unwrap(),
            serde_json::to_string(&twice).unwrap()
        );
    }

    #[test]
    fn config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.conf");
        let mut reader = Spec::new();
        reader.insert("type".into(), json!("dir"));
        reader.insert("log_path".into(), json!("/var/log/app"));
        let conf = RunnerConfig {
            runner_name: "app".into(),
            create_time: "2024-01-01T00:00:00.000000000Z".into(),
            reader,
            ..Default::default()
        };
        save_config(&path, &conf).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.runner_name, "app");
        assert_eq!(spec_str(&loaded.reader, "type", ""), "dir");
        assert!(!loaded.is_stopped);
    }

    #[test]
    fn malformed_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.conf");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn spec_accessors_default() {
        let mut spec = Spec::new();
        spec.insert("n".into(), json!(7));
        spec.insert("b".into(), json!(true));
        assert_eq!(spec_i64(&spec, "n", 0), 7);
        assert_eq!(spec_i64(&spec, "missing", 42), 42);
        assert!(spec_bool(&spec, "b", false));
        assert_eq!(spec_str(&spec, "missing", "x"), "x");
    }
}
