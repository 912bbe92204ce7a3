use chrono::Utc;
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
        }
    }
}

/// Append-only JSON-line event stream. Every gateway event is one UTF-8 JSON
/// object per line, written to the configured log file and echoed to stderr.
/// Consumers parse by key; key order is not guaranteed.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: Arc<PathBuf>,
    echo_stderr: bool,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            echo_stderr: true,
        }
    }

    /// File-only variant used by tests.
    pub fn file_only(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            echo_stderr: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, level: Level, stage: &str, fields: &[(&str, Value)]) {
        let mut payload = Map::new();
        payload.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        );
        payload.insert("level".to_string(), Value::String(level.as_str().to_string()));
        payload.insert("stage".to_string(), Value::String(stage.to_string()));
        for (name, value) in fields {
            payload.insert((*name).to_string(), value.clone());
        }

        let Ok(line) = serde_json::to_string(&Value::Object(payload)) else {
            return;
        };

        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_ref())
            .and_then(|mut file| file.write_all(format!("{line}\n").as_bytes()));

        if self.echo_stderr {
            eprintln!("{line}");
        }
    }
}

/// `None` becomes an explicit JSON null, matching the wire log contract.
pub fn or_null<T: Into<Value>>(value: Option<T>) -> Value {
    value.map(Into::into).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read_lines(path: &Path) -> Vec<Value> {
        fs::read_to_string(path)
            .expect("read log")
            .lines()
            .map(|line| serde_json::from_str(line).expect("parse log line"))
            .collect()
    }

    #[test]
    fn events_are_one_json_object_per_line() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::file_only(tmp.path().join("edge.log"));

        log.log(
            Level::Info,
            "receive",
            &[
                ("study_uid", json!("1.2.3")),
                ("sop_uid", json!("1.2.3.4")),
                ("outcome", json!("accepted")),
                ("error", Value::Null),
            ],
        );
        log.log(
            Level::Error,
            "forward",
            &[("outcome", json!("retry")), ("error", json!("timeout"))],
        );

        let lines = read_lines(log.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["level"], "info");
        assert_eq!(lines[0]["stage"], "receive");
        assert_eq!(lines[0]["study_uid"], "1.2.3");
        assert!(lines[0]["error"].is_null());
        assert_eq!(lines[1]["level"], "error");
        assert_eq!(lines[1]["error"], "timeout");
    }

    #[test]
    fn timestamps_are_utc_seconds_with_trailing_z() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::file_only(tmp.path().join("edge.log"));
        log.log(Level::Info, "db", &[("outcome", json!("connected"))]);

        let lines = read_lines(log.path());
        let stamp = lines[0]["timestamp"].as_str().expect("timestamp string");
        assert!(stamp.ends_with('Z'), "{stamp}");
        assert_eq!(stamp.len(), "2026-01-01T00:00:00Z".len(), "{stamp}");
    }

    #[test]
    fn or_null_maps_absent_values() {
        assert_eq!(or_null(Some("x")), json!("x"));
        assert_eq!(or_null::<&str>(None), Value::Null);
    }

    #[test]
    fn log_parent_directory_is_created_on_demand() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::file_only(tmp.path().join("logs/nested/edge.log"));
        log.log(Level::Warning, "receive", &[]);
        assert_eq!(read_lines(log.path()).len(), 1);
    }
}
