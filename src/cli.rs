use crate::config::{self, Config, DEFAULT_CONFIG_PATH};
use crate::server;
use crate::store::{QueueStore, OPEN_RETRY_ATTEMPTS, OPEN_RETRY_DELAY};
use std::fmt::Write as _;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Failed(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Usage(_) => 2,
            CliError::Failed(_) => 1,
        }
    }
}

fn usage() -> String {
    "Usage: pacs-edge [--config <path>] <command>\n\
     \n\
     Commands:\n\
     \x20 start                 Start the edge gateway\n\
     \x20 status [--study UID]  Show queue counts or per-study records\n\
     \x20 inject-fault <name>   Enable a fault preset (reject_all, disk_full, io_delay_ms, random_fail_rate)\n\
     \x20 clear-faults          Reset all fault injection to off"
        .to_string()
}

fn fault_preset(name: &str) -> Option<Vec<(&'static str, serde_yaml::Value)>> {
    match name {
        "reject_all" => Some(vec![("reject_all", serde_yaml::Value::from(true))]),
        "disk_full" => Some(vec![("disk_full", serde_yaml::Value::from(true))]),
        "io_delay_ms" => Some(vec![("io_delay_ms", serde_yaml::Value::from(500))]),
        "random_fail_rate" => Some(vec![("random_fail_rate", serde_yaml::Value::from(0.3))]),
        _ => None,
    }
}

fn cleared_faults() -> Vec<(&'static str, serde_yaml::Value)> {
    vec![
        ("reject_all", serde_yaml::Value::from(false)),
        ("disk_full", serde_yaml::Value::from(false)),
        ("io_delay_ms", serde_yaml::Value::from(0)),
        ("random_fail_rate", serde_yaml::Value::from(0.0)),
    ]
}

pub fn run_cli(args: Vec<String>) -> Result<String, CliError> {
    let mut args = args.into_iter();
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);

    let mut command = args.next();
    if command.as_deref() == Some("--config") {
        let path = args
            .next()
            .ok_or_else(|| CliError::Usage("--config requires a path".to_string()))?;
        config_path = PathBuf::from(path);
        command = args.next();
    }
    let Some(command) = command else {
        return Err(CliError::Usage(usage()));
    };

    match command.as_str() {
        "start" => {
            server::start_gateway(&config_path).map_err(|e| CliError::Failed(e.to_string()))?;
            Ok(String::new())
        }
        "status" => {
            let study = match args.next() {
                None => None,
                Some(flag) if flag == "--study" => Some(args.next().ok_or_else(|| {
                    CliError::Usage("--study requires a study instance uid".to_string())
                })?),
                Some(other) => {
                    return Err(CliError::Usage(format!(
                        "unknown status argument `{other}`\n\n{}",
                        usage()
                    )))
                }
            };
            run_status(&config_path, study.as_deref())
        }
        "inject-fault" => {
            let name = args
                .next()
                .ok_or_else(|| CliError::Usage("inject-fault requires a fault name".to_string()))?;
            let updates = fault_preset(&name)
                .ok_or_else(|| CliError::Failed(format!("Unknown fault: {name}")))?;
            config::update_fault_section(&config_path, &updates)
                .map_err(|e| CliError::Failed(e.to_string()))?;
            Ok(format!("Injected fault: {name}"))
        }
        "clear-faults" => {
            config::update_fault_section(&config_path, &cleared_faults())
                .map_err(|e| CliError::Failed(e.to_string()))?;
            Ok("Faults cleared".to_string())
        }
        other => Err(CliError::Usage(format!(
            "unknown command `{other}`\n\n{}",
            usage()
        ))),
    }
}

fn run_status(config_path: &PathBuf, study: Option<&str>) -> Result<String, CliError> {
    let config = Config::from_path(config_path).map_err(|e| CliError::Failed(e.to_string()))?;
    let store = QueueStore::open_with_retry(
        &config.store_path(),
        OPEN_RETRY_ATTEMPTS,
        OPEN_RETRY_DELAY,
    )
    .map_err(|e| CliError::Failed(e.to_string()))?;

    if let Some(study) = study {
        let rows = store
            .get_study_rows(study)
            .map_err(|e| CliError::Failed(e.to_string()))?;
        if rows.is_empty() {
            return Ok("No records found".to_string());
        }
        let mut output = String::new();
        for row in rows {
            let _ = writeln!(
                output,
                "id={} sop_uid={} state={} retries={} ai_status={} last_error={} file={}",
                row.id,
                row.sop_uid,
                row.state.as_str(),
                row.retries,
                row.ai_status.map(|s| s.as_str()).unwrap_or("-"),
                row.last_error.as_deref().unwrap_or("-"),
                row.file_path.display(),
            );
        }
        return Ok(output.trim_end().to_string());
    }

    let counts = store
        .get_counts()
        .map_err(|e| CliError::Failed(e.to_string()))?;
    let mut output = String::new();
    for (state, count) in counts {
        let _ = writeln!(output, "{state}: {count}");
    }
    Ok(output.trim_end().to_string())
}
