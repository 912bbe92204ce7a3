use crate::config::FaultConfig;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum FaultError {
    #[error("reject_all")]
    Reject,
    #[error("random_fail_rate:{rate}")]
    Random { rate: f64 },
    #[error("disk_full:{path}")]
    DiskFull { path: String },
}

/// Operator-driven fault injection. The fault section is re-read from the
/// config file on every stage check so faults can be injected into a running
/// gateway without restart.
#[derive(Debug, Clone)]
pub struct FaultInjector {
    config_path: PathBuf,
}

impl FaultInjector {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    pub fn current(&self) -> FaultConfig {
        FaultConfig::load_lenient(&self.config_path)
    }

    /// Stage checks are named `receive` and `forward`; the injected behavior
    /// is the same at either stage.
    pub fn apply_faults(&self, _stage: &str) -> Result<(), FaultError> {
        let faults = self.current();
        if faults.reject_all {
            return Err(FaultError::Reject);
        }
        if faults.io_delay_ms > 0 {
            thread::sleep(Duration::from_millis(faults.io_delay_ms));
        }
        if faults.random_fail_rate > 0.0 && uniform_unit() < faults.random_fail_rate {
            return Err(FaultError::Random {
                rate: faults.random_fail_rate,
            });
        }
        Ok(())
    }

    /// Checked before any write to `path`.
    pub fn simulate_disk_full(&self, path: &Path) -> Result<(), FaultError> {
        if self.current().disk_full {
            return Err(FaultError::DiskFull {
                path: path.display().to_string(),
            });
        }
        Ok(())
    }
}

fn uniform_unit() -> f64 {
    let mut buf = [0u8; 8];
    if getrandom::getrandom(&mut buf).is_err() {
        // An unavailable entropy source must not fail traffic on its own.
        return 1.0;
    }
    (u64::from_le_bytes(buf) >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Instant;

    fn write_faults(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("config.yaml");
        fs::write(&path, format!("fault_injection:\n{body}")).expect("write config");
        path
    }

    #[test]
    fn all_off_passes_every_stage() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let injector = FaultInjector::new(write_faults(tmp.path(), "  reject_all: false\n"));
        injector.apply_faults("receive").expect("receive passes");
        injector.apply_faults("forward").expect("forward passes");
        injector
            .simulate_disk_full(Path::new("/tmp/x.dcm"))
            .expect("no disk-full fault");
    }

    #[test]
    fn reject_all_fails_any_stage_check() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let injector = FaultInjector::new(write_faults(tmp.path(), "  reject_all: true\n"));
        let err = injector.apply_faults("receive").expect_err("must reject");
        assert_eq!(err.to_string(), "reject_all");
    }

    #[test]
    fn random_fail_rate_one_always_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let injector =
            FaultInjector::new(write_faults(tmp.path(), "  random_fail_rate: 1.0\n"));
        let err = injector.apply_faults("forward").expect_err("must fail");
        assert_eq!(err.to_string(), "random_fail_rate:1");
    }

    #[test]
    fn io_delay_blocks_the_caller() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let injector = FaultInjector::new(write_faults(tmp.path(), "  io_delay_ms: 60\n"));
        let started = Instant::now();
        injector.apply_faults("receive").expect("delay then pass");
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn disk_full_carries_the_target_path() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let injector = FaultInjector::new(write_faults(tmp.path(), "  disk_full: true\n"));
        let err = injector
            .simulate_disk_full(Path::new("/data/incoming/1.2.3/1.2.3.4.dcm"))
            .expect_err("disk full");
        assert_eq!(err.to_string(), "disk_full:/data/incoming/1.2.3/1.2.3.4.dcm");
    }

    #[test]
    fn config_edits_are_visible_without_restart() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = write_faults(tmp.path(), "  reject_all: false\n");
        let injector = FaultInjector::new(path.clone());
        injector.apply_faults("receive").expect("initially clean");

        fs::write(&path, "fault_injection:\n  reject_all: true\n").expect("inject");
        assert!(injector.apply_faults("receive").is_err());

        fs::write(&path, "fault_injection:\n  reject_all: false\n").expect("clear");
        injector.apply_faults("receive").expect("cleared");
    }

    #[test]
    fn uniform_draws_stay_in_unit_interval() {
        for _ in 0..64 {
            let draw = uniform_unit();
            assert!((0.0..1.0).contains(&draw), "{draw}");
        }
    }
}
