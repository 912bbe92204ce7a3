use crate::config::ForwarderMode;
use crate::dicom;
use crate::logging::{or_null, Level};
use crate::server::GatewayContext;
use crate::store::{ItemState, QueueItem, StoreError};
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub mod outbound;
pub mod router;

pub use outbound::{endpoint_json, ForwardError, ForwardErrorKind, Outbound};
pub use router::{determine_route, Route};

/// Fixed pause after the fault check, pacing bursts of queued items.
const POST_FAULT_PAUSE: Duration = Duration::from_millis(200);

/// Background worker that drains the queue: claim, stage the artifact into
/// `queued/`, dispatch by mode, then move the artifact to `sent/` or walk the
/// retry/backoff path toward `failed/`. Per-item failures never exit the
/// loop.
pub struct Forwarder {
    ctx: Arc<GatewayContext>,
}

impl Forwarder {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self { ctx }
    }

    pub fn run_forever(&self) {
        let poll = Duration::from_secs(self.ctx.config.forwarder.poll_interval_seconds);
        loop {
            match self.tick() {
                Ok(true) => {}
                Ok(false) => thread::sleep(poll),
                Err(_) => thread::sleep(poll),
            }
        }
    }

    /// Claim and process one item. `Ok(false)` means the queue was empty.
    pub fn tick(&self) -> Result<bool, StoreError> {
        let Some(mut item) = self.ctx.store.get_next_queued()? else {
            return Ok(false);
        };
        match self.forward_item(&mut item) {
            Ok(destination) => self.log_forward(&item, "sent", None, &destination),
            Err(error) => self.handle_failure(&item, &error),
        }
        Ok(true)
    }

    fn forward_item(&self, item: &mut QueueItem) -> Result<String, String> {
        let queued_path = self.move_artifact(item, "queued")?;
        self.ctx
            .store
            .update_state(item.id, ItemState::Forwarding, Some(&queued_path), None)
            .map_err(|e| e.to_string())?;
        item.file_path = queued_path;

        self.ctx
            .faults
            .apply_faults("forward")
            .map_err(|e| e.to_string())?;
        thread::sleep(POST_FAULT_PAUSE);

        let destination = self.dispatch(item)?;

        let sent_path = self.move_artifact(item, "sent")?;
        self.ctx
            .store
            .update_state(item.id, ItemState::Sent, Some(&sent_path), None)
            .map_err(|e| e.to_string())?;
        item.file_path = sent_path;
        Ok(destination)
    }

    fn dispatch(&self, item: &QueueItem) -> Result<String, String> {
        let mode = self.ctx.config.forwarder.mode;
        if matches!(mode, ForwarderMode::Dummy) {
            return Ok("dummy".to_string());
        }

        let dataset = fs::read(&item.file_path)
            .map_err(|e| ForwardError::new(ForwardErrorKind::CStoreError(e.to_string())).to_string())?;

        match mode {
            ForwarderMode::Dummy => Ok("dummy".to_string()),
            ForwarderMode::Archive => {
                self.ctx
                    .outbound
                    .send_to_archive(&dataset)
                    .map_err(|e| e.to_string())?;
                Ok("archive".to_string())
            }
            ForwarderMode::Workers => {
                self.ctx
                    .outbound
                    .send_to_worker(&self.ctx.store, item.id, &dataset)
                    .map_err(|e| e.to_string())?;
                Ok("workers".to_string())
            }
            ForwarderMode::Gateway => {
                let header = dicom::read_file(&dataset, true).map_err(|e| {
                    ForwardError::new(ForwardErrorKind::CStoreError(e.to_string())).to_string()
                })?;
                match determine_route(&header) {
                    Route::Worker => {
                        self.ctx
                            .outbound
                            .send_to_worker(&self.ctx.store, item.id, &dataset)
                            .map_err(|e| e.to_string())?;
                        Ok("worker".to_string())
                    }
                    Route::Archive => {
                        self.ctx
                            .outbound
                            .send_to_archive(&dataset)
                            .map_err(|e| e.to_string())?;
                        Ok("archive".to_string())
                    }
                }
            }
            // Parallel forwards inline on the receive path; a claimed item in
            // this mode needs no network action here.
            ForwarderMode::Parallel => Ok("parallel".to_string()),
        }
    }

    fn move_artifact(&self, item: &QueueItem, bucket: &str) -> Result<PathBuf, String> {
        let dest_dir = self
            .ctx
            .config
            .edge
            .data_root
            .join(bucket)
            .join(&item.study_uid);
        let dest_path = dest_dir.join(format!("{}.dcm", item.sop_uid));
        self.ctx
            .faults
            .simulate_disk_full(&dest_path)
            .map_err(|e| e.to_string())?;
        fs::create_dir_all(&dest_dir).map_err(|e| e.to_string())?;
        fs::rename(&item.file_path, &dest_path).map_err(|e| e.to_string())?;
        Ok(dest_path)
    }

    fn handle_failure(&self, item: &QueueItem, error: &str) {
        self.log_forward(
            item,
            "failed",
            Some(error),
            self.ctx.config.forwarder.mode.as_str(),
        );

        let new_retries = match self.ctx.store.increment_retry(item.id, error) {
            Ok(count) => count,
            Err(_) => return,
        };

        if new_retries >= self.ctx.config.forwarder.max_retries {
            match self.move_artifact(item, "failed") {
                Ok(failed_path) => {
                    let _ = self.ctx.store.update_state(
                        item.id,
                        ItemState::Failed,
                        Some(&failed_path),
                        Some(error),
                    );
                }
                Err(move_error) => {
                    // The artifact stays at its last known path.
                    let _ = self.ctx.store.update_state(
                        item.id,
                        ItemState::Failed,
                        None,
                        Some(&format!("{error};move_failed:{move_error}")),
                    );
                }
            }
            return;
        }

        let _ = self
            .ctx
            .store
            .update_state(item.id, ItemState::Queued, None, Some(error));
        self.ctx.log.log(
            Level::Warning,
            "forward",
            &[
                ("study_uid", json!(item.study_uid)),
                ("sop_uid", json!(item.sop_uid)),
                ("ae_title", json!(self.ctx.config.edge.ae_title)),
                ("remote_ip", serde_json::Value::Null),
                ("outcome", json!("retry")),
                ("error", json!(error)),
            ],
        );
        let backoff = self
            .ctx
            .config
            .forwarder
            .backoff_base_seconds
            .saturating_mul(2u64.saturating_pow(new_retries.saturating_sub(1)));
        thread::sleep(Duration::from_secs(backoff));
    }

    fn log_forward(&self, item: &QueueItem, result: &str, error: Option<&str>, destination: &str) {
        let level = if result == "sent" {
            Level::Info
        } else {
            Level::Error
        };
        self.ctx.log.log(
            level,
            "forward",
            &[
                ("study_uid", json!(item.study_uid)),
                ("sop_uid", json!(item.sop_uid)),
                ("destination", json!(destination)),
                ("result", json!(result)),
                ("error", or_null(error)),
            ],
        );
    }
}
