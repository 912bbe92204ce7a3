use crate::config::ForwarderMode;
use crate::dicom;
use crate::dimse::{DimseHandlers, InboundStore, STATUS_REFUSED, STATUS_SUCCESS};
use crate::faults::FaultError;
use crate::logging::{or_null, Level};
use crate::server::GatewayContext;
use crate::store::{AiStatus, Correlation, ItemState};
use serde_json::{json, Value};
use std::fs;
use std::sync::Arc;
use std::thread;

pub const AI_RESULT_SERIES_DESCRIPTION: &str = "AI_RESULT";

/// Store/echo verbs of the gateway. Echo always succeeds; store runs the
/// receive path and never propagates a failure past the protocol status.
pub struct GatewayHandlers {
    ctx: Arc<GatewayContext>,
}

impl GatewayHandlers {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self { ctx }
    }
}

impl DimseHandlers for GatewayHandlers {
    fn on_c_store(&self, request: InboundStore) -> u16 {
        handle_store(&self.ctx, request)
    }

    fn on_c_echo(&self, _calling_ae_title: &str) -> u16 {
        STATUS_SUCCESS
    }
}

enum ReceiveError {
    /// Admission or fault rejection, before anything was persisted.
    Rejected(String),
    /// Failure after the object reached the staging area.
    Failed(String),
}

#[derive(Clone)]
struct AssocMeta {
    called_aet: String,
    calling_aet: String,
    remote_ip: Option<String>,
}

pub fn handle_store(ctx: &Arc<GatewayContext>, request: InboundStore) -> u16 {
    let object = dicom::read_file(&request.dataset, false).ok();
    let study_uid = object
        .as_ref()
        .and_then(|o| o.study_instance_uid())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let sop_uid = object
        .as_ref()
        .and_then(|o| o.sop_instance_uid())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let assoc = AssocMeta {
        called_aet: request.called_ae_title.clone(),
        calling_aet: request.calling_ae_title.clone(),
        remote_ip: request.remote_ip.clone(),
    };

    let allowed = &ctx.config.edge.allowed_calling_aets;
    if !allowed.is_empty() && !allowed.contains(&assoc.calling_aet) {
        log_assoc_event(
            ctx,
            Level::Error,
            "receive",
            &study_uid,
            &sop_uid,
            &assoc,
            "rejected",
            Some("calling_aet_not_allowed"),
        );
        return STATUS_REFUSED;
    }

    match receive_object(ctx, &request, object.as_ref(), &study_uid, &sop_uid, &assoc) {
        Ok(status) => status,
        Err(ReceiveError::Rejected(error)) => {
            log_assoc_event(
                ctx,
                Level::Error,
                "receive",
                &study_uid,
                &sop_uid,
                &assoc,
                "rejected",
                Some(&error),
            );
            STATUS_REFUSED
        }
        Err(ReceiveError::Failed(error)) => {
            log_assoc_event(
                ctx,
                Level::Error,
                "store",
                &study_uid,
                &sop_uid,
                &assoc,
                "failed",
                Some(&error),
            );
            STATUS_REFUSED
        }
    }
}

fn receive_object(
    ctx: &Arc<GatewayContext>,
    request: &InboundStore,
    object: Option<&dicom::DicomObject>,
    study_uid: &str,
    sop_uid: &str,
    assoc: &AssocMeta,
) -> Result<u16, ReceiveError> {
    ctx.faults.apply_faults("receive").map_err(|error| match error {
        FaultError::Reject | FaultError::Random { .. } => {
            ReceiveError::Rejected(error.to_string())
        }
        FaultError::DiskFull { .. } => ReceiveError::Failed(error.to_string()),
    })?;

    let dest_dir = ctx.config.edge.data_root.join("incoming").join(study_uid);
    let dest_path = dest_dir.join(format!("{sop_uid}.dcm"));
    ctx.faults
        .simulate_disk_full(&dest_path)
        .map_err(|error| ReceiveError::Failed(error.to_string()))?;
    fs::create_dir_all(&dest_dir).map_err(|error| ReceiveError::Failed(error.to_string()))?;
    fs::write(&dest_path, &request.dataset)
        .map_err(|error| ReceiveError::Failed(error.to_string()))?;

    let mode = ctx.config.forwarder.mode;
    let is_ai_result = object
        .and_then(|o| o.series_description())
        .map(|value| value.trim() == AI_RESULT_SERIES_DESCRIPTION)
        .unwrap_or(false);

    log_assoc_event(
        ctx,
        Level::Info,
        "receive",
        study_uid,
        sop_uid,
        assoc,
        "accepted",
        None,
    );
    log_assoc_event(
        ctx,
        Level::Info,
        "store",
        study_uid,
        sop_uid,
        assoc,
        "stored",
        None,
    );

    if mode == ForwarderMode::Parallel && is_ai_result {
        forward_parallel_ai_result(ctx, request, study_uid, sop_uid, assoc)?;
        return Ok(STATUS_SUCCESS);
    }

    let item_id = ctx
        .store
        .enqueue(study_uid, sop_uid, &dest_path)
        .map_err(|error| ReceiveError::Failed(error.to_string()))?;
    log_assoc_event(
        ctx,
        Level::Info,
        "queue",
        study_uid,
        sop_uid,
        assoc,
        "queued",
        None,
    );

    if mode == ForwarderMode::Parallel {
        forward_parallel_original(ctx, request, item_id, study_uid, sop_uid, assoc)?;
        return Ok(STATUS_SUCCESS);
    }

    if is_ai_result {
        correlate_result(ctx, study_uid, sop_uid, assoc)
            .map_err(ReceiveError::Failed)?;
    }
    Ok(STATUS_SUCCESS)
}

/// Parallel mode, result object: correlate, then push the result straight to
/// the archive. Result objects are never enqueued, and a failed archive send
/// still answers success to the worker.
fn forward_parallel_ai_result(
    ctx: &Arc<GatewayContext>,
    request: &InboundStore,
    study_uid: &str,
    sop_uid: &str,
    assoc: &AssocMeta,
) -> Result<(), ReceiveError> {
    let correlation = ctx
        .store
        .mark_result_received(study_uid, sop_uid)
        .map_err(|error| ReceiveError::Failed(error.to_string()))?;

    let (original_sop, worker, duration_ms) = correlation_fields(correlation.as_ref());
    let outcome = match ctx.outbound.send_to_archive(&request.dataset) {
        Ok(()) => ("forwarded", Level::Info, Value::Null),
        Err(error) => ("forward_failed", Level::Error, json!(error.to_string())),
    };
    ctx.log.log(
        outcome.1,
        "ai_result",
        &[
            ("study_uid", json!(study_uid)),
            ("original_sop_uid", original_sop.clone()),
            ("result_sop_uid", json!(sop_uid)),
            ("worker", worker.clone()),
            ("duration_ms", duration_ms.clone()),
            ("ae_title", json!(assoc.called_aet)),
            ("calling_aet", json!(assoc.calling_aet)),
            ("remote_ip", or_null(assoc.remote_ip.as_deref())),
            ("outcome", json!(outcome.0)),
            ("error", outcome.2),
        ],
    );

    if correlation.is_none() {
        ctx.log.log(
            Level::Warning,
            "ai_result",
            &[
                ("study_uid", json!(study_uid)),
                ("result_sop_uid", json!(sop_uid)),
                ("ae_title", json!(assoc.called_aet)),
                ("calling_aet", json!(assoc.calling_aet)),
                ("remote_ip", or_null(assoc.remote_ip.as_deref())),
                ("outcome", json!("unmatched")),
                ("error", json!("no_original_found")),
            ],
        );
    }
    Ok(())
}

/// Parallel mode, original object: synchronous archive send decides the
/// record's terminal state, then a fire-and-forget worker send is started.
/// The caller is answered success regardless of the worker outcome.
fn forward_parallel_original(
    ctx: &Arc<GatewayContext>,
    request: &InboundStore,
    item_id: i64,
    study_uid: &str,
    sop_uid: &str,
    assoc: &AssocMeta,
) -> Result<(), ReceiveError> {
    match ctx.outbound.send_to_archive(&request.dataset) {
        Ok(()) => {
            ctx.store
                .mark_pacs_sent(item_id)
                .and_then(|()| ctx.store.update_state(item_id, ItemState::Sent, None, None))
                .map_err(|error| ReceiveError::Failed(error.to_string()))?;
            log_assoc_event(
                ctx,
                Level::Info,
                "forward_pacs",
                study_uid,
                sop_uid,
                assoc,
                "sent",
                None,
            );
        }
        Err(error) => {
            let rendered = error.to_string();
            ctx.store
                .update_state(item_id, ItemState::Failed, None, Some(&rendered))
                .map_err(|error| ReceiveError::Failed(error.to_string()))?;
            log_assoc_event(
                ctx,
                Level::Error,
                "forward_pacs",
                study_uid,
                sop_uid,
                assoc,
                "failed",
                Some(&rendered),
            );
        }
    }

    let ctx = Arc::clone(ctx);
    let dataset = request.dataset.clone();
    let study_uid = study_uid.to_string();
    let sop_uid = sop_uid.to_string();
    let assoc = assoc.clone();
    thread::spawn(move || {
        send_worker_background(&ctx, item_id, &dataset, &study_uid, &sop_uid, &assoc);
    });
    Ok(())
}

fn send_worker_background(
    ctx: &Arc<GatewayContext>,
    item_id: i64,
    dataset: &[u8],
    study_uid: &str,
    sop_uid: &str,
    assoc: &AssocMeta,
) {
    match ctx.outbound.send_to_worker(&ctx.store, item_id, dataset) {
        Ok(endpoint) => {
            ctx.log.log(
                Level::Info,
                "forward_worker",
                &[
                    ("study_uid", json!(study_uid)),
                    ("sop_uid", json!(sop_uid)),
                    ("ae_title", json!(assoc.called_aet)),
                    ("calling_aet", json!(assoc.calling_aet)),
                    ("worker", crate::forward::endpoint_json(&endpoint)),
                    ("remote_ip", or_null(assoc.remote_ip.as_deref())),
                    ("outcome", json!("sent")),
                    ("error", Value::Null),
                ],
            );
        }
        Err(error) => {
            let rendered = error.to_string();
            let status = if error.is_timeout() {
                AiStatus::Timeout
            } else {
                AiStatus::Failed
            };
            let _ = ctx.store.mark_ai_status(item_id, status, Some(&rendered));
            ctx.log.log(
                Level::Error,
                "forward_worker",
                &[
                    ("study_uid", json!(study_uid)),
                    ("sop_uid", json!(sop_uid)),
                    ("ae_title", json!(assoc.called_aet)),
                    ("calling_aet", json!(assoc.calling_aet)),
                    ("remote_ip", or_null(assoc.remote_ip.as_deref())),
                    ("outcome", json!(status.as_str())),
                    ("error", json!(rendered)),
                ],
            );
        }
    }
}

/// Background-forwarding modes: a result object was already enqueued like any
/// other; correlation is recorded on top.
fn correlate_result(
    ctx: &Arc<GatewayContext>,
    study_uid: &str,
    sop_uid: &str,
    assoc: &AssocMeta,
) -> Result<(), String> {
    let correlation = ctx
        .store
        .mark_result_received(study_uid, sop_uid)
        .map_err(|error| error.to_string())?;
    match correlation {
        Some(correlation) => {
            let (original_sop, worker, duration_ms) = correlation_fields(Some(&correlation));
            ctx.log.log(
                Level::Info,
                "result",
                &[
                    ("study_uid", json!(study_uid)),
                    ("original_sop_uid", original_sop),
                    ("result_sop_uid", json!(sop_uid)),
                    ("worker", worker),
                    ("duration_ms", duration_ms),
                    ("ae_title", json!(assoc.called_aet)),
                    ("calling_aet", json!(assoc.calling_aet)),
                    ("remote_ip", or_null(assoc.remote_ip.as_deref())),
                    ("outcome", json!("correlated")),
                    ("error", Value::Null),
                ],
            );
        }
        None => {
            ctx.log.log(
                Level::Warning,
                "result",
                &[
                    ("study_uid", json!(study_uid)),
                    ("result_sop_uid", json!(sop_uid)),
                    ("ae_title", json!(assoc.called_aet)),
                    ("calling_aet", json!(assoc.calling_aet)),
                    ("remote_ip", or_null(assoc.remote_ip.as_deref())),
                    ("outcome", json!("unmatched")),
                    ("error", json!("no_original_found")),
                ],
            );
        }
    }
    Ok(())
}

fn correlation_fields(correlation: Option<&Correlation>) -> (Value, Value, Value) {
    match correlation {
        Some(correlation) => (
            json!(correlation.original_sop_uid),
            json!({
                "host": correlation.worker_host,
                "ae_title": correlation.worker_ae,
            }),
            json!(correlation.duration_ms),
        ),
        None => (Value::Null, Value::Null, Value::Null),
    }
}

#[allow(clippy::too_many_arguments)]
fn log_assoc_event(
    ctx: &Arc<GatewayContext>,
    level: Level,
    stage: &str,
    study_uid: &str,
    sop_uid: &str,
    assoc: &AssocMeta,
    outcome: &str,
    error: Option<&str>,
) {
    ctx.log.log(
        level,
        stage,
        &[
            ("study_uid", json!(study_uid)),
            ("sop_uid", json!(sop_uid)),
            ("ae_title", json!(assoc.called_aet)),
            ("calling_aet", json!(assoc.calling_aet)),
            ("remote_ip", or_null(assoc.remote_ip.as_deref())),
            ("outcome", json!(outcome)),
            ("error", or_null(error)),
        ],
    );
}
