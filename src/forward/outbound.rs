use crate::config::Endpoint;
use crate::dicom;
use crate::dimse::{associate, AssocError};
use crate::logging::{or_null, EventLog, Level};
use crate::store::QueueStore;
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardErrorKind {
    Timeout,
    AssociationRefused,
    AssociationError(String),
    CStoreError(String),
    CStoreNoStatus,
    CStoreFailure(u16),
    WorkersUnconfigured,
}

/// Outbound-send failure. The rendered string is the retry diagnostic that
/// lands in `last_error` and the log stream; worker-side failures carry a
/// `worker_` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardError {
    pub kind: ForwardErrorKind,
    pub worker: bool,
}

impl ForwardError {
    pub fn new(kind: ForwardErrorKind) -> Self {
        Self {
            kind,
            worker: false,
        }
    }

    fn for_worker(kind: ForwardErrorKind) -> Self {
        Self { kind, worker: true }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ForwardErrorKind::Timeout)
    }
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.worker {
            f.write_str("worker_")?;
        }
        match &self.kind {
            ForwardErrorKind::Timeout => f.write_str("timeout"),
            ForwardErrorKind::AssociationRefused => f.write_str("association_refused"),
            ForwardErrorKind::AssociationError(message) => {
                write!(f, "association_error:{message}")
            }
            ForwardErrorKind::CStoreError(message) => write!(f, "c_store_error:{message}"),
            ForwardErrorKind::CStoreNoStatus => f.write_str("c_store_no_status"),
            ForwardErrorKind::CStoreFailure(code) => write!(f, "c_store_failure:{code}"),
            ForwardErrorKind::WorkersUnconfigured => f.write_str("workers_unconfigured"),
        }
    }
}

impl std::error::Error for ForwardError {}

fn association_phase_error(source: AssocError) -> ForwardErrorKind {
    match source {
        AssocError::Timeout => ForwardErrorKind::Timeout,
        AssocError::Rejected(_) => ForwardErrorKind::AssociationRefused,
        AssocError::Protocol(message) => ForwardErrorKind::AssociationError(message),
        AssocError::Io(source) => ForwardErrorKind::AssociationError(source.to_string()),
    }
}

fn exchange_phase_error(source: AssocError) -> ForwardErrorKind {
    match source {
        AssocError::Timeout => ForwardErrorKind::Timeout,
        other => ForwardErrorKind::CStoreError(other.to_string()),
    }
}

pub fn endpoint_json(endpoint: &Endpoint) -> serde_json::Value {
    json!({
        "host": endpoint.host,
        "port": endpoint.port,
        "ae_title": endpoint.ae_title,
    })
}

/// Initiator side of the gateway: sends staged objects to the archive or to
/// the next worker in rotation. Worker rotation is per-process round-robin
/// starting at the first configured worker; it does not survive restart.
pub struct Outbound {
    calling_ae_title: String,
    archive: Option<Endpoint>,
    workers: Vec<Endpoint>,
    next_worker: AtomicUsize,
    log: EventLog,
}

impl Outbound {
    pub fn new(
        calling_ae_title: String,
        archive: Option<Endpoint>,
        workers: Vec<Endpoint>,
        log: EventLog,
    ) -> Self {
        Self {
            calling_ae_title,
            archive,
            workers,
            next_worker: AtomicUsize::new(0),
            log,
        }
    }

    pub fn send_to_archive(&self, dataset: &[u8]) -> Result<(), ForwardError> {
        let endpoint = self
            .archive
            .clone()
            .ok_or_else(|| ForwardError::new(ForwardErrorKind::AssociationError(
                "archive_unconfigured".to_string(),
            )))?;
        self.send(&endpoint, false, dataset)?;
        Ok(())
    }

    /// Stamps the worker assignment on the record before the network send so
    /// a result arriving later can correlate even if this call fails.
    pub fn send_to_worker(
        &self,
        store: &QueueStore,
        item_id: i64,
        dataset: &[u8],
    ) -> Result<Endpoint, ForwardError> {
        if self.workers.is_empty() {
            return Err(ForwardError::new(ForwardErrorKind::WorkersUnconfigured));
        }
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let endpoint = self.workers[index].clone();

        store
            .mark_worker_sent(item_id, &endpoint.host, &endpoint.ae_title)
            .map_err(|e| {
                ForwardError::for_worker(ForwardErrorKind::CStoreError(e.to_string()))
            })?;

        let header = self.send(&endpoint, true, dataset)?;
        self.log.log(
            Level::Info,
            "worker",
            &[
                ("study_uid", or_null(header.study_instance_uid())),
                ("sop_uid", or_null(header.sop_instance_uid())),
                ("ae_title", json!(self.calling_ae_title)),
                ("worker", endpoint_json(&endpoint)),
                ("remote_ip", serde_json::Value::Null),
                ("outcome", json!("delivered")),
                ("error", serde_json::Value::Null),
            ],
        );
        Ok(endpoint)
    }

    fn send(
        &self,
        endpoint: &Endpoint,
        worker: bool,
        dataset: &[u8],
    ) -> Result<dicom::DicomObject, ForwardError> {
        let wrap = |kind: ForwardErrorKind| {
            if worker {
                ForwardError::for_worker(kind)
            } else {
                ForwardError::new(kind)
            }
        };

        let header = dicom::read_file(dataset, true)
            .map_err(|e| wrap(ForwardErrorKind::CStoreError(e.to_string())))?;
        let sop_class_uid = header.sop_class_uid().unwrap_or_default();
        let sop_instance_uid = header.sop_instance_uid().unwrap_or_default();

        let timeout = Duration::from_secs(endpoint.timeout_s);
        let contexts = vec![
            dicom::uids::CT_IMAGE_STORAGE.to_string(),
            dicom::uids::MR_IMAGE_STORAGE.to_string(),
            dicom::uids::SECONDARY_CAPTURE_IMAGE_STORAGE.to_string(),
        ];
        let mut association = associate(
            &endpoint.host,
            endpoint.port,
            &self.calling_ae_title,
            &endpoint.ae_title,
            &contexts,
            timeout,
        )
        .map_err(|e| wrap(association_phase_error(e)))?;

        let status = association
            .c_store(&sop_class_uid, &sop_instance_uid, dataset)
            .map_err(|e| wrap(exchange_phase_error(e)));
        let _ = association.release();
        let status = status?;

        match status {
            None => Err(wrap(ForwardErrorKind::CStoreNoStatus)),
            Some(0x0000) => Ok(header),
            Some(code) => Err(wrap(ForwardErrorKind::CStoreFailure(code))),
        }
    }
}
