use pacs_edge::dicom::{self, tags, uids, Vr};
use pacs_edge::dimse::{self, DimseHandlers, DimseServer, InboundStore, STATUS_REFUSED, STATUS_SUCCESS};
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct WorkerEnv {
    gateway_host: String,
    gateway_port: u16,
    gateway_ae_title: String,
    worker_ae_title: String,
    worker_port: u16,
    delay: Duration,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl WorkerEnv {
    fn load() -> Result<WorkerEnv, String> {
        let gateway_port = env_or("GATEWAY_PORT", "11112")
            .parse()
            .map_err(|e| format!("invalid GATEWAY_PORT: {e}"))?;
        let worker_port = env_or("WORKER_PORT", "11113")
            .parse()
            .map_err(|e| format!("invalid WORKER_PORT: {e}"))?;
        let delay_seconds: f64 = env_or("WORKER_DELAY_SECONDS", "0")
            .parse()
            .map_err(|e| format!("invalid WORKER_DELAY_SECONDS: {e}"))?;
        Ok(WorkerEnv {
            gateway_host: env_or("GATEWAY_HOST", "edge"),
            gateway_port,
            gateway_ae_title: env_or("GATEWAY_AE_TITLE", "MINI_EDGE"),
            worker_ae_title: env_or("WORKER_AE_TITLE", "WORKER"),
            worker_port,
            delay: Duration::from_secs_f64(delay_seconds.max(0.0)),
        })
    }
}

/// Derive a Secondary-Capture result object for the same study as the input.
fn build_result(input: &dicom::DicomObject) -> dicom::DicomObject {
    let study_uid = input
        .study_instance_uid()
        .filter(|uid| !uid.is_empty())
        .unwrap_or_else(dicom::generate_uid);
    let mut result = dicom::synthetic_image(
        uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
        &study_uid,
        &dicom::generate_uid(),
        &dicom::generate_uid(),
        "OT",
    );
    result.set_str(tags::SERIES_DESCRIPTION, Vr::LO, "AI_RESULT");
    if let Some(patient_name) = input.patient_name() {
        result.set_str(tags::PATIENT_NAME, Vr::PN, &patient_name);
    }
    if let Some(patient_id) = input.patient_id() {
        result.set_str(tags::PATIENT_ID, Vr::LO, &patient_id);
    }
    result
}

fn send_result(env: &WorkerEnv, result: &dicom::DicomObject) -> Result<(), String> {
    let contexts = vec![uids::SECONDARY_CAPTURE_IMAGE_STORAGE.to_string()];
    let mut association = dimse::associate(
        &env.gateway_host,
        env.gateway_port,
        &env.worker_ae_title,
        &env.gateway_ae_title,
        &contexts,
        Duration::from_secs(10),
    )
    .map_err(|e| format!("gateway_association_refused:{e}"))?;

    let sop_uid = result.sop_instance_uid().unwrap_or_default();
    let bytes = dicom::write_file(result);
    let status = association
        .c_store(uids::SECONDARY_CAPTURE_IMAGE_STORAGE, &sop_uid, &bytes)
        .map_err(|e| format!("gateway_c_store_failed:{e}"))?;
    let _ = association.release();
    match status {
        Some(STATUS_SUCCESS) => Ok(()),
        other => Err(format!("gateway_c_store_failed:{other:?}")),
    }
}

struct WorkerHandlers {
    env: WorkerEnv,
}

impl DimseHandlers for WorkerHandlers {
    fn on_c_store(&self, request: InboundStore) -> u16 {
        let Ok(input) = dicom::read_file(&request.dataset, false) else {
            eprintln!("worker: undecodable dataset");
            return STATUS_REFUSED;
        };
        if !self.env.delay.is_zero() {
            thread::sleep(self.env.delay);
        }
        let result = build_result(&input);
        match send_result(&self.env, &result) {
            Ok(()) => STATUS_SUCCESS,
            Err(err) => {
                eprintln!("worker: failed to send result: {err}");
                STATUS_REFUSED
            }
        }
    }

    fn on_c_echo(&self, _calling_ae_title: &str) -> u16 {
        STATUS_SUCCESS
    }
}

fn run() -> Result<(), String> {
    let env = WorkerEnv::load()?;
    let worker_ae_title = env.worker_ae_title.clone();
    let worker_port = env.worker_port;
    let server = DimseServer::bind(
        "0.0.0.0",
        worker_port,
        &worker_ae_title,
        vec![
            uids::CT_IMAGE_STORAGE.to_string(),
            uids::MR_IMAGE_STORAGE.to_string(),
        ],
        Arc::new(WorkerHandlers { env }),
    )
    .map_err(|e| format!("bind failed: {e}"))?;
    println!("worker: listening on 0.0.0.0:{worker_port} AET={worker_ae_title}");
    server.run().map_err(|e| format!("serve failed: {e}"))
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        process::exit(1);
    }
}
