use pacs_edge::dicom::{self, tags, uids, Vr};
use pacs_edge::dimse::{
    associate, DimseHandlers, DimseServer, InboundStore, STATUS_REFUSED, STATUS_SUCCESS,
};
use pacs_edge::server::build_gateway;
use pacs_edge::store::{AiStatus, ItemState, QueueStore};
use serde_json::Value;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

struct StubScp {
    status: u16,
    stores: Mutex<Vec<InboundStore>>,
}

impl StubScp {
    fn new(status: u16) -> Arc<StubScp> {
        Arc::new(StubScp {
            status,
            stores: Mutex::new(Vec::new()),
        })
    }

    fn received(&self) -> usize {
        self.stores.lock().expect("lock").len()
    }
}

impl DimseHandlers for StubScp {
    fn on_c_store(&self, request: InboundStore) -> u16 {
        self.stores.lock().expect("lock").push(request);
        self.status
    }

    fn on_c_echo(&self, _calling_ae_title: &str) -> u16 {
        STATUS_SUCCESS
    }
}

fn all_contexts() -> Vec<String> {
    vec![
        uids::CT_IMAGE_STORAGE.to_string(),
        uids::MR_IMAGE_STORAGE.to_string(),
        uids::SECONDARY_CAPTURE_IMAGE_STORAGE.to_string(),
    ]
}

fn spawn_scp(ae_title: &str, contexts: Vec<String>, stub: Arc<StubScp>) -> SocketAddr {
    let server = DimseServer::bind("127.0.0.1", 0, ae_title, contexts, stub).expect("bind stub");
    let (addr, _handle) = server.spawn().expect("spawn stub");
    addr
}

fn write_parallel_config(root: &Path, archive_port: u16, worker_port: u16) -> PathBuf {
    let path = root.join("config.yaml");
    fs::write(
        &path,
        format!(
            r#"
edge:
  ae_title: MINI_EDGE
  port: 0
  data_root: {root}/data
  log_path: {root}/logs/edge.log
  store_path: {root}/state/edge.db
forwarder:
  mode: parallel
  max_retries: 3
  backoff_base_seconds: 1
  poll_interval_seconds: 1
  archive:
    host: 127.0.0.1
    port: {archive_port}
    ae_title: ARCHIVE
  workers:
    - host: 127.0.0.1
      port: {worker_port}
      ae_title: WORKER
fault_injection:
  reject_all: false
"#,
            root = root.display()
        ),
    )
    .expect("write config");
    path
}

fn spawn_gateway(config_path: &Path) -> SocketAddr {
    let gateway = build_gateway(config_path).expect("build gateway");
    let (addr, _handle) = gateway.spawn().expect("spawn gateway");
    addr
}

fn send_object(addr: SocketAddr, calling_aet: &str, object: &dicom::DicomObject) -> Option<u16> {
    let mut association = associate(
        "127.0.0.1",
        addr.port(),
        calling_aet,
        "MINI_EDGE",
        &all_contexts(),
        TIMEOUT,
    )
    .expect("associate");
    let status = association
        .c_store(
            &object.sop_class_uid().unwrap_or_default(),
            &object.sop_instance_uid().unwrap_or_default(),
            &dicom::write_file(object),
        )
        .expect("c-store exchange");
    association.release().expect("release");
    status
}

fn ct_object(study: &str, sop: &str) -> dicom::DicomObject {
    dicom::synthetic_image(uids::CT_IMAGE_STORAGE, study, "1.9.1", sop, "CT")
}

fn ai_result_object(study: &str, sop: &str) -> dicom::DicomObject {
    let mut object = dicom::synthetic_image(
        uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
        study,
        "1.9.2",
        sop,
        "OT",
    );
    object.set_str(tags::SERIES_DESCRIPTION, Vr::LO, "AI_RESULT");
    object
}

fn wait_until(what: &str, timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("timed out waiting for {what}");
}

fn log_events(root: &Path) -> Vec<Value> {
    let raw = fs::read_to_string(root.join("logs/edge.log")).unwrap_or_default();
    raw.lines()
        .map(|line| serde_json::from_str(line).expect("parse log line"))
        .collect()
}

#[test]
fn dual_send_then_result_correlation_end_to_end() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let archive_stub = StubScp::new(STATUS_SUCCESS);
    let worker_stub = StubScp::new(STATUS_SUCCESS);
    let archive = spawn_scp("ARCHIVE", all_contexts(), Arc::clone(&archive_stub));
    let worker = spawn_scp("WORKER", all_contexts(), Arc::clone(&worker_stub));

    let config_path = write_parallel_config(tmp.path(), archive.port(), worker.port());
    let addr = spawn_gateway(&config_path);

    assert_eq!(
        send_object(addr, "SENDER", &ct_object("1.2.3", "1.2.3.4")),
        Some(STATUS_SUCCESS)
    );

    // the archive send is synchronous, the worker send catches up shortly
    assert_eq!(archive_stub.received(), 1);
    wait_until("worker to receive the original", Duration::from_secs(10), || {
        worker_stub.received() == 1
    });

    let store = QueueStore::open(&tmp.path().join("state/edge.db")).expect("open store");
    let row = store.get_study_rows("1.2.3").expect("rows").remove(0);
    assert_eq!(row.state, ItemState::Sent);
    assert!(row.pacs_sent_at.is_some());
    assert_eq!(row.ai_status, Some(AiStatus::Pending));
    assert_eq!(row.worker_ae.as_deref(), Some("WORKER"));

    assert_eq!(
        send_object(addr, "WORKER", &ai_result_object("1.2.3", "1.2.3.77")),
        Some(STATUS_SUCCESS)
    );

    let row = store.get_study_rows("1.2.3").expect("rows").remove(0);
    assert_eq!(row.ai_status, Some(AiStatus::Delivered));
    assert!(row.result_received_at.is_some());
    // the result was forwarded to the archive, not enqueued
    assert_eq!(archive_stub.received(), 2);
    assert_eq!(store.get_study_rows("1.2.3").expect("rows").len(), 1);

    let events = log_events(tmp.path());
    let forwarded = events
        .iter()
        .find(|e| e["stage"] == "ai_result" && e["outcome"] == "forwarded")
        .expect("ai_result forwarded event");
    assert_eq!(forwarded["original_sop_uid"], "1.2.3.4");
    assert_eq!(forwarded["result_sop_uid"], "1.2.3.77");
    assert!(forwarded["duration_ms"].as_i64().expect("duration") >= 0);
    assert!(events
        .iter()
        .any(|e| e["stage"] == "forward_pacs" && e["outcome"] == "sent"));
    assert!(events
        .iter()
        .any(|e| e["stage"] == "forward_worker" && e["outcome"] == "sent"));
}

#[test]
fn archive_failure_is_terminal_but_still_answers_success() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let archive_stub = StubScp::new(STATUS_REFUSED);
    let worker_stub = StubScp::new(STATUS_SUCCESS);
    let archive = spawn_scp("ARCHIVE", all_contexts(), archive_stub);
    let worker = spawn_scp("WORKER", all_contexts(), Arc::clone(&worker_stub));

    let config_path = write_parallel_config(tmp.path(), archive.port(), worker.port());
    let addr = spawn_gateway(&config_path);

    assert_eq!(
        send_object(addr, "SENDER", &ct_object("2.2.2", "2.2.2.4")),
        Some(STATUS_SUCCESS)
    );

    let store = QueueStore::open(&tmp.path().join("state/edge.db")).expect("open store");
    let row = store.get_study_rows("2.2.2").expect("rows").remove(0);
    assert_eq!(row.state, ItemState::Failed);
    assert_eq!(row.last_error.as_deref(), Some("c_store_failure:42752"));
    assert!(row.pacs_sent_at.is_none());

    let events = log_events(tmp.path());
    let failed = events
        .iter()
        .find(|e| e["stage"] == "forward_pacs" && e["outcome"] == "failed")
        .expect("forward_pacs failed event");
    assert_eq!(failed["error"], "c_store_failure:42752");
}

#[test]
fn unreachable_worker_marks_the_ai_status() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let archive_stub = StubScp::new(STATUS_SUCCESS);
    let archive = spawn_scp("ARCHIVE", all_contexts(), archive_stub);
    // worker accepts associations but refuses every context
    let worker_stub = StubScp::new(STATUS_SUCCESS);
    let worker = spawn_scp("WORKER", Vec::new(), worker_stub);

    let config_path = write_parallel_config(tmp.path(), archive.port(), worker.port());
    let addr = spawn_gateway(&config_path);

    assert_eq!(
        send_object(addr, "SENDER", &ct_object("3.3.3", "3.3.3.4")),
        Some(STATUS_SUCCESS)
    );

    let store = QueueStore::open(&tmp.path().join("state/edge.db")).expect("open store");
    wait_until("worker failure to be recorded", Duration::from_secs(10), || {
        store
            .get_study_rows("3.3.3")
            .expect("rows")
            .first()
            .map(|row| row.ai_status == Some(AiStatus::Failed))
            .unwrap_or(false)
    });

    let row = store.get_study_rows("3.3.3").expect("rows").remove(0);
    assert_eq!(row.last_error.as_deref(), Some("worker_association_refused"));
    // the archive leg was unaffected
    assert_eq!(row.state, ItemState::Sent);

    let events = log_events(tmp.path());
    let failed = events
        .iter()
        .find(|e| e["stage"] == "forward_worker" && e["outcome"] == "failed")
        .expect("forward_worker failed event");
    assert_eq!(failed["error"], "worker_association_refused");
}

#[test]
fn result_without_a_pending_original_is_unmatched() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let archive_stub = StubScp::new(STATUS_SUCCESS);
    let worker_stub = StubScp::new(STATUS_SUCCESS);
    let archive = spawn_scp("ARCHIVE", all_contexts(), Arc::clone(&archive_stub));
    let worker = spawn_scp("WORKER", all_contexts(), worker_stub);

    let config_path = write_parallel_config(tmp.path(), archive.port(), worker.port());
    let addr = spawn_gateway(&config_path);

    assert_eq!(
        send_object(addr, "WORKER", &ai_result_object("9.9.9", "9.9.9.1")),
        Some(STATUS_SUCCESS)
    );

    // still forwarded to the archive, still no record
    assert_eq!(archive_stub.received(), 1);
    let store = QueueStore::open(&tmp.path().join("state/edge.db")).expect("open store");
    assert!(store.get_study_rows("9.9.9").expect("rows").is_empty());

    let events = log_events(tmp.path());
    let unmatched = events
        .iter()
        .find(|e| e["stage"] == "ai_result" && e["outcome"] == "unmatched")
        .expect("unmatched event");
    assert_eq!(unmatched["error"], "no_original_found");
    let forwarded = events
        .iter()
        .find(|e| e["stage"] == "ai_result" && e["outcome"] == "forwarded")
        .expect("forwarded event");
    assert!(forwarded["original_sop_uid"].is_null());
    assert!(forwarded["duration_ms"].is_null());
}
