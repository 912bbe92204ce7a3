use crate::config::{Config, ConfigError, ForwarderMode};
use crate::dicom::uids;
use crate::dimse::{DimseHandlers, DimseServer};
use crate::faults::FaultInjector;
use crate::forward::{Forwarder, Outbound};
use crate::ingest::GatewayHandlers;
use crate::logging::{EventLog, Level};
use crate::store::{QueueStore, StoreError, OPEN_RETRY_ATTEMPTS, OPEN_RETRY_DELAY};
use serde_json::json;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("durable store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("listener failed: {0}")]
    Listen(#[from] std::io::Error),
}

/// Process-wide state threaded through the receive path and the forwarder.
/// Everything here is a startup snapshot except the fault view, which
/// re-reads the config file on each check.
pub struct GatewayContext {
    pub config: Config,
    pub config_path: PathBuf,
    pub store: Arc<QueueStore>,
    pub log: EventLog,
    pub faults: FaultInjector,
    pub outbound: Arc<Outbound>,
}

/// A bound, not yet serving gateway. Admission order: config, directories,
/// store (bounded retry), outbound sender, forwarder, listener.
pub struct Gateway {
    server: DimseServer,
    ctx: Arc<GatewayContext>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").finish_non_exhaustive()
    }
}

pub fn build_gateway(config_path: &Path) -> Result<Gateway, GatewayError> {
    let config = Config::from_path(config_path)?;
    ensure_directories(&config)?;

    let log = EventLog::new(&config.edge.log_path);
    let store = open_store(&config, &log)?;
    let faults = FaultInjector::new(config_path);
    let outbound = Arc::new(Outbound::new(
        config.edge.ae_title.clone(),
        config.forwarder.archive.clone(),
        config.forwarder.workers.clone(),
        log.clone(),
    ));

    let ctx = Arc::new(GatewayContext {
        config,
        config_path: config_path.to_path_buf(),
        store: Arc::new(store),
        log,
        faults,
        outbound,
    });

    let handlers: Arc<dyn DimseHandlers> = Arc::new(GatewayHandlers::new(Arc::clone(&ctx)));
    let server = DimseServer::bind(
        "0.0.0.0",
        ctx.config.edge.port,
        &ctx.config.edge.ae_title,
        vec![
            uids::CT_IMAGE_STORAGE.to_string(),
            uids::MR_IMAGE_STORAGE.to_string(),
            uids::SECONDARY_CAPTURE_IMAGE_STORAGE.to_string(),
        ],
        handlers,
    )?;

    Ok(Gateway { server, ctx })
}

impl Gateway {
    pub fn context(&self) -> Arc<GatewayContext> {
        Arc::clone(&self.ctx)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Serve associations until the process exits. The forwarder thread is
    /// started here unless mode is `parallel`, where all forwarding happens
    /// inline on the receive path.
    pub fn run(self) -> std::io::Result<()> {
        self.start_forwarder();
        self.log_listening();
        self.server.run()
    }

    /// Background variant for tests and embedding.
    pub fn spawn(self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        self.start_forwarder();
        self.log_listening();
        self.server.spawn()
    }

    fn start_forwarder(&self) {
        if self.ctx.config.forwarder.mode == ForwarderMode::Parallel {
            return;
        }
        let forwarder = Forwarder::new(Arc::clone(&self.ctx));
        thread::spawn(move || forwarder.run_forever());
    }

    fn log_listening(&self) {
        self.ctx.log.log(
            Level::Info,
            "receive",
            &[
                ("study_uid", serde_json::Value::Null),
                ("sop_uid", serde_json::Value::Null),
                ("ae_title", json!(self.ctx.config.edge.ae_title)),
                ("remote_ip", serde_json::Value::Null),
                ("outcome", json!("listening")),
                ("error", serde_json::Value::Null),
            ],
        );
    }
}

/// Load config, bring the gateway up, and block serving associations.
pub fn start_gateway(config_path: &Path) -> Result<(), GatewayError> {
    let gateway = build_gateway(config_path)?;
    gateway.run()?;
    Ok(())
}

fn ensure_directories(config: &Config) -> Result<(), GatewayError> {
    let mut required = vec![
        config.edge.data_root.join("incoming"),
        config.edge.data_root.join("queued"),
        config.edge.data_root.join("sent"),
        config.edge.data_root.join("failed"),
    ];
    if let Some(parent) = config.edge.log_path.parent() {
        required.push(parent.to_path_buf());
    }
    if let Some(parent) = config.store_path().parent() {
        required.push(parent.to_path_buf());
    }
    for path in required {
        if path.as_os_str().is_empty() {
            continue;
        }
        fs::create_dir_all(&path).map_err(|source| GatewayError::CreateDir {
            path: path.display().to_string(),
            source,
        })?;
    }
    Ok(())
}

fn open_store(config: &Config, log: &EventLog) -> Result<QueueStore, GatewayError> {
    let path = config.store_path();
    match QueueStore::open_with_retry(&path, OPEN_RETRY_ATTEMPTS, OPEN_RETRY_DELAY) {
        Ok(store) => {
            log.log(
                Level::Info,
                "db",
                &[
                    ("study_uid", serde_json::Value::Null),
                    ("sop_uid", serde_json::Value::Null),
                    ("ae_title", json!(config.edge.ae_title)),
                    ("remote_ip", serde_json::Value::Null),
                    ("outcome", json!("connected")),
                    ("error", serde_json::Value::Null),
                ],
            );
            Ok(store)
        }
        Err(error) => {
            log.log(
                Level::Error,
                "db",
                &[
                    ("study_uid", serde_json::Value::Null),
                    ("sop_uid", serde_json::Value::Null),
                    ("ae_title", json!(config.edge.ae_title)),
                    ("remote_ip", serde_json::Value::Null),
                    ("outcome", json!("connection_failed")),
                    ("error", json!(error.to_string())),
                ],
            );
            Err(error.into())
        }
    }
}
