pub mod embedding;
pub mod protocol;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Notify, RwLock};

use crate::error::AppError;
use crate::models::Config;
use crate::server::protocol::{
    HistoryResponse, MAX_MESSAGE_SIZE, Request, Response, SessionsResponse, StatusResponse,
    decode_length, encode_message,
};
use crate::services::{ComplianceService, MetricsStore};

/// State shared by every connection task.
struct DaemonState {
    config: Config,
    service: ComplianceService,
    metrics: Option<Mutex<MetricsStore>>,
    last_request: RwLock<Instant>,
    requests_served: AtomicU64,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

pub struct DaemonServer {
    socket_path: PathBuf,
    state: Arc<DaemonState>,
}

impl DaemonServer {
    pub fn new(config: Config) -> Result<Self, AppError> {
        let service = ComplianceService::from_config(&config)?;
        Ok(Self::with_service(config, service))
    }

    pub fn with_service(config: Config, service: ComplianceService) -> Self {
        let metrics = if config.metrics.enabled {
            match MetricsStore::open(&config.metrics_db_path()) {
                Ok(store) => {
                    store.cleanup(config.metrics.retention_days);
                    tracing::info!(
                        retention_days = config.metrics.retention_days,
                        "query metrics enabled"
                    );
                    Some(Mutex::new(store))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open metrics database");
                    None
                }
            }
        } else {
            None
        };

        Self {
            socket_path: config.socket_path(),
            state: Arc::new(DaemonState {
                config,
                service,
                metrics,
                last_request: RwLock::new(Instant::now()),
                requests_served: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
            }),
        }
    }

    pub async fn run(&self) -> Result<(), std::io::Error> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        self.write_pid_file()?;

        let idle_timeout = Duration::from_secs(self.state.config.daemon.idle_timeout_secs);
        let check_interval = Duration::from_secs(10);
        tracing::info!(
            socket = %self.socket_path.display(),
            idle_timeout_secs = idle_timeout.as_secs(),
            chunks = self.state.service.index().len(),
            "daemon listening"
        );

        #[cfg(unix)]
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        loop {
            #[cfg(unix)]
            let sigterm = terminate.recv();
            #[cfg(not(unix))]
            let sigterm = std::future::pending::<Option<()>>();

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            *self.state.last_request.write().await = Instant::now();
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                state.handle_connection(stream).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
                _ = self.state.shutdown_notify.notified() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(check_interval) => {
                    if self.state.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let last = *self.state.last_request.read().await;
                    if last.elapsed() > idle_timeout {
                        tracing::info!("idle timeout reached, shutting down");
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down");
                    break;
                }
                _ = sigterm => {
                    tracing::info!("received SIGTERM, shutting down");
                    break;
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    fn write_pid_file(&self) -> Result<(), std::io::Error> {
        std::fs::write(self.state.config.pid_path(), std::process::id().to_string())
    }

    fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(self.state.config.pid_path());
        tracing::info!("daemon stopped");
    }
}

impl DaemonState {
    async fn handle_connection(&self, mut stream: UnixStream) {
        let mut len_buf = [0u8; 4];

        while stream.read_exact(&mut len_buf).await.is_ok() {
            let len = decode_length(&len_buf);
            if len > MAX_MESSAGE_SIZE {
                tracing::warn!(len, "oversized request, closing connection");
                break;
            }

            let mut msg_buf = vec![0u8; len];
            if stream.read_exact(&mut msg_buf).await.is_err() {
                break;
            }

            let request: Request = match serde_json::from_slice(&msg_buf) {
                Ok(r) => r,
                Err(e) => {
                    let response = Response::error(format!("invalid request: {}", e));
                    if let Ok(encoded) = encode_message(&response) {
                        let _ = stream.write_all(&encoded).await;
                    }
                    continue;
                }
            };

            let response = self.handle_request(request).await;
            self.requests_served.fetch_add(1, Ordering::Relaxed);
            *self.last_request.write().await = Instant::now();

            match encode_message(&response) {
                Ok(encoded) => {
                    if stream.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode response");
                    break;
                }
            }

            if matches!(response, Response::ShutdownAck) {
                self.shutdown.store(true, Ordering::Relaxed);
                self.shutdown_notify.notify_one();
                break;
            }
        }
    }

    async fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::Shutdown => Response::ShutdownAck,

            Request::Status => {
                let last = *self.last_request.read().await;
                let metrics = self
                    .metrics
                    .as_ref()
                    .map(|m| m.lock().get_summary(self.config.metrics.retention_days));
                Response::Status(StatusResponse {
                    running: true,
                    pid: std::process::id(),
                    idle_secs: last.elapsed().as_secs(),
                    requests_served: self.requests_served.load(Ordering::Relaxed),
                    service: self.service.status(),
                    metrics,
                })
            }

            Request::Ask(ask) => {
                if ask.query.trim().is_empty() {
                    return Response::error("query cannot be empty");
                }
                let start = Instant::now();
                let answer = self.service.ask(ask).await;
                if let (Some(metrics), Some(path)) = (&self.metrics, answer.path) {
                    metrics
                        .lock()
                        .record(start.elapsed().as_millis() as u64, path);
                }
                Response::Answer(answer)
            }

            Request::Search(req) => match self.service.search(&req.query, req.limit).await {
                Ok(results) => Response::Search(results),
                Err(e) => Response::error(e.to_string()),
            },

            Request::Ingest(req) => {
                match self
                    .service
                    .ingest_paths(&req.paths, &req.exclude, |_| {})
                    .await
                {
                    Ok(report) => Response::Ingest(report),
                    Err(e) => Response::error(e.to_string()),
                }
            }

            Request::Import(req) => match self.service.import_entries(&req.path).await {
                Ok(report) => Response::Import(report),
                Err(e) => Response::error(e.to_string()),
            },

            Request::History(req) => {
                match self.service.history(&req.session_id, req.limit).await {
                    Ok(turns) => Response::History(HistoryResponse { turns }),
                    Err(e) => Response::error(e.to_string()),
                }
            }

            Request::Sessions(req) => {
                match self
                    .service
                    .sessions(req.user_id.as_deref(), req.limit)
                    .await
                {
                    Ok(sessions) => Response::Sessions(SessionsResponse { sessions }),
                    Err(e) => Response::error(e.to_string()),
                }
            }
        }
    }
}

pub async fn run_daemon(config: Config) -> Result<(), AppError> {
    let server = DaemonServer::new(config)?;
    server
        .run()
        .await
        .map_err(|e| AppError::Daemon(e.into()))?;
    Ok(())
}
