use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::DaemonError;
use crate::models::{Config, ConversationTurn, QueryResponse, SearchResults, SessionSummary};
use crate::server::protocol::{
    HistoryRequest, ImportRequest, IngestRequest, MAX_MESSAGE_SIZE, Request, Response,
    SearchRequest, SessionsRequest, StatusResponse, decode_length, encode_message,
};
use crate::services::{AskRequest, ImportReport, IngestReport};

pub struct DaemonClient {
    socket_path: PathBuf,
    auto_start: bool,
}

impl DaemonClient {
    pub fn new(config: &Config) -> Self {
        Self {
            socket_path: config.socket_path(),
            auto_start: config.daemon.auto_start,
        }
    }

    pub fn auto_start(&self) -> bool {
        self.auto_start
    }

    pub fn is_running(&self) -> bool {
        self.socket_path.exists()
            && std::os::unix::net::UnixStream::connect(&self.socket_path).is_ok()
    }

    pub async fn ensure_running(&self) -> Result<(), DaemonError> {
        if self.is_running() {
            return Ok(());
        }

        if !self.auto_start {
            return Err(DaemonError::NotRunning);
        }

        self.spawn_daemon()?;
        self.wait_for_ready().await
    }

    fn spawn_daemon(&self) -> Result<(), DaemonError> {
        let exe = std::env::current_exe().map_err(|e| DaemonError::SpawnError(e.to_string()))?;
        tracing::debug!(exe = %exe.display(), "starting daemon");

        Command::new(&exe)
            .args(["serve", "--daemon"])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::inherit())
            .spawn()
            .map_err(|e| DaemonError::SpawnError(e.to_string()))?;

        Ok(())
    }

    async fn wait_for_ready(&self) -> Result<(), DaemonError> {
        let max_wait = Duration::from_secs(60);
        let check_interval = Duration::from_millis(100);
        let start = std::time::Instant::now();

        while start.elapsed() < max_wait {
            if self.is_running() && self.ping().await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(check_interval).await;
        }

        Err(DaemonError::Timeout)
    }

    async fn connect(&self) -> Result<UnixStream, DaemonError> {
        UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| DaemonError::ConnectionFailed(e.to_string()))
    }

    async fn send_request(&self, request: Request) -> Result<Response, DaemonError> {
        let mut stream = self.connect().await?;

        let encoded =
            encode_message(&request).map_err(|e| DaemonError::ProtocolError(e.to_string()))?;

        stream
            .write_all(&encoded)
            .await
            .map_err(|e| DaemonError::SocketError(e.to_string()))?;

        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| DaemonError::SocketError(e.to_string()))?;

        let len = decode_length(&len_buf);
        if len > MAX_MESSAGE_SIZE {
            return Err(DaemonError::ProtocolError(format!(
                "response too large: {} bytes",
                len
            )));
        }
        let mut msg_buf = vec![0u8; len];

        stream
            .read_exact(&mut msg_buf)
            .await
            .map_err(|e| DaemonError::SocketError(e.to_string()))?;

        match serde_json::from_slice(&msg_buf) {
            Ok(Response::Error(e)) => Err(DaemonError::Remote(e.message)),
            Ok(response) => Ok(response),
            Err(e) => Err(DaemonError::ProtocolError(e.to_string())),
        }
    }

    /// Start the daemon if needed, then send.
    async fn call(&self, request: Request) -> Result<Response, DaemonError> {
        self.ensure_running().await?;
        self.send_request(request).await
    }

    pub async fn ping(&self) -> Result<(), DaemonError> {
        match self.send_request(Request::Ping).await? {
            Response::Pong => Ok(()),
            _ => Err(unexpected()),
        }
    }

    pub async fn status(&self) -> Result<StatusResponse, DaemonError> {
        match self.send_request(Request::Status).await? {
            Response::Status(s) => Ok(s),
            _ => Err(unexpected()),
        }
    }

    pub async fn shutdown(&self) -> Result<(), DaemonError> {
        match self.send_request(Request::Shutdown).await? {
            Response::ShutdownAck => Ok(()),
            _ => Err(unexpected()),
        }
    }

    pub async fn ask(&self, request: AskRequest) -> Result<QueryResponse, DaemonError> {
        match self.call(Request::Ask(request)).await? {
            Response::Answer(answer) => Ok(answer),
            _ => Err(unexpected()),
        }
    }

    pub async fn search(
        &self,
        query: String,
        limit: Option<usize>,
    ) -> Result<SearchResults, DaemonError> {
        match self.call(Request::Search(SearchRequest { query, limit })).await? {
            Response::Search(results) => Ok(results),
            _ => Err(unexpected()),
        }
    }

    pub async fn ingest(
        &self,
        paths: Vec<PathBuf>,
        exclude: Vec<String>,
    ) -> Result<IngestReport, DaemonError> {
        match self.call(Request::Ingest(IngestRequest { paths, exclude })).await? {
            Response::Ingest(report) => Ok(report),
            _ => Err(unexpected()),
        }
    }

    pub async fn import(&self, path: PathBuf) -> Result<ImportReport, DaemonError> {
        match self.call(Request::Import(ImportRequest { path })).await? {
            Response::Import(report) => Ok(report),
            _ => Err(unexpected()),
        }
    }

    pub async fn history(
        &self,
        session_id: String,
        limit: Option<usize>,
    ) -> Result<Vec<ConversationTurn>, DaemonError> {
        match self
            .call(Request::History(HistoryRequest { session_id, limit }))
            .await?
        {
            Response::History(h) => Ok(h.turns),
            _ => Err(unexpected()),
        }
    }

    pub async fn sessions(
        &self,
        user_id: Option<String>,
        limit: usize,
    ) -> Result<Vec<SessionSummary>, DaemonError> {
        match self
            .call(Request::Sessions(SessionsRequest { user_id, limit }))
            .await?
        {
            Response::Sessions(s) => Ok(s.sessions),
            _ => Err(unexpected()),
        }
    }
}

fn unexpected() -> DaemonError {
    DaemonError::ProtocolError("unexpected response".to_string())
}

pub fn stop_daemon(config: &Config) -> Result<(), DaemonError> {
    let pid_path = config.pid_path();
    if !pid_path.exists() {
        return Err(DaemonError::NotRunning);
    }

    let pid_str = std::fs::read_to_string(&pid_path)?;
    let pid: i32 = pid_str
        .trim()
        .parse()
        .map_err(|_| DaemonError::ProtocolError("invalid pid file".to_string()))?;

    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid), Signal::SIGTERM)
            .map_err(|e| DaemonError::SocketError(e.to_string()))?;
    }

    let _ = std::fs::remove_file(&pid_path);
    let _ = std::fs::remove_file(config.socket_path());

    Ok(())
}
