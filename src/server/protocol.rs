//! Daemon wire format: a 4-byte big-endian length followed by a JSON body.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::models::{ConversationTurn, QueryResponse, SearchResults, SessionSummary};
use crate::services::{AskRequest, ImportReport, IngestReport, MetricsSummary, ServiceStatus};

pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Shutdown,
    Status,
    Ask(AskRequest),
    Search(SearchRequest),
    Ingest(IngestRequest),
    Import(ImportRequest),
    History(HistoryRequest),
    Sessions(SessionsRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRequest {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,
    ShutdownAck,
    Status(StatusResponse),
    Answer(QueryResponse),
    Search(SearchResults),
    Ingest(IngestReport),
    Import(ImportReport),
    History(HistoryResponse),
    Sessions(SessionsResponse),
    Error(ErrorResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub running: bool,
    pub pid: u32,
    pub idle_secs: u64,
    pub requests_served: u64,
    pub service: ServiceStatus,
    pub metrics: Option<MetricsSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub turns: Vec<ConversationTurn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error(ErrorResponse {
            message: message.into(),
        })
    }
}

pub fn encode_message(msg: &impl Serialize) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = (json.len() as u32).to_be_bytes();
    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&len);
    buf.extend_from_slice(&json);
    Ok(buf)
}

pub fn decode_length(buf: &[u8; 4]) -> usize {
    u32::from_be_bytes(*buf) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let encoded = encode_message(&Request::Ping).unwrap();
        let len = decode_length(&[encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len, encoded.len() - 4);
        assert_eq!(&encoded[4..], br#"{"type":"ping"}"#);
    }

    #[test]
    fn test_ask_request_wire_shape() {
        let raw = r#"{"type":"ask","query":"Do we comply?","persona":"concise"}"#;
        let request: Request = serde_json::from_str(raw).unwrap();
        let Request::Ask(ask) = request else {
            panic!("expected ask request");
        };
        assert_eq!(ask.query, "Do we comply?");
        assert!(ask.session_id.is_none());
        assert_eq!(ask.persona, Some(crate::models::Persona::Concise));
    }

    #[test]
    fn test_error_response() {
        let json = serde_json::to_string(&Response::error("boom")).unwrap();
        assert_eq!(json, r#"{"type":"error","message":"boom"}"#);
    }
}
