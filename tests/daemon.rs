use std::path::Path;
use std::time::Duration;

use compliance_rag::client::DaemonClient;
use compliance_rag::error::DaemonError;
use compliance_rag::models::{AnswerPath, Config, Persona};
use compliance_rag::server::DaemonServer;
use compliance_rag::services::{AskRequest, ComplianceService};

fn config_in(dir: &Path) -> Config {
    let mut config = Config::default();
    config.index.path = Some(dir.join("index"));
    config.history.path = Some(dir.join("history.db"));
    config.metrics.path = Some(dir.join("metrics.db"));
    config.followups.catalog_path = Some(dir.join("followups.json"));
    config.daemon.socket_path = Some(dir.join("crag.sock"));
    config.daemon.auto_start = false;
    config.embedding.dimension = 64;
    config.generation.providers.clear();
    config
}

async fn wait_until_up(client: &DaemonClient) {
    for _ in 0..100 {
        if client.is_running() && client.ping().await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("daemon did not come up");
}

#[tokio::test]
async fn test_daemon_serves_requests_until_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let kb = dir.path().join("kb.json");
    std::fs::write(
        &kb,
        r#"[{"id":"KB-007","title":"Breach notification","content":"Notify the supervisory authority within 72 hours.","follow_up_questions":["Who must be notified?"]}]"#,
    )
    .unwrap();

    let service = ComplianceService::from_config(&config).unwrap();
    let server = DaemonServer::with_service(config.clone(), service);
    let handle = tokio::spawn(async move { server.run().await });

    let client = DaemonClient::new(&config);
    wait_until_up(&client).await;
    assert!(config.pid_path().exists());

    let report = client.import(kb).await.unwrap();
    assert_eq!(report.entries, 1);
    assert_eq!(report.chunks_added, 1);

    let answer = client
        .ask(AskRequest {
            persona: Some(Persona::Concise),
            ..AskRequest::new("when do we notify the authority of a breach?")
        })
        .await
        .unwrap();
    assert_eq!(answer.path, Some(AnswerPath::FastPath));
    assert_eq!(
        answer.data.response,
        "Notify the supervisory authority within 72 hours."
    );
    assert_eq!(answer.data.follow_up_questions, vec!["Who must be notified?"]);

    let turns = client.history(answer.session_id.clone(), None).await.unwrap();
    assert_eq!(turns.len(), 2);

    let sessions = client.sessions(None, 10).await.unwrap();
    assert_eq!(sessions[0].session_id, answer.session_id);

    let results = client.search("breach".to_string(), Some(3)).await.unwrap();
    assert_eq!(results.len(), 1);

    let status = client.status().await.unwrap();
    assert!(status.running);
    assert_eq!(status.service.index.kb_entries, 1);
    assert!(status.service.providers.is_empty());
    let metrics = status.metrics.unwrap();
    assert_eq!(metrics.total_queries, 1);
    assert_eq!(metrics.by_path.get("fast_path"), Some(&1));

    client.shutdown().await.unwrap();
    handle.await.unwrap().unwrap();
    assert!(!config.socket_path().exists());
    assert!(!config.pid_path().exists());
}

#[tokio::test]
async fn test_daemon_rejects_empty_question() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let service = ComplianceService::from_config(&config).unwrap();
    let server = DaemonServer::with_service(config.clone(), service);
    let handle = tokio::spawn(async move { server.run().await });

    let client = DaemonClient::new(&config);
    wait_until_up(&client).await;

    let err = client.ask(AskRequest::new("   ")).await.unwrap_err();
    assert!(matches!(err, DaemonError::Remote(ref m) if m.contains("empty")));

    let err = client
        .import(dir.path().join("missing.jsonl"))
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::Remote(_)));

    client.shutdown().await.unwrap();
    handle.await.unwrap().unwrap();
}
