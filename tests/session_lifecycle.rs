mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use farmhand::client::{ClientError, NodeClient, SYNC_CHUNK_SIZE};
use farmhand::config::Config;
use farmhand::node::Node;
use farmhand::protocol::Compression;
use tokio_util::sync::CancellationToken;

use support::{MockConnector, MockNode};

fn test_config() -> Config {
    Config {
        recover_interval: Duration::from_millis(10),
        ..Config::default()
    }
}

fn client_for(connector: &Arc<MockConnector>, node: Node) -> NodeClient {
    NodeClient::new(node, connector.clone(), test_config())
}

#[tokio::test]
async fn handshake_caches_computer_info() {
    let server = Arc::new(MockNode::default());
    let connector = MockConnector::up(server);
    let client = client_for(&connector, Node::new("left", "10.0.0.2:15000"));

    client.connect().await.unwrap();
    let node = client.node();
    assert!(node.connected());
    assert_eq!(node.computer_name(), "mock-node");
    assert_eq!(node.os(), "linux");
    assert_eq!(node.cores(), 16);
    assert_eq!(node.exception(), "");
}

#[tokio::test]
async fn connect_when_connected_is_a_no_op() {
    let server = Arc::new(MockNode::default());
    let connector = MockConnector::up(server);
    let client = client_for(&connector, Node::new("left", "10.0.0.2:15000"));

    client.connect().await.unwrap();
    client.connect().await.unwrap();
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test]
async fn protocol_mismatch_rejects_the_node() {
    let server = Arc::new(MockNode {
        protocol_version: 99,
        ..MockNode::default()
    });
    let connector = MockConnector::up(server);
    let client = client_for(&connector, Node::new("left", "10.0.0.2:15000"));

    let err = client.connect().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::OutdatedProtocol { server: 99, .. }
    ));
    assert!(!client.node().connected());
    assert!(!client.node().exception().is_empty());
}

#[tokio::test]
async fn wrong_password_fails_auth_and_closes() {
    let server = Arc::new(MockNode {
        require_auth: true,
        pass: "hunter2".into(),
        ..MockNode::default()
    });
    let connector = MockConnector::up(server);
    // node configured with no password at all
    let client = client_for(&connector, Node::new("left", "10.0.0.2:15000"));

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::AuthFailed));
    assert!(!client.node().connected());
}

#[tokio::test]
async fn correct_password_authenticates() {
    let server = Arc::new(MockNode {
        require_auth: true,
        pass: "hunter2".into(),
        ..MockNode::default()
    });
    let connector = MockConnector::up(server);
    let client = client_for(
        &connector,
        Node::new("left", "10.0.0.2:15000").with_pass("hunter2"),
    );

    client.connect().await.unwrap();
    assert!(client.node().connected());
}

#[tokio::test]
async fn prepare_records_the_version() {
    let server = Arc::new(MockNode::default());
    let connector = MockConnector::up(server);
    let client = client_for(&connector, Node::new("left", "10.0.0.2:15000"));

    client.connect().await.unwrap();
    client.prepare("3.6.0").await.unwrap();
    assert!(client.node().available_versions().contains("3.6.0"));
    assert!(client.node().is_prepared());
    assert!(client.node().is_idle());
}

#[tokio::test]
async fn version_probe_only_records_hits() {
    let server = Arc::new(MockNode::default());
    let connector = MockConnector::up(server);
    let client = client_for(&connector, Node::new("left", "10.0.0.2:15000"));

    client.connect().await.unwrap();
    assert!(client.is_version_available("3.6.0").await.unwrap());
    assert!(!client.is_version_available("4.0.0").await.unwrap());
    let versions = client.node().available_versions();
    assert!(versions.contains("3.6.0"));
    assert!(!versions.contains("4.0.0"));
}

#[tokio::test]
async fn small_file_syncs_in_one_chunk_and_verifies() {
    let server = Arc::new(MockNode::default());
    let connector = MockConnector::up(server.clone());
    let client = client_for(&connector, Node::new("left", "10.0.0.2:15000"));
    client.connect().await.unwrap();
    client.node().select_session("s1");

    let payload = vec![42u8; 1024 * 1024];
    client
        .sync_file("s1", 42, payload.as_slice(), payload.len() as u64, Compression::None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(server.upload_chunks.load(Ordering::SeqCst), 1);
    assert!(client.node().is_session_synced("s1"));
    assert!(client.node().is_synced());
    assert_eq!(client.node().last_file_id(), 42);
    assert!(client.node().is_idle());
}

#[tokio::test]
async fn repeated_sync_takes_the_same_file_branch() {
    let server = Arc::new(MockNode::default());
    let connector = MockConnector::up(server.clone());
    let client = client_for(&connector, Node::new("left", "10.0.0.2:15000"));
    client.connect().await.unwrap();

    let payload = vec![42u8; 64 * 1024];
    client
        .sync_file("s1", 42, payload.as_slice(), payload.len() as u64, Compression::None, &CancellationToken::new())
        .await
        .unwrap();
    let chunks_before = server.upload_chunks.load(Ordering::SeqCst);

    client
        .sync_file("s1", 42, payload.as_slice(), payload.len() as u64, Compression::None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(server.upload_chunks.load(Ordering::SeqCst), chunks_before);
    assert!(client.node().is_session_synced("s1"));
}

#[tokio::test]
async fn oversized_file_splits_at_the_chunk_boundary() {
    let server = Arc::new(MockNode::default());
    let connector = MockConnector::up(server.clone());
    let client = client_for(&connector, Node::new("left", "10.0.0.2:15000"));
    client.connect().await.unwrap();

    let payload = vec![7u8; SYNC_CHUNK_SIZE + 1];
    client
        .sync_file("s1", 1, payload.as_slice(), payload.len() as u64, Compression::None, &CancellationToken::new())
        .await
        .unwrap();

    let sizes = server.chunk_sizes.lock().unwrap().clone();
    assert_eq!(sizes, vec![SYNC_CHUNK_SIZE, 1]);
}

#[tokio::test]
async fn rejected_sync_surfaces_the_message_and_resets_activity() {
    let server = Arc::new(MockNode::default());
    server.reject_sync.store(true, Ordering::SeqCst);
    let connector = MockConnector::up(server);
    let client = client_for(&connector, Node::new("left", "10.0.0.2:15000"));
    client.connect().await.unwrap();

    let payload = vec![0u8; 1024];
    let err = client
        .sync_file("s1", 1, payload.as_slice(), payload.len() as u64, Compression::None, &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        ClientError::SyncFailed(message) => assert_eq!(message, "disk full"),
        other => panic!("expected SyncFailed, got {other:?}"),
    }
    assert!(!client.node().is_session_synced("s1"));
    assert!(client.node().is_idle());
}

#[tokio::test]
async fn network_path_sync_verifies_like_an_upload() {
    let server = Arc::new(MockNode::default());
    let connector = MockConnector::up(server.clone());
    let client = client_for(&connector, Node::new("left", "10.0.0.2:15000"));
    client.connect().await.unwrap();

    client
        .sync_network_file(
            "s1",
            7,
            r"\\nas\render\barn.blend",
            "/mnt/nas/render/barn.blend",
            "/Volumes/nas/render/barn.blend",
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(server.upload_chunks.load(Ordering::SeqCst), 0);
    assert!(client.node().is_session_synced("s1"));
    assert_eq!(client.node().last_file_id(), 7);
}

#[tokio::test]
async fn check_sync_reflects_the_node_state() {
    let server = Arc::new(MockNode::default());
    let connector = MockConnector::up(server);
    let client = client_for(&connector, Node::new("left", "10.0.0.2:15000"));
    client.connect().await.unwrap();

    assert!(!client.check_sync("s1", 5).await.unwrap());
    assert!(!client.node().is_session_synced("s1"));

    let payload = vec![0u8; 256];
    client
        .sync_file("s1", 5, payload.as_slice(), payload.len() as u64, Compression::None, &CancellationToken::new())
        .await
        .unwrap();
    assert!(client.check_sync("s1", 5).await.unwrap());
}

#[tokio::test]
async fn orderly_disconnect_keeps_synced_flags() {
    let server = Arc::new(MockNode::default());
    let connector = MockConnector::up(server);
    let client = client_for(&connector, Node::new("left", "10.0.0.2:15000"));
    client.connect().await.unwrap();

    let payload = vec![0u8; 256];
    client
        .sync_file("s1", 5, payload.as_slice(), payload.len() as u64, Compression::None, &CancellationToken::new())
        .await
        .unwrap();
    assert!(client.node().is_session_synced("s1"));

    // The node still holds the file after a clean goodbye; only an observed
    // transport drop invalidates the flags.
    client.disconnect().await;
    assert!(!client.node().connected());
    assert!(client.node().is_session_synced("s1"));
}

#[tokio::test]
async fn operations_without_a_connection_fail_fast() {
    let server = Arc::new(MockNode::default());
    let connector = MockConnector::up(server);
    let client = client_for(&connector, Node::new("left", "10.0.0.2:15000"));

    let err = client.prepare("3.6.0").await.unwrap_err();
    assert!(matches!(err, ClientError::Disconnected));
    let err = client.is_busy().await.unwrap_err();
    assert!(matches!(err, ClientError::Disconnected));
}
