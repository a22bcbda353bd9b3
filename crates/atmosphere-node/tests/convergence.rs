//! Multi-peer scenarios over real loopback LAN-TCP transport (§8). Depends on
//! working mDNS on localhost, same caveat the reference daemon's own two-node
//! test carries.

use std::collections::BTreeMap;
use std::time::Duration;

use atmosphere_node::{CapabilitySpec, Constraints, Node, NodeConfig};
use atmosphere_types::{Capability, FeatureFlags};

fn config(dir: &std::path::Path, app_id: &str) -> NodeConfig {
    NodeConfig {
        data_dir: dir.to_path_buf(),
        app_id: app_id.to_string(),
        listen_port: 0,
        enable_lan: true,
        relay_addr: None,
        log_json: false,
        log_no_color: false,
    }
}

async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn two_lan_peers_discover_and_converge() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let node_a = Node::create(&config(dir_a.path(), "com.example.test")).unwrap();
    let invite = node_a.generate_invite(None);
    let node_b = Node::join(&config(dir_b.path(), "com.example.test"), &invite).unwrap();

    node_a.start().await.unwrap();
    node_b.start().await.unwrap();

    node_a.insert("demo", "x", BTreeMap::new()).await.unwrap();

    let converged = wait_until(Duration::from_secs(15), || node_b.get("demo", "x").is_some()).await;
    assert!(converged, "peer b never received peer a's write");

    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();
}

#[tokio::test]
async fn later_logical_timestamp_wins_on_both_sides() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let node_a = Node::create(&config(dir_a.path(), "com.example.test")).unwrap();
    let invite = node_a.generate_invite(None);
    let node_b = Node::join(&config(dir_b.path(), "com.example.test"), &invite).unwrap();

    node_a.start().await.unwrap();
    node_b.start().await.unwrap();

    let mut fields_a = BTreeMap::new();
    fields_a.insert("label".to_string(), serde_json::json!("from-a"));
    node_a.insert("demo", "shared", fields_a).await.unwrap();

    let converged = wait_until(Duration::from_secs(15), || node_b.get("demo", "shared").is_some()).await;
    assert!(converged);

    let mut fields_b = BTreeMap::new();
    fields_b.insert("label".to_string(), serde_json::json!("from-b"));
    node_b.insert("demo", "shared", fields_b).await.unwrap();

    let settled = wait_until(Duration::from_secs(15), || {
        node_a
            .get("demo", "shared")
            .and_then(|d| d.field("label").cloned())
            .map(|v| v == serde_json::json!("from-b"))
            .unwrap_or(false)
    })
    .await;
    assert!(settled, "peer a never converged on peer b's later write");
    assert_eq!(node_a.get("demo", "shared").unwrap().ts, node_b.get("demo", "shared").unwrap().ts);

    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();
}

#[tokio::test]
async fn capability_gossips_to_a_peer_and_is_routable() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let node_a = Node::create(&config(dir_a.path(), "com.example.test")).unwrap();
    let invite = node_a.generate_invite(None);
    let node_b = Node::join(&config(dir_b.path(), "com.example.test"), &invite).unwrap();

    node_a.start().await.unwrap();
    node_b.start().await.unwrap();

    node_a.register_capability(CapabilitySpec {
        capability_id: "llm.chat@a".into(),
        capability: Capability::LlmChat,
        label: "chat on a".into(),
        description: "a local chat model".into(),
        keywords: vec!["chat".into(), "hello".into()],
        good_for: vec![],
        specializations: vec![],
        model: None,
        features: FeatureFlags::default(),
        project_path: None,
    });

    let routable = wait_until(Duration::from_secs(15), || node_b.route("hello", &Constraints::default()).is_some()).await;
    assert!(routable, "peer b never learned peer a's capability");
    let decision = node_b.route("hello", &Constraints::default()).unwrap();
    assert_eq!(decision.peer_id, node_a.peer_id());

    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();
}
