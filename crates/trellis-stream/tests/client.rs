//! Client streams against a single node over in-memory pipes.

mod common;

use std::sync::Arc;

use common::TestClient;
use trellis_common::config::AppConfig;
use trellis_common::{Jid, ns};
use trellis_db::MemoryStorage;
use trellis_stream::Node;

async fn node_with_stanza_limit(limit: usize) -> Arc<Node> {
    let mut config = AppConfig::with_hosts(["a.example"]);
    config.client.max_stanza_size = limit;
    let storage = Arc::new(MemoryStorage::new());
    for user in ["alice@a.example", "bob@a.example"] {
        storage.create_user(&Jid::parse(user).unwrap(), "secret").await.unwrap();
    }
    Node::builder(config).storage("a.example", storage).build().unwrap()
}

#[tokio::test]
async fn oversized_stanza_is_answered_with_stanza_error() {
    let node = node_with_stanza_limit(1024).await;
    let mut alice = TestClient::login(&node, "alice@a.example", "secret").await;

    let body = "x".repeat(2048);
    alice.send(&format!("<message to='bob@a.example' id='big-1' type='chat'><body>{body}</body></message>")).await;
    let reply = alice.expect(|el| el.name() == "message").await;
    assert_eq!(reply.get_attr("type"), Some("error"));
    assert_eq!(reply.get_attr("id"), Some("big-1"));
    assert_eq!(reply.get_attr("from"), Some("bob@a.example"));
    let error = reply.children().iter().find(|c| c.name() == "error").expect("error child");
    assert!(error.has_child("policy-violation", ns::STANZA_ERRORS));

    alice.ping("after-big").await;
}

#[tokio::test]
async fn runaway_input_ends_the_stream() {
    let node = node_with_stanza_limit(1024).await;
    let mut alice = TestClient::login(&node, "alice@a.example", "secret").await;

    let body = "x".repeat(8192);
    alice.send(&format!("<message to='bob@a.example' type='chat'><body>{body}</body></message>")).await;
    let error = alice.expect(|el| el.name() == "error").await;
    assert!(error.has_child("policy-violation", ns::STREAM_ERRORS));
}
