//! STARTTLS on server streams with generated certificates: the upgrade
//! itself, certificate trust after the restart and a federated link that
//! can only come up over a trusted certificate.

mod common;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use common::{CountingResolver, Mesh, TestClient, certificate};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, duplex};
use tokio_rustls::client::TlsStream;
use trellis_common::config::AppConfig;
use trellis_common::{Element, Jid, ns};
use trellis_db::MemoryStorage;
use trellis_stream::framer::{Frame, StreamFramer};
use trellis_stream::session;
use trellis_stream::tls::{self, TlsContext};
use trellis_stream::{Node, Role};

const PEER_HEADER: &str = "<stream:stream xmlns='jabber:server' xmlns:stream='http://etherx.jabber.org/streams' \
    xmlns:db='jabber:server:dialback' from='a.example' to='b.example' version='1.0'>";

fn tls_for(domains: &[&str]) -> TlsContext {
    let mut ctx = TlsContext::new(tls::provider()).unwrap();
    for domain in domains {
        let (chain, key) = certificate(domain);
        ctx.add_host(domain, chain, key).unwrap();
    }
    ctx
}

/// Node serving b.example with a certificate.
fn receiving_node(accept_self_signed: bool) -> Arc<Node> {
    let mut config = AppConfig::with_hosts(["b.example"]);
    config.hosts.get_mut("b.example").unwrap().accept_self_signed = accept_self_signed;
    Node::builder(config).tls(tls_for(&["b.example"])).build().unwrap()
}

/// Read until an element matching `pred`, skipping headers.
async fn next_element<S: AsyncRead + Unpin>(
    io: &mut S,
    framer: &mut StreamFramer,
    pred: impl Fn(&Element) -> bool,
) -> Element {
    let mut buf = [0u8; 4096];
    loop {
        while let Some(frame) = framer.next_frame().unwrap() {
            match frame {
                Frame::Element(el) if pred(&el) => return el,
                Frame::Close => panic!("stream closed"),
                _ => {}
            }
        }
        let n = tokio::time::timeout(Duration::from_secs(10), io.read(&mut buf))
            .await
            .expect("timed out waiting for element")
            .unwrap();
        assert!(n > 0, "connection closed");
        framer.feed(&buf[..n]);
    }
}

async fn send<S: AsyncWrite + Unpin>(io: &mut S, xml: &str) {
    io.write_all(xml.as_bytes()).await.unwrap();
    io.flush().await.unwrap();
}

/// Open a server stream to b.example as a.example, upgrade it with a.example's
/// self-signed certificate and return the features offered after the
/// restart.
async fn features_after_upgrade(node: Arc<Node>) -> (Element, TlsStream<DuplexStream>, StreamFramer) {
    let (mut near, far) = duplex(64 * 1024);
    session::spawn_inbound(node, Box::new(far), Role::Server);
    let mut framer = StreamFramer::new(1 << 20);

    send(&mut near, PEER_HEADER).await;
    let offer = next_element(&mut near, &mut framer, |el| el.is("features", ns::STREAM)).await;
    assert!(offer.has_child("starttls", ns::TLS));

    send(&mut near, "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await;
    next_element(&mut near, &mut framer, |el| el.is("proceed", ns::TLS)).await;

    let connector = tls_for(&["a.example"]).connector("a.example");
    let name = ServerName::try_from("b.example").unwrap();
    let mut tls = connector.connect(name, near).await.unwrap();
    framer.reset();

    send(&mut tls, PEER_HEADER).await;
    let features = next_element(&mut tls, &mut framer, |el| el.is("features", ns::STREAM)).await;
    (features, tls, framer)
}

fn offers_external(features: &Element) -> bool {
    features
        .find_child("mechanisms", ns::SASL)
        .is_some_and(|m| m.children().iter().any(|c| c.text_content() == "EXTERNAL"))
}

#[tokio::test]
async fn trusted_certificate_is_offered_external() {
    let (features, mut tls, mut framer) = features_after_upgrade(receiving_node(true)).await;
    assert!(offers_external(&features));
    assert!(!features.has_child("dialback", ns::DIALBACK));

    let authzid = BASE64.encode("a.example");
    send(&mut tls, &format!("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='EXTERNAL'>{authzid}</auth>")).await;
    next_element(&mut tls, &mut framer, |el| el.is("success", ns::SASL)).await;
}

#[tokio::test]
async fn untrusted_certificate_falls_back_to_dialback() {
    let (features, _tls, _framer) = features_after_upgrade(receiving_node(false)).await;
    assert!(!offers_external(&features));
    assert!(features.has_child("dialback", ns::DIALBACK));
}

async fn encrypted_node(domain: &str, mesh: &Arc<Mesh>, user: &str) -> Arc<Node> {
    let mut config = AppConfig::with_hosts([domain]);
    let host = config.hosts.get_mut(domain).unwrap();
    host.accept_self_signed = true;
    host.force_s2s_encryption = true;

    let storage = Arc::new(MemoryStorage::new());
    storage.create_user(&Jid::parse(user).unwrap(), "secret").await.unwrap();
    let node = Node::builder(config)
        .tls(tls_for(&[domain]))
        .storage(domain, storage)
        .resolver(Arc::new(CountingResolver::default()))
        .dialer(mesh.clone())
        .build()
        .unwrap();
    mesh.nodes.lock().unwrap().insert(domain.to_owned(), node.clone());
    node
}

#[tokio::test]
async fn forced_encryption_link_authenticates_with_certificates() {
    let mesh = Arc::new(Mesh::default());
    let a = encrypted_node("a.example", &mesh, "alice@a.example").await;
    let b = encrypted_node("b.example", &mesh, "bob@b.example").await;

    let mut alice = TestClient::login(&a, "alice@a.example", "secret").await;
    let mut bob = TestClient::login(&b, "bob@b.example", "secret").await;

    alice.send("<message to='bob@b.example' type='chat'><body>sealed</body></message>").await;
    let received = bob.expect(|el| el.name() == "message").await;
    assert_eq!(received.get_attr("from"), Some("alice@a.example/desk"));
    assert_eq!(received.children()[0].text_content(), "sealed");
    assert!(a.router.link("a.example", "b.example").await.is_some());
}
