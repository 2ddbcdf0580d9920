//! In-memory test harness shared by the integration tests: a dialer that
//! connects nodes over pipes, a counting resolver and a scripted client.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
use trellis_common::{Element, Jid, ns};
use trellis_federation::discovery::StaticResolver;
use trellis_federation::{Candidate, FederationError, SrvRecord, SrvResolver};
use trellis_stream::framer::{Frame, StreamFramer};
use trellis_stream::session::{self, BoxedIo};
use trellis_stream::tls::{self, TlsContext};
use trellis_stream::{Dial, Node, Role};

/// Connects a candidate host to the node serving that domain.
#[derive(Default)]
pub struct Mesh {
    pub nodes: Mutex<HashMap<String, Arc<Node>>>,
}

#[async_trait]
impl Dial for Mesh {
    async fn dial(&self, candidate: &Candidate) -> io::Result<BoxedIo> {
        let target = self.nodes.lock().unwrap().get(&candidate.host).cloned();
        let Some(target) = target else {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "no such host"));
        };
        let (near, far) = duplex(64 * 1024);
        session::spawn_inbound(target, Box::new(far), Role::Server);
        Ok(Box::new(near))
    }
}

/// Empty DNS that counts lookups.
#[derive(Default)]
pub struct CountingResolver {
    inner: StaticResolver,
    pub lookups: AtomicUsize,
}

impl CountingResolver {
    pub fn count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SrvResolver for CountingResolver {
    async fn lookup(&self, name: &str) -> Result<Vec<SrvRecord>, FederationError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.lookup(name).await
    }
}

/// Self-signed certificate chain and key for `domain`.
pub fn certificate(domain: &str) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(vec![domain.to_owned()]).unwrap();
    (vec![cert.der().clone()], PrivateKeyDer::Pkcs8(key_pair.serialize_der().into()))
}

pub struct TestClient {
    io: BoxedIo,
    framer: StreamFramer,
}

impl TestClient {
    /// Authenticate with PLAIN, upgrading first when STARTTLS is offered,
    /// then bind resource `desk` and send initial presence.
    pub async fn login(node: &Arc<Node>, jid: &str, password: &str) -> Self {
        let jid = Jid::parse(jid).unwrap();
        let (near, far) = duplex(64 * 1024);
        session::spawn_inbound(node.clone(), Box::new(far), Role::Client);
        let mut client = Self { io: Box::new(near), framer: StreamFramer::new(1 << 20) };

        client.open(jid.domain()).await;
        let offer = client.expect(|el| el.name() == "features").await;
        if offer.has_child("starttls", ns::TLS) {
            client.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await;
            client.expect(|el| el.is("proceed", ns::TLS)).await;
            client = client.upgrade(jid.domain()).await;
            client.open(jid.domain()).await;
            client.expect(|el| el.name() == "features").await;
        }
        let credentials = BASE64.encode(format!("\0{}\0{password}", jid.node().unwrap()));
        client
            .send(&format!(
                "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{credentials}</auth>"
            ))
            .await;
        client.expect(|el| el.name() == "success").await;
        client.framer.reset();

        client.open(jid.domain()).await;
        client.expect(|el| el.name() == "features").await;
        client
            .send("<iq type='set' id='bind-1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>desk</resource></bind></iq>")
            .await;
        let bound = client.expect(|el| el.name() == "iq").await;
        assert_eq!(bound.get_attr("type"), Some("result"));
        client.send("<presence/>").await;
        client.ping("ping-login").await;
        client
    }

    async fn upgrade(self, domain: &str) -> Self {
        let connector = TlsContext::new(tls::provider()).unwrap().connector(domain);
        let name = ServerName::try_from(domain.to_owned()).unwrap();
        let tls = connector.connect(name, self.io).await.unwrap();
        Self { io: Box::new(tls), framer: StreamFramer::new(1 << 20) }
    }

    pub async fn open(&mut self, domain: &str) {
        self.send(&format!(
            "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' \
             to='{domain}' version='1.0'>"
        ))
        .await;
    }

    pub async fn send(&mut self, xml: &str) {
        self.io.write_all(xml.as_bytes()).await.unwrap();
        self.io.flush().await.unwrap();
    }

    /// Ping the server and wait for the answer. Input is handled in order,
    /// so the pong means everything sent before it has been applied.
    pub async fn ping(&mut self, id: &str) {
        self.send(&format!("<iq type='get' id='{id}'><ping xmlns='urn:xmpp:ping'/></iq>")).await;
        let pong = self.expect(|el| el.name() == "iq" && el.get_attr("id") == Some(id)).await;
        assert_eq!(pong.get_attr("type"), Some("result"));
    }

    /// Read until an element matching `pred` arrives, skipping headers and
    /// anything else.
    pub async fn expect(&mut self, pred: impl Fn(&Element) -> bool) -> Element {
        let mut buf = [0u8; 4096];
        loop {
            while let Some(frame) = self.framer.next_frame().unwrap() {
                match frame {
                    Frame::Element(el) if pred(&el) => return el,
                    Frame::Close => panic!("stream closed"),
                    _ => {}
                }
            }
            let n = tokio::time::timeout(Duration::from_secs(10), self.io.read(&mut buf))
                .await
                .expect("timed out waiting for element")
                .unwrap();
            assert!(n > 0, "connection closed");
            self.framer.feed(&buf[..n]);
        }
    }
}
