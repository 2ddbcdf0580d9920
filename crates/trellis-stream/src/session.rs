//! Session driver: one task per connection.
//!
//! The task owns the transport, the framer and the current protocol state.
//! Input is framed and handed to the state one element at a time; the state
//! records its side effects (writes, TLS upgrade, parser reset, close) on the
//! [`StreamCtx`] and the driver performs them in order once the handler has
//! returned. Other tasks reach a session only through its [`SessionHandle`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use trellis_common::config::HostConfig;
use trellis_common::xml::Element;
use trellis_common::{Jid, StreamError, ns};
use trellis_db::Storage;
use trellis_federation::PeerTrust;
use uuid::Uuid;

use crate::framer::{Frame, StreamFramer};
use crate::node::Node;
use crate::state::client::ClientState;
use crate::state::outbound::{OutboundState, Purpose};
use crate::state::server::ServerState;
use crate::state::StreamState;

/// Byte transport a session runs over: TCP, TLS over TCP, or an in-memory pipe.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub type BoxedIo = Box<dyn Io>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Which side of which protocol a session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted client-to-server connection.
    Client,
    /// Accepted server-to-server connection.
    Server,
    /// Server-to-server connection initiated by this node.
    Outbound,
}

/// Result of an authoritative dialback check, relayed to the inbound
/// session that asked for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictOutcome {
    Valid,
    Invalid,
    /// The authoritative server could not be reached or gave no answer.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub outcome: VerdictOutcome,
    /// Local (receiving) domain.
    pub from: String,
    /// Remote (originating) domain.
    pub to: String,
}

/// Requests other tasks can make of a session.
#[derive(Debug)]
pub enum SessionCommand {
    /// Write a routed stanza to the peer.
    Deliver(Element),
    /// Outcome of dialback verification for this inbound session.
    Verdict(Verdict),
    /// Close the stream gracefully.
    Close,
}

/// Cloneable address of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<SessionCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a command. Returns false when the session has already ended.
    pub fn send(&self, command: SessionCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SessionHandle {}

/// How an outbound connection attempt ended, reported to whoever started it.
#[derive(Debug)]
pub enum ConnectOutcome {
    Connected(SessionHandle),
    /// The peer answered and refused us; do not try further candidates.
    Rejected,
}

/// Side effects requested by a state, executed by the driver in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Write(String),
    /// Upgrade the transport to TLS.
    Encrypt,
    /// Discard the parser so the next input starts a fresh stream.
    Reset,
    /// Drop the transport without flushing.
    Close,
    /// Flush pending output, then shut the transport down.
    CloseAfterWriting,
}

/// Everything a state may read or change about its session.
pub struct StreamCtx {
    pub node: Arc<Node>,
    pub role: Role,
    handle: SessionHandle,
    /// Id of the current stream; new on every header for accepted streams,
    /// taken from the peer's header for outbound ones.
    pub stream_id: Option<String>,
    /// Our domain on this stream.
    pub domain: Option<String>,
    /// The peer's domain on server streams.
    pub remote_domain: Option<String>,
    /// Authenticated client address: bare after SASL, full after bind.
    pub jid: Option<Jid>,
    pub encrypted: bool,
    pub peer_trust: PeerTrust,
    /// The peer marked STARTTLS as required.
    pub outbound_tls_required: bool,
    /// Client sent available presence.
    pub available: bool,
    pub offline_delivered: bool,
    /// Inbound stream id an authoritative channel still owes a verdict.
    pub pending_verdict: Option<String>,
    header_sent: bool,
    closing: bool,
    actions: Vec<Action>,
    on_connected: Option<oneshot::Sender<ConnectOutcome>>,
}

impl StreamCtx {
    fn new(node: Arc<Node>, role: Role, handle: SessionHandle) -> Self {
        Self {
            node,
            role,
            handle,
            stream_id: None,
            domain: None,
            remote_domain: None,
            jid: None,
            encrypted: false,
            peer_trust: PeerTrust::Unknown,
            outbound_tls_required: false,
            available: false,
            offline_delivered: false,
            pending_verdict: None,
            header_sent: false,
            closing: false,
            actions: Vec::new(),
            on_connected: None,
        }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn write(&mut self, el: &Element) {
        self.write_raw(el.to_xml());
    }

    pub fn write_raw(&mut self, xml: impl Into<String>) {
        if !self.closing {
            self.actions.push(Action::Write(xml.into()));
        }
    }

    pub fn encrypt(&mut self) {
        self.actions.push(Action::Encrypt);
    }

    pub fn reset(&mut self) {
        self.actions.push(Action::Reset);
    }

    pub fn close(&mut self) {
        if !self.closing {
            self.closing = true;
            self.actions.push(Action::Close);
        }
    }

    pub fn close_after_writing(&mut self) {
        if !self.closing {
            self.closing = true;
            self.actions.push(Action::CloseAfterWriting);
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    /// Write our `<stream:stream>` header. Accepted streams get a fresh id.
    pub fn send_header(&mut self) {
        let mut header = Element::new("stream:stream");
        match self.role {
            Role::Client => {
                header = header.attr("xmlns", ns::CLIENT);
            }
            Role::Server | Role::Outbound => {
                header = header.attr("xmlns", ns::SERVER).attr("xmlns:db", ns::LEGACY_DIALBACK);
            }
        }
        header = header.attr("xmlns:stream", ns::STREAM).attr("xml:lang", "en");
        if self.role != Role::Outbound {
            let id = Uuid::new_v4().to_string();
            header = header.attr("id", id.clone());
            self.stream_id = Some(id);
        }
        header = header.attr("version", "1.0");
        if let Some(domain) = &self.domain {
            header = header.attr("from", domain.clone());
        }
        if let Some(remote) = &self.remote_domain {
            header = header.attr("to", remote.clone());
        }
        self.header_sent = true;
        self.write_raw(format!("<?xml version='1.0'?>{}", header.to_open_tag()));
    }

    pub fn header_sent(&self) -> bool {
        self.header_sent
    }

    /// Write a stream error and close. The header goes first if the peer
    /// has not seen one yet, so the error is always well-formed.
    pub fn fail(&mut self, error: &StreamError) {
        if !self.header_sent {
            self.send_header();
        }
        self.write_raw(error.to_xml());
        self.close_after_writing();
    }

    /// Report a successfully negotiated outbound stream to its initiator.
    pub fn notify_connected(&mut self) {
        if let Some(tx) = self.on_connected.take() {
            let _ = tx.send(ConnectOutcome::Connected(self.handle.clone()));
        }
    }

    /// Report a definitive refusal to the initiator.
    pub fn reject_connect(&mut self) {
        if let Some(tx) = self.on_connected.take() {
            let _ = tx.send(ConnectOutcome::Rejected);
        }
    }

    pub fn vhost(&self) -> Option<&HostConfig> {
        self.domain.as_deref().and_then(|d| self.node.config.vhost(d))
    }

    pub fn storage(&self) -> Option<Arc<dyn Storage>> {
        self.domain.as_deref().and_then(|d| self.node.storage(d))
    }

    /// Whether STARTTLS can be offered on this stream right now.
    pub fn tls_available(&self) -> bool {
        !self.encrypted && self.domain.as_deref().is_some_and(|d| self.node.tls.has_certificate(d))
    }
}

/// Multiple of `client.max_stanza_size` buffered before the stream is torn
/// down.
const CLIENT_FRAMING_HEADROOM: usize = 4;

pub struct Session {
    ctx: StreamCtx,
    state: StreamState,
    io: Option<BoxedIo>,
    framer: StreamFramer,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
}

enum Input {
    Read(std::io::Result<usize>),
    Command(Option<SessionCommand>),
}

impl Session {
    fn new(node: Arc<Node>, io: BoxedIo, role: Role, state: StreamState) -> (Self, SessionHandle) {
        let (handle, commands) = SessionHandle::new();
        // Client stanzas are checked individually after framing, so the
        // framer only guards memory and leaves room to answer with a stanza
        // error instead of ending the stream.
        let max = match role {
            Role::Client => node.config.client.max_stanza_size.saturating_mul(CLIENT_FRAMING_HEADROOM),
            Role::Server | Role::Outbound => node.config.s2s.max_stanza_size,
        };
        let session = Self {
            ctx: StreamCtx::new(node, role, handle.clone()),
            state,
            io: Some(io),
            framer: StreamFramer::new(max),
            commands,
        };
        (session, handle)
    }

    async fn run(mut self) {
        let session = self.ctx.handle.id();
        info!(session, role = ?self.ctx.role, "Session started");

        let mut buf = vec![0u8; 8192];
        self.execute().await;
        loop {
            let input = {
                let Some(io) = self.io.as_mut() else { break };
                tokio::select! {
                    read = io.read(&mut buf) => Input::Read(read),
                    command = self.commands.recv() => Input::Command(command),
                }
            };
            match input {
                Input::Read(Ok(0)) => {
                    debug!(session, "Peer closed the connection");
                    break;
                }
                Input::Read(Ok(n)) => {
                    self.framer.feed(&buf[..n]);
                    self.process_input().await;
                }
                Input::Read(Err(e)) => {
                    debug!(session, error = %e, "Read failed");
                    break;
                }
                Input::Command(Some(command)) => {
                    self.command(command).await;
                    self.execute().await;
                }
                Input::Command(None) => break,
            }
        }
        self.finish().await;
    }

    /// Hand every complete frame to the current state, one at a time.
    async fn process_input(&mut self) {
        while self.io.is_some() && !self.ctx.is_closing() {
            let frame = match self.framer.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.fail(e);
                    self.execute().await;
                    break;
                }
            };
            self.dispatch(frame).await;
            self.execute().await;
        }
    }

    async fn dispatch(&mut self, frame: Frame) {
        let session = self.ctx.handle.id();
        let el = match frame {
            Frame::Open(el) | Frame::Element(el) => el,
            Frame::Close => {
                debug!(session, "Peer closed the stream");
                self.ctx.write_raw("</stream:stream>");
                self.ctx.close_after_writing();
                return;
            }
        };
        debug!(session, xml = %el.to_xml(), "RECV");

        let state = std::mem::take(&mut self.state);
        match state.handle(&mut self.ctx, el).await {
            Ok(next) => self.state = next,
            Err(e) => self.fail(e),
        }
    }

    async fn command(&mut self, command: SessionCommand) {
        if let SessionCommand::Close = command {
            if !self.ctx.is_closing() {
                self.ctx.write_raw("</stream:stream>");
                self.ctx.close_after_writing();
            }
            return;
        }
        let state = std::mem::take(&mut self.state);
        match state.command(&mut self.ctx, command).await {
            Ok(next) => self.state = next,
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, error: StreamError) {
        warn!(
            session = self.ctx.handle.id(),
            stream_id = ?self.ctx.stream_id,
            domain = ?self.ctx.domain,
            remote = ?self.ctx.remote_domain,
            error = %error,
            "Stream error"
        );
        self.ctx.fail(&error);
        self.state = StreamState::Closed;
    }

    /// Perform queued actions in order.
    async fn execute(&mut self) {
        let session = self.ctx.handle.id();
        for action in self.ctx.take_actions() {
            match action {
                Action::Write(xml) => {
                    let Some(io) = self.io.as_mut() else { return };
                    debug!(session, xml = %xml, "SEND");
                    if let Err(e) = io.write_all(xml.as_bytes()).await {
                        debug!(session, error = %e, "Write failed");
                        self.io = None;
                        return;
                    }
                }
                Action::Encrypt => {
                    if let Err(e) = self.upgrade().await {
                        warn!(session, error = %e, "TLS negotiation failed");
                        self.io = None;
                        return;
                    }
                }
                Action::Reset => self.framer.reset(),
                Action::Close => {
                    self.io = None;
                    return;
                }
                Action::CloseAfterWriting => {
                    if let Some(mut io) = self.io.take() {
                        let _ = io.flush().await;
                        let _ = io.shutdown().await;
                    }
                    return;
                }
            }
        }
        if let Some(io) = self.io.as_mut() {
            let _ = io.flush().await;
        }
    }

    async fn upgrade(&mut self) -> std::io::Result<()> {
        let Some(mut io) = self.io.take() else {
            return Err(std::io::Error::other("transport already closed"));
        };
        io.flush().await?;

        let domain = self.ctx.domain.clone().unwrap_or_default();
        let certs: Vec<CertificateDer<'static>> = match self.ctx.role {
            Role::Client | Role::Server => {
                let acceptor = self
                    .ctx
                    .node
                    .tls
                    .acceptor(&domain, self.ctx.role)
                    .ok_or_else(|| std::io::Error::other(format!("no certificate for {domain}")))?;
                let tls = acceptor.accept(io).await?;
                let certs = tls.get_ref().1.peer_certificates().map(<[_]>::to_vec).unwrap_or_default();
                self.io = Some(Box::new(tls));
                certs
            }
            Role::Outbound => {
                let remote = self.ctx.remote_domain.clone().unwrap_or_default();
                let name = ServerName::try_from(remote)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
                let tls = self.ctx.node.tls.connector(&domain).connect(name, io).await?;
                let certs = tls.get_ref().1.peer_certificates().map(<[_]>::to_vec).unwrap_or_default();
                self.io = Some(Box::new(tls));
                certs
            }
        };
        self.ctx.encrypted = true;

        if self.ctx.role != Role::Client {
            let remote = self.ctx.remote_domain.as_deref().unwrap_or_default();
            let accept_self_signed = self.ctx.vhost().is_some_and(|h| h.accept_self_signed);
            self.ctx.peer_trust = if self.ctx.node.trust.trusted(&certs, remote, accept_self_signed) {
                PeerTrust::Trusted
            } else {
                PeerTrust::Untrusted
            };
            info!(
                session = self.ctx.handle.id(),
                remote = %remote,
                trust = ?self.ctx.peer_trust,
                "TLS established"
            );
        }
        Ok(())
    }

    async fn finish(mut self) {
        let node = self.ctx.node.clone();
        node.router.unregister(&self.ctx.handle).await;

        if let Some(inbound_id) = self.ctx.pending_verdict.take() {
            if let Some(inbound) = node.router.stream_by_id(&inbound_id).await {
                inbound.send(SessionCommand::Verdict(Verdict {
                    outcome: VerdictOutcome::Error,
                    from: self.ctx.domain.clone().unwrap_or_default(),
                    to: self.ctx.remote_domain.clone().unwrap_or_default(),
                }));
            }
        }

        if self.ctx.available {
            if let Some(jid) = &self.ctx.jid {
                let unavailable = Element::new("presence")
                    .attr("from", jid.to_string())
                    .attr("type", "unavailable");
                for peer in node.router.sessions(jid).await {
                    peer.handle.send(SessionCommand::Deliver(unavailable.clone().attr("to", peer.jid.to_string())));
                }
            }
        }

        info!(
            session = self.ctx.handle.id(),
            role = ?self.ctx.role,
            jid = ?self.ctx.jid.as_ref().map(ToString::to_string),
            remote = ?self.ctx.remote_domain,
            "Session closed"
        );
    }
}

fn spawn(session: Session) {
    let task: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(session.run());
    tokio::spawn(task);
}

/// Run an accepted connection.
pub fn spawn_inbound(node: Arc<Node>, io: BoxedIo, role: Role) -> SessionHandle {
    let state = match role {
        Role::Client => StreamState::Client(ClientState::Start),
        Role::Server | Role::Outbound => StreamState::Server(ServerState::Start),
    };
    let role = if role == Role::Outbound { Role::Server } else { role };
    let (session, handle) = Session::new(node, io, role, state);
    spawn(session);
    handle
}

/// Run a connection this node opened to `remote` on behalf of `local`.
/// `on_connected` fires once the stream is authenticated (or, for a
/// verification channel, once the verify request is written).
pub fn spawn_outbound(
    node: Arc<Node>,
    io: BoxedIo,
    local: &str,
    remote: &str,
    purpose: Purpose,
    on_connected: oneshot::Sender<ConnectOutcome>,
) -> SessionHandle {
    let (mut session, handle) =
        Session::new(node, io, Role::Outbound, StreamState::Outbound(OutboundState::Start { purpose }));
    session.ctx.domain = Some(local.to_owned());
    session.ctx.remote_domain = Some(remote.to_owned());
    session.ctx.on_connected = Some(on_connected);
    session.ctx.send_header();
    spawn(session);
    handle
}
