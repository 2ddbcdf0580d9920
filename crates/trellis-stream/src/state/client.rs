//! Client (c2s) negotiation: STARTTLS, SASL PLAIN, resource binding.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{info, warn};
use trellis_common::xml::Element;
use trellis_common::{Jid, StanzaError, StreamError, ns};

use super::{features, is_stream_header, mechanisms, starttls};
use crate::router::BindError;
use crate::session::StreamCtx;
use crate::stanza;

#[derive(Debug)]
pub enum ClientState {
    /// Waiting for the initial stream header.
    Start,
    /// Features sent; expecting `<starttls/>` or `<auth/>`.
    AuthMethod,
    /// A SASL attempt failed; expecting another `<auth/>`.
    Auth { attempts: u32 },
    /// Authenticated; waiting for the stream restart.
    BindRestart,
    /// Waiting for the bind request.
    Bind,
    Ready,
}

impl ClientState {
    pub async fn handle(self, ctx: &mut StreamCtx, el: Element) -> Result<ClientState, StreamError> {
        match self {
            Self::Start => {
                accept_header(ctx, &el)?;
                let offer = if ctx.tls_available() {
                    starttls(true)
                } else {
                    mechanisms(&["PLAIN"])
                };
                ctx.write(&features([offer]));
                Ok(Self::AuthMethod)
            }
            Self::AuthMethod => {
                if el.is("starttls", ns::TLS) {
                    return Ok(start_tls(ctx));
                }
                if el.is("auth", ns::SASL) {
                    if ctx.tls_available() {
                        // Credentials only travel encrypted when TLS is possible.
                        return Err(StreamError::PolicyViolation("STARTTLS required".into()));
                    }
                    return auth(ctx, &el, 0).await;
                }
                Err(StreamError::NotAuthorized)
            }
            Self::Auth { attempts } => {
                if el.is("auth", ns::SASL) {
                    return auth(ctx, &el, attempts).await;
                }
                Err(StreamError::NotAuthorized)
            }
            Self::BindRestart => {
                accept_header(ctx, &el)?;
                let session = Element::with_ns("session", ns::SESSION).child(Element::new("optional"));
                ctx.write(&features([Element::with_ns("bind", ns::BIND), session]));
                Ok(Self::Bind)
            }
            Self::Bind => bind(ctx, &el).await,
            Self::Ready => {
                stanza::handle(ctx, el).await?;
                Ok(Self::Ready)
            }
        }
    }
}

/// Validate a client stream header and answer it with ours. The domain set
/// by the first header may not change on restarts.
fn accept_header(ctx: &mut StreamCtx, el: &Element) -> Result<(), StreamError> {
    if !is_stream_header(el) {
        return Err(StreamError::NotAuthorized);
    }
    let to = el.get_attr("to").map(str::to_lowercase);
    if ctx.domain.is_none() {
        ctx.domain = to.clone();
    }
    ctx.send_header();

    let Some(to) = to else {
        return Err(StreamError::ImproperAddressing);
    };
    if ctx.domain.as_deref() != Some(to.as_str()) {
        return Err(StreamError::NotAuthorized);
    }
    if !ctx.node.config.is_vhost(&to) {
        return Err(StreamError::HostUnknown);
    }
    if el.get_attr("xmlns") != Some(ns::CLIENT) {
        return Err(StreamError::InvalidNamespace);
    }
    Ok(())
}

fn start_tls(ctx: &mut StreamCtx) -> ClientState {
    if !ctx.tls_available() {
        ctx.write(&Element::with_ns("failure", ns::TLS));
        ctx.write_raw("</stream:stream>");
        ctx.close_after_writing();
        return ClientState::AuthMethod;
    }
    ctx.write(&Element::with_ns("proceed", ns::TLS));
    ctx.encrypt();
    ctx.reset();
    ClientState::Start
}

enum SaslFailure {
    InvalidMechanism,
    IncorrectEncoding,
    NotAuthorized,
    TemporaryAuthFailure,
}

impl SaslFailure {
    fn condition(&self) -> &'static str {
        match self {
            Self::InvalidMechanism => "invalid-mechanism",
            Self::IncorrectEncoding => "incorrect-encoding",
            Self::NotAuthorized => "not-authorized",
            Self::TemporaryAuthFailure => "temporary-auth-failure",
        }
    }
}

/// Run one SASL PLAIN attempt. `attempts` counts earlier failures.
async fn auth(ctx: &mut StreamCtx, el: &Element, attempts: u32) -> Result<ClientState, StreamError> {
    match authenticate(ctx, el).await {
        Ok(jid) => {
            info!(session = ctx.handle().id(), jid = %jid, "Client authenticated");
            ctx.jid = Some(jid);
            ctx.write(&Element::with_ns("success", ns::SASL));
            ctx.reset();
            Ok(ClientState::BindRestart)
        }
        Err(failure) => {
            ctx.write(&Element::with_ns("failure", ns::SASL).child(Element::new(failure.condition())));
            let attempts = attempts + 1;
            if attempts >= ctx.node.config.client.max_auth_attempts {
                return Err(StreamError::PolicyViolation("too many failed authentication attempts".into()));
            }
            Ok(ClientState::Auth { attempts })
        }
    }
}

async fn authenticate(ctx: &StreamCtx, el: &Element) -> Result<Jid, SaslFailure> {
    if el.get_attr("mechanism") != Some("PLAIN") {
        return Err(SaslFailure::InvalidMechanism);
    }
    let domain = ctx.domain.as_deref().ok_or(SaslFailure::NotAuthorized)?;
    let decoded = BASE64
        .decode(el.text_content().trim())
        .map_err(|_| SaslFailure::IncorrectEncoding)?;
    let decoded = String::from_utf8(decoded).map_err(|_| SaslFailure::IncorrectEncoding)?;

    let mut parts = decoded.split('\0');
    let (Some(authzid), Some(authcid), Some(password), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(SaslFailure::IncorrectEncoding);
    };
    if authcid.is_empty() || password.is_empty() {
        return Err(SaslFailure::NotAuthorized);
    }

    let account = if authcid.contains('@') { authcid.to_owned() } else { format!("{authcid}@{domain}") };
    let jid = Jid::parse(&account).map_err(|_| SaslFailure::NotAuthorized)?;
    if jid.domain() != domain || jid.resource().is_some() {
        return Err(SaslFailure::NotAuthorized);
    }
    if !authzid.is_empty() && Jid::parse(authzid).ok().as_ref() != Some(&jid) {
        return Err(SaslFailure::NotAuthorized);
    }

    let storage = ctx.storage().ok_or(SaslFailure::TemporaryAuthFailure)?;
    match storage.authenticate(&jid, password).await {
        Ok(Some(user)) => Ok(user.jid),
        Ok(None) => Err(SaslFailure::NotAuthorized),
        Err(e) => {
            warn!(jid = %jid, error = %e, "Authentication backend failed");
            Err(SaslFailure::TemporaryAuthFailure)
        }
    }
}

async fn bind(ctx: &mut StreamCtx, el: &Element) -> Result<ClientState, StreamError> {
    let request = el.find_child("bind", ns::BIND);
    let (Some(request), Some(id)) = (request, el.get_attr("id")) else {
        return Err(StreamError::NotAuthorized);
    };
    if !el.is("iq", ns::CLIENT) || el.get_attr("type") != Some("set") {
        return Err(StreamError::NotAuthorized);
    }
    let account = ctx.jid.clone().ok_or(StreamError::NotAuthorized)?;
    let requested = request.find_child("resource", ns::BIND).map(Element::text_content);

    let node = ctx.node.clone();
    let max = node.config.client.max_resources_per_account;
    match node.router.register_authenticated(&account, requested, ctx.handle(), max).await {
        Ok(full) => {
            let reply = Element::new("iq").attr("type", "result").attr("id", id).child(
                Element::with_ns("bind", ns::BIND).child(Element::new("jid").text(full.to_string())),
            );
            ctx.write(&reply);
            ctx.jid = Some(full);
            Ok(ClientState::Ready)
        }
        Err(e) => {
            let error = match e {
                BindError::ResourceLimit => StanzaError::ResourceConstraint,
                BindError::InvalidResource => StanzaError::BadRequest,
            };
            warn!(session = ctx.handle().id(), jid = %account, error = %e, "Bind refused");
            let reply = Element::new("iq")
                .attr("type", "error")
                .attr("id", id)
                .child(request.clone())
                .child(error.to_element());
            ctx.write(&reply);
            Ok(ClientState::Bind)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::session::Role;
    use crate::session::testing::{TestSession, header, parse};
    use std::sync::Arc;
    use trellis_common::config::AppConfig;
    use trellis_db::MemoryStorage;

    const HEADER: &str = "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' \
        to='a.example' version='1.0'>";

    async fn node_with(config: AppConfig) -> Arc<Node> {
        let storage = Arc::new(MemoryStorage::new());
        storage.create_user(&Jid::parse("alice@a.example").unwrap(), "secret").await.unwrap();
        Node::builder(config).storage("a.example", storage).build().unwrap()
    }

    fn plain(authcid: &str, password: &str) -> Element {
        let payload = BASE64.encode(format!("\0{authcid}\0{password}"));
        parse(&format!("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{payload}</auth>"))
    }

    fn bind_request(resource: &str) -> Element {
        parse(&format!(
            "<iq type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>{resource}</resource></bind></iq>"
        ))
    }

    /// Drive a fresh session to the Bind state.
    async fn authenticated(node: &Arc<Node>) -> (TestSession, ClientState) {
        let mut s = TestSession::new(node, Role::Client);
        let state = ClientState::Start.handle(&mut s.ctx, header(HEADER)).await.unwrap();
        let state = state.handle(&mut s.ctx, plain("alice", "secret")).await.unwrap();
        assert!(matches!(state, ClientState::BindRestart));
        let state = state.handle(&mut s.ctx, header(HEADER)).await.unwrap();
        assert!(matches!(state, ClientState::Bind));
        s.written();
        (s, state)
    }

    #[tokio::test]
    async fn full_negotiation_binds_one_resource() {
        let node = node_with(AppConfig::with_hosts(["a.example"])).await;
        let mut s = TestSession::new(&node, Role::Client);

        let state = ClientState::Start.handle(&mut s.ctx, header(HEADER)).await.unwrap();
        let out = s.written().concat();
        assert!(out.contains("<mechanism>PLAIN</mechanism>"));
        assert!(!out.contains("starttls"));

        let state = state.handle(&mut s.ctx, plain("alice", "secret")).await.unwrap();
        assert_eq!(s.written(), vec!["<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>".to_owned()]);
        assert_eq!(s.ctx.jid.as_ref().map(ToString::to_string).as_deref(), Some("alice@a.example"));

        let state = state.handle(&mut s.ctx, header(HEADER)).await.unwrap();
        assert!(s.written().concat().contains("urn:ietf:params:xml:ns:xmpp-bind"));

        let state = state.handle(&mut s.ctx, bind_request("phone")).await.unwrap();
        assert!(matches!(state, ClientState::Ready));
        assert!(s.written().concat().contains("<jid>alice@a.example/phone</jid>"));
        assert_eq!(node.router.sessions(&Jid::parse("alice@a.example").unwrap()).await.len(), 1);
    }

    #[tokio::test]
    async fn wrong_password_then_limit_closes_stream() {
        let node = node_with(AppConfig::with_hosts(["a.example"])).await;
        let mut s = TestSession::new(&node, Role::Client);
        let state = ClientState::Start.handle(&mut s.ctx, header(HEADER)).await.unwrap();

        let state = state.handle(&mut s.ctx, plain("alice", "wrong")).await.unwrap();
        assert!(matches!(state, ClientState::Auth { attempts: 1 }));
        assert!(s.written().concat().contains("<not-authorized/>"));

        let state = state.handle(&mut s.ctx, plain("alice", "wrong")).await.unwrap();
        let err = state.handle(&mut s.ctx, plain("alice", "wrong")).await.unwrap_err();
        assert!(matches!(err, StreamError::PolicyViolation(_)));
    }

    #[tokio::test]
    async fn garbage_payload_is_incorrect_encoding() {
        let node = node_with(AppConfig::with_hosts(["a.example"])).await;
        let mut s = TestSession::new(&node, Role::Client);
        let state = ClientState::Start.handle(&mut s.ctx, header(HEADER)).await.unwrap();
        s.written();
        let el = parse("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>!!!</auth>");
        state.handle(&mut s.ctx, el).await.unwrap();
        assert!(s.written().concat().contains("<incorrect-encoding/>"));
    }

    #[tokio::test]
    async fn sixth_bind_is_rejected_and_session_stays_in_bind() {
        let node = node_with(AppConfig::with_hosts(["a.example"])).await;
        let mut sessions = Vec::new();
        for i in 0..5 {
            let (mut s, state) = authenticated(&node).await;
            let state = state.handle(&mut s.ctx, bind_request(&format!("r{i}"))).await.unwrap();
            assert!(matches!(state, ClientState::Ready));
            sessions.push(s);
        }

        let (mut sixth, state) = authenticated(&node).await;
        let state = state.handle(&mut sixth.ctx, bind_request("r5")).await.unwrap();
        assert!(matches!(state, ClientState::Bind));
        let out = sixth.written().concat();
        assert!(out.contains("type='error'"));
        assert!(out.contains("<error type='wait'><resource-constraint"));
        assert_eq!(node.router.sessions(&Jid::parse("alice@a.example").unwrap()).await.len(), 5);
    }

    #[tokio::test]
    async fn unknown_host_is_rejected() {
        let node = node_with(AppConfig::with_hosts(["a.example"])).await;
        let mut s = TestSession::new(&node, Role::Client);
        let other = HEADER.replace("a.example", "z.example");
        let err = ClientState::Start.handle(&mut s.ctx, header(&other)).await.unwrap_err();
        assert_eq!(err, StreamError::HostUnknown);
        assert!(s.ctx.header_sent());
    }

    #[tokio::test]
    async fn domain_change_on_restart_is_not_authorized() {
        let node = node_with(AppConfig::with_hosts(["a.example", "b.example"])).await;
        let mut s = TestSession::new(&node, Role::Client);
        let state = ClientState::Start.handle(&mut s.ctx, header(HEADER)).await.unwrap();
        let state = state.handle(&mut s.ctx, plain("alice", "secret")).await.unwrap();
        let other = HEADER.replace("a.example", "b.example");
        assert_eq!(state.handle(&mut s.ctx, header(&other)).await.unwrap_err(), StreamError::NotAuthorized);
    }

    #[tokio::test]
    async fn starttls_without_certificate_fails_and_closes() {
        let node = node_with(AppConfig::with_hosts(["a.example"])).await;
        let mut s = TestSession::new(&node, Role::Client);
        let state = ClientState::Start.handle(&mut s.ctx, header(HEADER)).await.unwrap();
        s.written();
        state
            .handle(&mut s.ctx, parse("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"))
            .await
            .unwrap();
        assert_eq!(
            s.written(),
            vec!["<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>".to_owned(), "</stream:stream>".to_owned()]
        );
        assert!(s.ctx.is_closing());
    }
}
