//! Inbound server (s2s) negotiation.
//!
//! The peer authenticates either with SASL EXTERNAL, after presenting a
//! certificate trusted for the domain it asserts, or with dialback: the key
//! it sends in `<db:result>` is checked over a separate authoritative
//! connection to the asserted domain, and the verdict arrives back here as
//! a [`SessionCommand::Verdict`](crate::session::SessionCommand::Verdict).

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, info, warn};
use trellis_common::xml::Element;
use trellis_common::{Jid, StreamError, ns};

use super::{features, is_stream_header, mechanisms, starttls};
use crate::connector;
use crate::session::{SessionCommand, StreamCtx, Verdict, VerdictOutcome};
use crate::stanza;
use crate::state::outbound::Purpose;

#[derive(Debug)]
pub enum ServerState {
    /// Waiting for the initial stream header.
    Start,
    /// Features sent; expecting STARTTLS, `<db:result>` or `<db:verify>`.
    AuthMethod { dialback_pending: bool },
    /// TLS established; waiting for the stream restart.
    AuthRestart,
    /// Trusted peer; expecting SASL EXTERNAL or `<db:result>`.
    Auth,
    /// SASL succeeded; waiting for the final stream restart.
    FinalRestart,
    Ready,
}

impl ServerState {
    pub async fn handle(self, ctx: &mut StreamCtx, el: Element) -> Result<ServerState, StreamError> {
        match self {
            Self::Start => {
                accept_header(ctx, &el)?;
                let mut offer = Vec::new();
                if ctx.tls_available() {
                    offer.push(starttls(forces_encryption(ctx)));
                }
                offer.push(Element::with_ns("dialback", ns::DIALBACK));
                ctx.write(&features(offer));
                Ok(Self::AuthMethod { dialback_pending: false })
            }
            Self::AuthMethod { dialback_pending } => {
                if el.is("starttls", ns::TLS) {
                    if !ctx.tls_available() {
                        ctx.write(&Element::with_ns("failure", ns::TLS));
                        ctx.write_raw("</stream:stream>");
                        ctx.close_after_writing();
                        return Ok(self);
                    }
                    ctx.write(&Element::with_ns("proceed", ns::TLS));
                    ctx.encrypt();
                    ctx.reset();
                    return Ok(Self::AuthRestart);
                }
                if el.is("result", ns::LEGACY_DIALBACK) {
                    if dialback_pending {
                        return Err(StreamError::NotAuthorized);
                    }
                    if forces_encryption(ctx) && !ctx.encrypted && ctx.tls_available() {
                        return Err(StreamError::PolicyViolation("encryption required".into()));
                    }
                    start_dialback(ctx, &el).await?;
                    return Ok(Self::AuthMethod { dialback_pending: true });
                }
                if el.is("verify", ns::LEGACY_DIALBACK) {
                    verify_dialback(ctx, &el).await?;
                    return Ok(self);
                }
                Err(StreamError::NotAuthorized)
            }
            Self::AuthRestart => {
                accept_header(ctx, &el)?;
                if ctx.peer_trust.is_trusted() {
                    ctx.write(&features([mechanisms(&["EXTERNAL"])]));
                    return Ok(Self::Auth);
                }
                if ctx.peer_trust.needs_dialback() && !forces_encryption(ctx) {
                    ctx.write(&features([Element::with_ns("dialback", ns::DIALBACK)]));
                    return Ok(Self::AuthMethod { dialback_pending: false });
                }
                Err(StreamError::PolicyViolation("peer certificate not trusted".into()))
            }
            Self::Auth => {
                if el.is("result", ns::LEGACY_DIALBACK) {
                    start_dialback(ctx, &el).await?;
                    return Ok(Self::AuthMethod { dialback_pending: true });
                }
                if el.is("auth", ns::SASL) {
                    return Ok(external(ctx, &el));
                }
                Err(StreamError::NotAuthorized)
            }
            Self::FinalRestart => {
                accept_header(ctx, &el)?;
                ctx.write(&features([]));
                info!(
                    session = ctx.handle().id(),
                    domain = ?ctx.domain,
                    remote = ?ctx.remote_domain,
                    "Inbound server stream authenticated with SASL EXTERNAL"
                );
                Ok(Self::Ready)
            }
            Self::Ready => {
                if el.is("verify", ns::LEGACY_DIALBACK) {
                    verify_dialback(ctx, &el).await?;
                    return Ok(self);
                }
                if matches!(el.name(), "message" | "presence" | "iq") && el.ns() == Some(ns::SERVER) {
                    inbound_stanza(ctx, el).await?;
                    return Ok(self);
                }
                Err(StreamError::UnsupportedStanzaType)
            }
        }
    }

    /// Finish a dialback check started by this stream's `<db:result>`.
    pub async fn on_verdict(self, ctx: &mut StreamCtx, verdict: Verdict) -> ServerState {
        let Self::AuthMethod { dialback_pending: true } = self else {
            debug!(session = ctx.handle().id(), ?verdict, "Unsolicited dialback verdict");
            return self;
        };
        if ctx.domain.as_deref() != Some(verdict.from.as_str())
            || ctx.remote_domain.as_deref() != Some(verdict.to.as_str())
        {
            warn!(session = ctx.handle().id(), ?verdict, "Dialback verdict for another domain pair");
            return self;
        }
        if let Some(id) = ctx.stream_id.clone() {
            ctx.node.router.remove_handshake(&id, ctx.handle()).await;
        }

        let result = Element::new("db:result").attr("from", verdict.from.as_str()).attr("to", verdict.to.as_str());
        match verdict.outcome {
            VerdictOutcome::Valid => {
                ctx.write(&result.attr("type", "valid"));
                info!(
                    session = ctx.handle().id(),
                    domain = %verdict.from,
                    remote = %verdict.to,
                    "Inbound server stream authenticated with dialback"
                );
                Self::Ready
            }
            VerdictOutcome::Invalid => {
                warn!(session = ctx.handle().id(), remote = %verdict.to, "Dialback key rejected");
                ctx.write(&result.attr("type", "invalid"));
                ctx.write_raw("</stream:stream>");
                ctx.close_after_writing();
                Self::AuthMethod { dialback_pending: false }
            }
            VerdictOutcome::Error => {
                warn!(session = ctx.handle().id(), remote = %verdict.to, "Dialback verification unavailable");
                ctx.write(&result.attr("type", "error").child(item_not_found()));
                ctx.write_raw("</stream:stream>");
                ctx.close_after_writing();
                Self::AuthMethod { dialback_pending: false }
            }
        }
    }
}

fn forces_encryption(ctx: &StreamCtx) -> bool {
    ctx.vhost().is_some_and(|h| h.force_s2s_encryption)
}

fn item_not_found() -> Element {
    Element::new("error")
        .attr("type", "cancel")
        .child(Element::with_ns("item-not-found", ns::STANZA_ERRORS))
}

/// Validate an inbound server stream header and answer it. The domain pair
/// set by the first header may not change on restarts.
fn accept_header(ctx: &mut StreamCtx, el: &Element) -> Result<(), StreamError> {
    if !is_stream_header(el) {
        return Err(StreamError::NotAuthorized);
    }
    let to = el.get_attr("to").map(str::to_lowercase);
    let from = el.get_attr("from").map(str::to_lowercase);
    if ctx.domain.is_none() {
        ctx.domain = to.clone();
        ctx.remote_domain = from.clone();
    }
    ctx.send_header();

    if to != ctx.domain || from != ctx.remote_domain {
        return Err(StreamError::NotAuthorized);
    }
    let (Some(local), Some(remote)) = (to, from) else {
        return Err(StreamError::ImproperAddressing);
    };
    if Jid::domain_only(&local).is_err() || Jid::domain_only(&remote).is_err() {
        return Err(StreamError::ImproperAddressing);
    }
    if !ctx.node.config.is_vhost(&local) {
        return Err(StreamError::HostUnknown);
    }
    if !ctx.node.config.s2s_allowed(&local, &remote) {
        return Err(StreamError::NotAuthorized);
    }
    if el.get_attr("xmlns") != Some(ns::SERVER) {
        return Err(StreamError::InvalidNamespace);
    }
    Ok(())
}

/// Handle `<db:result>`: register this stream for the verdict and open an
/// authoritative connection to the asserted domain.
async fn start_dialback(ctx: &mut StreamCtx, el: &Element) -> Result<(), StreamError> {
    let key = el.text_content().trim();
    if el.get_attr("from") != ctx.remote_domain.as_deref()
        || el.get_attr("to") != ctx.domain.as_deref()
        || key.is_empty()
    {
        return Err(StreamError::NotAuthorized);
    }
    let (Some(local), Some(remote), Some(stream_id)) =
        (ctx.domain.clone(), ctx.remote_domain.clone(), ctx.stream_id.clone())
    else {
        return Err(StreamError::NotAuthorized);
    };
    if !ctx.node.router.register_for_handshake(&stream_id, ctx.handle(), None).await {
        return Err(StreamError::NotAuthorized);
    }

    debug!(session = ctx.handle().id(), stream_id = %stream_id, remote = %remote, "Verifying dialback key");
    let node = ctx.node.clone();
    let inbound = ctx.handle().clone();
    let purpose = Purpose::Verify { stream_id, key: key.to_owned() };
    tokio::spawn(async move {
        if connector::establish(&node, &local, &remote, purpose).await.is_none() {
            inbound.send(SessionCommand::Verdict(Verdict { outcome: VerdictOutcome::Error, from: local, to: remote }));
        }
    });
    Ok(())
}

/// Answer `<db:verify>` for one of our outbound streams.
async fn verify_dialback(ctx: &mut StreamCtx, el: &Element) -> Result<(), StreamError> {
    let (Some(from), Some(to), Some(id)) = (el.get_attr("from"), el.get_attr("to"), el.get_attr("id")) else {
        return Err(StreamError::NotAuthorized);
    };
    if Some(from) != ctx.remote_domain.as_deref() || Some(to) != ctx.domain.as_deref() {
        return Err(StreamError::NotAuthorized);
    }

    let reply = Element::new("db:verify").attr("from", to).attr("to", from).attr("id", id);
    let reply = match ctx.node.router.take_dialback_token(id).await {
        Some(token) => {
            let valid = token.verify(from, to, id, el.text_content().trim());
            debug!(session = ctx.handle().id(), stream_id = id, valid, "Answered dialback verification");
            reply.attr("type", if valid { "valid" } else { "invalid" })
        }
        None => {
            debug!(session = ctx.handle().id(), stream_id = id, "No dialback key for stream");
            reply.attr("type", "error").child(item_not_found())
        }
    };
    ctx.write(&reply);
    Ok(())
}

/// Route a stanza received from an authenticated peer.
async fn inbound_stanza(ctx: &mut StreamCtx, stanza: Element) -> Result<(), StreamError> {
    let from = stanza.get_attr("from").and_then(|f| Jid::parse(f).ok());
    let to = stanza.get_attr("to").and_then(|t| Jid::parse(t).ok());
    let (Some(from), Some(to)) = (from, to) else {
        return Err(StreamError::ImproperAddressing);
    };
    if Some(from.domain()) != ctx.remote_domain.as_deref() || !ctx.node.config.is_vhost(to.domain()) {
        return Err(StreamError::ImproperAddressing);
    }

    let node = ctx.node.clone();
    if stanza.name() == "iq" && to.is_domain() {
        if let Some(reply) = stanza::answer_server_iq(&stanza, to.domain()) {
            if let Err(e) = node.router.route(&node, reply).await {
                debug!(session = ctx.handle().id(), condition = e.condition(), "Server iq reply not routable");
            }
        }
        return Ok(());
    }
    if let Err(e) = node.router.route(&node, stanza.clone()).await {
        debug!(session = ctx.handle().id(), condition = e.condition(), "Bouncing inbound stanza");
        if let Some(reply) = e.reply_to(&stanza) {
            if let Err(e) = node.router.route(&node, reply).await {
                debug!(session = ctx.handle().id(), condition = e.condition(), "Bounce not routable");
            }
        }
    }
    Ok(())
}

/// SASL EXTERNAL from a peer whose certificate is trusted.
fn external(ctx: &mut StreamCtx, el: &Element) -> ServerState {
    let remote = ctx.remote_domain.clone().unwrap_or_default();
    let authzid = match el.text_content().trim() {
        "" | "=" => Some(String::new()),
        encoded => BASE64.decode(encoded).ok().and_then(|raw| String::from_utf8(raw).ok()),
    };
    let accepted = el.get_attr("mechanism") == Some("EXTERNAL")
        && ctx.peer_trust.is_trusted()
        && authzid.is_some_and(|id| id.is_empty() || id.eq_ignore_ascii_case(&remote));

    if !accepted {
        warn!(session = ctx.handle().id(), remote = %remote, "SASL EXTERNAL refused");
        ctx.write(&Element::with_ns("failure", ns::SASL).child(Element::new("not-authorized")));
        ctx.write_raw("</stream:stream>");
        ctx.close_after_writing();
        return ServerState::Auth;
    }
    ctx.write(&Element::with_ns("success", ns::SASL));
    ctx.reset();
    ServerState::FinalRestart
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::session::Role;
    use crate::session::testing::{TestSession, header, node, parse};
    use std::sync::Arc;
    use trellis_federation::{DialbackToken, PeerTrust};

    const HEADER: &str = "<stream:stream xmlns='jabber:server' xmlns:stream='http://etherx.jabber.org/streams' \
        xmlns:db='jabber:server:dialback' to='a.example' from='b.example' version='1.0'>";

    fn inbound(node: &Arc<Node>) -> TestSession {
        let mut s = TestSession::new(node, Role::Server);
        s.ctx.domain = Some("a.example".into());
        s.ctx.remote_domain = Some("b.example".into());
        s.ctx.stream_id = Some("in-1".into());
        s
    }

    #[tokio::test]
    async fn start_offers_dialback() {
        let node = node(&["a.example"]);
        let mut s = TestSession::new(&node, Role::Server);
        let state = ServerState::Start.handle(&mut s.ctx, header(HEADER)).await.unwrap();
        assert!(matches!(state, ServerState::AuthMethod { dialback_pending: false }));
        let out = s.written().concat();
        assert!(out.contains("from='a.example' to='b.example'"));
        assert!(out.contains("<dialback xmlns='urn:xmpp:features:dialback'/>"));
        assert!(!out.contains("starttls"));
    }

    #[tokio::test]
    async fn header_validation() {
        let node = node(&["a.example"]);
        let cases = [
            (HEADER.replace("to='a.example'", "to='z.example'"), StreamError::HostUnknown),
            (HEADER.replace(" from='b.example'", ""), StreamError::ImproperAddressing),
            (HEADER.replace("xmlns='jabber:server'", "xmlns='jabber:client'"), StreamError::InvalidNamespace),
            (HEADER.replace("from='b.example'", "from='a.example'"), StreamError::NotAuthorized),
        ];
        for (xml, expected) in cases {
            let mut s = TestSession::new(&node, Role::Server);
            let err = ServerState::Start.handle(&mut s.ctx, header(&xml)).await.unwrap_err();
            assert_eq!(err, expected, "{xml}");
            assert!(s.ctx.header_sent());
        }
    }

    #[tokio::test]
    async fn blacklisted_peer_is_not_authorized() {
        let mut config = trellis_common::config::AppConfig::with_hosts(["a.example"]);
        config.s2s.blacklist.push("b.example".into());
        let node = Node::builder(config).build().unwrap();
        let mut s = TestSession::new(&node, Role::Server);
        let err = ServerState::Start.handle(&mut s.ctx, header(HEADER)).await.unwrap_err();
        assert_eq!(err, StreamError::NotAuthorized);
    }

    #[tokio::test]
    async fn domain_change_across_restart_is_fatal() {
        let node = node(&["a.example", "c.example"]);
        let mut s = inbound(&node);
        s.ctx.peer_trust = PeerTrust::Trusted;
        let changed = HEADER.replace("to='a.example'", "to='c.example'");
        let err = ServerState::AuthRestart.handle(&mut s.ctx, header(&changed)).await.unwrap_err();
        assert_eq!(err, StreamError::NotAuthorized);
    }

    #[tokio::test]
    async fn trusted_peer_is_offered_external_after_restart() {
        let node = node(&["a.example"]);
        let mut s = inbound(&node);
        s.ctx.peer_trust = PeerTrust::Trusted;
        let state = ServerState::AuthRestart.handle(&mut s.ctx, header(HEADER)).await.unwrap();
        assert!(matches!(state, ServerState::Auth));
        assert!(s.written().concat().contains("<mechanism>EXTERNAL</mechanism>"));

        let auth = parse("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='EXTERNAL'>Yi5leGFtcGxl</auth>");
        let state = state.handle(&mut s.ctx, auth).await.unwrap();
        assert!(matches!(state, ServerState::FinalRestart));

        let state = state.handle(&mut s.ctx, header(HEADER)).await.unwrap();
        assert!(matches!(state, ServerState::Ready));
    }

    #[tokio::test]
    async fn external_for_another_domain_is_refused() {
        let node = node(&["a.example"]);
        let mut s = inbound(&node);
        s.ctx.peer_trust = PeerTrust::Trusted;
        // base64("c.example")
        let auth = parse("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='EXTERNAL'>Yy5leGFtcGxl</auth>");
        let state = ServerState::Auth.handle(&mut s.ctx, auth).await.unwrap();
        assert!(matches!(state, ServerState::Auth));
        assert!(s.written().concat().contains("<not-authorized/>"));
        assert!(s.ctx.is_closing());
    }

    #[tokio::test]
    async fn untrusted_peer_falls_back_to_dialback() {
        let node = node(&["a.example"]);
        let mut s = inbound(&node);
        s.ctx.peer_trust = PeerTrust::Untrusted;
        let state = ServerState::AuthRestart.handle(&mut s.ctx, header(HEADER)).await.unwrap();
        assert!(matches!(state, ServerState::AuthMethod { dialback_pending: false }));
        assert!(s.written().concat().contains("urn:xmpp:features:dialback"));
    }

    #[tokio::test]
    async fn restart_without_certificate_check_is_refused() {
        let node = node(&["a.example"]);
        let mut s = inbound(&node);
        let err = ServerState::AuthRestart.handle(&mut s.ctx, header(HEADER)).await.unwrap_err();
        assert!(matches!(err, StreamError::PolicyViolation(_)));
        assert!(!s.written().concat().contains("dialback"));
    }

    #[tokio::test]
    async fn db_verify_answers_valid_then_error() {
        let node = node(&["a.example"]);
        let (outbound, _rx) = crate::session::SessionHandle::new();
        let token = DialbackToken::generate("a.example", "b.example", "out-1");
        node.router.register_for_handshake("out-1", &outbound, Some(token.clone())).await;

        let mut s = inbound(&node);
        let verify = format!(
            "<db:verify from='b.example' to='a.example' id='out-1'>{}</db:verify>",
            token.key()
        );
        let state = ServerState::AuthMethod { dialback_pending: false };
        let state = state.handle(&mut s.ctx, parse(&verify)).await.unwrap();
        assert_eq!(
            s.written(),
            vec!["<db:verify from='a.example' to='b.example' id='out-1' type='valid'/>".to_owned()]
        );

        state.handle(&mut s.ctx, parse(&verify)).await.unwrap();
        let out = s.written().concat();
        assert!(out.contains("type='error'"));
        assert!(out.contains("<item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>"));
    }

    #[tokio::test]
    async fn db_verify_with_mutated_key_is_invalid() {
        let node = node(&["a.example"]);
        let (outbound, _rx) = crate::session::SessionHandle::new();
        let token = DialbackToken::generate("a.example", "b.example", "out-1");
        node.router.register_for_handshake("out-1", &outbound, Some(token.clone())).await;

        let mut key = token.key();
        let last = if key.ends_with('0') { "1" } else { "0" };
        key.replace_range(key.len() - 1.., last);

        let mut s = inbound(&node);
        let verify = format!("<db:verify from='b.example' to='a.example' id='out-1'>{key}</db:verify>");
        ServerState::Ready.handle(&mut s.ctx, parse(&verify)).await.unwrap();
        assert!(s.written().concat().contains("type='invalid'"));
    }

    #[tokio::test]
    async fn db_result_with_wrong_domains_is_not_authorized() {
        let node = node(&["a.example"]);
        let mut s = inbound(&node);
        let result = parse("<db:result from='c.example' to='a.example'>abc</db:result>");
        let state = ServerState::AuthMethod { dialback_pending: false };
        assert_eq!(state.handle(&mut s.ctx, result).await.unwrap_err(), StreamError::NotAuthorized);
    }

    #[tokio::test]
    async fn second_db_result_while_pending_is_not_authorized() {
        let node = node(&["a.example"]);
        let mut s = inbound(&node);
        let result = parse("<db:result from='b.example' to='a.example'>abc</db:result>");
        let state = ServerState::AuthMethod { dialback_pending: true };
        assert_eq!(state.handle(&mut s.ctx, result).await.unwrap_err(), StreamError::NotAuthorized);
    }

    #[tokio::test]
    async fn verdicts_complete_or_close_the_stream() {
        let node = node(&["a.example"]);
        let verdict = |outcome| Verdict { outcome, from: "a.example".into(), to: "b.example".into() };

        let mut s = inbound(&node);
        let state = ServerState::AuthMethod { dialback_pending: true }
            .on_verdict(&mut s.ctx, verdict(VerdictOutcome::Valid))
            .await;
        assert!(matches!(state, ServerState::Ready));
        assert_eq!(s.written(), vec!["<db:result from='a.example' to='b.example' type='valid'/>".to_owned()]);

        let mut s = inbound(&node);
        ServerState::AuthMethod { dialback_pending: true }
            .on_verdict(&mut s.ctx, verdict(VerdictOutcome::Invalid))
            .await;
        assert!(s.written().concat().contains("type='invalid'"));
        assert!(s.ctx.is_closing());

        let mut s = inbound(&node);
        let state = ServerState::Start.on_verdict(&mut s.ctx, verdict(VerdictOutcome::Valid)).await;
        assert!(matches!(state, ServerState::Start));
        assert!(s.written().is_empty());
    }

    #[tokio::test]
    async fn unroutable_replies_keep_the_stream_open() {
        let mut config = trellis_common::config::AppConfig::with_hosts(["a.example"]);
        config.hosts.get_mut("a.example").unwrap().cross_domain_messages = false;
        let node = Node::builder(config).build().unwrap();
        let mut s = inbound(&node);

        let mut framer = crate::framer::StreamFramer::new(4096);
        framer.feed(HEADER.as_bytes());
        framer.next_frame().unwrap();
        framer.feed(
            b"<iq type='get' id='p1' from='b.example' to='a.example'><ping xmlns='urn:xmpp:ping'/></iq>\
              <message from='bob@b.example' to='nobody@a.example' id='m1'><body>x</body></message>",
        );
        for _ in 0..2 {
            let Some(crate::framer::Frame::Element(stanza)) = framer.next_frame().unwrap() else { panic!() };
            let state = ServerState::Ready.handle(&mut s.ctx, stanza).await.unwrap();
            assert!(matches!(state, ServerState::Ready));
        }
        assert!(!s.ctx.is_closing());
        assert!(s.written().is_empty());
    }

    #[tokio::test]
    async fn ready_rejects_spoofed_sender_domain() {
        let node = node(&["a.example"]);
        let mut s = inbound(&node);
        let mut framer = crate::framer::StreamFramer::new(4096);
        framer.feed(HEADER.as_bytes());
        framer.next_frame().unwrap();
        framer.feed(b"<message from='mallory@c.example' to='alice@a.example'><body>x</body></message>");
        let Some(crate::framer::Frame::Element(msg)) = framer.next_frame().unwrap() else { panic!() };
        let err = ServerState::Ready.handle(&mut s.ctx, msg).await.unwrap_err();
        assert_eq!(err, StreamError::ImproperAddressing);
    }
}
