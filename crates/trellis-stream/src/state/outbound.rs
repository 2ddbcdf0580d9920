//! Outbound server (s2s) negotiation.
//!
//! An outbound stream is opened for one of two purposes: to carry stanzas
//! from a local domain to a remote one, or to ask a remote domain whether a
//! dialback key presented on one of our inbound streams is genuine. The
//! second kind never authenticates; it sends `<db:verify>`, relays the
//! answer to the inbound session and closes.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, info, warn};
use trellis_common::xml::Element;
use trellis_common::{StreamError, ns};
use trellis_federation::DialbackToken;

use super::is_stream_header;
use crate::session::{SessionCommand, StreamCtx, Verdict, VerdictOutcome};

/// Why an outbound stream is being opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Purpose {
    /// Authenticate and carry stanzas.
    Route,
    /// Verify the dialback key received on inbound stream `stream_id`.
    Verify { stream_id: String, key: String },
}

#[derive(Debug)]
pub enum OutboundState {
    /// Header sent; waiting for the peer's header.
    Start { purpose: Purpose },
    /// Waiting for the first features.
    Auth,
    /// STARTTLS requested; waiting for `<proceed/>`.
    TlsResult,
    /// Encrypted; waiting for the peer's new header.
    AuthRestart,
    /// Trusted peer; waiting for features offering EXTERNAL.
    AuthExternal,
    AuthExternalResult,
    /// SASL succeeded; waiting for the peer's header, then its features.
    FinalRestart { header_received: bool },
    /// `<db:result>` sent; waiting for the verdict.
    AuthDialbackResult,
    /// Verification channel for inbound stream `inbound_id`.
    Authoritative { inbound_id: String },
    Ready,
}

impl OutboundState {
    pub async fn handle(self, ctx: &mut StreamCtx, el: Element) -> Result<OutboundState, StreamError> {
        match self {
            Self::Start { purpose } => {
                adopt_header(ctx, &el)?;
                match purpose {
                    Purpose::Route => Ok(Self::Auth),
                    Purpose::Verify { stream_id, key } => {
                        let request = Element::new("db:verify")
                            .attr("from", ctx.domain.clone().unwrap_or_default())
                            .attr("to", ctx.remote_domain.clone().unwrap_or_default())
                            .attr("id", stream_id.as_str())
                            .text(key);
                        ctx.write(&request);
                        ctx.pending_verdict = Some(stream_id.clone());
                        ctx.notify_connected();
                        Ok(Self::Authoritative { inbound_id: stream_id })
                    }
                }
            }
            Self::Auth => {
                if !el.is("features", ns::STREAM) {
                    return Err(StreamError::NotAuthorized);
                }
                let tls = el.find_child("starttls", ns::TLS);
                ctx.outbound_tls_required = tls.is_some_and(|t| t.children().iter().any(|c| c.name() == "required"));
                if tls.is_some() && !ctx.encrypted {
                    ctx.write(&Element::with_ns("starttls", ns::TLS));
                    return Ok(Self::TlsResult);
                }
                if !ctx.encrypted && ctx.vhost().is_some_and(|h| h.force_s2s_encryption) {
                    return Err(StreamError::PolicyViolation("peer does not offer STARTTLS".into()));
                }
                if el.has_child("dialback", ns::DIALBACK) {
                    send_dialback(ctx).await?;
                    return Ok(Self::AuthDialbackResult);
                }
                Err(StreamError::NotAuthorized)
            }
            Self::TlsResult => {
                if el.is("proceed", ns::TLS) {
                    ctx.encrypt();
                    ctx.reset();
                    ctx.send_header();
                    return Ok(Self::AuthRestart);
                }
                if el.is("failure", ns::TLS) {
                    warn!(session = ctx.handle().id(), remote = ?ctx.remote_domain, "Peer refused STARTTLS");
                    give_up(ctx);
                    return Ok(self);
                }
                Err(StreamError::NotAuthorized)
            }
            Self::AuthRestart => {
                adopt_header(ctx, &el)?;
                if ctx.peer_trust.is_trusted() {
                    return Ok(Self::AuthExternal);
                }
                if ctx.peer_trust.needs_dialback() && !ctx.outbound_tls_required {
                    return Ok(Self::Auth);
                }
                warn!(
                    session = ctx.handle().id(),
                    remote = ?ctx.remote_domain,
                    "Peer certificate not trusted and dialback not permitted"
                );
                ctx.reject_connect();
                ctx.close();
                Ok(self)
            }
            Self::AuthExternal => {
                if !el.is("features", ns::STREAM) {
                    return Err(StreamError::NotAuthorized);
                }
                if offers_external(&el) {
                    let authzid = BASE64.encode(ctx.domain.clone().unwrap_or_default());
                    ctx.write(&Element::with_ns("auth", ns::SASL).attr("mechanism", "EXTERNAL").text(authzid));
                    return Ok(Self::AuthExternalResult);
                }
                if el.has_child("dialback", ns::DIALBACK) {
                    send_dialback(ctx).await?;
                    return Ok(Self::AuthDialbackResult);
                }
                Err(StreamError::NotAuthorized)
            }
            Self::AuthExternalResult => {
                if el.is("success", ns::SASL) {
                    ctx.reset();
                    ctx.send_header();
                    return Ok(Self::FinalRestart { header_received: false });
                }
                if el.is("failure", ns::SASL) {
                    warn!(session = ctx.handle().id(), remote = ?ctx.remote_domain, "SASL EXTERNAL refused");
                    give_up(ctx);
                    return Ok(self);
                }
                Err(StreamError::NotAuthorized)
            }
            Self::FinalRestart { header_received: false } => {
                adopt_header(ctx, &el)?;
                Ok(Self::FinalRestart { header_received: true })
            }
            Self::FinalRestart { header_received: true } => {
                if !el.is("features", ns::STREAM) {
                    return Err(StreamError::NotAuthorized);
                }
                connected(ctx, "SASL EXTERNAL");
                Ok(Self::Ready)
            }
            Self::AuthDialbackResult => {
                if !el.is("result", ns::LEGACY_DIALBACK)
                    || el.get_attr("from") != ctx.remote_domain.as_deref()
                    || el.get_attr("to") != ctx.domain.as_deref()
                {
                    ctx.reject_connect();
                    return Err(StreamError::NotAuthorized);
                }
                match el.get_attr("type") {
                    Some("valid") => {
                        if let Some(id) = ctx.stream_id.clone() {
                            ctx.node.router.remove_handshake(&id, ctx.handle()).await;
                        }
                        connected(ctx, "dialback");
                        Ok(Self::Ready)
                    }
                    Some("invalid") => {
                        warn!(session = ctx.handle().id(), remote = ?ctx.remote_domain, "Dialback key rejected by peer");
                        give_up(ctx);
                        Ok(self)
                    }
                    _ => {
                        ctx.reject_connect();
                        Err(StreamError::NotAuthorized)
                    }
                }
            }
            Self::Authoritative { inbound_id } => {
                if el.is("features", ns::STREAM) {
                    return Ok(Self::Authoritative { inbound_id });
                }
                if !el.is("verify", ns::LEGACY_DIALBACK) || el.get_attr("id") != Some(inbound_id.as_str()) {
                    return Err(StreamError::NotAuthorized);
                }
                // The answer must come back for the exact pair we asked about.
                if el.get_attr("from") != ctx.remote_domain.as_deref() || el.get_attr("to") != ctx.domain.as_deref() {
                    return Err(StreamError::NotAuthorized);
                }
                let Some(inbound) = ctx.node.router.stream_by_id(&inbound_id).await else {
                    return Err(StreamError::NotAuthorized);
                };
                let outcome = match el.get_attr("type") {
                    Some("valid") => VerdictOutcome::Valid,
                    Some("invalid") => VerdictOutcome::Invalid,
                    _ => VerdictOutcome::Error,
                };
                debug!(session = ctx.handle().id(), stream_id = %inbound_id, ?outcome, "Dialback verification answered");
                inbound.send(SessionCommand::Verdict(Verdict {
                    outcome,
                    from: ctx.domain.clone().unwrap_or_default(),
                    to: ctx.remote_domain.clone().unwrap_or_default(),
                }));
                ctx.pending_verdict = None;
                ctx.write_raw("</stream:stream>");
                ctx.close_after_writing();
                Ok(Self::Authoritative { inbound_id })
            }
            Self::Ready => {
                debug!(session = ctx.handle().id(), name = el.name(), "Ignoring input on outbound stream");
                Ok(self)
            }
        }
    }
}

/// Check the peer's header and take its stream id, which the dialback key
/// covers.
fn adopt_header(ctx: &mut StreamCtx, el: &Element) -> Result<(), StreamError> {
    if !is_stream_header(el) {
        return Err(StreamError::NotAuthorized);
    }
    if el.get_attr("xmlns") != Some(ns::SERVER) {
        return Err(StreamError::InvalidNamespace);
    }
    let id = el.get_attr("id").filter(|id| !id.is_empty()).ok_or(StreamError::NotAuthorized)?;
    ctx.stream_id = Some(id.to_owned());
    Ok(())
}

fn offers_external(features: &Element) -> bool {
    features.find_child("mechanisms", ns::SASL).is_some_and(|m| {
        m.children()
            .iter()
            .any(|c| c.name() == "mechanism" && c.text_content().trim() == "EXTERNAL")
    })
}

/// Send `<db:result>` with a fresh key and park its token under the stream id.
async fn send_dialback(ctx: &mut StreamCtx) -> Result<(), StreamError> {
    let (Some(local), Some(remote), Some(id)) = (ctx.domain.clone(), ctx.remote_domain.clone(), ctx.stream_id.clone())
    else {
        return Err(StreamError::NotAuthorized);
    };
    let token = DialbackToken::generate(&local, &remote, &id);
    let key = token.key();
    if !ctx.node.router.register_for_handshake(&id, ctx.handle(), Some(token)).await {
        return Err(StreamError::NotAuthorized);
    }
    ctx.write(&Element::new("db:result").attr("from", local).attr("to", remote).text(key));
    Ok(())
}

fn connected(ctx: &mut StreamCtx, method: &str) {
    info!(
        session = ctx.handle().id(),
        domain = ?ctx.domain,
        remote = ?ctx.remote_domain,
        method,
        "Outbound server stream authenticated"
    );
    ctx.notify_connected();
}

/// The peer refused us: report it and end the stream.
fn give_up(ctx: &mut StreamCtx) {
    ctx.reject_connect();
    ctx.write_raw("</stream:stream>");
    ctx.close_after_writing();
}
