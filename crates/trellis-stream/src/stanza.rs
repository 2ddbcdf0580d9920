//! Message, presence and iq handling for bound client sessions, and local
//! delivery for stanzas from any source.

use std::sync::Arc;

use chrono::SecondsFormat;
use tracing::{debug, warn};
use trellis_common::xml::Element;
use trellis_common::{Jid, StanzaError, StreamError, ns};

use crate::node::Node;
use crate::session::{SessionCommand, StreamCtx};

const MESSAGE_TYPES: &[&str] = &["chat", "error", "groupchat", "headline", "normal"];
const IQ_TYPES: &[&str] = &["get", "set", "result", "error"];

/// Handle a top-level element on a bound client stream.
pub async fn handle(ctx: &mut StreamCtx, mut stanza: Element) -> Result<(), StreamError> {
    if !matches!(stanza.name(), "message" | "presence" | "iq") || stanza.ns() != Some(ns::CLIENT) {
        return Err(StreamError::UnsupportedStanzaType);
    }
    let jid = ctx.jid.clone().ok_or(StreamError::NotAuthorized)?;
    stanza.set_attr("from", jid.to_string());

    if stanza.to_xml().len() > ctx.node.config.client.max_stanza_size {
        reject(ctx, &stanza, StanzaError::PolicyViolation);
        return Ok(());
    }

    match stanza.name() {
        "message" => message(ctx, &jid, stanza).await,
        "presence" => presence(ctx, &jid, stanza).await,
        _ => iq(ctx, &jid, stanza).await,
    }
    Ok(())
}

fn reject(ctx: &mut StreamCtx, stanza: &Element, error: StanzaError) {
    debug!(session = ctx.handle().id(), condition = error.condition(), "Stanza rejected");
    if let Some(reply) = error.reply_to(stanza) {
        ctx.write(&reply);
    }
}

async fn route(ctx: &mut StreamCtx, stanza: Element) {
    let node = ctx.node.clone();
    if let Err(e) = node.router.route(&node, stanza.clone()).await {
        reject(ctx, &stanza, e);
    }
}

async fn message(ctx: &mut StreamCtx, jid: &Jid, mut stanza: Element) {
    if stanza.get_attr("type").is_some_and(|t| !MESSAGE_TYPES.contains(&t)) {
        reject(ctx, &stanza, StanzaError::BadRequest);
        return;
    }
    if stanza.get_attr("to").is_none() {
        stanza.set_attr("to", jid.bare().to_string());
    }
    route(ctx, stanza).await;
}

async fn presence(ctx: &mut StreamCtx, jid: &Jid, stanza: Element) {
    if stanza.get_attr("to").is_some() {
        route(ctx, stanza).await;
        return;
    }

    let available = match stanza.get_attr("type") {
        None => true,
        Some("unavailable") => false,
        Some(other) => {
            debug!(session = ctx.handle().id(), kind = other, "Ignoring undirected presence");
            return;
        }
    };
    let priority = child(&stanza, "priority")
        .and_then(|p| p.text_content().trim().parse::<i8>().ok())
        .unwrap_or(0);

    let node = ctx.node.clone();
    node.router.set_presence(jid, ctx.handle(), available, priority).await;
    ctx.available = available;

    for peer in node.router.sessions(jid).await {
        if peer.handle != *ctx.handle() {
            peer.handle.send(SessionCommand::Deliver(stanza.clone().attr("to", peer.jid.to_string())));
        }
    }

    if available && priority >= 0 && !ctx.offline_delivered {
        deliver_offline(ctx, jid).await;
    }
}

/// Flush stored messages to a newly available resource.
async fn deliver_offline(ctx: &mut StreamCtx, jid: &Jid) {
    ctx.offline_delivered = true;
    let Some(storage) = ctx.storage() else { return };
    let messages = match storage.find_messages(jid).await {
        Ok(messages) => messages,
        Err(e) => {
            warn!(jid = %jid, error = %e, "Cannot load offline messages");
            return;
        }
    };
    for stored in messages {
        let msg = Element::new("message")
            .attr("from", stored.from.to_string())
            .attr("to", jid.to_string())
            .attr("type", "chat")
            .child(Element::new("body").text(stored.body))
            .child(
                Element::with_ns("delay", ns::DELAY)
                    .attr("from", jid.domain())
                    .attr("stamp", stored.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        ctx.write(&msg);
        if let Err(e) = storage.destroy_message(stored.id).await {
            warn!(id = stored.id, error = %e, "Cannot delete delivered offline message");
        }
    }
}

async fn iq(ctx: &mut StreamCtx, jid: &Jid, stanza: Element) {
    let valid = stanza.get_attr("id").is_some_and(|id| !id.is_empty())
        && stanza.get_attr("type").is_some_and(|t| IQ_TYPES.contains(&t));
    if !valid {
        reject(ctx, &stanza, StanzaError::BadRequest);
        return;
    }

    let to_server = match stanza.get_attr("to") {
        None => true,
        Some(to) => Jid::parse(to).is_ok_and(|to| to == jid.bare() || (to.is_domain() && to.domain() == jid.domain())),
    };
    if !to_server {
        route(ctx, stanza).await;
        return;
    }
    if let Some(reply) = answer_server_iq(&stanza, jid.domain()) {
        ctx.write(&reply);
    }
}

/// Reply to an iq addressed to the server itself. Results and errors get
/// no reply.
pub fn answer_server_iq(stanza: &Element, server: &str) -> Option<Element> {
    let kind = stanza.get_attr("type")?;
    if kind != "get" && kind != "set" {
        return None;
    }
    let supported = stanza.children().first().is_some_and(|payload| {
        (kind == "get" && payload.is("ping", ns::PING)) || (kind == "set" && payload.is("session", ns::SESSION))
    });
    if !supported {
        return StanzaError::ServiceUnavailable.reply_to(stanza);
    }

    let mut reply = Element::new("iq").attr("type", "result");
    if let Some(id) = stanza.get_attr("id") {
        reply.set_attr("id", id);
    }
    reply.set_attr("from", stanza.get_attr("to").unwrap_or(server));
    if let Some(from) = stanza.get_attr("from") {
        reply.set_attr("to", from);
    }
    Some(reply)
}

/// Child of `stanza` named `name` in the stanza's own namespace.
fn child<'a>(stanza: &'a Element, name: &str) -> Option<&'a Element> {
    stanza.children().iter().find(|c| c.name() == name && c.ns() == stanza.ns())
}

/// Deliver to sessions bound on this node. `to` must be on a local virtual host.
pub async fn deliver_local(node: &Arc<Node>, stanza: Element, to: &Jid) -> Result<(), StanzaError> {
    if to.is_domain() {
        return match stanza.name() {
            "iq" => Err(StanzaError::ServiceUnavailable),
            _ => Ok(()),
        };
    }
    let sessions = node.router.sessions(to).await;

    if let Some(resource) = to.resource() {
        if let Some(target) = sessions.iter().find(|s| s.jid.resource() == Some(resource)) {
            target.handle.send(SessionCommand::Deliver(stanza));
            return Ok(());
        }
        return match stanza.name() {
            "message" => deliver_to_account(node, stanza, to).await,
            "iq" => Err(StanzaError::ServiceUnavailable),
            _ => Ok(()),
        };
    }

    match stanza.name() {
        "message" => deliver_to_account(node, stanza, to).await,
        "presence" => {
            for session in sessions.iter().filter(|s| s.available) {
                session.handle.send(SessionCommand::Deliver(stanza.clone()));
            }
            Ok(())
        }
        _ => Err(StanzaError::ServiceUnavailable),
    }
}

/// Message to a bare account: every available resource with non-negative
/// priority, or offline storage when there is none.
async fn deliver_to_account(node: &Arc<Node>, stanza: Element, to: &Jid) -> Result<(), StanzaError> {
    let targets: Vec<_> = node
        .router
        .sessions(to)
        .await
        .into_iter()
        .filter(|s| s.available && s.priority >= 0)
        .collect();
    if !targets.is_empty() {
        for target in targets {
            target.handle.send(SessionCommand::Deliver(stanza.clone()));
        }
        return Ok(());
    }

    let bare = to.bare();
    let storage = node.storage(bare.domain()).ok_or(StanzaError::ServiceUnavailable)?;
    match storage.find_user(&bare).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(StanzaError::ItemNotFound),
        Err(e) => {
            warn!(jid = %bare, error = %e, "User lookup failed");
            return Err(StanzaError::ServiceUnavailable);
        }
    }

    let storable = matches!(stanza.get_attr("type").unwrap_or("normal"), "chat" | "normal");
    let body = child(&stanza, "body").map(|b| b.text_content().to_owned()).unwrap_or_default();
    let limit = node.config.vhost(bare.domain()).map_or(0, |h| h.max_offline_msgs) as usize;
    if !storable || body.is_empty() || limit == 0 {
        return Err(StanzaError::ServiceUnavailable);
    }
    let from = stanza
        .get_attr("from")
        .and_then(|f| Jid::parse(f).ok())
        .ok_or(StanzaError::BadRequest)?;

    let stored = storage.find_messages(&bare).await.map_err(|_| StanzaError::ServiceUnavailable)?;
    if stored.len() >= limit {
        debug!(jid = %bare, limit, "Offline queue full");
        return Err(StanzaError::ServiceUnavailable);
    }
    storage.save_message(&from, &bare, &body).await.map_err(|e| {
        warn!(jid = %bare, error = %e, "Cannot store offline message");
        StanzaError::ServiceUnavailable
    })?;
    debug!(from = %from, to = %bare, "Stored offline message");
    Ok(())
}
