//! Protocol state machines, one per session role.
//!
//! A state consumes one element and returns its successor, or a
//! [`StreamError`] that ends the stream. States never touch the transport;
//! everything they want done is recorded on the [`StreamCtx`].

pub mod client;
pub mod outbound;
pub mod server;

use trellis_common::xml::Element;
use trellis_common::{StreamError, ns};
use tracing::debug;

use crate::session::{SessionCommand, StreamCtx};
use client::ClientState;
use outbound::OutboundState;
use server::ServerState;

#[derive(Debug, Default)]
pub enum StreamState {
    Client(ClientState),
    Server(ServerState),
    Outbound(OutboundState),
    /// Stream ended; further input is ignored.
    #[default]
    Closed,
}

impl StreamState {
    pub async fn handle(self, ctx: &mut StreamCtx, el: Element) -> Result<StreamState, StreamError> {
        Ok(match self {
            Self::Client(state) => Self::Client(state.handle(ctx, el).await?),
            Self::Server(state) => Self::Server(state.handle(ctx, el).await?),
            Self::Outbound(state) => Self::Outbound(state.handle(ctx, el).await?),
            Self::Closed => Self::Closed,
        })
    }

    /// Apply a command sent by another task.
    pub async fn command(self, ctx: &mut StreamCtx, command: SessionCommand) -> Result<StreamState, StreamError> {
        match (self, command) {
            (Self::Client(ClientState::Ready), SessionCommand::Deliver(stanza)) => {
                ctx.write(&outgoing(stanza));
                Ok(Self::Client(ClientState::Ready))
            }
            (Self::Outbound(OutboundState::Ready), SessionCommand::Deliver(stanza)) => {
                ctx.write(&outgoing(stanza));
                Ok(Self::Outbound(OutboundState::Ready))
            }
            (Self::Server(state), SessionCommand::Verdict(verdict)) => {
                Ok(Self::Server(state.on_verdict(ctx, verdict).await))
            }
            (state, command) => {
                debug!(session = ctx.handle().id(), ?command, "Command not applicable in current state");
                Ok(state)
            }
        }
    }
}

/// Drop a content namespace declaration so the stanza takes on the
/// default namespace of the stream it is written to.
fn outgoing(mut stanza: Element) -> Element {
    if matches!(stanza.get_attr("xmlns"), Some(ns::CLIENT | ns::SERVER)) {
        stanza.remove_attr("xmlns");
    }
    stanza
}

pub(crate) fn is_stream_header(el: &Element) -> bool {
    el.is("stream", ns::STREAM)
}

/// `<stream:features>` with the given children.
pub(crate) fn features(children: impl IntoIterator<Item = Element>) -> Element {
    children.into_iter().fold(Element::new("stream:features"), Element::child)
}

/// `<mechanisms>` listing SASL mechanisms.
pub(crate) fn mechanisms(names: &[&str]) -> Element {
    names.iter().fold(Element::with_ns("mechanisms", ns::SASL), |el, name| {
        el.child(Element::new("mechanism").text(*name))
    })
}

pub(crate) fn starttls(required: bool) -> Element {
    let el = Element::with_ns("starttls", ns::TLS);
    if required { el.child(Element::new("required")) } else { el }
}
