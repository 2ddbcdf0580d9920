//! Protocol error vocabulary.
//!
//! Uses `thiserror` for ergonomic error definitions and provides wire-ready
//! variants that render directly to stream- or stanza-level error elements.

use crate::ns;
use crate::xml::Element;

/// Stream-level fault. Always fatal: the session writes the error element,
/// closes the stream and drops the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("bad format")]
    BadFormat,

    #[error("host unknown")]
    HostUnknown,

    #[error("improper addressing")]
    ImproperAddressing,

    #[error("invalid namespace")]
    InvalidNamespace,

    #[error("not authorized")]
    NotAuthorized,

    #[error("XML not well-formed")]
    NotWellFormed,

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("resource constraint")]
    ResourceConstraint,

    #[error("unsupported stanza type")]
    UnsupportedStanzaType,

    #[error("internal error: {0}")]
    Internal(String),
}

impl StreamError {
    /// Condition element name defined by the stream error namespace.
    pub fn condition(&self) -> &'static str {
        match self {
            Self::BadFormat => "bad-format",
            Self::HostUnknown => "host-unknown",
            Self::ImproperAddressing => "improper-addressing",
            Self::InvalidNamespace => "invalid-namespace",
            Self::NotAuthorized => "not-authorized",
            Self::NotWellFormed => "not-well-formed",
            Self::PolicyViolation(_) => "policy-violation",
            Self::ResourceConstraint => "resource-constraint",
            Self::UnsupportedStanzaType => "unsupported-stanza-type",
            Self::Internal(_) => "undefined-condition",
        }
    }

    /// `<stream:error>` element followed by the stream close tag.
    pub fn to_xml(&self) -> String {
        let error = Element::new("stream:error")
            .child(Element::with_ns(self.condition(), ns::STREAM_ERRORS));
        format!("{}</stream:stream>", error.to_xml())
    }
}

/// The `type` attribute of a stanza `<error>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    Auth,
    Cancel,
    Modify,
    Wait,
}

impl StanzaErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

/// Stanza-level fault. Converted into an error reply to the sender; the
/// session stays open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StanzaError {
    #[error("bad request")]
    BadRequest,

    #[error("feature not implemented")]
    FeatureNotImplemented,

    #[error("item not found")]
    ItemNotFound,

    #[error("not acceptable")]
    NotAcceptable,

    #[error("policy violation")]
    PolicyViolation,

    #[error("remote server not found")]
    RemoteServerNotFound,

    #[error("resource constraint")]
    ResourceConstraint,

    #[error("service unavailable")]
    ServiceUnavailable,
}

impl StanzaError {
    pub fn condition(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::ItemNotFound => "item-not-found",
            Self::NotAcceptable => "not-acceptable",
            Self::PolicyViolation => "policy-violation",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
        }
    }

    pub fn error_type(&self) -> StanzaErrorType {
        match self {
            Self::BadRequest | Self::NotAcceptable | Self::PolicyViolation => StanzaErrorType::Modify,
            Self::ResourceConstraint => StanzaErrorType::Wait,
            Self::FeatureNotImplemented
            | Self::ItemNotFound
            | Self::RemoteServerNotFound
            | Self::ServiceUnavailable => StanzaErrorType::Cancel,
        }
    }

    /// The `<error>` child appended to a bounced stanza.
    pub fn to_element(&self) -> Element {
        Element::new("error")
            .attr("type", self.error_type().as_str())
            .child(Element::with_ns(self.condition(), ns::STANZA_ERRORS))
    }

    /// Build the error reply for `stanza`: addresses swapped, `type='error'`,
    /// original payload kept. Returns `None` for stanzas that are already
    /// errors, which must never be answered with another error.
    pub fn reply_to(&self, stanza: &Element) -> Option<Element> {
        if stanza.get_attr("type") == Some("error") {
            return None;
        }
        let mut reply = stanza.clone();
        let to = reply.remove_attr("to");
        let from = reply.remove_attr("from");
        if let Some(from) = from {
            reply.set_attr("to", from);
        }
        if let Some(to) = to {
            reply.set_attr("from", to);
        }
        reply.set_attr("type", "error");
        reply.push_child(self.to_element());
        Some(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_error_renders_condition_and_close() {
        assert_eq!(
            StreamError::HostUnknown.to_xml(),
            "<stream:error><host-unknown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error></stream:stream>"
        );
    }

    #[test]
    fn stanza_error_swaps_addresses() {
        let msg = Element::new("message")
            .attr("from", "alice@a.example/tea")
            .attr("to", "bob@b.example")
            .attr("id", "m1");
        let reply = StanzaError::RemoteServerNotFound.reply_to(&msg).unwrap();
        assert_eq!(reply.get_attr("to"), Some("alice@a.example/tea"));
        assert_eq!(reply.get_attr("from"), Some("bob@b.example"));
        assert_eq!(reply.get_attr("type"), Some("error"));
        assert_eq!(reply.get_attr("id"), Some("m1"));
        let error = reply.children().last().unwrap();
        assert_eq!(error.get_attr("type"), Some("cancel"));
        assert!(error.has_child("remote-server-not-found", ns::STANZA_ERRORS));
    }

    #[test]
    fn error_stanzas_are_never_bounced() {
        let msg = Element::new("message").attr("type", "error");
        assert!(StanzaError::ItemNotFound.reply_to(&msg).is_none());
    }
}
