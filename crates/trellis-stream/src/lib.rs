//! # trellis-stream
//!
//! Connection lifecycle for Trellis. Handles:
//! - Framing the XML stream into headers and top-level elements
//! - Client (c2s) negotiation: STARTTLS, SASL PLAIN, resource binding
//! - Server (s2s) negotiation in both directions: STARTTLS, SASL EXTERNAL,
//!   server dialback and the authoritative verification channel
//! - Routing stanzas between local sessions and remote domains
//! - Outbound connection establishment with SRV discovery and failover
//!
//! Every connection runs as one [`session::Session`] task. The task owns the
//! transport and the current protocol state, handles one element at a time
//! and awaits any storage or network work inside the state handler, so no
//! further input is looked at until that state transition has finished.

pub mod connector;
pub mod framer;
pub mod listener;
pub mod node;
pub mod router;
pub mod session;
pub mod stanza;
pub mod state;
pub mod tls;

pub use connector::{Dial, TcpDialer};
pub use node::{Node, NodeBuilder};
pub use router::Router;
pub use session::{Role, SessionCommand, SessionHandle};
pub use state::outbound::Purpose;
