//! # trellis-federation
//!
//! Server-to-server (S2S) trust and discovery primitives for Trellis.
//!
//! ## Architecture
//!
//! Federation lets a Trellis node exchange stanzas with other domains over
//! outbound and inbound `jabber:server` streams:
//!
//! ```text
//!  a.example                              b.example
//!      │ ── stream header ────────────────►   │
//!      │ ◄─ features (starttls, dialback) ─   │
//!      │ ── db:result (key) ──────────────►   │
//!      │                                      │ ── authoritative stream ──► a.example
//!      │                                      │ ── db:verify (key) ───────► a.example
//!      │                                      │ ◄─ db:verify type=valid ─── a.example
//!      │ ◄─ db:result type=valid ─────────    │
//! ```
//!
//! ## Key concepts
//!
//! - **Dialback** (`dialback.rs`): per-stream secrets and the keyed hash a
//!   receiving server relays back to the originating domain for verification.
//! - **Discovery** (`discovery.rs`): resolves `_xmpp-server._tcp.<domain>` SRV
//!   records into an ordered candidate list, falling back to `<domain>:5269`.
//! - **Trust** (`trust.rs`): decides whether a peer's TLS certificate chain
//!   is trusted for the domain it asserts (configured roots, self-signed
//!   acceptance, pinned fingerprints).

pub mod dialback;
pub mod discovery;
pub mod error;
pub mod trust;

pub use dialback::DialbackToken;
pub use discovery::{Candidate, DnsResolver, SrvRecord, SrvResolver};
pub use error::FederationError;
pub use trust::{PeerTrust, TrustStore};
