//! # trellis-common
//!
//! Shared types, configuration, error vocabulary, and utilities used across all Trellis crates.
//! This is the foundation layer: no connection logic, only primitives and contracts.

pub mod config;
pub mod error;
pub mod jid;
pub mod ns;
pub mod xml;

pub use error::{StanzaError, StanzaErrorType, StreamError};
pub use jid::Jid;
pub use xml::Element;
