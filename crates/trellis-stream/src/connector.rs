//! Outbound server-to-server connection establishment.
//!
//! A remote domain is resolved into an ordered candidate list (SRV records,
//! or the domain itself on port 5269). Candidates are tried in order, each
//! once, until one yields a negotiated stream or the peer refuses us outright.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use trellis_federation::{Candidate, discovery};

use crate::node::Node;
use crate::session::{self, BoxedIo, ConnectOutcome, SessionCommand, SessionHandle};
use crate::state::outbound::Purpose;

/// Upper bound on stream negotiation after the transport is connected.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens a transport to a candidate. Swappable so federation can run over
/// in-memory pipes.
#[async_trait]
pub trait Dial: Send + Sync {
    async fn dial(&self, candidate: &Candidate) -> io::Result<BoxedIo>;
}

/// Plain TCP; STARTTLS happens later inside the stream.
pub struct TcpDialer;

#[async_trait]
impl Dial for TcpDialer {
    async fn dial(&self, candidate: &Candidate) -> io::Result<BoxedIo> {
        let stream = TcpStream::connect((candidate.host.as_str(), candidate.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Connect `local` to `remote` for `purpose`. Returns the session once it is
/// ready, or `None` when every candidate failed or the peer refused us.
pub async fn establish(node: &Arc<Node>, local: &str, remote: &str, purpose: Purpose) -> Option<SessionHandle> {
    let candidates = discovery::discover(node.resolver(), remote).await;
    let connect_timeout = Duration::from_secs(node.config.s2s.connect_timeout_secs);

    for candidate in candidates {
        let io = match timeout(connect_timeout, node.dialer().dial(&candidate)).await {
            Ok(Ok(io)) => io,
            Ok(Err(e)) => {
                debug!(remote, %candidate, error = %e, "Connection attempt failed");
                continue;
            }
            Err(_) => {
                debug!(remote, %candidate, "Connection attempt timed out");
                continue;
            }
        };

        let (tx, rx) = oneshot::channel();
        let handle = session::spawn_outbound(node.clone(), io, local, remote, purpose.clone(), tx);
        match timeout(NEGOTIATION_TIMEOUT, rx).await {
            Ok(Ok(ConnectOutcome::Connected(handle))) => {
                info!(local, remote, %candidate, purpose = ?purpose, "Outbound stream ready");
                return Some(handle);
            }
            Ok(Ok(ConnectOutcome::Rejected)) => {
                warn!(local, remote, %candidate, "Remote server refused the stream");
                return None;
            }
            Ok(Err(_)) => {
                debug!(remote, %candidate, "Stream ended during negotiation");
            }
            Err(_) => {
                debug!(remote, %candidate, "Stream negotiation timed out");
                handle.send(SessionCommand::Close);
            }
        }
    }

    warn!(local, remote, "No reachable server for remote domain");
    None
}
