//! Stanza routing and the session directory.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use trellis_common::xml::Element;
use trellis_common::{Jid, StanzaError};
use trellis_federation::DialbackToken;
use uuid::Uuid;

use crate::connector;
use crate::node::Node;
use crate::session::{SessionCommand, SessionHandle};
use crate::stanza;
use crate::state::outbound::Purpose;

/// A bound client resource.
#[derive(Debug, Clone)]
pub struct LocalSession {
    pub jid: Jid,
    pub handle: SessionHandle,
    pub available: bool,
    pub priority: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("resource limit reached")]
    ResourceLimit,
    #[error("invalid resource")]
    InvalidResource,
}

/// A session registered under a stream id while it negotiates dialback.
struct HandshakeEntry {
    handle: SessionHandle,
    /// Present on outbound sessions that sent `<db:result>`; taken by the
    /// first `<db:verify>` for this stream id.
    token: Option<DialbackToken>,
}

type DomainPair = (String, String);

#[derive(Default)]
struct Links {
    /// Authenticated outbound sessions keyed by (local domain, remote domain).
    established: HashMap<DomainPair, SessionHandle>,
    /// Stanzas waiting on an in-flight establishment.
    pending: HashMap<DomainPair, Vec<Element>>,
}

/// Directory of live sessions.
///
/// Entries are added when a session reaches the state that makes it
/// addressable and removed by [`Router::unregister`] when it closes.
pub struct Router {
    /// Bare address → bound resources.
    local: Arc<RwLock<HashMap<Jid, Vec<LocalSession>>>>,
    /// Stream id → session negotiating dialback on that stream.
    handshakes: Arc<RwLock<HashMap<String, HandshakeEntry>>>,
    links: Arc<RwLock<Links>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            local: Arc::new(RwLock::new(HashMap::new())),
            handshakes: Arc::new(RwLock::new(HashMap::new())),
            links: Arc::new(RwLock::new(Links::default())),
        }
    }

    /// Bind a resource for `account`. A missing or already bound resource is
    /// replaced by a generated one. Binds beyond `max` concurrent resources
    /// are rejected.
    pub async fn register_authenticated(
        &self,
        account: &Jid,
        requested: Option<&str>,
        handle: &SessionHandle,
        max: usize,
    ) -> Result<Jid, BindError> {
        let bare = account.bare();
        let mut local = self.local.write().await;
        let bound = local.get(&bare).map(Vec::as_slice).unwrap_or_default();
        let live: Vec<&LocalSession> = bound.iter().filter(|s| !s.handle.is_closed()).collect();
        if live.len() >= max {
            return Err(BindError::ResourceLimit);
        }

        let resource = match requested.map(str::trim).filter(|r| !r.is_empty()) {
            Some(r) if !live.iter().any(|s| s.jid.resource() == Some(r)) => r.to_owned(),
            _ => Uuid::new_v4().to_string(),
        };
        let jid = bare.with_resource(&resource).map_err(|_| BindError::InvalidResource)?;

        let sessions = local.entry(bare).or_default();
        sessions.retain(|s| !s.handle.is_closed());
        sessions.push(LocalSession { jid: jid.clone(), handle: handle.clone(), available: false, priority: 0 });
        info!(jid = %jid, session = handle.id(), "Resource bound");
        Ok(jid)
    }

    /// Bound resources of the account `jid` belongs to.
    pub async fn sessions(&self, jid: &Jid) -> Vec<LocalSession> {
        self.local
            .read()
            .await
            .get(&jid.bare())
            .map(|sessions| sessions.iter().filter(|s| !s.handle.is_closed()).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn set_presence(&self, jid: &Jid, handle: &SessionHandle, available: bool, priority: i8) {
        if let Some(sessions) = self.local.write().await.get_mut(&jid.bare()) {
            if let Some(session) = sessions.iter_mut().find(|s| s.handle == *handle) {
                session.available = available;
                session.priority = priority;
            }
        }
    }

    /// Make a session findable by stream id for dialback. Refused when a
    /// different live session already holds the id.
    pub async fn register_for_handshake(
        &self,
        stream_id: &str,
        handle: &SessionHandle,
        token: Option<DialbackToken>,
    ) -> bool {
        let mut handshakes = self.handshakes.write().await;
        if let Some(existing) = handshakes.get(stream_id) {
            if existing.handle != *handle && !existing.handle.is_closed() {
                warn!(stream_id, "Stream id already registered");
                return false;
            }
        }
        handshakes.insert(stream_id.to_owned(), HandshakeEntry { handle: handle.clone(), token });
        true
    }

    /// The live session negotiating on `stream_id`.
    pub async fn stream_by_id(&self, stream_id: &str) -> Option<SessionHandle> {
        self.handshakes
            .read()
            .await
            .get(stream_id)
            .map(|entry| entry.handle.clone())
            .filter(|handle| !handle.is_closed())
    }

    /// Consume the dialback token registered under `stream_id`.
    pub async fn take_dialback_token(&self, stream_id: &str) -> Option<DialbackToken> {
        let mut handshakes = self.handshakes.write().await;
        let entry = handshakes.get_mut(stream_id)?;
        if entry.handle.is_closed() {
            handshakes.remove(stream_id);
            return None;
        }
        entry.token.take()
    }

    /// Drop the handshake entry for `stream_id` if `handle` owns it.
    pub async fn remove_handshake(&self, stream_id: &str, handle: &SessionHandle) {
        let mut handshakes = self.handshakes.write().await;
        if handshakes.get(stream_id).is_some_and(|entry| entry.handle == *handle) {
            handshakes.remove(stream_id);
        }
    }

    /// Remove every entry referencing `handle`. Safe to call repeatedly.
    pub async fn unregister(&self, handle: &SessionHandle) {
        {
            let mut local = self.local.write().await;
            local.retain(|_, sessions| {
                sessions.retain(|s| s.handle != *handle);
                !sessions.is_empty()
            });
        }
        self.handshakes.write().await.retain(|_, entry| entry.handle != *handle);
        self.links.write().await.established.retain(|_, link| link != handle);
    }

    /// Established outbound session for a domain pair.
    pub async fn link(&self, local: &str, remote: &str) -> Option<SessionHandle> {
        self.links
            .read()
            .await
            .established
            .get(&(local.to_owned(), remote.to_owned()))
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Deliver a stanza to a local session or forward it to its remote
    /// domain. Errors are for the caller to bounce to the sender.
    pub async fn route(&self, node: &Arc<Node>, stanza: Element) -> Result<(), StanzaError> {
        let to = stanza
            .get_attr("to")
            .and_then(|to| Jid::parse(to).ok())
            .ok_or(StanzaError::BadRequest)?;

        if node.config.is_vhost(to.domain()) {
            return stanza::deliver_local(node, stanza, &to).await;
        }

        let from = stanza
            .get_attr("from")
            .and_then(|from| Jid::parse(from).ok())
            .ok_or(StanzaError::BadRequest)?;
        let local = from.domain().to_owned();
        let remote = to.domain().to_owned();
        if !node.config.s2s_allowed(&local, &remote) {
            debug!(local = %local, remote = %remote, "Federation not permitted");
            return Err(StanzaError::RemoteServerNotFound);
        }
        self.forward(node, local, remote, stanza).await;
        Ok(())
    }

    async fn forward(&self, node: &Arc<Node>, local: String, remote: String, stanza: Element) {
        let key = (local, remote);
        {
            let mut links = self.links.write().await;
            if let Some(link) = links.established.get(&key) {
                if link.send(SessionCommand::Deliver(stanza.clone())) {
                    return;
                }
                links.established.remove(&key);
            }
            if let Some(queue) = links.pending.get_mut(&key) {
                queue.push(stanza);
                return;
            }
            links.pending.insert(key.clone(), vec![stanza]);
        }

        let node = node.clone();
        tokio::spawn(async move {
            let (local, remote) = key;
            node.router.establish(&node, local, remote).await;
        });
    }

    async fn establish(&self, node: &Arc<Node>, local: String, remote: String) {
        let outcome = connector::establish(node, &local, &remote, Purpose::Route).await;
        let key = (local, remote);

        let mut links = self.links.write().await;
        let queued = links.pending.remove(&key).unwrap_or_default();
        match outcome {
            Some(handle) => {
                info!(local = %key.0, remote = %key.1, queued = queued.len(), "Federation link established");
                for stanza in queued {
                    handle.send(SessionCommand::Deliver(stanza));
                }
                links.established.insert(key, handle);
            }
            None => {
                drop(links);
                warn!(local = %key.0, remote = %key.1, bounced = queued.len(), "Remote server not found");
                for stanza in queued {
                    let Some(reply) = StanzaError::RemoteServerNotFound.reply_to(&stanza) else { continue };
                    let Some(to) = reply.get_attr("to").and_then(|to| Jid::parse(to).ok()) else { continue };
                    if let Err(e) = stanza::deliver_local(node, reply, &to).await {
                        debug!(to = %to, error = %e, "Bounce undeliverable");
                    }
                }
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
