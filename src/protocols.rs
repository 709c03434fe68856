//! Capability traits supplied by the application.
//!
//! A session never finds peers or dials streams by itself. For every network
//! it supports, the application registers a [`DiscoveryProvider`]; the
//! provider answers `getpeers` with [`Candidate`]s, which may be other live
//! sessions, [`Connector`]s that dial a stream on demand, or streams that are
//! already open.
//!
//! | Candidate | Relayed by | Default descriptor |
//! |-----------|------------|--------------------|
//! | [`Candidate::Session`] | `incoming` on the target session | target's remote descriptor |
//! | [`Candidate::Connector`] | invoking the connector | connector's own descriptor |
//! | [`Candidate::Stream`] | bridging the stream once | `{relay: true, pxp: false}` |
//!
//! [`SessionList`] is the provider a hub uses to offer its own sessions to
//! each other; [`FnDiscovery`] adapts a closure.

use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::messages::ConnectInfo;
use crate::peer::Peer;
use crate::transport::BoxedDuplex;

/// Answers `getpeers` for one network.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync + 'static {
    /// Current candidates for the network. An error is fatal to the session
    /// that asked.
    async fn get_peers(&self) -> Result<Vec<Candidate>>;
}

/// Dials a duplex stream to a peer reachable outside this session.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<BoxedDuplex>;

    /// Descriptor advertised for this candidate in `getpeers` replies.
    fn connect_info(&self) -> Option<ConnectInfo> {
        None
    }
}

/// A relay target returned by discovery.
pub enum Candidate {
    /// Another live session on this node.
    Session(Peer),
    /// A capability that yields a stream when invoked.
    Connector(Arc<dyn Connector>),
    /// An open stream. Single-use: consumed by the first relay.
    Stream(BoxedDuplex),
}

impl Candidate {
    pub fn connector<C: Connector>(connector: C) -> Self {
        Candidate::Connector(Arc::new(connector))
    }

    pub fn stream(stream: BoxedDuplex) -> Self {
        Candidate::Stream(stream)
    }

    /// Descriptor to advertise, falling back to a relay-only descriptor.
    pub fn connect_info(&self) -> ConnectInfo {
        let own = match self {
            Candidate::Session(peer) => peer.remote_connect_info(),
            Candidate::Connector(connector) => connector.connect_info(),
            Candidate::Stream(_) => None,
        };
        own.unwrap_or_else(ConnectInfo::relay_only)
    }

    /// Clone a shareable reference. Streams cannot be shared.
    pub(crate) fn try_clone(&self) -> Option<Candidate> {
        match self {
            Candidate::Session(peer) => Some(Candidate::Session(peer.clone())),
            Candidate::Connector(connector) => Some(Candidate::Connector(Arc::clone(connector))),
            Candidate::Stream(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Candidate::Session(_) => "session",
            Candidate::Connector(_) => "connector",
            Candidate::Stream(_) => "stream",
        }
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Candidate::Session(peer) => f.debug_tuple("Session").field(&peer.id()).finish(),
            Candidate::Connector(_) => f.write_str("Connector"),
            Candidate::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Provider backed by a closure, for applications with a plain peer list.
pub struct FnDiscovery<F>(F);

impl<F> FnDiscovery<F>
where
    F: Fn() -> Result<Vec<Candidate>> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> DiscoveryProvider for FnDiscovery<F>
where
    F: Fn() -> Result<Vec<Candidate>> + Send + Sync + 'static,
{
    async fn get_peers(&self) -> Result<Vec<Candidate>> {
        (self.0)()
    }
}

/// The sessions of a hub, offered to each other as relay targets.
///
/// Closed sessions are pruned on every lookup.
#[derive(Clone, Default)]
pub struct SessionList {
    peers: Arc<Mutex<Vec<Peer>>>,
}

impl SessionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, peer: Peer) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.push(peer);
        }
    }

    pub fn len(&self) -> usize {
        self.peers.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SessionList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionList").field("len", &self.len()).finish()
    }
}

#[async_trait]
impl DiscoveryProvider for SessionList {
    async fn get_peers(&self) -> Result<Vec<Candidate>> {
        let mut peers = self
            .peers
            .lock()
            .map_err(|_| anyhow!("session list lock poisoned"))?;
        peers.retain(|peer| !peer.is_closed());
        Ok(peers.iter().cloned().map(Candidate::Session).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Described;

    #[async_trait]
    impl Connector for Described {
        async fn connect(&self) -> Result<BoxedDuplex> {
            let (a, _b) = tokio::io::duplex(64);
            Ok(Box::new(a))
        }

        fn connect_info(&self) -> Option<ConnectInfo> {
            Some(ConnectInfo {
                relay: false,
                pxp: true,
                ..ConnectInfo::default()
            })
        }
    }

    struct Bare;

    #[async_trait]
    impl Connector for Bare {
        async fn connect(&self) -> Result<BoxedDuplex> {
            anyhow::bail!("unreachable peer")
        }
    }

    #[test]
    fn connector_descriptor_or_default() {
        let described = Candidate::connector(Described);
        assert!(described.connect_info().pxp);
        assert_eq!(described.kind(), "connector");

        let bare = Candidate::connector(Bare);
        assert_eq!(bare.connect_info(), ConnectInfo::relay_only());
    }

    #[test]
    fn stream_uses_default_descriptor() {
        let (a, _b) = tokio::io::duplex(64);
        let candidate = Candidate::stream(Box::new(a));
        assert_eq!(candidate.connect_info(), ConnectInfo::relay_only());
        assert_eq!(format!("{candidate:?}"), "Stream");
    }

    #[test]
    fn streams_are_not_shareable() {
        let (a, _b) = tokio::io::duplex(64);
        assert!(Candidate::stream(Box::new(a)).try_clone().is_none());
        assert!(Candidate::connector(Bare).try_clone().is_some());
    }

    #[tokio::test]
    async fn empty_session_list() {
        let list = SessionList::new();
        assert!(list.is_empty());
        assert!(list.get_peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn closure_provider() {
        let provider = FnDiscovery::new(|| Ok(vec![Candidate::connector(Bare)]));
        let peers = provider.get_peers().await.unwrap();
        assert_eq!(peers.len(), 1);

        let failing = FnDiscovery::new(|| anyhow::bail!("lookup failed"));
        assert!(failing.get_peers().await.is_err());
    }
}
