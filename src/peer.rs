//! # Peer Session
//!
//! A [`Peer`] is one end of a PXP session over a multiplexed [`Transport`].
//! It performs the `hello` handshake, then serves and issues the control
//! commands of the protocol over the `pxp` channel:
//!
//! | Command | Issued by | Served by |
//! |---------|-----------|-----------|
//! | `getpeers` | [`Peer::get_peers`] | the network's [`DiscoveryProvider`] |
//! | `relay` | [`Peer::relay`] | the candidate registry and a [`RelayBridge`] |
//! | `incoming` | relay responder, on the target session | opens `relay:<id>`, emits [`PeerEvent::Incoming`] |
//! | `connect` | [`Peer::connect`] | opens `data:<network>`, emits [`PeerEvent::Connect`] |
//! | `upgrade` | [`Peer::upgrade`] | emits [`PeerEvent::Upgrade`] |
//!
//! ## Architecture
//!
//! - `Peer`: the public handle, cheap to clone. Request-style operations run
//!   in the caller's task and only share the dispatcher's send side.
//! - `PeerActor`: owns the dispatcher's receive side, the candidate registry
//!   and the handshake state. It processes inbound commands, transport
//!   closure and registry maintenance sequentially.
//! - `Command`: messages from the handle and from tasks spawned by the actor
//!   (provider lookups, connector dials) back to the actor.
//!
//! ## State Machine
//!
//! ```text
//! Created -> AwaitingHello -> Ready -> Closed
//!    \             \                   ^
//!     `-------------`------------------'
//! ```
//!
//! Every [`ProtocolError`] observed while serving the remote is emitted as
//! [`PeerEvent::Error`] and closes the session.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::dispatcher::{DispatchSender, Dispatcher, Inbound, Responder};
use crate::error::{ProtocolError, SessionError};
use crate::messages::{
    self, CMD_CONNECT, CMD_GET_PEERS, CMD_HELLO, CMD_INCOMING, CMD_RELAY, CMD_UPGRADE,
    CONTROL_CHANNEL, ConnectInfo, GetPeersReply, Hello, MAX_FRAME_SIZE, PROTOCOL_VERSION,
    PeerRecord, UpgradeRequest,
};
use crate::protocols::{Candidate, DiscoveryProvider};
use crate::registry::{
    CandidateRegistry, DEFAULT_CANDIDATE_TTL, DEFAULT_MAX_CANDIDATES, RegistryError,
    generate_token,
};
use crate::relay::RelayBridge;
use crate::transport::{BoxedDuplex, Channel, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Default period of the registry purge.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

/// Lower bound applied to the purge period.
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(10);

/// Capacity of the handle-to-actor command queue.
const COMMAND_CHANNEL_SIZE: usize = 64;

/// Capacity of the event queue. The application must drain it.
const EVENT_CHANNEL_SIZE: usize = 256;

/// Upper bound on flushing queued control frames during close.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Configuration
// ============================================================================

/// Construction parameters of a session.
#[derive(Clone)]
pub struct PeerConfig {
    networks: Vec<(String, Arc<dyn DiscoveryProvider>)>,
    /// Local descriptor; `Some` makes the session self-accepting.
    pub connect_info: Option<ConnectInfo>,
    /// Whether the underlying connection is itself relayed.
    pub relayed: bool,
    pub candidate_ttl: Duration,
    pub max_candidates: usize,
    pub cleanup_interval: Duration,
    pub max_frame_size: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            networks: Vec::new(),
            connect_info: None,
            relayed: false,
            candidate_ttl: DEFAULT_CANDIDATE_TTL,
            max_candidates: DEFAULT_MAX_CANDIDATES,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl fmt::Debug for PeerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConfig")
            .field("networks", &self.network_names())
            .field("connect_info", &self.connect_info)
            .field("relayed", &self.relayed)
            .field("candidate_ttl", &self.candidate_ttl)
            .field("max_candidates", &self.max_candidates)
            .finish_non_exhaustive()
    }
}

impl PeerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Support `network`, answering `getpeers` for it with `provider`.
    /// Registering a network again replaces its provider.
    pub fn with_network<P: DiscoveryProvider>(self, network: impl Into<String>, provider: P) -> Self {
        self.with_shared_network(network, Arc::new(provider))
    }

    pub fn with_shared_network(
        mut self,
        network: impl Into<String>,
        provider: Arc<dyn DiscoveryProvider>,
    ) -> Self {
        let network = network.into();
        match self.networks.iter_mut().find(|(name, _)| *name == network) {
            Some(entry) => entry.1 = provider,
            None => self.networks.push((network, provider)),
        }
        self
    }

    pub fn with_connect_info(mut self, info: ConnectInfo) -> Self {
        self.connect_info = Some(info);
        self
    }

    pub fn relayed(mut self, relayed: bool) -> Self {
        self.relayed = relayed;
        self
    }

    pub fn with_candidate_ttl(mut self, ttl: Duration) -> Self {
        self.candidate_ttl = ttl;
        self
    }

    pub fn with_max_candidates(mut self, max: usize) -> Self {
        self.max_candidates = max;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn network_names(&self) -> Vec<String> {
        self.networks.iter().map(|(name, _)| name.clone()).collect()
    }
}

// ============================================================================
// Public Types
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Created,
    AwaitingHello,
    Ready,
    Closed,
}

/// What the remote announced in its `hello`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteInfo {
    pub networks: Vec<String>,
    pub connect_info: Option<ConnectInfo>,
}

#[derive(Clone, Debug, Default)]
struct Status {
    state: SessionState,
    remote: Option<RemoteInfo>,
}

/// Notifications from a session to its application.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake completed. Emitted at most once.
    Ready,
    /// A relayed stream arrived through `incoming`.
    Incoming(Channel),
    /// The remote opened a data channel for `network`.
    Connect { network: String, channel: Channel },
    /// The remote asked to migrate to another transport.
    Upgrade {
        request: UpgradeRequest,
        responder: UpgradeResponder,
    },
    /// A protocol violation; the session is closing.
    Error(SessionError),
    /// The session closed. Always the last event.
    Disconnect,
}

/// Sends the opaque reply to an `upgrade` request.
#[derive(Debug)]
pub struct UpgradeResponder(Responder);

impl UpgradeResponder {
    pub async fn respond(self, reply: Vec<u8>) -> Result<(), SessionError> {
        self.0.respond(&reply).await
    }
}

enum Command {
    DiscoveryComplete {
        network: String,
        result: anyhow::Result<Vec<Candidate>>,
        responder: Responder,
    },
    Fault(ProtocolError),
    Close(oneshot::Sender<()>),
}

type ConnectedNetworks = Arc<Mutex<HashSet<String>>>;

fn lock_connected(set: &ConnectedNetworks) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hook that frees a network slot once its data channel ends.
fn release_on_end(set: ConnectedNetworks, network: String) -> impl FnOnce() + Send + 'static {
    move || {
        lock_connected(&set).remove(&network);
        trace!(network = %network, "data channel released");
    }
}

// ============================================================================
// Peer Handle
// ============================================================================

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct Peer {
    id: u64,
    cmd_tx: mpsc::Sender<Command>,
    sender: DispatchSender,
    transport: Arc<dyn Transport>,
    status: watch::Receiver<Status>,
    networks: Arc<[String]>,
    connected: ConnectedNetworks,
    self_accepting: bool,
    relayed: bool,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("networks", &self.networks)
            .finish()
    }
}

impl Peer {
    /// Start a session over `transport`.
    ///
    /// Opens the control channel, sends `hello` and spawns the session
    /// actor. Returns the handle and the session's event stream.
    pub async fn spawn<T: Transport>(
        transport: T,
        config: PeerConfig,
    ) -> Result<(Self, mpsc::Receiver<PeerEvent>), SessionError> {
        Self::spawn_shared(Arc::new(transport), config).await
    }

    pub async fn spawn_shared(
        transport: Arc<dyn Transport>,
        config: PeerConfig,
    ) -> Result<(Self, mpsc::Receiver<PeerEvent>), SessionError> {
        if config.networks.is_empty() {
            return Err(SessionError::NoNetworks);
        }

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let (status_tx, status_rx) = watch::channel(Status::default());

        let control = transport
            .open_channel(CONTROL_CHANNEL)
            .await
            .map_err(|source| SessionError::Channel {
                name: CONTROL_CHANNEL.to_string(),
                source,
            })?;
        let mut dispatcher = Dispatcher::with_max_frame_size(control, config.max_frame_size);
        dispatcher.register(CMD_HELLO);

        let networks = config.network_names();
        let hello = Hello {
            version: PROTOCOL_VERSION,
            connect_info: config.connect_info.clone(),
            networks: networks.clone(),
        };
        dispatcher.send(CMD_HELLO, &hello).await?;
        status_tx.send_modify(|s| s.state = SessionState::AwaitingHello);
        debug!(session = id, networks = ?networks, "hello sent");

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let connected: ConnectedNetworks = Arc::new(Mutex::new(HashSet::new()));

        let handle = Self {
            id,
            cmd_tx: cmd_tx.clone(),
            sender: dispatcher.sender(),
            transport: transport.clone(),
            status: status_rx,
            networks: networks.into(),
            connected: connected.clone(),
            self_accepting: config.connect_info.is_some(),
            relayed: config.relayed,
        };

        let actor = PeerActor {
            id,
            providers: config.networks.into_iter().collect(),
            connect_info: config.connect_info,
            transport,
            dispatcher,
            status_tx,
            event_tx,
            registry: CandidateRegistry::new(config.candidate_ttl, config.max_candidates),
            connected,
            self_tx: cmd_tx.downgrade(),
            cleanup_interval: config.cleanup_interval.max(MIN_CLEANUP_INTERVAL),
            closed: false,
        };
        tokio::spawn(actor.run(cmd_rx));

        Ok((handle, event_rx))
    }

    /// Process-unique session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn is_relayed(&self) -> bool {
        self.relayed
    }

    /// Local network ids, in the order announced in `hello`.
    pub fn networks(&self) -> &[String] {
        &self.networks
    }

    /// Whether this side advertised a connect descriptor.
    pub fn self_is_accepting(&self) -> bool {
        self.self_accepting
    }

    /// Whether the remote advertised a connect descriptor.
    pub fn is_accepting(&self) -> bool {
        self.remote_connect_info().is_some()
    }

    pub fn remote_connect_info(&self) -> Option<ConnectInfo> {
        self.status
            .borrow()
            .remote
            .as_ref()
            .and_then(|remote| remote.connect_info.clone())
    }

    /// Networks announced by the remote; `None` until the handshake completes.
    pub fn remote_networks(&self) -> Option<Vec<String>> {
        self.status
            .borrow()
            .remote
            .as_ref()
            .map(|remote| remote.networks.clone())
    }

    /// Networks currently backed by an open data channel.
    pub fn connected_networks(&self) -> Vec<String> {
        let mut networks: Vec<String> = lock_connected(&self.connected).iter().cloned().collect();
        networks.sort();
        networks
    }

    /// Wait for the handshake. Fails if the session closes first.
    pub async fn ready(&self) -> Result<(), SessionError> {
        wait_ready(self.status.clone()).await
    }

    /// Run `f` once the session is ready: immediately if it already is,
    /// never if the session closes first.
    pub fn once_ready<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_ready() {
            f();
            return;
        }
        let status = self.status.clone();
        tokio::spawn(async move {
            if wait_ready(status).await.is_ok() {
                f();
            }
        });
    }

    /// Ask the remote for candidates on `network`.
    pub async fn get_peers(&self, network: &str) -> Result<Vec<PeerRecord>, SessionError> {
        self.ready().await?;
        let reply: GetPeersReply = self.call(CMD_GET_PEERS, &network).await?;
        if let Some(err) = reply.error {
            return Err(SessionError::Remote(err));
        }
        if !reply.peers.iter().all(PeerRecord::is_well_formed) {
            return Err(SessionError::InvalidResponse(CMD_GET_PEERS));
        }
        debug!(session = self.id, network, count = reply.peers.len(), "received candidates");
        Ok(reply.peers)
    }

    /// Ask the remote to relay to `candidate` and return the relayed stream.
    pub async fn relay(&self, candidate: &PeerRecord) -> Result<Channel, SessionError> {
        self.ready().await?;
        let refused: Option<String> = self.call(CMD_RELAY, &candidate.id).await?;
        if let Some(err) = refused {
            return Err(SessionError::Remote(err));
        }
        let name = messages::relay_channel(&candidate.id);
        let stream = self.open(&name).await?;
        debug!(session = self.id, network = %candidate.network, "relay established");
        Ok(Channel::new(name, stream))
    }

    /// Open the data channel for `network`.
    ///
    /// At most one data channel per network exists at a time; the slot is
    /// freed when the returned channel ends or is dropped.
    pub async fn connect(&self, network: &str) -> Result<Channel, SessionError> {
        self.ready().await?;
        let supported_remotely = self
            .remote_networks()
            .is_some_and(|remote| remote.iter().any(|n| n == network));
        if !supported_remotely || !self.networks.iter().any(|n| n == network) {
            return Err(SessionError::UnsupportedNetwork(network.to_string()));
        }
        if !lock_connected(&self.connected).insert(network.to_string()) {
            return Err(SessionError::AlreadyConnected(network.to_string()));
        }

        let name = messages::data_channel(network);
        let release = release_on_end(self.connected.clone(), network.to_string());
        let stream = match self.open(&name).await {
            Ok(stream) => stream,
            Err(err) => {
                release();
                return Err(err);
            }
        };
        let channel = Channel::new(name, stream).with_end_hook(release);

        let refused: Option<String> = self.call(CMD_CONNECT, &network).await?;
        match refused {
            Some(err) => Err(SessionError::Remote(err)),
            None => {
                debug!(session = self.id, network, "data channel open");
                Ok(channel)
            }
        }
    }

    /// Signal a transport upgrade. Only relayed sessions may upgrade.
    pub async fn upgrade(&self, request: UpgradeRequest) -> Result<Vec<u8>, SessionError> {
        if !self.relayed {
            return Err(SessionError::NotRelayed);
        }
        self.ready().await?;
        self.call(CMD_UPGRADE, &request).await
    }

    /// Close the session. Idempotent.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Have the remote open a relay pipe to us, and return our end of it.
    pub(crate) async fn accept_relay(&self) -> Result<BoxedDuplex, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if !self.is_accepting() {
            return Err(SessionError::NotAccepting);
        }
        let id = generate_token()?;
        let () = self.call(CMD_INCOMING, &id).await?;
        self.open(&messages::relay_channel(&id)).await
    }

    async fn open(&self, name: &str) -> Result<BoxedDuplex, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.transport
            .open_channel(name)
            .await
            .map_err(|source| SessionError::Channel {
                name: name.to_string(),
                source,
            })
    }

    /// Single request/reply round trip. Once the session closes, only a
    /// reply that is already in flight can still complete it.
    async fn call<P, R>(&self, command: &'static str, payload: &P) -> Result<R, SessionError>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let reply = self.sender.request(command, payload).await?.decode::<R>();
        tokio::pin!(reply);
        let mut status = self.status.clone();
        tokio::select! {
            biased;
            result = &mut reply => result,
            _ = async { status.wait_for(|s| s.state == SessionState::Closed).await.map(|_| ()) } => {
                // A reply already on the wire still resolves the call.
                tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, reply)
                    .await
                    .unwrap_or(Err(SessionError::Closed))
            }
        }
    }
}

async fn wait_ready(mut status: watch::Receiver<Status>) -> Result<(), SessionError> {
    let state = status
        .wait_for(|s| matches!(s.state, SessionState::Ready | SessionState::Closed))
        .await
        .map_err(|_| SessionError::Closed)?
        .state;
    match state {
        SessionState::Ready => Ok(()),
        _ => Err(SessionError::Closed),
    }
}

// ============================================================================
// Peer Actor (owns state)
// ============================================================================

struct PeerActor {
    id: u64,
    providers: HashMap<String, Arc<dyn DiscoveryProvider>>,
    connect_info: Option<ConnectInfo>,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    status_tx: watch::Sender<Status>,
    event_tx: mpsc::Sender<PeerEvent>,
    registry: CandidateRegistry<Candidate>,
    connected: ConnectedNetworks,
    self_tx: mpsc::WeakSender<Command>,
    cleanup_interval: Duration,
    closed: bool,
}

impl PeerActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut transport_closed = self.transport.closed();
        let mut cleanup = tokio::time::interval(self.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if *transport_closed.borrow_and_update() {
            self.close().await;
        }

        while !self.closed {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            debug!(session = self.id, "all handles dropped, closing session");
                            self.close().await;
                        }
                    }
                }
                inbound = self.dispatcher.next_inbound() => {
                    match inbound {
                        Ok(Some(msg)) => {
                            if let Err(err) = self.handle_inbound(msg).await {
                                self.fault(err).await;
                            }
                        }
                        Ok(None) => {
                            debug!(session = self.id, "control channel ended");
                            self.close().await;
                        }
                        Err(err) => self.fault(err).await,
                    }
                }
                changed = transport_closed.changed() => {
                    if changed.is_err() || *transport_closed.borrow() {
                        debug!(session = self.id, "transport closed");
                        self.close().await;
                    }
                }
                _ = cleanup.tick() => {
                    let purged = self.registry.purge_expired();
                    if purged > 0 {
                        trace!(session = self.id, purged, "expired candidates purged");
                    }
                }
            }
        }
        trace!(session = self.id, "session actor finished");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::DiscoveryComplete {
                network,
                result,
                responder,
            } => {
                if let Err(err) = self.finish_get_peers(network, result, responder).await {
                    self.fault(err).await;
                }
            }
            Command::Fault(err) => self.fault(err).await,
            Command::Close(reply) => {
                self.close().await;
                let _ = reply.send(());
            }
        }
    }

    async fn handle_inbound(&mut self, msg: Inbound) -> Result<(), ProtocolError> {
        trace!(session = self.id, command = %msg.command, "inbound command");
        match msg.command.as_str() {
            CMD_HELLO => self.on_hello(&msg).await,
            CMD_GET_PEERS => self.on_get_peers(msg).await,
            CMD_RELAY => self.on_relay(msg).await,
            CMD_INCOMING => self.on_incoming(msg).await,
            CMD_CONNECT => self.on_connect(msg).await,
            CMD_UPGRADE => self.on_upgrade(msg).await,
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    async fn on_hello(&mut self, msg: &Inbound) -> Result<(), ProtocolError> {
        let hello: Hello = msg.decode()?;
        if hello.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                theirs: hello.version,
                ours: PROTOCOL_VERSION,
            });
        }
        if !hello.networks.iter().any(|n| self.providers.contains_key(n)) {
            return Err(ProtocolError::NoCommonNetworks);
        }

        self.dispatcher.unregister(CMD_HELLO);
        for command in [CMD_GET_PEERS, CMD_RELAY, CMD_UPGRADE, CMD_CONNECT] {
            self.dispatcher.register(command);
        }
        if self.connect_info.is_some() {
            self.dispatcher.register(CMD_INCOMING);
        }

        info!(
            session = self.id,
            remote_networks = ?hello.networks,
            remote_accepting = hello.connect_info.is_some(),
            "session ready"
        );
        self.status_tx.send_modify(|s| {
            s.state = SessionState::Ready;
            s.remote = Some(RemoteInfo {
                networks: hello.networks,
                connect_info: hello.connect_info,
            });
        });
        self.emit(PeerEvent::Ready).await;
        Ok(())
    }

    async fn on_get_peers(&mut self, mut msg: Inbound) -> Result<(), ProtocolError> {
        let responder = take_responder(&mut msg)?;
        let network: String = msg.decode()?;
        let Some(provider) = self.providers.get(&network).cloned() else {
            let err = ProtocolError::UnknownNetwork(network);
            reply(responder, &GetPeersReply::failure(err.to_string())).await;
            return Err(err);
        };

        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = provider.get_peers().await;
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx
                    .send(Command::DiscoveryComplete {
                        network,
                        result,
                        responder,
                    })
                    .await;
            }
        });
        Ok(())
    }

    async fn finish_get_peers(
        &mut self,
        network: String,
        result: anyhow::Result<Vec<Candidate>>,
        responder: Responder,
    ) -> Result<(), ProtocolError> {
        let candidates = match result {
            Ok(candidates) => candidates,
            Err(e) => {
                let err = ProtocolError::Discovery {
                    network,
                    reason: format!("{e:#}"),
                };
                reply(responder, &GetPeersReply::failure(err.to_string())).await;
                return Err(err);
            }
        };

        let mut peers = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if let Candidate::Session(peer) = &candidate
                && peer.id() == self.id
            {
                continue;
            }
            let connect_info = candidate.connect_info();
            let id = match self.registry.insert(candidate) {
                Ok(id) => id,
                Err(RegistryError::Full { capacity }) => {
                    warn!(
                        session = self.id,
                        capacity,
                        advertised = peers.len(),
                        "candidate registry full, truncating getpeers reply"
                    );
                    break;
                }
                Err(e @ RegistryError::Rng(_)) => {
                    warn!(session = self.id, error = %e, "failed to mint candidate id");
                    reply(responder, &GetPeersReply::failure(e.to_string())).await;
                    return Ok(());
                }
            };
            peers.push(PeerRecord {
                id,
                network: network.clone(),
                connect_info: Some(connect_info),
            });
        }

        debug!(session = self.id, network = %network, count = peers.len(), "answering getpeers");
        reply(responder, &GetPeersReply { error: None, peers }).await;
        Ok(())
    }

    async fn on_relay(&mut self, mut msg: Inbound) -> Result<(), ProtocolError> {
        let responder = take_responder(&mut msg)?;
        let to: String = msg.decode()?;
        let name = messages::relay_channel(&to);
        let source = match self.open(&name).await {
            Ok(stream) => stream,
            Err(err) => {
                reply(responder, &Some(err.to_string())).await;
                return Err(err);
            }
        };

        let target = match self.registry.get(&to).map(Candidate::try_clone) {
            Some(Some(shared)) => Some(shared),
            Some(None) => self.registry.take(&to),
            None => None,
        };
        let Some(target) = target else {
            let err = ProtocolError::UnknownCandidate(to);
            reply(responder, &Some(err.to_string())).await;
            return Err(err);
        };

        let short_id = to.get(..8).unwrap_or(&to).to_string();
        debug!(session = self.id, candidate = %short_id, kind = target.kind(), "relaying");

        match target {
            Candidate::Session(peer) => {
                tokio::spawn(async move {
                    match peer.accept_relay().await {
                        Ok(dest) => {
                            RelayBridge::spawn(name, source, dest);
                            reply(responder, &None::<String>).await;
                        }
                        Err(e) => {
                            debug!(candidate = %short_id, error = %e, "relay target unavailable");
                            reply(responder, &Some(e.to_string())).await;
                        }
                    }
                });
            }
            Candidate::Connector(connector) => {
                let self_tx = self.self_tx.clone();
                tokio::spawn(async move {
                    match connector.connect().await {
                        Ok(dest) => {
                            RelayBridge::spawn(name, source, dest);
                            reply(responder, &None::<String>).await;
                        }
                        Err(e) => {
                            let err = ProtocolError::Connector {
                                candidate: short_id,
                                reason: format!("{e:#}"),
                            };
                            reply(responder, &Some(err.to_string())).await;
                            if let Some(tx) = self_tx.upgrade() {
                                let _ = tx.send(Command::Fault(err)).await;
                            }
                        }
                    }
                });
            }
            Candidate::Stream(dest) => {
                RelayBridge::spawn(name, source, dest);
                reply(responder, &None::<String>).await;
            }
        }
        Ok(())
    }

    async fn on_incoming(&mut self, mut msg: Inbound) -> Result<(), ProtocolError> {
        let responder = take_responder(&mut msg)?;
        let id: String = msg.decode()?;
        let name = messages::relay_channel(&id);
        let stream = self.open(&name).await?;
        reply(responder, &()).await;
        debug!(session = self.id, "incoming relay");
        self.emit(PeerEvent::Incoming(Channel::new(name, stream))).await;
        Ok(())
    }

    async fn on_connect(&mut self, mut msg: Inbound) -> Result<(), ProtocolError> {
        let responder = take_responder(&mut msg)?;
        let network: String = msg.decode()?;
        if !self.providers.contains_key(&network) {
            let err = ProtocolError::UnknownNetwork(network);
            reply(responder, &Some(err.to_string())).await;
            return Err(err);
        }
        if !lock_connected(&self.connected).insert(network.clone()) {
            let err = ProtocolError::DuplicateConnect(network);
            reply(responder, &Some(err.to_string())).await;
            return Err(err);
        }

        let name = messages::data_channel(&network);
        let release = release_on_end(self.connected.clone(), network.clone());
        let stream = match self.open(&name).await {
            Ok(stream) => stream,
            Err(err) => {
                release();
                reply(responder, &Some(err.to_string())).await;
                return Err(err);
            }
        };
        let channel = Channel::new(name, stream).with_end_hook(release);

        debug!(session = self.id, network = %network, "remote opened data channel");
        self.emit(PeerEvent::Connect { network, channel }).await;
        reply(responder, &None::<String>).await;
        Ok(())
    }

    async fn on_upgrade(&mut self, mut msg: Inbound) -> Result<(), ProtocolError> {
        let responder = take_responder(&mut msg)?;
        let request: UpgradeRequest = msg.decode()?;
        debug!(session = self.id, transport = %request.transport, "upgrade requested");
        self.emit(PeerEvent::Upgrade {
            request,
            responder: UpgradeResponder(responder),
        })
        .await;
        Ok(())
    }

    async fn open(&mut self, name: &str) -> Result<BoxedDuplex, ProtocolError> {
        self.transport
            .open_channel(name)
            .await
            .map_err(|e| ProtocolError::ChannelFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    async fn emit(&mut self, event: PeerEvent) {
        if self.event_tx.send(event).await.is_err() {
            trace!(session = self.id, "event receiver dropped");
        }
    }

    async fn fault(&mut self, err: ProtocolError) {
        if self.closed {
            return;
        }
        warn!(session = self.id, error = %err, "protocol violation, closing session");
        self.emit(PeerEvent::Error(err.into())).await;
        self.close().await;
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.status_tx.send_modify(|s| s.state = SessionState::Closed);
        self.registry.clear();
        self.emit(PeerEvent::Disconnect).await;
        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, self.dispatcher.flush())
            .await
            .is_err()
        {
            debug!(session = self.id, "timed out flushing control frames");
        }
        self.transport.close().await;
        info!(session = self.id, "session closed");
    }
}

fn take_responder(msg: &mut Inbound) -> Result<Responder, ProtocolError> {
    msg.responder
        .take()
        .ok_or_else(|| ProtocolError::MissingRequestId(msg.command.clone()))
}

async fn reply<T: Serialize + Sync>(responder: Responder, payload: &T) {
    if let Err(e) = responder.respond(payload).await {
        trace!(error = %e, "reply dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::FnDiscovery;

    fn empty() -> FnDiscovery<impl Fn() -> anyhow::Result<Vec<Candidate>> + Send + Sync + 'static>
    {
        FnDiscovery::new(|| Ok(Vec::new()))
    }

    #[test]
    fn config_replaces_duplicate_network() {
        let config = PeerConfig::new()
            .with_network("test", empty())
            .with_network("other", empty())
            .with_network("test", empty());
        assert_eq!(config.network_names(), vec!["test".to_string(), "other".to_string()]);
    }

    #[test]
    fn config_defaults() {
        let config = PeerConfig::default();
        assert_eq!(config.candidate_ttl, DEFAULT_CANDIDATE_TTL);
        assert_eq!(config.max_candidates, DEFAULT_MAX_CANDIDATES);
        assert_eq!(config.max_frame_size, MAX_FRAME_SIZE);
        assert!(config.connect_info.is_none());
        assert!(!config.relayed);
    }

    #[test]
    fn release_hook_frees_slot() {
        let set: ConnectedNetworks = Arc::new(Mutex::new(HashSet::new()));
        lock_connected(&set).insert("test".to_string());
        release_on_end(set.clone(), "test".to_string())();
        assert!(lock_connected(&set).is_empty());
    }

    #[test]
    fn default_state_is_created() {
        assert_eq!(Status::default().state, SessionState::Created);
    }
}
