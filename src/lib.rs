//! # PXP - Peer Exchange Session Layer
//!
//! PXP runs a small control protocol over one multiplexed connection to a
//! remote node:
//!
//! - **Handshake**: `hello` carries the protocol version, the networks each
//!   side supports and an optional connect descriptor
//! - **Discovery**: `getpeers` returns relay candidates for a network
//! - **Relay**: `relay` / `incoming` broker a pipe to a candidate through
//!   this node, with half-close propagated in both directions
//! - **Data channels**: `connect` opens one application channel per network
//! - **Upgrade**: `upgrade` signals migration of a relayed connection
//!
//! ## Architecture
//!
//! Sessions use the **Actor Pattern**:
//! - [`Peer`] is the public handle; it is cheap to clone and talks to the
//!   session actor over async channels
//! - The actor owns all mutable session state and processes inbound
//!   commands sequentially
//! - Application notifications arrive on a [`PeerEvent`] receiver
//!
//! ## Security Model
//!
//! - Every protocol violation by the remote closes the session
//! - Frames are length-prefixed and size-bounded before decoding
//! - Candidate ids are 128-bit random tokens with a short lifetime
//! - The candidate registry is bounded in size and never evicts a live id
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `peer` | Session handle, actor and configuration |
//! | `dispatcher` | Command-tagged request/response messaging over one channel |
//! | `registry` | TTL-bounded store of discovery candidates |
//! | `relay` | Bidirectional stream bridge with half-close propagation |
//! | `protocols` | Discovery and connector capability traits |
//! | `transport` | Named-channel transport trait and in-memory implementation |
//! | `messages` | Wire frames and command payloads |
//! | `error` | Local and fatal error types |

mod dispatcher;
mod error;
mod messages;
mod peer;
mod protocols;
mod registry;
mod relay;
mod transport;

pub use dispatcher::{DispatchSender, Dispatcher, Inbound, PendingReply, Responder};
pub use error::{ProtocolError, SessionError};
pub use messages::{
    CMD_CONNECT, CMD_GET_PEERS, CMD_HELLO, CMD_INCOMING, CMD_RELAY, CMD_UPGRADE, CONTROL_CHANNEL,
    ConnectInfo, GetPeersReply, Hello, MAX_FRAME_SIZE, PROTOCOL_VERSION, PeerRecord,
    UpgradeRequest, data_channel, relay_channel,
};
pub use peer::{
    DEFAULT_CLEANUP_INTERVAL, Peer, PeerConfig, PeerEvent, RemoteInfo, SessionState,
    UpgradeResponder,
};
pub use protocols::{Candidate, Connector, DiscoveryProvider, FnDiscovery, SessionList};
pub use registry::{
    CandidateRegistry, DEFAULT_CANDIDATE_TTL, DEFAULT_MAX_CANDIDATES, RegistryError, generate_token,
};
pub use relay::{BridgeStats, RelayBridge};
pub use transport::{BoxedDuplex, Channel, Duplex, MEMORY_CHANNEL_BUFFER, MemoryTransport, Transport};
