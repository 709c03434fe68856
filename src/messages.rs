//! # Wire Protocol Messages
//!
//! This module defines the frame format of the control channel and the typed
//! payloads of every PXP command. Frames and payloads are serialized using
//! bincode with size limits to prevent memory exhaustion.
//!
//! ## Commands
//!
//! | Command | Request Payload | Reply Payload |
//! |---------|-----------------|---------------|
//! | `hello` | [`Hello`] | (none) |
//! | `getpeers` | `String` network | [`GetPeersReply`] |
//! | `relay` | `String` candidate id | `Option<String>` error |
//! | `incoming` | `String` secondary id | `()` |
//! | `connect` | `String` network | `Option<String>` error |
//! | `upgrade` | [`UpgradeRequest`] | `Vec<u8>` (application-defined) |
//!
//! ## Framing
//!
//! Every frame is a 4-byte big-endian length followed by a bincode-encoded
//! [`Frame`]. Payloads inside a frame are themselves bincode-encoded, so a
//! command with several arguments travels as a tuple and a single argument
//! travels as itself.

use std::collections::BTreeMap;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Current PXP protocol version. Compared for exact equality.
pub const PROTOCOL_VERSION: u32 = 1;

/// Name of the reserved control channel.
pub const CONTROL_CHANNEL: &str = "pxp";

/// Maximum size of a single control frame (1 MiB).
/// SECURITY: Prevents memory exhaustion from oversized frames.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

pub const CMD_HELLO: &str = "hello";
pub const CMD_GET_PEERS: &str = "getpeers";
pub const CMD_RELAY: &str = "relay";
pub const CMD_INCOMING: &str = "incoming";
pub const CMD_CONNECT: &str = "connect";
pub const CMD_UPGRADE: &str = "upgrade";

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Channel name for an application data channel.
pub fn data_channel(network: &str) -> String {
    format!("data:{network}")
}

/// Channel name for a relay pipe.
pub fn relay_channel(candidate_id: &str) -> String {
    format!("relay:{candidate_id}")
}

/// A single control-channel frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// A command. `request_id` is set when the sender expects exactly one reply.
    Message {
        command: String,
        request_id: Option<u32>,
        payload: Vec<u8>,
    },
    /// The reply to an earlier `Message` carrying `request_id`.
    Reply { request_id: u32, payload: Vec<u8> },
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, bincode::Error> {
    serialize(frame)
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, bincode::Error> {
    deserialize_bounded(bytes)
}

/// Capability descriptor a node advertises for inbound connectivity.
///
/// Opaque to this layer apart from the two flags used as the discovery default.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    pub relay: bool,
    pub pxp: bool,
    pub attributes: BTreeMap<String, String>,
}

impl ConnectInfo {
    /// Descriptor reported for discovered peers that expose none of their own.
    pub fn relay_only() -> Self {
        Self {
            relay: true,
            pxp: false,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u32,
    pub connect_info: Option<ConnectInfo>,
    pub networks: Vec<String>,
}

/// A discovered peer as advertised to the requester of `getpeers`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub network: String,
    pub connect_info: Option<ConnectInfo>,
}

impl PeerRecord {
    pub fn is_well_formed(&self) -> bool {
        !self.id.is_empty() && !self.network.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPeersReply {
    pub error: Option<String>,
    pub peers: Vec<PeerRecord>,
}

impl GetPeersReply {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            peers: Vec::new(),
        }
    }
}

/// Out-of-band transport migration request carried by `upgrade`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRequest {
    pub transport: String,
    pub connect_info: ConnectInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = Frame::Message {
            command: CMD_GET_PEERS.to_string(),
            request_id: Some(7),
            payload: serialize(&"test".to_string()).unwrap(),
        };
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame(&bytes).unwrap(), frame);
    }

    #[test]
    fn malformed_data_rejected() {
        let garbage = vec![0xFF, 0xFE, 0xFD, 0xFC, 0xFB];
        assert!(decode_frame(&garbage).is_err());

        let frame = Frame::Reply {
            request_id: 1,
            payload: vec![1, 2, 3, 4],
        };
        let bytes = encode_frame(&frame).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(decode_frame(truncated).is_err());
    }

    #[test]
    fn oversized_length_rejected() {
        // A Vec<u8> claiming more than MAX_FRAME_SIZE bytes must not allocate.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&((MAX_FRAME_SIZE as u64) * 4).to_le_bytes());
        assert!(deserialize_bounded::<Vec<u8>>(&bytes).is_err());
    }

    #[test]
    fn hello_payload_decodes() {
        let hello = Hello {
            version: PROTOCOL_VERSION,
            connect_info: Some(ConnectInfo::default().with_attribute("webrtc", "true")),
            networks: vec!["foo".into()],
        };
        let bytes = serialize(&hello).unwrap();
        let decoded: Hello = deserialize_bounded(&bytes).unwrap();
        assert_eq!(decoded.networks, vec!["foo".to_string()]);
        assert_eq!(
            decoded.connect_info.unwrap().attributes.get("webrtc").map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn hello_rejects_wrong_shape() {
        // A bare boolean is not a Hello.
        let bytes = serialize(&true).unwrap();
        assert!(deserialize_bounded::<Hello>(&bytes).is_err());
    }

    #[test]
    fn channel_names() {
        assert_eq!(data_channel("test"), "data:test");
        assert_eq!(relay_channel("abcd"), "relay:abcd");
    }

    #[test]
    fn peer_record_shape() {
        let record = PeerRecord {
            id: "ab".into(),
            network: "test".into(),
            connect_info: None,
        };
        assert!(record.is_well_formed());
        assert!(!PeerRecord { id: String::new(), ..record.clone() }.is_well_formed());
        assert!(!PeerRecord { network: String::new(), ..record }.is_well_formed());
    }

    #[test]
    fn relay_only_defaults() {
        let info = ConnectInfo::relay_only();
        assert!(info.relay);
        assert!(!info.pxp);
        assert!(info.attributes.is_empty());
    }
}
