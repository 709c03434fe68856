//! # Control Message Dispatcher
//!
//! A [`Dispatcher`] binds to one logical channel and turns it into a
//! command-tagged message protocol with two exchange styles:
//!
//! - **Fire-and-forget**: [`Dispatcher::send`]
//! - **Request/response**: [`Dispatcher::request`] returns a [`PendingReply`]
//!   resolved by exactly one reply frame
//!
//! ## Tasks
//!
//! The channel is split in two. A reader task decodes length-prefixed frames,
//! resolves replies against the pending-request table and forwards every
//! other frame to [`Dispatcher::next_inbound`]. A writer task serializes
//! outbound frames in order. Replies can therefore be awaited from any task
//! while the owner keeps polling for inbound commands.
//!
//! Outbound frames are encoded and checked against the frame size limit
//! before they are queued, so an oversized message fails its sender with
//! [`SessionError::Codec`] instead of vanishing in the writer.
//!
//! ## Fatal Conditions
//!
//! Undecodable or oversized frames, replies to unknown requests and
//! commands with no registered handler all surface as a [`ProtocolError`]
//! from `next_inbound`. The owning session treats every one of them as
//! fatal.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{ProtocolError, SessionError};
use crate::messages::{self, Frame, MAX_FRAME_SIZE};
use crate::transport::BoxedDuplex;

/// Capacity of the outbound frame queue.
/// Back-pressure applied when full to prevent unbounded queue growth.
const OUTBOUND_CHANNEL_SIZE: usize = 256;

/// Capacity of the inbound frame queue.
const INBOUND_CHANNEL_SIZE: usize = 256;

type PendingTable = Arc<Mutex<HashMap<u32, oneshot::Sender<Vec<u8>>>>>;

enum Outbound {
    Frame(Vec<u8>),
    Flush(oneshot::Sender<()>),
}

/// Encode `frame`, refusing anything the remote would reject as oversized.
fn encode_outbound(frame: &Frame, max_frame_size: usize) -> Result<Vec<u8>, SessionError> {
    let bytes = messages::encode_frame(frame)?;
    if bytes.len() > max_frame_size {
        return Err(SessionError::Codec(Box::new(bincode::ErrorKind::SizeLimit)));
    }
    Ok(bytes)
}

/// A dispatched inbound command.
#[derive(Debug)]
pub struct Inbound {
    pub command: String,
    pub payload: Vec<u8>,
    /// Present when the remote expects exactly one reply.
    pub responder: Option<Responder>,
}

impl Inbound {
    /// Decode the payload, mapping failures to a protocol violation.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        messages::deserialize_bounded(&self.payload)
            .map_err(|_| ProtocolError::InvalidPayload(self.command.clone()))
    }
}

/// Sends the single reply to an inbound request. Can be moved into other tasks.
#[derive(Debug)]
pub struct Responder {
    outbound: mpsc::Sender<Outbound>,
    request_id: u32,
    max_frame_size: usize,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outbound::Frame(bytes) => f.debug_tuple("Frame").field(&bytes.len()).finish(),
            Outbound::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl Responder {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Send the reply. A reply too large for one frame fails with
    /// [`SessionError::Codec`] and the request stays unanswered.
    pub async fn respond<T: Serialize>(self, payload: &T) -> Result<(), SessionError> {
        let frame = Frame::Reply {
            request_id: self.request_id,
            payload: messages::serialize(payload)?,
        };
        let bytes = encode_outbound(&frame, self.max_frame_size)?;
        self.outbound
            .send(Outbound::Frame(bytes))
            .await
            .map_err(|_| SessionError::Closed)
    }
}

/// Reply to a request sent with [`Dispatcher::request`].
#[derive(Debug)]
pub struct PendingReply {
    command: &'static str,
    rx: oneshot::Receiver<Vec<u8>>,
}

impl PendingReply {
    /// Wait for the raw reply payload.
    pub async fn recv(self) -> Result<Vec<u8>, SessionError> {
        self.rx.await.map_err(|_| SessionError::Closed)
    }

    /// Wait for the reply and decode it. A reply of the wrong shape is a
    /// local error: it fails this call without touching the session.
    pub async fn decode<T: DeserializeOwned>(self) -> Result<T, SessionError> {
        let command = self.command;
        let bytes = self.recv().await?;
        messages::deserialize_bounded(&bytes).map_err(|_| SessionError::InvalidResponse(command))
    }
}

/// Sending side of a dispatcher. Cheap to clone.
#[derive(Clone, Debug)]
pub struct DispatchSender {
    outbound: mpsc::Sender<Outbound>,
    pending: PendingTable,
    next_request_id: Arc<AtomicU32>,
    max_frame_size: usize,
}

impl DispatchSender {
    pub async fn send<T: Serialize>(&self, command: &str, payload: &T) -> Result<(), SessionError> {
        let frame = Frame::Message {
            command: command.to_string(),
            request_id: None,
            payload: messages::serialize(payload)?,
        };
        let bytes = encode_outbound(&frame, self.max_frame_size)?;
        self.outbound
            .send(Outbound::Frame(bytes))
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub async fn request<T: Serialize>(
        &self,
        command: &'static str,
        payload: &T,
    ) -> Result<PendingReply, SessionError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Message {
            command: command.to_string(),
            request_id: Some(request_id),
            payload: messages::serialize(payload)?,
        };
        let bytes = encode_outbound(&frame, self.max_frame_size)?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| SessionError::Closed)?
            .insert(request_id, tx);
        if self.outbound.send(Outbound::Frame(bytes)).await.is_err() {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&request_id);
            }
            return Err(SessionError::Closed);
        }
        Ok(PendingReply { command, rx })
    }

    /// Resolves once every frame queued before this call has been written.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.outbound.send(Outbound::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Command-tagged message protocol over one logical channel.
pub struct Dispatcher {
    sender: DispatchSender,
    inbound: mpsc::Receiver<Result<Frame, ProtocolError>>,
    handlers: HashSet<String>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handlers)
            .finish()
    }
}

impl Dispatcher {
    /// Bind to `channel` with the default frame size limit.
    pub fn new(channel: BoxedDuplex) -> Self {
        Self::with_max_frame_size(channel, MAX_FRAME_SIZE)
    }

    /// Bind to `channel`, spawning the reader and writer tasks.
    pub fn with_max_frame_size(channel: BoxedDuplex, max_frame_size: usize) -> Self {
        let (reader, writer) = tokio::io::split(channel);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(write_frames(writer, outbound_rx));
        tokio::spawn(read_frames(reader, inbound_tx, pending.clone(), max_frame_size));

        Self {
            sender: DispatchSender {
                outbound: outbound_tx,
                pending,
                next_request_id: Arc::new(AtomicU32::new(0)),
                max_frame_size,
            },
            inbound: inbound_rx,
            handlers: HashSet::new(),
        }
    }

    /// Accept inbound frames tagged `command`.
    pub fn register(&mut self, command: &str) {
        self.handlers.insert(command.to_string());
    }

    pub fn unregister(&mut self, command: &str) {
        self.handlers.remove(command);
    }

    pub fn is_registered(&self, command: &str) -> bool {
        self.handlers.contains(command)
    }

    pub fn sender(&self) -> DispatchSender {
        self.sender.clone()
    }

    pub async fn send<T: Serialize>(&self, command: &str, payload: &T) -> Result<(), SessionError> {
        self.sender.send(command, payload).await
    }

    pub async fn request<T: Serialize>(
        &self,
        command: &'static str,
        payload: &T,
    ) -> Result<PendingReply, SessionError> {
        self.sender.request(command, payload).await
    }

    pub async fn flush(&self) {
        self.sender.flush().await
    }

    /// Wait for the next inbound command.
    ///
    /// Returns `Ok(None)` once the channel has ended. Cancel-safe.
    pub async fn next_inbound(&mut self) -> Result<Option<Inbound>, ProtocolError> {
        let frame = match self.inbound.recv().await {
            Some(frame) => frame?,
            None => return Ok(None),
        };
        match frame {
            Frame::Message {
                command,
                request_id,
                payload,
            } => {
                if !self.handlers.contains(&command) {
                    return Err(ProtocolError::UnknownCommand(command));
                }
                let responder = request_id.map(|request_id| Responder {
                    outbound: self.sender.outbound.clone(),
                    request_id,
                    max_frame_size: self.sender.max_frame_size,
                });
                Ok(Some(Inbound {
                    command,
                    payload,
                    responder,
                }))
            }
            // The reader task resolves replies itself.
            Frame::Reply { request_id, .. } => Err(ProtocolError::UnexpectedReply(request_id)),
        }
    }
}

async fn write_frames(mut writer: WriteHalf<BoxedDuplex>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Frame(bytes) => {
                let len = bytes.len() as u32;
                if let Err(e) = write_one(&mut writer, len, &bytes).await {
                    debug!(error = %e, "control channel write failed");
                    break;
                }
            }
            Outbound::Flush(ack) => {
                let _ = writer.flush().await;
                let _ = ack.send(());
            }
        }
    }
    let _ = writer.shutdown().await;
    trace!("dispatcher writer finished");
}

async fn write_one(
    writer: &mut WriteHalf<BoxedDuplex>,
    len: u32,
    bytes: &[u8],
) -> std::io::Result<()> {
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn read_frames(
    mut reader: ReadHalf<BoxedDuplex>,
    tx: mpsc::Sender<Result<Frame, ProtocolError>>,
    pending: PendingTable,
    max_frame_size: usize,
) {
    loop {
        let mut len_buf = [0u8; 4];
        if let Err(e) = reader.read_exact(&mut len_buf).await {
            trace!(error = %e, "control channel ended");
            break;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > max_frame_size {
            warn!(size = len, max = max_frame_size, "peer sent oversized frame");
            let _ = tx.send(Err(ProtocolError::InvalidFrame)).await;
            break;
        }

        let mut bytes = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut bytes).await {
            trace!(error = %e, "control channel ended mid-frame");
            break;
        }

        let frame = match messages::decode_frame(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "failed to decode frame");
                let _ = tx.send(Err(ProtocolError::InvalidFrame)).await;
                break;
            }
        };

        if let Frame::Reply { request_id, payload } = frame {
            let waiter = pending.lock().ok().and_then(|mut p| p.remove(&request_id));
            match waiter {
                Some(waiter) => {
                    // The requester may have given up; that is not the remote's fault.
                    let _ = waiter.send(payload);
                    continue;
                }
                None => {
                    let _ = tx.send(Err(ProtocolError::UnexpectedReply(request_id))).await;
                    break;
                }
            }
        }

        if tx.send(Ok(frame)).await.is_err() {
            break;
        }
    }
    // Dropping the waiters fails every outstanding request.
    if let Ok(mut p) = pending.lock() {
        p.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CMD_GET_PEERS, CMD_HELLO};
    use crate::transport::{MemoryTransport, Transport};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn pair() -> (Dispatcher, Dispatcher) {
        let (a, b) = MemoryTransport::pair();
        let ca = a.open_channel("pxp").await.unwrap();
        let cb = b.open_channel("pxp").await.unwrap();
        (Dispatcher::new(ca), Dispatcher::new(cb))
    }

    async fn raw_pair() -> (Dispatcher, BoxedDuplex) {
        let (a, b) = MemoryTransport::pair();
        let ca = a.open_channel("pxp").await.unwrap();
        let cb = b.open_channel("pxp").await.unwrap();
        (Dispatcher::new(ca), cb)
    }

    #[tokio::test]
    async fn simple_send_receive() {
        let (sender, mut receiver) = pair().await;
        receiver.register(CMD_HELLO);

        sender.send(CMD_HELLO, &"foo".to_string()).await.unwrap();

        let msg = timeout(WAIT, receiver.next_inbound()).await.unwrap().unwrap().unwrap();
        assert_eq!(msg.command, CMD_HELLO);
        assert!(msg.responder.is_none());
        assert_eq!(msg.decode::<String>().unwrap(), "foo");
    }

    #[tokio::test]
    async fn multiple_args_arrive_as_tuple() {
        let (sender, mut receiver) = pair().await;
        receiver.register(CMD_HELLO);

        sender.send(CMD_HELLO, &(1u32, 2u32, 3u32)).await.unwrap();

        let msg = timeout(WAIT, receiver.next_inbound()).await.unwrap().unwrap().unwrap();
        assert_eq!(msg.decode::<(u32, u32, u32)>().unwrap(), (1, 2, 3));
    }

    #[tokio::test]
    async fn request_and_reply() {
        let (requester, mut responder) = pair().await;
        responder.register(CMD_GET_PEERS);

        let pending = requester.request(CMD_GET_PEERS, &"foo".to_string()).await.unwrap();

        let msg = timeout(WAIT, responder.next_inbound()).await.unwrap().unwrap().unwrap();
        assert_eq!(msg.decode::<String>().unwrap(), "foo");
        msg.responder.expect("request carries a responder").respond(&false).await.unwrap();

        let reply: bool = timeout(WAIT, pending.decode()).await.unwrap().unwrap();
        assert!(!reply);
    }

    #[tokio::test]
    async fn replies_resolve_out_of_order() {
        let (requester, mut responder) = pair().await;
        responder.register(CMD_GET_PEERS);

        let first = requester.request(CMD_GET_PEERS, &1u32).await.unwrap();
        let second = requester.request(CMD_GET_PEERS, &2u32).await.unwrap();

        let m1 = responder.next_inbound().await.unwrap().unwrap();
        let m2 = responder.next_inbound().await.unwrap().unwrap();
        m2.responder.unwrap().respond(&20u32).await.unwrap();
        m1.responder.unwrap().respond(&10u32).await.unwrap();

        assert_eq!(timeout(WAIT, second.decode::<u32>()).await.unwrap().unwrap(), 20);
        assert_eq!(timeout(WAIT, first.decode::<u32>()).await.unwrap().unwrap(), 10);
    }

    #[tokio::test]
    async fn malformed_reply_is_local_error() {
        let (requester, mut responder) = pair().await;
        responder.register(CMD_GET_PEERS);

        let pending = requester.request(CMD_GET_PEERS, &()).await.unwrap();
        let msg = responder.next_inbound().await.unwrap().unwrap();
        msg.responder.unwrap().respond(&1u8).await.unwrap();

        let err = timeout(WAIT, pending.decode::<(String, u64)>()).await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::InvalidResponse(CMD_GET_PEERS)));
    }

    #[tokio::test]
    async fn oversized_outbound_frames_fail_the_sender() {
        let (requester, mut responder) = pair().await;
        responder.register(CMD_GET_PEERS);

        let huge = vec![0u8; MAX_FRAME_SIZE];
        let err = requester.send(CMD_GET_PEERS, &huge).await.unwrap_err();
        assert!(matches!(err, SessionError::Codec(_)));
        let err = requester.request(CMD_GET_PEERS, &huge).await.unwrap_err();
        assert!(matches!(err, SessionError::Codec(_)));
        assert!(requester.sender.pending.lock().unwrap().is_empty());

        // Payload under the limit, frame over it.
        let pending = requester.request(CMD_GET_PEERS, &()).await.unwrap();
        let msg = timeout(WAIT, responder.next_inbound()).await.unwrap().unwrap().unwrap();
        let err = msg
            .responder
            .unwrap()
            .respond(&vec![0u8; MAX_FRAME_SIZE - 10])
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Codec(_)));

        // The channel still works after the refusal.
        let again = requester.request(CMD_GET_PEERS, &()).await.unwrap();
        let msg = timeout(WAIT, responder.next_inbound()).await.unwrap().unwrap().unwrap();
        msg.responder.unwrap().respond(&7u32).await.unwrap();
        assert_eq!(timeout(WAIT, again.decode::<u32>()).await.unwrap().unwrap(), 7);
        drop(pending);
    }

    #[tokio::test]
    async fn unknown_command_is_protocol_error() {
        let (sender, mut receiver) = pair().await;
        receiver.register(CMD_HELLO);

        sender.send("notacommand", &true).await.unwrap();

        let err = timeout(WAIT, receiver.next_inbound()).await.unwrap().unwrap_err();
        assert_eq!(err, ProtocolError::UnknownCommand("notacommand".into()));
        assert_eq!(err.to_string(), "Peer sent unknown PXP message: \"notacommand\"");
    }

    #[tokio::test]
    async fn unregistered_command_is_rejected() {
        let (sender, mut receiver) = pair().await;
        receiver.register(CMD_HELLO);
        receiver.unregister(CMD_HELLO);
        assert!(!receiver.is_registered(CMD_HELLO));

        sender.send(CMD_HELLO, &()).await.unwrap();
        let err = timeout(WAIT, receiver.next_inbound()).await.unwrap().unwrap_err();
        assert_eq!(err, ProtocolError::UnknownCommand(CMD_HELLO.into()));
    }

    #[tokio::test]
    async fn incorrect_frame_is_protocol_error() {
        let (mut receiver, mut raw) = raw_pair().await;
        receiver.register(CMD_HELLO);

        let garbage = [0xFFu8, 0xFE, 0xFD];
        raw.write_all(&(garbage.len() as u32).to_be_bytes()).await.unwrap();
        raw.write_all(&garbage).await.unwrap();

        let err = timeout(WAIT, receiver.next_inbound()).await.unwrap().unwrap_err();
        assert_eq!(err, ProtocolError::InvalidFrame);
        assert_eq!(err.to_string(), "Peer sent invalid PXP message");
    }

    #[tokio::test]
    async fn oversized_frame_is_protocol_error() {
        let (mut receiver, mut raw) = raw_pair().await;
        raw.write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes()).await.unwrap();

        let err = timeout(WAIT, receiver.next_inbound()).await.unwrap().unwrap_err();
        assert_eq!(err, ProtocolError::InvalidFrame);
    }

    #[tokio::test]
    async fn unexpected_reply_is_protocol_error() {
        let (mut receiver, mut raw) = raw_pair().await;
        let bytes = messages::encode_frame(&Frame::Reply {
            request_id: 42,
            payload: vec![],
        })
        .unwrap();
        raw.write_all(&(bytes.len() as u32).to_be_bytes()).await.unwrap();
        raw.write_all(&bytes).await.unwrap();

        let err = timeout(WAIT, receiver.next_inbound()).await.unwrap().unwrap_err();
        assert_eq!(err, ProtocolError::UnexpectedReply(42));
    }

    #[tokio::test]
    async fn channel_end_fails_pending_requests() {
        let (requester, mut raw) = raw_pair().await;
        let pending = requester.request(CMD_GET_PEERS, &()).await.unwrap();
        requester.flush().await;
        raw.shutdown().await.unwrap();
        drop(raw);

        let err = timeout(WAIT, pending.recv()).await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Closed));
    }

    #[tokio::test]
    async fn channel_end_yields_none() {
        let (mut receiver, raw) = raw_pair().await;
        drop(raw);
        let next = timeout(WAIT, receiver.next_inbound()).await.unwrap().unwrap();
        assert!(next.is_none());
    }
}
