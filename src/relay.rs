//! # Relay Bridge
//!
//! Couples two logical channels into one full-duplex pipe. Used by a relay
//! responder once a `relay` request has been matched to a candidate: the
//! requester's `relay:<id>` channel on one side, the candidate's stream on
//! the other.
//!
//! Each direction is an independent copy loop. When one side reaches
//! end-of-input the loop shuts down the *other* side's write half, so a
//! half-close travels through the relay exactly as it would over a direct
//! connection. The bridge finishes once both directions have finished and
//! reports how many bytes each direction carried.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::transport::Duplex;

/// Size of the per-direction copy buffer.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Byte counts of a finished bridge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

impl BridgeStats {
    pub fn total(&self) -> u64 {
        self.a_to_b.saturating_add(self.b_to_a)
    }
}

/// Spawns bridges between pairs of streams.
#[derive(Debug)]
pub struct RelayBridge;

impl RelayBridge {
    /// Bridge `a` and `b` on a background task.
    ///
    /// `label` only identifies the bridge in logs.
    pub fn spawn<A, B>(label: impl Into<String>, a: A, b: B) -> JoinHandle<BridgeStats>
    where
        A: Duplex,
        B: Duplex,
    {
        let label = label.into();
        tokio::spawn(async move {
            let stats = Self::run(a, b).await;
            debug!(
                bridge = %label,
                a_to_b = stats.a_to_b,
                b_to_a = stats.b_to_a,
                "relay bridge finished"
            );
            stats
        })
    }

    /// Bridge `a` and `b` until both directions have ended.
    pub async fn run<A, B>(a: A, b: B) -> BridgeStats
    where
        A: Duplex,
        B: Duplex,
    {
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let (a_to_b, b_to_a) = tokio::join!(pump(a_read, b_write), pump(b_read, a_write));
        BridgeStats { a_to_b, b_to_a }
    }
}

/// Copy until end-of-input or error, then close the writer.
async fn pump<R, W>(mut reader: R, mut writer: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut copied: u64 = 0;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                trace!(error = %e, "relay read ended");
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            trace!(error = %e, "relay write failed");
            break;
        }
        copied += n as u64;
    }
    let _ = writer.shutdown().await;
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn bytes_flow_both_ways() {
        let (mut left, bridge_a) = tokio::io::duplex(1024);
        let (bridge_b, mut right) = tokio::io::duplex(1024);
        let handle = RelayBridge::spawn("test", bridge_a, bridge_b);

        left.write_all(b"hello right").await.unwrap();
        let mut buf = [0u8; 11];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello right");

        right.write_all(b"hi left").await.unwrap();
        let mut buf = [0u8; 7];
        left.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi left");

        left.shutdown().await.unwrap();
        right.shutdown().await.unwrap();
        let stats = timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(stats, BridgeStats { a_to_b: 11, b_to_a: 7 });
        assert_eq!(stats.total(), 18);
    }

    #[tokio::test]
    async fn half_close_propagates_each_way() {
        let (mut left, bridge_a) = tokio::io::duplex(1024);
        let (bridge_b, mut right) = tokio::io::duplex(1024);
        let handle = RelayBridge::spawn("test", bridge_a, bridge_b);

        left.write_all(b"request").await.unwrap();
        left.shutdown().await.unwrap();

        // Right sees the data and then end-of-stream, but can still answer.
        let mut received = Vec::new();
        timeout(WAIT, right.read_to_end(&mut received)).await.unwrap().unwrap();
        assert_eq!(received, b"request");

        right.write_all(b"response").await.unwrap();
        right.shutdown().await.unwrap();

        let mut received = Vec::new();
        timeout(WAIT, left.read_to_end(&mut received)).await.unwrap().unwrap();
        assert_eq!(received, b"response");

        let stats = timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(stats.a_to_b, 7);
        assert_eq!(stats.b_to_a, 8);
    }

    #[tokio::test]
    async fn large_transfer_arrives_in_order() {
        let (mut left, bridge_a) = tokio::io::duplex(4096);
        let (bridge_b, mut right) = tokio::io::duplex(4096);
        let handle = RelayBridge::spawn("bulk", bridge_a, bridge_b);

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            left.write_all(&payload).await.unwrap();
            left.shutdown().await.unwrap();
            left
        });

        let mut received = Vec::new();
        timeout(WAIT, right.read_to_end(&mut received)).await.unwrap().unwrap();
        assert_eq!(received, expected);

        right.shutdown().await.unwrap();
        let _left = writer.await.unwrap();
        let stats = timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(stats.a_to_b, 200_000);
    }

    #[tokio::test]
    async fn dropped_side_ends_the_other() {
        let (left, bridge_a) = tokio::io::duplex(1024);
        let (bridge_b, mut right) = tokio::io::duplex(1024);
        let handle = RelayBridge::spawn("drop", bridge_a, bridge_b);

        drop(left);
        let mut received = Vec::new();
        timeout(WAIT, right.read_to_end(&mut received)).await.unwrap().unwrap();
        assert!(received.is_empty());

        drop(right);
        let stats = timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(stats.total(), 0);
    }
}
