//! Transport abstraction layer for reverse tunnel agents
//!
//! This crate defines the secure-transport surface that a tunnel agent
//! consumes without depending on any concrete connection library. A dialed
//! connection exposes out-of-channel requests, multiplexed channels and the
//! principals the remote peer presented during the handshake.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Tunnel Agent                          │
//! │        (lifecycle, heartbeat, version handshake)         │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            localup-transport (this crate)                │
//! │  - Dialer               - SecureConnection               │
//! │  - Channel / NewChannel - TransportBuilder               │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌──────────────┬──────────────┬─────────────────────────────┐
//! │ ssh-style    │ QUIC         │ mock (feature = "mock")      │
//! │ transports   │ transports   │ deterministic test fakes     │
//! └──────────────┴──────────────┴─────────────────────────────┘
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Channel {kind} rejected: {reason}")]
    ChannelRejected { kind: String, reason: String },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Answer to a request that asked for a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestReply {
    pub ok: bool,
    pub payload: Bytes,
}

/// An inbound request, either global (out-of-channel) or scoped to a channel
///
/// Requests that want a reply carry the sending half of a reply slot; the
/// transport forwards whatever is written to it back to the peer.
#[derive(Debug)]
pub struct Request {
    pub kind: String,
    pub want_reply: bool,
    pub payload: Bytes,
    reply: Option<oneshot::Sender<RequestReply>>,
}

impl Request {
    /// Build a request. The receiver is returned only when a reply is wanted.
    pub fn new(
        kind: impl Into<String>,
        want_reply: bool,
        payload: Bytes,
    ) -> (Self, Option<oneshot::Receiver<RequestReply>>) {
        let (reply, rx) = if want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        (
            Self {
                kind: kind.into(),
                want_reply,
                payload,
                reply,
            },
            rx,
        )
    }

    /// Reply to the request. A no-op for requests that did not want a reply.
    pub fn reply(mut self, ok: bool, payload: Bytes) -> TransportResult<()> {
        match self.reply.take() {
            Some(tx) => tx
                .send(RequestReply { ok, payload })
                .map_err(|_| TransportError::ConnectionClosed),
            None => Ok(()),
        }
    }
}

/// Stream of inbound requests. Closed when the peer goes away.
pub type RequestStream = mpsc::Receiver<Request>;

/// Stream of channel-open requests initiated by the peer
pub type NewChannelStream = mpsc::Receiver<Box<dyn NewChannel>>;

/// One multiplexed channel over a secure connection
#[async_trait]
pub trait Channel: Send + Sync + Debug {
    /// Send a channel-scoped request.
    ///
    /// Returns the peer's answer when `want_reply` is set, `false` otherwise.
    async fn send_request(
        &mut self,
        name: &str,
        want_reply: bool,
        payload: Bytes,
    ) -> TransportResult<bool>;

    /// Write application bytes to the channel
    async fn send_bytes(&mut self, data: &[u8]) -> TransportResult<()>;

    /// Read application bytes (empty when the channel is closed)
    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Bytes>;

    /// Close the channel
    async fn close(&mut self) -> TransportResult<()>;
}

/// A channel-open request received from the peer
#[async_trait]
pub trait NewChannel: Send + Debug {
    /// The channel type requested by the peer
    fn channel_type(&self) -> &str;

    /// Accept the channel
    async fn accept(self: Box<Self>) -> TransportResult<(Box<dyn Channel>, RequestStream)>;

    /// Reject the channel with a human-readable reason
    async fn reject(self: Box<Self>, reason: &str) -> TransportResult<()>;
}

/// An established secure-transport connection
#[async_trait]
pub trait SecureConnection: Send + Sync + Debug {
    /// Identities presented by the remote peer during the handshake
    fn principals(&self) -> Vec<String>;

    /// Open a new multiplexed channel of the given type
    async fn open_channel(
        &self,
        kind: &str,
        data: Bytes,
    ) -> TransportResult<(Box<dyn Channel>, RequestStream)>;

    /// Close the connection. Closing twice reports `ConnectionClosed`.
    async fn close(&self) -> TransportResult<()>;

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;

    /// Get the remote peer address
    fn remote_address(&self) -> String;
}

/// A freshly dialed connection and the inbound streams it owns
///
/// The streams are separated from the handle so that each can be owned by
/// exactly one consumer.
pub struct Connection {
    pub handle: Arc<dyn SecureConnection>,
    pub requests: RequestStream,
    pub channels: NewChannelStream,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Client-side: establishes outgoing secure connections
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to the given `host:port` address
    async fn dial(&self, addr: &str) -> TransportResult<Connection>;
}

/// Carries proxied traffic for one accepted channel
#[async_trait]
pub trait TunnelTransport: Send {
    /// Serve the channel until it is closed or cancelled
    async fn serve(self: Box<Self>);
}

/// Factory turning an accepted channel into a tunnel transport
pub trait TransportBuilder: Send + Sync {
    fn build(
        &self,
        cancel: CancellationToken,
        channel: Box<dyn Channel>,
        requests: RequestStream,
        conn: Arc<dyn SecureConnection>,
    ) -> Box<dyn TunnelTransport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_reply_delivered() {
        let (req, rx) = Request::new("version", true, Bytes::new());
        assert!(req.want_reply);

        req.reply(true, Bytes::from_static(b"1.2.3")).unwrap();

        let reply = rx.unwrap().await.unwrap();
        assert!(reply.ok);
        assert_eq!(reply.payload, Bytes::from_static(b"1.2.3"));
    }

    #[tokio::test]
    async fn test_request_without_reply_is_noop() {
        let (req, rx) = Request::new("ping", false, Bytes::new());
        assert!(rx.is_none());
        assert!(req.reply(false, Bytes::new()).is_ok());
    }

    #[tokio::test]
    async fn test_reply_after_peer_gone() {
        let (req, rx) = Request::new("version", true, Bytes::new());
        drop(rx);

        let err = req.reply(true, Bytes::new()).unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));
    }

    #[test]
    fn test_transport_errors() {
        let err = TransportError::ConnectionError("test".to_string());
        assert!(err.to_string().contains("Connection error"));

        let err = TransportError::ChannelRejected {
            kind: "heartbeat".to_string(),
            reason: "nope".to_string(),
        };
        assert_eq!(err.to_string(), "Channel heartbeat rejected: nope");
    }
}
