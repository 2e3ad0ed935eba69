//! Client handle definition
//!
//! Represents one accepted connection as seen by the rest of the server:
//! its identity, its bounded outbound queue and its close-once state.
//! The handle is cheap to clone; the hub and both connection loops each
//! hold one.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::SendError;
use crate::types::ClientId;

/// Why a connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer hung up or the read failed
    ReadLoopExit,
    /// Nothing received within the idle timeout
    IdleTimeout,
    /// A write failed or missed its deadline
    WriteFailed,
    /// The client sent `/quit`
    UserQuit,
    /// The outbound queue was full when the hub delivered to it
    SlowConsumer,
    /// The server is stopping
    ServerShutdown,
    /// The hub stopped answering requests
    HubStopped,
}

impl CloseReason {
    /// Whether lines already queued should still be written out
    pub fn drains_outbound(self) -> bool {
        matches!(self, CloseReason::UserQuit | CloseReason::ServerShutdown)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            CloseReason::ReadLoopExit => "read loop exit",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::WriteFailed => "write failed",
            CloseReason::UserQuit => "user quit",
            CloseReason::SlowConsumer => "slow consumer",
            CloseReason::ServerShutdown => "server shutdown",
            CloseReason::HubStopped => "hub stopped",
        };
        f.write_str(reason)
    }
}

#[derive(Debug)]
struct Inner {
    id: ClientId,
    addr: SocketAddr,
    /// Lines waiting for the outbound loop
    outbound: mpsc::Sender<String>,
    /// Set by the first close, never changed afterwards
    closed: OnceLock<CloseReason>,
    /// Wakes both connection loops on close
    close_signal: CancellationToken,
    /// Hub's unregister channel
    unregister: mpsc::UnboundedSender<ClientId>,
}

/// Connected client handle
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Create a handle around the sending side of an outbound queue
    pub fn new(
        id: ClientId,
        addr: SocketAddr,
        outbound: mpsc::Sender<String>,
        unregister: mpsc::UnboundedSender<ClientId>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                addr,
                outbound,
                closed: OnceLock::new(),
                close_signal: CancellationToken::new(),
                unregister,
            }),
        }
    }

    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Enqueue a line without waiting
    ///
    /// Fails with `SendError::Full` when the queue is at capacity.
    pub fn try_send(&self, line: String) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::ChannelClosed);
        }
        self.inner.outbound.try_send(line).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }

    /// Enqueue a line, waiting for space
    ///
    /// Used for the connection's own notices. Gives up once the client is
    /// closed.
    pub async fn send(&self, line: String) -> Result<(), SendError> {
        tokio::select! {
            biased;
            _ = self.inner.close_signal.cancelled() => Err(SendError::ChannelClosed),
            res = self.inner.outbound.send(line) => res.map_err(|_| SendError::ChannelClosed),
        }
    }

    /// Close the connection
    ///
    /// Only the first call has an effect: it records the reason, wakes both
    /// connection loops (which drop the socket) and tells the hub to
    /// unregister this client. Never blocks. Returns whether this call did
    /// the closing.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.inner.closed.set(reason).is_err() {
            debug!("Client {} already closed, ignoring {}", self.inner.id, reason);
            return false;
        }
        info!("Closing client {} ({}): {}", self.inner.id, self.inner.addr, reason);
        self.inner.close_signal.cancel();
        // The hub may already be gone during shutdown
        let _ = self.inner.unregister.send(self.inner.id);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get().is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.closed.get().copied()
    }

    /// Completes once the client has been closed
    pub async fn closed(&self) {
        self.inner.close_signal.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(
        capacity: usize,
    ) -> (
        Client,
        mpsc::Receiver<String>,
        mpsc::UnboundedReceiver<ClientId>,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        let (unreg_tx, unreg_rx) = mpsc::unbounded_channel();
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        (Client::new(ClientId(7), addr, tx, unreg_tx), rx, unreg_rx)
    }

    #[tokio::test]
    async fn test_try_send_full_and_closed() {
        let (client, mut rx, _unreg) = test_client(1);

        assert_eq!(client.try_send("one".to_string()), Ok(()));
        assert_eq!(client.try_send("two".to_string()), Err(SendError::Full));
        assert_eq!(rx.recv().await.as_deref(), Some("one"));

        drop(rx);
        assert_eq!(
            client.try_send("three".to_string()),
            Err(SendError::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _rx, mut unreg) = test_client(4);

        assert!(!client.is_closed());
        assert!(client.close(CloseReason::UserQuit));
        assert!(!client.close(CloseReason::SlowConsumer));

        assert_eq!(client.close_reason(), Some(CloseReason::UserQuit));
        assert_eq!(unreg.recv().await, Some(ClientId(7)));
        assert!(unreg.try_recv().is_err());

        // The close signal has fired
        client.closed().await;
    }

    #[tokio::test]
    async fn test_closed_client_rejects_lines() {
        let (client, _rx, _unreg) = test_client(4);
        client.close(CloseReason::ServerShutdown);

        assert_eq!(
            client.try_send("late".to_string()),
            Err(SendError::ChannelClosed)
        );
        assert_eq!(
            client.send("late".to_string()).await,
            Err(SendError::ChannelClosed)
        );
    }

    #[test]
    fn test_drain_policy() {
        assert!(CloseReason::UserQuit.drains_outbound());
        assert!(CloseReason::ServerShutdown.drains_outbound());
        assert!(!CloseReason::SlowConsumer.drains_outbound());
        assert_eq!(CloseReason::SlowConsumer.to_string(), "slow consumer");
    }
}
