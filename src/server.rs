//! Chat server
//!
//! Owns the listening socket and the Hub task. Accepts connections,
//! turns away connections over the client limit, and runs the graceful
//! shutdown sequence: warn everyone, wait out the grace period, close
//! every connection, then wait for the Hub to finish.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::handler::open_session;
use crate::hub::{Hub, HubHandle};
use crate::protocol::{format_system_message, SERVER_FULL};
use crate::types::ClientIdGenerator;

/// Deadline for writing the rejection notice to a refused connection
const REJECT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a transient accept error
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The listening chat server
#[derive(Debug)]
pub struct ChatServer {
    listener: TcpListener,
    config: Arc<Config>,
    ids: ClientIdGenerator,
}

impl ChatServer {
    /// Validate the configuration and bind the listening socket
    pub async fn bind(config: Config) -> Result<Self, AppError> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr()).await?;
        Ok(Self {
            listener,
            config: Arc::new(config),
            ids: ClientIdGenerator::new(),
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` completes or the listener fails
    ///
    /// Returns only after the Hub loop has fully exited.
    pub async fn run<F>(self, shutdown: F) -> Result<(), AppError>
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Chat server listening on {}", addr);
        }

        let (hub, handle) = Hub::new(self.config.hub_capacity);
        let hub_task = tokio::spawn(hub.run());

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    self.shutdown(&handle, hub_task).await;
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.admit(stream, addr, &handle).await,
                    Err(e) if is_transient(&e) => {
                        warn!("Failed to accept connection: {}", e);
                        sleep(ACCEPT_RETRY_DELAY).await;
                    }
                    Err(e) => {
                        error!("Listener failed: {}", e);
                        handle.shutdown();
                        let _ = hub_task.await;
                        return Err(AppError::Io(e));
                    }
                },
            }
        }
    }

    /// Register an accepted connection or turn it away
    async fn admit(&self, stream: TcpStream, addr: SocketAddr, hub: &HubHandle) {
        let id = self.ids.next_id();
        let max = self.config.max_clients;
        if max > 0 && hub.client_count() >= max {
            warn!("Rejecting {} from {}: server full ({} clients)", id, addr, max);
            tokio::spawn(reject(stream));
            return;
        }

        info!("New connection {} from {}", id, addr);
        match open_session(stream, addr, id, hub.clone(), Arc::clone(&self.config)).await {
            Ok(session) => {
                tokio::spawn(session.run());
            }
            Err(e) => {
                warn!("Could not register {}: {}", id, e);
            }
        }
    }

    async fn shutdown(&self, hub: &HubHandle, hub_task: JoinHandle<()>) {
        let grace = self.config.shutdown_grace;
        info!("Shutdown requested, closing connections in {:?}", grace);

        let warning = shutdown_warning(grace);
        if hub.broadcast(format_system_message(&warning)).await.is_err() {
            debug!("Hub already stopped before the shutdown warning");
        }
        sleep(grace).await;

        hub.shutdown();
        if let Err(e) = hub_task.await {
            error!("Hub task failed: {}", e);
        }
        info!("Chat server stopped");
    }
}

/// Tell a refused connection why, then drop it
async fn reject(mut stream: TcpStream) {
    let notice = format!("{}\n", SERVER_FULL);
    match timeout(REJECT_WRITE_TIMEOUT, stream.write_all(notice.as_bytes())).await {
        Ok(Ok(())) => {
            let _ = stream.shutdown().await;
        }
        Ok(Err(e)) => debug!("Failed to send rejection: {}", e),
        Err(_) => debug!("Timed out sending rejection"),
    }
}

/// Shutdown notice text, with the grace period rounded up to whole seconds
fn shutdown_warning(grace: Duration) -> String {
    let secs = grace.as_secs() + u64::from(grace.subsec_nanos() > 0);
    format!("SERVER SHUTDOWN IN {} SECONDS", secs)
}

/// Accept errors that concern one connection rather than the listener
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[test]
    fn test_shutdown_warning_rounds_up() {
        assert_eq!(
            shutdown_warning(Duration::from_secs(3)),
            "SERVER SHUTDOWN IN 3 SECONDS"
        );
        assert_eq!(
            shutdown_warning(Duration::from_millis(100)),
            "SERVER SHUTDOWN IN 1 SECONDS"
        );
        assert_eq!(
            shutdown_warning(Duration::from_millis(2500)),
            "SERVER SHUTDOWN IN 3 SECONDS"
        );
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_message_bytes: 0,
            ..Config::default()
        };
        assert!(matches!(
            ChatServer::bind(config).await,
            Err(AppError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        };
        let server = ChatServer::bind(config).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }
}
