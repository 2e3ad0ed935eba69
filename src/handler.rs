//! TCP connection handler
//!
//! Handles individual client connections: greeting, registration with the
//! Hub, and the two loops that bridge the socket and the Hub. The read
//! loop parses lines into Hub requests or local replies; the write loop
//! drains the connection's outbound queue onto the socket.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::client::{Client, CloseReason};
use crate::codec::{Inbound, LineCodec};
use crate::config::Config;
use crate::error::AppError;
use crate::hub::HubHandle;
use crate::protocol::{self, is_command, Command};
use crate::types::ClientId;

/// A registered connection whose loops have not started yet
#[derive(Debug)]
pub struct Session {
    client: Client,
    stream: TcpStream,
    outbound: mpsc::Receiver<String>,
    nickname: watch::Receiver<String>,
    hub: HubHandle,
    config: Arc<Config>,
}

/// Greet a freshly accepted connection and register it with the Hub
///
/// Welcome and identity lines go straight into the connection's own
/// queue, ahead of anything the Hub sends. Returns once the Hub has the
/// client in its registry.
pub async fn open_session(
    stream: TcpStream,
    addr: SocketAddr,
    id: ClientId,
    hub: HubHandle,
    config: Arc<Config>,
) -> Result<Session, AppError> {
    let (out_tx, outbound) = mpsc::channel::<String>(config.outbound_capacity);
    let client = Client::new(id, addr, out_tx, hub.unregister_sender());

    let initial = id.default_nickname();
    let (nick_tx, nickname) = watch::channel(initial.clone());

    // Nothing drains the queue yet, so never wait on it here. A validated
    // config leaves room for these two lines plus the join notice.
    client.try_send(protocol::WELCOME.to_string())?;
    client.try_send(format!("You are {}", initial))?;

    hub.register(client.clone(), nick_tx).await?;
    debug!("Client {} registered from {}", id, addr);

    Ok(Session {
        client,
        stream,
        outbound,
        nickname,
        hub,
        config,
    })
}

impl Session {
    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    /// Run both connection loops until each has exited
    pub async fn run(self) {
        let Session {
            client,
            stream,
            outbound,
            nickname,
            hub,
            config,
        } = self;
        let id = client.id();
        let (read_half, write_half) = stream.into_split();

        // Spawn read task (socket -> Hub)
        let read_task = tokio::spawn(read_loop(
            client.clone(),
            read_half,
            nickname,
            hub,
            Arc::clone(&config),
        ));

        // Spawn write task (outbound queue -> socket)
        let write_task = tokio::spawn(write_loop(
            client.clone(),
            write_half,
            outbound,
            config,
        ));

        let (read_res, write_res) = tokio::join!(read_task, write_task);
        if let Err(e) = read_res {
            warn!("Read task for {} failed: {}", id, e);
        }
        if let Err(e) = write_res {
            warn!("Write task for {} failed: {}", id, e);
        }

        // A panicking loop never closed the client
        client.close(CloseReason::ReadLoopExit);
        info!("Client {} disconnected", id);
    }
}

/// Read lines until the peer goes away, idles out, quits or is closed
async fn read_loop(
    client: Client,
    read_half: OwnedReadHalf,
    nickname: watch::Receiver<String>,
    hub: HubHandle,
    config: Arc<Config>,
) {
    let id = client.id();
    let mut lines = FramedRead::new(read_half, LineCodec::new(config.max_message_bytes));

    let reason = loop {
        let deadline = Instant::now() + config.idle_timeout;
        let frame = tokio::select! {
            _ = client.closed() => break None,
            frame = tokio::time::timeout_at(deadline, lines.next()) => frame,
        };

        let frame = match frame {
            Err(_) => {
                debug!("Client {} idle for {:?}", id, config.idle_timeout);
                break Some(CloseReason::IdleTimeout);
            }
            Ok(None) => {
                debug!("Client {} closed the connection", id);
                break Some(CloseReason::ReadLoopExit);
            }
            Ok(Some(Err(e))) => {
                debug!("Read error from {}: {}", id, e);
                break Some(CloseReason::ReadLoopExit);
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let line = match frame {
            Inbound::TooLong => {
                debug!("Client {} sent an oversized line", id);
                let _ = client.send(protocol::MESSAGE_TOO_LONG.to_string()).await;
                continue;
            }
            Inbound::Line(line) => line,
        };
        if line.is_empty() {
            continue;
        }

        let flow = if is_command(&line) {
            handle_command(&client, &hub, Command::parse(&line)).await
        } else {
            let from = nickname.borrow().clone();
            match hub.broadcast(protocol::format_user_message(&from, &line)).await {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(CloseReason::HubStopped),
            }
        };

        if let ControlFlow::Break(reason) = flow {
            break Some(reason);
        }
    };

    if let Some(reason) = reason {
        client.close(reason);
    }
    debug!("Read task ended for {}", id);
}

/// Handle one `/command` line
///
/// Breaks with the reason the connection should close for, if any.
async fn handle_command(
    client: &Client,
    hub: &HubHandle,
    cmd: Command,
) -> ControlFlow<CloseReason> {
    let reply = match cmd.name.as_str() {
        "help" => protocol::HELP.to_string(),
        "nick" => {
            let Some(nickname) = cmd.args.first() else {
                return notify(client, protocol::NICK_USAGE.to_string()).await;
            };
            match hub.rename(client.id(), nickname.clone()).await {
                Ok(()) => format!("Your nick changed to {}", nickname),
                Err(AppError::HubStopped) => {
                    return ControlFlow::Break(CloseReason::HubStopped);
                }
                Err(e) => e.to_string(),
            }
        }
        "who" => match hub.who().await {
            Ok(list) => format!("Online: {}", list.join(", ")),
            Err(_) => return ControlFlow::Break(CloseReason::HubStopped),
        },
        "msg" => {
            let Some(to) = cmd.args.first() else {
                return notify(client, protocol::MSG_USAGE.to_string()).await;
            };
            let text = cmd.rest(1);
            if text.is_empty() {
                return notify(client, protocol::EMPTY_MESSAGE.to_string()).await;
            }
            return match hub
                .private_message(client.id(), to.clone(), text.to_string())
                .await
            {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(CloseReason::HubStopped),
            };
        }
        "quit" => {
            let _ = client.send(protocol::BYE.to_string()).await;
            return ControlFlow::Break(CloseReason::UserQuit);
        }
        _ => protocol::UNKNOWN_COMMAND.to_string(),
    };

    notify(client, reply).await
}

/// Queue a local notice for this connection
async fn notify(client: &Client, line: String) -> ControlFlow<CloseReason> {
    // A failed send means the client is already closing
    let _ = client.send(line).await;
    ControlFlow::Continue(())
}

/// Write queued lines until the queue closes, a write fails or the client
/// is closed
async fn write_loop(
    client: Client,
    write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<String>,
    config: Arc<Config>,
) {
    let id = client.id();
    let mut sink = FramedWrite::new(write_half, LineCodec::new(config.max_message_bytes));

    loop {
        let line = tokio::select! {
            biased;
            _ = client.closed() => {
                if client.close_reason().is_some_and(CloseReason::drains_outbound) {
                    drain(&mut sink, &mut outbound, &config).await;
                }
                break;
            }
            line = outbound.recv() => match line {
                Some(line) => line,
                None => {
                    debug!("Outbound queue for {} closed", id);
                    break;
                }
            },
        };

        match timeout(config.write_timeout, sink.send(line)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Write to {} failed: {}", id, e);
                client.close(CloseReason::WriteFailed);
                break;
            }
            Err(_) => {
                debug!("Write to {} timed out", id);
                client.close(CloseReason::WriteFailed);
                break;
            }
        }
    }

    debug!("Write task ended for {}", id);
}

/// Flush whatever is already queued, bounded by one write timeout
async fn drain(
    sink: &mut FramedWrite<OwnedWriteHalf, LineCodec>,
    outbound: &mut mpsc::Receiver<String>,
    config: &Config,
) {
    let flush = async {
        while let Ok(line) = outbound.try_recv() {
            sink.feed(line).await?;
        }
        sink.flush().await?;
        Ok::<_, std::io::Error>(())
    };
    match timeout(config.write_timeout, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Failed flushing queued lines: {}", e),
        Err(_) => debug!("Timed out flushing queued lines"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;
    use crate::hub::Hub;

    struct Peer {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Peer {
        async fn line(&mut self) -> String {
            let mut line = String::new();
            let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for a line")
                .unwrap();
            assert!(n > 0, "connection closed");
            line.trim_end().to_string()
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{}\n", line).as_bytes())
                .await
                .unwrap();
        }

        async fn closed(&mut self) -> bool {
            let mut rest = String::new();
            loop {
                rest.clear();
                match timeout(Duration::from_secs(5), self.reader.read_line(&mut rest)).await {
                    Ok(Ok(0)) | Ok(Err(_)) => return true,
                    Ok(Ok(_)) => continue,
                    Err(_) => return false,
                }
            }
        }
    }

    /// Accept one connection into a running Hub, returning the peer side
    async fn session(hub: &HubHandle, id: u64, config: Config) -> (Peer, Client) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).await.unwrap();
        let (stream, remote) = listener.accept().await.unwrap();

        let session = open_session(
            stream,
            remote,
            ClientId(id),
            hub.clone(),
            Arc::new(config),
        )
        .await
        .unwrap();
        let client = session.client().clone();
        tokio::spawn(session.run());

        let (read, writer) = peer.into_split();
        let mut peer = Peer {
            reader: BufReader::new(read),
            writer,
        };
        assert_eq!(peer.line().await, protocol::WELCOME);
        assert_eq!(peer.line().await, format!("You are user-{}", id));
        let joined = format!("* user-{} joined ({})", id, remote);
        assert!(peer.line().await.ends_with(&joined));
        (peer, client)
    }

    fn start_hub() -> HubHandle {
        let (hub, handle) = Hub::new(64);
        tokio::spawn(hub.run());
        handle
    }

    #[tokio::test]
    async fn test_local_commands() {
        let hub = start_hub();
        let (mut peer, _client) = session(&hub, 1, Config::default()).await;

        peer.send("/help").await;
        assert_eq!(peer.line().await, protocol::HELP);

        peer.send("/bogus").await;
        assert_eq!(peer.line().await, protocol::UNKNOWN_COMMAND);

        peer.send("/nick").await;
        assert_eq!(peer.line().await, protocol::NICK_USAGE);

        peer.send("/msg").await;
        assert_eq!(peer.line().await, protocol::MSG_USAGE);

        peer.send("/msg user-1   ").await;
        assert_eq!(peer.line().await, protocol::EMPTY_MESSAGE);

        // Empty lines are ignored entirely
        peer.send("").await;
        peer.send("/WHO").await;
        assert_eq!(peer.line().await, "Online: user-1");
    }

    #[tokio::test]
    async fn test_nick_and_chat() {
        let hub = start_hub();
        let (mut peer, _client) = session(&hub, 1, Config::default()).await;

        peer.send("/nick bad!name").await;
        assert!(peer.line().await.starts_with("Bad nick bad!name"));

        peer.send("/nick Alice").await;
        assert!(peer.line().await.ends_with("* user-1 changed nick to Alice"));
        assert_eq!(peer.line().await, "Your nick changed to Alice");

        peer.send("hello all").await;
        assert!(peer.line().await.ends_with("] Alice: hello all"));
    }

    #[tokio::test]
    async fn test_oversized_line_gets_notice() {
        let hub = start_hub();
        let config = Config {
            max_message_bytes: 8,
            ..Config::default()
        };
        let (mut peer, _client) = session(&hub, 1, config).await;

        peer.send("this line is far too long").await;
        assert_eq!(peer.line().await, protocol::MESSAGE_TOO_LONG);

        peer.send("short").await;
        assert!(peer.line().await.ends_with("] user-1: short"));
    }

    #[tokio::test]
    async fn test_quit_says_bye_and_unregisters() {
        let hub = start_hub();
        let (mut peer, client) = session(&hub, 1, Config::default()).await;

        peer.send("/quit").await;
        assert_eq!(peer.line().await, protocol::BYE);
        assert!(peer.closed().await);
        assert_eq!(client.close_reason(), Some(CloseReason::UserQuit));
        assert!(hub.who().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_connection() {
        let hub = start_hub();
        let config = Config {
            idle_timeout: Duration::from_millis(200),
            ..Config::default()
        };
        let (mut peer, client) = session(&hub, 1, config).await;

        assert!(peer.closed().await);
        assert_eq!(client.close_reason(), Some(CloseReason::IdleTimeout));
    }

    #[tokio::test]
    async fn test_peer_hangup_unregisters() {
        let hub = start_hub();
        let (peer_a, client_a) = session(&hub, 1, Config::default()).await;
        let (mut peer_b, _client_b) = session(&hub, 2, Config::default()).await;

        drop(peer_a);
        assert!(peer_b.line().await.ends_with("* user-1 left"));
        assert!(matches!(
            client_a.close_reason(),
            Some(CloseReason::ReadLoopExit | CloseReason::WriteFailed)
        ));
        assert_eq!(hub.who().await.unwrap(), vec!["user-2"]);
    }

    #[tokio::test]
    async fn test_smallest_outbound_queue_keeps_client() {
        let hub = start_hub();
        let config = Config {
            outbound_capacity: crate::config::MIN_OUTBOUND_CAPACITY,
            ..Config::default()
        };
        let (mut peer, client) = session(&hub, 1, config).await;

        assert_eq!(client.close_reason(), None);
        peer.send("/who").await;
        assert_eq!(peer.line().await, "Online: user-1");
    }

    #[tokio::test]
    async fn test_stalled_peer_fails_write_and_unregisters() {
        let hub = start_hub();
        let config = Config {
            write_timeout: Duration::from_millis(50),
            outbound_capacity: 256,
            ..Config::default()
        };
        // Peer stays connected but never reads again
        let (_peer, client) = session(&hub, 1, config).await;

        let chunk = "x".repeat(64 * 1024);
        timeout(Duration::from_secs(10), async {
            while !client.is_closed() {
                if client.try_send(chunk.clone()).is_err() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        })
        .await
        .expect("socket buffers never filled");
        assert_eq!(client.close_reason(), Some(CloseReason::WriteFailed));

        timeout(Duration::from_secs(5), async {
            while !hub.who().await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client still registered");
    }
}
