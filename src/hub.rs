//! Hub actor implementation
//!
//! The single owner of the client registry and the nickname table. Every
//! mutation of either happens inside [`Hub::run`], one request at a time,
//! so neither needs a lock. Connections talk to the hub only through a
//! [`HubHandle`].
//!
//! Delivery to a connection never waits: a full outbound queue gets the
//! connection closed as a slow consumer instead of stalling everyone else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{Client, CloseReason};
use crate::error::{AppError, SendError};
use crate::protocol::{format_private_message, format_system_message, is_valid_nickname};
use crate::types::ClientId;

/// Requests sent from connections to the Hub actor
///
/// Unregistration travels on its own unbounded channel, see
/// [`HubHandle::unregister`]; shutdown is a cancellation signal, see
/// [`HubHandle::shutdown`].
#[derive(Debug)]
pub enum HubCommand {
    /// New client accepted, holding `client.id().default_nickname()`
    Register {
        client: Client,
        /// Publishes the client's current nickname back to its connection
        nickname: watch::Sender<String>,
        /// Answered once the client is in the registry
        done: oneshot::Sender<()>,
    },
    /// Deliver an already formatted line to every client
    Broadcast { line: String },
    /// Deliver text to one client by nickname, echoed to the sender
    PrivateMessage {
        from: ClientId,
        to: String,
        text: String,
    },
    /// Change a client's nickname
    Rename {
        client_id: ClientId,
        nickname: String,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    /// List every registered nickname
    Who { reply: oneshot::Sender<Vec<String>> },
}

/// Registry entry
#[derive(Debug)]
struct Member {
    client: Client,
    nickname: String,
    nickname_tx: watch::Sender<String>,
}

/// The Hub actor
///
/// `clients` is the registry keyed by id; `nicknames` maps every held
/// nickname back to its owner. Invariant: `nicknames[n] == id` iff
/// `clients[id].nickname == n`.
#[derive(Debug)]
pub struct Hub {
    clients: HashMap<ClientId, Member>,
    nicknames: HashMap<String, ClientId>,
    receiver: mpsc::Receiver<HubCommand>,
    unregister_rx: mpsc::UnboundedReceiver<ClientId>,
    shutdown: CancellationToken,
    /// Registry size, readable from outside for admission control
    count: Arc<AtomicUsize>,
}

/// Cloneable sending side of the Hub
#[derive(Debug, Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubCommand>,
    unregister_tx: mpsc::UnboundedSender<ClientId>,
    shutdown: CancellationToken,
    count: Arc<AtomicUsize>,
}

impl Hub {
    /// Create a Hub and its handle; `capacity` bounds the request channel
    pub fn new(capacity: usize) -> (Self, HubHandle) {
        let (sender, receiver) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let count = Arc::new(AtomicUsize::new(0));

        let hub = Self {
            clients: HashMap::new(),
            nicknames: HashMap::new(),
            receiver,
            unregister_rx,
            shutdown: shutdown.clone(),
            count: Arc::clone(&count),
        };
        let handle = HubHandle {
            sender,
            unregister_tx,
            shutdown,
            count,
        };
        (hub, handle)
    }

    /// Run the Hub event loop
    ///
    /// Processes one request at a time until shutdown is signalled or every
    /// handle is dropped.
    pub async fn run(mut self) {
        info!("Hub started");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    self.close_all();
                    break;
                }
                Some(client_id) = self.unregister_rx.recv() => {
                    self.handle_unregister(client_id);
                }
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
            }
        }

        info!("Hub stopped");
    }

    /// Process a single request
    fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register {
                client,
                nickname,
                done,
            } => {
                self.handle_register(client, nickname);
                let _ = done.send(());
            }
            HubCommand::Broadcast { line } => self.deliver_all(line),
            HubCommand::PrivateMessage { from, to, text } => {
                self.handle_private_message(from, &to, &text);
            }
            HubCommand::Rename {
                client_id,
                nickname,
                reply,
            } => {
                let result = self.handle_rename(client_id, nickname);
                let _ = reply.send(result);
            }
            HubCommand::Who { reply } => {
                let _ = reply.send(self.nickname_list());
            }
        }
    }

    fn handle_register(&mut self, client: Client, nickname_tx: watch::Sender<String>) {
        let id = client.id();
        let nickname = id.default_nickname();
        let addr = client.addr();

        nickname_tx.send_replace(nickname.clone());
        self.nicknames.insert(nickname.clone(), id);
        self.clients.insert(
            id,
            Member {
                client,
                nickname: nickname.clone(),
                nickname_tx,
            },
        );
        self.update_count();

        info!("Client {} registered as {} from {}", id, nickname, addr);
        self.system_broadcast(&format!("* {} joined ({})", nickname, addr));
    }

    fn handle_unregister(&mut self, client_id: ClientId) {
        // Both connection loops may ask; only the first one counts
        let Some(member) = self.clients.remove(&client_id) else {
            debug!("Client {} already unregistered", client_id);
            return;
        };

        if self.nicknames.get(&member.nickname) == Some(&client_id) {
            self.nicknames.remove(&member.nickname);
        }
        self.update_count();

        info!("Client {} ({}) unregistered", client_id, member.nickname);
        debug!("Total clients: {}", self.clients.len());
        self.system_broadcast(&format!("* {} left", member.nickname));
    }

    fn handle_private_message(&self, from: ClientId, to: &str, text: &str) {
        let Some(sender) = self.clients.get(&from) else {
            return;
        };

        let Some(&recipient) = self.nicknames.get(to) else {
            self.deliver(&sender.client, format!("No such nick {}", to));
            return;
        };

        let line = format_private_message(&sender.nickname, to, text);
        // A message to yourself is delivered once (see DESIGN.md)
        if recipient != from {
            if let Some(member) = self.clients.get(&recipient) {
                self.deliver(&member.client, line.clone());
            }
        }
        self.deliver(&sender.client, line);
    }

    fn handle_rename(&mut self, client_id: ClientId, nickname: String) -> Result<(), AppError> {
        if !is_valid_nickname(&nickname) {
            return Err(AppError::InvalidNickname(nickname));
        }
        if let Some(&owner) = self.nicknames.get(&nickname) {
            if owner != client_id {
                return Err(AppError::NicknameInUse(nickname));
            }
        }
        let Some(member) = self.clients.get_mut(&client_id) else {
            return Err(AppError::UnknownClient(client_id));
        };
        if member.nickname == nickname {
            return Ok(());
        }

        let old = std::mem::replace(&mut member.nickname, nickname.clone());
        member.nickname_tx.send_replace(nickname.clone());
        self.nicknames.remove(&old);
        self.nicknames.insert(nickname.clone(), client_id);

        info!("Client {} renamed {} -> {}", client_id, old, nickname);
        self.system_broadcast(&format!("* {} changed nick to {}", old, nickname));
        Ok(())
    }

    fn nickname_list(&self) -> Vec<String> {
        self.clients.values().map(|m| m.nickname.clone()).collect()
    }

    fn system_broadcast(&self, text: &str) {
        self.deliver_all(format_system_message(text));
    }

    /// Hand a line to every registered client without waiting
    fn deliver_all(&self, line: String) {
        for member in self.clients.values() {
            self.deliver(&member.client, line.clone());
        }
    }

    fn deliver(&self, client: &Client, line: String) {
        match client.try_send(line) {
            Ok(()) => {}
            Err(SendError::Full) => {
                warn!("Client {} outbound queue full, dropping it", client.id());
                client.close(CloseReason::SlowConsumer);
            }
            Err(SendError::ChannelClosed) => {
                debug!("Client {} is closing, skipped delivery", client.id());
            }
        }
    }

    /// Close every registered client; the Hub accepts nothing afterwards
    fn close_all(&mut self) {
        info!("Hub shutting down, closing {} clients", self.clients.len());
        for member in self.clients.values() {
            member.client.close(CloseReason::ServerShutdown);
        }
        self.receiver.close();
    }

    fn update_count(&self) {
        self.count.store(self.clients.len(), Ordering::Release);
    }
}

impl HubHandle {
    /// Add a client to the registry under its default nickname
    ///
    /// Returns once the Hub has processed the request, so the client is
    /// counted by [`HubHandle::client_count`] from then on.
    pub async fn register(
        &self,
        client: Client,
        nickname: watch::Sender<String>,
    ) -> Result<(), AppError> {
        let (done, done_rx) = oneshot::channel();
        self.send(HubCommand::Register {
            client,
            nickname,
            done,
        })
        .await?;
        done_rx.await.map_err(|_| AppError::HubStopped)
    }

    /// Ask for a client to be removed from the registry
    ///
    /// Never blocks and never drops the request while the Hub runs.
    pub(crate) fn unregister(&self, client_id: ClientId) {
        let _ = self.unregister_tx.send(client_id);
    }

    /// The sending half of the unregister channel, for [`Client::new`]
    pub fn unregister_sender(&self) -> mpsc::UnboundedSender<ClientId> {
        self.unregister_tx.clone()
    }

    /// Deliver a formatted line to every registered client
    pub async fn broadcast(&self, line: String) -> Result<(), AppError> {
        self.send(HubCommand::Broadcast { line }).await
    }

    pub async fn private_message(
        &self,
        from: ClientId,
        to: String,
        text: String,
    ) -> Result<(), AppError> {
        self.send(HubCommand::PrivateMessage { from, to, text })
            .await
    }

    /// Change a client's nickname
    ///
    /// Fails with `InvalidNickname` or `NicknameInUse` without touching the
    /// registry, or `HubStopped` if the Hub is gone.
    pub async fn rename(&self, client_id: ClientId, nickname: String) -> Result<(), AppError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(HubCommand::Rename {
            client_id,
            nickname,
            reply,
        })
        .await?;
        reply_rx.await.map_err(|_| AppError::HubStopped)?
    }

    /// Snapshot of every registered nickname, in no particular order
    pub async fn who(&self) -> Result<Vec<String>, AppError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(HubCommand::Who { reply }).await?;
        reply_rx.await.map_err(|_| AppError::HubStopped)
    }

    /// Number of registered clients
    pub fn client_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Stop the Hub, closing every registered client
    ///
    /// Safe to call more than once; only the first call does anything.
    /// Does not wait for the Hub loop to finish.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn send(&self, cmd: HubCommand) -> Result<(), AppError> {
        if self.shutdown.is_cancelled() {
            return Err(AppError::HubStopped);
        }
        self.sender.send(cmd).await.map_err(|_| AppError::HubStopped)
    }
}
