//! Line-based TCP Chat Server Library
//!
//! A multi-client chat service over plain TCP, built with tokio using the
//! Actor pattern for state management.
//!
//! # Features
//! - Newline-delimited text protocol with `/` commands
//! - Nicknames (`/nick`), directory queries (`/who`)
//! - Public broadcast and private messages (`/msg`)
//! - Idle and write timeouts, message size limit, client limit
//! - Slow consumer eviction and graceful shutdown
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `Hub` is the central actor owning the client registry and nicknames
//! - Each connection runs a read task and a write task that talk to the
//!   Hub through a `HubHandle`
//! - No locks needed - all state access goes through message passing
//!
//! # Example
//! ```ignore
//! use linechat::{ChatServer, Config};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = ChatServer::bind(Config::default()).await.unwrap();
//!     server
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod types;

// Re-export main types for convenience
pub use client::{Client, CloseReason};
pub use config::Config;
pub use error::{AppError, SendError};
pub use handler::{open_session, Session};
pub use hub::{Hub, HubCommand, HubHandle};
pub use server::ChatServer;
pub use types::{ClientId, ClientIdGenerator};
