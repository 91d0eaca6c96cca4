//! Lightweight message-queuing middleware.
//!
//! Peers connect to each other over TCP (optionally TLS), identify
//! themselves with a logical name, and exchange messages through per-peer
//! queues: a message is addressed to an identifier, not a socket, and waits
//! in its queue (optionally persisted, with a TTL that decays only while
//! the peer is away) until a connection identified with that name is up.
//!
//! The stack, bottom to top:
//! * [`link::Link`]: connection management and the event loop, with
//!   listeners, automatically reconnecting connectors, TLS, and single-task
//!   dispatch of all socket events into a [`link::LinkHandler`].
//! * [`packeter::Packeter`]: packet framing (4-byte length prefix) over the
//!   link's byte streams, with per-packet sent confirmation.
//! * [`messaging::Messaging`]: the frame protocol, covering the version
//!   check, the identity handshake, and queue draining with at-least-once
//!   delivery.
//!
//! A minimal node:
//!
//! ```no_run
//! use wireq::config::{LinkConfig, PacketerConfig, RunParams};
//! use wireq::link::Link;
//! use wireq::message::Message;
//! use wireq::messaging::Messaging;
//! use wireq::queues::QueuesManager;
//!
//! # async fn node() -> anyhow::Result<()> {
//! let mut link = Link::new(LinkConfig::default())?;
//! link.add_listener("0.0.0.0", 4000).await?;
//! link.add_connector("bob.example", 4000, None).await?;
//!
//! let mut messaging = Messaging::new(
//!     "alice",
//!     QueuesManager::in_memory(),
//!     PacketerConfig::default(),
//!     link.bell(),
//! )?;
//!
//! let handle = messaging.handle();
//! handle.send_message("bob", Message::new("hello").with_ttl(Some(60.0)))?;
//!
//! link.run(&mut messaging, RunParams::default()).await;
//! # Ok(())
//! # }
//! ```

pub mod bell;
pub mod buffers;
pub mod config;
pub mod link;
pub mod message;
pub mod messaging;
pub mod packeter;
pub mod protocol;
pub mod queues;
pub mod storage;
pub mod tls;

mod stream;

pub use crate::bell::Bell;
pub use crate::config::{LinkConfig, PacketerConfig, RunParams};
pub use crate::link::{ConnId, Link, LinkHandle};
pub use crate::message::{Message, MessageFlags};
pub use crate::messaging::{Messaging, MessagingHandle, MessagingHandler};
pub use crate::queues::QueuesManager;
