//! Shared two-node test harness.
#![allow(dead_code)] // not every test binary uses every helper

use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Level;
use wireq::link::Link;
use wireq::message::Message;
use wireq::messaging::{Messaging, MessagingHandle, MessagingHandler};
use wireq::queues::QueuesManager;
use wireq::tls::TlsOptions;
use wireq::{ConnId, LinkConfig, LinkHandle, PacketerConfig, RunParams};

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_thread_ids(true)
        .try_init()
        .ok();
}

#[derive(Debug)]
pub enum NodeEvent {
    Connected(String),
    Disconnected(String),
    Message(String, Message),
}

struct Forwarder {
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl MessagingHandler for Forwarder {
    fn on_connect(&mut self, _conn_id: ConnId, ident: &str) {
        let _ = self.tx.send(NodeEvent::Connected(ident.to_string()));
    }
    fn on_disconnect(&mut self, _conn_id: ConnId, ident: &str) {
        let _ = self.tx.send(NodeEvent::Disconnected(ident.to_string()));
    }
    fn on_message_recv(&mut self, _conn_id: ConnId, ident: &str, message: &Message) {
        let _ = self
            .tx
            .send(NodeEvent::Message(ident.to_string(), message.clone()));
    }
}

pub struct Node {
    pub messaging: MessagingHandle,
    pub link: LinkHandle,
    pub events: mpsc::UnboundedReceiver<NodeEvent>,
    pub task: JoinHandle<()>,
}

impl Node {
    pub async fn stop(self) {
        self.link.stop();
        let _ = self.task.await;
    }
}

pub async fn start_node(
    ident: &str,
    listen_on: Option<(&str, u16)>,
    connect_to: Option<(&str, u16)>,
    tls: TlsOptions,
    queues: QueuesManager,
) -> (Node, Option<SocketAddr>) {
    let mut link = Link::new(LinkConfig {
        reconnect_interval: Duration::from_millis(50),
        tls,
        ..LinkConfig::default()
    })
    .unwrap();

    let mut listen_addr = None;
    if let Some((host, port)) = listen_on {
        listen_addr = Some(link.add_listener(host, port).await.unwrap());
    }
    if let Some((host, port)) = connect_to {
        link.add_connector(host, port, None).await.unwrap();
    }

    let mut messaging =
        Messaging::new(ident, queues, PacketerConfig::default(), link.bell()).unwrap();
    let (tx, events) = mpsc::unbounded_channel();
    messaging.add_handler(Box::new(Forwarder { tx }));

    let messaging_handle = messaging.handle();
    let link_handle = link.handle();
    let task = tokio::spawn(async move {
        let params = RunParams {
            poll_timeout: Duration::from_millis(10),
            ..RunParams::default()
        };
        link.run(&mut messaging, params).await;
        link.cleanup();
    });

    (
        Node {
            messaging: messaging_handle,
            link: link_handle,
            events,
            task,
        },
        listen_addr,
    )
}

/// Next message event within `timeout`, skipping session events.
pub async fn wait_for_message(node: &mut Node, timeout: Duration) -> Option<(String, Message)> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, node.events.recv()).await {
            Ok(Some(NodeEvent::Message(ident, message))) => return Some((ident, message)),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

pub async fn wait_for_session(node: &mut Node, ident: &str, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, node.events.recv()).await {
            Ok(Some(NodeEvent::Connected(peer))) if peer == ident => return,
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => panic!("no session with {:?} within {:?}", ident, timeout),
        }
    }
}

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
