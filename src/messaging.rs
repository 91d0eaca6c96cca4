use crate::bell::Bell;
use crate::config::PacketerConfig;
use crate::link::{ConnId, LinkApi, LinkHandler};
use crate::message::Message;
use crate::packeter::{PacketError, Packeter, PacketId};
use crate::protocol::{ser_frame, Frame, PROTOCOL_VERSION};
use crate::queues::QueuesManager;
use crate::storage::StorageError;
use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Messaging-level violations. Each one is reported to the registered
/// handlers and tears down the offending connection; the link itself keeps
/// running.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("malformed packet stream: {0}")]
    Packet(#[from] PacketError),
    #[error("peer speaks protocol version {peer}, local version is {local}")]
    VersionMismatch { peer: u32, local: u32 },
    #[error("peer rejected our protocol version {local}")]
    VersionRejected { local: u32 },
    #[error("message from a peer that has not identified itself")]
    NotIdentified,
    #[error("identifier {0:?} is already bound to another live connection")]
    DuplicateIdentity(String),
}

/// Observer of messaging events. Any number can be registered; they fire in
/// registration order, from the loop task. `on_connect`/`on_disconnect`
/// refer to the identified session, so they fire when the peer's identity
/// becomes known resp. is lost, not on raw sockets.
pub trait MessagingHandler: Send {
    fn on_connect(&mut self, _conn_id: ConnId, _ident: &str) {}
    fn on_disconnect(&mut self, _conn_id: ConnId, _ident: &str) {}
    fn on_message_recv(&mut self, _conn_id: ConnId, _ident: &str, _message: &Message) {}
    fn on_error(&mut self, _conn_id: ConnId, _error: &ProtocolError) {}
}

/// Cross-thread sending surface. Cheap to clone; every clone feeds the same
/// queues and wakes the same loop.
#[derive(Clone)]
pub struct MessagingHandle {
    queues: Arc<Mutex<QueuesManager>>,
    bell: Bell,
}

impl MessagingHandle {
    /// Queue `message` for the peer named `ident` and wake the loop. The
    /// message is delivered once a connection identified as `ident` is up
    /// and its TTL has not run out. Returns the message's uuid.
    pub fn send_message(&self, ident: &str, message: Message) -> Result<Uuid, StorageError> {
        let uuid = message.uuid;
        self.queues.lock().get_queue(ident)?.push(message)?;
        self.bell.ring();
        Ok(uuid)
    }

    /// Direct access to the shared queues, e.g. for inspection or cleanup.
    pub fn queues(&self) -> &Arc<Mutex<QueuesManager>> {
        &self.queues
    }
}

/// The top layer: speaks the frame protocol over a
/// [`Link`](crate::link::Link) (plug it in via [`Link::run`]'s handler),
/// maps connections to peer identities and drains per-peer queues.
///
/// Delivery is at-least-once: the head message of a queue is popped only
/// when the packet carrying it is confirmed written to the socket, and at
/// most one message per peer is in flight at a time. A connection lost in
/// between leaves the message queued for the next session.
///
/// [`Link::run`]: crate::link::Link::run
pub struct Messaging {
    identifier: String,
    packeter: Packeter,
    queues: Arc<Mutex<QueuesManager>>,
    bell: Bell,
    handlers: Vec<Box<dyn MessagingHandler>>,
    ident_by_conn: FxHashMap<ConnId, String>,
    conn_by_ident: FxHashMap<String, ConnId>,
    /// Per connection, the packet id of the queue-head message on the wire.
    in_flight: FxHashMap<ConnId, PacketId>,
}

impl Messaging {
    /// `bell` must be the link's own ([`Link::bell`](crate::link::Link::bell)),
    /// so cross-thread sends wake the right loop.
    pub fn new(
        identifier: impl Into<String>,
        queues: QueuesManager,
        packeter_config: PacketerConfig,
        bell: Bell,
    ) -> anyhow::Result<Messaging> {
        Ok(Messaging {
            identifier: identifier.into(),
            packeter: Packeter::new(packeter_config)?,
            queues: Arc::new(Mutex::new(queues)),
            bell,
            handlers: Vec::new(),
            ident_by_conn: FxHashMap::default(),
            conn_by_ident: FxHashMap::default(),
            in_flight: FxHashMap::default(),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn add_handler(&mut self, handler: Box<dyn MessagingHandler>) {
        self.handlers.push(handler);
    }

    pub fn handle(&self) -> MessagingHandle {
        MessagingHandle {
            queues: Arc::clone(&self.queues),
            bell: self.bell.clone(),
        }
    }

    /// Report, notify handlers, close. Returns false: the connection is no
    /// longer usable.
    fn protocol_error(
        &mut self,
        link: &mut dyn LinkApi,
        conn_id: ConnId,
        error: ProtocolError,
    ) -> bool {
        warn!("{}: {}", conn_id, error);
        for handler in &mut self.handlers {
            handler.on_error(conn_id, &error);
        }
        let _ = link.close(conn_id);
        false
    }

    /// Returns whether the connection is still usable afterwards.
    fn handle_packet(&mut self, link: &mut dyn LinkApi, conn_id: ConnId, packet: Bytes) -> bool {
        let mut buf = packet;
        let frame = match Frame::deser(&mut buf) {
            Ok(frame) => frame,
            Err(error) => {
                let error = ProtocolError::MalformedFrame(error.to_string());
                return self.protocol_error(link, conn_id, error);
            }
        };

        match frame {
            Frame::ProtocolVersion(version) => {
                if version != PROTOCOL_VERSION {
                    let goodbye = ser_frame(&Frame::IncompatibleProtocol);
                    let _ = self.packeter.send_packet(link, conn_id, &goodbye);
                    let error = ProtocolError::VersionMismatch {
                        peer: version,
                        local: PROTOCOL_VERSION,
                    };
                    return self.protocol_error(link, conn_id, error);
                }
                trace!("{}: peer speaks protocol version {}", conn_id, version);
                true
            }
            Frame::IncompatibleProtocol => {
                let error = ProtocolError::VersionRejected {
                    local: PROTOCOL_VERSION,
                };
                self.protocol_error(link, conn_id, error)
            }
            Frame::Identification(ident) => self.handle_identification(link, conn_id, ident),
            Frame::Message(message) => match self.ident_by_conn.get(&conn_id) {
                None => self.protocol_error(link, conn_id, ProtocolError::NotIdentified),
                Some(ident) => {
                    let ident = ident.clone();
                    debug!(
                        "{}: message {} from {:?} ({} bytes)",
                        conn_id,
                        message.uuid,
                        ident,
                        message.data.len()
                    );
                    for handler in &mut self.handlers {
                        handler.on_message_recv(conn_id, &ident, &message);
                    }
                    true
                }
            },
        }
    }

    fn handle_identification(
        &mut self,
        link: &mut dyn LinkApi,
        conn_id: ConnId,
        ident: String,
    ) -> bool {
        if let Some(existing) = self.ident_by_conn.get(&conn_id) {
            if *existing != ident {
                warn!(
                    "{}: re-identification as {:?} ignored, stays {:?}",
                    conn_id, ident, existing
                );
            }
            return true;
        }
        if self.conn_by_ident.contains_key(&ident) {
            return self.protocol_error(link, conn_id, ProtocolError::DuplicateIdentity(ident));
        }

        info!("{}: peer identified as {:?}", conn_id, ident);
        self.ident_by_conn.insert(conn_id, ident.clone());
        self.conn_by_ident.insert(ident.clone(), conn_id);
        {
            let mut queues = self.queues.lock();
            if let Err(error) = queues.get_queue(&ident).and_then(|mut q| q.connect()) {
                error!("queue {:?}: storage failure on connect: {}", ident, error);
            }
        }
        for handler in &mut self.handlers {
            handler.on_connect(conn_id, &ident);
        }
        true
    }
}

impl LinkHandler for Messaging {
    fn on_connect(&mut self, link: &mut dyn LinkApi, conn_id: ConnId) {
        self.packeter.add_connection(conn_id);

        // greeting: who we are and what we speak
        let version = ser_frame(&Frame::ProtocolVersion(PROTOCOL_VERSION));
        let ident = ser_frame(&Frame::Identification(self.identifier.clone()));
        for greeting in [version, ident] {
            if let Err(error) = self.packeter.send_packet(link, conn_id, &greeting) {
                warn!("{}: could not queue greeting: {}", conn_id, error);
                return;
            }
        }
    }

    fn on_disconnect(&mut self, _link: &mut dyn LinkApi, conn_id: ConnId) {
        self.packeter.remove_connection(conn_id);
        self.in_flight.remove(&conn_id);

        if let Some(ident) = self.ident_by_conn.remove(&conn_id) {
            self.conn_by_ident.remove(&ident);
            {
                let mut queues = self.queues.lock();
                match queues.get_queue(&ident) {
                    Ok(mut queue) => queue.disconnect(),
                    Err(error) => error!("queue {:?}: storage failure: {}", ident, error),
                }
            }
            info!("{}: {:?} disconnected", conn_id, ident);
            for handler in &mut self.handlers {
                handler.on_disconnect(conn_id, &ident);
            }
        }
    }

    fn on_recv(&mut self, link: &mut dyn LinkApi, conn_id: ConnId, data: Bytes) {
        match self.packeter.on_recv(conn_id, data) {
            Ok(packets) => {
                for packet in packets {
                    if !self.handle_packet(link, conn_id, packet) {
                        break;
                    }
                }
            }
            Err(error) => {
                self.protocol_error(link, conn_id, error.into());
            }
        }
    }

    fn on_ready_to_send(&mut self, link: &mut dyn LinkApi, conn_id: ConnId, bytes_sent: usize) {
        let confirmed = match self.packeter.on_bytes_sent(link, conn_id, bytes_sent) {
            Ok(confirmed) => confirmed,
            Err(error) => {
                debug!("{}: {}", conn_id, error);
                return;
            }
        };

        for packet_id in confirmed {
            if self.in_flight.get(&conn_id) != Some(&packet_id) {
                continue; // greeting or superseded packet
            }
            self.in_flight.remove(&conn_id);
            if let Some(ident) = self.ident_by_conn.get(&conn_id) {
                let mut queues = self.queues.lock();
                match queues.get_queue(ident).and_then(|mut q| q.pop()) {
                    Ok(Some(message)) => {
                        trace!("{}: message {} delivered to {:?}", conn_id, message.uuid, ident);
                    }
                    Ok(None) => {}
                    Err(error) => error!("queue {:?}: storage failure on pop: {}", ident, error),
                }
            }
        }
    }

    /// Drain queues: for every identified peer without an in-flight message,
    /// put the queue head on the wire.
    fn on_loop_pass(&mut self, link: &mut dyn LinkApi) {
        let targets: Vec<(String, ConnId)> = self
            .conn_by_ident
            .iter()
            .filter(|(_, conn_id)| !self.in_flight.contains_key(conn_id))
            .map(|(ident, conn_id)| (ident.clone(), *conn_id))
            .collect();

        for (ident, conn_id) in targets {
            let message = {
                let mut queues = self.queues.lock();
                match queues.get_queue(&ident) {
                    Ok(queue) => queue.get().cloned(),
                    Err(error) => {
                        error!("queue {:?}: storage failure: {}", ident, error);
                        None
                    }
                }
            };
            let Some(message) = message else {
                continue;
            };

            let framed = ser_frame(&Frame::Message(message.clone()));
            match self.packeter.send_packet(link, conn_id, &framed) {
                Ok(packet_id) => {
                    trace!(
                        "{}: message {} for {:?} on the wire as {}",
                        conn_id,
                        message.uuid,
                        ident,
                        packet_id
                    );
                    self.in_flight.insert(conn_id, packet_id);
                }
                Err(error) => {
                    debug!("{}: could not send to {:?}: {}", conn_id, ident, error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockLinkApi;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Connected(ConnId, String),
        Disconnected(ConnId, String),
        Received(ConnId, String, Bytes),
        Error(ConnId, String),
    }

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.events.lock().clone()
        }
    }

    impl MessagingHandler for Recorder {
        fn on_connect(&mut self, conn_id: ConnId, ident: &str) {
            self.events
                .lock()
                .push(Event::Connected(conn_id, ident.to_string()));
        }
        fn on_disconnect(&mut self, conn_id: ConnId, ident: &str) {
            self.events
                .lock()
                .push(Event::Disconnected(conn_id, ident.to_string()));
        }
        fn on_message_recv(&mut self, conn_id: ConnId, ident: &str, message: &Message) {
            self.events.lock().push(Event::Received(
                conn_id,
                ident.to_string(),
                message.data.clone(),
            ));
        }
        fn on_error(&mut self, conn_id: ConnId, error: &ProtocolError) {
            self.events
                .lock()
                .push(Event::Error(conn_id, error.to_string()));
        }
    }

    fn messaging(identifier: &str) -> (Messaging, Recorder) {
        let mut messaging = Messaging::new(
            identifier,
            QueuesManager::in_memory(),
            PacketerConfig::default(),
            Bell::new(),
        )
        .unwrap();
        let recorder = Recorder::default();
        messaging.add_handler(Box::new(recorder.clone()));
        (messaging, recorder)
    }

    fn accepting_link(sent: Arc<Mutex<Vec<Vec<u8>>>>) -> MockLinkApi {
        let mut link = MockLinkApi::new();
        link.expect_send().returning(move |_, data| {
            sent.lock().push(data.to_vec());
            Ok(data.len())
        });
        link
    }

    /// Frame a single protocol frame the way a peer would put it on the wire.
    fn packet(frame: Frame) -> Bytes {
        let payload = ser_frame(&frame);
        let mut framed = Vec::with_capacity(4 + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(&payload);
        Bytes::from(framed)
    }

    fn conn(raw: u64) -> ConnId {
        ConnId::from_raw(raw)
    }

    #[test]
    fn test_greeting_on_connect() {
        let (mut messaging, _) = messaging("alice");
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut link = accepting_link(Arc::clone(&sent));

        messaging.on_connect(&mut link, conn(1));

        let sent = sent.lock();
        // one block per packet at default block size
        assert_eq!(sent[0], b"\x00\x00\x00\x05\x00\x00\x00\x00\x01");
        assert_eq!(sent[1], b"\x00\x00\x00\x06\x02alice");
    }

    #[test]
    fn test_identification_binds_and_notifies() {
        let (mut messaging, recorder) = messaging("alice");
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut link = accepting_link(sent);

        messaging.on_connect(&mut link, conn(1));
        messaging.on_recv(&mut link, conn(1), packet(Frame::ProtocolVersion(PROTOCOL_VERSION)));
        messaging.on_recv(&mut link, conn(1), packet(Frame::Identification("bob".to_string())));

        assert_eq!(
            recorder.events(),
            vec![Event::Connected(conn(1), "bob".to_string())]
        );
        assert_eq!(messaging.conn_by_ident.get("bob"), Some(&conn(1)));

        let message = Message::new("hi").with_ttl(Some(60.0));
        messaging.on_recv(&mut link, conn(1), packet(Frame::Message(message)));
        assert_eq!(
            recorder.events()[1],
            Event::Received(conn(1), "bob".to_string(), Bytes::from_static(b"hi"))
        );
    }

    #[test]
    fn test_message_before_identification_is_rejected() {
        let (mut messaging, recorder) = messaging("alice");
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut link = accepting_link(sent);
        messaging.on_connect(&mut link, conn(1));

        let mut link = MockLinkApi::new();
        link.expect_close().times(1).returning(|_| Ok(()));
        let message = Message::new("sneaky").with_ttl(Some(60.0));
        messaging.on_recv(&mut link, conn(1), packet(Frame::Message(message)));

        assert!(matches!(&recorder.events()[..], [Event::Error(c, _)] if *c == conn(1)));
    }

    #[test]
    fn test_duplicate_identity_closes_second_connection() {
        let (mut messaging, recorder) = messaging("alice");
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut link = accepting_link(Arc::clone(&sent));

        messaging.on_connect(&mut link, conn(1));
        messaging.on_recv(&mut link, conn(1), packet(Frame::Identification("bob".to_string())));
        messaging.on_connect(&mut link, conn(2));

        let mut closing_link = MockLinkApi::new();
        closing_link
            .expect_close()
            .withf(|c| *c == ConnId::from_raw(2))
            .times(1)
            .returning(|_| Ok(()));
        messaging.on_recv(
            &mut closing_link,
            conn(2),
            packet(Frame::Identification("bob".to_string())),
        );

        assert_eq!(messaging.conn_by_ident.get("bob"), Some(&conn(1)));
        assert!(matches!(recorder.events().last(), Some(Event::Error(c, _)) if *c == conn(2)));
    }

    #[test]
    fn test_repeated_identification_on_same_connection_is_ignored() {
        let (mut messaging, recorder) = messaging("alice");
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut link = accepting_link(sent);

        messaging.on_connect(&mut link, conn(1));
        messaging.on_recv(&mut link, conn(1), packet(Frame::Identification("bob".to_string())));
        messaging.on_recv(&mut link, conn(1), packet(Frame::Identification("bob".to_string())));

        assert_eq!(recorder.events().len(), 1, "only one Connected event");
    }

    #[test]
    fn test_version_mismatch_says_goodbye_and_closes() {
        let (mut messaging, recorder) = messaging("alice");
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut link = accepting_link(Arc::clone(&sent));
        messaging.on_connect(&mut link, conn(1));
        sent.lock().clear();

        let mut link = MockLinkApi::new();
        {
            let sent = Arc::clone(&sent);
            link.expect_send().returning(move |_, data| {
                sent.lock().push(data.to_vec());
                Ok(data.len())
            });
        }
        link.expect_close().times(1).returning(|_| Ok(()));
        messaging.on_recv(&mut link, conn(1), packet(Frame::ProtocolVersion(99)));

        assert_eq!(sent.lock()[0], b"\x00\x00\x00\x01\x01");
        assert!(matches!(&recorder.events()[..], [Event::Error(..)]));
    }

    #[test]
    fn test_confirm_then_pop() {
        let (mut messaging, _) = messaging("alice");
        let handle = messaging.handle();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut link = accepting_link(sent);

        messaging.on_connect(&mut link, conn(1));
        messaging.on_recv(&mut link, conn(1), packet(Frame::Identification("bob".to_string())));
        handle
            .send_message("bob", Message::new("hi").with_ttl(Some(60.0)))
            .unwrap();

        messaging.on_loop_pass(&mut link);
        assert!(messaging.in_flight.contains_key(&conn(1)));
        assert_eq!(handle.queues().lock().get_queue("bob").unwrap().len(), 1);

        // greetings confirmed: version packet 9 bytes, "alice" ident packet 10
        messaging.on_ready_to_send(&mut link, conn(1), 9 + 10);
        assert_eq!(
            handle.queues().lock().get_queue("bob").unwrap().len(),
            1,
            "greeting confirmations must not pop the queue"
        );

        // message packet: 4 + (1 + 16 + 4 + 4 + 2) bytes
        messaging.on_ready_to_send(&mut link, conn(1), 31);
        assert!(messaging.in_flight.is_empty());
        assert_eq!(handle.queues().lock().get_queue("bob").unwrap().len(), 0);
    }

    #[test]
    fn test_disconnect_leaves_unconfirmed_message_queued() {
        let (mut messaging, recorder) = messaging("alice");
        let handle = messaging.handle();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut link = accepting_link(sent);

        messaging.on_connect(&mut link, conn(1));
        messaging.on_recv(&mut link, conn(1), packet(Frame::Identification("bob".to_string())));
        handle
            .send_message("bob", Message::new("hi").with_ttl(None))
            .unwrap();
        messaging.on_loop_pass(&mut link);

        // connection dies before any confirmation arrives
        messaging.on_disconnect(&mut link, conn(1));

        let mut queues = handle.queues().lock();
        let queue = queues.get_queue("bob").unwrap();
        assert_eq!(queue.len(), 1, "unconfirmed message must stay queued");
        assert!(!queue.is_connected());
        drop(queues);

        assert!(messaging.in_flight.is_empty());
        assert!(matches!(
            recorder.events().last(),
            Some(Event::Disconnected(c, ident)) if *c == conn(1) && ident == "bob"
        ));
    }

    #[test]
    fn test_one_in_flight_message_per_peer() {
        let (mut messaging, _) = messaging("alice");
        let handle = messaging.handle();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut link = accepting_link(Arc::clone(&sent));

        messaging.on_connect(&mut link, conn(1));
        messaging.on_recv(&mut link, conn(1), packet(Frame::Identification("bob".to_string())));
        handle.send_message("bob", Message::new("one").with_ttl(None)).unwrap();
        handle.send_message("bob", Message::new("two").with_ttl(None)).unwrap();

        sent.lock().clear();
        messaging.on_loop_pass(&mut link);
        messaging.on_loop_pass(&mut link);
        assert_eq!(sent.lock().len(), 1, "second message must wait for the first");
    }
}
