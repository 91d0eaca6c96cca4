use crate::bell::Bell;
use crate::config::{LinkConfig, RunParams};
use crate::stream::LinkStream;
use bytes::{Bytes, BytesMut};
#[cfg(test)]
use mockall::automock;
use rustc_hash::{FxHashMap, FxHashSet};
use rustls::pki_types::ServerName;
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, trace, warn};

/// Loop-local handle for one established connection. Ids are minted
/// monotonically and never reused within a [`Link`]'s lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub fn from_raw(raw: u64) -> ConnId {
        ConnId(raw)
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl Display for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),
    #[error("listener on {0} is already registered")]
    DuplicateListener(SocketAddr),
    #[error("connector to {0} is already registered")]
    DuplicateConnector(SocketAddr),
    #[error("no listener on {0}")]
    UnknownListener(SocketAddr),
    #[error("no connector to {0}")]
    UnknownConnector(SocketAddr),
    #[error("could not resolve {0}")]
    Unresolvable(String),
    #[error("{0:?} is not a valid TLS server name")]
    InvalidServerName(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The narrow surface upper layers use to push bytes back down. [`Link`]
/// implements it; tests mock it.
#[cfg_attr(test, automock)]
pub trait LinkApi {
    /// Hand `data` to the connection's writer. Returns the number of bytes
    /// accepted: all of them, or 0 when the writer is saturated. A
    /// connection detected broken is closed here and also reports 0.
    fn send(&mut self, conn_id: ConnId, data: &[u8]) -> Result<usize, LinkError>;

    /// Tear the connection down. `on_disconnect` fires exactly once, after
    /// the currently running callback returns.
    fn close(&mut self, conn_id: ConnId) -> Result<(), LinkError>;
}

/// Events the link loop dispatches into the layer above. All methods are
/// invoked from the loop task, never concurrently; implementations move
/// into that task, hence `Send`.
#[cfg_attr(test, automock)]
pub trait LinkHandler: Send {
    fn on_connect(&mut self, link: &mut dyn LinkApi, conn_id: ConnId);
    fn on_disconnect(&mut self, link: &mut dyn LinkApi, conn_id: ConnId);
    fn on_recv(&mut self, link: &mut dyn LinkApi, conn_id: ConnId, data: Bytes);
    /// The connection's writer put `bytes_sent` more bytes on the socket;
    /// there may be room to `send` again.
    fn on_ready_to_send(&mut self, link: &mut dyn LinkApi, conn_id: ConnId, bytes_sent: usize);
    /// Runs once per loop pass, after event dispatch.
    fn on_loop_pass(&mut self, _link: &mut dyn LinkApi) {}
}

/// Cross-thread control surface of a running [`Link`].
#[derive(Clone)]
pub struct LinkHandle {
    stop_flag: Arc<AtomicBool>,
    bell: Bell,
}

impl LinkHandle {
    /// Make the loop return from `run` at its next pass.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.bell.ring();
    }

    /// Wake the loop without stopping it, e.g. after enqueueing work it
    /// should pick up in `on_loop_pass`.
    pub fn wakeup(&self) {
        self.bell.ring();
    }
}

enum SocketEvent {
    Incoming {
        stream: LinkStream,
        peer: SocketAddr,
    },
    AcceptFailed {
        listener: SocketAddr,
        error: io::Error,
    },
    ConnectFinished {
        addr: SocketAddr,
        result: io::Result<LinkStream>,
    },
    Received {
        conn_id: ConnId,
        data: Bytes,
    },
    Written {
        conn_id: ConnId,
        bytes: usize,
    },
    PeerClosed {
        conn_id: ConnId,
    },
}

struct Connection {
    peer: SocketAddr,
    /// The connector this connection belongs to, for rescheduling on close.
    connector: Option<SocketAddr>,
    writer_tx: mpsc::Sender<Bytes>,
    reader_task: JoinHandle<()>,
}

struct Listener {
    task: JoinHandle<()>,
}

struct Connector {
    interval: Duration,
    tls_name: Option<ServerName<'static>>,
}

struct PlannedConnect {
    due: Instant,
    addr: SocketAddr,
}

/// Connection manager and event loop: owns every socket, listener and
/// connector, and dispatches all their events into one [`LinkHandler`] from
/// a single task.
///
/// Socket I/O itself happens on thin helper tasks (an acceptor per listener,
/// a reader and a writer per connection, a handshake task per connection
/// attempt) that communicate with the loop exclusively through a bounded
/// event channel, so all callback state remains owned by the loop.
pub struct Link {
    config: LinkConfig,
    bell: Bell,
    stop_flag: Arc<AtomicBool>,
    running: bool,
    event_tx: mpsc::Sender<SocketEvent>,
    event_rx: mpsc::Receiver<SocketEvent>,
    next_conn_id: u64,
    connections: FxHashMap<ConnId, Connection>,
    listeners: FxHashMap<SocketAddr, Listener>,
    connectors: FxHashMap<SocketAddr, Connector>,
    /// Pending connection attempts, sorted by due time ascending.
    planned_connects: Vec<PlannedConnect>,
    connects_in_flight: FxHashSet<SocketAddr>,
    /// Connections closed during the current dispatch; their `on_disconnect`
    /// fires after the running callback returns, exactly once each.
    pending_disconnects: VecDeque<ConnId>,
}

impl Link {
    pub fn new(config: LinkConfig) -> anyhow::Result<Link> {
        config.validate()?;
        let (event_tx, event_rx) = mpsc::channel(config.event_queue_size);
        Ok(Link {
            config,
            bell: Bell::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            running: false,
            event_tx,
            event_rx,
            next_conn_id: 0,
            connections: FxHashMap::default(),
            listeners: FxHashMap::default(),
            connectors: FxHashMap::default(),
            planned_connects: Vec::new(),
            connects_in_flight: FxHashSet::default(),
            pending_disconnects: VecDeque::new(),
        })
    }

    pub fn bell(&self) -> Bell {
        self.bell.clone()
    }

    pub fn handle(&self) -> LinkHandle {
        LinkHandle {
            stop_flag: Arc::clone(&self.stop_flag),
            bell: self.bell.clone(),
        }
    }

    /// Bind a listening socket and start accepting. Returns the actually
    /// bound address (useful with port 0).
    pub async fn add_listener(&mut self, host: &str, port: u16) -> Result<SocketAddr, LinkError> {
        let addr = resolve(host, port).await?;
        if self.listeners.contains_key(&addr) {
            return Err(LinkError::DuplicateListener(addr));
        }
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        if self.listeners.contains_key(&local) {
            return Err(LinkError::DuplicateListener(local));
        }

        let acceptor = self.config.tls.server.clone().map(TlsAcceptor::from);
        let task = tokio::spawn(accept_loop(listener, local, acceptor, self.event_tx.clone()));
        self.listeners.insert(local, Listener { task });
        info!("listening on {}", local);
        Ok(local)
    }

    pub fn del_listener(&mut self, addr: SocketAddr) -> Result<(), LinkError> {
        let listener = self
            .listeners
            .remove(&addr)
            .ok_or(LinkError::UnknownListener(addr))?;
        listener.task.abort();
        info!("stopped listening on {}", addr);
        Ok(())
    }

    /// Register a remote address to keep a connection to, with an immediate
    /// first attempt and `reconnect_interval` (or the config default)
    /// between retries. Returns the resolved address, the connector's key
    /// for `del_connector`.
    pub async fn add_connector(
        &mut self,
        host: &str,
        port: u16,
        reconnect_interval: Option<Duration>,
    ) -> Result<SocketAddr, LinkError> {
        let addr = resolve(host, port).await?;
        if self.connectors.contains_key(&addr) {
            return Err(LinkError::DuplicateConnector(addr));
        }

        let tls_name = if self.config.tls.client.is_some() {
            let name = ServerName::try_from(host.to_string())
                .map_err(|_| LinkError::InvalidServerName(host.to_string()))?;
            Some(name)
        } else {
            None
        };

        self.connectors.insert(
            addr,
            Connector {
                interval: reconnect_interval.unwrap_or(self.config.reconnect_interval),
                tls_name,
            },
        );
        self.plan_connect(Instant::now(), addr);
        info!("connector to {} registered", addr);
        Ok(addr)
    }

    pub fn del_connector(&mut self, addr: SocketAddr) -> Result<(), LinkError> {
        self.connectors
            .remove(&addr)
            .ok_or(LinkError::UnknownConnector(addr))?;
        self.planned_connects.retain(|p| p.addr != addr);
        info!("connector to {} removed", addr);
        Ok(())
    }

    /// Process socket events and dispatch them into `handler` until stopped
    /// via [`LinkHandle::stop`] or a [`RunParams`] bound is hit.
    pub async fn run(&mut self, handler: &mut dyn LinkHandler, params: RunParams) {
        self.stop_flag.store(false, Ordering::Relaxed);
        self.running = true;
        let started = Instant::now();
        let mut events_left = params.max_events;

        loop {
            if self.stop_flag.load(Ordering::Relaxed) {
                debug!("link loop stopped");
                break;
            }
            if let Some(max) = params.max_runtime {
                if started.elapsed() >= max {
                    debug!("link loop hit its runtime bound");
                    break;
                }
            }
            if events_left == Some(0) {
                debug!("link loop hit its event bound");
                break;
            }

            self.deal_connects();

            let event = tokio::select! {
                event = self.event_rx.recv() => event,
                _ = self.bell.wait() => None,
                _ = tokio::time::sleep(params.poll_timeout) => None,
            };

            if let Some(event) = event {
                if let Some(n) = events_left.as_mut() {
                    *n -= 1;
                }
                self.dispatch(event, handler);
                // drain what is already queued before sleeping again
                while events_left != Some(0) {
                    match self.event_rx.try_recv() {
                        Ok(event) => {
                            if let Some(n) = events_left.as_mut() {
                                *n -= 1;
                            }
                            self.dispatch(event, handler);
                        }
                        Err(_) => break,
                    }
                }
            }

            handler.on_loop_pass(self);
            // a close requested during the loop pass must not wait for the
            // next socket event
            self.drain_pending_disconnects(handler);
        }

        self.running = false;
    }

    /// Make the loop return from `run` at its next pass. See also
    /// [`LinkHandle::stop`] for the cross-thread variant.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.bell.ring();
    }

    /// Drop every connection, listener and connector without firing
    /// callbacks. Must only be called while the loop is stopped.
    pub fn cleanup(&mut self) {
        assert!(!self.running, "cleanup only runs while the loop is stopped");
        for (_, listener) in self.listeners.drain() {
            listener.task.abort();
        }
        self.connectors.clear();
        self.planned_connects.clear();
        self.connects_in_flight.clear();
        for (_, conn) in self.connections.drain() {
            conn.reader_task.abort();
        }
        self.pending_disconnects.clear();
    }

    fn dispatch(&mut self, event: SocketEvent, handler: &mut dyn LinkHandler) {
        match event {
            SocketEvent::Incoming { stream, peer } => {
                let conn_id = self.establish(stream, peer, None);
                info!("{}: accepted connection from {}", conn_id, peer);
                handler.on_connect(self, conn_id);
            }
            SocketEvent::AcceptFailed { listener, error } => {
                warn!("accept on {} failed: {}", listener, error);
            }
            SocketEvent::ConnectFinished { addr, result } => {
                self.connects_in_flight.remove(&addr);
                match (self.connectors.get(&addr).map(|c| c.interval), result) {
                    // connector was removed while the attempt ran
                    (None, _) => {}
                    (Some(_), Ok(stream)) => {
                        let conn_id = self.establish(stream, addr, Some(addr));
                        info!("{}: connected to {}", conn_id, addr);
                        handler.on_connect(self, conn_id);
                    }
                    (Some(interval), Err(error)) => {
                        debug!("connect to {} failed: {}", addr, error);
                        self.plan_connect(Instant::now() + interval, addr);
                    }
                }
            }
            SocketEvent::Received { conn_id, data } => {
                if self.connections.contains_key(&conn_id) {
                    trace!("{}: received {} bytes", conn_id, data.len());
                    handler.on_recv(self, conn_id, data);
                }
            }
            SocketEvent::Written { conn_id, bytes } => {
                if self.connections.contains_key(&conn_id) {
                    trace!("{}: {} bytes written to socket", conn_id, bytes);
                    handler.on_ready_to_send(self, conn_id, bytes);
                }
            }
            SocketEvent::PeerClosed { conn_id } => {
                self.close_internal(conn_id);
            }
        }
        self.drain_pending_disconnects(handler);
    }

    fn drain_pending_disconnects(&mut self, handler: &mut dyn LinkHandler) {
        while let Some(conn_id) = self.pending_disconnects.pop_front() {
            handler.on_disconnect(self, conn_id);
        }
    }

    fn establish(
        &mut self,
        stream: LinkStream,
        peer: SocketAddr,
        connector: Option<SocketAddr>,
    ) -> ConnId {
        self.next_conn_id += 1;
        let conn_id = ConnId(self.next_conn_id);

        let (read_half, write_half) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::channel(self.config.send_queue_blocks);
        let reader_task = tokio::spawn(reader_task(
            read_half,
            conn_id,
            self.config.recv_block_size,
            self.event_tx.clone(),
        ));
        tokio::spawn(writer_task(
            write_half,
            conn_id,
            writer_rx,
            self.event_tx.clone(),
        ));

        self.connections.insert(
            conn_id,
            Connection {
                peer,
                connector,
                writer_tx,
                reader_task,
            },
        );
        conn_id
    }

    /// Fire-once close: removes the connection so later events for this id
    /// are ignored, and queues the single `on_disconnect`.
    fn close_internal(&mut self, conn_id: ConnId) -> bool {
        let Some(conn) = self.connections.remove(&conn_id) else {
            return false;
        };
        conn.reader_task.abort();
        // dropping conn.writer_tx lets the writer flush, shut down, exit

        if let Some(addr) = conn.connector {
            if let Some(interval) = self.connectors.get(&addr).map(|c| c.interval) {
                self.plan_connect(Instant::now() + interval, addr);
            }
        }

        info!("{}: closed (peer {})", conn_id, conn.peer);
        self.pending_disconnects.push_back(conn_id);
        true
    }

    fn plan_connect(&mut self, due: Instant, addr: SocketAddr) {
        let pos = self.planned_connects.partition_point(|p| p.due <= due);
        self.planned_connects.insert(pos, PlannedConnect { due, addr });
    }

    /// Start every planned attempt that is due. An attempt planned further
    /// than twice its interval in the future is treated as a scheduling
    /// anomaly and started immediately as well.
    fn deal_connects(&mut self) {
        let now = Instant::now();
        while let Some(planned) = self.planned_connects.first() {
            let Some(interval) = self.connectors.get(&planned.addr).map(|c| c.interval) else {
                self.planned_connects.remove(0);
                continue;
            };
            if planned.due > now && planned.due <= now + interval * 2 {
                break;
            }
            let planned = self.planned_connects.remove(0);
            if self.connects_in_flight.contains(&planned.addr) {
                continue;
            }
            self.start_connect(planned.addr);
        }
    }

    fn start_connect(&mut self, addr: SocketAddr) {
        let tls = match self.connectors.get(&addr) {
            Some(connector) => self
                .config
                .tls
                .client
                .clone()
                .zip(connector.tls_name.clone()),
            None => return,
        };
        self.connects_in_flight.insert(addr);
        trace!("connecting to {}", addr);

        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = connect_stream(addr, tls).await;
            let _ = event_tx
                .send(SocketEvent::ConnectFinished { addr, result })
                .await;
        });
    }
}

impl LinkApi for Link {
    fn send(&mut self, conn_id: ConnId, data: &[u8]) -> Result<usize, LinkError> {
        let Some(conn) = self.connections.get(&conn_id) else {
            return Err(LinkError::UnknownConnection(conn_id));
        };
        if data.is_empty() {
            return Ok(0);
        }
        match conn.writer_tx.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => {
                trace!("{}: accepted {} bytes for sending", conn_id, data.len());
                Ok(data.len())
            }
            Err(TrySendError::Full(_)) => Ok(0),
            Err(TrySendError::Closed(_)) => {
                debug!("{}: send on broken connection", conn_id);
                self.close_internal(conn_id);
                Ok(0)
            }
        }
    }

    fn close(&mut self, conn_id: ConnId) -> Result<(), LinkError> {
        if self.close_internal(conn_id) {
            Ok(())
        } else {
            Err(LinkError::UnknownConnection(conn_id))
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        for listener in self.listeners.values() {
            listener.task.abort();
        }
        for conn in self.connections.values() {
            conn.reader_task.abort();
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, LinkError> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| LinkError::Unresolvable(format!("{}:{}", host, port)))
}

async fn accept_loop(
    listener: TcpListener,
    local: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    event_tx: mpsc::Sender<SocketEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let event_tx = event_tx.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let stream = match acceptor {
                        None => LinkStream::Plain(stream),
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => LinkStream::Tls(Box::new(tls_stream.into())),
                            Err(error) => {
                                debug!("tls handshake with {} failed: {}", peer, error);
                                return;
                            }
                        },
                    };
                    let _ = event_tx.send(SocketEvent::Incoming { stream, peer }).await;
                });
            }
            Err(error) => {
                if event_tx
                    .send(SocketEvent::AcceptFailed {
                        listener: local,
                        error,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

async fn connect_stream(
    addr: SocketAddr,
    tls: Option<(Arc<rustls::ClientConfig>, ServerName<'static>)>,
) -> io::Result<LinkStream> {
    let stream = TcpStream::connect(addr).await?;
    match tls {
        None => Ok(LinkStream::Plain(stream)),
        Some((config, name)) => {
            let connector = TlsConnector::from(config);
            let tls_stream = connector.connect(name, stream).await?;
            Ok(LinkStream::Tls(Box::new(tls_stream.into())))
        }
    }
}

async fn reader_task(
    mut read_half: ReadHalf<LinkStream>,
    conn_id: ConnId,
    block_size: usize,
    event_tx: mpsc::Sender<SocketEvent>,
) {
    loop {
        let mut buf = BytesMut::with_capacity(block_size);
        match read_half.read_buf(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = event_tx.send(SocketEvent::PeerClosed { conn_id }).await;
                return;
            }
            Ok(_) => {
                if event_tx
                    .send(SocketEvent::Received {
                        conn_id,
                        data: buf.freeze(),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

async fn writer_task(
    mut write_half: WriteHalf<LinkStream>,
    conn_id: ConnId,
    mut writer_rx: mpsc::Receiver<Bytes>,
    event_tx: mpsc::Sender<SocketEvent>,
) {
    while let Some(block) = writer_rx.recv().await {
        if let Err(error) = write_half.write_all(&block).await {
            debug!("{}: write failed: {}", conn_id, error);
            let _ = event_tx.send(SocketEvent::PeerClosed { conn_id }).await;
            return;
        }
        if event_tx
            .send(SocketEvent::Written {
                conn_id,
                bytes: block.len(),
            })
            .await
            .is_err()
        {
            return;
        }
    }
    // link side closed the connection
    let _ = write_half.shutdown().await;
}
