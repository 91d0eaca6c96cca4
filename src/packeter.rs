use crate::buffers::StreamBuffer;
use crate::config::PacketerConfig;
use crate::link::{ConnId, LinkApi, LinkError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use thiserror::Error;
use tracing::{debug, trace};

/// Identifies one packet handed to [`Packeter::send_packet`], for matching
/// against the sent-confirmations from [`Packeter::on_bytes_sent`]. Unique
/// per packeter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId(u64);

impl PacketId {
    pub fn from_raw(raw: u64) -> PacketId {
        PacketId(raw)
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "pkt#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),
    #[error("{size} byte packet announced, above the {max} byte limit")]
    TooLong { size: usize, max: usize },
    #[error(transparent)]
    Link(#[from] LinkError),
}

struct ConnectionBuffers {
    send_buffer: StreamBuffer,
    recv_buffer: StreamBuffer,
    /// Length of the packet currently being received, once its header is in.
    expected: Option<usize>,
    /// Packets queued or on the wire, oldest first: (framed length, id).
    unconfirmed: VecDeque<(usize, PacketId)>,
    /// Socket-written bytes not yet attributed to a whole packet.
    written_carry: usize,
}

impl ConnectionBuffers {
    fn new() -> ConnectionBuffers {
        ConnectionBuffers {
            send_buffer: StreamBuffer::new(),
            recv_buffer: StreamBuffer::new(),
            expected: None,
            unconfirmed: VecDeque::new(),
            written_carry: 0,
        }
    }
}

/// Packet framing on top of [`Link`](crate::link::Link)'s byte streams: every
/// packet travels as a 4-byte big-endian length prefix plus payload.
///
/// Sending is buffered per connection and drained in configured block sizes,
/// respecting the link's backpressure. A packet counts as *sent* only once
/// the writer reports enough cumulative socket bytes to cover it; the
/// confirmed ids come back from [`Packeter::on_bytes_sent`] in send order.
pub struct Packeter {
    config: PacketerConfig,
    connections: FxHashMap<ConnId, ConnectionBuffers>,
    next_packet_id: u64,
}

impl Packeter {
    pub fn new(config: PacketerConfig) -> anyhow::Result<Packeter> {
        config.validate()?;
        Ok(Packeter {
            config,
            connections: FxHashMap::default(),
            next_packet_id: 0,
        })
    }

    pub fn add_connection(&mut self, conn_id: ConnId) {
        self.connections.insert(conn_id, ConnectionBuffers::new());
    }

    /// Forget a connection's buffers. A partially received packet is
    /// dropped, unconfirmed packets stay unconfirmed.
    pub fn remove_connection(&mut self, conn_id: ConnId) {
        self.connections.remove(&conn_id);
    }

    /// Frame `payload` and queue it for `conn_id`, pushing as much as the
    /// link accepts right away.
    pub fn send_packet(
        &mut self,
        link: &mut dyn LinkApi,
        conn_id: ConnId,
        payload: &[u8],
    ) -> Result<PacketId, PacketError> {
        if payload.len() > self.config.max_packet_size {
            return Err(PacketError::TooLong {
                size: payload.len(),
                max: self.config.max_packet_size,
            });
        }
        let buffers = self
            .connections
            .get_mut(&conn_id)
            .ok_or(PacketError::UnknownConnection(conn_id))?;

        self.next_packet_id += 1;
        let packet_id = PacketId(self.next_packet_id);

        let mut framed = BytesMut::with_capacity(4 + payload.len());
        framed.put_u32(payload.len() as u32);
        framed.put_slice(payload);
        buffers.unconfirmed.push_back((framed.len(), packet_id));
        buffers.send_buffer.put(framed.freeze());
        trace!("{}: queued {} ({} byte payload)", conn_id, packet_id, payload.len());

        self.drain_send(link, conn_id)?;
        Ok(packet_id)
    }

    /// Feed raw received bytes in; get every packet they complete back out,
    /// in order. A header announcing more than `max_packet_size` marks the
    /// stream malformed.
    pub fn on_recv(&mut self, conn_id: ConnId, data: Bytes) -> Result<Vec<Bytes>, PacketError> {
        let buffers = self
            .connections
            .get_mut(&conn_id)
            .ok_or(PacketError::UnknownConnection(conn_id))?;
        buffers.recv_buffer.put(data);

        let mut packets = Vec::new();
        loop {
            let expected = match buffers.expected {
                Some(expected) => expected,
                None => {
                    if buffers.recv_buffer.len() < 4 {
                        break;
                    }
                    let mut header = buffers.recv_buffer.get(4, true);
                    let expected = header.get_u32() as usize;
                    if expected > self.config.max_packet_size {
                        debug!("{}: malformed stream, {} byte packet announced", conn_id, expected);
                        return Err(PacketError::TooLong {
                            size: expected,
                            max: self.config.max_packet_size,
                        });
                    }
                    buffers.expected = Some(expected);
                    expected
                }
            };

            if buffers.recv_buffer.len() < expected {
                break;
            }
            packets.push(buffers.recv_buffer.get(expected, true));
            buffers.expected = None;
        }
        Ok(packets)
    }

    /// Account for `bytes` more written to the socket and drain further
    /// buffered data into the freed room. Returns the ids of all packets
    /// fully on the wire now, oldest first.
    pub fn on_bytes_sent(
        &mut self,
        link: &mut dyn LinkApi,
        conn_id: ConnId,
        bytes: usize,
    ) -> Result<Vec<PacketId>, PacketError> {
        let buffers = self
            .connections
            .get_mut(&conn_id)
            .ok_or(PacketError::UnknownConnection(conn_id))?;
        buffers.written_carry += bytes;

        let mut confirmed = Vec::new();
        while let Some(&(framed_len, packet_id)) = buffers.unconfirmed.front() {
            if buffers.written_carry < framed_len {
                break;
            }
            buffers.written_carry -= framed_len;
            buffers.unconfirmed.pop_front();
            trace!("{}: {} confirmed sent", conn_id, packet_id);
            confirmed.push(packet_id);
        }

        self.drain_send(link, conn_id)?;
        Ok(confirmed)
    }

    fn drain_send(&mut self, link: &mut dyn LinkApi, conn_id: ConnId) -> Result<(), PacketError> {
        let Some(buffers) = self.connections.get_mut(&conn_id) else {
            return Err(PacketError::UnknownConnection(conn_id));
        };
        while !buffers.send_buffer.is_empty() {
            let block = buffers.send_buffer.get(self.config.send_block_size, false);
            let accepted = link.send(conn_id, &block)?;
            if accepted == 0 {
                break;
            }
            buffers.send_buffer.cut(accepted);
        }
        Ok(())
    }
}
