use crate::message::{Message, MessageFlags};
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Version of the frame protocol spoken inside packets. Peers exchange it as
/// their first frame and drop the connection on mismatch.
pub const PROTOCOL_VERSION: u32 = 1;

const TAG_PROTOCOL_VERSION: u8 = 0;
const TAG_INCOMPATIBLE_PROTOCOL: u8 = 1;
const TAG_IDENTIFICATION: u8 = 2;
const TAG_MESSAGE: u8 = 3;

/// One messaging-layer frame. Every packet on the wire carries exactly one.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Speaker's protocol version, first frame on every connection.
    ProtocolVersion(u32),
    /// Sent just before hanging up on a peer whose version we cannot speak.
    IncompatibleProtocol,
    /// Speaker's logical identifier, second frame on every connection.
    Identification(String),
    Message(Message),
}

impl Frame {
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            Frame::ProtocolVersion(version) => {
                buf.put_u8(TAG_PROTOCOL_VERSION);
                buf.put_u32(*version);
            }
            Frame::IncompatibleProtocol => {
                buf.put_u8(TAG_INCOMPATIBLE_PROTOCOL);
            }
            Frame::Identification(identifier) => {
                buf.put_u8(TAG_IDENTIFICATION);
                buf.put_slice(identifier.as_bytes());
            }
            Frame::Message(message) => {
                buf.put_u8(TAG_MESSAGE);
                buf.put_u128(message.uuid.as_u128());
                buf.put_f32(message.ttl.unwrap_or(f32::INFINITY));
                buf.put_u32(message.flags.bits());
                buf.put_slice(&message.data);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        let frame = match buf.try_get_u8()? {
            TAG_PROTOCOL_VERSION => Frame::ProtocolVersion(buf.try_get_u32()?),
            TAG_INCOMPATIBLE_PROTOCOL => Frame::IncompatibleProtocol,
            TAG_IDENTIFICATION => {
                let raw = buf.copy_to_bytes(buf.remaining());
                Frame::Identification(String::from_utf8(raw.to_vec())?)
            }
            TAG_MESSAGE => {
                let uuid = Uuid::from_u128(buf.try_get_u128()?);
                let ttl = decode_ttl(f32::from_bits(buf.try_get_u32()?));
                let flags = MessageFlags::from_bits_truncate(buf.try_get_u32()?);
                let data = buf.copy_to_bytes(buf.remaining());
                Frame::Message(Message {
                    uuid,
                    data,
                    ttl,
                    flags,
                })
            }
            tag => bail!("unknown frame tag {}", tag),
        };
        if buf.has_remaining() {
            bail!("{} trailing bytes after frame", buf.remaining());
        }
        Ok(frame)
    }
}

/// Non-finite wire TTLs all mean "never expires".
fn decode_ttl(raw: f32) -> Option<f32> {
    raw.is_finite().then_some(raw)
}

/// Convenience for the send path: one frame, one freshly framed byte string.
pub fn ser_frame(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::new();
    frame.ser(&mut buf);
    buf.freeze()
}
