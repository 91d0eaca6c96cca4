use bitflags::bitflags;
use bytes::Bytes;
use uuid::Uuid;

bitflags! {
    /// Delivery options carried with every message, end to end.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u32 {
        /// Write the message through to queue storage so it survives a
        /// process restart while waiting for its peer.
        const PERSISTENT = 0b1;
    }
}

/// A queued unit of payload.
///
/// `ttl` is the remaining time to live in seconds; it decays only while the
/// destination peer is disconnected. `None` means the message never expires.
/// A freshly built message defaults to a TTL of zero: deliverable only to a
/// currently connected peer, dropped otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub uuid: Uuid,
    pub data: Bytes,
    pub ttl: Option<f32>,
    pub flags: MessageFlags,
}

impl Message {
    pub fn new(data: impl Into<Bytes>) -> Message {
        Message {
            uuid: Uuid::new_v4(),
            data: data.into(),
            ttl: Some(0.0),
            flags: MessageFlags::empty(),
        }
    }

    pub fn with_ttl(mut self, ttl: Option<f32>) -> Message {
        self.ttl = ttl;
        self
    }

    pub fn persistent(mut self) -> Message {
        self.flags |= MessageFlags::PERSISTENT;
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.flags.contains(MessageFlags::PERSISTENT)
    }
}
