use crate::tls::TlsOptions;
use anyhow::bail;
use std::time::Duration;

/// Socket-level knobs for [`Link`](crate::link::Link).
#[derive(Clone)]
pub struct LinkConfig {
    /// Upper bound for a single read from a socket. One read becomes one
    /// `on_recv` callback, so this also bounds how long one connection can
    /// occupy the loop before others get a turn.
    pub recv_block_size: usize,
    /// Per-connection writer queue depth, in blocks. When full, `send`
    /// accepts nothing (returns 0) until the writer catches up.
    pub send_queue_blocks: usize,
    /// Capacity of the socket-event channel feeding the loop task.
    pub event_queue_size: usize,
    /// Delay between connection attempts for connectors that do not specify
    /// their own interval.
    pub reconnect_interval: Duration,
    /// Client/server TLS configuration. Connections are plain TCP for sides
    /// left unset.
    pub tls: TlsOptions,
}

impl Default for LinkConfig {
    fn default() -> LinkConfig {
        LinkConfig {
            recv_block_size: 128 * 1024,
            send_queue_blocks: 4,
            event_queue_size: 128,
            reconnect_interval: Duration::from_secs(1),
            tls: TlsOptions::default(),
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.recv_block_size == 0 {
            bail!("recv_block_size must be positive");
        }
        if self.send_queue_blocks == 0 {
            bail!("send_queue_blocks must be positive");
        }
        if self.event_queue_size == 0 {
            bail!("event_queue_size must be positive");
        }
        if self.reconnect_interval.is_zero() {
            bail!("reconnect_interval must be positive");
        }
        Ok(())
    }
}

/// Framing knobs for [`Packeter`](crate::packeter::Packeter).
#[derive(Clone)]
pub struct PacketerConfig {
    /// Slice size when draining a connection's send buffer into the link.
    pub send_block_size: usize,
    /// Upper bound for a decoded packet length. Anything larger marks the
    /// stream malformed and tears the connection down.
    pub max_packet_size: usize,
}

impl Default for PacketerConfig {
    fn default() -> PacketerConfig {
        PacketerConfig {
            send_block_size: 16 * 1024,
            max_packet_size: 16 * 1024 * 1024,
        }
    }
}

impl PacketerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_block_size == 0 {
            bail!("send_block_size must be positive");
        }
        if self.max_packet_size == 0 || self.max_packet_size > u32::MAX as usize {
            bail!("max_packet_size must fit the 4-byte length prefix");
        }
        Ok(())
    }
}

/// Bounds for one call to [`Link::run`](crate::link::Link::run).
#[derive(Clone)]
pub struct RunParams {
    /// Longest the loop sleeps waiting for socket events before running
    /// another pass anyway. Keep this below the reconnect interval.
    pub poll_timeout: Duration,
    /// Stop after processing this many socket events.
    pub max_events: Option<u64>,
    /// Stop after this much wall-clock time.
    pub max_runtime: Option<Duration>,
}

impl Default for RunParams {
    fn default() -> RunParams {
        RunParams {
            poll_timeout: Duration::from_millis(100),
            max_events: None,
            max_runtime: None,
        }
    }
}
