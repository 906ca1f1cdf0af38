//! Configuration for relink virtual sockets.

use {
    crate::{
        command::HEADER_LEN,
        error::{RelinkError, Result},
    },
    std::time::Duration,
};

/// Largest payload carried by one data packet unless configured otherwise.
pub const DEFAULT_MAX_PACKET_PAYLOAD: usize = 64 * 1024;

/// Tunables shared by every connection owned by one coordinator.
///
/// The configuration is copied into each connection when it is created and
/// never changes afterwards.
#[derive(Debug, Clone)]
pub struct RelinkConfig {
    /// Cap on bytes buffered for the application to read, per connection.
    /// While the buffer is at the cap, data acks are withheld so the peer's
    /// send cap eventually stops it. `None` means unlimited.
    pub max_receive_buffer_bytes: Option<usize>,

    /// Cap on sent-but-unacknowledged bytes per connection. Writes beyond it
    /// are still accepted and buffered, but not put on the wire until acks
    /// bring the outstanding total back under the cap. `None` means unlimited.
    pub max_send_buffer_bytes: Option<usize>,

    /// How long the recovery agent waits for a join handshake to complete on
    /// a freshly dialed link before abandoning it.
    pub join_success_timeout: Duration,

    /// Delay between two recovery attempts.
    pub recovery_retry_delay: Duration,

    /// Bytes received since the last data ack that trigger a new ack.
    pub ack_threshold_bytes: usize,

    /// Time since the last data ack after which pending bytes are acked
    /// regardless of volume.
    pub ack_interval: Duration,

    /// A link that has not carried its connection to an established (or
    /// closing, or closed) state within this time is shut down by its writer.
    pub link_settle_timeout: Duration,

    /// `connect()` logs a warning each time this much time passes without
    /// the connection being established.
    pub connect_warn_interval: Duration,

    /// Optional hard deadline for `connect()`. `None` waits forever.
    pub connect_timeout: Option<Duration>,

    /// Application writes are split into packets of at most this many bytes.
    pub max_packet_payload: usize,

    /// Frames larger than this are rejected by the decoder and fail the link.
    pub max_frame_size: usize,

    /// Cap on framed-but-undispatched bytes per link. The link reader stops
    /// draining the transport while it is exceeded. `None` means unlimited.
    pub max_unprocessed_bytes: Option<usize>,

    /// Poll interval of the coordinator loop when no message arrives; drives
    /// time-based acks.
    pub tick_interval: Duration,

    /// Once the endpoint and every socket are gone, the coordinator keeps
    /// running this long so closing connections can finish their close
    /// handshake. Zero abandons them immediately.
    pub shutdown_linger: Duration,
}

impl Default for RelinkConfig {
    fn default() -> Self {
        Self {
            max_receive_buffer_bytes: None,
            max_send_buffer_bytes: None,
            join_success_timeout: Duration::from_secs(10),
            recovery_retry_delay: Duration::from_secs(1),
            ack_threshold_bytes: 1024,
            ack_interval: Duration::from_secs(10),
            link_settle_timeout: Duration::from_secs(30),
            connect_warn_interval: Duration::from_secs(20),
            connect_timeout: None,
            max_packet_payload: DEFAULT_MAX_PACKET_PAYLOAD,
            max_frame_size: 1_048_576 + HEADER_LEN, // 1 MB payload
            max_unprocessed_bytes: None,
            tick_interval: Duration::from_millis(100),
            shutdown_linger: Duration::from_secs(10),
        }
    }
}

impl RelinkConfig {
    /// Create a config suitable for local testing with shorter timeouts.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            join_success_timeout: Duration::from_secs(2),
            recovery_retry_delay: Duration::from_millis(50),
            ack_interval: Duration::from_millis(500),
            link_settle_timeout: Duration::from_secs(5),
            connect_warn_interval: Duration::from_secs(2),
            connect_timeout: Some(Duration::from_secs(10)),
            tick_interval: Duration::from_millis(20),
            shutdown_linger: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Reject configurations the protocol cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_packet_payload == 0 {
            return Err(RelinkError::InvalidConfig(
                "max_packet_payload must be non-zero".to_string(),
            ));
        }
        // A full data frame must fit: header, packet id, length prefix, payload.
        let largest_data_frame = self
            .max_packet_payload
            .saturating_add(HEADER_LEN)
            .saturating_add(16);
        if largest_data_frame > self.max_frame_size {
            return Err(RelinkError::InvalidConfig(format!(
                "max_frame_size {} cannot carry a {} byte packet",
                self.max_frame_size, self.max_packet_payload
            )));
        }
        if self.ack_threshold_bytes == 0 {
            return Err(RelinkError::InvalidConfig(
                "ack_threshold_bytes must be non-zero".to_string(),
            ));
        }
        if let Some(cap) = self.max_send_buffer_bytes {
            if cap == 0 {
                return Err(RelinkError::InvalidConfig(
                    "max_send_buffer_bytes must be non-zero when set".to_string(),
                ));
            }
        }
        if let Some(cap) = self.max_receive_buffer_bytes {
            if cap == 0 {
                return Err(RelinkError::InvalidConfig(
                    "max_receive_buffer_bytes must be non-zero when set".to_string(),
                ));
            }
        }
        if self.tick_interval.is_zero() {
            return Err(RelinkError::InvalidConfig(
                "tick_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
