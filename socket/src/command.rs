//! Wire commands exchanged between the two ends of a virtual connection.
//!
//! ## Wire format
//!
//! ```text
//! [4 bytes: magic (u32-be)] [2 bytes: command id (u16-be)]
//! [4 bytes: total frame length incl. header (u32-be)] [N bytes: payload]
//! ```
//!
//! The payload is the bincode encoding of `(ConnKey, body)`. Decoding is
//! driven purely by the command id: the id selects the body type, see
//! [`CommandBody::decode_payload`].

use {
    crate::{
        error::{RelinkError, Result},
        triplet::ConnKey,
    },
    num_enum::{IntoPrimitive, TryFromPrimitive},
    serde::{Deserialize, Serialize},
    std::io::{self, Read},
    strum_macros::Display,
};

/// Frame magic, "RLNK".
pub const MAGIC: u32 = 0x524C_4E4B;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 10;

// ── Payloads ────────────────────────────────────────────────────────────────

/// First command on a fresh connection: where the connector dialed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewConnTarget {
    pub host: String,
    pub port: u16,
}

/// Acknowledgment of one step of a new-connection, join or join-close
/// handshake. Step 0 means "connection unknown".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub step: u8,
}

/// Body of a command that carries nothing but the connection key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal;

/// One sequenced chunk of application bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPacket {
    pub packet_id: u64,
    pub payload: Vec<u8>,
}

/// Refers to a packet id. The meaning depends on the command: the highest
/// id received for acks, the first id wanted for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketRef {
    pub packet_id: u64,
}

/// Id of the last packet the sender will ever send, `None` if it sent none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalPacket {
    pub last_packet_id: Option<u64>,
}

// ── Command set ─────────────────────────────────────────────────────────────

macro_rules! command_set {
    ($($(#[$doc:meta])* $kind:ident = $id:literal => $payload:ty,)*) => {
        /// Wire id of every command.
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Display,
        )]
        #[repr(u16)]
        pub enum CommandKind {
            $($(#[$doc])* $kind = $id,)*
        }

        /// Kind-specific part of a command.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum CommandBody {
            $($(#[$doc])* $kind($payload),)*
        }

        impl CommandBody {
            pub fn kind(&self) -> CommandKind {
                match self {
                    $(Self::$kind(_) => CommandKind::$kind,)*
                }
            }

            fn encode_payload(&self, conn: &ConnKey) -> bincode::Result<Vec<u8>> {
                match self {
                    $(Self::$kind(body) => bincode::serialize(&(conn, body)),)*
                }
            }

            /// Registry: decode the payload of a frame whose id is `kind`.
            fn decode_payload(kind: CommandKind, payload: &[u8]) -> bincode::Result<(ConnKey, Self)> {
                match kind {
                    $(CommandKind::$kind => {
                        let (conn, body): (ConnKey, $payload) = bincode::deserialize(payload)?;
                        Ok((conn, Self::$kind(body)))
                    })*
                }
            }
        }
    };
}

command_set! {
    /// Connector opens a brand new connection.
    NewConn = 1 => NewConnTarget,
    /// Steps 1 (connectee) and 2 (connector) of the new-connection handshake.
    AckNewConn = 2 => HandshakeAck,
    /// Connector resumes a connection over a replacement link.
    JoinConn = 3 => Signal,
    /// Steps 1..=3 of the join handshake.
    AckJoinConn = 4 => HandshakeAck,
    /// Connector resumes a closing connection over a replacement link.
    JoinCloseConn = 5 => Signal,
    /// Steps 1 and 2 of the join-close handshake.
    AckJoinCloseConn = 6 => HandshakeAck,
    Data = 7 => DataPacket,
    /// Everything up to and including `packet_id` was received.
    DataReceived = 8 => PacketRef,
    /// A gap was seen; resend from `packet_id`.
    DataRequest = 9 => PacketRef,
    /// Connectee's resync request after a join.
    DataRequestOnReconnect = 10 => PacketRef,
    /// Connector's reply to the resync request, carrying its own first
    /// wanted id. Signals it is ready to complete the join.
    AckDataRequestOnReconnect = 11 => PacketRef,
    CloseConn = 12 => Signal,
    AckCloseConn = 13 => Signal,
    /// Sent by each side of a closing connection: first id not yet received.
    CloseDataRequest = 14 => PacketRef,
    AckCloseDataRequest = 15 => FinalPacket,
    ReadyToClose = 16 => Signal,
    AckReadyToClose = 17 => Signal,
}

/// A command addressed to one logical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub conn: ConnKey,
    pub body: CommandBody,
}

impl Command {
    pub fn new(conn: ConnKey, body: CommandBody) -> Self {
        Self { conn, body }
    }

    pub fn kind(&self) -> CommandKind {
        self.body.kind()
    }

    /// Serialize into a complete frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = self.body.encode_payload(&self.conn)?;
        let total = payload.len().saturating_add(HEADER_LEN);
        let total_u32 = u32::try_from(total).map_err(|_| RelinkError::FrameTooLarge {
            size: total,
            max: u32::MAX as usize,
        })?;
        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(&MAGIC.to_be_bytes());
        frame.extend_from_slice(&u16::from(self.kind()).to_be_bytes());
        frame.extend_from_slice(&total_u32.to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode a payload given the command id from its frame header.
    pub fn decode(id: u16, payload: &[u8]) -> Result<Self> {
        let kind = CommandKind::try_from(id).map_err(|_| RelinkError::UnknownCommand(id))?;
        let (conn, body) = CommandBody::decode_payload(kind, payload)?;
        Ok(Self { conn, body })
    }

    /// Read exactly one frame from `reader`.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream between frames, and the
    /// decoded command together with its frame size otherwise.
    pub fn read_from<R: Read + ?Sized>(
        reader: &mut R,
        max_frame_size: usize,
    ) -> Result<Option<(Self, usize)>> {
        let mut header = [0u8; HEADER_LEN];
        if !read_header(reader, &mut header)? {
            return Ok(None);
        }
        let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if magic != MAGIC {
            return Err(RelinkError::BadMagic(magic));
        }
        let id = u16::from_be_bytes([header[4], header[5]]);
        let total = u32::from_be_bytes([header[6], header[7], header[8], header[9]]) as usize;
        if total < HEADER_LEN {
            return Err(RelinkError::FrameTooShort(total));
        }
        if total > max_frame_size {
            return Err(RelinkError::FrameTooLarge {
                size: total,
                max: max_frame_size,
            });
        }
        let mut payload = vec![0u8; total.saturating_sub(HEADER_LEN)];
        reader.read_exact(&mut payload)?;
        let command = Self::decode(id, &payload)?;
        Ok(Some((command, total)))
    }
}

/// Fill `header`, distinguishing a clean EOF before the first byte.
fn read_header<R: Read + ?Sized>(reader: &mut R, header: &mut [u8; HEADER_LEN]) -> Result<bool> {
    let mut filled = 0usize;
    while filled < HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(RelinkError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "link closed inside a frame header",
                )))
            }
            Ok(n) => filled = filled.saturating_add(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}
