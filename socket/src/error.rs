//! Error types for relink virtual sockets.

use {
    crate::{command::CommandKind, entry::EntryState, triplet::ConnKey},
    std::{io, time::Duration},
    thiserror::Error,
};

/// Errors that can occur in the relink socket layer.
///
/// Only [`RelinkError::ConnectionClosed`], [`RelinkError::ConnectTimeout`]
/// and [`RelinkError::CoordinatorGone`] ever reach the application; the rest
/// are handled (logged, link failed, command dropped) inside the stack.
#[derive(Error, Debug)]
pub enum RelinkError {
    /// Transport-level I/O error.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// A command payload failed to (de)serialize.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// A frame did not start with the protocol magic.
    #[error("bad frame magic: {0:#010x}")]
    BadMagic(u32),

    /// A frame carried a command id with no registered decoder.
    #[error("unknown command id: {0}")]
    UnknownCommand(u16),

    /// Frame exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge {
        /// Declared frame size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Declared frame length is smaller than the header itself.
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    /// The coordinator thread has stopped.
    #[error("coordinator is gone")]
    CoordinatorGone,

    /// No entry exists for the connection.
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnKey),

    /// A command arrived that the entry's current state does not accept.
    #[error("unexpected {kind} in state {state}")]
    UnexpectedCommand {
        /// Kind of the offending command.
        kind: CommandKind,
        /// State of the entry when it arrived.
        state: EntryState,
    },

    /// A local operation is not allowed in the entry's current state.
    #[error("operation refused in state {state}")]
    Refused {
        /// State of the entry at the time.
        state: EntryState,
    },

    /// The virtual connection is closing or closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// `connect()` hit its configured deadline.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The configuration cannot be used.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl From<RelinkError> for io::Error {
    fn from(err: RelinkError) -> Self {
        let kind = match &err {
            RelinkError::Io(e) => e.kind(),
            RelinkError::ConnectionClosed | RelinkError::Refused { .. } => {
                io::ErrorKind::BrokenPipe
            }
            RelinkError::ConnectTimeout(_) => io::ErrorKind::TimedOut,
            RelinkError::CoordinatorGone => io::ErrorKind::NotConnected,
            RelinkError::UnknownConnection(_) => io::ErrorKind::NotFound,
            RelinkError::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            RelinkError::Codec(_)
            | RelinkError::BadMagic(_)
            | RelinkError::UnknownCommand(_)
            | RelinkError::FrameTooLarge { .. }
            | RelinkError::FrameTooShort(_)
            | RelinkError::UnexpectedCommand { .. } => io::ErrorKind::InvalidData,
        };
        match err {
            RelinkError::Io(e) => e,
            other => io::Error::new(kind, other),
        }
    }
}

/// Convenience result type for relink operations.
pub type Result<T> = std::result::Result<T, RelinkError>;
