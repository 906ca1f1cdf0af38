//! Physical transports for relink.
//!
//! A relink virtual socket rides on top of *some* ordered byte stream and
//! replaces that stream whenever it dies. This crate defines the boundary
//! between the two:
//!
//! - [`ByteStream`]: one physical connection (read, write, shutdown).
//! - [`LinkAcceptor`]: the passive side, yielding inbound streams.
//! - [`Transport`]: the factory, `dial(address)` and `listen(address)`.
//!
//! Two providers ship with the crate:
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`tcp`]    | plain `std::net` TCP |
//! | [`memory`] | in-process pipes with fault injection, for tests and simulations |
//! | [`error`]  | address parsing errors |

pub mod error;
pub mod memory;
pub mod tcp;

pub use {
    error::{Result, TransportError},
    memory::{MemoryAcceptor, MemoryNetwork, MemoryStream},
    tcp::{TcpAcceptor, TcpByteStream, TcpTransport},
};

use std::io::{self, Read, Write};

/// One physical, ordered byte-stream connection.
///
/// The link layer reads from one handle and writes from another (obtained
/// with [`ByteStream::try_clone_stream`]) on separate threads, and keeps a
/// third around to [`ByteStream::shutdown`] the connection from anywhere.
pub trait ByteStream: Read + Write + Send + 'static {
    /// A new handle to the same underlying connection.
    fn try_clone_stream(&self) -> io::Result<Box<dyn ByteStream>>;

    /// Close both directions. Blocked reads on every handle return.
    fn shutdown(&self);

    /// Whether the connection is still believed to be usable.
    fn is_connected(&self) -> bool;

    /// Whether [`ByteStream::shutdown`] was called or the peer went away.
    fn is_closed(&self) -> bool {
        !self.is_connected()
    }

    /// Human-readable description of the remote end, for logs.
    fn peer_label(&self) -> String;
}

/// The passive half of a transport.
pub trait LinkAcceptor: Send + Sync + 'static {
    /// Block until the next inbound connection arrives.
    fn accept(&self) -> io::Result<Box<dyn ByteStream>>;

    /// The address peers should dial to reach this acceptor.
    fn local_addr(&self) -> String;

    /// Stop accepting; a blocked [`LinkAcceptor::accept`] returns an error.
    fn close(&self);
}

/// Factory for physical connections.
pub trait Transport: Send + Sync + 'static {
    /// Open a new outbound connection to `addr`.
    fn dial(&self, addr: &str) -> io::Result<Box<dyn ByteStream>>;

    /// Start accepting inbound connections on `addr`.
    fn listen(&self, addr: &str) -> io::Result<Box<dyn LinkAcceptor>>;
}

/// Split `"host:port"` into its parts. IPv6 hosts may be bracketed.
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| TransportError::InvalidAddress(addr.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| TransportError::InvalidAddress(addr.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(TransportError::InvalidAddress(addr.to_string()));
    }
    Ok((host.to_string(), port))
}
