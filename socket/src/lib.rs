//! Relink virtual sockets
//!
//! A virtual socket is an ordered, exactly-once byte stream between two
//! nodes that outlives the physical links carrying it. When a link dies the
//! connector dials a new one and both sides resume where they left off;
//! closing waits until every byte written before the close has arrived.
//!
//! ## Architecture
//!
//! ```text
//!   VirtualSocket / InputStream / OutputStream      (application threads)
//!                 │  BrainHandle (crossbeam channel)
//!   ┌─────────────▼──────────────────────────────┐
//!   │  Brain: one thread per endpoint            │
//!   │  • Entry state machines + handler table    │
//!   │  • link ↔ connection binding, staleness    │
//!   └──────┬─────────────────────────┬───────────┘
//!          │ LinkHandle              │ RecoveryEvent
//!   ┌──────▼──────────────┐   ┌──────▼───────────┐
//!   │ Link                │   │ RecoveryAgent    │
//!   │ reader, dispatcher, │   │ (connector only) │
//!   │ writer threads      │   │ dial + handshake │
//!   └──────┬──────────────┘   └──────────────────┘
//!          │ ByteStream (relink-transport)
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]   | `RelinkConfig` defaults, dev overrides, validation |
//! | [`command`]  | Wire commands, framing and the payload codec registry |
//! | [`triplet`]  | Connection identity |
//! | [`entry`]    | Per-connection state machine |
//! | [`handler`]  | `(state, command)` transition table |
//! | [`input`]    | Receive buffer feeding the application |
//! | [`link`]     | Physical link wrapper |
//! | [`brain`]    | The coordinator thread |
//! | [`recovery`] | Connector-side reconnect agent |
//! | [`socket`]   | `VirtualSocket` and its stream adapters |
//! | [`endpoint`] | `Connector` and `Listener` |
//! | [`stats`]    | Coordinator counters |
//! | [`error`]    | Crate-wide error enum |

pub mod brain;
pub mod command;
pub mod config;
pub mod endpoint;
pub mod entry;
pub mod error;
pub mod handler;
pub mod input;
pub mod link;
pub mod recovery;
pub mod socket;
pub mod stats;
pub mod triplet;

pub use {
    config::RelinkConfig,
    endpoint::{Connector, Listener},
    entry::EntryState,
    error::{RelinkError, Result},
    socket::{InputStream, OutputStream, VirtualSocket},
    stats::StatsSnapshot,
    triplet::{ConnKey, NodeId},
};
