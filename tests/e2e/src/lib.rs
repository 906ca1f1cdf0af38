//! Relink End-to-End Test Suite
//!
//! Runs connectors and listeners against each other over the in-memory
//! transport, killing and partitioning links underneath live virtual
//! sockets, and checks what the applications on both ends observe.
//!
//! Each test file can be run independently:
//!
//! ```bash
//! cargo test -p relink-e2e-tests --test basic_stream -- --nocapture
//! cargo test -p relink-e2e-tests --test recovery -- --nocapture
//! cargo test -p relink-e2e-tests --test close_handshake -- --nocapture
//! cargo test -p relink-e2e-tests --test flow_control -- --nocapture
//! ```

pub mod helpers;
