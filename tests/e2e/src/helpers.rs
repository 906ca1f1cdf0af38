//! Shared test utilities for relink end-to-end tests.
//!
//! Provides a simulated network environment with:
//! - One listener and one connector sharing a [`MemoryNetwork`]
//! - Fault injection: severing every live link, partitioning the network
//! - Blocking read helpers with generous deadlines

use {
    log::*,
    rand::Rng,
    relink_socket::{Connector, Listener, RelinkConfig, VirtualSocket},
    relink_transport::MemoryNetwork,
    std::{
        sync::Arc,
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Address the harness listener binds to.
pub const SERVER_ADDR: &str = "server:7000";

/// Upper bound for any single blocking step in a scenario.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(20);

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

/// A listener and a connector on one simulated network.
pub struct Harness {
    pub network: MemoryNetwork,
    pub listener: Listener,
    pub connector: Connector,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: RelinkConfig) -> Self {
        let network = MemoryNetwork::new();
        let listener = Listener::bind(&network, SERVER_ADDR, config.clone())
            .expect("listener should bind");
        let connector =
            Connector::new(Arc::new(network.clone()), config).expect("connector should start");
        Self {
            network,
            listener,
            connector,
        }
    }

    /// Open one virtual connection. Returns `(client, server)`.
    pub fn connect(&self) -> (VirtualSocket, VirtualSocket) {
        let client = self
            .connector
            .connect(SERVER_ADDR)
            .expect("connect should succeed");
        let server = self
            .listener
            .accept_timeout(STEP_TIMEOUT)
            .expect("listener alive")
            .expect("listener should accept");
        assert_eq!(client.key(), server.key());
        (client, server)
    }

    /// Kill every physical link currently open on the network.
    pub fn sever_links(&self) -> usize {
        let severed = self.network.sever_all();
        info!("Harness: severed {} link(s)", severed);
        severed
    }

    /// Refuse new dials until [`Harness::heal`] is called, and kill the
    /// links that exist now.
    pub fn partition(&self) {
        self.network.set_partitioned(true);
        self.sever_links();
    }

    pub fn heal(&self) {
        self.network.set_partitioned(false);
        info!("Harness: network healed");
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Initialize logging once; honours `RUST_LOG`.
pub fn init_logging() {
    relink_logger::setup_for_tests();
}

/// Short timeouts so recoveries happen in milliseconds.
pub fn test_config() -> RelinkConfig {
    RelinkConfig {
        join_success_timeout: Duration::from_secs(1),
        recovery_retry_delay: Duration::from_millis(20),
        connect_timeout: Some(STEP_TIMEOUT),
        ..RelinkConfig::dev_default()
    }
}

pub fn random_payload(len: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    (0..len).map(|_| rng.random()).collect()
}

/// `timeout` from now, clamped for timeouts too large to represent.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(Duration::from_secs(31_536_000)))
        .unwrap_or(now)
}

/// Read exactly `len` bytes, failing the test if they do not arrive in time.
pub fn read_exactly(socket: &VirtualSocket, len: usize) -> Vec<u8> {
    let deadline = deadline_after(STEP_TIMEOUT);
    let mut out = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(!remaining.is_zero(), "only {filled} of {len} bytes arrived");
        let n = socket
            .recv_timeout(&mut out[filled..], remaining)
            .expect("read should succeed");
        assert!(n > 0, "stream ended after {filled} of {len} bytes");
        filled = filled.saturating_add(n);
    }
    out
}

/// Read until end of stream.
pub fn read_to_end(socket: &VirtualSocket) -> Vec<u8> {
    let deadline = deadline_after(STEP_TIMEOUT);
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(!remaining.is_zero(), "no end of stream after {} bytes", out.len());
        let n = socket
            .recv_timeout(&mut buf, remaining)
            .expect("read should succeed");
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Read to end of stream on a background thread.
pub fn spawn_reader(socket: VirtualSocket) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || read_to_end(&socket))
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = deadline_after(timeout);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_until_accepts_unbounded_timeout() {
        assert!(deadline_after(Duration::MAX) > Instant::now());
        assert!(wait_until(Duration::MAX, || true));
    }
}
