//! E2E Test: Flow Control
//!
//! Verifies the buffer caps bound memory without losing bytes:
//! - A slow reader caps what the receiver buffers
//! - Caps keep holding while links fail underneath
//! - Time-based acks keep a capped sender moving when the byte threshold
//!   is never reached

use {
    relink_e2e_tests::helpers::*,
    relink_socket::RelinkConfig,
    std::{thread, time::Duration},
};

const RECEIVE_CAP: usize = 16 * 1024;
const SEND_CAP: usize = 8 * 1024;
const PACKET: usize = 1024;

fn capped_config() -> RelinkConfig {
    RelinkConfig {
        max_receive_buffer_bytes: Some(RECEIVE_CAP),
        max_send_buffer_bytes: Some(SEND_CAP),
        max_packet_payload: PACKET,
        ..test_config()
    }
}

/// Most bytes a receiver may hold: its cap plus whatever the sender had
/// in flight when acks stopped.
fn receive_bound() -> usize {
    RECEIVE_CAP + SEND_CAP + 2 * PACKET
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: slow reader
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_receive_cap_bounds_buffering() {
    init_logging();
    let harness = Harness::with_config(capped_config());
    let (client, server) = harness.connect();
    let payload = random_payload(512 * 1024);

    // Returns at once: the sender buffers what the cap holds back.
    client.send(&payload).unwrap();
    thread::sleep(Duration::from_millis(300));
    let buffered = server.available();
    println!("  receiver holds {buffered} bytes with nobody reading");
    assert!(buffered >= RECEIVE_CAP);
    assert!(buffered <= receive_bound());

    let received = read_exactly(&server, payload.len());
    assert!(received == payload);
}

#[test]
fn test_slow_reader_with_link_failures() {
    init_logging();
    let harness = Harness::with_config(capped_config());
    let (client, server) = harness.connect();
    let payload = random_payload(256 * 1024);
    client.send(&payload).unwrap();

    let reader = {
        let server = server.clone();
        let len = payload.len();
        thread::spawn(move || {
            let mut received = Vec::with_capacity(len);
            let mut peak = 0;
            while received.len() < len {
                peak = peak.max(server.available());
                let want = (len - received.len()).min(4096);
                received.extend(read_exactly(&server, want));
                thread::sleep(Duration::from_millis(2));
            }
            (received, peak)
        })
    };
    const SEVERS: usize = 4;
    for _ in 0..SEVERS {
        thread::sleep(Duration::from_millis(40));
        harness.sever_links();
    }

    let (received, peak) = reader.join().unwrap();
    assert!(received == payload);
    // A rejoin acknowledges everything received so far, which may release
    // one more send window.
    let bound = receive_bound() + SEVERS * (SEND_CAP + PACKET);
    assert!(peak <= bound, "receiver buffered {peak} bytes");
    println!("✓ peak receive buffer {peak} bytes across link failures");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: acks without a byte threshold
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_time_based_acks_release_the_send_cap() {
    init_logging();
    let harness = Harness::with_config(RelinkConfig {
        max_send_buffer_bytes: Some(4 * 1024),
        max_packet_payload: PACKET,
        ack_threshold_bytes: 1 << 30,
        ack_interval: Duration::from_millis(50),
        ..test_config()
    });
    let (client, server) = harness.connect();
    let payload = random_payload(64 * 1024);

    client.send(&payload).unwrap();
    let received = read_exactly(&server, payload.len());
    assert!(received == payload);
}

#[test]
fn test_unprocessed_limit_still_delivers() {
    init_logging();
    let harness = Harness::with_config(RelinkConfig {
        max_unprocessed_bytes: Some(4 * PACKET),
        max_packet_payload: PACKET,
        ..test_config()
    });
    let (client, server) = harness.connect();
    let payload = random_payload(128 * 1024);

    let reader = {
        let server = server.clone();
        let len = payload.len();
        thread::spawn(move || read_exactly(&server, len))
    };
    client.send(&payload).unwrap();
    assert!(reader.join().unwrap() == payload);
}
