//! E2E Test: Link Recovery
//!
//! Verifies the application never notices a dead link:
//! - Bytes written before and after a link death arrive exactly once
//! - Continuous streaming survives repeated link failures
//! - Writes made during a partition are delivered after it heals
//! - `connect` waits for a listener that is not reachable yet

use {
    relink_e2e_tests::helpers::*,
    relink_socket::{EntryState, RelinkConfig},
    std::{thread, time::Duration},
};

// ─────────────────────────────────────────────────────────────────────────────
// Test: a single link death
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_bytes_survive_link_death() {
    init_logging();
    let harness = Harness::new();
    let (client, server) = harness.connect();

    client.send(b"before ").unwrap();
    assert_eq!(read_exactly(&server, 7), b"before ");

    assert!(harness.sever_links() > 0);
    client.send(b"after").unwrap();
    server.send(b"reply").unwrap();

    assert_eq!(read_exactly(&server, 5), b"after");
    assert_eq!(read_exactly(&client, 5), b"reply");
    assert!(wait_until(STEP_TIMEOUT, || {
        harness.connector.stats().recoveries >= 1
    }));
    assert!(wait_until(STEP_TIMEOUT, || {
        client.state() == Some(EntryState::Established)
    }));
    println!("✓ connection recovered, nothing lost or repeated");
}

#[test]
fn test_unacknowledged_bytes_are_resent_once() {
    init_logging();
    // Acks only on a slow timer, so most packets are unacknowledged when
    // the link dies.
    let harness = Harness::with_config(RelinkConfig {
        ack_threshold_bytes: 1 << 30,
        ack_interval: Duration::from_secs(60),
        max_packet_payload: 1024,
        ..test_config()
    });
    let (client, server) = harness.connect();
    let payload = random_payload(64 * 1024);

    client.send(&payload).unwrap();
    let head = read_exactly(&server, 16 * 1024);
    harness.sever_links();
    let tail = read_exactly(&server, payload.len() - head.len());

    let mut received = head;
    received.extend_from_slice(&tail);
    assert!(received == payload);
    assert_eq!(server.available(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: streaming through repeated failures
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_streaming_through_repeated_failures() {
    init_logging();
    let harness = Harness::with_config(RelinkConfig {
        max_packet_payload: 2048,
        ..test_config()
    });
    let (client, server) = harness.connect();
    let payload = random_payload(2 * 1024 * 1024);

    let writer = {
        let client = client.clone();
        let payload = payload.clone();
        thread::spawn(move || {
            for chunk in payload.chunks(8 * 1024) {
                client.send(chunk).unwrap();
                thread::sleep(Duration::from_micros(200));
            }
        })
    };
    let reader = {
        let server = server.clone();
        let len = payload.len();
        thread::spawn(move || read_exactly(&server, len))
    };

    for round in 0..10 {
        thread::sleep(Duration::from_millis(30));
        let severed = harness.sever_links();
        println!("  round {round}: severed {severed} link(s)");
    }

    writer.join().unwrap();
    let received = reader.join().unwrap();
    assert!(received == payload, "stream corrupted by recovery");
    println!(
        "✓ {} bytes intact, {} recoveries, {} packets retransmitted",
        received.len(),
        harness.connector.stats().recoveries,
        harness.connector.stats().packets_retransmitted
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: partitions
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_writes_during_partition_arrive_after_heal() {
    init_logging();
    let harness = Harness::new();
    let (client, server) = harness.connect();

    harness.partition();
    // Accepted and buffered while no link exists.
    client.send(b"queued while down").unwrap();
    thread::sleep(Duration::from_millis(200));
    assert!(matches!(
        client.state(),
        Some(EntryState::Dead | EntryState::ConnectorJoinSent)
    ));
    assert_eq!(server.available(), 0);

    harness.heal();
    assert_eq!(read_exactly(&server, 17), b"queued while down");
    assert!(harness.connector.stats().link_failures >= 1);
}

#[test]
fn test_connect_waits_for_reachable_listener() {
    init_logging();
    let harness = Harness::new();
    harness.network.set_partitioned(true);

    thread::scope(|scope| {
        let connecting = scope.spawn(|| harness.connector.connect(SERVER_ADDR));
        thread::sleep(Duration::from_millis(200));
        assert!(!connecting.is_finished());

        harness.heal();
        let client = connecting.join().unwrap().unwrap();
        let server = harness
            .listener
            .accept_timeout(STEP_TIMEOUT)
            .unwrap()
            .expect("connection should arrive");
        assert_eq!(client.key(), server.key());

        client.send(b"late hello").unwrap();
        assert_eq!(read_exactly(&server, 10), b"late hello");
    });
}
