//! E2E Test: Close Handshake
//!
//! Verifies closing a virtual socket:
//! - Everything written before `close` reaches the peer, then end of stream
//! - Both sides closing at once settles on `Closed` for both
//! - A close requested while no link exists completes once one does
//! - Writes after a close are refused on both ends
//! - Dropping an endpoint right after `close` still delivers everything

use {
    relink_e2e_tests::helpers::*,
    relink_socket::{EntryState, RelinkConfig, RelinkError},
    std::{
        io::{self, Write},
        thread,
        time::Duration,
    },
};

fn assert_both_closed(harness: &Harness, client: &relink_socket::VirtualSocket) {
    assert!(
        wait_until(STEP_TIMEOUT, || client.is_closed()),
        "client stuck in {:?}",
        client.state()
    );
    assert!(wait_until(STEP_TIMEOUT, || {
        harness.connector.stats().connections_closed >= 1
            && harness.listener.stats().connections_closed >= 1
    }));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: orderly close
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_close_delivers_everything_written_before() {
    init_logging();
    let harness = Harness::with_config(RelinkConfig {
        max_packet_payload: 8192,
        ..test_config()
    });
    let (client, server) = harness.connect();
    let payload = random_payload(256 * 1024);

    let reader = spawn_reader(server.clone());
    client.send(&payload).unwrap();
    client.close().unwrap();

    let received = reader.join().unwrap();
    assert!(received == payload);
    assert!(server.is_input_pipe_closed());
    assert_both_closed(&harness, &client);
    println!("✓ {} bytes then end of stream", received.len());
}

#[test]
fn test_both_sides_close_at_once() {
    init_logging();
    let harness = Harness::new();
    let (client, server) = harness.connect();

    client.send(b"from client").unwrap();
    server.send(b"from server").unwrap();
    assert_eq!(read_exactly(&server, 11), b"from client");
    assert_eq!(read_exactly(&client, 11), b"from server");

    thread::scope(|scope| {
        scope.spawn(|| client.close().unwrap());
        scope.spawn(|| server.close().unwrap());
    });

    assert_both_closed(&harness, &client);
    assert!(wait_until(STEP_TIMEOUT, || server.is_closed()));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: endpoint dropped right after close
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_connector_dropped_right_after_close() {
    init_logging();
    let Harness {
        network: _network,
        listener,
        connector,
    } = Harness::new();
    let client = connector.connect(SERVER_ADDR).unwrap();
    let server = listener
        .accept_timeout(STEP_TIMEOUT)
        .unwrap()
        .expect("listener should accept");
    let payload = random_payload(200_000);

    client.send(&payload).unwrap();
    client.close().unwrap();
    drop(client);
    drop(connector);

    let received = read_to_end(&server);
    assert_eq!(received.len(), payload.len());
    assert!(received == payload);
    assert!(wait_until(STEP_TIMEOUT, || server.is_closed()));
    assert!(listener.stats().connections_closed >= 1);
    println!("✓ {} bytes then end of stream with the connector gone", received.len());
}

#[test]
fn test_listener_dropped_right_after_close() {
    init_logging();
    let Harness {
        network: _network,
        listener,
        connector,
    } = Harness::new();
    let client = connector.connect(SERVER_ADDR).unwrap();
    let server = listener
        .accept_timeout(STEP_TIMEOUT)
        .unwrap()
        .expect("listener should accept");
    let payload = random_payload(200_000);

    server.send(&payload).unwrap();
    server.close().unwrap();
    drop(server);
    drop(listener);

    let received = read_to_end(&client);
    assert_eq!(received.len(), payload.len());
    assert!(received == payload);
    assert!(wait_until(STEP_TIMEOUT, || client.is_closed()));
    assert!(connector.stats().connections_closed >= 1);
    println!("✓ {} bytes then end of stream with the listener gone", received.len());
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: close without a link
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_close_while_partitioned_completes_after_heal() {
    init_logging();
    let harness = Harness::new();
    let (client, server) = harness.connect();
    let payload = random_payload(20_000);

    let reader = spawn_reader(server.clone());
    harness.partition();
    client.send(&payload).unwrap();
    client.close().unwrap();
    assert!(wait_until(STEP_TIMEOUT, || {
        client.state() == Some(EntryState::DeadClosing)
    }));

    thread::sleep(Duration::from_millis(100));
    harness.heal();

    let received = reader.join().unwrap();
    assert!(received == payload);
    assert_both_closed(&harness, &client);
    println!("✓ close carried across the partition");
}

#[test]
fn test_link_failures_during_close() {
    init_logging();
    let harness = Harness::with_config(RelinkConfig {
        max_packet_payload: 1024,
        ..test_config()
    });
    let (client, server) = harness.connect();
    let payload = random_payload(512 * 1024);

    let reader = spawn_reader(server.clone());
    client.send(&payload).unwrap();
    client.close().unwrap();
    for _ in 0..3 {
        harness.sever_links();
        thread::sleep(Duration::from_millis(20));
    }

    let received = reader.join().unwrap();
    assert_eq!(received.len(), payload.len());
    assert!(received == payload);
    assert_both_closed(&harness, &client);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: writes after close
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_write_after_local_close_fails() {
    init_logging();
    let harness = Harness::new();
    let (client, _server) = harness.connect();

    client.close().unwrap();
    assert!(matches!(
        client.send(b"late"),
        Err(RelinkError::ConnectionClosed)
    ));
    let err = client.output_stream().write_all(b"late").unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    assert!(matches!(client.close(), Err(RelinkError::ConnectionClosed)));
}

#[test]
fn test_write_after_peer_close_fails() {
    init_logging();
    let harness = Harness::new();
    let (client, server) = harness.connect();

    client.close().unwrap();
    assert!(wait_until(STEP_TIMEOUT, || server.is_input_pipe_closed()));
    assert!(server.send(b"too late").is_err());
    assert_eq!(read_to_end(&server), Vec::<u8>::new());
}
