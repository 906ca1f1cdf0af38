//! E2E Test: Basic Streams
//!
//! Verifies a virtual socket behaves like an ordinary byte stream when no
//! link ever fails:
//! - Request/response round trips in both directions
//! - Bulk transfer split across many packets
//! - Many connections through one connector and one listener
//! - Concurrent writers on one socket never interleave inside a write

use {
    relink_e2e_tests::helpers::*,
    relink_socket::{EntryState, RelinkConfig},
    std::{
        io::{Read, Write},
        thread,
    },
};

// ─────────────────────────────────────────────────────────────────────────────
// Test: request/response
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_echo_round_trip() {
    init_logging();
    let harness = Harness::new();
    let (client, server) = harness.connect();
    assert_eq!(client.state(), Some(EntryState::Established));

    let echo = {
        let server = server.clone();
        thread::spawn(move || {
            for _ in 0..10 {
                let request = read_exactly(&server, 5);
                server.send(&request).unwrap();
            }
        })
    };
    for i in 0..10u8 {
        let request = [b'p', b'i', b'n', b'g', i];
        client.send(&request).unwrap();
        assert_eq!(read_exactly(&client, 5), request);
    }
    echo.join().unwrap();
    println!("✓ 10 echo round trips");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: bulk transfer
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_bulk_transfer_both_directions() {
    init_logging();
    let harness = Harness::with_config(RelinkConfig {
        max_packet_payload: 4096,
        ..test_config()
    });
    let (client, server) = harness.connect();
    let upstream = random_payload(512 * 1024);
    let downstream = random_payload(300 * 1024);

    let server_side = {
        let server = server.clone();
        let downstream = downstream.clone();
        let expected = upstream.len();
        thread::spawn(move || {
            server.output_stream().write_all(&downstream).unwrap();
            read_exactly(&server, expected)
        })
    };
    client.output_stream().write_all(&upstream).unwrap();
    let received_by_client = read_exactly(&client, downstream.len());
    let received_by_server = server_side.join().unwrap();

    assert!(received_by_server == upstream, "upstream bytes differ");
    assert!(received_by_client == downstream, "downstream bytes differ");
    println!(
        "✓ {} bytes up, {} bytes down",
        upstream.len(),
        downstream.len()
    );
}

#[test]
fn test_stream_adapters_read_to_end() {
    init_logging();
    let harness = Harness::new();
    let (client, server) = harness.connect();
    let payload = random_payload(100_000);

    let mut output = client.output_stream();
    output.write_all(&payload).unwrap();
    output.flush().unwrap();
    output.close().unwrap();

    let mut received = Vec::new();
    server.input_stream().read_to_end(&mut received).unwrap();
    assert!(received == payload);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: many connections
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_many_connections_are_independent() {
    init_logging();
    let harness = Harness::new();
    let pairs: Vec<_> = (0..8).map(|_| harness.connect()).collect();

    for (i, (client, _)) in pairs.iter().enumerate() {
        client.send(&vec![i as u8; 1000 + i]).unwrap();
    }
    for (i, (_, server)) in pairs.iter().enumerate() {
        assert_eq!(read_exactly(server, 1000 + i), vec![i as u8; 1000 + i]);
        assert_eq!(server.available(), 0);
    }

    let mut keys: Vec<_> = pairs.iter().map(|(client, _)| client.key()).collect();
    keys.dedup();
    assert_eq!(keys.len(), 8);
    assert_eq!(harness.connector.stats().connections_opened, 8);
    assert_eq!(harness.listener.stats().connections_opened, 8);
    println!("✓ 8 connections carried their own bytes");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: concurrent writers
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_concurrent_writes_stay_whole() {
    const WRITERS: u8 = 4;
    const MESSAGES: usize = 200;
    const MESSAGE_LEN: usize = 32;

    init_logging();
    let harness = Harness::new();
    let (client, server) = harness.connect();

    let writers: Vec<_> = (0..WRITERS)
        .map(|id| {
            let client = client.clone();
            thread::spawn(move || {
                for _ in 0..MESSAGES {
                    client.send(&[id; MESSAGE_LEN]).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let total = usize::from(WRITERS) * MESSAGES * MESSAGE_LEN;
    let received = read_exactly(&server, total);
    let mut counts = [0usize; WRITERS as usize];
    for message in received.chunks(MESSAGE_LEN) {
        let id = message[0];
        assert!(message.iter().all(|b| *b == id), "a write was split");
        counts[usize::from(id)] += 1;
    }
    assert!(counts.iter().all(|c| *c == MESSAGES));
}
