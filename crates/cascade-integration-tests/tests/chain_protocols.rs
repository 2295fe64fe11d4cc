//! Integration test: chain protocols announced by the last mix.
//!
//! Exercises the chains that go beyond a plain echo:
//! 1. Fixed ratio (0.5): one channel per upstream cell, the chain id handed
//!    out by the last mix and carried back on every sequel channel
//! 2. Fixed ratio packet accounting: an extra packet, a missing packet and a
//!    channel that never answers all fail the chain
//! 3. Flow control (0.6): every n-th upstream cell is flagged and flagged
//!    downstream cells are acknowledged
//! 4. A connection error signaled by the last mix reaches the reader
//! 5. A write blocked on a fixed-ratio chain can be interrupted

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cascade_client::cascade::ChainProtocolInfo;
use cascade_client::{AnonClient, ClientEvent};
use cascade_integration_tests::{
    test_client, DownstreamFault, FakeCascade, MixEvent, MixSession, PresetConnector, WAIT,
};
use cascade_mux::{CancelToken, ChainProtocol, DataChain, FixedRatio, FlowControl, MuxError, ReadStatus};
use cascade_wire::cell::{ChainCell, FLAG_CONNECTION_ERROR, FLAG_FLOW_CONTROL, SEQ_FLAG_NEW_CHAIN, SEQ_FLAG_STREAM_CLOSED};

fn fixed_ratio(downstream_packets: i64, channel_timeout: i64) -> ChainProtocolInfo {
    ChainProtocolInfo {
        version: "0.5".into(),
        downstream_packets: Some(downstream_packets),
        channel_timeout: Some(channel_timeout),
        chain_timeout: Some(10),
        ..ChainProtocolInfo::default()
    }
}

fn connect(cascade: &FakeCascade) -> (AnonClient, MixSession) {
    let connector = PresetConnector::new();
    let (connection, session) = cascade.serve().expect("loopback should succeed");
    connector.push(connection);
    let client = test_client(&connector, None);
    client.initialize(cascade.target(), None).expect("login should succeed");
    (client, session)
}

/// Read until `expected.len()` bytes arrived.
fn read_exact(chain: &DataChain, expected: usize) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 2048];
    while received.len() < expected {
        match chain.read_timeout(&mut buf, WAIT).expect("read should succeed") {
            ReadStatus::Data(n) => received.extend_from_slice(&buf[..n]),
            status => panic!("expected data, got {status:?} after {} bytes", received.len()),
        }
    }
    received
}

/// Read until the chain reports an error; returns the data before it.
fn read_until_error(chain: &DataChain) -> (Vec<u8>, MuxError) {
    let mut received = Vec::new();
    let mut buf = [0u8; 2048];
    loop {
        match chain.read_timeout(&mut buf, WAIT) {
            Ok(ReadStatus::Data(n)) => received.extend_from_slice(&buf[..n]),
            Ok(status) => panic!("expected a chain error, got {status:?} after {} bytes", received.len()),
            Err(e) => return (received, e),
        }
    }
}

fn next_sequential_cell(session: &MixSession, with_data: bool) -> (u32, cascade_wire::cell::SequentialCell) {
    let event = session.wait_for(|e| match e {
        MixEvent::SequentialCell { cell, .. } => !with_data || !cell.data.is_empty(),
        _ => false,
    });
    match event {
        Some(MixEvent::SequentialCell { channel_id, cell }) => (channel_id, cell),
        other => panic!("mix saw no fixed-ratio cell: {other:?}"),
    }
}

#[test]
fn test_fixed_ratio_chain_strings_channels_together() {
    let cascade = FakeCascade::new("0.9")
        .expect("cascade setup should succeed")
        .with_chain_protocol(fixed_ratio(3, 30));
    let (client, session) = connect(&cascade);
    assert_eq!(
        client.chain_protocol(),
        Some(ChainProtocol::FixedRatio(FixedRatio {
            downstream_packets: 3,
            channel_timeout: Duration::from_secs(30),
            chain_timeout: Duration::from_secs(10),
        }))
    );

    // Step 1: The first order opens the chain and carries the chain type
    let chain = client.create_channel(5).expect("chain should open");
    chain.write_all(b"first order").expect("write should succeed");
    assert_eq!(read_exact(&chain, 11), b"first order");

    let (first_channel, first) = next_sequential_cell(&session, true);
    assert!(first.has_flag(SEQ_FLAG_NEW_CHAIN));
    assert_eq!(first.chain_id, None);
    assert_eq!(first.data[0], 5, "first byte of a chain is its type");
    assert_eq!(&first.data[1..], b"first order");

    // Step 2: A later order runs on a sequel channel and names the chain
    chain.write_all(b"second order").expect("write should succeed");
    assert_eq!(read_exact(&chain, 12), b"second order");

    let (sequel_channel, sequel) = next_sequential_cell(&session, true);
    assert_ne!(sequel_channel, first_channel);
    assert!(!sequel.has_flag(SEQ_FLAG_NEW_CHAIN));
    assert_eq!(sequel.chain_id, Some(*b"chain-01"));
    assert_eq!(sequel.data, b"second order");

    // Step 3: Closing the chain tells the last mix
    chain.close();
    let closing = session.wait_for(|e| {
        matches!(e, MixEvent::SequentialCell { cell, .. } if cell.has_flag(SEQ_FLAG_STREAM_CLOSED))
    });
    let Some(MixEvent::SequentialCell { cell, .. }) = closing else {
        panic!("mix saw no stream close");
    };
    assert_eq!(cell.chain_id, Some(*b"chain-01"));

    client.shutdown();
}

#[test]
fn test_fixed_ratio_extra_packet_fails_the_chain() {
    let cascade = FakeCascade::new("0.9")
        .expect("cascade setup should succeed")
        .with_chain_protocol(fixed_ratio(3, 30))
        .with_downstream_fault(DownstreamFault::ExtraPacket);
    let (client, _session) = connect(&cascade);

    let chain = client.create_channel(0).expect("chain should open");
    chain.write_all(b"hello").expect("write should succeed");
    let (received, error) = read_until_error(&chain);
    assert_eq!(received, b"hello");
    assert!(error.to_string().contains("more packets"), "unexpected error: {error}");

    drop(chain);
    client.shutdown();
}

#[test]
fn test_fixed_ratio_missing_packet_fails_the_chain() {
    let cascade = FakeCascade::new("0.9")
        .expect("cascade setup should succeed")
        .with_chain_protocol(fixed_ratio(3, 30))
        .with_downstream_fault(DownstreamFault::MissingPacket);
    let (client, _session) = connect(&cascade);

    let chain = client.create_channel(0).expect("chain should open");
    chain.write_all(b"hello").expect("write should succeed");
    let (received, error) = read_until_error(&chain);
    assert_eq!(received, b"hello");
    assert!(error.to_string().contains("packets missing"), "unexpected error: {error}");

    drop(chain);
    client.shutdown();
}

#[test]
fn test_fixed_ratio_channel_timeout_fails_the_chain() {
    let cascade = FakeCascade::new("0.9")
        .expect("cascade setup should succeed")
        .with_chain_protocol(fixed_ratio(3, 1))
        .with_downstream_fault(DownstreamFault::Silent);
    let (client, session) = connect(&cascade);

    let chain = client.create_channel(0).expect("chain should open");
    chain.write_all(b"anyone there").expect("write should succeed");
    next_sequential_cell(&session, true);

    let (received, error) = read_until_error(&chain);
    assert!(received.is_empty());
    assert!(error.to_string().contains("channel timeout"), "unexpected error: {error}");

    drop(chain);
    client.shutdown();
}

#[test]
fn test_blocked_fixed_ratio_write_is_interrupted() {
    let cascade = FakeCascade::new("0.9")
        .expect("cascade setup should succeed")
        .with_chain_protocol(fixed_ratio(3, 2))
        .with_downstream_fault(DownstreamFault::Silent);
    let (client, _session) = connect(&cascade);
    let mux = client.multiplexer().expect("connected client has a multiplexer");
    let protocol = client.chain_protocol().expect("connected client has a chain protocol");

    let token = CancelToken::new();
    let chain = Arc::new(DataChain::open(&mux, protocol, 0, None, Some(&token)).expect("chain should open"));
    chain.write_all(b"unanswered").expect("first order goes out");

    // The next order waits for a downstream packet that never comes.
    let writer = {
        let chain = Arc::clone(&chain);
        thread::spawn(move || chain.write(b"blocked"))
    };
    thread::sleep(Duration::from_millis(300));
    assert!(!writer.is_finished());

    token.cancel();
    assert!(matches!(writer.join().expect("join"), Err(MuxError::Interrupted)));
    assert!(matches!(chain.write(b"again"), Err(MuxError::Interrupted)));

    drop(chain);
    client.shutdown();
}

#[test]
fn test_flow_control_flags_and_acknowledgements() {
    let cascade = FakeCascade::new("0.9")
        .expect("cascade setup should succeed")
        .with_chain_protocol(ChainProtocolInfo {
            version: "0.6".into(),
            upstream_send_me: Some(3),
            downstream_send_me: Some(5),
            ..ChainProtocolInfo::default()
        });
    let (client, session) = connect(&cascade);
    assert_eq!(
        client.chain_protocol(),
        Some(ChainProtocol::FlowControlled(FlowControl {
            upstream_send_me: 3,
            downstream_send_me: 5,
        }))
    );

    // Step 1: Every third upstream data cell is flagged
    let chain = client.create_channel(0).expect("chain should open");
    let mut echoed = 0;
    for index in 0..7 {
        let message = format!("cell {index}");
        assert_eq!(chain.write(message.as_bytes()).expect("write should succeed"), message.len());
        echoed += message.len();
    }
    let cells = session.collect_cells(Duration::from_millis(500));
    assert_eq!(cells.len(), 7);
    let flagged: Vec<usize> = cells
        .iter()
        .enumerate()
        .filter(|(_, (_, cell))| cell.has_flag(FLAG_FLOW_CONTROL))
        .map(|(index, _)| index)
        .collect();
    assert_eq!(flagged, vec![2, 5]);
    let channel_id = cells[0].0;

    // Step 2: A flagged downstream cell is acknowledged with an empty cell
    session
        .send_downstream_cell(
            channel_id,
            &ChainCell {
                flags: FLAG_FLOW_CONTROL,
                chain_type: 0,
                data: b"sendme".to_vec(),
            },
        )
        .expect("mix write should succeed");
    let ack = session.wait_for(|e| matches!(e, MixEvent::Cell { .. }));
    let Some(MixEvent::Cell { channel_id: ack_channel, cell }) = ack else {
        panic!("mix saw no acknowledgement");
    };
    assert_eq!(ack_channel, channel_id);
    assert!(cell.has_flag(FLAG_FLOW_CONTROL));
    assert!(cell.data.is_empty());

    let received = read_exact(&chain, echoed + 6);
    assert!(received.ends_with(b"sendme"));

    // Step 3: Acknowledgements do not count as data cells
    chain.write(b"cell 7").expect("write should succeed");
    chain.write(b"cell 8").expect("write should succeed");
    let cells = session.collect_cells(Duration::from_millis(500));
    assert_eq!(cells.len(), 2);
    assert!(!cells[0].1.has_flag(FLAG_FLOW_CONTROL));
    assert!(cells[1].1.has_flag(FLAG_FLOW_CONTROL));

    drop(chain);
    client.shutdown();
    session.finish().expect("fake mix should finish cleanly");
}

#[test]
fn test_connection_error_reaches_the_reader() {
    let cascade = FakeCascade::new("0.4").expect("cascade setup should succeed");
    let (client, session) = connect(&cascade);
    let events = client.subscribe();

    let chain = client.create_channel(0).expect("chain should open");
    chain.write_all(b"ping").expect("write should succeed");
    let Some(MixEvent::Cell { channel_id, .. }) = session.wait_for(|e| matches!(e, MixEvent::Cell { .. })) else {
        panic!("mix saw no data cell");
    };

    session
        .send_downstream_cell(
            channel_id,
            &ChainCell {
                flags: FLAG_CONNECTION_ERROR,
                chain_type: 0,
                data: b"last words".to_vec(),
            },
        )
        .expect("mix write should succeed");

    let (received, error) = read_until_error(&chain);
    assert_eq!(received, b"pinglast words");
    assert!(matches!(error, MuxError::ConnectionError), "unexpected error: {error}");
    loop {
        match events.recv_timeout(WAIT) {
            Ok(ClientEvent::ChainConnectionError) => break,
            Ok(_) => continue,
            Err(_) => panic!("no chain connection error event within {WAIT:?}"),
        }
    }
    assert!(client.is_connected(), "a destination failure keeps the session");

    drop(chain);
    client.shutdown();
    session.finish().expect("fake mix should finish cleanly");
}
