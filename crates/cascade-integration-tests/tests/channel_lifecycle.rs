//! Integration test: data channels over a live multiplexer.
//!
//! Exercises the channel lifecycle against a loopback cascade:
//! 1. Split a long write into cells sized by the first-packet key overhead
//! 2. Close a chain and see late packets for it discarded
//! 3. Discard packets for channel ids that were never opened
//! 4. Lose the connection, observe the event and reconnect
//!
//! Packet sizes follow the wire constants: a 992-byte payload, a 16-byte
//! hop key in the first packet of a channel and a 3-byte cell header.

use std::time::Duration;

use cascade_client::{ClientError, ClientEvent};
use cascade_crypto::sym::KEY_SIZE;
use cascade_integration_tests::{test_client, FakeCascade, MixEvent, PresetConnector, WAIT};
use cascade_mux::MuxEvent;
use cascade_wire::cell::ChainCell;
use cascade_wire::packet::PAYLOAD_SIZE;
use crossbeam_channel::Receiver;

/// Wait for `wanted`, skipping other events.
fn wait_for_event<T: PartialEq + std::fmt::Debug>(events: &Receiver<T>, wanted: T) {
    loop {
        match events.recv_timeout(WAIT) {
            Ok(event) if event == wanted => return,
            Ok(_) => continue,
            Err(_) => panic!("{wanted:?} not seen within {WAIT:?}"),
        }
    }
}

#[test]
fn test_long_write_is_split_into_cells() {
    let cascade = FakeCascade::new("0.4").expect("cascade setup should succeed");
    let connector = PresetConnector::new();
    let (connection, session) = cascade.serve().expect("loopback should succeed");
    connector.push(connection);
    let client = test_client(&connector, None);
    client.initialize(cascade.target(), None).expect("login should succeed");

    let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
    let chain = client.create_channel(7).expect("chain should open");
    chain.write_all(&data).expect("write should succeed");

    // The first cell shares its packet with the hop key.
    let first = ChainCell::capacity(PAYLOAD_SIZE - KEY_SIZE);
    let rest = ChainCell::capacity(PAYLOAD_SIZE);
    let expected = 1 + (data.len() - first).div_ceil(rest);

    let cells = session.collect_cells(Duration::from_millis(500));
    assert_eq!(cells.len(), expected, "5000 bytes need {expected} cells");
    let channel_id = cells[0].0;
    assert!(cells.iter().all(|(id, _)| *id == channel_id), "one channel carries the chain");
    assert_eq!(cells[0].1.chain_type, 7);
    assert!(cells[1..].iter().all(|(_, cell)| cell.chain_type == 0));
    assert_eq!(cells[0].1.data.len(), first);

    let received: Vec<u8> = cells.into_iter().flat_map(|(_, cell)| cell.data).collect();
    assert_eq!(received, data);

    drop(chain);
    client.shutdown();
    session.finish().expect("fake mix should finish cleanly");
}

#[test]
fn test_packets_for_closed_channel_are_discarded() {
    let cascade = FakeCascade::new("0.4").expect("cascade setup should succeed");
    let connector = PresetConnector::new();
    let (connection, session) = cascade.serve().expect("loopback should succeed");
    connector.push(connection);
    let client = test_client(&connector, None);
    client.initialize(cascade.target(), None).expect("login should succeed");
    let mux = client.multiplexer().expect("connected client has a multiplexer");

    // Step 1: Open a chain and learn its channel id from the mix
    let chain = client.create_channel(0).expect("chain should open");
    chain.write_all(b"ping").expect("write should succeed");
    let Some(MixEvent::Cell { channel_id, .. }) = session.wait_for(|e| matches!(e, MixEvent::Cell { .. })) else {
        panic!("mix saw no data cell");
    };
    assert!(mux.table().get_channel(channel_id).is_some());

    // Step 2: Close it; the CLOSE packet reaches the mix
    chain.close();
    assert_eq!(
        session.wait_for(|e| matches!(e, MixEvent::ChannelClosed(_))),
        Some(MixEvent::ChannelClosed(channel_id))
    );
    assert!(mux.table().get_channel(channel_id).is_none());

    // Step 3: A late packet on the closed channel is dropped
    let events = mux.subscribe();
    session
        .send_downstream(channel_id, 0, b"too late")
        .expect("mix write should succeed");
    wait_for_event(&events, MuxEvent::DataPacketDiscarded);

    // Step 4: So is a packet for an id that was never opened
    session
        .send_downstream(0x7F00_0001, 0, b"nobody")
        .expect("mix write should succeed");
    wait_for_event(&events, MuxEvent::DataPacketDiscarded);

    assert!(matches!(chain.write(b"after close"), Err(cascade_mux::MuxError::ChannelClosed)));
    assert!(client.is_connected(), "discarding packets keeps the session");

    client.shutdown();
    session.finish().expect("fake mix should finish cleanly");
}

#[test]
fn test_connection_loss_and_reconnect() {
    let cascade = FakeCascade::new("0.9").expect("cascade setup should succeed");
    let connector = PresetConnector::new();
    let (connection, first) = cascade.serve().expect("loopback should succeed");
    connector.push(connection);
    let client = test_client(&connector, None);
    let events = client.subscribe();
    client.initialize(cascade.target(), None).expect("login should succeed");
    let chain = client.create_channel(0).expect("chain should open");

    // Step 1: The mix drops the connection
    first.disconnect().expect("disconnect should succeed");
    wait_for_event(&events, ClientEvent::ConnectionLost);
    assert!(!client.is_connected());
    assert!(matches!(client.create_channel(0), Err(ClientError::NotConnected)));

    // The open chain sees the end of its stream.
    let mut buf = [0u8; 16];
    assert!(!matches!(
        chain.read_timeout(&mut buf, WAIT),
        Ok(cascade_mux::ReadStatus::Data(_)) | Ok(cascade_mux::ReadStatus::Retry)
    ));
    drop(chain);

    // Step 2: Reconnect to the same target over a fresh connection
    let (connection, second) = cascade.serve().expect("loopback should succeed");
    connector.push(connection);
    client.reconnect().expect("reconnect should succeed");
    assert!(client.is_connected());
    assert_eq!(connector.attempts(), 2);
    wait_for_event(
        &events,
        ClientEvent::ConnectionEstablished {
            cascade_id: cascade.descriptor().id.clone(),
        },
    );

    // Step 3: Shutdown reports a disconnect, not a loss
    client.shutdown();
    wait_for_event(&events, ClientEvent::Disconnected);
    assert!(events.try_iter().all(|e| e != ClientEvent::ConnectionLost));
    second.finish().expect("fake mix should finish cleanly");
}

#[test]
fn test_dropped_chains_release_their_channels() {
    let cascade = FakeCascade::new("0.4").expect("cascade setup should succeed");
    let connector = PresetConnector::new();
    let (connection, session) = cascade.serve().expect("loopback should succeed");
    connector.push(connection);
    let client = test_client(&connector, None);
    client.initialize(cascade.target(), None).expect("login should succeed");
    let mux = client.multiplexer().expect("connected client has a multiplexer");

    let chains: Vec<_> = (0..3)
        .map(|_| client.create_channel(0).expect("chain should open"))
        .collect();
    assert_eq!(mux.table().open_data_channels(), 3);
    drop(chains);
    assert_eq!(mux.table().open_data_channels(), 0);

    client.shutdown();
    session.finish().expect("fake mix should finish cleanly");
}
