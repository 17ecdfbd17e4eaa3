#![cfg(unix)]

mod common;

use std::time::Duration;

use common::*;
use ipcloop_channel::{Channel, ChannelEvent, ConnectionState, Mode};

#[test]
fn second_disconnect_raises_no_further_event() {
    let event_loop = start_loop();
    let path = unique_sock_path("disc-twice");

    let server = Channel::new(&event_loop, &path, Mode::Server).expect("server channel");
    server.connect();
    assert!(wait_until(|| server.state() == ConnectionState::Connecting));
    let client = Channel::new(&event_loop, &path, Mode::Client).expect("client channel");
    let events = record_events(&client);
    client.connect();
    assert!(wait_until(|| client.is_connected()));

    client.disconnect();
    assert!(wait_until(|| client.state() == ConnectionState::Disconnected));
    client.disconnect();
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(count_of(&events, &ChannelEvent::DisconnectedFromServer), 1);

    event_loop.shutdown();
    cleanup(&path);
}

#[test]
fn connect_while_connecting_or_connected_is_a_no_op() {
    let event_loop = start_loop();
    let path = unique_sock_path("connect-noop");

    let server = Channel::new(&event_loop, &path, Mode::Server).expect("server channel");
    let server_events = record_events(&server);
    server.connect();
    assert!(wait_until(|| server.state() == ConnectionState::Connecting));
    server.connect();

    let client = Channel::new(&event_loop, &path, Mode::Client).expect("client channel");
    let client_events = record_events(&client);
    client.connect();
    assert!(wait_until(|| client.is_connected() && server.is_connected()));

    client.connect();
    server.connect();
    std::thread::sleep(Duration::from_millis(100));

    assert!(client.is_connected());
    assert!(server.is_connected());
    assert_eq!(count_of(&client_events, &ChannelEvent::ConnectedToServer), 1);
    assert_eq!(count_of(&server_events, &ChannelEvent::ConnectedToClient), 1);

    event_loop.shutdown();
    cleanup(&path);
}

#[test]
fn disconnect_right_after_connect_is_not_lost() {
    let event_loop = start_loop();
    let path = unique_sock_path("connect-then-disc");

    let server = Channel::new(&event_loop, &path, Mode::Server).expect("server channel");
    server.connect();
    assert!(wait_until(|| server.state() == ConnectionState::Connecting));

    let client = Channel::new(&event_loop, &path, Mode::Client).expect("client channel");
    client.connect();
    client.disconnect();

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(wait_until(|| server.state() == ConnectionState::Connecting));

    event_loop.shutdown();
    cleanup(&path);
}

#[test]
fn disconnect_empties_queues_and_accumulator() {
    let event_loop = start_loop();
    let path = unique_sock_path("disc-empty");

    let server = Channel::new(&event_loop, &path, Mode::Server).expect("server channel");
    server.connect();
    assert!(wait_until(|| server.state() == ConnectionState::Connecting));
    let client = Channel::new(&event_loop, &path, Mode::Client).expect("client channel");
    client.connect();
    assert!(wait_until(|| server.is_connected() && client.is_connected()));

    client.send(&text("unprocessed"));
    assert!(wait_until(|| server.pending_inbound() == 1));

    server.disconnect();
    assert!(wait_until(|| server.state() == ConnectionState::Disconnected));
    assert_eq!(server.pending_inbound(), 0);
    assert_eq!(server.pending_outbound(), 0);
    assert_eq!(server.buffered_inbound_bytes(), 0);

    event_loop.shutdown();
    cleanup(&path);
}

#[test]
fn client_connect_to_missing_server_stays_disconnected() {
    let event_loop = start_loop();
    let path = unique_sock_path("missing");

    let client = Channel::new(&event_loop, &path, Mode::Client).expect("client channel");
    let events = record_events(&client);
    client.connect();
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(events.lock().unwrap().is_empty());

    event_loop.shutdown();
    cleanup(&path);
}

#[test]
fn client_can_reconnect_after_disconnect() {
    let event_loop = start_loop();
    let path = unique_sock_path("reconnect");

    let server = Channel::new(&event_loop, &path, Mode::Server).expect("server channel");
    server.connect();
    assert!(wait_until(|| server.state() == ConnectionState::Connecting));

    let client = Channel::new(&event_loop, &path, Mode::Client).expect("client channel");
    let events = record_events(&client);
    client.connect();
    assert!(wait_until(|| client.is_connected()));
    client.disconnect();
    assert!(wait_until(|| client.state() == ConnectionState::Disconnected));
    assert!(wait_until(|| server.state() == ConnectionState::Connecting));

    client.connect();
    assert!(wait_until(|| client.is_connected()));
    assert_eq!(count_of(&events, &ChannelEvent::ConnectedToServer), 2);

    event_loop.shutdown();
    cleanup(&path);
}

#[test]
fn dropping_a_channel_unregisters_it_and_frees_the_address() {
    let event_loop = start_loop();
    let path = unique_sock_path("drop");

    let server = Channel::new(&event_loop, &path, Mode::Server).expect("server channel");
    server.connect();
    assert!(wait_until(|| path.exists()));
    assert_eq!(event_loop.channel_count(), 1);

    drop(server);
    assert_eq!(event_loop.channel_count(), 0);
    assert!(wait_until(|| !path.exists()));

    event_loop.shutdown();
    cleanup(&path);
}

#[test]
fn shutdown_disconnects_registered_channels() {
    let event_loop = start_loop();
    let path = unique_sock_path("shutdown");

    let server = Channel::new(&event_loop, &path, Mode::Server).expect("server channel");
    server.connect();
    assert!(wait_until(|| server.state() == ConnectionState::Connecting));

    event_loop.shutdown();
    assert!(!event_loop.is_running());
    assert_eq!(server.state(), ConnectionState::Disconnected);

    cleanup(&path);
}
