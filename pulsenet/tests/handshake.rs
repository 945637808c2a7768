//! End-to-end conformance scenarios over real loopback IPv6 UDP sockets. No mocked transport:
//! every scenario spins up two live `Context`s and lets them exchange actual datagrams.

use std::net::Ipv6Addr;
use std::thread;
use std::time::{Duration, Instant};

use pulsenet::prelude::*;

fn tick_both(a: &Context, b: &Context, rounds: usize) {
    for _ in 0..rounds {
        a.update();
        b.update();
        thread::sleep(Duration::from_millis(5));
    }
}

fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

#[test]
fn loopback_handshake_with_no_auth_connects_both_sides() {
    let server_config = ContextConfig::new(Role::Server, false);
    let server = Context::init(Ipv6Addr::LOCALHOST, 0, server_config).unwrap();

    let client_config = ContextConfig::new(Role::Client, false);
    let client = Context::init(Ipv6Addr::LOCALHOST, 0, client_config).unwrap();

    let server_id = ConnectionId::from_socket(Ipv6Addr::LOCALHOST, server.local_port());
    client.client_initiate_connection(server_id, false);

    let connected = wait_until(Duration::from_secs(6), || {
        server.update();
        client.update();
        client.list_connected().len() == 1 && server.list_connected().len() == 1
    });

    assert!(connected, "handshake did not complete within the conformance deadline");
}

#[test]
fn strict_auth_policy_drops_a_mismatched_handshake() {
    let mut server_config = ContextConfig::new(Role::Server, true);
    server_config.auth_policy = AuthPolicy::Strict;
    let server = Context::init(Ipv6Addr::LOCALHOST, 0, server_config).unwrap();

    let client_config = ContextConfig::new(Role::Client, false);
    let client = Context::init(Ipv6Addr::LOCALHOST, 0, client_config).unwrap();

    let server_id = ConnectionId::from_socket(Ipv6Addr::LOCALHOST, server.local_port());
    client.client_initiate_connection(server_id, false);

    tick_both(&server, &client, 20);

    assert!(server.list_connected().is_empty());
    assert!(client.list_connected().is_empty());

    client.drop_connection(server_id, false);
    client.update();
    assert!(!client.has_connection(server_id));
}

#[test]
fn pinned_peer_key_mismatch_never_advances_past_initiating() {
    let mut server_config = ContextConfig::new(Role::Server, true);
    server_config.auth_policy = AuthPolicy::Fallback;
    let server = Context::init(Ipv6Addr::LOCALHOST, 0, server_config).unwrap();

    let client_config = ContextConfig::new(Role::Client, true);
    let client = Context::init(Ipv6Addr::LOCALHOST, 0, client_config).unwrap();

    let server_id = ConnectionId::from_socket(Ipv6Addr::LOCALHOST, server.local_port());
    let wrong_expected_key = [0xABu8; 32];
    client.client_initiate_connection_pinned(server_id, wrong_expected_key);

    tick_both(&server, &client, 30);

    assert!(
        !client.has_connection(server_id) || client.list_connected().is_empty(),
        "client should never reach Established against an unpinned server key"
    );
}

#[test]
#[ignore = "exercises the real 10s connection timeout; run with `cargo test -- --ignored`"]
fn a_silent_peer_is_timed_out_and_removed() {
    let server_config = ContextConfig::new(Role::Server, false);
    let server = Context::init(Ipv6Addr::LOCALHOST, 0, server_config).unwrap();

    let client_config = ContextConfig::new(Role::Client, false);
    let client = Context::init(Ipv6Addr::LOCALHOST, 0, client_config).unwrap();

    let server_id = ConnectionId::from_socket(Ipv6Addr::LOCALHOST, server.local_port());
    client.client_initiate_connection(server_id, false);

    let connected = wait_until(Duration::from_secs(6), || {
        server.update();
        client.update();
        server.list_connected().len() == 1
    });
    assert!(connected);

    let client_peer = server.list_connected()[0];

    let timed_out = wait_until(Duration::from_secs(12), || {
        server.update();
        !server.has_connection(client_peer)
    });

    assert!(timed_out, "server should drop a peer silent for longer than the connection timeout");
}
