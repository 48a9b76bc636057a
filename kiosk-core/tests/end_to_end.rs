//! Loopback scenarios driving a server and its clients from one thread.

use kiosk_core::{
    ClientConfig, CommunicationClient, CommunicationServer, MultiEvalConfig, MultiEvalServer,
    PeerIdentity, ServerConfig,
};
use kiosk_ipc::{RemoteTodos, Signal, SignalKind, SignalRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(10);

fn registry() -> Arc<SignalRegistry> {
    Arc::new(SignalRegistry::with_protocol())
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn client_config() -> ClientConfig {
    ClientConfig {
        poll_interval: TICK,
        ..Default::default()
    }
}

/// Alternate ticks until `done` holds or two seconds pass
fn pump<S>(
    server: &mut S,
    clients: &mut [&mut CommunicationClient],
    tick: impl Fn(&mut S),
    done: impl Fn(&S, &[&mut CommunicationClient]) -> bool,
) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        tick(server);
        for client in clients.iter_mut() {
            client.process_signals(TICK);
        }
        if done(server, clients) {
            return true;
        }
    }
    false
}

fn server_tick(server: &mut CommunicationServer) {
    server.process_signals(TICK);
}

fn multi_tick(server: &mut MultiEvalServer) {
    server.process_signals(TICK);
}

#[test]
fn test_handshake_evaluate_and_correlated_reply() {
    let mut server = CommunicationServer::bind(loopback(), ServerConfig::default(), registry()).unwrap();
    let mut client =
        CommunicationClient::connect_with_pid(server.local_addr(), client_config(), registry(), 1234)
            .unwrap();

    assert!(pump(
        &mut server,
        &mut [&mut client],
        server_tick,
        |s, c| s.handshaked_count() == 1 && c[0].is_handshaked(),
    ));
    let info = &server.handler_infos()[0];
    assert_eq!(info.peer_pid, Some(1234));
    assert_eq!(client.handler().peer_pid(), Some(std::process::id()));

    let mut todos: RemoteTodos = RemoteTodos::new();
    todos.append_todo(Signal::text(SignalKind::Evaluate, "proj1"), None);
    assert!(server.send_signal(&Signal::text(SignalKind::Evaluate, "proj1")));

    let deadline = Instant::now() + Duration::from_secs(2);
    let request = loop {
        client.process_signals(TICK);
        if let Some(signal) = client.pop_result() {
            break signal;
        }
        assert!(Instant::now() < deadline, "evaluate never arrived");
    };
    assert_eq!(request, SignalKind::Evaluate);
    assert_eq!(request.payload_str(), "proj1");

    client
        .send_signal(&Signal::new(SignalKind::Success.key(), "2"))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let reply = loop {
        server.process_signals(TICK);
        if let Some(inbound) = server.pop_result() {
            break inbound;
        }
        assert!(Instant::now() < deadline, "reply never arrived");
    };
    assert_eq!(reply.signal, SignalKind::Success);

    let entry = todos.get_todo(&reply.signal).unwrap();
    assert_eq!(entry.signal, SignalKind::Evaluate);
    assert_eq!(entry.signal.payload_str(), "proj1");
    assert!(todos.is_empty());
}

#[test]
fn test_lost_client_is_pruned_once() {
    let mut server = CommunicationServer::bind(loopback(), ServerConfig::default(), registry()).unwrap();
    let mut client =
        CommunicationClient::connect(server.local_addr(), client_config(), registry()).unwrap();
    assert!(pump(
        &mut server,
        &mut [&mut client],
        server_tick,
        |s, c| s.handshaked_count() == 1 && c[0].is_handshaked(),
    ));

    client.close("test done");
    assert!(pump(&mut server, &mut [], server_tick, |s, _| s.connected_count() == 0));

    let lost = server.drain_lost();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].identity.map(|i| i.pid), Some(std::process::id()));
    assert!(server.drain_lost().is_empty());
    assert!(!server.send_signal(&Signal::empty(SignalKind::Exit)));
}

#[test]
fn test_broadcast_reports_partial_delivery() {
    let config = ServerConfig {
        send_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let mut server = CommunicationServer::bind(loopback(), config, registry()).unwrap();
    let mut reader =
        CommunicationClient::connect(server.local_addr(), client_config(), registry()).unwrap();
    let mut stalled =
        CommunicationClient::connect(server.local_addr(), client_config(), registry()).unwrap();
    assert!(pump(
        &mut server,
        &mut [&mut reader, &mut stalled],
        server_tick,
        |s, c| s.handshaked_count() == 2 && c.iter().all(|c| c.is_handshaked()),
    ));

    const BULK: usize = 15 * 1024 * 1024;
    let reading = std::thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            reader.process_signals(TICK);
            if let Some(signal) = reader.pop_result() {
                if signal.payload().len() == BULK {
                    return true;
                }
            }
        }
        false
    });

    // More than the socket buffers of a peer that never reads can hold
    let bulk = Signal::new(SignalKind::Result.key(), vec![0u8; BULK]);
    assert!(!server.send_signal(&bulk));
    assert!(reading.join().unwrap());
    assert_eq!(server.connected_count(), 1);
    drop(stalled);
}

#[test]
fn test_signals_sent_before_close_are_delivered() {
    let mut server = CommunicationServer::bind(loopback(), ServerConfig::default(), registry()).unwrap();
    let mut client =
        CommunicationClient::connect(server.local_addr(), client_config(), registry()).unwrap();
    assert!(pump(
        &mut server,
        &mut [&mut client],
        server_tick,
        |s, c| s.handshaked_count() == 1 && c[0].is_handshaked(),
    ));

    client
        .send_signal(&Signal::text(SignalKind::Result, "{}"))
        .unwrap();
    client.close("finished");

    assert!(pump(&mut server, &mut [], server_tick, |s, _| s.connected_count() == 0));
    let inbound = server.pop_result().unwrap();
    assert_eq!(inbound.signal, SignalKind::Result);
}

#[test]
fn test_alive_is_echoed_by_client() {
    let mut server = CommunicationServer::bind(loopback(), ServerConfig::default(), registry()).unwrap();
    let mut client =
        CommunicationClient::connect(server.local_addr(), client_config(), registry()).unwrap();
    assert!(pump(
        &mut server,
        &mut [&mut client],
        server_tick,
        |s, c| s.handshaked_count() == 1 && c[0].is_handshaked(),
    ));
    let before = server.handler_infos()[0].last_alive;

    std::thread::sleep(Duration::from_millis(5));
    server.broadcast_alive();
    assert!(pump(&mut server, &mut [&mut client], server_tick, |s, _| {
        s.handler_infos()[0].last_alive > before
    }));
    assert!(server.pop_result().is_none());
}

#[test]
fn test_evaluate_goes_to_idle_peer() {
    let mut server = CommunicationServer::bind(loopback(), ServerConfig::default(), registry()).unwrap();
    let addr = server.local_addr();
    let mut busy = CommunicationClient::connect_with_pid(addr, client_config(), registry(), 11).unwrap();
    let mut idle = CommunicationClient::connect_with_pid(addr, client_config(), registry(), 22).unwrap();
    assert!(pump(
        &mut server,
        &mut [&mut busy, &mut idle],
        server_tick,
        |s, _| s.handshaked_count() == 2,
    ));

    idle.send_idle(true).unwrap();
    assert!(pump(&mut server, &mut [], server_tick, |s, _| {
        s.handler_infos().iter().any(|h| h.idle)
    }));

    let target = server.send_evaluate("proj1").unwrap();
    assert_eq!(server.handler(target).unwrap().peer_pid(), Some(22));
    assert!(!server.handler(target).unwrap().is_idle());

    // Nobody idle any more: the most recently added peer is used
    let fallback = server.send_evaluate("proj2").unwrap();
    assert_eq!(fallback, server.handlers().last().unwrap().id());
}

#[test]
fn test_multi_eval_reconnect_keeps_state() {
    let config = MultiEvalConfig {
        alive_interval: None,
        ..Default::default()
    };
    let mut server = MultiEvalServer::bind(loopback(), config, registry()).unwrap();
    let mut client =
        CommunicationClient::connect_with_pid(server.local_addr(), client_config(), registry(), 77)
            .unwrap();
    let identity = PeerIdentity {
        ip: "127.0.0.1".parse().unwrap(),
        pid: 77,
    };

    assert!(pump(&mut server, &mut [&mut client], multi_tick, |s, _| {
        s.record(&identity).is_some()
    }));
    client.send_idle(true).unwrap();
    client
        .send_signal(&Signal::text(SignalKind::Process, "4711"))
        .unwrap();
    assert!(pump(&mut server, &mut [&mut client], multi_tick, |s, _| {
        s.record(&identity)
            .is_some_and(|r| r.idle && r.subprocess_pid == Some(4711))
    }));
    assert!(server.pop_result().is_none());

    client.close("restart");
    assert!(pump(&mut server, &mut [], multi_tick, |s, _| {
        s.record(&identity).is_some_and(|r| r.handler.is_none())
    }));
    assert_eq!(server.drain_lost().len(), 1);

    client.reconnect().unwrap();
    assert!(pump(&mut server, &mut [&mut client], multi_tick, |s, _| {
        s.record(&identity).is_some_and(|r| r.handler.is_some())
    }));
    let record = server.record(&identity).unwrap();
    assert!(record.idle);
    assert_eq!(record.subprocess_pid, Some(4711));
    assert_eq!(server.idle_count(), 1);
}

#[test]
fn test_multi_eval_expired_record_is_pruned() {
    let config = MultiEvalConfig {
        reconnect_grace: Duration::from_millis(20),
        alive_interval: None,
        ..Default::default()
    };
    let mut server = MultiEvalServer::bind(loopback(), config, registry()).unwrap();
    let mut client =
        CommunicationClient::connect_with_pid(server.local_addr(), client_config(), registry(), 78)
            .unwrap();
    let identity = PeerIdentity {
        ip: "127.0.0.1".parse().unwrap(),
        pid: 78,
    };
    assert!(pump(&mut server, &mut [&mut client], multi_tick, |s, _| {
        s.record(&identity).is_some()
    }));

    client.close("gone");
    assert!(pump(&mut server, &mut [], multi_tick, |s, _| {
        s.record(&identity).is_none()
    }));
}

#[test]
fn test_multi_eval_terminate_refuses_reconnect() {
    let config = MultiEvalConfig {
        alive_interval: None,
        ..Default::default()
    };
    let mut server = MultiEvalServer::bind(loopback(), config, registry()).unwrap();
    let mut client =
        CommunicationClient::connect_with_pid(server.local_addr(), client_config(), registry(), 79)
            .unwrap();
    let identity = PeerIdentity {
        ip: "127.0.0.1".parse().unwrap(),
        pid: 79,
    };
    assert!(pump(&mut server, &mut [&mut client], multi_tick, |s, _| {
        s.record(&identity).is_some()
    }));

    assert!(server.terminate(identity));
    assert!(server.is_terminated(&identity));
    assert!(pump(&mut server, &mut [&mut client], multi_tick, |_, c| {
        !c[0].is_connected()
    }));
    assert_eq!(client.pop_result().unwrap(), SignalKind::Exit);

    client.reconnect().unwrap();
    assert!(pump(&mut server, &mut [&mut client], multi_tick, |_, c| {
        !c[0].is_connected()
    }));
    assert!(server.record(&identity).is_none());
}
