// Integration smoke test for the fabric server.
//
// Starts a coordinator on real sockets, connects mock clients speaking the
// raw framed protocol (no `FabricClient`), and walks the whole lifecycle:
// handshake, reset barrier, a lockstep time advance, one forwarded frame,
// goodbye and shutdown.
//
// The local-domain case puts its socket files in a temp dir and checks they
// are gone afterwards.

use std::io::Cursor;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fabric_protocol::framing::{decode, encode};
use fabric_protocol::{
    ClientMessage, EthernetFrame, LogicalTime, MacAddress, PROTOCOL_VERSION, PortIndex,
    ResetEpoch, ServerMessage, SessionIndex,
};
use fabric_server::conduit::connect;
use fabric_server::{
    Conduit, Coordinator, Domain, Endpoint, FabricConfig, RunOutcome, ScriptedProcessor,
};

fn send(conduit: &dyn Conduit, msg: &ClientMessage) {
    conduit.send(&encode(msg).unwrap()).unwrap();
}

fn recv(conduit: &dyn Conduit) -> ServerMessage {
    decode(&conduit.receive().unwrap()).unwrap()
}

fn mac(last: u8) -> MacAddress {
    MacAddress([0x00, 0x10, 0xaa, 0x00, 0x00, last])
}

/// Connect and say hello. Returns the conduit and the assigned session.
fn hello(endpoint: &Endpoint, name: &str) -> (Arc<dyn Conduit>, SessionIndex) {
    let conduit = connect(endpoint).unwrap();
    conduit.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    send(
        conduit.as_ref(),
        &ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            name: name.into(),
        },
    );
    match recv(conduit.as_ref()) {
        ServerMessage::Welcome { session, .. } => (conduit, session),
        other => panic!("expected Welcome, got {other:?}"),
    }
}

/// Two clients: reset, advance both to 50, then node 0 sends node 1 a frame.
fn run_lifecycle(config: FabricConfig) -> RunOutcome {
    let mut coordinator = Coordinator::new(config).unwrap();
    let endpoints = coordinator.listen().unwrap();
    assert_eq!(endpoints.len(), 2);

    let server = thread::spawn(move || {
        let mut processor = ScriptedProcessor::new(Cursor::new("wait-clients\nexit\n"));
        coordinator.run(&mut processor)
    });

    let (a, session_a) = hello(&endpoints[0], "node-a");
    let (b, session_b) = hello(&endpoints[1], "node-b");
    assert_eq!(session_a, SessionIndex(0));
    assert_eq!(session_b, SessionIndex(1));

    for conduit in [&a, &b] {
        send(conduit.as_ref(), &ClientMessage::ResetReady);
    }
    for conduit in [&a, &b] {
        match recv(conduit.as_ref()) {
            ServerMessage::ResetReleased { epoch, .. } => assert_eq!(epoch, ResetEpoch(1)),
            other => panic!("expected ResetReleased, got {other:?}"),
        }
    }

    for conduit in [&a, &b] {
        send(
            conduit.as_ref(),
            &ClientMessage::AdvanceTime {
                target: LogicalTime(50),
            },
        );
    }
    for conduit in [&a, &b] {
        assert_eq!(
            recv(conduit.as_ref()),
            ServerMessage::TimeGranted {
                time: LogicalTime(50)
            }
        );
    }

    let frame = EthernetFrame::new(mac(2), mac(1), b"ping".to_vec());
    send(a.as_ref(), &ClientMessage::Frame(frame.clone()));
    assert_eq!(
        recv(b.as_ref()),
        ServerMessage::Frame {
            ingress: PortIndex(0),
            frame
        }
    );

    for conduit in [&a, &b] {
        send(conduit.as_ref(), &ClientMessage::Goodbye);
        conduit.close();
    }
    server.join().unwrap().unwrap()
}

#[test]
fn networked_lifecycle() {
    let outcome = run_lifecycle(FabricConfig {
        domain: Domain::Networked,
        base_port: 0,
        session_count: 2,
        accept_timeout: Some(Duration::from_secs(10)),
        ..FabricConfig::default()
    });
    assert!(outcome.exit_requested);
    assert_eq!(outcome.epoch, ResetEpoch(1));
    assert_eq!(outcome.authorized, LogicalTime(50));
}

#[cfg(unix)]
#[test]
fn local_lifecycle_cleans_up_socket_files() {
    let dir = tempfile::tempdir().unwrap();
    let outcome = run_lifecycle(FabricConfig {
        domain: Domain::Local,
        socket_dir: dir.path().to_path_buf(),
        session_count: 2,
        accept_timeout: Some(Duration::from_secs(10)),
        ..FabricConfig::default()
    });
    assert!(outcome.exit_requested);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn wrong_protocol_version_is_rejected() {
    let mut coordinator = Coordinator::new(FabricConfig {
        domain: Domain::Networked,
        base_port: 0,
        session_count: 1,
        accept_timeout: Some(Duration::from_secs(10)),
        ..FabricConfig::default()
    })
    .unwrap();
    let endpoint = coordinator.listen().unwrap().remove(0);
    let server = thread::spawn(move || {
        let result = coordinator.run(&mut ScriptedProcessor::new(Cursor::new("exit\n")));
        (result, coordinator.failed_in())
    });

    let conduit = connect(&endpoint).unwrap();
    conduit.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    send(
        conduit.as_ref(),
        &ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION + 1,
            name: "from-the-future".into(),
        },
    );
    assert!(matches!(
        recv(conduit.as_ref()),
        ServerMessage::Rejected { .. }
    ));

    let (result, phase) = server.join().unwrap();
    assert!(result.is_err());
    assert_eq!(phase, Some(fabric_server::Phase::Accept));
}
