//! End-to-end tests for handshake and dispatch over real transports.
//!
//! Each test wires two orchestrators through a loopback TCP connection (or a
//! UDP server and client) and observes handlers through shared counters.

use duplex_wire::{
    AuthConfig, Channel, ChannelState, DispatchError, EndpointPolicy, Handshake,
    HandshakeOutcome, Message, Orchestrator, OrchestratorEvent, OrchestratorState, Protocol,
    ProtocolBuilder, RejectionOrigin, Role, TcpAcceptor, TcpChannel, UdpChannel, UdpServer,
    WireConfig, WireError,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SyncMsg {
    node: String,
}
impl Message for SyncMsg {
    const TAG: &'static str = "sync";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AckMsg {
    node: String,
}
impl Message for AckMsg {
    const TAG: &'static str = "ack";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct VerackMsg;
impl Message for VerackMsg {
    const TAG: &'static str = "verack";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping {
    seq: u32,
}
impl Message for Ping {
    const TAG: &'static str = "ping";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Pong {
    seq: u32,
}
impl Message for Pong {
    const TAG: &'static str = "pong";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Shout {
    text: String,
}
impl Message for Shout {
    const TAG: &'static str = "shout";
}

/// Has a serializer but no handler anywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Stray;
impl Message for Stray {
    const TAG: &'static str = "stray";
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Counters {
    initiate: AtomicUsize,
    respond: AtomicUsize,
    confirm: AtomicUsize,
    ping: AtomicUsize,
    pong: AtomicUsize,
    shout: AtomicUsize,
    pairs: Mutex<Vec<(u32, u32)>>,
    shouts: Mutex<Vec<String>>,
}

impl Counters {
    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn handlers_invoked(&self) -> usize {
        Self::get(&self.ping) + Self::get(&self.pong) + Self::get(&self.shout)
    }
}

#[derive(Clone, Copy)]
struct Verdicts {
    respond: HandshakeOutcome,
    confirm: HandshakeOutcome,
    finalize: HandshakeOutcome,
}

const ACCEPT_ALL: Verdicts = Verdicts {
    respond: HandshakeOutcome::Accepted,
    confirm: HandshakeOutcome::Accepted,
    finalize: HandshakeOutcome::Accepted,
};

/// Ping/Pong and Shout handlers plus serializers, without a handshake.
fn handlers(counters: &Arc<Counters>) -> ProtocolBuilder {
    let (ping, pong, shout) = (
        Arc::clone(counters),
        Arc::clone(counters),
        Arc::clone(counters),
    );
    Protocol::builder()
        .on_request(move |_orch, request: &Ping| {
            ping.ping.fetch_add(1, Ordering::SeqCst);
            Ok(Pong { seq: request.seq })
        })
        .on_response(move |_orch, request: &Ping, response: &Pong| {
            pong.pong.fetch_add(1, Ordering::SeqCst);
            pong.pairs.lock().unwrap().push((request.seq, response.seq));
            Ok(())
        })
        .on_command(move |_orch, command: &Shout| {
            shout.shout.fetch_add(1, Ordering::SeqCst);
            match command.text.as_str() {
                "fail" => Err("refusing to shout".into()),
                "panic" => panic!("shout handler bug"),
                text => {
                    shout.shouts.lock().unwrap().push(text.to_string());
                    Ok(())
                }
            }
        })
        .json::<Ping>()
        .msgpack::<Pong>()
        .json::<Shout>()
        .json::<Stray>()
}

fn three_way_protocol(counters: &Arc<Counters>, verdicts: Verdicts) -> Arc<Protocol> {
    let (initiate, respond, confirm) = (
        Arc::clone(counters),
        Arc::clone(counters),
        Arc::clone(counters),
    );
    handlers(counters)
        .handshake(
            Handshake::three_way::<SyncMsg, AckMsg, VerackMsg>(Role::Client)
                .initiate(move || {
                    initiate.initiate.fetch_add(1, Ordering::SeqCst);
                    SyncMsg {
                        node: "client".into(),
                    }
                })
                .respond(move |sync| {
                    respond.respond.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(sync.node, "client");
                    (
                        AckMsg {
                            node: "server".into(),
                        },
                        verdicts.respond,
                    )
                })
                .confirm(move |_sync, ack| {
                    confirm.confirm.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(ack.node, "server");
                    (VerackMsg, verdicts.confirm)
                })
                .finalize(move |_ack, _verack| verdicts.finalize),
        )
        .json::<SyncMsg>()
        .json::<AckMsg>()
        .json::<VerackMsg>()
        .build()
        .unwrap()
}

/// Sync/Ack two-way handshake plus the usual handlers. The `confirm`
/// counter tracks the initiator's reply check.
fn two_way_protocol(
    counters: &Arc<Counters>,
    respond: HandshakeOutcome,
    reply: HandshakeOutcome,
) -> Arc<Protocol> {
    let (responded, replied) = (Arc::clone(counters), Arc::clone(counters));
    handlers(counters)
        .handshake(
            Handshake::two_way::<SyncMsg, AckMsg>(Role::Client)
                .initiate(|| SyncMsg {
                    node: "client".into(),
                })
                .respond(move |_sync| {
                    responded.respond.fetch_add(1, Ordering::SeqCst);
                    (
                        AckMsg {
                            node: "server".into(),
                        },
                        respond,
                    )
                })
                .on_reply(move |_sync, _ack| {
                    replied.confirm.fetch_add(1, Ordering::SeqCst);
                    reply
                }),
        )
        .json::<SyncMsg>()
        .json::<AckMsg>()
        .build()
        .unwrap()
}

/// The accepting three-way handshake with no message handlers.
fn handshake_only() -> ProtocolBuilder {
    Protocol::builder()
        .handshake(
            Handshake::three_way::<SyncMsg, AckMsg, VerackMsg>(Role::Client)
                .initiate(|| SyncMsg {
                    node: "client".into(),
                })
                .respond(|_| {
                    (
                        AckMsg {
                            node: "server".into(),
                        },
                        HandshakeOutcome::Accepted,
                    )
                })
                .confirm(|_, _| (VerackMsg, HandshakeOutcome::Accepted)),
        )
        .json::<SyncMsg>()
        .json::<AckMsg>()
        .json::<VerackMsg>()
}

async fn tcp_pair() -> (Arc<TcpChannel>, Arc<TcpChannel>) {
    let config = WireConfig::default();
    let acceptor = TcpAcceptor::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(EndpointPolicy::default()),
        config.clone(),
    )
    .await
    .unwrap();
    let client = TcpChannel::connect(acceptor.local_addr(), &config);
    client.open().await.unwrap();
    let server = acceptor.accept().await;
    (Arc::new(client), Arc::new(server))
}

/// Start orchestrators for both ends concurrently.
async fn start_pair(
    client_channel: Arc<dyn Channel>,
    client_protocol: Arc<Protocol>,
    server_channel: Arc<dyn Channel>,
    server_protocol: Arc<Protocol>,
) -> (
    Arc<Orchestrator>,
    Result<(), WireError>,
    Arc<Orchestrator>,
    Result<(), WireError>,
) {
    let client = Orchestrator::new(client_channel, client_protocol, WireConfig::default());
    let server = Orchestrator::new(server_channel, server_protocol, WireConfig::default());
    let (client_result, server_result) = tokio::join!(client.start(), server.start());
    (client, client_result, server, server_result)
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_three_way_ping_pong_scenario() {
    let client_counters = Arc::new(Counters::default());
    let server_counters = Arc::new(Counters::default());
    let (client_channel, server_channel) = tcp_pair().await;

    let (client, client_result, server, server_result) = start_pair(
        client_channel,
        three_way_protocol(&client_counters, ACCEPT_ALL),
        server_channel,
        three_way_protocol(&server_counters, ACCEPT_ALL),
    )
    .await;
    client_result.unwrap();
    server_result.unwrap();
    assert_eq!(client.state(), OrchestratorState::Running);
    assert_eq!(server.state(), OrchestratorState::Running);

    let correlation = client.send_request(Ping { seq: 41 }).unwrap();
    assert!(correlation > 0);

    wait_for("pong handler", || Counters::get(&client_counters.pong) == 1).await;
    assert_eq!(Counters::get(&server_counters.ping), 1);
    assert_eq!(Counters::get(&server_counters.pong), 0);
    assert_eq!(Counters::get(&client_counters.ping), 0);
    assert_eq!(*client_counters.pairs.lock().unwrap(), vec![(41, 41)]);
    assert_eq!(client.pending_requests(), 0);

    assert_eq!(client.state(), OrchestratorState::Running);
    assert_eq!(server.state(), OrchestratorState::Running);
    assert_eq!(client.channel().state(), ChannelState::Open);
    assert_eq!(server.channel().state(), ChannelState::Open);

    assert_eq!(client.finish().await, OrchestratorState::Finished);
    assert_eq!(server.run_to_end().await.unwrap(), OrchestratorState::Finished);
}

#[tokio::test]
async fn test_each_handshake_callback_fires_once() {
    let client_counters = Arc::new(Counters::default());
    let server_counters = Arc::new(Counters::default());
    let (client_channel, server_channel) = tcp_pair().await;

    let (client, client_result, server, server_result) = start_pair(
        client_channel,
        three_way_protocol(&client_counters, ACCEPT_ALL),
        server_channel,
        three_way_protocol(&server_counters, ACCEPT_ALL),
    )
    .await;
    client_result.unwrap();
    server_result.unwrap();

    // The client initiates and confirms; the server responds.
    assert_eq!(Counters::get(&client_counters.initiate), 1);
    assert_eq!(Counters::get(&client_counters.confirm), 1);
    assert_eq!(Counters::get(&client_counters.respond), 0);
    assert_eq!(Counters::get(&server_counters.respond), 1);
    assert_eq!(Counters::get(&server_counters.initiate), 0);
    assert_eq!(Counters::get(&server_counters.confirm), 0);

    client.finish().await;
    server.finish().await;
}

#[tokio::test]
async fn test_state_events_follow_lifecycle() {
    let counters = Arc::new(Counters::default());
    let (client_channel, server_channel) = tcp_pair().await;
    let client = Orchestrator::new(
        client_channel,
        three_way_protocol(&counters, ACCEPT_ALL),
        WireConfig::default(),
    );
    let server = Orchestrator::new(
        server_channel,
        three_way_protocol(&counters, ACCEPT_ALL),
        WireConfig::default(),
    );
    let mut events = client.subscribe();
    let (a, b) = tokio::join!(client.start(), server.start());
    a.unwrap();
    b.unwrap();
    client.finish().await;

    // The state watch can update before the matching event is published.
    let mut states = Vec::new();
    let collected = tokio::time::timeout(Duration::from_secs(2), async {
        while let Ok(event) = events.recv().await {
            if let OrchestratorEvent::StateChanged { to, .. } = event {
                states.push(to);
                if to.is_terminal() {
                    break;
                }
            }
        }
    })
    .await;
    assert!(collected.is_ok());
    assert_eq!(
        states,
        vec![
            OrchestratorState::Handshaking,
            OrchestratorState::Ready,
            OrchestratorState::Running,
            OrchestratorState::Finishing,
            OrchestratorState::Finished,
        ]
    );
    server.finish().await;
}

#[tokio::test]
async fn test_rejected_response_faults_both_sides() {
    let counters = Arc::new(Counters::default());
    let verdicts = Verdicts {
        respond: HandshakeOutcome::Busy,
        ..ACCEPT_ALL
    };
    let (client_channel, server_channel) = tcp_pair().await;

    let (client, client_result, server, server_result) = start_pair(
        client_channel,
        three_way_protocol(&counters, verdicts),
        server_channel,
        three_way_protocol(&counters, verdicts),
    )
    .await;

    assert!(matches!(
        client_result,
        Err(WireError::HandshakeRejected {
            outcome: HandshakeOutcome::Busy,
            origin: RejectionOrigin::Remote
        })
    ));
    assert!(matches!(
        server_result,
        Err(WireError::HandshakeRejected {
            outcome: HandshakeOutcome::Busy,
            origin: RejectionOrigin::Local
        })
    ));
    for orch in [&client, &server] {
        assert_eq!(orch.state(), OrchestratorState::Faulted);
        assert_eq!(orch.channel().state(), ChannelState::Closed);
        assert!(orch.last_error().is_some());
        assert!(matches!(
            orch.send_request(Ping { seq: 1 }),
            Err(WireError::NotReady)
        ));
    }
    // The initiator never reached its confirm callback.
    assert_eq!(Counters::get(&counters.confirm), 0);
    assert_eq!(counters.handlers_invoked(), 0);
}

#[tokio::test]
async fn test_rejected_confirm_faults_both_sides() {
    let counters = Arc::new(Counters::default());
    let verdicts = Verdicts {
        confirm: HandshakeOutcome::UnsupportedVersion,
        ..ACCEPT_ALL
    };
    let (client_channel, server_channel) = tcp_pair().await;

    let (client, client_result, server, server_result) = start_pair(
        client_channel,
        three_way_protocol(&counters, verdicts),
        server_channel,
        three_way_protocol(&counters, verdicts),
    )
    .await;

    assert!(matches!(
        client_result,
        Err(WireError::HandshakeRejected {
            origin: RejectionOrigin::Local,
            ..
        })
    ));
    assert!(matches!(
        server_result,
        Err(WireError::HandshakeRejected {
            outcome: HandshakeOutcome::UnsupportedVersion,
            origin: RejectionOrigin::Remote
        })
    ));
    assert_eq!(client.state(), OrchestratorState::Faulted);
    assert_eq!(server.state(), OrchestratorState::Faulted);
    assert_eq!(counters.handlers_invoked(), 0);
}

#[tokio::test]
async fn test_two_way_handshake_with_reply_check() {
    let replies = Arc::new(AtomicUsize::new(0));
    let build = |replies: Arc<AtomicUsize>| {
        Protocol::builder()
            .handshake(
                Handshake::two_way::<SyncMsg, AckMsg>(Role::Client)
                    .initiate(|| SyncMsg { node: "c".into() })
                    .respond(|sync| {
                        (
                            AckMsg {
                                node: format!("ack-{}", sync.node),
                            },
                            HandshakeOutcome::Accepted,
                        )
                    })
                    .on_reply(move |_sync, ack| {
                        replies.fetch_add(1, Ordering::SeqCst);
                        if ack.node == "ack-c" {
                            HandshakeOutcome::Accepted
                        } else {
                            HandshakeOutcome::Rejected
                        }
                    }),
            )
            .json::<SyncMsg>()
            .json::<AckMsg>()
            .build()
            .unwrap()
    };
    let (client_channel, server_channel) = tcp_pair().await;
    let (client, client_result, server, server_result) = start_pair(
        client_channel,
        build(Arc::clone(&replies)),
        server_channel,
        build(Arc::clone(&replies)),
    )
    .await;
    client_result.unwrap();
    server_result.unwrap();
    assert_eq!(replies.load(Ordering::SeqCst), 1);
    assert_eq!(client.state(), OrchestratorState::Running);

    client.finish().await;
    assert_eq!(server.run_to_end().await.unwrap(), OrchestratorState::Finished);
}

#[tokio::test]
async fn test_rejected_finalize_faults_both_sides() {
    let counters = Arc::new(Counters::default());
    let verdicts = Verdicts {
        finalize: HandshakeOutcome::Unauthorized,
        ..ACCEPT_ALL
    };
    let (client_channel, server_channel) = tcp_pair().await;

    let (client, client_result, server, server_result) = start_pair(
        client_channel,
        three_way_protocol(&counters, verdicts),
        server_channel,
        three_way_protocol(&counters, verdicts),
    )
    .await;

    assert!(matches!(
        client_result,
        Err(WireError::HandshakeRejected {
            outcome: HandshakeOutcome::Unauthorized,
            origin: RejectionOrigin::Remote
        })
    ));
    assert!(matches!(
        server_result,
        Err(WireError::HandshakeRejected {
            outcome: HandshakeOutcome::Unauthorized,
            origin: RejectionOrigin::Local
        })
    ));
    assert_eq!(client.state(), OrchestratorState::Faulted);
    assert_eq!(server.state(), OrchestratorState::Faulted);
    assert_eq!(counters.handlers_invoked(), 0);
}

#[tokio::test]
async fn test_two_way_respond_rejection_faults_both_sides() {
    let counters = Arc::new(Counters::default());
    let protocol = two_way_protocol(
        &counters,
        HandshakeOutcome::Unauthorized,
        HandshakeOutcome::Accepted,
    );
    let (client_channel, server_channel) = tcp_pair().await;

    let (client, client_result, server, server_result) = start_pair(
        client_channel,
        Arc::clone(&protocol),
        server_channel,
        protocol,
    )
    .await;

    assert!(matches!(
        client_result,
        Err(WireError::HandshakeRejected {
            outcome: HandshakeOutcome::Unauthorized,
            origin: RejectionOrigin::Remote
        })
    ));
    assert!(matches!(
        server_result,
        Err(WireError::HandshakeRejected {
            outcome: HandshakeOutcome::Unauthorized,
            origin: RejectionOrigin::Local
        })
    ));
    assert_eq!(client.state(), OrchestratorState::Faulted);
    assert_eq!(server.state(), OrchestratorState::Faulted);
    // A rejected answer is never judged by the initiator.
    assert_eq!(Counters::get(&counters.respond), 1);
    assert_eq!(Counters::get(&counters.confirm), 0);
    assert_eq!(counters.handlers_invoked(), 0);
}

#[tokio::test]
async fn test_rejected_reply_check_faults_both_sides() {
    let counters = Arc::new(Counters::default());
    let protocol = two_way_protocol(&counters, HandshakeOutcome::Accepted, HandshakeOutcome::Rejected);
    let (client_channel, server_channel) = tcp_pair().await;

    let (client, client_result, server, server_result) = start_pair(
        client_channel,
        Arc::clone(&protocol),
        server_channel,
        protocol,
    )
    .await;

    assert!(matches!(
        client_result,
        Err(WireError::HandshakeRejected {
            outcome: HandshakeOutcome::Rejected,
            origin: RejectionOrigin::Local
        })
    ));
    assert!(matches!(
        server_result,
        Err(WireError::HandshakeRejected {
            outcome: HandshakeOutcome::Rejected,
            origin: RejectionOrigin::Remote
        })
    ));
    for orch in [&client, &server] {
        assert_eq!(orch.state(), OrchestratorState::Faulted);
        assert_eq!(orch.channel().state(), ChannelState::Closed);
    }
    assert_eq!(Counters::get(&counters.confirm), 1);
    assert_eq!(counters.handlers_invoked(), 0);
}

#[tokio::test]
async fn test_authenticated_handshake() {
    let build = |secret: &str| {
        Protocol::builder()
            .authenticated_handshake(AuthConfig::new(secret))
            .build()
            .unwrap()
    };

    let (client_channel, server_channel) = tcp_pair().await;
    let (client, ok_client, server, ok_server) = start_pair(
        client_channel,
        build("shared"),
        server_channel,
        build("shared"),
    )
    .await;
    ok_client.unwrap();
    ok_server.unwrap();
    client.finish().await;
    server.finish().await;

    let (client_channel, server_channel) = tcp_pair().await;
    let (client, bad_client, server, bad_server) = start_pair(
        client_channel,
        build("one"),
        server_channel,
        build("two"),
    )
    .await;
    assert!(matches!(
        bad_client,
        Err(WireError::HandshakeRejected {
            outcome: HandshakeOutcome::Unauthorized,
            origin: RejectionOrigin::Remote
        })
    ));
    assert!(matches!(
        bad_server,
        Err(WireError::HandshakeRejected {
            outcome: HandshakeOutcome::Unauthorized,
            origin: RejectionOrigin::Local
        })
    ));
    assert_eq!(client.state(), OrchestratorState::Faulted);
    assert_eq!(server.state(), OrchestratorState::Faulted);
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

async fn running_pair() -> (Arc<Orchestrator>, Arc<Counters>, Arc<Orchestrator>, Arc<Counters>) {
    let client_counters = Arc::new(Counters::default());
    let server_counters = Arc::new(Counters::default());
    let (client_channel, server_channel) = tcp_pair().await;
    let (client, client_result, server, server_result) = start_pair(
        client_channel,
        three_way_protocol(&client_counters, ACCEPT_ALL),
        server_channel,
        three_way_protocol(&server_counters, ACCEPT_ALL),
    )
    .await;
    client_result.unwrap();
    server_result.unwrap();
    (client, client_counters, server, server_counters)
}

#[tokio::test]
async fn test_unhandled_message_does_not_stop_dispatch() {
    let (client, _client_counters, server, server_counters) = running_pair().await;
    let mut events = server.subscribe();

    client.send_command(Stray).unwrap();
    client
        .send_command(Shout {
            text: "after".into(),
        })
        .unwrap();

    wait_for("shout after stray", || {
        Counters::get(&server_counters.shout) == 1
    })
    .await;
    assert_eq!(*server_counters.shouts.lock().unwrap(), vec!["after"]);

    let errors: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            OrchestratorEvent::MessageError { error, .. } => Some(error),
            _ => None,
        })
        .collect();
    assert_eq!(
        errors,
        vec![DispatchError::Unhandled {
            tag: "stray".into(),
            dispatch: duplex_wire::Dispatch::Command,
        }]
    );
    assert_eq!(server.state(), OrchestratorState::Running);

    client.finish().await;
    server.finish().await;
}

#[tokio::test]
async fn test_failing_and_panicking_handlers_are_isolated() {
    let (client, client_counters, server, server_counters) = running_pair().await;
    let mut events = server.subscribe();

    client.send_command(Shout { text: "fail".into() }).unwrap();
    client.send_command(Shout { text: "panic".into() }).unwrap();
    client.send_request(Ping { seq: 7 }).unwrap();

    wait_for("pong after faulty handlers", || {
        Counters::get(&client_counters.pong) == 1
    })
    .await;
    assert_eq!(Counters::get(&server_counters.shout), 2);

    let errors: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            OrchestratorEvent::MessageError { error, .. } => Some(error),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 2);
    assert!(matches!(&errors[0], DispatchError::Handler { reason, .. } if reason == "refusing to shout"));
    assert!(matches!(&errors[1], DispatchError::Panicked { tag } if tag == "shout"));
    assert_eq!(server.state(), OrchestratorState::Running);

    client.finish().await;
    server.finish().await;
}

#[tokio::test]
async fn test_concurrent_requests_are_correlated() {
    let (client, client_counters, server, server_counters) = running_pair().await;

    let mut ids = Vec::new();
    for seq in 0..50 {
        ids.push(client.send_request(Ping { seq }).unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 50);

    wait_for("all pongs", || Counters::get(&client_counters.pong) == 50).await;
    assert_eq!(Counters::get(&server_counters.ping), 50);
    let pairs = client_counters.pairs.lock().unwrap().clone();
    assert!(pairs.iter().all(|(request, response)| request == response));
    assert_eq!(client.pending_requests(), 0);

    client.finish().await;
    server.finish().await;
}

#[tokio::test]
async fn test_both_peers_send_requests() {
    let (client, client_counters, server, server_counters) = running_pair().await;

    client.send_request(Ping { seq: 1 }).unwrap();
    server.send_request(Ping { seq: 2 }).unwrap();

    wait_for("pongs on both sides", || {
        Counters::get(&client_counters.pong) == 1 && Counters::get(&server_counters.pong) == 1
    })
    .await;
    assert_eq!(*client_counters.pairs.lock().unwrap(), vec![(1, 1)]);
    assert_eq!(*server_counters.pairs.lock().unwrap(), vec![(2, 2)]);

    client.finish().await;
    server.finish().await;
}

#[tokio::test]
async fn test_unanswered_requests_are_bounded() {
    let counters = Arc::new(Counters::default());
    let (client_channel, server_channel) = tcp_pair().await;
    let client = Orchestrator::new(
        client_channel,
        three_way_protocol(&counters, ACCEPT_ALL),
        WireConfig {
            max_pending_requests: 8,
            ..WireConfig::default()
        },
    );
    // The server has no Ping handler, so no request is ever answered.
    let server = Orchestrator::new(
        server_channel,
        handshake_only().json::<Ping>().build().unwrap(),
        WireConfig::default(),
    );
    let (a, b) = tokio::join!(client.start(), server.start());
    a.unwrap();
    b.unwrap();
    let mut events = client.subscribe();

    let ids: Vec<u64> = (0..20)
        .map(|seq| client.send_request(Ping { seq }).unwrap())
        .collect();
    assert_eq!(client.pending_requests(), 8);

    let evicted: Vec<u64> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            OrchestratorEvent::MessageError {
                error: DispatchError::RequestEvicted { correlation, tag },
                ..
            } => {
                assert_eq!(tag, "ping");
                Some(correlation)
            }
            _ => None,
        })
        .collect();
    assert_eq!(evicted, ids[..12].to_vec());
    assert_eq!(client.state(), OrchestratorState::Running);

    client.finish().await;
    server.finish().await;
}

#[tokio::test]
async fn test_sent_and_received_events() {
    let (client, _client_counters, server, _server_counters) = running_pair().await;
    let mut client_events = client.subscribe();
    let mut server_events = server.subscribe();

    client.send_command(Shout { text: "hey".into() }).unwrap();
    wait_for("server received shout", || {
        matches!(
            server_events.try_recv(),
            Ok(OrchestratorEvent::ReceivedMessage(header)) if header.tag == "shout"
        )
    })
    .await;
    wait_for("client sent shout", || {
        matches!(
            client_events.try_recv(),
            Ok(OrchestratorEvent::SentMessage(header)) if header.tag == "shout"
        )
    })
    .await;

    client.finish().await;
    server.finish().await;
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_handler_can_request_finish() {
    let counters = Arc::new(Counters::default());
    let build = |counters: &Arc<Counters>, stop_on_shout: bool| {
        let protocol = three_way_protocol(counters, ACCEPT_ALL);
        if !stop_on_shout {
            return protocol;
        }
        handshake_only()
            .on_command(|orch: &Orchestrator, _: &Shout| {
                orch.request_finish();
                Ok(())
            })
            .json::<Shout>()
            .build()
            .unwrap()
    };

    let (client_channel, server_channel) = tcp_pair().await;
    let (client, a, server, b) = start_pair(
        client_channel,
        build(&counters, false),
        server_channel,
        build(&counters, true),
    )
    .await;
    a.unwrap();
    b.unwrap();

    client.send_command(Shout { text: "bye".into() }).unwrap();
    let ended = tokio::time::timeout(Duration::from_secs(2), server.run_to_end()).await;
    assert_eq!(ended.unwrap().unwrap(), OrchestratorState::Finished);
    // Server closing the TCP stream ends the client too.
    let ended = tokio::time::timeout(Duration::from_secs(2), client.run_to_end()).await;
    assert_eq!(ended.unwrap().unwrap(), OrchestratorState::Finished);
}

#[tokio::test]
async fn test_finish_flushes_queued_messages() {
    let (client, _client_counters, server, server_counters) = running_pair().await;
    for i in 0..20 {
        client.send_command(Shout { text: format!("s{i}") }).unwrap();
    }
    assert_eq!(client.finish().await, OrchestratorState::Finished);
    assert_eq!(server.run_to_end().await.unwrap(), OrchestratorState::Finished);
    assert_eq!(Counters::get(&server_counters.shout), 20);
    assert!(matches!(
        client.send_command(Shout { text: "late".into() }),
        Err(WireError::NotReady)
    ));
}

#[tokio::test]
async fn test_start_twice_is_invalid() {
    let (client, _c, server, _s) = running_pair().await;
    assert!(matches!(
        client.start().await,
        Err(WireError::InvalidState { operation: "start", .. })
    ));
    client.finish().await;
    server.finish().await;
}

// ---------------------------------------------------------------------------
// UDP
// ---------------------------------------------------------------------------

/// Start a UDP client against a fresh UDP server and an orchestrator for the
/// logical channel its first datagram creates.
async fn udp_start(
    client_protocol: Arc<Protocol>,
    server_protocol: Arc<Protocol>,
) -> (
    Arc<Orchestrator>,
    Result<(), WireError>,
    Arc<Orchestrator>,
    Result<(), WireError>,
    UdpServer,
) {
    let config = WireConfig::default();
    let server = UdpServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(EndpointPolicy::default()),
        config.clone(),
    )
    .await
    .unwrap();
    let client_channel = Arc::new(UdpChannel::new(
        "127.0.0.1:0".parse().unwrap(),
        Some(server.local_addr()),
        Role::Client,
        &config,
    ));
    let client = Orchestrator::new(client_channel, client_protocol, config.clone());

    let server_side = async {
        let channel = server.accept().await.unwrap();
        let orch = Orchestrator::new(channel, server_protocol, config.clone());
        let result = orch.start().await;
        (orch, result)
    };
    let (client_result, (server_orch, server_result)) = tokio::join!(client.start(), server_side);
    (client, client_result, server_orch, server_result, server)
}

#[tokio::test]
async fn test_ping_pong_over_udp_server() {
    let client_counters = Arc::new(Counters::default());
    let server_counters = Arc::new(Counters::default());
    let (client, client_result, server_orch, server_result, server) = udp_start(
        three_way_protocol(&client_counters, ACCEPT_ALL),
        three_way_protocol(&server_counters, ACCEPT_ALL),
    )
    .await;
    client_result.unwrap();
    server_result.unwrap();

    client.send_request(Ping { seq: 3 }).unwrap();
    wait_for("udp pong", || Counters::get(&client_counters.pong) == 1).await;
    assert_eq!(Counters::get(&server_counters.ping), 1);
    assert_eq!(server.channel_count(), 1);

    // UDP cannot observe peer closure.
    assert!(matches!(client.run_to_end().await, Err(WireError::Unsupported(_))));
    assert!(matches!(server_orch.run_to_end().await, Err(WireError::Unsupported(_))));

    assert_eq!(client.finish().await, OrchestratorState::Finished);
    assert_eq!(server_orch.finish().await, OrchestratorState::Finished);
    assert_eq!(server.reevaluate(), 1);
    server.shutdown().await;
}

#[tokio::test]
async fn test_respond_rejection_over_udp_faults_both_sides() {
    let counters = Arc::new(Counters::default());
    let verdicts = Verdicts {
        respond: HandshakeOutcome::Busy,
        ..ACCEPT_ALL
    };
    let (client, client_result, server_orch, server_result, server) = udp_start(
        three_way_protocol(&counters, verdicts),
        three_way_protocol(&counters, verdicts),
    )
    .await;

    assert!(matches!(
        client_result,
        Err(WireError::HandshakeRejected {
            outcome: HandshakeOutcome::Busy,
            origin: RejectionOrigin::Remote
        })
    ));
    assert!(matches!(
        server_result,
        Err(WireError::HandshakeRejected {
            outcome: HandshakeOutcome::Busy,
            origin: RejectionOrigin::Local
        })
    ));
    assert_eq!(client.state(), OrchestratorState::Faulted);
    assert_eq!(server_orch.state(), OrchestratorState::Faulted);
    assert_eq!(counters.handlers_invoked(), 0);
    // The faulted logical channel is closed and forgotten on re-evaluation.
    assert_eq!(server.reevaluate(), 1);
    server.shutdown().await;
}

#[tokio::test]
async fn test_reply_check_rejection_over_udp_faults_both_sides() {
    let counters = Arc::new(Counters::default());
    let protocol = two_way_protocol(&counters, HandshakeOutcome::Accepted, HandshakeOutcome::Rejected);
    let (client, client_result, server_orch, server_result, server) =
        udp_start(Arc::clone(&protocol), protocol).await;

    assert!(matches!(
        client_result,
        Err(WireError::HandshakeRejected {
            origin: RejectionOrigin::Local,
            ..
        })
    ));
    assert!(matches!(
        server_result,
        Err(WireError::HandshakeRejected {
            outcome: HandshakeOutcome::Rejected,
            origin: RejectionOrigin::Remote
        })
    ));
    assert_eq!(client.state(), OrchestratorState::Faulted);
    assert_eq!(server_orch.state(), OrchestratorState::Faulted);
    assert!(matches!(
        server_orch.send_request(Ping { seq: 1 }),
        Err(WireError::NotReady)
    ));
    assert_eq!(counters.handlers_invoked(), 0);
    server.shutdown().await;
}
