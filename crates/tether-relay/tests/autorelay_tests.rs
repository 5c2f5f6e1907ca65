//! Auto-relay supervisor: reachability state machine and address
//! publication.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use libp2p::Multiaddr;
use tether_proto::{
    write_message, HopMessage, HopMessageType, MessageReader, Reservation as WireReservation,
    Status, HOP_PROTOCOL,
};
use tether_relay::host::{AddrInfo, CandidateSource, Host};
use tether_relay::mock::MockHost;
use tether_relay::{
    AutoRelay, AutoRelayAddrsUpdated, AutoRelayConfig, Connectedness, EventBus,
    LocalReachabilityChanged, PeerConnectednessChanged, Reachability,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};

fn ma(s: &str) -> Multiaddr {
    s.parse().unwrap()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

struct ListSource {
    peers: Vec<AddrInfo>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl CandidateSource for ListSource {
    async fn candidates(&self, n: usize) -> mpsc::Receiver<AddrInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.peers.len().max(1));
        for info in self.peers.iter().take(n) {
            let _ = tx.try_send(info.clone());
        }
        rx
    }
}

/// Full fixture: host, bus, a granting relay, and a started supervisor.
struct Fixture {
    host: MockHost,
    bus: EventBus,
    auto: Arc<AutoRelay>,
    relay: AddrInfo,
    source_calls: Arc<AtomicUsize>,
    reserve_calls: Arc<AtomicUsize>,
    addr_events: broadcast::Receiver<AutoRelayAddrsUpdated>,
}

fn fixture() -> Fixture {
    let host = MockHost::new();
    let bus = EventBus::new();

    let relay = AddrInfo::new(
        tether_relay::mock::new_peer_id(),
        vec![ma("/ip4/9.9.9.9/tcp/4001")],
    );
    host.add_reachable_peer(&relay);
    host.set_protocols(relay.peer_id, &[HOP_PROTOCOL]);

    let mut streams = host.serve_protocol(relay.peer_id, HOP_PROTOCOL);
    let reserve_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reserve_calls);
    tokio::spawn(async move {
        while let Some(stream) = streams.recv().await {
            let mut reader = MessageReader::new(stream);
            let Ok(msg) = reader.read_message::<HopMessage>().await else {
                continue;
            };
            if msg.r#type != HopMessageType::Reserve as i32 {
                continue;
            }
            counter.fetch_add(1, Ordering::SeqCst);
            let response = HopMessage {
                r#type: HopMessageType::Status as i32,
                status: Some(Status::Ok as i32),
                reservation: Some(WireReservation {
                    expire: unix_now() + 3600,
                    addrs: vec![ma("/ip4/10.0.0.1/tcp/4001").to_vec()],
                    voucher: None,
                }),
                ..Default::default()
            };
            let (mut stream, _) = reader.into_parts();
            let _ = write_message(&mut stream, &response).await;
        }
    });

    let source_calls = Arc::new(AtomicUsize::new(0));
    let source = Arc::new(ListSource {
        peers: vec![relay.clone()],
        calls: Arc::clone(&source_calls),
    });
    let mut config = AutoRelayConfig::with_peer_source(source);
    config.min_interval = Duration::from_millis(50);
    config.boot_delay = Duration::ZERO;
    config.desired_relays = 1;
    config.refresh_interval = Duration::from_millis(100);
    config.rng_seed = Some(7);

    let auto = AutoRelay::new(Arc::new(host.clone()), bus.clone(), config).unwrap();
    let addr_events = bus.subscribe_relay_addrs();
    auto.start();

    Fixture {
        host,
        bus,
        auto,
        relay,
        source_calls,
        reserve_calls,
        addr_events,
    }
}

/// Receive address events until one satisfies `cond` (or 5 s pass).
async fn next_event_matching(
    rx: &mut broadcast::Receiver<AutoRelayAddrsUpdated>,
    what: &str,
    mut cond: impl FnMut(&AutoRelayAddrsUpdated) -> bool,
) -> AutoRelayAddrsUpdated {
    let deadline = Duration::from_secs(5);
    loop {
        let event = timeout(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
            .expect("bus closed");
        if cond(&event) {
            return event;
        }
    }
}

fn expect_no_event(rx: &mut broadcast::Receiver<AutoRelayAddrsUpdated>) {
    match rx.try_recv() {
        Err(broadcast::error::TryRecvError::Empty) => {}
        other => panic!("expected no address event, got {other:?}"),
    }
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn publishes_circuit_addrs_after_acquisition() {
    let mut fx = fixture();

    let expected = ma(&format!(
        "/ip4/10.0.0.1/tcp/4001/p2p/{}/p2p-circuit/p2p/{}",
        fx.relay.peer_id,
        fx.host.local_peer_id()
    ));
    let event = next_event_matching(&mut fx.addr_events, "the circuit address", |e| {
        e.addrs.contains(&expected)
    })
    .await;
    assert_eq!(event.addrs, vec![expected]);
    assert!(fx.auto.is_finder_active());

    fx.auto.close();
}

#[tokio::test]
async fn going_public_publishes_listen_addrs_and_stops_the_finder() {
    let mut fx = fixture();
    let listen = vec![ma("/ip4/8.8.8.8/tcp/7000"), ma("/ip4/192.168.1.2/tcp/7000")];
    fx.host.set_listen_addrs(listen.clone());

    // Wait until the relay is acquired so the stop is observable.
    let circuit = format!("/p2p/{}/p2p-circuit", fx.relay.peer_id);
    next_event_matching(&mut fx.addr_events, "a circuit address", |e| {
        e.addrs.iter().any(|a| a.to_string().contains(&circuit))
    })
    .await;

    fx.bus.emit_reachability(LocalReachabilityChanged {
        reachability: Reachability::Public,
    });

    let event = next_event_matching(&mut fx.addr_events, "the listen addrs", |e| {
        e.addrs == listen
    })
    .await;
    assert_eq!(event.addrs, listen, "public mode advertises listen addrs only");

    // The finder is stopped: no further peer-source pulls or reservations.
    sleep(Duration::from_millis(100)).await;
    assert!(!fx.auto.is_finder_active());
    let source_calls = fx.source_calls.load(Ordering::SeqCst);
    let reserve_calls = fx.reserve_calls.load(Ordering::SeqCst);
    sleep(Duration::from_millis(300)).await;
    assert_eq!(fx.source_calls.load(Ordering::SeqCst), source_calls);
    assert_eq!(fx.reserve_calls.load(Ordering::SeqCst), reserve_calls);

    fx.auto.close();
}

#[tokio::test]
async fn duplicate_reachability_events_emit_nothing() {
    let mut fx = fixture();

    fx.bus.emit_reachability(LocalReachabilityChanged {
        reachability: Reachability::Private,
    });
    next_event_matching(&mut fx.addr_events, "any emission", |_| true).await;

    // Drain whatever the acquisition emitted, then go quiet.
    sleep(Duration::from_millis(300)).await;
    while fx.addr_events.try_recv().is_ok() {}

    fx.bus.emit_reachability(LocalReachabilityChanged {
        reachability: Reachability::Private,
    });
    sleep(Duration::from_millis(200)).await;
    expect_no_event(&mut fx.addr_events);

    fx.auto.close();
}

#[tokio::test]
async fn relay_disconnect_republishes_without_its_circuits() {
    let mut fx = fixture();
    let circuit = format!("/p2p/{}/p2p-circuit", fx.relay.peer_id);
    next_event_matching(&mut fx.addr_events, "a circuit address", |e| {
        e.addrs.iter().any(|a| a.to_string().contains(&circuit))
    })
    .await;

    fx.host.disconnect(&fx.relay.peer_id);
    fx.bus.emit_connectedness(PeerConnectednessChanged {
        peer: fx.relay.peer_id,
        connectedness: Connectedness::NotConnected,
    });

    next_event_matching(&mut fx.addr_events, "the cleaned address set", |e| {
        !e.addrs.iter().any(|a| a.to_string().contains(&circuit))
    })
    .await;

    fx.auto.close();
}

#[tokio::test]
async fn private_after_public_restarts_the_finder() {
    let mut fx = fixture();
    let listen = vec![ma("/ip4/8.8.8.8/tcp/7000")];
    fx.host.set_listen_addrs(listen.clone());

    let circuit = format!("/p2p/{}/p2p-circuit", fx.relay.peer_id);
    next_event_matching(&mut fx.addr_events, "a circuit address", |e| {
        e.addrs.iter().any(|a| a.to_string().contains(&circuit))
    })
    .await;

    fx.bus.emit_reachability(LocalReachabilityChanged {
        reachability: Reachability::Public,
    });
    next_event_matching(&mut fx.addr_events, "the public emission", |e| {
        e.addrs == listen
    })
    .await;
    assert!(!fx.auto.is_finder_active());

    // Reservations survive the stop, so going private again republishes the
    // circuit addresses right away.
    fx.bus.emit_reachability(LocalReachabilityChanged {
        reachability: Reachability::Private,
    });
    next_event_matching(&mut fx.addr_events, "the circuit addresses again", |e| {
        e.addrs.iter().any(|a| a.to_string().contains(&circuit))
    })
    .await;
    assert!(fx.auto.is_finder_active());

    fx.auto.close();
}

#[tokio::test]
async fn close_silences_the_supervisor() {
    let mut fx = fixture();
    next_event_matching(&mut fx.addr_events, "the initial emission", |_| true).await;

    fx.auto.close();
    assert!(!fx.auto.is_finder_active());

    sleep(Duration::from_millis(100)).await;
    while fx.addr_events.try_recv().is_ok() {}
    fx.bus.emit_reachability(LocalReachabilityChanged {
        reachability: Reachability::Public,
    });
    sleep(Duration::from_millis(200)).await;
    expect_no_event(&mut fx.addr_events);
}

#[tokio::test]
async fn start_is_idempotent() {
    let fx = fixture();
    fx.auto.start();
    fx.auto.start();
    assert!(fx.auto.is_finder_active());
    fx.auto.close();
    assert!(!fx.auto.is_finder_active());
}
