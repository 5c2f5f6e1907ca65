//! RESERVE exchange tests against a scripted relay on in-process streams.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use libp2p::{Multiaddr, PeerId};
use tether_proto::{
    write_message, HopMessage, HopMessageType, Limit, MessageReader,
    Reservation as WireReservation, Status, HOP_PROTOCOL,
};
use tether_relay::host::{AddrInfo, Host};
use tether_relay::mock::{new_peer_id, MockHost};
use tether_relay::reservation::reserve;
use tether_relay::RelayError;

fn ma(s: &str) -> Multiaddr {
    s.parse().unwrap()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Connect the host to a fresh relay peer and script its HOP responses:
/// every RESERVE on every stream is answered with `response`.
async fn connected_relay(host: &MockHost, response: HopMessage) -> PeerId {
    let relay = new_peer_id();
    host.add_reachable_peer(&AddrInfo::new(relay, vec![ma("/ip4/9.9.9.9/tcp/4001")]));
    let mut streams = host.serve_protocol(relay, HOP_PROTOCOL);
    tokio::spawn(async move {
        while let Some(stream) = streams.recv().await {
            let mut reader = MessageReader::new(stream);
            let _req: HopMessage = match reader.read_message().await {
                Ok(msg) => msg,
                Err(_) => continue,
            };
            let (mut stream, _) = reader.into_parts();
            let _ = write_message(&mut stream, &response).await;
        }
    });
    host.connect(&AddrInfo::new(relay, vec![])).await.unwrap();
    relay
}

fn granted(expire: u64, addrs: &[&Multiaddr]) -> HopMessage {
    HopMessage {
        r#type: HopMessageType::Status as i32,
        status: Some(Status::Ok as i32),
        reservation: Some(WireReservation {
            expire,
            addrs: addrs.iter().map(|a| a.to_vec()).collect(),
            voucher: None,
        }),
        ..Default::default()
    }
}

// ── Happy path ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn reserve_happy_path() {
    let host = MockHost::new();
    let relay_addr = ma("/ip4/10.0.0.1/tcp/4001");
    let expire = unix_now() + 3600;
    let relay = connected_relay(&host, granted(expire, &[&relay_addr])).await;

    let rsvp = reserve(&host, relay).await.unwrap();
    assert_eq!(rsvp.expire, UNIX_EPOCH + Duration::from_secs(expire));
    assert_eq!(rsvp.addrs, vec![relay_addr]);
    assert_eq!(rsvp.voucher, None);
    assert_eq!(rsvp.limit_duration, None);
    assert_eq!(rsvp.limit_data, None);
}

#[tokio::test]
async fn reserve_carries_voucher_and_limits() {
    let host = MockHost::new();
    let mut response = granted(unix_now() + 600, &[&ma("/ip4/9.9.9.9/tcp/4001")]);
    response
        .reservation
        .as_mut()
        .unwrap()
        .voucher = Some(vec![1, 2, 3, 4]);
    response.limit = Some(Limit {
        duration: Some(120),
        data: Some(1 << 17),
    });
    let relay = connected_relay(&host, response).await;

    let rsvp = reserve(&host, relay).await.unwrap();
    assert_eq!(rsvp.voucher, Some(vec![1, 2, 3, 4]));
    assert_eq!(rsvp.limit_duration, Some(Duration::from_secs(120)));
    assert_eq!(rsvp.limit_data, Some(1 << 17));
}

#[tokio::test]
async fn unparseable_addr_is_dropped_not_fatal() {
    let host = MockHost::new();
    let good = ma("/ip4/9.9.9.9/tcp/4001");
    let mut response = granted(unix_now() + 600, &[&good]);
    response
        .reservation
        .as_mut()
        .unwrap()
        .addrs
        .insert(0, vec![0xff, 0xff, 0xff]);
    let relay = connected_relay(&host, response).await;

    let rsvp = reserve(&host, relay).await.unwrap();
    assert_eq!(rsvp.addrs, vec![good], "bad entry skipped, good one kept");
}

// ── Failures ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn relay_refusal_is_surfaced_verbatim() {
    let host = MockHost::new();
    let relay = connected_relay(&host, HopMessage::with_status(Status::ReservationRefused)).await;

    let err = reserve(&host, relay).await.unwrap_err();
    assert!(
        matches!(
            err,
            RelayError::Rejected {
                status: Status::ReservationRefused,
                ..
            }
        ),
        "{err:?}"
    );
}

#[tokio::test]
async fn resource_limit_is_surfaced_verbatim() {
    let host = MockHost::new();
    let relay = connected_relay(&host, HopMessage::with_status(Status::ResourceLimitExceeded)).await;

    let err = reserve(&host, relay).await.unwrap_err();
    assert!(
        matches!(
            err,
            RelayError::Rejected {
                status: Status::ResourceLimitExceeded,
                ..
            }
        ),
        "{err:?}"
    );
}

#[tokio::test]
async fn non_status_reply_is_malformed() {
    let host = MockHost::new();
    let relay = connected_relay(&host, HopMessage::reserve()).await;

    let err = reserve(&host, relay).await.unwrap_err();
    assert!(matches!(err, RelayError::MalformedMessage(_)), "{err:?}");
}

#[tokio::test]
async fn status_ok_without_reservation_is_malformed() {
    let host = MockHost::new();
    let relay = connected_relay(&host, HopMessage::with_status(Status::Ok)).await;

    let err = reserve(&host, relay).await.unwrap_err();
    assert!(matches!(err, RelayError::MalformedMessage(_)), "{err:?}");
}

#[tokio::test]
async fn expiry_in_the_past_is_malformed() {
    let host = MockHost::new();
    let response = granted(unix_now() - 10, &[&ma("/ip4/9.9.9.9/tcp/4001")]);
    let relay = connected_relay(&host, response).await;

    let err = reserve(&host, relay).await.unwrap_err();
    assert!(matches!(err, RelayError::MalformedMessage(_)), "{err:?}");
}

#[tokio::test]
async fn status_without_code_is_malformed() {
    let host = MockHost::new();
    let response = HopMessage {
        r#type: HopMessageType::Status as i32,
        ..Default::default()
    };
    let relay = connected_relay(&host, response).await;

    let err = reserve(&host, relay).await.unwrap_err();
    assert!(matches!(err, RelayError::MalformedMessage(_)), "{err:?}");
}

#[tokio::test]
async fn reserve_without_connection_fails() {
    let host = MockHost::new();
    let stranger = new_peer_id();

    let err = reserve(&host, stranger).await.unwrap_err();
    assert!(matches!(err, RelayError::ConnectionFailed(_)), "{err:?}");
}
