//! Wire-format tests for the HOP/STOP messages and the varint framing.
//!
//! The enum values and framing are fixed by the protocol, so these tests
//! assert exact numbers and exact bytes, not just round-trips.

use prost::Message;
use tether_proto::{
    write_message, HopMessage, HopMessageType, Limit, MessageReader, Peer, ProtoError,
    Reservation, Status, StopMessage, StopMessageType, MAX_MESSAGE_SIZE,
};

// ── Enum values ───────────────────────────────────────────────────────────────

#[test]
fn hop_type_values_are_fixed() {
    assert_eq!(HopMessageType::Reserve as i32, 1);
    assert_eq!(HopMessageType::Connect as i32, 2);
    assert_eq!(HopMessageType::Status as i32, 3);
}

#[test]
fn stop_type_values_are_fixed() {
    assert_eq!(StopMessageType::Connect as i32, 1);
    assert_eq!(StopMessageType::Status as i32, 2);
}

#[test]
fn status_values_are_fixed() {
    assert_eq!(Status::Ok as i32, 100);
    assert_eq!(Status::ReservationRefused as i32, 200);
    assert_eq!(Status::ResourceLimitExceeded as i32, 201);
    assert_eq!(Status::PermissionDenied as i32, 202);
    assert_eq!(Status::ConnectionFailed as i32, 203);
    assert_eq!(Status::NoReservation as i32, 204);
    assert_eq!(Status::MalformedMessage as i32, 400);
    assert_eq!(Status::UnexpectedMessage as i32, 401);
}

// ── Message encoding ──────────────────────────────────────────────────────────

#[test]
fn reserve_message_is_a_bare_type_field() {
    let msg = HopMessage::reserve();
    let bytes = msg.encode_to_vec();
    // field 1, varint wire type, value 1
    assert_eq!(bytes, vec![0x08, 0x01]);
}

#[test]
fn status_message_roundtrip() {
    let msg = HopMessage::with_status(Status::ResourceLimitExceeded);
    let decoded = HopMessage::decode(msg.encode_to_vec().as_slice()).unwrap();
    assert_eq!(decoded.r#type, HopMessageType::Status as i32);
    assert_eq!(decoded.status_code(), Some(Status::ResourceLimitExceeded));
}

#[test]
fn connect_message_carries_peer_and_session_id() {
    let dest = Peer {
        id: vec![0x12, 0x20, 0xaa],
        addrs: vec![],
    };
    let msg = HopMessage::connect(dest.clone(), "sess-1".into());
    let decoded = HopMessage::decode(msg.encode_to_vec().as_slice()).unwrap();
    assert_eq!(decoded.r#type, HopMessageType::Connect as i32);
    assert_eq!(decoded.peer, Some(dest));
    assert_eq!(decoded.diagnostic_session_id.as_deref(), Some("sess-1"));
}

#[test]
fn reservation_fields_roundtrip() {
    let msg = HopMessage {
        r#type: HopMessageType::Status as i32,
        status: Some(Status::Ok as i32),
        reservation: Some(Reservation {
            expire: 1_700_000_000,
            addrs: vec![vec![0x04, 0x7f, 0x00, 0x00, 0x01]],
            voucher: Some(vec![0xde, 0xad]),
        }),
        limit: Some(Limit {
            duration: Some(120),
            data: Some(1 << 17),
        }),
        ..Default::default()
    };
    let decoded = HopMessage::decode(msg.encode_to_vec().as_slice()).unwrap();
    let rsvp = decoded.reservation.unwrap();
    assert_eq!(rsvp.expire, 1_700_000_000);
    assert_eq!(rsvp.voucher, Some(vec![0xde, 0xad]));
    let limit = decoded.limit.unwrap();
    assert_eq!(limit.duration, Some(120));
    assert_eq!(limit.data, Some(1 << 17));
}

#[test]
fn unknown_status_value_yields_none() {
    let msg = HopMessage {
        r#type: HopMessageType::Status as i32,
        status: Some(999),
        ..Default::default()
    };
    let decoded = HopMessage::decode(msg.encode_to_vec().as_slice()).unwrap();
    assert_eq!(decoded.status_code(), None);
}

// ── Framing ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn framed_roundtrip() {
    let (mut client, server) = tokio::io::duplex(1024);
    let msg = StopMessage::connect(Peer {
        id: vec![1, 2, 3],
        addrs: vec![vec![4, 5]],
    });
    write_message(&mut client, &msg).await.unwrap();

    let mut reader = MessageReader::new(server);
    let decoded: StopMessage = reader.read_message().await.unwrap();
    assert_eq!(decoded, msg);
    assert!(reader.leftover().is_empty());
}

#[tokio::test]
async fn bytes_after_frame_are_preserved() {
    let (mut client, server) = tokio::io::duplex(1024);
    let msg = HopMessage::with_status(Status::Ok);
    write_message(&mut client, &msg).await.unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut client, &[0xaa, 0xbb, 0xcc])
        .await
        .unwrap();
    // Close so the reader's chunked read observes everything in one pass.
    drop(client);

    let mut reader = MessageReader::new(server);
    let decoded: HopMessage = reader.read_message().await.unwrap();
    assert_eq!(decoded.status_code(), Some(Status::Ok));

    let (_io, leftover) = reader.into_parts();
    assert_eq!(&leftover[..], &[0xaa, 0xbb, 0xcc]);
}

#[tokio::test]
async fn oversized_incoming_frame_is_rejected() {
    let (mut client, server) = tokio::io::duplex(16 * 1024);
    // Hand-craft a frame claiming MAX_MESSAGE_SIZE + 1 payload bytes.
    let len = (MAX_MESSAGE_SIZE + 1) as u64;
    let mut frame = Vec::new();
    let mut v = len;
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        frame.push(byte);
        if v == 0 {
            break;
        }
    }
    tokio::io::AsyncWriteExt::write_all(&mut client, &frame)
        .await
        .unwrap();

    let mut reader = MessageReader::new(server);
    let err = reader.read_message::<HopMessage>().await.unwrap_err();
    assert!(matches!(err, ProtoError::MessageTooLarge(_)), "{err:?}");
}

#[tokio::test]
async fn oversized_outgoing_message_is_rejected() {
    let (mut client, _server) = tokio::io::duplex(64);
    let msg = HopMessage {
        r#type: HopMessageType::Status as i32,
        reservation: Some(Reservation {
            expire: 0,
            addrs: vec![vec![0u8; MAX_MESSAGE_SIZE]],
            voucher: None,
        }),
        ..Default::default()
    };
    let err = write_message(&mut client, &msg).await.unwrap_err();
    assert!(matches!(err, ProtoError::MessageTooLarge(_)), "{err:?}");
}

#[tokio::test]
async fn truncated_stream_is_an_error() {
    let (mut client, server) = tokio::io::duplex(64);
    // Length prefix promising 20 bytes, then only 3 bytes and EOF.
    tokio::io::AsyncWriteExt::write_all(&mut client, &[20, 1, 2, 3])
        .await
        .unwrap();
    drop(client);

    let mut reader = MessageReader::new(server);
    let err = reader.read_message::<HopMessage>().await.unwrap_err();
    assert!(matches!(err, ProtoError::Io(_)), "{err:?}");
}
