//! One-shot RESERVE exchange on a HOP stream.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use libp2p::{Multiaddr, PeerId};
use tether_proto::{
    write_message, HopMessage, HopMessageType, MessageReader, Status, HOP_PROTOCOL,
};
use tokio::time::timeout;

use crate::error::RelayError;
use crate::host::Host;

/// Hard deadline on the whole exchange. On expiry the stream is dropped
/// (reset) and the call fails with `ConnectionFailed`.
const RESERVE_EXCHANGE_DEADLINE: Duration = Duration::from_secs(60);

/// A granted slot on a relay.
///
/// Created by [`reserve`]; replaced wholesale on refresh; discarded when the
/// refresh fails or the relay disconnects.
#[derive(Debug, Clone)]
pub struct Reservation {
    /// Absolute expiry of the slot.
    pub expire: SystemTime,
    /// The relay's own addresses as reported in the grant, used to build the
    /// circuit addresses this peer advertises.
    pub addrs: Vec<Multiaddr>,
    /// Opaque signed blob attesting the relay's commitment. Carried, not
    /// verified.
    pub voucher: Option<Vec<u8>>,
    /// Maximum duration of a relayed circuit, if the relay imposes one.
    pub limit_duration: Option<Duration>,
    /// Maximum bytes relayed per circuit direction, if limited.
    pub limit_data: Option<u64>,
}

/// Perform exactly one RESERVE exchange with `relay` over a fresh HOP stream.
///
/// Every failure path drops the stream, which resets it.
pub async fn reserve(host: &dyn Host, relay: PeerId) -> Result<Reservation, RelayError> {
    match timeout(RESERVE_EXCHANGE_DEADLINE, reserve_inner(host, relay)).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::ConnectionFailed(format!(
            "reservation exchange with {relay} timed out"
        ))),
    }
}

async fn reserve_inner(host: &dyn Host, relay: PeerId) -> Result<Reservation, RelayError> {
    let mut stream = host.open_stream(relay, HOP_PROTOCOL).await?;
    write_message(&mut stream, &HopMessage::reserve()).await?;

    let mut reader = MessageReader::new(stream);
    let msg: HopMessage = reader.read_message().await?;

    if msg.r#type != HopMessageType::Status as i32 {
        return Err(RelayError::MalformedMessage(format!(
            "expected STATUS from {relay}, got message type {}",
            msg.r#type
        )));
    }
    match msg.status_code() {
        Some(Status::Ok) => {}
        Some(status) => return Err(RelayError::from_status(status)),
        None => {
            return Err(RelayError::MalformedMessage(
                "STATUS message without a valid status code".into(),
            ))
        }
    }

    let rsvp = msg.reservation.ok_or_else(|| {
        RelayError::MalformedMessage("STATUS OK without a reservation".into())
    })?;

    let expire = UNIX_EPOCH + Duration::from_secs(rsvp.expire);
    if expire <= SystemTime::now() {
        return Err(RelayError::MalformedMessage(format!(
            "reservation expiry {} is in the past",
            rsvp.expire
        )));
    }

    let mut addrs = Vec::with_capacity(rsvp.addrs.len());
    for raw in rsvp.addrs {
        match Multiaddr::try_from(raw) {
            Ok(addr) => addrs.push(addr),
            Err(e) => tracing::warn!("Dropping unparseable relay address from {relay}: {e}"),
        }
    }

    let limit = msg.limit;
    Ok(Reservation {
        expire,
        addrs,
        voucher: rsvp.voucher,
        limit_duration: limit
            .and_then(|l| l.duration)
            .map(|secs| Duration::from_secs(secs.into())),
        limit_data: limit.and_then(|l| l.data),
    })
}
