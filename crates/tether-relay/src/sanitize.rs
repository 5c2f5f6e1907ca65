//! Relay address cleaning and circuit-address grammar.
//!
//! A NAT-rebinding relay can end up advertising dozens of addresses that
//! differ only in port ("addr-explosion"). Advertising circuit addresses
//! through all of them would blow up this peer's own address set, so the
//! relay's addresses are de-exploded first. Pure functions throughout; no
//! I/O, no clock.

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

use crate::error::RelayError;
use crate::host::AddrInfo;

/// Ports conventionally used by libp2p nodes; kept when de-exploding.
const WELL_KNOWN_PORTS: [u16; 2] = [4001, 4002];

// ── Classification ────────────────────────────────────────────────────────────

/// Whether the address contains the circuit marker component.
pub fn is_circuit_addr(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| p == Protocol::P2pCircuit)
}

/// Private or loopback address: RFC1918/ULA ranges, loopback, link-local.
pub fn is_private_addr(addr: &Multiaddr) -> bool {
    match addr.iter().next() {
        Some(Protocol::Ip4(ip)) => {
            ip.is_private() || ip.is_loopback() || ip.is_link_local()
        }
        Some(Protocol::Ip6(ip)) => {
            ip.is_loopback()
                || (ip.segments()[0] & 0xfe00) == 0xfc00 // unique-local fc00::/7
                || (ip.segments()[0] & 0xffc0) == 0xfe80 // link-local fe80::/10
        }
        _ => false,
    }
}

/// Publicly routable: a global IP, or a DNS name (resolution decides later).
pub fn is_public_addr(addr: &Multiaddr) -> bool {
    match addr.iter().next() {
        Some(Protocol::Ip4(_)) | Some(Protocol::Ip6(_)) => !is_private_addr(addr),
        Some(Protocol::Dns(_))
        | Some(Protocol::Dns4(_))
        | Some(Protocol::Dns6(_))
        | Some(Protocol::Dnsaddr(_)) => true,
        _ => false,
    }
}

/// Transport port of the address, if it carries one.
fn port_of(addr: &Multiaddr) -> Option<u16> {
    addr.iter().find_map(|p| match p {
        Protocol::Tcp(port) | Protocol::Udp(port) => Some(port),
        _ => None,
    })
}

/// Grouping key: the component sequence with transport ports blanked, so all
/// `…/tcp/<port>` variants of one host/transport collapse onto one key.
fn addr_key(addr: &Multiaddr) -> String {
    let mut key = String::new();
    for p in addr.iter() {
        match p {
            Protocol::Tcp(_) => key.push_str("/tcp"),
            Protocol::Udp(_) => key.push_str("/udp"),
            other => key.push_str(&other.to_string()),
        }
    }
    key
}

// ── De-explosion ──────────────────────────────────────────────────────────────

/// Clean a relay's advertised address set for use as circuit-address bases.
///
/// Circuit addresses are dropped (no relays-of-relays), unroutable
/// addresses too. When no public key is advertised under several ports the
/// remainder passes through unchanged. Otherwise the public set is
/// de-exploded (see [`clean_exploded_set`]) while the private addresses are
/// kept as-is; they matter to peers on the same LAN as the relay and they
/// carry the NAT-port correlation that makes the cleaning stable when
/// applied twice.
pub fn clean_relay_addrs(addrs: &[Multiaddr]) -> Vec<Multiaddr> {
    let mut public = Vec::new();
    let mut private = Vec::new();
    for addr in addrs {
        if is_circuit_addr(addr) {
            continue;
        }
        if is_public_addr(addr) {
            public.push(addr.clone());
        } else if is_private_addr(addr) {
            private.push(addr.clone());
        }
    }

    let kept_public = if has_explosion(&public) {
        clean_exploded_set(&public, &private)
    } else {
        public
    };

    // Preserve the input order across both classes.
    addrs
        .iter()
        .filter(|&addr| kept_public.contains(addr) || private.contains(addr))
        .cloned()
        .collect()
}

/// Whether any key in the set is advertised under more than one port.
fn has_explosion(addrs: &[Multiaddr]) -> bool {
    let keys: Vec<String> = addrs.iter().map(addr_key).collect();
    keys.iter().enumerate().any(|(i, key)| {
        addrs
            .iter()
            .zip(&keys)
            .skip(i + 1)
            .any(|(other, other_key)| other_key == key && port_of(other) != port_of(&addrs[i]))
    })
}

/// Reduce an addr-exploded public set to the ports that look intentional:
/// ports also seen on a private address of the same peer (NAT-mapped public
/// ports correlate with the LAN socket), and the well-known libp2p ports.
/// A key where neither rule selects anything keeps all its addresses.
pub fn clean_exploded_set(public: &[Multiaddr], private: &[Multiaddr]) -> Vec<Multiaddr> {
    let private_ports: Vec<u16> = private.iter().filter_map(port_of).collect();
    let keys: Vec<String> = public.iter().map(addr_key).collect();

    let keep = |addr: &Multiaddr| {
        port_of(addr)
            .map(|p| private_ports.contains(&p) || WELL_KNOWN_PORTS.contains(&p))
            .unwrap_or(false)
    };

    let mut out = Vec::with_capacity(public.len());
    for (i, addr) in public.iter().enumerate() {
        let duplicated = keys
            .iter()
            .enumerate()
            .any(|(j, key)| j != i && *key == keys[i]);
        if !duplicated || keep(addr) {
            out.push(addr.clone());
            continue;
        }
        // Nothing under this key survives the port rules: keep the whole key.
        let any_kept = public
            .iter()
            .enumerate()
            .any(|(j, a)| keys[j] == keys[i] && keep(a));
        if !any_kept {
            out.push(addr.clone());
        }
    }
    out
}

// ── Circuit address grammar ───────────────────────────────────────────────────

/// Split a circuit dial address into the relay's `AddrInfo` and the optional
/// destination peer.
///
/// Accepted shapes:
///   `<transport>*/p2p/<relay>/p2p-circuit`
///   `<transport>*/p2p/<relay>/p2p-circuit/p2p/<dest>`
pub fn split_circuit_addr(addr: &Multiaddr) -> Result<(AddrInfo, Option<PeerId>), RelayError> {
    let mut transport = Multiaddr::empty();
    let mut relay: Option<PeerId> = None;
    let mut dest: Option<PeerId> = None;
    let mut seen_circuit = false;

    for p in addr.iter() {
        match p {
            Protocol::P2pCircuit => {
                if seen_circuit || relay.is_none() {
                    return Err(bad_circuit_addr(addr));
                }
                seen_circuit = true;
            }
            Protocol::P2p(id) => {
                if seen_circuit {
                    if dest.is_some() {
                        return Err(bad_circuit_addr(addr));
                    }
                    dest = Some(id);
                } else {
                    if relay.is_some() {
                        return Err(bad_circuit_addr(addr));
                    }
                    relay = Some(id);
                }
            }
            other => {
                // Transport components are only valid before the relay id.
                if relay.is_some() || seen_circuit {
                    return Err(bad_circuit_addr(addr));
                }
                transport.push(other);
            }
        }
    }

    match (relay, seen_circuit) {
        (Some(relay_id), true) => {
            let addrs = if transport.is_empty() {
                vec![]
            } else {
                vec![transport]
            };
            Ok((AddrInfo::new(relay_id, addrs), dest))
        }
        _ => Err(bad_circuit_addr(addr)),
    }
}

fn bad_circuit_addr(addr: &Multiaddr) -> RelayError {
    RelayError::InvalidArgument(format!("not a circuit address: {addr}"))
}

/// Build the circuit address advertising `local` as reachable through
/// `relay` at `relay_addr`:
///   `<relay-addr>[/p2p/<relay>]/p2p-circuit/p2p/<local>`
/// The relay id is appended only when `relay_addr` does not already carry it.
pub fn circuit_addr_for(relay_addr: &Multiaddr, relay: &PeerId, local: &PeerId) -> Multiaddr {
    let mut addr = relay_addr.clone();
    let has_relay_id = relay_addr
        .iter()
        .any(|p| matches!(p, Protocol::P2p(id) if id == *relay));
    if !has_relay_id {
        addr.push(Protocol::P2p(*relay));
    }
    addr.push(Protocol::P2pCircuit);
    addr.push(Protocol::P2p(*local));
    addr
}

/// The generic advertisement used when no circuit listen address was
/// explicitly requested: `/p2p/<local>/p2p-circuit`.
pub fn generic_circuit_addr(local: &PeerId) -> Multiaddr {
    let mut addr = Multiaddr::empty();
    addr.push(Protocol::P2p(*local));
    addr.push(Protocol::P2pCircuit);
    addr
}
