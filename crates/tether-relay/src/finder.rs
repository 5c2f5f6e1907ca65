//! Relay finder: discovers candidate relays, vets them, keeps a small set of
//! reservations alive, and assembles the advertisable relay address set.
//!
//! Three cooperating loops run while the finder is active: candidate
//! discovery (rate-limited pulls from the peer source), reservation
//! orchestration (edge-triggered by internal signals), and a housekeeping
//! scheduler (refresh, backoff and candidate-age sweeps). A fourth task
//! watches peer-connectedness events and drops reservations whose relay
//! disconnected.
//!
//! State lives behind two locks, always taken candidate-state first,
//! relay-state second. Network calls never happen under either lock: state
//! is snapshotted out, the network is hit, and results are merged back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use libp2p::{Multiaddr, PeerId};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tether_proto::HOP_PROTOCOL;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant};

use crate::config::AutoRelayConfig;
use crate::error::RelayError;
use crate::events::{Connectedness, EventBus};
use crate::host::{AddrInfo, CandidateSource, Host};
use crate::metrics::Tracer;
use crate::reservation::{reserve, Reservation};
use crate::sanitize::{circuit_addr_for, clean_relay_addrs, is_circuit_addr, is_private_addr};

/// Connection-manager tag under which relay peers are protected.
pub const AUTORELAY_TAG: &str = "autorelay";

/// Deadline for vetting a candidate (connect + protocol check).
const VET_DEADLINE: Duration = Duration::from_secs(20);

/// Deadline for dialing a candidate ahead of a reservation attempt.
const DIAL_DEADLINE: Duration = Duration::from_secs(10);

/// Deadline for a single RESERVE exchange issued by the finder.
const RESERVE_DEADLINE: Duration = Duration::from_secs(10);

/// Lower bound on scheduler sleeps, so coinciding sweeps cannot spin.
const MIN_SCHEDULER_SLEEP: Duration = Duration::from_millis(100);

/// Absolute times at which the next round of each housekeeping sweep is due.
#[derive(Debug, Clone, Copy)]
pub struct ScheduledWorkTimes {
    pub next_allowed_call_to_peer_source: Instant,
    pub next_refresh: Instant,
    pub next_backoff_sweep: Instant,
    pub next_old_candidate_sweep: Instant,
}

impl ScheduledWorkTimes {
    fn starting_at(now: Instant, config: &AutoRelayConfig) -> Self {
        ScheduledWorkTimes {
            next_allowed_call_to_peer_source: now + config.min_interval,
            next_refresh: now + config.refresh_interval,
            next_backoff_sweep: now + config.backoff,
            next_old_candidate_sweep: now + config.max_candidate_age,
        }
    }

    /// The earliest of the four due times.
    pub fn next_due(&self) -> Instant {
        self.next_allowed_call_to_peer_source
            .min(self.next_refresh)
            .min(self.next_backoff_sweep)
            .min(self.next_old_candidate_sweep)
    }
}

/// A vetted peer we hold no reservation on yet.
struct Candidate {
    added: Instant,
    info: AddrInfo,
    #[allow(dead_code)]
    supports_relay_v2: bool,
}

#[derive(Default)]
struct CandidateState {
    candidates: HashMap<PeerId, Candidate>,
    /// Peers not offered as candidates until the stored instant.
    backoff: HashMap<PeerId, Instant>,
}

struct CachedAddrs {
    addrs: Vec<Multiaddr>,
    expires: Instant,
}

#[derive(Default)]
struct RelayState {
    relays: HashMap<PeerId, Reservation>,
    cached_addrs: Option<CachedAddrs>,
}

/// Internal edge signals: 1-buffered channels where senders never block and
/// pending signals coalesce with the next sender.
struct Signals {
    token: mpsc::Sender<()>,
    maybe_connect: mpsc::Sender<()>,
    need_candidates: mpsc::Sender<()>,
}

impl Signals {
    fn notify(tx: &mpsc::Sender<()>) {
        let _ = tx.try_send(());
    }
}

struct Run {
    stop_tx: watch::Sender<bool>,
}

/// See the module docs. Constructed once per host, started and stopped by
/// the auto-relay supervisor as reachability changes.
pub struct RelayFinder {
    host: Arc<dyn Host>,
    config: AutoRelayConfig,
    source: Arc<dyn CandidateSource>,
    tracer: Arc<dyn Tracer>,
    candidate_state: Mutex<CandidateState>,
    relay_state: Mutex<RelayState>,
    booted_at: Mutex<Option<Instant>>,
    relays_updated: broadcast::Sender<()>,
    run: Mutex<Option<Run>>,
}

impl std::fmt::Debug for RelayFinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayFinder").finish_non_exhaustive()
    }
}

impl RelayFinder {
    pub fn new(
        host: Arc<dyn Host>,
        config: AutoRelayConfig,
        tracer: Arc<dyn Tracer>,
    ) -> Result<Arc<Self>, RelayError> {
        config.validate()?;
        let source = config.source();
        let (relays_updated, _) = broadcast::channel(16);
        Ok(Arc::new(RelayFinder {
            host,
            config,
            source,
            tracer,
            candidate_state: Mutex::new(CandidateState::default()),
            relay_state: Mutex::new(RelayState::default()),
            booted_at: Mutex::new(None),
            relays_updated,
            run: Mutex::new(None),
        }))
    }

    /// Fires whenever the relay set changes (reservation gained, refreshed,
    /// lost). The supervisor recomputes the advertised address set on each
    /// tick.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<()> {
        self.relays_updated.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.run.lock().unwrap().is_some()
    }

    /// Start the background loops. Idempotent.
    pub fn start(self: &Arc<Self>, bus: &EventBus) {
        let mut run = self.run.lock().unwrap();
        if run.is_some() {
            return;
        }
        *self.booted_at.lock().unwrap() = Some(Instant::now());

        let (stop_tx, stop_rx) = watch::channel(false);
        let (token_tx, token_rx) = mpsc::channel(1);
        let (maybe_connect_tx, maybe_connect_rx) = mpsc::channel(1);
        let (need_candidates_tx, need_candidates_rx) = mpsc::channel(1);
        let signals = Arc::new(Signals {
            token: token_tx,
            maybe_connect: maybe_connect_tx,
            need_candidates: need_candidates_tx,
        });

        // One discovery pull is allowed right away.
        Signals::notify(&signals.token);

        let finder = Arc::clone(self);
        let sig = Arc::clone(&signals);
        let stop = stop_rx.clone();
        tokio::spawn(async move {
            finder.scheduler_loop(sig, need_candidates_rx, stop).await;
        });

        let finder = Arc::clone(self);
        let sig = Arc::clone(&signals);
        let stop = stop_rx.clone();
        tokio::spawn(async move {
            finder.find_candidates_loop(sig, token_rx, stop).await;
        });

        let finder = Arc::clone(self);
        let sig = Arc::clone(&signals);
        let stop = stop_rx.clone();
        tokio::spawn(async move {
            finder.orchestrate_loop(sig, maybe_connect_rx, stop).await;
        });

        let finder = Arc::clone(self);
        let connectedness = bus.subscribe_connectedness();
        tokio::spawn(async move {
            finder.disconnect_loop(signals, connectedness, stop_rx).await;
        });

        *run = Some(Run { stop_tx });
        self.tracer.finder_status(true);
        tracing::info!("Relay finder started");
    }

    /// Stop the background loops. Idempotent; current state is retained.
    pub fn stop(&self) {
        let mut run = self.run.lock().unwrap();
        if let Some(run) = run.take() {
            let _ = run.stop_tx.send(true);
            self.tracer.finder_status(false);
            tracing::info!("Relay finder stopped");
        }
    }

    // ── Reporting ────────────────────────────────────────────────────────────

    /// Current relay peers and their reservation expiries.
    pub fn relays(&self) -> Vec<(PeerId, SystemTime)> {
        self.relay_state
            .lock()
            .unwrap()
            .relays
            .iter()
            .map(|(peer, rsvp)| (*peer, rsvp.expire))
            .collect()
    }

    /// Current candidate peers.
    pub fn candidates(&self) -> Vec<PeerId> {
        self.candidate_state
            .lock()
            .unwrap()
            .candidates
            .keys()
            .copied()
            .collect()
    }

    // ── Address assembly ─────────────────────────────────────────────────────

    /// The peer's advertisable relay address set: currently-listening
    /// private/loopback addresses unchanged, plus one circuit address per
    /// sanitized relay address. Cached briefly; any relay-set change clears
    /// the cache immediately.
    pub fn relay_addrs(&self) -> Vec<Multiaddr> {
        let now = Instant::now();
        {
            let rs = self.relay_state.lock().unwrap();
            if let Some(cached) = &rs.cached_addrs {
                if cached.expires > now {
                    return cached.addrs.clone();
                }
            }
        }

        let local = self.host.local_peer_id();
        let mut out: Vec<Multiaddr> = self
            .host
            .listen_addrs()
            .into_iter()
            .filter(is_private_addr)
            .collect();

        let mut rs = self.relay_state.lock().unwrap();
        for (peer, rsvp) in &rs.relays {
            for base in clean_relay_addrs(&rsvp.addrs) {
                out.push(circuit_addr_for(&base, peer, &local));
            }
        }
        rs.cached_addrs = Some(CachedAddrs {
            addrs: out.clone(),
            expires: now + self.config.addrs_cache_ttl,
        });
        out
    }

    // ── Candidate discovery ──────────────────────────────────────────────────

    async fn find_candidates_loop(
        self: Arc<Self>,
        signals: Arc<Signals>,
        mut token_rx: mpsc::Receiver<()>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = stop.changed() => return,
                token = token_rx.recv() => {
                    if token.is_none() {
                        return;
                    }
                }
            }

            let below_min = {
                let cs = self.candidate_state.lock().unwrap();
                cs.candidates.len() < self.config.min_candidates
            };
            if !below_min {
                continue;
            }

            tracing::debug!("Pulling up to {} relay candidates", self.config.max_candidates);
            let mut rx = self.source.candidates(self.config.max_candidates).await;
            loop {
                tokio::select! {
                    _ = stop.changed() => return,
                    item = rx.recv() => match item {
                        None => break,
                        Some(info) => self.consider_candidate(&signals, info).await,
                    }
                }
            }
        }
    }

    async fn consider_candidate(&self, signals: &Signals, info: AddrInfo) {
        let peer = info.peer_id;
        if peer == self.host.local_peer_id() {
            return;
        }
        {
            let cs = self.candidate_state.lock().unwrap();
            let rs = self.relay_state.lock().unwrap();
            if cs.candidates.contains_key(&peer) || rs.relays.contains_key(&peer) {
                return;
            }
            if cs.backoff.contains_key(&peer) {
                tracing::debug!("Skipping candidate {peer}: in backoff");
                return;
            }
            if cs.candidates.len() >= self.config.max_candidates {
                return;
            }
        }

        match timeout(VET_DEADLINE, self.vet(&info)).await {
            Ok(Ok(())) => {
                self.tracer.candidate_checked(true);
                let total = {
                    let mut cs = self.candidate_state.lock().unwrap();
                    // Re-check the cap: other paths may have filled the set
                    // while the vet was in flight.
                    if cs.candidates.len() >= self.config.max_candidates
                        || cs.backoff.contains_key(&peer)
                    {
                        return;
                    }
                    cs.candidates.insert(
                        peer,
                        Candidate {
                            added: Instant::now(),
                            info,
                            supports_relay_v2: true,
                        },
                    );
                    cs.candidates.len()
                };
                self.tracer.candidate_added(total);
                tracing::debug!("New relay candidate {peer} ({total} total)");
                Signals::notify(&signals.maybe_connect);
            }
            Ok(Err(RelayError::ProtocolNotSupported)) => {
                self.tracer.candidate_checked(false);
                tracing::debug!("Candidate {peer} does not speak the HOP protocol");
            }
            Ok(Err(e)) => tracing::debug!("Candidate {peer} failed vetting: {e}"),
            Err(_) => tracing::debug!("Candidate {peer} vetting timed out"),
        }
    }

    /// Connect to the candidate and check it can act as our relay.
    async fn vet(&self, info: &AddrInfo) -> Result<(), RelayError> {
        self.host.connect(info).await?;
        for addr in self.host.connections(&info.peer_id) {
            if is_circuit_addr(&addr) {
                // A relay reached through a relay is useless to us.
                return Err(RelayError::ConnectionFailed(format!(
                    "connection to {} is itself relayed",
                    info.peer_id
                )));
            }
        }
        if !self.host.supports_protocol(&info.peer_id, HOP_PROTOCOL) {
            return Err(RelayError::ProtocolNotSupported);
        }
        Ok(())
    }

    // ── Reservation orchestration ────────────────────────────────────────────

    async fn orchestrate_loop(
        self: Arc<Self>,
        signals: Arc<Signals>,
        mut maybe_connect_rx: mpsc::Receiver<()>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = stop.changed() => return,
                signal = maybe_connect_rx.recv() => {
                    if signal.is_none() {
                        return;
                    }
                }
            }
            self.try_connect_to_relays(&signals).await;
        }
    }

    async fn try_connect_to_relays(&self, signals: &Signals) {
        let shuffled = {
            let cs = self.candidate_state.lock().unwrap();
            let rs = self.relay_state.lock().unwrap();
            if rs.relays.len() >= self.config.desired_relays {
                return;
            }
            // Give discovery a chance to warm up before settling for the
            // first few candidates.
            if rs.relays.is_empty()
                && cs.candidates.len() < self.config.min_candidates
                && self.since_boot() < self.config.boot_delay
            {
                return;
            }
            if cs.candidates.is_empty() {
                return;
            }
            let now = Instant::now();
            let mut eligible: Vec<AddrInfo> = cs
                .candidates
                .values()
                .filter(|c| now.duration_since(c.added) <= self.config.max_candidate_age)
                .map(|c| c.info.clone())
                .collect();
            // Random order keeps the swarm from converging on the same few
            // popular relays.
            eligible.shuffle(&mut self.shuffle_rng());
            eligible
        };

        for info in shuffled {
            let peer = info.peer_id;
            {
                let mut cs = self.candidate_state.lock().unwrap();
                let rs = self.relay_state.lock().unwrap();
                if rs.relays.len() >= self.config.desired_relays {
                    return;
                }
                if rs.relays.contains_key(&peer) {
                    cs.candidates.remove(&peer);
                    continue;
                }
                // The attempt consumes the candidate win or lose, and earns
                // the backoff window up front so a failure needs no second
                // bookkeeping pass.
                cs.candidates.remove(&peer);
                self.tracer.candidate_removed(cs.candidates.len());
                cs.backoff.insert(peer, Instant::now() + self.config.backoff);
            }

            match self.connect_and_reserve(&info).await {
                Ok(rsvp) => {
                    self.tracer.reservation_request(false, true);
                    let total = {
                        let mut rs = self.relay_state.lock().unwrap();
                        rs.relays.insert(peer, rsvp);
                        rs.cached_addrs = None;
                        rs.relays.len()
                    };
                    self.host.protect(&peer, AUTORELAY_TAG);
                    tracing::info!("Reserved relay slot on {peer} ({total} active)");
                    let _ = self.relays_updated.send(());
                    if total >= self.config.desired_relays {
                        return;
                    }
                }
                Err(e) => {
                    self.tracer.reservation_request(false, false);
                    tracing::debug!("Reservation attempt on {peer} failed: {e}");
                    Signals::notify(&signals.need_candidates);
                }
            }
        }
    }

    async fn connect_and_reserve(&self, info: &AddrInfo) -> Result<Reservation, RelayError> {
        if self.host.connections(&info.peer_id).is_empty() {
            timeout(DIAL_DEADLINE, self.host.connect(info))
                .await
                .map_err(|_| {
                    RelayError::ConnectionFailed(format!("dial to {} timed out", info.peer_id))
                })??;
        }
        match timeout(RESERVE_DEADLINE, reserve(self.host.as_ref(), info.peer_id)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::ConnectionFailed(format!(
                "reservation on {} timed out",
                info.peer_id
            ))),
        }
    }

    // ── Refresh ──────────────────────────────────────────────────────────────

    /// Refresh every reservation expiring within the slack window. Attempts
    /// run concurrently; the sweep ends when all of them return.
    async fn refresh_reservations(&self, signals: &Signals) {
        let due: Vec<PeerId> = {
            let deadline = SystemTime::now() + self.config.expiration_slack;
            let rs = self.relay_state.lock().unwrap();
            rs.relays
                .iter()
                .filter(|(_, rsvp)| rsvp.expire <= deadline)
                .map(|(peer, _)| *peer)
                .collect()
        };
        if due.is_empty() {
            return;
        }

        let attempts = due.into_iter().map(|peer| async move {
            let result = match timeout(RESERVE_DEADLINE, reserve(self.host.as_ref(), peer)).await {
                Ok(result) => result,
                Err(_) => Err(RelayError::ConnectionFailed(format!(
                    "refresh on {peer} timed out"
                ))),
            };
            (peer, result)
        });

        let mut dropped = 0;
        let mut changed = false;
        for (peer, result) in join_all(attempts).await {
            match result {
                Ok(rsvp) => {
                    self.tracer.reservation_request(true, true);
                    let mut rs = self.relay_state.lock().unwrap();
                    rs.relays.insert(peer, rsvp);
                    rs.cached_addrs = None;
                    changed = true;
                }
                Err(e) => {
                    self.tracer.reservation_request(true, false);
                    tracing::warn!("Refreshing reservation on {peer} failed: {e}");
                    {
                        let mut rs = self.relay_state.lock().unwrap();
                        rs.relays.remove(&peer);
                        rs.cached_addrs = None;
                    }
                    self.host.unprotect(&peer, AUTORELAY_TAG);
                    dropped += 1;
                    changed = true;
                    Signals::notify(&signals.maybe_connect);
                    Signals::notify(&signals.need_candidates);
                }
            }
        }
        if dropped > 0 {
            self.tracer.reservation_ended(dropped);
        }
        if changed {
            let _ = self.relays_updated.send(());
        }
    }

    // ── Housekeeping scheduler ───────────────────────────────────────────────

    async fn scheduler_loop(
        self: Arc<Self>,
        signals: Arc<Signals>,
        mut need_candidates_rx: mpsc::Receiver<()>,
        mut stop: watch::Receiver<bool>,
    ) {
        let start = Instant::now();
        let mut times = ScheduledWorkTimes::starting_at(start, &self.config);
        let mut boot_due = Some(start + self.config.boot_delay);

        loop {
            let mut next = times.next_due();
            if let Some(boot) = boot_due {
                next = next.min(boot);
            }
            let wakeup = next.max(Instant::now() + MIN_SCHEDULER_SLEEP);

            tokio::select! {
                _ = stop.changed() => return,
                _ = sleep_until(wakeup) => {}
                signal = need_candidates_rx.recv() => {
                    if signal.is_none() {
                        return;
                    }
                    // Grant an early discovery pull if the rate limit allows.
                    if Instant::now() >= times.next_allowed_call_to_peer_source {
                        Signals::notify(&signals.token);
                        times.next_allowed_call_to_peer_source =
                            Instant::now() + self.config.min_interval;
                        self.tracer.scheduled_work_updated(&times);
                    }
                    continue;
                }
            }

            let now = Instant::now();

            if boot_due.is_some_and(|boot| now >= boot) {
                boot_due = None;
                Signals::notify(&signals.maybe_connect);
            }

            if now >= times.next_allowed_call_to_peer_source {
                Signals::notify(&signals.token);
                times.next_allowed_call_to_peer_source = now + self.config.min_interval;
            }

            if now >= times.next_refresh {
                // Refreshing may consume relays; allow discovery to restock.
                Signals::notify(&signals.token);
                self.refresh_reservations(&signals).await;
                times.next_refresh = now + self.config.refresh_interval;
            }

            if now >= times.next_backoff_sweep {
                let mut cs = self.candidate_state.lock().unwrap();
                cs.backoff.retain(|_, until| *until > now);
                drop(cs);
                times.next_backoff_sweep = now + self.config.backoff;
            }

            if now >= times.next_old_candidate_sweep {
                let dropped = {
                    let mut cs = self.candidate_state.lock().unwrap();
                    let before = cs.candidates.len();
                    cs.candidates
                        .retain(|_, c| now.duration_since(c.added) <= self.config.max_candidate_age);
                    before - cs.candidates.len()
                };
                if dropped > 0 {
                    self.tracer.candidate_removed(dropped);
                    tracing::debug!("Dropped {dropped} expired candidates");
                    Signals::notify(&signals.need_candidates);
                }
                times.next_old_candidate_sweep = now + self.config.max_candidate_age;
            }

            self.tracer.scheduled_work_updated(&times);
        }
    }

    // ── Disconnects ──────────────────────────────────────────────────────────

    async fn disconnect_loop(
        self: Arc<Self>,
        signals: Arc<Signals>,
        mut connectedness: broadcast::Receiver<crate::events::PeerConnectednessChanged>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                _ = stop.changed() => return,
                event = connectedness.recv() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Connectedness subscription lagged by {skipped} events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            if event.connectedness != Connectedness::NotConnected {
                continue;
            }

            let removed = {
                let mut rs = self.relay_state.lock().unwrap();
                if rs.relays.remove(&event.peer).is_some() {
                    rs.cached_addrs = None;
                    true
                } else {
                    false
                }
            };
            if removed {
                self.host.unprotect(&event.peer, AUTORELAY_TAG);
                self.tracer.reservation_ended(1);
                tracing::info!("Relay {} disconnected; reservation dropped", event.peer);
                let _ = self.relays_updated.send(());
                Signals::notify(&signals.maybe_connect);
                Signals::notify(&signals.need_candidates);
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn since_boot(&self) -> Duration {
        self.booted_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    fn shuffle_rng(&self) -> StdRng {
        match self.config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => {
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO)
                    .subsec_nanos();
                StdRng::seed_from_u64(u64::from(nanos))
            }
        }
    }
}
