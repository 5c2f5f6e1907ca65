//! Auto-relay supervisor.
//!
//! Watches the host's reachability and runs the relay finder only while the
//! host is not publicly dialable. Every reachability change and every
//! relay-set change re-emits the advertisable address set on the event bus.
//! Emissions all happen on the supervisor's own loop, so listeners see a
//! serialized sequence of complete snapshots.

use std::sync::{Arc, Mutex};

use libp2p::Multiaddr;
use tokio::sync::{broadcast, watch};

use crate::config::AutoRelayConfig;
use crate::error::RelayError;
use crate::events::{AutoRelayAddrsUpdated, EventBus, LocalReachabilityChanged, Reachability};
use crate::finder::RelayFinder;
use crate::host::Host;
use crate::metrics::{NoopTracer, Tracer};

pub struct AutoRelay {
    host: Arc<dyn Host>,
    bus: EventBus,
    finder: Arc<RelayFinder>,
    reachability: Mutex<Reachability>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl AutoRelay {
    /// Build the supervisor and its finder. Config contradictions surface
    /// here, never later.
    pub fn new(
        host: Arc<dyn Host>,
        bus: EventBus,
        config: AutoRelayConfig,
    ) -> Result<Arc<Self>, RelayError> {
        Self::with_tracer(host, bus, config, Arc::new(NoopTracer))
    }

    pub fn with_tracer(
        host: Arc<dyn Host>,
        bus: EventBus,
        config: AutoRelayConfig,
        tracer: Arc<dyn Tracer>,
    ) -> Result<Arc<Self>, RelayError> {
        let finder = RelayFinder::new(Arc::clone(&host), config, tracer)?;
        Ok(Arc::new(AutoRelay {
            host,
            bus,
            finder,
            reachability: Mutex::new(Reachability::Unknown),
            stop_tx: Mutex::new(None),
        }))
    }

    pub fn finder(&self) -> &Arc<RelayFinder> {
        &self.finder
    }

    /// Launch the background loop. Idempotent. The initial `unknown`
    /// reachability counts as not-publicly-dialable, so the finder starts
    /// right away rather than waiting for the first probe verdict.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.stop_tx.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        *guard = Some(stop_tx);

        // Subscribe before the caller regains control so no event emitted
        // after start() can be missed.
        let reachability_rx = self.bus.subscribe_reachability();
        let updates = self.finder.subscribe_updates();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(stop_rx, reachability_rx, updates).await;
        });
    }

    /// Stop the loop and the finder, dropping the bus subscriptions.
    pub fn close(&self) {
        // The lock is held across the finder stop so a concurrent
        // `apply_reachability` cannot sneak a restart in between.
        let mut guard = self.stop_tx.lock().unwrap();
        if let Some(stop_tx) = guard.take() {
            let _ = stop_tx.send(true);
        }
        self.finder.stop();
    }

    /// The current advertisable address set: the host's listen addresses
    /// when public, the finder's assembled relay set otherwise.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        let reachability = *self.reachability.lock().unwrap();
        if reachability == Reachability::Public {
            self.host.listen_addrs()
        } else {
            self.finder.relay_addrs()
        }
    }

    pub fn is_finder_active(&self) -> bool {
        self.finder.is_active()
    }

    async fn run(
        self: Arc<Self>,
        mut stop: watch::Receiver<bool>,
        mut reachability_rx: broadcast::Receiver<LocalReachabilityChanged>,
        mut updates: broadcast::Receiver<()>,
    ) {
        // Apply the initial state before processing any events.
        self.apply_reachability(*self.reachability.lock().unwrap());
        self.emit_addrs();

        loop {
            tokio::select! {
                _ = stop.changed() => break,

                event = reachability_rx.recv() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("Reachability subscription lagged by {skipped} events");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    let changed = {
                        let mut current = self.reachability.lock().unwrap();
                        if *current == event.reachability {
                            false
                        } else {
                            *current = event.reachability;
                            true
                        }
                    };
                    // Duplicate verdicts are not events worth republishing.
                    if changed {
                        tracing::info!("Reachability changed to {:?}", event.reachability);
                        self.apply_reachability(event.reachability);
                        self.emit_addrs();
                    }
                }

                update = updates.recv() => {
                    match update {
                        // A lagged tick still means the set changed; the
                        // emission below carries the latest snapshot anyway.
                        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            self.emit_addrs();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    fn apply_reachability(&self, reachability: Reachability) {
        let guard = self.stop_tx.lock().unwrap();
        // A closed supervisor must never (re)start the finder.
        if guard.is_none() {
            return;
        }
        match reachability {
            Reachability::Public => self.finder.stop(),
            Reachability::Private | Reachability::Unknown => self.finder.start(&self.bus),
        }
    }

    fn emit_addrs(&self) {
        let addrs = self.addrs();
        tracing::debug!("Publishing {} advertisable addresses", addrs.len());
        self.bus.emit_relay_addrs(AutoRelayAddrsUpdated { addrs });
    }
}
