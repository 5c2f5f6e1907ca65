//! Auto-relay configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::error::RelayError;
use crate::host::{AddrInfo, CandidateSource, StaticRelaySource};

/// Configuration for the relay finder and its supervisor.
///
/// Defaults match the widely deployed client behavior; the timing knobs are
/// plain fields so tests can shrink them.
pub struct AutoRelayConfig {
    /// Fixed relay set. When non-empty it replaces `peer_source` and forces
    /// `min_candidates`, `max_candidates` and `desired_relays` to its length.
    pub static_relays: Vec<AddrInfo>,

    /// External source of relay candidates. Required when `static_relays` is
    /// empty; forbidden otherwise.
    pub peer_source: Option<Arc<dyn CandidateSource>>,

    /// Minimum gap between calls to the peer source.
    pub min_interval: Duration,

    /// Pull more candidates whenever the set falls below this.
    pub min_candidates: usize,

    /// Hard cap on the candidate set.
    pub max_candidates: usize,

    /// Grace period after start before the first reservation attempt, unless
    /// `min_candidates` candidates arrive sooner.
    pub boot_delay: Duration,

    /// Window after a failed or used candidate before the peer is considered
    /// again.
    pub backoff: Duration,

    /// Target number of active reservations.
    pub desired_relays: usize,

    /// Candidates older than this are discarded.
    pub max_candidate_age: Duration,

    /// Cadence of the reservation refresh sweep.
    pub refresh_interval: Duration,

    /// Reservations expiring within this window of now are refreshed.
    pub expiration_slack: Duration,

    /// How long the assembled relay address set stays cached absent a
    /// relay-set change.
    pub addrs_cache_ttl: Duration,

    /// Seed for the candidate shuffle. `None` seeds from the clock; tests
    /// inject a fixed value for determinism.
    pub rng_seed: Option<u64>,
}

impl Default for AutoRelayConfig {
    fn default() -> Self {
        AutoRelayConfig {
            static_relays: Vec::new(),
            peer_source: None,
            min_interval: Duration::from_secs(30),
            min_candidates: 4,
            max_candidates: 20,
            boot_delay: Duration::from_secs(180),
            backoff: Duration::from_secs(3600),
            desired_relays: 2,
            max_candidate_age: Duration::from_secs(30 * 60),
            refresh_interval: Duration::from_secs(60),
            expiration_slack: Duration::from_secs(120),
            addrs_cache_ttl: Duration::from_secs(30),
            rng_seed: None,
        }
    }
}

impl AutoRelayConfig {
    /// Dynamic-discovery configuration around an external peer source.
    pub fn with_peer_source(source: Arc<dyn CandidateSource>) -> Self {
        AutoRelayConfig {
            peer_source: Some(source),
            ..Default::default()
        }
    }

    /// Static-relay configuration. The candidate counts and the relay target
    /// collapse onto the list length; the timing knobs keep their defaults.
    pub fn with_static_relays(relays: Vec<AddrInfo>) -> Self {
        let n = relays.len();
        AutoRelayConfig {
            static_relays: relays,
            min_candidates: n,
            max_candidates: n,
            desired_relays: n,
            ..Default::default()
        }
    }

    /// Check config contradictions. Called at construction time; nothing
    /// here can fail later.
    pub fn validate(&self) -> Result<(), RelayError> {
        if !self.static_relays.is_empty() && self.peer_source.is_some() {
            return Err(RelayError::Config(
                "static_relays and peer_source are mutually exclusive".into(),
            ));
        }
        if self.static_relays.is_empty() && self.peer_source.is_none() {
            return Err(RelayError::Config(
                "one of static_relays or peer_source is required".into(),
            ));
        }
        if self.desired_relays == 0 {
            return Err(RelayError::Config("desired_relays must be at least 1".into()));
        }
        if self.max_candidates < self.min_candidates {
            return Err(RelayError::Config(
                "max_candidates must not be below min_candidates".into(),
            ));
        }
        Ok(())
    }

    /// The candidate source to actually pull from: the static list when set,
    /// the external source otherwise. Call after `validate`.
    pub(crate) fn source(&self) -> Arc<dyn CandidateSource> {
        if !self.static_relays.is_empty() {
            Arc::new(StaticRelaySource::new(self.static_relays.clone()))
        } else {
            self.peer_source
                .clone()
                .expect("validated config has a peer source")
        }
    }
}
