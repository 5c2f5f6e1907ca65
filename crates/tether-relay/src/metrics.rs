//! Optional observability hook.
//!
//! The finder and supervisor report lifecycle events through a `Tracer`
//! held as `Arc<dyn Tracer>`. Every method has a no-op default, so an
//! implementation only overrides what it cares about and the default
//! [`NoopTracer`] costs nothing.

use crate::finder::ScheduledWorkTimes;

pub trait Tracer: Send + Sync + 'static {
    /// The relay finder was started (`true`) or stopped (`false`).
    fn finder_status(&self, _active: bool) {}

    /// A candidate finished vetting. `supports_relay_v2` is false when the
    /// peer was reachable but lacks the HOP protocol, metered separately
    /// from connect failures, which never reach this hook.
    fn candidate_checked(&self, _supports_relay_v2: bool) {}

    fn candidate_added(&self, _total: usize) {}

    fn candidate_removed(&self, _total: usize) {}

    /// A RESERVE exchange completed. `refresh` distinguishes keep-alive
    /// attempts from first-time reservations.
    fn reservation_request(&self, _refresh: bool, _ok: bool) {}

    /// Reservations were dropped (expiry, refresh failure, disconnect).
    fn reservation_ended(&self, _count: usize) {}

    /// The housekeeping scheduler recomputed its wakeup times.
    fn scheduled_work_updated(&self, _times: &ScheduledWorkTimes) {}
}

/// Default tracer: ignores everything.
pub struct NoopTracer;

impl Tracer for NoopTracer {}
