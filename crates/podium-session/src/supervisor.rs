//! Reconnection supervisor for the signaling link.
//!
//! Pure, time-parameterized state machine: every decision takes `now_ms` so
//! the schedule can be tested without sleeping. The service layer owns the
//! clock and performs the probe/reconnect calls this schedule asks for.
//!
//! Probing exists for the mesh transport, where the signaling layer can drop
//! silently without closing data links. The relay transport reports its own
//! lifecycle events and is created with probing disabled.

use tracing::debug;

/// How often a healthy signaling link is probed.
pub const PROBE_INTERVAL_MS: u64 = 3_000;

/// Delay before retrying after a failed reconnect attempt.
pub const RETRY_DELAY_MS: u64 = 2_000;

/// Signaling-link state.
///
/// `SignalingLost` is the side state entered from `Connected` when the
/// control channel drops; data links may still be alive while the
/// supervisor re-establishes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    SignalingLost,
}

/// What the service should do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    /// Check signaling-link health via `Transport::probe`.
    Probe,
    /// Call `Transport::reconnect`.
    Reconnect,
}

/// Schedule for one participant's signaling link.
#[derive(Debug)]
pub struct LinkSupervisor {
    state: LinkState,
    probing: bool,
    next_probe_at: Option<u64>,
    next_retry_at: Option<u64>,
}

impl LinkSupervisor {
    /// `probing` mirrors `Transport::needs_probe` for the configured driver.
    pub fn new(probing: bool) -> Self {
        Self {
            state: LinkState::Disconnected,
            probing,
            next_probe_at: None,
            next_retry_at: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn on_connecting(&mut self) {
        self.state = LinkState::Connecting;
        self.next_probe_at = None;
        self.next_retry_at = None;
    }

    /// The link is up. Idempotent: calling again while connected only moves
    /// the probe schedule forward.
    pub fn on_connected(&mut self, now_ms: u64) {
        self.state = LinkState::Connected;
        self.next_retry_at = None;
        self.next_probe_at = self.probing.then_some(now_ms + PROBE_INTERVAL_MS);
    }

    /// The signaling link dropped (reported or probed). Schedules an
    /// immediate reconnect.
    pub fn on_signaling_lost(&mut self, now_ms: u64) {
        if self.state == LinkState::SignalingLost {
            return;
        }
        debug!("Signaling lost, scheduling reconnect");
        self.state = LinkState::SignalingLost;
        self.next_probe_at = None;
        self.next_retry_at = Some(now_ms);
    }

    /// A reconnect attempt failed; try again after the retry delay.
    pub fn on_reconnect_failed(&mut self, now_ms: u64) {
        self.next_retry_at = Some(now_ms + RETRY_DELAY_MS);
    }

    pub fn on_disconnected(&mut self) {
        self.state = LinkState::Disconnected;
        self.next_probe_at = None;
        self.next_retry_at = None;
    }

    /// What is due at `now_ms`, if anything.
    ///
    /// Returning `Reconnect` disarms the retry timer; it is re-armed by
    /// `on_reconnect_failed` or cleared by `on_connected`, so a reconnect
    /// in flight is never issued twice. Returning `Probe` re-arms the probe
    /// timer for the next interval.
    pub fn poll(&mut self, now_ms: u64) -> Option<SupervisorAction> {
        match self.state {
            LinkState::SignalingLost => {
                if self.next_retry_at.is_some_and(|at| now_ms >= at) {
                    self.next_retry_at = None;
                    Some(SupervisorAction::Reconnect)
                } else {
                    None
                }
            }
            LinkState::Connected => {
                if self.next_probe_at.is_some_and(|at| now_ms >= at) {
                    self.next_probe_at = Some(now_ms + PROBE_INTERVAL_MS);
                    Some(SupervisorAction::Probe)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_disconnected_and_idle() {
        let mut sup = LinkSupervisor::new(true);
        assert_eq!(sup.state(), LinkState::Disconnected);
        assert_eq!(sup.poll(1_000_000), None);
    }

    #[test]
    fn test_probe_schedule_while_connected() {
        let mut sup = LinkSupervisor::new(true);
        sup.on_connecting();
        sup.on_connected(1000);

        // Not due before the interval
        assert_eq!(sup.poll(1000), None);
        assert_eq!(sup.poll(1000 + PROBE_INTERVAL_MS - 1), None);

        // Due at the interval, then re-armed
        assert_eq!(
            sup.poll(1000 + PROBE_INTERVAL_MS),
            Some(SupervisorAction::Probe)
        );
        assert_eq!(sup.poll(1000 + PROBE_INTERVAL_MS + 1), None);
        assert_eq!(
            sup.poll(1000 + 2 * PROBE_INTERVAL_MS),
            Some(SupervisorAction::Probe)
        );
    }

    #[test]
    fn test_no_probing_when_disabled() {
        let mut sup = LinkSupervisor::new(false);
        sup.on_connected(1000);
        assert_eq!(sup.poll(1000 + 10 * PROBE_INTERVAL_MS), None);
    }

    #[test]
    fn test_signaling_lost_schedules_immediate_reconnect() {
        let mut sup = LinkSupervisor::new(true);
        sup.on_connected(1000);
        sup.on_signaling_lost(2000);

        assert_eq!(sup.state(), LinkState::SignalingLost);
        assert_eq!(sup.poll(2000), Some(SupervisorAction::Reconnect));
        // Not re-issued while the attempt is in flight
        assert_eq!(sup.poll(2001), None);
    }

    #[test]
    fn test_failed_reconnect_retries_after_delay() {
        let mut sup = LinkSupervisor::new(true);
        sup.on_connected(1000);
        sup.on_signaling_lost(2000);
        assert_eq!(sup.poll(2000), Some(SupervisorAction::Reconnect));

        sup.on_reconnect_failed(2100);
        assert_eq!(sup.poll(2100 + RETRY_DELAY_MS - 1), None);
        assert_eq!(
            sup.poll(2100 + RETRY_DELAY_MS),
            Some(SupervisorAction::Reconnect)
        );
    }

    #[test]
    fn test_reconnect_success_returns_to_connected() {
        let mut sup = LinkSupervisor::new(true);
        sup.on_connected(1000);
        sup.on_signaling_lost(2000);
        assert_eq!(sup.poll(2000), Some(SupervisorAction::Reconnect));

        sup.on_connected(2500);
        assert_eq!(sup.state(), LinkState::Connected);
        // Probe schedule restarts from the reconnect
        assert_eq!(sup.poll(2500 + PROBE_INTERVAL_MS - 1), None);
        assert_eq!(
            sup.poll(2500 + PROBE_INTERVAL_MS),
            Some(SupervisorAction::Probe)
        );
    }

    #[test]
    fn test_duplicate_loss_reports_are_idempotent() {
        let mut sup = LinkSupervisor::new(true);
        sup.on_connected(1000);
        sup.on_signaling_lost(2000);
        assert_eq!(sup.poll(2000), Some(SupervisorAction::Reconnect));

        // A second report while already lost must not re-arm the timer
        sup.on_signaling_lost(2050);
        assert_eq!(sup.poll(2100), None);
    }

    #[test]
    fn test_disconnected_clears_schedule() {
        let mut sup = LinkSupervisor::new(true);
        sup.on_connected(1000);
        sup.on_signaling_lost(2000);
        sup.on_disconnected();

        assert_eq!(sup.state(), LinkState::Disconnected);
        assert_eq!(sup.poll(10_000), None);
    }
}
