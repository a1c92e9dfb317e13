//! Named timer scheduler.
//!
//! Every timer has one declarative arm predicate, re-evaluated after
//! each event-loop cycle:
//!   - fade: armed iff the fading set is non-empty
//!   - repaint: armed iff damage is pending, due per the vsync pacer
//!   - unredirect: armed iff a delayed unredirection is pending
//!
//! Nothing blocks mid-operation, so disarming is just dropping the
//! deadline; no in-flight work ever needs preemption.

use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct Timers {
    fade: Option<Instant>,
    repaint: Option<Instant>,
    unredirect: Option<Instant>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-evaluate the fade arm predicate. Keeps an already-armed
    /// deadline so a busy loop doesn't push the tick into the future.
    pub fn arm_fade(&mut self, active: bool, now: Instant, delta: Duration) {
        self.fade = match (active, self.fade) {
            (false, _) => None,
            (true, Some(due)) => Some(due),
            (true, None) => Some(now + delta),
        };
    }

    pub fn fade_fired(&mut self, now: Instant, delta: Duration) {
        self.fade = Some(now + delta);
    }

    pub fn arm_repaint(&mut self, pending: bool, deadline: Instant) {
        self.repaint = pending.then_some(deadline);
    }

    pub fn repaint_fired(&mut self) {
        self.repaint = None;
    }

    pub fn arm_unredirect(&mut self, pending: bool, now: Instant, delay: Duration) {
        self.unredirect = match (pending, self.unredirect) {
            (false, _) => None,
            (true, Some(due)) => Some(due),
            (true, None) => Some(now + delay),
        };
    }

    pub fn unredirect_fired(&mut self) {
        self.unredirect = None;
    }

    pub fn fade_due(&self, now: Instant) -> bool {
        self.fade.is_some_and(|d| d <= now)
    }

    pub fn repaint_due(&self, now: Instant) -> bool {
        self.repaint.is_some_and(|d| d <= now)
    }

    pub fn unredirect_due(&self, now: Instant) -> bool {
        self.unredirect.is_some_and(|d| d <= now)
    }

    /// Nearest armed deadline; the event loop sleeps until this (or
    /// blocks on the X connection alone when nothing is armed).
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.fade, self.repaint, self.unredirect]
            .into_iter()
            .flatten()
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fade_armed_iff_active() {
        let mut timers = Timers::new();
        let now = Instant::now();
        let delta = Duration::from_millis(10);

        timers.arm_fade(false, now, delta);
        assert_eq!(timers.next_deadline(), None);

        timers.arm_fade(true, now, delta);
        let due = timers.next_deadline().unwrap();
        assert_eq!(due, now + delta);

        // Re-arming while active keeps the existing deadline.
        timers.arm_fade(true, now + Duration::from_millis(5), delta);
        assert_eq!(timers.next_deadline(), Some(due));

        // Fading set drained: disarmed.
        timers.arm_fade(false, now, delta);
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_repaint_follows_pacer_deadline() {
        let mut timers = Timers::new();
        let now = Instant::now();
        let deadline = now + Duration::from_millis(16);
        timers.arm_repaint(true, deadline);
        assert!(!timers.repaint_due(now));
        assert!(timers.repaint_due(deadline));
        timers.repaint_fired();
        assert!(!timers.repaint_due(deadline));
    }

    #[test]
    fn test_next_deadline_is_nearest() {
        let mut timers = Timers::new();
        let now = Instant::now();
        timers.arm_fade(true, now, Duration::from_millis(10));
        timers.arm_repaint(true, now + Duration::from_millis(4));
        timers.arm_unredirect(true, now, Duration::from_millis(500));
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(4)));
    }

    #[test]
    fn test_fade_fired_reschedules() {
        let mut timers = Timers::new();
        let now = Instant::now();
        let delta = Duration::from_millis(10);
        timers.arm_fade(true, now, delta);
        let first = timers.next_deadline().unwrap();
        timers.fade_fired(first, delta);
        assert_eq!(timers.next_deadline(), Some(first + delta));
    }
}
