//! Fixed-interval timers driving reconnects and pairing polls
//!
//! The event loop owns the clock. It asks for the nearest deadline to size
//! its poll timeout, then hands the current time back through
//! [`Scheduler::expired`]. Timers started between two loop turns are armed
//! relative to the last time the loop reported, the way a reactor's cached
//! loop time works.

use std::time::{Duration, Instant};

/// Default connect-retry interval
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Default pairing-poll interval
pub const PAIRING_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// The two timers owned by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Fires while disconnected; each fire is one connection attempt
    ConnectRetry,
    /// Fires while ready with unpaired tunnels; each fire re-requests pairing
    PairingPoll,
}

/// A repeating timer with a constant interval
#[derive(Debug, Clone)]
struct Timer {
    interval: Duration,
    deadline: Option<Instant>,
}

impl Timer {
    fn new(interval: Duration) -> Self {
        Timer {
            interval,
            deadline: None,
        }
    }
}

/// Connect-retry and pairing-poll timers
#[derive(Debug, Clone)]
pub struct Scheduler {
    now: Instant,
    connect_retry: Timer,
    pairing_poll: Timer,
}

impl Scheduler {
    pub fn new(retry_interval: Duration, poll_interval: Duration, now: Instant) -> Self {
        Scheduler {
            now,
            connect_retry: Timer::new(retry_interval),
            pairing_poll: Timer::new(poll_interval),
        }
    }

    fn timer(&self, kind: TimerKind) -> &Timer {
        match kind {
            TimerKind::ConnectRetry => &self.connect_retry,
            TimerKind::PairingPoll => &self.pairing_poll,
        }
    }

    fn timer_mut(&mut self, kind: TimerKind) -> &mut Timer {
        match kind {
            TimerKind::ConnectRetry => &mut self.connect_retry,
            TimerKind::PairingPoll => &mut self.pairing_poll,
        }
    }

    /// (Re)arm a timer one interval from the loop's current time
    ///
    /// Restarting an armed timer pushes its deadline back; there is never
    /// more than one pending fire per timer.
    pub fn start(&mut self, kind: TimerKind) {
        let now = self.now;
        let timer = self.timer_mut(kind);
        timer.deadline = Some(now + timer.interval);
        log::trace!("Timer {:?} armed ({:?})", kind, timer.interval);
    }

    pub fn stop(&mut self, kind: TimerKind) {
        let timer = self.timer_mut(kind);
        if timer.deadline.take().is_some() {
            log::trace!("Timer {:?} stopped", kind);
        }
    }

    pub fn stop_all(&mut self) {
        self.stop(TimerKind::ConnectRetry);
        self.stop(TimerKind::PairingPoll);
    }

    pub fn is_active(&self, kind: TimerKind) -> bool {
        self.timer(kind).deadline.is_some()
    }

    pub fn interval(&self, kind: TimerKind) -> Duration {
        self.timer(kind).interval
    }

    /// Earliest pending deadline, if any timer is armed
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.connect_retry.deadline, self.pairing_poll.deadline]
            .into_iter()
            .flatten()
            .min()
    }

    /// Advance the clock and collect the timers that are due
    ///
    /// Due timers are re-armed for their next interval before being
    /// returned. A timer that fell several intervals behind fires once.
    pub fn expired(&mut self, now: Instant) -> Vec<TimerKind> {
        self.now = now;
        let mut fired = Vec::new();

        for kind in [TimerKind::ConnectRetry, TimerKind::PairingPoll] {
            let timer = self.timer_mut(kind);
            if let Some(deadline) = timer.deadline {
                if deadline <= now {
                    timer.deadline = Some(now + timer.interval);
                    fired.push(kind);
                }
            }
        }

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(t0: Instant) -> Scheduler {
        Scheduler::new(Duration::from_secs(2), Duration::from_secs(5), t0)
    }

    #[test]
    fn test_timer_fires_after_interval() {
        let t0 = Instant::now();
        let mut s = scheduler(t0);
        s.start(TimerKind::ConnectRetry);

        assert_eq!(s.next_deadline(), Some(t0 + Duration::from_secs(2)));
        assert!(s.expired(t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(
            s.expired(t0 + Duration::from_secs(2)),
            vec![TimerKind::ConnectRetry]
        );
        // Repeats
        assert_eq!(s.next_deadline(), Some(t0 + Duration::from_secs(4)));
    }

    #[test]
    fn test_stopped_timer_never_fires() {
        let t0 = Instant::now();
        let mut s = scheduler(t0);
        s.start(TimerKind::PairingPoll);
        s.stop(TimerKind::PairingPoll);

        assert!(!s.is_active(TimerKind::PairingPoll));
        assert_eq!(s.next_deadline(), None);
        assert!(s.expired(t0 + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_restart_does_not_duplicate() {
        let t0 = Instant::now();
        let mut s = scheduler(t0);
        s.start(TimerKind::ConnectRetry);
        s.expired(t0 + Duration::from_secs(1));
        s.start(TimerKind::ConnectRetry);

        // Deadline moved to t0+1+2; only one fire
        assert!(s.expired(t0 + Duration::from_secs(2)).is_empty());
        assert_eq!(
            s.expired(t0 + Duration::from_secs(3)),
            vec![TimerKind::ConnectRetry]
        );
    }

    #[test]
    fn test_independent_timers() {
        let t0 = Instant::now();
        let mut s = scheduler(t0);
        s.start(TimerKind::ConnectRetry);
        s.start(TimerKind::PairingPoll);

        assert_eq!(s.next_deadline(), Some(t0 + Duration::from_secs(2)));
        assert_eq!(
            s.expired(t0 + Duration::from_secs(5)),
            vec![TimerKind::ConnectRetry, TimerKind::PairingPoll]
        );
    }
}
