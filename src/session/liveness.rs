use std::time::Duration;
use tokio::time::Instant;

/// Outcome of a liveness window elapsing without a classified line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessLoss {
    /// The probe after the grace period went unanswered; the device was
    /// never responsive on this link. Surfaced as an error, no automatic
    /// reconnect on this path.
    NeverResponded,
    /// A previously responsive device went quiet. `reconnect` is true only
    /// the first time per responsiveness loss; the latch clears on the next
    /// classified line.
    LostContact { reconnect: bool },
}

/// Tracks whether the device is currently answering.
///
/// One rolling deadline, reset by every classified line. A fresh connection
/// first observes a grace window during which silence is not an error; when
/// it elapses the session sends a probe and the normal timeout takes over.
#[derive(Debug)]
pub struct LivenessMonitor {
    grace: Duration,
    timeout: Duration,
    grace_until: Option<Instant>,
    deadline: Option<Instant>,
    responding: bool,
    reconnect_latched: bool,
}

impl LivenessMonitor {
    pub fn new(grace: Duration, timeout: Duration) -> Self {
        Self {
            grace,
            timeout,
            grace_until: None,
            deadline: None,
            responding: false,
            reconnect_latched: false,
        }
    }

    /// Full reset on explicit connect/disconnect. Clears the reconnect latch.
    pub fn reset(&mut self) {
        self.grace_until = None;
        self.deadline = None;
        self.responding = false;
        self.reconnect_latched = false;
    }

    /// Arm the grace window for a (re)opened link. The reconnect latch is
    /// deliberately left alone so a reconnected-but-still-silent device does
    /// not trigger a second reconnect.
    pub fn arm_grace(&mut self, now: Instant) {
        self.grace_until = Some(now + self.grace);
        self.deadline = None;
        self.responding = false;
    }

    pub fn responding(&self) -> bool {
        self.responding
    }

    pub fn in_grace(&self) -> bool {
        self.grace_until.is_some()
    }

    /// A classified line arrived. Replaces the countdown atomically and
    /// clears the reconnect latch. Returns true when this flips the device
    /// from silent to responding (recovery or first contact).
    pub fn note_classified(&mut self, now: Instant) -> bool {
        let recovered = !self.responding;
        self.responding = true;
        self.reconnect_latched = false;
        self.grace_until = None;
        self.deadline = Some(now + self.timeout);
        recovered
    }

    /// Called when the grace window elapses; the caller sends the probe.
    /// Starts the first real countdown.
    pub fn grace_elapsed(&mut self, now: Instant) {
        self.grace_until = None;
        self.deadline = Some(now + self.timeout);
    }

    /// The transport reported an unsolicited drop. Cancels every window and
    /// returns whether a reconnect should be started (same once-per-loss
    /// latch as a timeout).
    pub fn link_dropped(&mut self) -> bool {
        self.grace_until = None;
        self.deadline = None;
        self.responding = false;
        let reconnect = !self.reconnect_latched;
        self.reconnect_latched = true;
        reconnect
    }

    /// Called when the countdown elapses with no classified line.
    pub fn timed_out(&mut self) -> LivenessLoss {
        self.deadline = None;
        if !self.responding {
            return LivenessLoss::NeverResponded;
        }
        self.responding = false;
        let reconnect = !self.reconnect_latched;
        self.reconnect_latched = true;
        LivenessLoss::LostContact { reconnect }
    }

    pub fn grace_deadline(&self) -> Option<Instant> {
        self.grace_until
    }

    pub fn timeout_deadline(&self) -> Option<Instant> {
        self.deadline
    }
}
