use std::time::Duration;
use tokio::time::Instant;

/// Bounds for user-supplied poll intervals (ms).
pub const MIN_POLL_INTERVAL_MS: u64 = 50;
pub const MAX_POLL_INTERVAL_MS: u64 = 5000;

/// Schedules the periodic telemetry request while the session is connected.
///
/// Fire-and-forget: a tick is emitted on schedule whether or not the
/// previous request was answered, since the wire protocol has no request
/// correlation. Changing the interval restarts the schedule from now.
#[derive(Debug)]
pub struct Poller {
    enabled: bool,
    interval: Duration,
    next_tick: Option<Instant>,
}

impl Poller {
    pub fn new(default_interval: Duration) -> Self {
        Self {
            enabled: false,
            interval: default_interval,
            next_tick: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Clamp a user-supplied interval into the supported range.
    pub fn clamp_interval_ms(ms: u64) -> Duration {
        Duration::from_millis(ms.clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS))
    }

    /// Enable or disable polling. `running` says whether the session is in a
    /// phase where ticks should actually be scheduled.
    pub fn set_enabled(&mut self, enabled: bool, running: bool, now: Instant) {
        self.enabled = enabled;
        self.next_tick = if enabled && running {
            Some(now + self.interval)
        } else {
            None
        };
    }

    /// Replace the interval and restart the schedule if currently running.
    pub fn set_interval(&mut self, interval: Duration, now: Instant) {
        self.interval = interval;
        if self.next_tick.is_some() {
            self.next_tick = Some(now + self.interval);
        }
    }

    /// Begin ticking (connection became usable).
    pub fn start(&mut self, now: Instant) {
        if self.enabled {
            self.next_tick = Some(now + self.interval);
        }
    }

    /// Stop immediately (disconnect, reconnect in progress).
    pub fn stop(&mut self) {
        self.next_tick = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.next_tick
    }

    /// True when a tick is due; schedules the next one.
    pub fn tick_due(&mut self, now: Instant) -> bool {
        match self.next_tick {
            Some(at) if now >= at => {
                self.next_tick = Some(now + self.interval);
                true
            }
            _ => false,
        }
    }
}
