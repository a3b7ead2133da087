use crate::error::GatewayError;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Per-breaker request counters. A window of these backs the trip decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }

    fn clear(&mut self) {
        *self = Counts::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

/// Predicate deciding when a Closed breaker trips to Open.
pub type TripFn = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;

/// Tuning for a [`Breaker`]. Shared by every breaker a client creates.
#[derive(Clone)]
pub struct BreakerSettings {
    /// Probe budget while half-open; also the consecutive-success count that
    /// closes the breaker again.
    pub max_requests: u32,
    /// Counter-reset window while closed. Zero disables the periodic reset.
    pub interval: Duration,
    /// Time spent open before the next call may probe.
    pub timeout: Duration,
    /// Trip predicate evaluated after each failure while closed.
    pub ready_to_trip: TripFn,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_requests: 3,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            ready_to_trip: Arc::new(|counts| counts.consecutive_failures >= 5),
        }
    }
}

struct Shared {
    state: State,
    counts: Counts,
    /// Bumped on every state change and counter reset. Results reported
    /// against a stale generation are dropped, so a request that straddles a
    /// transition cannot corrupt the new window.
    generation: u64,
    window_start: Instant,
    opened_at: Option<Instant>,
}

/// Three-state failure isolator guarding one forward target.
///
/// Closed passes traffic and counts outcomes; `ready_to_trip` moves it to
/// Open. Open rejects immediately until `timeout` elapses, then the next
/// admission probes in HalfOpen. HalfOpen admits at most `max_requests`
/// calls; one failure re-opens, `max_requests` consecutive successes close.
pub struct Breaker {
    settings: BreakerSettings,
    shared: Mutex<Shared>,
}

impl Breaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            shared: Mutex::new(Shared {
                state: State::Closed,
                counts: Counts::default(),
                generation: 0,
                window_start: Instant::now(),
                opened_at: None,
            }),
        }
    }

    /// Ask to run one guarded call. On success returns the generation token
    /// to hand back to [`Breaker::record`].
    pub fn admit(&self) -> Result<u64, GatewayError> {
        let mut shared = self.shared.lock().unwrap();
        self.refresh(&mut shared, Instant::now());

        match shared.state {
            State::Open => Err(GatewayError::BreakerOpen),
            State::HalfOpen if shared.counts.requests >= self.settings.max_requests => {
                Err(GatewayError::TooManyRequests)
            }
            _ => {
                shared.counts.on_request();
                Ok(shared.generation)
            }
        }
    }

    /// Report the outcome of a call admitted under `generation`. Outcomes
    /// from a previous generation are ignored.
    pub fn record(&self, generation: u64, success: bool) {
        let mut shared = self.shared.lock().unwrap();
        let now = Instant::now();
        self.refresh(&mut shared, now);
        if generation != shared.generation {
            return;
        }
        if success {
            self.on_success(&mut shared, now);
        } else {
            self.on_failure(&mut shared, now);
        }
    }

    /// Current state, after applying any pending time-based transition.
    pub fn state(&self) -> State {
        let mut shared = self.shared.lock().unwrap();
        self.refresh(&mut shared, Instant::now());
        shared.state
    }

    #[cfg(test)]
    pub fn counts(&self) -> Counts {
        self.shared.lock().unwrap().counts
    }

    /// Apply time-based transitions: closed-window counter reset and the
    /// open → half-open timeout.
    fn refresh(&self, shared: &mut Shared, now: Instant) {
        match shared.state {
            State::Closed => {
                if !self.settings.interval.is_zero()
                    && now.duration_since(shared.window_start) >= self.settings.interval
                {
                    shared.generation += 1;
                    shared.counts.clear();
                    shared.window_start = now;
                }
            }
            State::Open => {
                if let Some(at) = shared.opened_at {
                    if now.duration_since(at) >= self.settings.timeout {
                        self.transition(shared, State::HalfOpen, now);
                    }
                }
            }
            State::HalfOpen => {}
        }
    }

    fn on_success(&self, shared: &mut Shared, now: Instant) {
        shared.counts.on_success();
        if shared.state == State::HalfOpen
            && shared.counts.consecutive_successes >= self.settings.max_requests
        {
            self.transition(shared, State::Closed, now);
            tracing::info!(
                "breaker: closed (recovered after {} successes)",
                self.settings.max_requests
            );
        }
    }

    fn on_failure(&self, shared: &mut Shared, now: Instant) {
        match shared.state {
            State::Closed => {
                shared.counts.on_failure();
                if (self.settings.ready_to_trip)(&shared.counts) {
                    let failures = shared.counts.consecutive_failures;
                    self.transition(shared, State::Open, now);
                    tracing::warn!("breaker: opened (after {} consecutive failures)", failures);
                }
            }
            State::HalfOpen => {
                self.transition(shared, State::Open, now);
                tracing::warn!("breaker: re-opened (probe failed in half-open)");
            }
            State::Open => {}
        }
    }

    fn transition(&self, shared: &mut Shared, to: State, now: Instant) {
        shared.state = to;
        shared.generation += 1;
        shared.counts.clear();
        shared.opened_at = match to {
            State::Open => Some(now),
            State::Closed | State::HalfOpen => None,
        };
        if to == State::Closed {
            shared.window_start = now;
        }
    }
}
