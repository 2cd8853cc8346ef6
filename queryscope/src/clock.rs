//! Wall-clock tick fan-out.
//!
//! A single driver task watches the wall clock and multiplexes it into any
//! number of per-consumer tick streams. Delivery is *aligned*: a subscriber
//! with period P receives a tick exactly when the Unix time is divisible by
//! P, so a 60-second consumer ticks on minute boundaries regardless of when
//! it subscribed.
//!
//! Consumers with long periods would otherwise wait up to a full period for
//! their first tick. When the time to the next boundary exceeds
//! [`Clock::prime_min`], `add` immediately primes the new subscriber with
//! the current time, then resumes aligned delivery.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A single tick: the wall-clock time it fired for.
pub type Tick = DateTime<Utc>;

/// Default minimum ETA (seconds) above which a new subscriber is primed
/// with an immediate tick.
pub const DEFAULT_PRIME_MIN_SECS: u64 = 60;

struct Subscriber {
    tx: mpsc::Sender<Tick>,
    period: u64,
}

/// Aligned tick multiplexer.
///
/// Dropping the clock stops the driver task; subscribers simply stop
/// receiving ticks.
pub struct Clock {
    subs: Arc<Mutex<Vec<Subscriber>>>,
    prime_min: u64,
    shutdown: CancellationToken,
}

impl Clock {
    /// Creates a clock and spawns its driver task.
    pub fn new() -> Self {
        Self::with_prime_min(DEFAULT_PRIME_MIN_SECS)
    }

    /// Creates a clock with a custom priming threshold.
    pub fn with_prime_min(prime_min: u64) -> Self {
        let subs: Arc<Mutex<Vec<Subscriber>>> = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let driver_subs = Arc::clone(&subs);
        let driver_shutdown = shutdown.clone();
        tokio::spawn(async move {
            run_driver(driver_subs, driver_shutdown).await;
        });

        Self {
            subs,
            prime_min,
            shutdown,
        }
    }

    /// Subscribes `tx` to aligned ticks every `period_secs` seconds.
    ///
    /// If the next boundary is further away than the priming threshold, the
    /// subscriber is sent the current time immediately so it can start its
    /// first cycle now.
    pub fn add(&self, tx: mpsc::Sender<Tick>, period_secs: u64) {
        let period = period_secs.max(1);
        if self.eta(period) > self.prime_min as f64 {
            debug!(period, "priming new clock subscriber");
            if tx.try_send(Utc::now()).is_err() {
                warn!(period, "new clock subscriber not ready for primed tick");
            }
        }
        if let Ok(mut subs) = self.subs.lock() {
            subs.push(Subscriber { tx, period });
        }
    }

    /// Unsubscribes the stream previously registered with this sender.
    pub fn remove(&self, tx: &mpsc::Sender<Tick>) {
        if let Ok(mut subs) = self.subs.lock() {
            subs.retain(|s| !s.tx.same_channel(tx));
        }
    }

    /// Seconds until the next boundary aligned to `period_secs`.
    pub fn eta(&self, period_secs: u64) -> f64 {
        let period = period_secs.max(1);
        let now = Utc::now();
        let sub_sec = f64::from(now.timestamp_subsec_micros()) / 1_000_000.0;
        let into_period = (now.timestamp().rem_euclid(period as i64)) as f64 + sub_sec;
        period as f64 - into_period
    }

    /// Stops the driver task. Further ticks are never delivered.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_driver(subs: Arc<Mutex<Vec<Subscriber>>>, shutdown: CancellationToken) {
    loop {
        // Sleep to the next whole second, then fan out to every subscriber
        // whose period divides that boundary.
        let now = Utc::now();
        let boundary_ts = now.timestamp() + 1;
        let remaining_nanos =
            1_000_000_000u64.saturating_sub(u64::from(now.timestamp_subsec_nanos()));

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!("clock driver stopping");
                return;
            }

            _ = tokio::time::sleep(Duration::from_nanos(remaining_nanos)) => {}
        }

        let tick = match DateTime::from_timestamp(boundary_ts, 0) {
            Some(t) => t,
            None => continue,
        };

        let Ok(subs) = subs.lock() else { return };
        for sub in subs.iter() {
            if boundary_ts.rem_euclid(sub.period as i64) == 0 {
                // A consumer that cannot keep up loses this tick rather
                // than stalling the driver.
                if sub.tx.try_send(tick).is_err() {
                    warn!(period = sub.period, "subscriber full, dropping tick");
                }
            }
        }
    }
}
