use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

/// Per-key exponential backoff for failing reconciliations.
///
/// Each failure of a key doubles its delay, starting at `base` and capped at `max`.
///
/// Keys whose pod was deleted while waiting are never reconciled again, so entries that have not
/// failed for twice the cap are dropped on the next failure of any key.
#[derive(Debug)]
pub struct FailureBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, Failures>>,
}

#[derive(Debug)]
struct Failures {
    count: u32,
    last: Instant,
}

impl Default for FailureBackoff {
    fn default() -> Self {
        FailureBackoff::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl FailureBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        FailureBackoff {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure of `key`, returning the delay before its next attempt.
    pub fn when(&self, key: &str) -> Duration {
        let now = Instant::now();
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        self.prune_locked(&mut failures, now);
        let entry = failures.entry(key.to_string()).or_insert(Failures { count: 0, last: now });
        let exp = entry.count;
        entry.count += 1;
        entry.last = now;

        let delay = self.base.as_secs_f64() * 2f64.powi(exp.min(63) as i32);
        let delay = Duration::from_secs_f64(delay.min(self.max.as_secs_f64()));
        // Up to 10% jitter so failing pods don't retry in lockstep.
        let jitter = rand::thread_rng().gen_range(0.0..0.1);
        (delay + delay.mul_f64(jitter)).min(self.max)
    }

    /// How many times `key` has been requeued since it last succeeded.
    pub fn num_requeues(&self, key: &str) -> u32 {
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.get(key).map(|f| f.count).unwrap_or(0)
    }

    pub fn forget(&self, key: &str) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.remove(key);
    }

    /// Drop keys whose last failure is older than twice the cap, as of `now`.
    pub fn prune(&self, now: Instant) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        self.prune_locked(&mut failures, now);
    }

    fn prune_locked(&self, failures: &mut HashMap<String, Failures>, now: Instant) {
        let ttl = self.max * 2;
        failures.retain(|_, f| now.saturating_duration_since(f.last) <= ttl);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap() {
        let backoff = FailureBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let delays: Vec<_> = (0..6).map(|_| backoff.when("ns/pod")).collect();

        for (d, expected) in delays.iter().zip(&[100u64, 200, 400, 800]) {
            assert!(*d >= Duration::from_millis(*expected));
            assert!(*d <= Duration::from_millis(*expected * 11 / 10));
        }
        assert_eq!(delays[4], Duration::from_secs(1));
        assert_eq!(delays[5], Duration::from_secs(1));
        assert_eq!(backoff.num_requeues("ns/pod"), 6);
    }

    #[test]
    fn keys_are_tracked_independently() {
        let backoff = FailureBackoff::default();
        backoff.when("ns/a");
        backoff.when("ns/a");
        backoff.when("ns/b");
        assert_eq!(backoff.num_requeues("ns/a"), 2);
        assert_eq!(backoff.num_requeues("ns/b"), 1);

        backoff.forget("ns/a");
        assert_eq!(backoff.num_requeues("ns/a"), 0);
        assert!(backoff.when("ns/a") < Duration::from_millis(6));
    }

    #[test]
    fn abandoned_keys_are_pruned() {
        let backoff = FailureBackoff::new(Duration::from_millis(5), Duration::from_secs(10));
        backoff.when("ns/deleted");
        backoff.when("ns/alive");

        backoff.prune(Instant::now() + Duration::from_secs(5));
        assert_eq!(backoff.len(), 2);

        backoff.prune(Instant::now() + Duration::from_secs(21));
        assert_eq!(backoff.len(), 0);
        assert_eq!(backoff.num_requeues("ns/alive"), 0);
    }
}
