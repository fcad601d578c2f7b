//! Per-client quota, concurrency, burst, and backpressure admission control.
//!
//! Grounded in the same shape as the original `RateLimiter` / `BackpressureController`
//! pair: a bounded window of request timestamps plus an atomic in-flight counter and
//! queue-depth counter per client, checked in a fixed order on every `admit` call.
//! Denials are observable outcomes carrying a reason and a retry hint, never errors —
//! only an internal bookkeeping failure (a poisoned lock) fails open, and that is
//! logged rather than propagated, so a misbehaving client can never cascade into an
//! outage for everyone else.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chunk_model::ClientQuota;
use dashmap::DashMap;
use parking_lot::Mutex;

const BURST_WINDOW: Duration = Duration::from_secs(10);
const MINUTE_WINDOW: Duration = Duration::from_secs(60);
const HOUR_WINDOW: Duration = Duration::from_secs(3600);
const DEFAULT_MAX_QUEUE_DEPTH: usize = 100;
const DEFAULT_OVERLOAD_THRESHOLD: f64 = 0.8;

/// Why `admit` denied a request. Every variant is observable, not an error; each one
/// is paired with a `retry_after_seconds` hint.
#[derive(Debug, Clone, PartialEq)]
pub enum Denial {
    ScopeDenied,
    ConcurrencyExceeded { in_flight: u32, max_concurrent: u32 },
    RpmExceeded { count: u32, rpm: u32 },
    RphExceeded { count: u32, rph: u32 },
    BurstExceeded { count: u32, burst: u32 },
    SystemOverload { load_ratio: f64 },
    QueueFull { queue_depth: usize, max_queue_depth: usize },
}

impl Denial {
    pub fn reason(&self) -> &'static str {
        match self {
            Denial::ScopeDenied => "scope_denied",
            Denial::ConcurrencyExceeded { .. } => "concurrency_exceeded",
            Denial::RpmExceeded { .. } => "rpm_exceeded",
            Denial::RphExceeded { .. } => "rph_exceeded",
            Denial::BurstExceeded { .. } => "burst_exceeded",
            Denial::SystemOverload { .. } => "system_overload",
            Denial::QueueFull { .. } => "queue_full",
        }
    }

    pub fn retry_after_seconds(&self) -> u64 {
        match self {
            Denial::ScopeDenied => 0,
            Denial::ConcurrencyExceeded { .. } => 1,
            Denial::RpmExceeded { .. } => 60,
            Denial::RphExceeded { .. } => 3600,
            Denial::BurstExceeded { .. } => 10,
            Denial::SystemOverload { .. } => 10,
            Denial::QueueFull { .. } => 5,
        }
    }
}

struct ClientState {
    timestamps: VecDeque<Instant>,
    in_flight: u32,
    queue_depth: usize,
}

impl ClientState {
    fn new() -> Self {
        Self {
            timestamps: VecDeque::new(),
            in_flight: 0,
            queue_depth: 0,
        }
    }

    /// Drop timestamps older than one hour; the minute/hour/burst windows are all
    /// sub-windows of this so a single sweep keeps the deque bounded.
    fn sweep(&mut self, now: Instant) {
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) > HOUR_WINDOW {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn count_within(&self, now: Instant, window: Duration) -> u32 {
        self.timestamps
            .iter()
            .rev()
            .take_while(|&&t| now.duration_since(t) <= window)
            .count() as u32
    }

    fn oldest_within(&self, now: Instant, window: Duration) -> Option<Instant> {
        self.timestamps
            .iter()
            .find(|&&t| now.duration_since(t) <= window)
            .copied()
    }
}

/// Handle reserving one concurrency slot. Releasing it (explicitly via [`release`](Ticket::release)
/// or implicitly on drop) decrements `in_flight` exactly once.
pub struct Ticket {
    client_id: String,
    controller: Arc<Inner>,
    released: bool,
}

impl Ticket {
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.controller.release_slot(&self.client_id);
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.do_release();
    }
}

struct Inner {
    quotas: DashMap<String, ClientQuota>,
    states: DashMap<String, Mutex<ClientState>>,
    global_in_flight: AtomicU32,
    global_capacity: u32,
    max_queue_depth: usize,
    overload_threshold: f64,
}

impl Inner {
    fn release_slot(&self, client_id: &str) {
        if let Some(state) = self.states.get(client_id) {
            let mut s = state.lock();
            if s.in_flight > 0 {
                s.in_flight -= 1;
            }
        }
        // Saturating decrement: never underflow even if a release races a config reload.
        let _ = self
            .global_in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(1))
            });
    }
}

/// Admission controller for one process. Construct one instance and share it (it is
/// cheaply `Clone`) across every request-handling task.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl AdmissionController {
    pub fn new(global_capacity: u32) -> Self {
        Self::with_config(global_capacity, DEFAULT_MAX_QUEUE_DEPTH, DEFAULT_OVERLOAD_THRESHOLD)
    }

    pub fn with_config(global_capacity: u32, max_queue_depth: usize, overload_threshold: f64) -> Self {
        Self {
            inner: Arc::new(Inner {
                quotas: DashMap::new(),
                states: DashMap::new(),
                global_in_flight: AtomicU32::new(0),
                global_capacity,
                max_queue_depth,
                overload_threshold,
            }),
        }
    }

    pub fn set_quota(&self, quota: ClientQuota) {
        self.inner.quotas.insert(quota.client_id.clone(), quota);
    }

    pub fn remove_quota(&self, client_id: &str) {
        self.inner.quotas.remove(client_id);
    }

    /// Mark a request as waiting for a worker slot (e.g. queued behind admission).
    /// Paired with [`leave_queue`](Self::leave_queue).
    pub fn enter_queue(&self, client_id: &str) {
        let state = self
            .inner
            .states
            .entry(client_id.to_string())
            .or_insert_with(|| Mutex::new(ClientState::new()));
        state.lock().queue_depth += 1;
    }

    pub fn leave_queue(&self, client_id: &str) {
        if let Some(state) = self.inner.states.get(client_id) {
            let mut s = state.lock();
            s.queue_depth = s.queue_depth.saturating_sub(1);
        }
    }

    /// Attempt to admit one request for `client_id` under `scope`. Checks run in the
    /// fixed order specified for the controller: scope, concurrency, rpm/rph, burst,
    /// system overload, queue depth.
    pub fn admit(&self, client_id: &str, scope: &str) -> Result<Ticket, Denial> {
        let result = self.admit_inner(client_id, scope);
        if let Err(denial) = &result {
            tracing::debug!(client_id, scope, reason = denial.reason(), "admission denied");
        }
        result
    }

    fn admit_inner(&self, client_id: &str, scope: &str) -> Result<Ticket, Denial> {
        let quota = self
            .inner
            .quotas
            .get(client_id)
            .map(|q| q.clone())
            .unwrap_or_else(|| ClientQuota::unlimited(client_id));

        if quota.active && !quota.scopes.iter().any(|s| s == scope) {
            return Err(Denial::ScopeDenied);
        }

        let state_entry = self
            .inner
            .states
            .entry(client_id.to_string())
            .or_insert_with(|| Mutex::new(ClientState::new()));
        let mut state = state_entry.lock();
        let now = Instant::now();
        state.sweep(now);

        if state.in_flight >= quota.max_concurrent {
            return Err(Denial::ConcurrencyExceeded {
                in_flight: state.in_flight,
                max_concurrent: quota.max_concurrent,
            });
        }

        let minute_count = state.count_within(now, MINUTE_WINDOW);
        if minute_count >= quota.rpm {
            return Err(Denial::RpmExceeded { count: minute_count, rpm: quota.rpm });
        }
        let hour_count = state.count_within(now, HOUR_WINDOW);
        if hour_count >= quota.rph {
            return Err(Denial::RphExceeded { count: hour_count, rph: quota.rph });
        }

        let burst_count = state.count_within(now, BURST_WINDOW);
        if burst_count >= quota.burst {
            return Err(Denial::BurstExceeded { count: burst_count, burst: quota.burst });
        }

        let global_in_flight = self.inner.global_in_flight.load(Ordering::SeqCst);
        if self.inner.global_capacity > 0 {
            let load_ratio = global_in_flight as f64 / self.inner.global_capacity as f64;
            if load_ratio >= self.inner.overload_threshold {
                return Err(Denial::SystemOverload { load_ratio });
            }
        }

        if state.queue_depth >= self.inner.max_queue_depth {
            return Err(Denial::QueueFull {
                queue_depth: state.queue_depth,
                max_queue_depth: self.inner.max_queue_depth,
            });
        }

        state.timestamps.push_back(now);
        state.in_flight += 1;
        self.inner.global_in_flight.fetch_add(1, Ordering::SeqCst);
        drop(state);

        Ok(Ticket {
            client_id: client_id.to_string(),
            controller: self.inner.clone(),
            released: false,
        })
    }

    pub fn in_flight(&self, client_id: &str) -> u32 {
        self.inner
            .states
            .get(client_id)
            .map(|s| s.lock().in_flight)
            .unwrap_or(0)
    }

    pub fn global_in_flight(&self) -> u32 {
        self.inner.global_in_flight.load(Ordering::SeqCst)
    }

    pub fn queue_depth(&self, client_id: &str) -> usize {
        self.inner
            .states
            .get(client_id)
            .map(|s| s.lock().queue_depth)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota(client_id: &str, rpm: u32, burst: u32, max_concurrent: u32) -> ClientQuota {
        ClientQuota {
            client_id: client_id.to_string(),
            rpm,
            rph: rpm * 60,
            max_concurrent,
            burst,
            scopes: vec!["query".into()],
            active: true,
        }
    }

    #[test]
    fn admits_then_denies_on_concurrency() {
        let ctl = AdmissionController::new(100);
        ctl.set_quota(quota("c1", 100, 100, 1));
        let t1 = ctl.admit("c1", "query").expect("first admit");
        let err = ctl.admit("c1", "query").unwrap_err();
        assert_eq!(err.reason(), "concurrency_exceeded");
        t1.release();
        assert!(ctl.admit("c1", "query").is_ok());
    }

    #[test]
    fn release_decrements_in_flight_exactly_once() {
        let ctl = AdmissionController::new(100);
        ctl.set_quota(quota("c1", 100, 100, 5));
        let ticket = ctl.admit("c1", "query").unwrap();
        assert_eq!(ctl.in_flight("c1"), 1);
        drop(ticket);
        assert_eq!(ctl.in_flight("c1"), 0);
    }

    #[test]
    fn scope_denied_when_scope_not_granted() {
        let ctl = AdmissionController::new(100);
        ctl.set_quota(quota("c1", 100, 100, 5));
        let err = ctl.admit("c1", "admin").unwrap_err();
        assert_eq!(err, Denial::ScopeDenied);
    }

    #[test]
    fn burst_limit_denies_after_threshold() {
        let ctl = AdmissionController::new(100);
        ctl.set_quota(quota("c1", 100, 3, 100));
        let mut tickets = Vec::new();
        for _ in 0..3 {
            tickets.push(ctl.admit("c1", "query").expect("within burst"));
        }
        let err = ctl.admit("c1", "query").unwrap_err();
        assert_eq!(err.reason(), "burst_exceeded");
    }

    #[test]
    fn system_overload_denies_past_threshold() {
        let ctl = AdmissionController::new(10);
        ctl.set_quota(quota("c1", 1000, 1000, 1000));
        let mut tickets = Vec::new();
        for _ in 0..8 {
            tickets.push(ctl.admit("c1", "query").expect("below overload"));
        }
        let err = ctl.admit("c1", "query").unwrap_err();
        assert_eq!(err.reason(), "system_overload");
    }
}
