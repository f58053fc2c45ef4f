use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// What a session just did.
pub enum Stats {
    Accepted,
    Authenticated,
    Closed,
}

/// Running session totals, cheap to clone into every accept loop.
///
/// # Test
///
/// ```
/// use bithorde_server::statistics::{Statistics, Stats};
///
/// let statistics = Statistics::default();
///
/// statistics.add(Stats::Accepted);
/// statistics.add(Stats::Accepted);
/// statistics.add(Stats::Closed);
///
/// assert_eq!(statistics.accepted(), 2);
/// assert_eq!(statistics.active(), 1);
/// ```
#[derive(Default, Clone)]
pub struct Statistics(Arc<Counts>);

#[derive(Default)]
struct Counts {
    accepted: AtomicUsize,
    authenticated: AtomicUsize,
    closed: AtomicUsize,
}

impl Statistics {
    pub fn add(&self, payload: Stats) {
        let counter = match payload {
            Stats::Accepted => &self.0.accepted,
            Stats::Authenticated => &self.0.authenticated,
            Stats::Closed => &self.0.closed,
        };

        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> usize {
        self.0.accepted.load(Ordering::Relaxed)
    }

    pub fn authenticated(&self) -> usize {
        self.0.authenticated.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> usize {
        self.0.closed.load(Ordering::Relaxed)
    }

    /// Sessions accepted and not yet closed.
    pub fn active(&self) -> usize {
        self.accepted().saturating_sub(self.closed())
    }
}
