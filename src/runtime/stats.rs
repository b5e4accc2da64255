//! Raw counters exposed after a run.
//!
//! Everything here is process-lifetime only and monotonic while a role is
//! running; formatting is left to the caller.

/// Count of readiness waits by number of events returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    buckets: Vec<u64>,
}

impl Histogram {
    /// Histogram with buckets `0..=max_events`.
    pub fn new(max_events: usize) -> Self {
        Self {
            buckets: vec![0; max_events + 1],
        }
    }

    /// Record one wait that returned `events` events.
    pub fn record(&mut self, events: usize) {
        let last = self.buckets.len() - 1;
        self.buckets[events.min(last)] += 1;
    }

    /// Add another histogram's counts into this one, growing if needed.
    pub fn merge(&mut self, other: &Histogram) {
        if other.buckets.len() > self.buckets.len() {
            self.buckets.resize(other.buckets.len(), 0);
        }
        for (mine, theirs) in self.buckets.iter_mut().zip(&other.buckets) {
            *mine += theirs;
        }
    }

    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    /// Total number of waits recorded.
    pub fn total_waits(&self) -> u64 {
        self.buckets.iter().sum()
    }

    /// `(events, waits)` for every bucket that was hit.
    pub fn nonzero(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(events, &count)| (events, count))
    }
}

/// Counters from one poller.
#[derive(Debug, Clone)]
pub struct PollerStats {
    pub id: usize,
    /// Connections accepted.
    pub accepted: usize,
    /// Connections closed after a hangup.
    pub closed: usize,
    /// Spins reported by the exchange queue while forwarding work.
    pub overflows: u64,
    /// Protocol ticks served inline (direct mode only).
    pub ticks: u64,
    pub histogram: Histogram,
}

impl PollerStats {
    pub fn new(id: usize, max_events: usize) -> Self {
        Self {
            id,
            accepted: 0,
            closed: 0,
            overflows: 0,
            ticks: 0,
            histogram: Histogram::new(max_events),
        }
    }
}

/// Counters from one worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub id: usize,
    /// Requests answered.
    pub replies: u64,
    /// Zero-length reads on a connection the poller had not yet closed.
    pub peer_closed: u64,
    /// Deferred closes executed.
    pub closes: u64,
}

/// Counters from one load generator.
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    pub id: usize,
    pub connections: usize,
    /// Replies received across all connections.
    pub replies: u64,
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct Report {
    pub pollers: Vec<PollerStats>,
    pub workers: Vec<WorkerStats>,
    pub clients: Vec<ClientStats>,
}

impl Report {
    /// Queue overflow spins summed over all pollers.
    pub fn overflows(&self) -> u64 {
        self.pollers.iter().map(|p| p.overflows).sum()
    }

    /// Connections closed summed over all pollers.
    pub fn closed(&self) -> usize {
        self.pollers.iter().map(|p| p.closed).sum()
    }

    /// Requests answered by the server side, whichever role served them.
    pub fn replies(&self) -> u64 {
        let queued: u64 = self.workers.iter().map(|w| w.replies).sum();
        let inline: u64 = self.pollers.iter().map(|p| p.ticks).sum();
        queued + inline
    }

    /// Replies the load generators received.
    pub fn client_replies(&self) -> u64 {
        self.clients.iter().map(|c| c.replies).sum()
    }

    /// Wait histogram merged over all pollers.
    pub fn histogram(&self) -> Histogram {
        let mut merged = Histogram::new(0);
        for poller in &self.pollers {
            merged.merge(&poller.histogram);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_record() {
        let mut hist = Histogram::new(4);
        hist.record(0);
        hist.record(2);
        hist.record(2);
        hist.record(9); // clamped into the last bucket

        assert_eq!(hist.buckets(), &[1, 0, 2, 0, 1]);
        assert_eq!(hist.total_waits(), 4);
        assert_eq!(hist.nonzero().collect::<Vec<_>>(), vec![(0, 1), (2, 2), (4, 1)]);
    }

    #[test]
    fn test_histogram_merge() {
        let mut a = Histogram::new(2);
        a.record(1);
        let mut b = Histogram::new(4);
        b.record(1);
        b.record(4);

        a.merge(&b);
        assert_eq!(a.buckets(), &[0, 2, 0, 0, 1]);
    }

    #[test]
    fn test_report_aggregates() {
        let mut p0 = PollerStats::new(0, 2);
        p0.closed = 3;
        p0.overflows = 7;
        p0.histogram.record(1);
        let mut p1 = PollerStats::new(1, 2);
        p1.closed = 2;
        p1.ticks = 4;
        p1.histogram.record(1);

        let report = Report {
            pollers: vec![p0, p1],
            workers: vec![WorkerStats {
                id: 0,
                replies: 6,
                ..Default::default()
            }],
            clients: vec![ClientStats {
                id: 0,
                connections: 5,
                replies: 10,
            }],
        };

        assert_eq!(report.closed(), 5);
        assert_eq!(report.overflows(), 7);
        assert_eq!(report.replies(), 10);
        assert_eq!(report.client_replies(), 10);
        assert_eq!(report.histogram().buckets(), &[0, 2, 0]);
    }
}
