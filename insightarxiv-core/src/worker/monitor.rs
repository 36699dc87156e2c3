//! Host-side liveness watchdog for worker jobs.
//!
//! The worker only reports liveness; deciding that a job is stuck is the
//! host's call. [`WorkerMonitor`] records when the last event arrived and
//! flags the job once it has been silent longer than the configured timeout.

use std::time::Duration;
use tokio::time::Instant;

use super::protocol::WorkerEvent;

#[derive(Debug, Clone)]
pub struct WorkerMonitor {
    timeout: Duration,
    last_event: Instant,
    active: bool,
    processed: usize,
    total: usize,
}

impl WorkerMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_event: Instant::now(),
            active: true,
            processed: 0,
            total: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record an event from the job.
    pub fn observe(&mut self, event: &WorkerEvent) {
        self.last_event = Instant::now();
        match event {
            WorkerEvent::ProcessingStart { total_papers, .. } => self.total = *total_papers,
            WorkerEvent::Heartbeat {
                processed, total, ..
            } => {
                self.processed = *processed;
                self.total = *total;
            }
            WorkerEvent::Batch { progress, .. } => {
                self.processed = progress.current;
                self.total = progress.total;
            }
            WorkerEvent::Complete { .. } | WorkerEvent::Error { .. } => self.active = false,
            _ => {}
        }
    }

    /// Instant after which a silent job counts as stuck.
    pub fn deadline(&self) -> Instant {
        self.last_event + self.timeout
    }

    pub fn is_stuck_at(&self, now: Instant) -> bool {
        self.active && now >= self.deadline()
    }

    pub fn is_stuck(&self) -> bool {
        self.is_stuck_at(Instant::now())
    }

    pub fn silent_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_event)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Last reported (processed, total).
    pub fn progress(&self) -> (usize, usize) {
        (self.processed, self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::MonthKey;

    fn heartbeat(processed: usize) -> WorkerEvent {
        WorkerEvent::Heartbeat {
            month: MonthKey::parse("2025-07").unwrap(),
            timestamp: 0,
            processed,
            total: 10,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_after_silence() {
        let mut monitor = WorkerMonitor::new(Duration::from_secs(15));
        assert!(!monitor.is_stuck());

        tokio::time::advance(Duration::from_secs(10)).await;
        monitor.observe(&heartbeat(4));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!monitor.is_stuck());
        assert_eq!(monitor.progress(), (4, 10));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(monitor.is_stuck());
        assert_eq!(monitor.silent_for(), Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_job_is_never_stuck() {
        let mut monitor = WorkerMonitor::new(Duration::from_secs(1));
        monitor.observe(&WorkerEvent::Error {
            month: MonthKey::parse("2025-07").unwrap(),
            error: "boom".into(),
            timestamp: 0,
        });
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!monitor.is_stuck());
        assert!(!monitor.is_active());
    }
}
