//! Fixed-size pool of serial worker lanes.
//!
//! Work is spread over the lanes round-robin; each lane runs its jobs one at
//! a time on a dedicated thread, lanes run in parallel. A [`Lane`] pins a
//! series of jobs to one lane so they run in submission order. There is no
//! cancellation: jobs that need it check external state themselves.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI32, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Upper bound on the number of lanes in a pool.
pub const MAX_LANES: usize = 16;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A pool of worker lanes.
pub struct QueuePool {
    label: String,
    lanes: Vec<mpsc::UnboundedSender<Job>>,
    index: AtomicI32,
}

impl QueuePool {
    /// Creates a pool with `lane_count` lanes, or the default count when 0.
    ///
    /// # Errors
    /// Returns error if a worker thread cannot be spawned.
    pub fn new(label: impl Into<String>, lane_count: usize) -> std::io::Result<Self> {
        let label = label.into();
        let count = if lane_count > 0 {
            lane_count
        } else {
            Self::default_lane_count()
        };

        let mut lanes = Vec::with_capacity(count);
        for i in 0..count {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            let lane_name = format!("{label}.{i}");
            std::thread::Builder::new()
                .name(lane_name.clone())
                .spawn(move || {
                    while let Some(job) = rx.blocking_recv() {
                        if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!(lane = %lane_name, "Queue pool job panicked");
                        }
                    }
                })?;
            lanes.push(tx);
        }

        debug!(label = %label, lanes = count, "Queue pool started");

        Ok(Self {
            label,
            lanes,
            index: AtomicI32::new(-1),
        })
    }

    /// Creates a pool with the default lane count.
    ///
    /// # Errors
    /// Returns error if a worker thread cannot be spawned.
    pub fn with_default_lanes(label: impl Into<String>) -> std::io::Result<Self> {
        Self::new(label, 0)
    }

    /// `min(16, max(1, available parallelism))`.
    #[must_use]
    pub fn default_lane_count() -> usize {
        std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .clamp(1, MAX_LANES)
    }

    /// Number of lanes.
    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Pool label, used as the lane thread name prefix.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Submits `work` to the next lane.
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) {
        let index = self.next_lane();
        send(&self.label, index, &self.lanes[index], Box::new(work));
    }

    /// Picks the next lane round-robin and returns a handle bound to it.
    #[must_use]
    pub fn lane(&self) -> Lane {
        let index = self.next_lane();
        Lane {
            label: self.label.clone(),
            index,
            sender: self.lanes[index].clone(),
        }
    }

    fn next_lane(&self) -> usize {
        let raw = self.index.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        raw.unsigned_abs() as usize % self.lanes.len()
    }
}

fn send(label: &str, index: usize, lane: &mpsc::UnboundedSender<Job>, job: Job) {
    if lane.send(job).is_err() {
        warn!(label, lane = index, "Queue pool lane is closed, dropping job");
    }
}

/// Handle to one lane of a [`QueuePool`].
///
/// Jobs submitted through the same handle never overlap and run in the order
/// they were submitted.
#[derive(Clone)]
pub struct Lane {
    label: String,
    index: usize,
    sender: mpsc::UnboundedSender<Job>,
}

impl Lane {
    /// Submits `work` to this lane.
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) {
        send(&self.label, self.index, &self.sender, Box::new(work));
    }

    /// Position of the lane in its pool.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }
}

impl std::fmt::Debug for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lane")
            .field("label", &self.label)
            .field("index", &self.index)
            .finish()
    }
}

impl std::fmt::Debug for QueuePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePool")
            .field("label", &self.label)
            .field("lanes", &self.lanes.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    #[test]
    fn test_default_lane_count_bounds() {
        let count = QueuePool::default_lane_count();
        assert!((1..=MAX_LANES).contains(&count));
    }

    #[test]
    fn test_zero_lanes_uses_default() -> std::io::Result<()> {
        let pool = QueuePool::new("test.default", 0)?;
        assert_eq!(pool.lane_count(), QueuePool::default_lane_count());
        Ok(())
    }

    #[test]
    fn test_runs_every_job() -> Result<(), Box<dyn std::error::Error>> {
        let pool = QueuePool::new("test.run", 4)?;
        let (tx, rx) = std_mpsc::channel();

        for i in 0..100 {
            let tx = tx.clone();
            pool.submit(move || {
                let _ = tx.send(i);
            });
        }

        let mut seen = HashSet::new();
        for _ in 0..100 {
            seen.insert(rx.recv_timeout(Duration::from_secs(5))?);
        }
        assert_eq!(seen.len(), 100);
        Ok(())
    }

    #[test]
    fn test_round_robin_over_lanes() -> Result<(), Box<dyn std::error::Error>> {
        let pool = QueuePool::new("test.rr", 3)?;
        let (tx, rx) = std_mpsc::channel();

        for _ in 0..3 {
            let tx = tx.clone();
            pool.submit(move || {
                let name = std::thread::current().name().map(String::from);
                let _ = tx.send(name);
            });
        }

        let mut names = HashSet::new();
        for _ in 0..3 {
            names.insert(rx.recv_timeout(Duration::from_secs(5))?);
        }
        let expected: HashSet<_> = (0..3).map(|i| Some(format!("test.rr.{i}"))).collect();
        assert_eq!(names, expected);
        Ok(())
    }

    #[test]
    fn test_lane_survives_panicking_job() -> Result<(), Box<dyn std::error::Error>> {
        let pool = QueuePool::new("test.panic", 1)?;
        let (tx, rx) = std_mpsc::channel();

        pool.submit(|| panic!("boom"));
        pool.submit(move || {
            let _ = tx.send(42);
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, 42);
        Ok(())
    }

    #[test]
    fn test_pinned_lane_runs_jobs_in_order_on_one_thread() -> Result<(), Box<dyn std::error::Error>> {
        let pool = QueuePool::new("test.pin", 3)?;
        let lane = pool.lane();
        let (tx, rx) = std_mpsc::channel();

        for i in 0..20 {
            let tx = tx.clone();
            // Moves round-robin on between pinned jobs.
            pool.submit(|| std::thread::sleep(Duration::from_millis(1)));
            lane.submit(move || {
                if i == 0 {
                    std::thread::sleep(Duration::from_millis(30));
                }
                let name = std::thread::current().name().map(String::from);
                let _ = tx.send((i, name));
            });
        }

        let expected_name = Some(format!("test.pin.{}", lane.index()));
        for expected in 0..20 {
            let (i, name) = rx.recv_timeout(Duration::from_secs(5))?;
            assert_eq!(i, expected);
            assert_eq!(name, expected_name);
        }
        Ok(())
    }

    #[test]
    fn test_lane_index_wraps_without_overflow() -> std::io::Result<()> {
        let pool = QueuePool::new("test.wrap", 5)?;
        pool.index.store(i32::MAX, Ordering::Relaxed);
        for _ in 0..10 {
            assert!(pool.next_lane() < 5);
        }
        Ok(())
    }
}
