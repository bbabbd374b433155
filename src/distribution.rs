//! Job duration tracking.
//!
//! Every job queue keeps one `DistributionTracker`: a log-spaced histogram of
//! recent job durations that yields a fixed set of percentiles. The
//! percentiles feed the download orchestrator's completion-time estimates
//! through `JobTime` and `ResolveTime`.

use std::time::{Duration, Instant};

/// The percentiles every tracker reports, in ascending order.
pub const JOB_TIME_PERCENTILES: [f64; 7] = [0.50, 0.60, 0.70, 0.80, 0.90, 0.99, 0.999];

const NUM_BUCKETS: usize = 64;

// First bucket upper bound and the per-bucket growth factor. 64 buckets at
// 1.35x growth span roughly 2ms to 2.5 hours.
const FIRST_BUCKET_MS: f64 = 2.0;
const BUCKET_GROWTH: f64 = 1.35;

// Reported for every percentile until the first sample arrives, so fresh
// workers are selectable before they have history.
const UNTRACKED_ESTIMATE: Duration = Duration::from_millis(100);

/// A fixed-bucket, log-spaced histogram of job durations.
pub struct DistributionTracker {
    buckets: [u64; NUM_BUCKETS],
    total: u64,
}

impl DistributionTracker {
    pub fn new() -> Self {
        DistributionTracker {
            buckets: [0; NUM_BUCKETS],
            total: 0,
        }
    }

    fn bucket_bound(index: usize) -> Duration {
        let ms = FIRST_BUCKET_MS * BUCKET_GROWTH.powi(index as i32);
        Duration::from_micros((ms * 1000.0) as u64)
    }

    pub fn add_sample(&mut self, duration: Duration) {
        let index = (0..NUM_BUCKETS)
            .find(|&i| duration <= Self::bucket_bound(i))
            .unwrap_or(NUM_BUCKETS - 1);
        self.buckets[index] += 1;
        self.total += 1;
    }

    pub fn num_samples(&self) -> u64 {
        self.total
    }

    /// Returns the duration at each requested percentile: the upper bound of
    /// the first bucket whose cumulative count covers the percentile.
    pub fn percentiles(&self, percentiles: &[f64]) -> Vec<Duration> {
        if self.total == 0 {
            return vec![UNTRACKED_ESTIMATE; percentiles.len()];
        }
        percentiles
            .iter()
            .map(|&p| {
                let needed = (p * self.total as f64).ceil().max(1.0) as u64;
                let mut seen = 0u64;
                for i in 0..NUM_BUCKETS {
                    seen += self.buckets[i];
                    if seen >= needed {
                        return Self::bucket_bound(i);
                    }
                }
                Self::bucket_bound(NUM_BUCKETS - 1)
            })
            .collect()
    }

    /// The standard percentile set as a `JobTime`.
    pub fn job_time(&self) -> JobTime {
        JobTime(self.percentiles(&JOB_TIME_PERCENTILES))
    }
}

impl Default for DistributionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The potential durations of a job, one per tracked percentile, ascending.
#[derive(Clone, Debug)]
pub struct JobTime(pub Vec<Duration>);

impl JobTime {
    /// The median estimate, used for cost comparisons between workers.
    pub fn median(&self) -> Duration {
        self.0.first().copied().unwrap_or(UNTRACKED_ESTIMATE)
    }

    /// The most pessimistic estimate.
    pub fn max(&self) -> Duration {
        self.0.last().copied().unwrap_or(UNTRACKED_ESTIMATE)
    }

    /// Anchors the estimate to a start instant, producing a `ResolveTime`.
    pub fn resolve_from(&self, start: Instant) -> ResolveTime {
        ResolveTime {
            start,
            times: self.clone(),
        }
    }
}

/// A `JobTime` anchored to the instant its job was queued.
///
/// The expected completion walks the percentiles: the first deadline the
/// elapsed time has not yet passed is the one to bet on. Once the job has
/// outlived every percentile it is late, and the most pessimistic deadline is
/// reported.
#[derive(Clone, Debug)]
pub struct ResolveTime {
    start: Instant,
    times: JobTime,
}

impl ResolveTime {
    /// The instant this job is currently expected to complete.
    pub fn expected(&self) -> Instant {
        let elapsed = self.start.elapsed();
        for &d in &self.times.0 {
            if elapsed < d {
                return self.start + d;
            }
        }
        self.start + self.times.max()
    }

    /// Time remaining until the expected completion; zero once late.
    pub fn remaining(&self) -> Duration {
        self.expected().saturating_duration_since(Instant::now())
    }

    /// Whether the job has outlived every percentile estimate.
    pub fn is_late(&self) -> bool {
        self.start.elapsed() >= self.times.max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tracker_reports_baseline() {
        let dt = DistributionTracker::new();
        let times = dt.job_time();
        assert!(times.0.iter().all(|&d| d == UNTRACKED_ESTIMATE));
    }

    #[test]
    fn percentiles_are_monotonic() {
        let mut dt = DistributionTracker::new();
        for ms in [5u64, 8, 12, 20, 20, 45, 90, 200, 800, 3000] {
            dt.add_sample(Duration::from_millis(ms));
        }
        let times = dt.job_time().0;
        for pair in times.windows(2) {
            assert!(pair[0] <= pair[1], "percentiles must ascend: {times:?}");
        }
        assert!(times[0] >= Duration::from_millis(12));
    }

    #[test]
    fn tail_sample_dominates_p999() {
        let mut dt = DistributionTracker::new();
        for _ in 0..99 {
            dt.add_sample(Duration::from_millis(10));
        }
        dt.add_sample(Duration::from_secs(10));
        let times = dt.job_time();
        assert!(times.max() >= Duration::from_secs(10));
        assert!(times.median() < Duration::from_millis(20));
    }

    #[test]
    fn resolve_time_walks_percentiles() {
        let times = JobTime(vec![
            Duration::from_millis(50),
            Duration::from_millis(100),
            Duration::from_millis(400),
        ]);
        let start = Instant::now() - Duration::from_millis(70);
        let rt = times.resolve_from(start);

        // 70ms elapsed: the 50ms estimate has passed, the 100ms one has not.
        assert_eq!(rt.expected(), start + Duration::from_millis(100));
        assert!(!rt.is_late());

        let late = times.resolve_from(Instant::now() - Duration::from_secs(1));
        assert!(late.is_late());
        assert_eq!(late.remaining(), Duration::ZERO);
    }
}
