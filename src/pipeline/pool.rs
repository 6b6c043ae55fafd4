//! Worker pool sizing and bounded fan-out shared by every adapter stage.

use std::future::Future;

use futures::stream::{self, StreamExt};
use serde::Serialize;

/// Per-adapter parallelism bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolBounds {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Workers granted per batch-sized unit of work.
    pub workers_per_batch: usize,
}

impl Default for PoolBounds {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: num_cpus::get().max(4),
            workers_per_batch: 8,
        }
    }
}

impl PoolBounds {
    #[must_use]
    pub const fn new(min_workers: usize, max_workers: usize, workers_per_batch: usize) -> Self {
        Self {
            min_workers,
            max_workers,
            workers_per_batch,
        }
    }

    #[must_use]
    pub fn worker_count(&self, workload: usize, batch_size: usize) -> usize {
        worker_count(workload, batch_size, self)
    }
}

/// `clamp(ceil(workload / batch_size) * workers_per_batch, min, max)`, or 0 when there is
/// nothing to do. A zero batch size counts as one.
#[must_use]
pub fn worker_count(workload: usize, batch_size: usize, bounds: &PoolBounds) -> usize {
    if workload == 0 {
        return 0;
    }

    let units = workload.div_ceil(batch_size.max(1));
    let wanted = units.saturating_mul(bounds.workers_per_batch);
    let max = bounds.max_workers.max(1);
    let min = bounds.min_workers.min(max);

    wanted.clamp(min, max)
}

/// Runs `work` over `items` with at most `workers` in flight and returns one output per
/// input. Outputs arrive in completion order; `work` receives each item's input position
/// so callers can reassemble.
pub async fn fan_out<T, O, F, Fut>(items: Vec<T>, workers: usize, work: F) -> Vec<O>
where
    F: Fn(usize, T) -> Fut,
    Fut: Future<Output = O>,
{
    if items.is_empty() {
        return Vec::new();
    }

    stream::iter(items.into_iter().enumerate())
        .map(|(position, item)| work(position, item))
        .buffer_unordered(workers.max(1))
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, 200, PoolBounds::new(2, 16, 4), 0)]
    #[case(1, 200, PoolBounds::new(2, 16, 4), 4)]
    #[case(200, 200, PoolBounds::new(2, 16, 4), 4)]
    #[case(201, 200, PoolBounds::new(2, 16, 4), 8)]
    #[case(10_000, 200, PoolBounds::new(2, 16, 4), 16)]
    #[case(5, 200, PoolBounds::new(6, 16, 1), 6)]
    #[case(5, 0, PoolBounds::new(1, 64, 2), 10)]
    fn sizes_pool_within_bounds(
        #[case] workload: usize,
        #[case] batch_size: usize,
        #[case] bounds: PoolBounds,
        #[case] expected: usize,
    ) {
        assert_eq!(worker_count(workload, batch_size, &bounds), expected);
    }

    #[test]
    fn never_leaves_bounds_for_positive_workload() {
        let bounds = PoolBounds::new(3, 12, 5);
        for workload in 1..2_000 {
            let workers = bounds.worker_count(workload, 150);
            assert!((3..=12).contains(&workers), "workload {workload} -> {workers}");
        }
    }

    #[test]
    fn inverted_bounds_collapse_to_max() {
        assert_eq!(worker_count(10, 10, &PoolBounds::new(8, 2, 1)), 2);
    }

    #[tokio::test]
    async fn fan_out_returns_one_output_per_input_and_respects_limit() {
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let mut outputs = fan_out((0..50).collect(), 4, |position, item: usize| {
            let in_flight = &in_flight;
            let peak = &peak;
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                (position, item * 2)
            }
        })
        .await;

        outputs.sort_unstable();
        assert_eq!(outputs.len(), 50);
        assert!(outputs.iter().all(|(p, v)| *v == p * 2));
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }
}
