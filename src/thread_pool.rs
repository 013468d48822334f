//! Fork-join parallelism for the scanner's precompute phase.
//! No long-lived worker state; each call spins up scoped threads over chunks
//! of the input and joins them before returning.

use std::num::NonZeroUsize;

/// How many worker threads a bulk fan-out should use.
pub fn optimal_job_count() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Map `f` over `items`, preserving order. Runs serially when the input is
/// tiny or only one job is requested.
pub fn parallel_map<T, R, F>(jobs: usize, items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    if jobs <= 1 || items.len() <= 1 {
        return items.iter().map(f).collect();
    }
    let chunk_size = items.len().div_ceil(jobs);
    std::thread::scope(|scope| {
        let f = &f;
        let handles: Vec<_> = items
            .chunks(chunk_size)
            .map(|chunk| scope.spawn(move || chunk.iter().map(f).collect::<Vec<R>>()))
            .collect();
        let mut results = Vec::with_capacity(items.len());
        for handle in handles {
            results.extend(handle.join().expect("worker panicked"));
        }
        results
    })
}
