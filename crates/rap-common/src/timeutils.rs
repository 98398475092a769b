//! Timing helper.

use std::time::Instant;

/// Runs `f` and returns the elapsed wall-clock time in seconds along with its return value.
pub fn timeit<F, R>(f: F) -> (f64, R)
where
    F: FnOnce() -> R,
{
    let start = Instant::now();
    let result = f();
    (start.elapsed().as_secs_f64(), result)
}

/// Like [`timeit`] for fallible work: an error is returned unchanged and no timing is reported.
pub fn try_timeit<F, T, E>(f: F) -> Result<(f64, T), E>
where
    F: FnOnce() -> Result<T, E>,
{
    let (elapsed, result) = timeit(f);
    result.map(|value| (elapsed, value))
}
