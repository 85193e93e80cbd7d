use std::time::Instant;

use once_cell::sync::Lazy;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic milliseconds since the first call in this process.
///
/// All liveness bookkeeping in the workspace is phrased in this clock, so
/// values compare across components without epoch juggling.
#[inline]
pub fn steady_ms() -> i64 {
    PROCESS_START.elapsed().as_millis() as i64
}
