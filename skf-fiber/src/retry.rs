use std::future::Future;
use std::time::Duration;

use skf_core::Result;

use crate::timer::sleep;

/// Run a fallible I/O operation with a bounded backoff schedule.
///
/// Shutdown-class errors (interrupt, cancel, group stop) propagate
/// immediately; any other error sleeps `intervals[attempt]` and retries.
/// Exhausting the schedule surfaces the last error. The schedule is
/// expected to be non-decreasing (validated at config load).
pub async fn io_retry<T, F, Fut>(intervals: &[Duration], mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_shutdown() => return Err(e),
            Err(e) => {
                if crate::ctx::group_should_stop() || attempt >= intervals.len() {
                    return Err(e);
                }
                tracing::warn!(
                    target: "skiff::fiber",
                    attempt,
                    retry_in_ms = intervals[attempt].as_millis() as u64,
                    "I/O failed, will retry: {e}"
                );
                sleep(intervals[attempt]).await?;
                attempt += 1;
            }
        }
    }
}
