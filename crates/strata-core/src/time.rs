use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch, saturating at zero for pre-epoch clocks.
///
/// TTI/TTL math is done in whole seconds; callers that need a testable
/// clock pass an explicit `now` instead of calling this directly.
pub fn unix_seconds() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}
