use std::time::{Duration, Instant};

use rand::Rng;

/// Deterministic lower bound of the retry table (no jitter).
/// `consecutive_failures` is the count *after* the failure that triggered
/// the reschedule.
fn base_delay(consecutive_failures: u32) -> Duration {
    match consecutive_failures {
        0 => Duration::ZERO,
        1 => Duration::from_secs(20),
        2 => Duration::from_secs(5 * 60),
        3 => Duration::from_secs(15 * 60),
        4 => Duration::from_secs(30 * 60),
        5 => Duration::from_secs(60 * 60),
        _ => Duration::from_secs(120 * 60),
    }
}

/// Full retry interval including jitter. `n >= 2` adds `uniform(0, 60)`
/// seconds of jitter; `n` in `{0, 1}` is exact.
pub fn retry_interval(consecutive_failures: u32) -> Duration {
    let base = base_delay(consecutive_failures);
    if consecutive_failures < 2 {
        return base;
    }
    let jitter_secs: u64 = rand::thread_rng().gen_range(0..=60);
    base + Duration::from_secs(jitter_secs)
}

/// Rounds `instant` up to the next multiple of 10 seconds measured from
/// `epoch`, so scrapes scheduled close together land in the same upkeep
/// tick and can be multiscraped. `epoch` just needs to be any fixed
/// reference point shared by every caller in the process.
pub fn round_up_to_10s(epoch: Instant, instant: Instant) -> Instant {
    let elapsed = instant.saturating_duration_since(epoch);
    let secs = elapsed.as_secs();
    let rounded_secs = secs.div_ceil(10) * 10;
    epoch + Duration::from_secs(rounded_secs)
}
