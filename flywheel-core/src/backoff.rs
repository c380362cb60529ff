use chrono::Duration;

use crate::types::BackoffStrategy;

/// Delay to add to `run_at` after a failed attempt, given how many attempts
/// have run so far. Pure; the store applies it inside the requeue
/// transaction.
///
/// `Exp` waits `2^attempts` seconds: 2s after the first failed attempt, 4s
/// after the second, and so on.
pub fn backoff_interval(attempts_so_far: i32, strategy: BackoffStrategy) -> Duration {
    match strategy {
        BackoffStrategy::None => Duration::zero(),
        BackoffStrategy::Exp => {
            // Capped so the delay stays representable; 2^40 seconds is
            // already far beyond any plausible schedule.
            let exponent = (attempts_so_far.max(0) as u32).min(40);
            Duration::seconds(2_i64.pow(exponent))
        }
    }
}
