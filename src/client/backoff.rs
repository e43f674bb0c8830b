//! Reconnect delay policy.

/// Delay before reconnect attempt `attempt` (1-based):
/// `min(initial * factor^(attempt - 1), max)`.
pub fn delay_for_attempt(attempt: u32, initial_ms: u64, factor: f64, max_ms: u64) -> u64 {
    if attempt <= 1 {
        return initial_ms.min(max_ms);
    }
    let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
    let scaled = (initial_ms as f64) * factor.powi(exponent);
    if !scaled.is_finite() || scaled >= max_ms as f64 {
        return max_ms;
    }
    (scaled as u64).min(max_ms)
}
