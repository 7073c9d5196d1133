use chrono::{DateTime, Duration, Utc};

/// Clamps `ttl` (milliseconds) to `max` (milliseconds, `< 1` = unlimited).
///
/// | max | ttl         | result |
/// |-----|-------------|--------|
/// | < 1 | any         | ttl    |
/// | > 0 | < 0 (never) | max    |
/// | > 0 | > max       | max    |
/// | > 0 | 1..=max     | ttl    |
///
/// `ttl = 0` must be resolved to the default before clamping.
pub fn clamp_max_ttl(ttl: i64, max: i64) -> i64 {
    if max < 1 {
        return ttl;
    }
    if ttl > max || ttl < 0 {
        return max;
    }
    ttl
}

/// True if TTL `a` is longer than TTL `b`. Negative values are infinite.
pub fn ttl_greater(a: i64, b: i64) -> bool {
    match (a < 0, b < 0) {
        (true, true) => false,
        (true, false) => true,
        (false, true) => false,
        (false, false) => a > b,
    }
}

/// Expiry instant of a token, `None` if it never expires.
pub fn expires_at(created_at: DateTime<Utc>, ttl: i64) -> Option<DateTime<Utc>> {
    if ttl < 0 {
        return None;
    }
    Some(created_at + Duration::milliseconds(ttl))
}

/// Resolves a requested TTL: 0 means the default, then the maximum applies.
pub(crate) fn resolve_ttl(requested: i64, default_ttl: i64, max_ttl: i64) -> i64 {
    let ttl = if requested == 0 { default_ttl } else { requested };
    clamp_max_ttl(ttl, max_ttl)
}
