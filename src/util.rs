// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Server status codes and retry helpers

use std::time::Duration;

use rand::Rng;

/// Server status code
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 200,
    InvalidRoute = 302,
    ShouldRetry = 310,
    InvalidArgument = 400,
    NotFound = 404,
    StreamTooLarge = 413,
    FlowControl = 429,
    InternalError = 500,
    Unavailable = 503,
}

impl StatusCode {
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }
}

#[inline]
pub fn is_ok(code: u32) -> bool {
    code == StatusCode::Ok.as_u32()
}

/// Codes the dispatchers may recover from by retrying the failed subset.
#[inline]
pub fn is_retriable(code: u32) -> bool {
    code == StatusCode::InvalidRoute.as_u32()
        || code == StatusCode::ShouldRetry.as_u32()
        || code == StatusCode::FlowControl.as_u32()
}

#[inline]
pub fn is_flow_control(code: u32) -> bool {
    code == StatusCode::FlowControl.as_u32()
}

/// Whether the server is telling us our cached route is stale.
///
/// Old servers report a stale route as `InvalidArgument` with a "table not
/// found" message instead of `InvalidRoute`, so both are honored.
#[inline]
pub fn should_refresh(code: u32, msg: &str) -> bool {
    code == StatusCode::InvalidRoute.as_u32()
        || (code == StatusCode::InvalidArgument.as_u32()
            && msg.contains("Table")
            && msg.contains("not found"))
}

const RETRY_BASE_DELAY_MS: u64 = 100;
const RETRY_MAX_DELAY_MS: u64 = 3_000;

/// Exponential backoff with full jitter, capped at 3s.
pub fn retry_delay(attempt: usize) -> Duration {
    let exp = RETRY_BASE_DELAY_MS
        .saturating_mul(1u64 << attempt.min(10) as u64)
        .min(RETRY_MAX_DELAY_MS);
    let jittered = rand::rng().random_range(0..=exp);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_codes() {
        assert!(is_retriable(StatusCode::InvalidRoute.as_u32()));
        assert!(is_retriable(StatusCode::ShouldRetry.as_u32()));
        assert!(is_retriable(StatusCode::FlowControl.as_u32()));
        assert!(!is_retriable(StatusCode::InternalError.as_u32()));
        assert!(!is_retriable(StatusCode::InvalidArgument.as_u32()));
    }

    #[test]
    fn test_should_refresh() {
        assert!(should_refresh(302, ""));
        assert!(should_refresh(400, "Table test_table not found"));
        assert!(!should_refresh(400, "bad sql"));
        assert!(!should_refresh(500, "Table test_table not found"));
    }

    #[test]
    fn test_retry_delay_capped() {
        for attempt in 0..16 {
            assert!(retry_delay(attempt) <= Duration::from_millis(RETRY_MAX_DELAY_MS));
        }
    }
}
