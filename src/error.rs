use std::fmt;

/// Error kinds surfaced by the admission core, matching the taxonomy in
/// the response-mapping table: each variant carries enough information for
/// the caller to pick an HTTP status and a machine-readable `kind` string.
#[derive(Debug)]
#[allow(dead_code)]
pub enum CoreError {
    /// Empty body, missing model, or a model not in the group's allow-list.
    InvalidRequest(String),
    /// Billing quota exhausted.
    Billing(String),
    /// Billing check itself unreachable/erroring.
    BillingServiceUnavailable,
    /// Wait queue full, concurrency wait timed out, or upstream 429 budget exhausted.
    RateLimited(RateLimitedReason),
    /// Client-type restriction (claude-code-only group with no fallback).
    AccessDenied(String),
    /// Upstream error budget exhausted (401/403/500/502/503/504).
    Upstream(String),
    /// Upstream 529 budget exhausted.
    Overloaded,
    /// No schedulable account could be found for the request.
    NoSchedulableAccount,
    /// The K/V store's atomic script itself failed (script error, connection
    /// failure). The only truly exceptional path in the core (§9).
    Internal(String),
}

#[derive(Debug, Clone, Copy)]
pub enum RateLimitedReason {
    UserWaitQueueFull,
    AccountWaitQueueFull,
    ConcurrencyTimeout,
    UpstreamRateLimitExhausted,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            CoreError::Billing(msg) => write!(f, "billing error: {msg}"),
            CoreError::BillingServiceUnavailable => write!(f, "billing service unavailable"),
            CoreError::RateLimited(reason) => write!(f, "rate limited: {reason:?}"),
            CoreError::AccessDenied(msg) => write!(f, "access denied: {msg}"),
            CoreError::Upstream(msg) => write!(f, "upstream error: {msg}"),
            CoreError::Overloaded => write!(f, "upstream overloaded"),
            CoreError::NoSchedulableAccount => write!(f, "no schedulable account"),
            CoreError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl CoreError {
    /// `(http_status, kind)` pair per §7's response table. The admission
    /// pipeline separately decides whether to deliver this as a JSON body
    /// or an SSE `error` event, based on whether the response already
    /// started streaming.
    pub fn user_response(&self) -> (u16, &'static str) {
        match self {
            CoreError::InvalidRequest(_) => (400, "invalid_request_error"),
            CoreError::Billing(_) => (403, "billing_error"),
            CoreError::BillingServiceUnavailable => (503, "billing_service_error"),
            CoreError::RateLimited(_) => (429, "rate_limit_error"),
            CoreError::AccessDenied(_) => (403, "access_denied"),
            CoreError::Upstream(_) => (502, "upstream_error"),
            CoreError::Overloaded => (503, "overloaded_error"),
            CoreError::NoSchedulableAccount => (503, "api_error"),
            CoreError::Internal(_) => (500, "api_error"),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
