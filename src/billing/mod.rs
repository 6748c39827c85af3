//! Billing contract (§6), consumed once by middleware before entry and once
//! more at pipeline step [2] after waiting for a user slot — balance can be
//! exhausted while queued.

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingOutcome {
    Ok,
    ServiceUnavailable,
    Forbidden(String),
}

#[derive(Debug, Clone)]
pub struct BillingRequest<'a> {
    pub user_id: &'a str,
    pub api_key: &'a str,
    pub group_id: &'a str,
    pub subscription: Option<&'a str>,
}

/// `CheckBillingEligibility(user, apiKey, group, subscription) → ok |
/// ServiceUnavailable | Forbidden(reason)` (§6). A transport failure talking
/// to the billing service also collapses into `ServiceUnavailable` — the
/// caller treats "can't tell" the same as "explicitly unavailable".
#[async_trait]
pub trait BillingGateway: Send + Sync {
    async fn check_billing_eligibility(&self, request: BillingRequest<'_>) -> BillingOutcome;
}

pub mod http_gateway;
pub mod memory_gateway;

pub use http_gateway::HttpBillingGateway;
pub use memory_gateway::InMemoryBillingGateway;
