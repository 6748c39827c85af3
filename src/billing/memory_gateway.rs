use super::{BillingGateway, BillingOutcome, BillingRequest};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory billing fake: defaults every user to `Ok`, with per-user
/// overrides for negative-path tests.
#[derive(Default)]
pub struct InMemoryBillingGateway {
    overrides: Mutex<HashMap<String, BillingOutcome>>,
}

impl InMemoryBillingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_outcome(&self, user_id: &str, outcome: BillingOutcome) {
        self.overrides
            .lock()
            .unwrap()
            .insert(user_id.to_string(), outcome);
    }
}

#[async_trait]
impl BillingGateway for InMemoryBillingGateway {
    async fn check_billing_eligibility(&self, request: BillingRequest<'_>) -> BillingOutcome {
        self.overrides
            .lock()
            .unwrap()
            .get(request.user_id)
            .cloned()
            .unwrap_or(BillingOutcome::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_to_ok() {
        let gw = InMemoryBillingGateway::new();
        let outcome = gw
            .check_billing_eligibility(BillingRequest {
                user_id: "u1",
                api_key: "k1",
                group_id: "g1",
                subscription: None,
            })
            .await;
        assert_eq!(outcome, BillingOutcome::Ok);
    }

    #[tokio::test]
    async fn override_is_applied_per_user() {
        let gw = InMemoryBillingGateway::new();
        gw.set_outcome("u1", BillingOutcome::Forbidden("no_credit".to_string()));
        let outcome = gw
            .check_billing_eligibility(BillingRequest {
                user_id: "u1",
                api_key: "k1",
                group_id: "g1",
                subscription: None,
            })
            .await;
        assert_eq!(outcome, BillingOutcome::Forbidden("no_credit".to_string()));
    }
}
