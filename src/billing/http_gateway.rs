use super::{BillingGateway, BillingOutcome, BillingRequest};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// HTTP/JSON billing client, same shape as [`crate::store::HttpEntityStore`]
/// and the teacher's `EtcdClient`: cheaply cloneable, pooled `reqwest::Client`.
/// Any transport or decode failure is logged and folded into
/// `ServiceUnavailable` rather than propagated — billing is a soft dependency
/// here, the pipeline's own retry/backoff covers the retry.
#[derive(Clone)]
pub struct HttpBillingGateway {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBillingGateway {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("billing gateway: client build failed: {e}"))?;
        Ok(Self { http, base_url })
    }
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum CheckResponse {
    Ok,
    Forbidden { reason: String },
}

#[async_trait]
impl BillingGateway for HttpBillingGateway {
    async fn check_billing_eligibility(&self, request: BillingRequest<'_>) -> BillingOutcome {
        let url = format!("{}/billing/check", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "user_id": request.user_id,
                "api_key": request.api_key,
                "group_id": request.group_id,
                "subscription": request.subscription,
            }))
            .send()
            .await;

        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "billing gateway unreachable");
                return BillingOutcome::ServiceUnavailable;
            }
        };

        if !resp.status().is_success() {
            warn!(status = %resp.status(), "billing gateway returned error status");
            return BillingOutcome::ServiceUnavailable;
        }

        match resp.json::<CheckResponse>().await {
            Ok(CheckResponse::Ok) => BillingOutcome::Ok,
            Ok(CheckResponse::Forbidden { reason }) => BillingOutcome::Forbidden(reason),
            Err(e) => {
                warn!(error = %e, "billing gateway response decode failed");
                BillingOutcome::ServiceUnavailable
            }
        }
    }
}
