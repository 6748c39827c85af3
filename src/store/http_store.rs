use super::EntityStore;
use crate::entities::{Account, Group};
use crate::error::{CoreError, CoreResult};
use crate::ids::{AccountId, GroupId, SessionHash};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// HTTP/JSON entity store client — same shape as the gateway's etcd/consul
/// clients: cheaply cloneable, `reqwest::Client` holds the connection pool
/// internally so cloning just bumps a reference count.
#[derive(Clone)]
pub struct HttpEntityStore {
    http: reqwest::Client,
    base_url: String,
}

impl HttpEntityStore {
    pub fn new(base_url: String, timeout: Duration) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Internal(format!("entity store: client build failed: {e}")))?;
        Ok(Self { http, base_url })
    }
}

#[derive(Deserialize)]
struct StickyAccountResponse {
    account_id: Option<String>,
}

#[async_trait]
impl EntityStore for HttpEntityStore {
    async fn get_group(&self, group_id: &GroupId) -> CoreResult<Option<Group>> {
        let url = format!("{}/groups/{}", self.base_url, group_id);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::Internal(format!("entity store: get_group failed: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let group: Group = resp
            .error_for_status()
            .map_err(|e| CoreError::Internal(format!("entity store: get_group status: {e}")))?
            .json()
            .await
            .map_err(|e| CoreError::Internal(format!("entity store: get_group decode: {e}")))?;
        Ok(Some(group))
    }

    async fn list_accounts_by_group(&self, group_id: &GroupId) -> CoreResult<Vec<Account>> {
        let url = format!("{}/groups/{}/accounts", self.base_url, group_id);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::Internal(format!("entity store: list_accounts failed: {e}")))?
            .error_for_status()
            .map_err(|e| CoreError::Internal(format!("entity store: list_accounts status: {e}")))?;
        resp.json()
            .await
            .map_err(|e| CoreError::Internal(format!("entity store: list_accounts decode: {e}")))
    }

    async fn pause_account_for_30m_limit(
        &self,
        account_id: &AccountId,
        cooldown_minutes: u32,
        count: u64,
    ) -> CoreResult<()> {
        let url = format!("{}/accounts/{}/pause", self.base_url, account_id);
        self.http
            .post(&url)
            .json(&serde_json::json!({
                "cooldown_minutes": cooldown_minutes,
                "reason": "30m_limit",
                "count": count,
            }))
            .send()
            .await
            .map_err(|e| CoreError::Internal(format!("entity store: pause_account failed: {e}")))?
            .error_for_status()
            .map_err(|e| CoreError::Internal(format!("entity store: pause_account status: {e}")))?;
        Ok(())
    }

    async fn bind_sticky_session(
        &self,
        group_id: &GroupId,
        session: &SessionHash,
        account_id: &AccountId,
    ) -> CoreResult<()> {
        let url = format!("{}/groups/{}/sticky/{}", self.base_url, group_id, session);
        self.http
            .put(&url)
            .json(&serde_json::json!({ "account_id": account_id.as_str() }))
            .send()
            .await
            .map_err(|e| CoreError::Internal(format!("entity store: bind_sticky failed: {e}")))?
            .error_for_status()
            .map_err(|e| CoreError::Internal(format!("entity store: bind_sticky status: {e}")))?;
        Ok(())
    }

    async fn get_sticky_account(
        &self,
        group_id: &GroupId,
        session: &SessionHash,
    ) -> CoreResult<Option<AccountId>> {
        let url = format!("{}/groups/{}/sticky/{}", self.base_url, group_id, session);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::Internal(format!("entity store: get_sticky failed: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let parsed: StickyAccountResponse = resp
            .error_for_status()
            .map_err(|e| CoreError::Internal(format!("entity store: get_sticky status: {e}")))?
            .json()
            .await
            .map_err(|e| CoreError::Internal(format!("entity store: get_sticky decode: {e}")))?;
        Ok(parsed.account_id.map(AccountId::from))
    }
}
