//! Forwarder contract (§6): the last hop to the upstream provider is
//! explicitly outside this crate's scope — the admission pipeline only needs
//! something that implements [`Forwarder`] to drive step [9] of the state
//! machine and classify the result for the failover loop at step [12].

use crate::entities::{Account, RequestContext};
use async_trait::async_trait;

/// A successful round trip. Opaque to the core: the pipeline only needs to
/// know forwarding succeeded so it can move on to post-accounting.
#[derive(Debug, Clone)]
pub struct ForwardResult {
    pub status_code: u16,
}

/// An upstream error the failover loop should retry on another account
/// (§4.5 step 12, §7): 401/403/500/502/503/504 on the response-mapping
/// table, or 529 specifically for the overloaded case.
#[derive(Debug, Clone)]
pub struct UpstreamFailoverError {
    pub status_code: u16,
}

/// Any other failure is terminal for the request — no account switch.
#[derive(Debug, Clone)]
pub struct ForwarderError(pub String);

impl std::fmt::Display for ForwarderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "forwarder error: {}", self.0)
    }
}

impl std::error::Error for ForwarderError {}

pub enum ForwardOutcome {
    Success(ForwardResult),
    Failover(UpstreamFailoverError),
    Other(ForwarderError),
}

/// `Forward(ctx, request, account) → ForwardResult | UpstreamFailoverError |
/// OtherError` (§6). Implementations live outside this crate (an HTTP client
/// speaking the upstream's actual wire protocol); the core only needs the
/// three-way outcome to drive its own state machine.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, ctx: &RequestContext, account: &Account) -> ForwardOutcome;
}

/// Test double that always succeeds, for exercising the pipeline without a
/// real upstream.
pub struct NullForwarder {
    pub status_code: u16,
}

impl Default for NullForwarder {
    fn default() -> Self {
        Self { status_code: 200 }
    }
}

#[async_trait]
impl Forwarder for NullForwarder {
    async fn forward(&self, _ctx: &RequestContext, _account: &Account) -> ForwardOutcome {
        ForwardOutcome::Success(ForwardResult {
            status_code: self.status_code,
        })
    }
}

/// Test double that always reports a failover-eligible upstream error.
pub struct FailingForwarder {
    pub status_code: u16,
}

#[async_trait]
impl Forwarder for FailingForwarder {
    async fn forward(&self, _ctx: &RequestContext, _account: &Account) -> ForwardOutcome {
        ForwardOutcome::Failover(UpstreamFailoverError {
            status_code: self.status_code,
        })
    }
}

/// Admission step [4]: intercepts requests that should never reach the
/// upstream at all (warmup pings, suggestion-mode completions) once an
/// account has been chosen but before any session resource is held. Like
/// [`Forwarder`], the real policy deciding *which* requests are synthetic
/// lives outside this crate; the core only needs the yes/no hook.
#[async_trait]
pub trait SyntheticResponder: Send + Sync {
    async fn intercept(&self, ctx: &RequestContext, account: &Account) -> Option<ForwardResult>;
}

/// Default responder: never intercepts.
pub struct NullSyntheticResponder;

#[async_trait]
impl SyntheticResponder for NullSyntheticResponder {
    async fn intercept(&self, _ctx: &RequestContext, _account: &Account) -> Option<ForwardResult> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{GroupId, ModelCategory, SessionHash, UserId};

    fn ctx() -> RequestContext {
        RequestContext::new(
            UserId::from("u1"),
            GroupId::from("g1"),
            "claude-3-haiku".to_string(),
            ModelCategory::Light,
            false,
            false,
            SessionHash::from("s1"),
        )
    }

    fn account() -> Account {
        Account {
            id: crate::ids::AccountId::from("a1".to_string()),
            platform: "test".to_string(),
            priority: 1,
            concurrency_limit: 3,
            max_rpm: 100,
            max_30m_requests: 100,
            cooldown_minutes: 10,
            schedulable: true,
        }
    }

    #[tokio::test]
    async fn null_forwarder_always_succeeds() {
        let fwd = NullForwarder::default();
        match fwd.forward(&ctx(), &account()).await {
            ForwardOutcome::Success(r) => assert_eq!(r.status_code, 200),
            _ => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn failing_forwarder_reports_failover_error() {
        let fwd = FailingForwarder { status_code: 529 };
        match fwd.forward(&ctx(), &account()).await {
            ForwardOutcome::Failover(e) => assert_eq!(e.status_code, 529),
            _ => panic!("expected failover error"),
        }
    }
}
