use crate::ids::{AccountId, GroupId, ModelCategory, RequestId, SessionHash, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;

/// Read-only snapshot of an upstream provider account (§3).
///
/// `schedulable` is computed upstream of this crate (paused / rate-limited /
/// overloaded / expired / archived flags all collapse into this one bool)
/// so the selector never has to know the individual reasons an account is
/// unusable — it only has to respect the invariant that an unschedulable
/// account never receives new requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub platform: String,
    /// Lower is preferred.
    pub priority: u32,
    pub concurrency_limit: u32,
    pub max_rpm: u32,
    pub max_30m_requests: u32,
    pub cooldown_minutes: u32,
    pub schedulable: bool,
}

impl Account {
    /// Total slot count `T = ceil(4*C/3)` (§3, §4.3).
    pub fn total_slots(&self) -> u32 {
        total_slots(self.concurrency_limit)
    }

    /// Whether this account is a subscription-backed seat rather than a
    /// pay-per-token API key (§4.5 user-input pacing gate: pacing only
    /// applies to subscription accounts). `platform` is an opaque string
    /// from the entity store; subscription platforms are conventionally
    /// suffixed `_subscription`.
    pub fn is_subscription_account(&self) -> bool {
        self.platform.ends_with("_subscription") || self.platform == "subscription"
    }

    /// Whether this account belongs to the secondary (auxiliary) provider
    /// family rather than the primary one, for the per-family failover
    /// budget (§4.5, §6). Same opaque-`platform`-suffix convention as
    /// [`is_subscription_account`].
    pub fn is_secondary_family(&self) -> bool {
        self.platform.ends_with("_secondary")
            || self.platform.ends_with("_auxiliary")
            || self.platform == "secondary"
            || self.platform == "auxiliary"
    }
}

pub fn total_slots(concurrency_limit: u32) -> u32 {
    (4 * concurrency_limit).div_ceil(3)
}

/// A named bundle of accounts with shared policy (§3, GLOSSARY).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub platform: String,
    pub claude_code_only: bool,
    pub fallback_group_id: Option<GroupId>,
    /// Empty means all models allowed.
    pub allowed_models: HashSet<String>,
    /// request-model -> upstream-model.
    pub model_mapping: HashMap<String, String>,
}

impl Group {
    pub fn is_model_allowed(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.contains(model)
    }

    /// Applies `model_mapping`, returning the upstream-facing model name.
    /// Mapping happens upstream of selection and mutates the effective
    /// request model (§4.4 step 2).
    pub fn map_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_mapping
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }
}

/// Ephemeral per-request context (§3). Carries everything the admission
/// pipeline and its collaborators need to thread through the state machine,
/// plus the resources accumulated along the way so they can all be released
/// from a single place on exit (§7 leakage prevention).
pub struct RequestContext {
    pub request_id: RequestId,
    pub user_id: UserId,
    pub group_id: GroupId,
    /// Mutated in place as group model-mapping and failover change the
    /// effective upstream model.
    pub model: String,
    pub model_category: ModelCategory,
    pub is_stream: bool,
    pub is_tool_result: bool,
    pub session_hash: SessionHash,
    pub stream_started: bool,
    pub failed_accounts: HashSet<AccountId>,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(
        user_id: UserId,
        group_id: GroupId,
        model: String,
        model_category: ModelCategory,
        is_stream: bool,
        is_tool_result: bool,
        session_hash: SessionHash,
    ) -> Self {
        Self {
            request_id: RequestId::generate(),
            user_id,
            group_id,
            model,
            model_category,
            is_stream,
            is_tool_result,
            session_hash,
            stream_started: false,
            failed_accounts: HashSet::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// A user-initiated input, not a tool result (§4.5 user-input pacing gate).
    pub fn is_user_input(&self) -> bool {
        !self.is_tool_result
    }
}
