//! Key-family naming (§4.1). Centralized so every caller builds keys the
//! same way — a typo in one call site and a correct one elsewhere would
//! otherwise silently split what should be one logical key.
use crate::ids::{AccountId, SessionHash, UserId};

pub fn concurrency_account(account: &AccountId) -> String {
    format!("concurrency:account:{account}")
}

pub fn concurrency_user(user: &UserId) -> String {
    format!("concurrency:user:{user}")
}

pub fn slot_owner(account: &AccountId, slot: u32) -> String {
    format!("slot_owner:{account}:{slot}")
}

pub fn session_slot(account: &AccountId, session: &SessionHash) -> String {
    format!("session_slot:{account}:{session}")
}

pub fn session_mutex(account: &AccountId, session: &SessionHash) -> String {
    format!("session_mutex:{account}:{session}")
}

pub fn rpm_limit(account: &AccountId) -> String {
    format!("rpm_limit:{account}")
}

pub fn rate_30m(account: &AccountId) -> String {
    format!("rate_30m:{account}")
}

/// Short-window request counter feeding the weighted-load calculation
/// (§4.4 step 5 — `loadBalancing.windowMinutes`, default 10). Not named in
/// §4.1's key table; kept as its own family rather than overloading
/// `rpm_limit`/`rate_30m` so its window can be tuned independently.
pub fn load_window(account: &AccountId) -> String {
    format!("load_window:account:{account}")
}

/// Last response-end timestamp for a held session slot (§4.5 user-input
/// pacing step 8). Keyed by account+slot since the pacing wait is about the
/// physical slot's cadence, not any one session's.
pub fn slot_last_response(account: &AccountId, slot: u32) -> String {
    format!("slot_last_response:{account}:{slot}")
}

pub fn account_paused(account: &AccountId) -> String {
    format!("account_paused:{account}")
}

pub fn wait_user(user: &UserId) -> String {
    format!("concurrency:wait:{user}")
}

pub fn wait_account(account: &AccountId) -> String {
    format!("wait:account:{account}")
}

pub const CONCURRENCY_PATTERN: &str = "concurrency:*";
pub const SLOT_OWNER_PATTERN: &str = "slot_owner:*";
pub const SESSION_MUTEX_PATTERN: &str = "session_mutex:*";

/// All key-family glob patterns deleted by `clear_all` on startup (§3
/// lifecycles — runtime state is wiped since a restart implies no active
/// in-flight requests).
pub const ALL_RUNTIME_PATTERNS: &[&str] = &[
    "concurrency:*",
    "slot_owner:*",
    "session_slot:*",
    "session_mutex:*",
    "rpm_limit:*",
    "rate_30m:*",
    "load_window:*",
    "account_paused:*",
    "wait:*",
    "slot_last_response:*",
];
