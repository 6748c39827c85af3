use serde::{Deserialize, Serialize};

/// Top-level admission-core configuration (§6). Everything here is
/// infrastructure/tuning — account, group, and billing data live in the
/// external entity store, never in this file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub redis: RedisConfig,
    pub concurrency: ConcurrencyConfig,
    pub wait_queue: WaitQueueConfig,
    pub backoff: BackoffConfig,
    pub failover: FailoverConfig,
    pub load_balancing: LoadBalancingConfig,
    pub user_input_pacing: UserInputPacingConfig,
    pub entity_store: EntityStoreConfig,
    pub billing: BillingConfig,
    pub admin: AdminConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            wait_queue: WaitQueueConfig::default(),
            backoff: BackoffConfig::default(),
            failover: FailoverConfig::default(),
            load_balancing: LoadBalancingConfig::default(),
            user_input_pacing: UserInputPacingConfig::default(),
            entity_store: EntityStoreConfig::default(),
            billing: BillingConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Slot/mutex TTLs (§4.1, §6). `slot_ttl` bounds how long a crashed holder's
/// entry survives before the next acquirer's prune reclaims it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub slot_ttl_minutes: u64,
    pub session_mutex_ttl_seconds: u64,
    pub session_binding_ttl_minutes: u64,
    /// Max concurrent sessions sharing one light-model slot (§4.3 step 6).
    pub haiku_max_parallel: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            slot_ttl_minutes: 10,
            session_mutex_ttl_seconds: 30,
            session_binding_ttl_minutes: 60,
            haiku_max_parallel: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitQueueConfig {
    /// User-queue cap is derived per request as `userConcurrency + 20`
    /// (§4.5); this config only bounds the account-level queue.
    pub max_account_wait: u32,
    pub wait_entry_ttl_seconds: u64,
    pub max_concurrency_wait_seconds: u64,
    pub ping_interval_seconds: u64,
}

impl Default for WaitQueueConfig {
    fn default() -> Self {
        Self {
            max_account_wait: 200,
            wait_entry_ttl_seconds: 120,
            max_concurrency_wait_seconds: 300,
            ping_interval_seconds: 15,
        }
    }
}

/// Exponential backoff with jitter between retry attempts (§4.2, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ratio: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            max_ms: 2000,
            multiplier: 1.5,
            jitter_ratio: 0.2,
        }
    }
}

/// Failover budget (§4.5 step 11): how many distinct accounts one request
/// may try before giving up, keyed on the failing account's provider family
/// rather than stream state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Budget while switching among primary-family accounts.
    pub max_account_switches: u32,
    /// Budget while switching among secondary/auxiliary-family accounts.
    pub max_account_switches_secondary: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_account_switches: 10,
            max_account_switches_secondary: 3,
        }
    }
}

/// Weighted load-aware account sort (§4.4 step 5-6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancingConfig {
    pub enabled: bool,
    /// Penalty applied per priority tier below the top, as a percentage of
    /// `base` (the top account's raw request count).
    pub offset_percent: f64,
    pub window_minutes: u64,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            offset_percent: 10.0,
            window_minutes: 10,
        }
    }
}

/// User-input pacing (§4.5 step 8): a deliberate delay before forwarding the
/// first chunk of a fresh user turn, giving a client's own retry/dedup logic
/// room to settle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserInputPacingConfig {
    pub min_seconds: f64,
    pub max_seconds: f64,
}

impl Default for UserInputPacingConfig {
    fn default() -> Self {
        Self {
            min_seconds: 10.0,
            max_seconds: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityStoreConfig {
    pub base_url: String,
    pub request_timeout_seconds: u64,
}

impl Default for EntityStoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4000".to_string(),
            request_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub base_url: String,
    pub request_timeout_seconds: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4100".to_string(),
            request_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub listen: String,
    pub cleanup_interval_seconds: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9091".to_string(),
            cleanup_interval_seconds: 60,
        }
    }
}
