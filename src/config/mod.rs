pub mod types;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl AdmissionConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. When the file does not
    /// exist, built-in defaults are used — allowing the core to start with
    /// zero configuration for local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: AdmissionConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            AdmissionConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!("loaded admission core configuration");
        Ok(config)
    }

    /// Apply environment variable overrides for connection/infra settings.
    /// Tuning knobs (TTLs, backoff, pacing) are managed via the config file;
    /// only the settings that differ per deployment environment (redis URL,
    /// entity store / billing endpoints, admin listen address) are
    /// overridable from the environment.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ADMISSION_REDIS_URL") {
            self.redis.url = v;
        }
        if let Ok(v) = std::env::var("ADMISSION_ENTITY_STORE_URL") {
            self.entity_store.base_url = v;
        }
        if let Ok(v) = std::env::var("ADMISSION_BILLING_URL") {
            self.billing.base_url = v;
        }
        if let Ok(v) = std::env::var("ADMISSION_ADMIN_LISTEN") {
            self.admin.listen = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.redis.url.is_empty() {
            anyhow::bail!("redis.url cannot be empty");
        }
        if self.concurrency.haiku_max_parallel == 0 {
            anyhow::bail!("concurrency.haiku_max_parallel must be at least 1");
        }
        if self.backoff.multiplier <= 1.0 {
            anyhow::bail!("backoff.multiplier must be greater than 1.0");
        }
        if self.user_input_pacing.min_seconds > self.user_input_pacing.max_seconds {
            anyhow::bail!("user_input_pacing.min_seconds cannot exceed max_seconds");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AdmissionConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_empty_redis_url() {
        let mut cfg = AdmissionConfig::default();
        cfg.redis.url.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_pacing_bounds() {
        let mut cfg = AdmissionConfig::default();
        cfg.user_input_pacing.min_seconds = 5.0;
        cfg.user_input_pacing.max_seconds = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_toml_file() {
        let dir = std::env::temp_dir().join(format!("admission-core-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[redis]\nurl = \"redis://example:6380\"\n").unwrap();
        let cfg = AdmissionConfig::load(&path).unwrap();
        assert_eq!(cfg.redis.url, "redis://example:6380");
        std::fs::remove_dir_all(&dir).ok();
    }
}
