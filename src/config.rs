//! Process-scope runtime configuration.
//!
//! All timeout/cooldown constants referenced by `agent_runtime` are fields
//! here rather than free-standing constants, so they can be overridden by
//! environment variables at process start (spec §9's "replace global
//! mutable config with a captured struct" design note). Parsing is a pure
//! function, mirroring `llm::LlmConfig::from_env`.

use std::time::Duration;

/// Primary manager's reserved `agentId`, configurable so deployments can
/// pick their own tenant-facing id.
pub const DEFAULT_PRIMARY_MANAGER_ID: &str = "primary";

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeOptions {
    pub max_prompt_dispatch_attempts: u32,
    pub prompt_dispatch_timeout: Duration,
    pub proactive_compaction_threshold: f64,
    pub proactive_compaction_cooldown: Duration,
    pub compaction_timeout: Duration,
    pub overflow_recovery_cooldown: Duration,
    pub health_check_interval: Duration,
    pub streaming_inactivity_timeout: Duration,
    pub primary_manager_id: String,
    pub data_dir: std::path::PathBuf,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_prompt_dispatch_attempts: 2,
            prompt_dispatch_timeout: Duration::from_millis(120_000),
            proactive_compaction_threshold: 0.85,
            proactive_compaction_cooldown: Duration::from_millis(60_000),
            compaction_timeout: Duration::from_millis(120_000),
            overflow_recovery_cooldown: Duration::from_millis(60_000),
            health_check_interval: Duration::from_millis(15_000),
            streaming_inactivity_timeout: Duration::from_millis(300_000),
            primary_manager_id: DEFAULT_PRIMARY_MANAGER_ID.to_string(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> std::path::PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    std::path::PathBuf::from(home).join(".swarm-ide")
}

impl RuntimeOptions {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_prompt_dispatch_attempts: env_u32(
                "SWARM_MAX_PROMPT_DISPATCH_ATTEMPTS",
                defaults.max_prompt_dispatch_attempts,
            ),
            prompt_dispatch_timeout: env_duration_ms(
                "SWARM_PROMPT_DISPATCH_TIMEOUT_MS",
                defaults.prompt_dispatch_timeout,
            ),
            proactive_compaction_threshold: env_f64(
                "SWARM_PROACTIVE_COMPACTION_THRESHOLD",
                defaults.proactive_compaction_threshold,
            ),
            proactive_compaction_cooldown: env_duration_ms(
                "SWARM_PROACTIVE_COMPACTION_COOLDOWN_MS",
                defaults.proactive_compaction_cooldown,
            ),
            compaction_timeout: env_duration_ms(
                "SWARM_COMPACTION_TIMEOUT_MS",
                defaults.compaction_timeout,
            ),
            overflow_recovery_cooldown: env_duration_ms(
                "SWARM_OVERFLOW_RECOVERY_COOLDOWN_MS",
                defaults.overflow_recovery_cooldown,
            ),
            health_check_interval: env_duration_ms(
                "SWARM_HEALTH_CHECK_INTERVAL_MS",
                defaults.health_check_interval,
            ),
            streaming_inactivity_timeout: env_duration_ms(
                "SWARM_STREAMING_INACTIVITY_TIMEOUT_MS",
                defaults.streaming_inactivity_timeout,
            ),
            primary_manager_id: std::env::var("SWARM_PRIMARY_MANAGER_ID")
                .unwrap_or(defaults.primary_manager_id),
            data_dir: std::env::var("SWARM_DATA_DIR")
                .map(std::path::PathBuf::from)
                .unwrap_or(defaults.data_dir),
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let opts = RuntimeOptions::default();
        assert_eq!(opts.max_prompt_dispatch_attempts, 2);
        assert_eq!(opts.prompt_dispatch_timeout, Duration::from_millis(120_000));
        assert!((opts.proactive_compaction_threshold - 0.85).abs() < f64::EPSILON);
        assert_eq!(opts.health_check_interval, Duration::from_millis(15_000));
        assert_eq!(
            opts.streaming_inactivity_timeout,
            Duration::from_millis(300_000)
        );
    }

    #[test]
    fn from_env_falls_back_to_defaults_when_unset() {
        std::env::remove_var("SWARM_MAX_PROMPT_DISPATCH_ATTEMPTS");
        let opts = RuntimeOptions::from_env();
        assert_eq!(opts.max_prompt_dispatch_attempts, 2);
    }
}
