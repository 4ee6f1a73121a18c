//! Environment-driven configuration (spec.md §6).
//!
//! Every variable enumerated in the spec's Configuration section gets a
//! `env_vars` constant plus a typed getter with a documented default,
//! following the parse-with-fallback pattern used throughout this stack.

/// Default provider endpoints.
pub mod endpoints {
    pub const DASHSCOPE: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
    pub const VOLCENGINE_ARK: &str = "https://ark.cn-beijing.volces.com/api/v3";
}

/// Environment variable names, grouped the way spec.md §6 groups them.
pub mod env_vars {
    // Rate limits
    pub const DASHSCOPE_QPM_LIMIT: &str = "DASHSCOPE_QPM_LIMIT";
    pub const DASHSCOPE_CONCURRENT_LIMIT: &str = "DASHSCOPE_CONCURRENT_LIMIT";
    pub const DASHSCOPE_RATE_LIMITING_ENABLED: &str = "DASHSCOPE_RATE_LIMITING_ENABLED";
    pub const KIMI_QPM_LIMIT: &str = "KIMI_QPM_LIMIT";
    pub const KIMI_CONCURRENT_LIMIT: &str = "KIMI_CONCURRENT_LIMIT";
    pub const DOUBAO_QPM_LIMIT: &str = "DOUBAO_QPM_LIMIT";
    pub const DOUBAO_CONCURRENT_LIMIT: &str = "DOUBAO_CONCURRENT_LIMIT";
    pub const DEEPSEEK_VOLCENGINE_QPM_LIMIT: &str = "DEEPSEEK_VOLCENGINE_QPM_LIMIT";
    pub const DEEPSEEK_VOLCENGINE_CONCURRENT_LIMIT: &str = "DEEPSEEK_VOLCENGINE_CONCURRENT_LIMIT";

    // Load balancing
    pub const LOAD_BALANCING_ENABLED: &str = "LOAD_BALANCING_ENABLED";
    pub const LOAD_BALANCING_STRATEGY: &str = "LOAD_BALANCING_STRATEGY";
    pub const LOAD_BALANCING_WEIGHTS: &str = "LOAD_BALANCING_WEIGHTS";
    pub const LOAD_BALANCING_RATE_LIMITING_ENABLED: &str = "LOAD_BALANCING_RATE_LIMITING_ENABLED";

    // Token tracker
    pub const TOKEN_TRACKER_ENABLED: &str = "TOKEN_TRACKER_ENABLED";
    pub const TOKEN_TRACKER_BATCH_SIZE: &str = "TOKEN_TRACKER_BATCH_SIZE";
    pub const TOKEN_TRACKER_BATCH_INTERVAL: &str = "TOKEN_TRACKER_BATCH_INTERVAL";
    pub const TOKEN_TRACKER_MAX_BUFFER_SIZE: &str = "TOKEN_TRACKER_MAX_BUFFER_SIZE";

    // Diagram cache
    pub const DIAGRAM_CACHE_TTL: &str = "DIAGRAM_CACHE_TTL";
    pub const DIAGRAM_SYNC_INTERVAL: &str = "DIAGRAM_SYNC_INTERVAL";
    pub const DIAGRAM_SYNC_BATCH_SIZE: &str = "DIAGRAM_SYNC_BATCH_SIZE";
    pub const DIAGRAM_MAX_PER_USER: &str = "DIAGRAM_MAX_PER_USER";
    pub const DIAGRAM_MAX_SPEC_SIZE_KB: &str = "DIAGRAM_MAX_SPEC_SIZE_KB";

    // Database pool
    pub const DATABASE_POOL_SIZE: &str = "DATABASE_POOL_SIZE";
    pub const DATABASE_MAX_OVERFLOW: &str = "DATABASE_MAX_OVERFLOW";

    // Connection strings
    pub const REDIS_URL: &str = "REDIS_URL";
    pub const DATABASE_URL: &str = "DATABASE_URL";

    // Worker identity, used to tag rate-limiter sorted-set entries for
    // observability (SPEC_FULL §C.2).
    pub const WORKER_ID: &str = "WORKER_ID";

    // Provider API keys
    pub const DASHSCOPE_API_KEY: &str = "DASHSCOPE_API_KEY";
    pub const VOLCENGINE_API_KEY: &str = "VOLCENGINE_API_KEY";
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Rate-limit configuration, read once at startup.
pub mod rate_limits {
    use super::{env_bool, env_parsed, env_vars::*};

    pub fn dashscope_qpm_limit() -> u32 {
        env_parsed(DASHSCOPE_QPM_LIMIT, 200)
    }

    pub fn dashscope_concurrent_limit() -> u32 {
        env_parsed(DASHSCOPE_CONCURRENT_LIMIT, 50)
    }

    pub fn dashscope_rate_limiting_enabled() -> bool {
        env_bool(DASHSCOPE_RATE_LIMITING_ENABLED, true)
    }

    pub fn kimi_qpm_limit() -> u32 {
        env_parsed(KIMI_QPM_LIMIT, 100)
    }

    pub fn kimi_concurrent_limit() -> u32 {
        env_parsed(KIMI_CONCURRENT_LIMIT, 20)
    }

    pub fn doubao_qpm_limit() -> u32 {
        env_parsed(DOUBAO_QPM_LIMIT, 100)
    }

    pub fn doubao_concurrent_limit() -> u32 {
        env_parsed(DOUBAO_CONCURRENT_LIMIT, 20)
    }

    pub fn deepseek_volcengine_qpm_limit() -> u32 {
        env_parsed(DEEPSEEK_VOLCENGINE_QPM_LIMIT, 100)
    }

    pub fn deepseek_volcengine_concurrent_limit() -> u32 {
        env_parsed(DEEPSEEK_VOLCENGINE_CONCURRENT_LIMIT, 20)
    }
}

/// Load balancing configuration.
pub mod load_balancing {
    use super::{env_bool, env_vars::*};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Strategy {
        Weighted,
        RoundRobin,
        Random,
    }

    pub fn enabled() -> bool {
        env_bool(LOAD_BALANCING_ENABLED, true)
    }

    pub fn rate_limit_aware() -> bool {
        env_bool(LOAD_BALANCING_RATE_LIMITING_ENABLED, false)
    }

    pub fn strategy() -> Strategy {
        match std::env::var(LOAD_BALANCING_STRATEGY)
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "round_robin" => Strategy::RoundRobin,
            "random" => Strategy::Random,
            _ => Strategy::Weighted,
        }
    }

    /// Per-physical-model weights for the `weighted` strategy, parsed from
    /// a `name:weight,name:weight` list. Missing or malformed entries are
    /// skipped rather than failing startup.
    pub fn weights() -> std::collections::HashMap<String, f64> {
        std::env::var(LOAD_BALANCING_WEIGHTS)
            .unwrap_or_default()
            .split(',')
            .filter_map(|entry| {
                let (name, weight) = entry.split_once(':')?;
                Some((name.trim().to_string(), weight.trim().parse().ok()?))
            })
            .collect()
    }
}

/// Token tracker configuration (§4.7).
pub mod token_tracker {
    use super::{env_bool, env_parsed, env_vars::*};

    pub fn enabled() -> bool {
        env_bool(TOKEN_TRACKER_ENABLED, true)
    }

    pub fn batch_size() -> usize {
        env_parsed(TOKEN_TRACKER_BATCH_SIZE, 1000)
    }

    pub fn batch_interval_secs() -> u64 {
        env_parsed(TOKEN_TRACKER_BATCH_INTERVAL, 300)
    }

    pub fn max_buffer_size() -> usize {
        env_parsed(TOKEN_TRACKER_MAX_BUFFER_SIZE, 10_000)
    }
}

/// Diagram cache configuration (§4.8).
pub mod diagram_cache {
    use super::{env_parsed, env_vars::*};

    pub fn cache_ttl_secs() -> u64 {
        env_parsed(DIAGRAM_CACHE_TTL, 604_800)
    }

    pub fn sync_interval_secs() -> u64 {
        env_parsed(DIAGRAM_SYNC_INTERVAL, 300)
    }

    pub fn sync_batch_size() -> usize {
        env_parsed(DIAGRAM_SYNC_BATCH_SIZE, 100)
    }

    pub fn max_per_user() -> usize {
        env_parsed(DIAGRAM_MAX_PER_USER, 20)
    }

    pub fn max_spec_size_kb() -> usize {
        env_parsed(DIAGRAM_MAX_SPEC_SIZE_KB, 500)
    }
}

/// Database pool configuration.
pub mod database {
    use super::{env_parsed, env_vars::*};

    pub fn pool_size() -> u32 {
        env_parsed(DATABASE_POOL_SIZE, 15)
    }

    pub fn max_overflow() -> u32 {
        env_parsed(DATABASE_MAX_OVERFLOW, 30)
    }
}

/// Worker id used to tag rate-limiter timestamp entries, falling back to
/// the OS process id (SPEC_FULL §C.2).
pub fn worker_id() -> String {
    std::env::var(env_vars::WORKER_ID).unwrap_or_else(|_| std::process::id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_defaults_match_spec() {
        assert_eq!(rate_limits::dashscope_qpm_limit(), 200);
        assert_eq!(rate_limits::dashscope_concurrent_limit(), 50);
    }

    #[test]
    fn token_tracker_defaults_match_spec() {
        assert_eq!(token_tracker::batch_size(), 1000);
        assert_eq!(token_tracker::batch_interval_secs(), 300);
        assert_eq!(token_tracker::max_buffer_size(), 10_000);
    }

    #[test]
    fn diagram_cache_defaults_match_spec() {
        assert_eq!(diagram_cache::cache_ttl_secs(), 604_800);
        assert_eq!(diagram_cache::max_per_user(), 20);
        assert_eq!(diagram_cache::max_spec_size_kb(), 500);
    }

    #[test]
    fn strategy_defaults_to_weighted() {
        assert_eq!(load_balancing::strategy(), load_balancing::Strategy::Weighted);
    }

    #[test]
    fn weights_defaults_empty() {
        assert!(load_balancing::weights().is_empty());
    }
}
