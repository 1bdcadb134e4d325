//! Runtime configuration, loaded once at process start from environment
//! variables (see the external interface contract for names/defaults) and
//! threaded explicitly into the Manager and Gateway as a single immutable
//! value — never re-read from the environment deeper in the call stack.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub debug: bool,
    pub api_key: Option<String>,
    pub idle_ttl: Duration,
    pub capacity_max: usize,
    pub cleanup_interval: Duration,
    pub default_execution_timeout: Duration,
    pub pool_target: usize,
    pub pool_refill_interval: Duration,
    pub workdir_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 16010,
            debug: false,
            api_key: None,
            idle_ttl: Duration::from_secs(300),
            capacity_max: 10,
            cleanup_interval: Duration::from_secs(60),
            default_execution_timeout: Duration::from_secs(30),
            pool_target: 2,
            pool_refill_interval: Duration::from_secs(15),
            workdir_root: PathBuf::from("/tmp/sandbox_sessions"),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from the environment, falling back to the
    /// documented defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let default = Self::default();
        let api_key = std::env::var("API_KEY")
            .ok()
            .filter(|s| !s.is_empty());

        Self {
            host: env_string("HOST", &default.host),
            port: env_parsed("PORT", default.port),
            debug: env_parsed("DEBUG", default.debug),
            api_key,
            idle_ttl: Duration::from_secs(env_parsed(
                "KERNEL_TIMEOUT",
                default.idle_ttl.as_secs(),
            )),
            capacity_max: env_parsed("MAX_KERNELS", default.capacity_max),
            cleanup_interval: Duration::from_secs(env_parsed(
                "KERNEL_CLEANUP_INTERVAL",
                default.cleanup_interval.as_secs(),
            )),
            default_execution_timeout: Duration::from_secs(env_parsed(
                "MAX_EXECUTION_TIME",
                default.default_execution_timeout.as_secs(),
            )),
            pool_target: env_parsed("SESSION_POOL_SIZE", default.pool_target),
            pool_refill_interval: Duration::from_secs(env_parsed(
                "SESSION_POOL_REFILL_INTERVAL",
                default.pool_refill_interval.as_secs(),
            )),
            workdir_root: default.workdir_root,
        }
    }

    pub fn session_workdir(&self, session_id: &str) -> PathBuf {
        self.workdir_root.join(session_id)
    }
}
