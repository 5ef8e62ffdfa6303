//! Environment-driven configuration for the orchestration core.

use std::env;
use std::time::Duration;

use conclave_db::advisory::SCHEDULER_LOCK_NAMESPACE;

/// Tunables for the scheduler, pipeline defaults, and shutdown sequence.
///
/// Every knob has a compiled default; environment variables override.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// How often the scheduler scans for due actions (`SCHEDULER_CHECK_INTERVAL_S`).
    pub scheduler_check_interval: Duration,
    /// Upper bound of the per-tick random jitter (`SCHEDULER_JITTER_S`).
    pub scheduler_jitter: Duration,
    /// Default per-run timeout for pipelines (`PIPELINE_DEFAULT_TIMEOUT_S`).
    pub pipeline_default_timeout: Duration,
    /// Default per-node retry budget (`PIPELINE_DEFAULT_MAX_RETRIES`).
    pub pipeline_default_max_retries: u32,
    /// Load-balancer drain pause at shutdown (`SHUTDOWN_LB_DRAIN_S`).
    pub shutdown_lb_drain: Duration,
    /// In-flight task drain pause at shutdown (`SHUTDOWN_TASK_DRAIN_S`).
    pub shutdown_task_drain: Duration,
    /// Bound on waiting for the pool to close (`SHUTDOWN_POOL_CLOSE_TIMEOUT_S`).
    pub shutdown_pool_close_timeout: Duration,
    /// Advisory-lock namespace for scheduler claims
    /// (`ADVISORY_LOCK_NAMESPACE_SCHEDULER`).
    pub advisory_lock_namespace: i32,
}

impl CoreConfig {
    /// Build a config from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup (testable without
    /// mutating the process environment).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            scheduler_check_interval: secs(&lookup, "SCHEDULER_CHECK_INTERVAL_S", 60),
            scheduler_jitter: secs(&lookup, "SCHEDULER_JITTER_S", 10),
            pipeline_default_timeout: secs(&lookup, "PIPELINE_DEFAULT_TIMEOUT_S", 3600),
            pipeline_default_max_retries: int(&lookup, "PIPELINE_DEFAULT_MAX_RETRIES", 3),
            shutdown_lb_drain: secs(&lookup, "SHUTDOWN_LB_DRAIN_S", 3),
            shutdown_task_drain: secs(&lookup, "SHUTDOWN_TASK_DRAIN_S", 2),
            shutdown_pool_close_timeout: secs(&lookup, "SHUTDOWN_POOL_CLOSE_TIMEOUT_S", 10),
            advisory_lock_namespace: int(
                &lookup,
                "ADVISORY_LOCK_NAMESPACE_SCHEDULER",
                SCHEDULER_LOCK_NAMESPACE,
            ),
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> Duration {
    Duration::from_secs(int(lookup, name, default))
}

fn int<T: std::str::FromStr + Copy>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> T {
    match lookup(name) {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "unparseable env value, using default");
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_set() {
        let cfg = CoreConfig::from_lookup(|_| None);
        assert_eq!(cfg.scheduler_check_interval, Duration::from_secs(60));
        assert_eq!(cfg.scheduler_jitter, Duration::from_secs(10));
        assert_eq!(cfg.pipeline_default_timeout, Duration::from_secs(3600));
        assert_eq!(cfg.pipeline_default_max_retries, 3);
        assert_eq!(cfg.shutdown_lb_drain, Duration::from_secs(3));
        assert_eq!(cfg.shutdown_task_drain, Duration::from_secs(2));
        assert_eq!(cfg.shutdown_pool_close_timeout, Duration::from_secs(10));
        assert_eq!(cfg.advisory_lock_namespace, 1);
    }

    #[test]
    fn env_overrides_win() {
        let cfg = CoreConfig::from_lookup(|name| match name {
            "SCHEDULER_CHECK_INTERVAL_S" => Some("5".to_string()),
            "SHUTDOWN_LB_DRAIN_S" => Some("0".to_string()),
            _ => None,
        });
        assert_eq!(cfg.scheduler_check_interval, Duration::from_secs(5));
        assert_eq!(cfg.shutdown_lb_drain, Duration::ZERO);
        assert_eq!(cfg.scheduler_jitter, Duration::from_secs(10));
    }

    #[test]
    fn garbage_values_fall_back_to_default() {
        let cfg = CoreConfig::from_lookup(|name| {
            (name == "PIPELINE_DEFAULT_MAX_RETRIES").then(|| "lots".to_string())
        });
        assert_eq!(cfg.pipeline_default_max_retries, 3);
    }
}
