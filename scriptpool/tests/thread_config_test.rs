// Integration tests for config types in scriptpool::thread::config

use std::time::Duration;

use scriptpool::thread::config::*;

#[test]
fn test_pool_config_defaults() {
    let config = ThreadPoolConfig::default();

    assert_eq!(config.initial_size, num_cpus::get().min(DEFAULT_MAX_POOL_SIZE));
    assert_eq!(config.max_size, DEFAULT_MAX_POOL_SIZE);
    assert_eq!(config.default_task_timeout, Some(DEFAULT_TASK_TIMEOUT));
    assert_eq!(config.thread_name_prefix, "script-worker-");
    assert!(config.validate().is_ok());
}

#[test]
fn test_worker_config_follows_pool() {
    let pool = ThreadPoolConfig {
        thread_name_prefix: "engine-".to_string(),
        default_task_timeout: None,
        ..Default::default()
    };
    let worker = pool.worker_config();
    assert_eq!(worker.thread_name_prefix, "engine-");
    assert_eq!(worker.default_task_timeout, None);
}

#[test]
fn test_scheduler_config_defaults() {
    let config = SchedulerConfig::default();

    assert_eq!(config.balance_interval, Duration::from_millis(100));
    assert_eq!(config.promotion_bound, Some(Duration::from_secs(5)));
    assert!(config.validate().is_ok());

    let disabled = SchedulerConfig {
        promotion_bound: None,
        ..Default::default()
    };
    assert!(disabled.validate().is_ok());
}

#[test]
fn test_runtime_config_validates_both_halves() {
    let config = RuntimeConfig {
        pool: ThreadPoolConfig {
            max_size: 0,
            ..Default::default()
        },
        ..Default::default()
    };
    assert!(matches!(
        config.validate(),
        Err(scriptpool::thread::error::ConfigError::Invalid { field: "max_size", .. })
    ));
    assert!(RuntimeConfig::default().validate().is_ok());
}
