use std::time::Duration;
use steadfast::{
    ConfigError, DownstreamError, InstantSleeper, Jitter, NullSink, PolicyConfig, Resilience,
    ResilienceConfig,
};

const SETTINGS: &str = r#"{
    "policies": {
        "http": { "max_attempts": 2, "timeout_ms": 10000 },
        "payments": {
            "max_attempts": 3,
            "initial_delay_ms": 50,
            "max_delay_ms": 1000,
            "backoff_multiplier": 3.0,
            "failure_threshold": 2,
            "break_duration_ms": 5000,
            "retry_on_timeout": false,
            "jitter": "equal"
        }
    }
}"#;

#[test]
fn loads_named_policies_over_presets() {
    let config: ResilienceConfig = serde_json::from_str(SETTINGS).unwrap();
    let resilience = Resilience::builder()
        .config(&config)
        .sink(NullSink)
        .build()
        .unwrap();

    assert_eq!(resilience.policy_names(), vec!["database", "default", "http", "payments"]);

    let http = resilience.registry().get("http").unwrap();
    assert_eq!(http.config().max_attempts(), 2);
    assert_eq!(http.config().timeout(), Duration::from_secs(10));
    assert_eq!(http.config().initial_delay(), Duration::from_millis(200), "unset fields default");

    let payments = resilience.registry().get("payments").unwrap();
    let cfg = payments.config();
    assert_eq!(cfg.failure_threshold(), 2);
    assert_eq!(cfg.break_duration(), Duration::from_secs(5));
    assert!(!cfg.retry_on_timeout());
    assert_eq!(cfg.jitter(), Jitter::Equal);
    assert_eq!(payments.retry().backoff().delay(1), Duration::from_millis(150));

    let database = resilience.registry().get("database").unwrap();
    assert_eq!(database.config(), &PolicyConfig::database());
}

#[test]
fn partial_database_entry_keeps_the_database_timeout() {
    let config: ResilienceConfig =
        serde_json::from_str(r#"{ "policies": { "database": { "max_attempts": 3 } } }"#).unwrap();
    let resilience = Resilience::builder().config(&config).sink(NullSink).build().unwrap();

    let database = resilience.registry().get("database").unwrap();
    assert_eq!(database.config().max_attempts(), 3);
    assert_eq!(database.config().timeout(), Duration::from_secs(5));
    assert_eq!(database.retry().timeout(), Some(Duration::from_secs(5)));
}

#[test]
fn from_config_keeps_presets_when_file_is_empty() {
    let config: ResilienceConfig = serde_json::from_str("{}").unwrap();
    let resilience = Resilience::from_config(&config).unwrap();
    assert_eq!(resilience.policy_names(), vec!["database", "default", "http"]);
}

#[test]
fn invalid_values_are_rejected_at_load_time() {
    for (json, needle) in [
        (r#"{ "policies": { "x": { "max_attempts": 0 } } }"#, "max_attempts"),
        (r#"{ "policies": { "x": { "backoff_multiplier": 0.5 } } }"#, "backoff_multiplier"),
        (r#"{ "policies": { "x": { "timeout_ms": 0 } } }"#, "timeout"),
        (r#"{ "policies": { "x": { "failure_threshold": 0 } } }"#, "failure_threshold"),
        (r#"{ "policies": { "x": { "initial_delay_ms": 900, "max_delay_ms": 100 } } }"#, "max_delay"),
    ] {
        let err = serde_json::from_str::<ResilienceConfig>(json).unwrap_err();
        assert!(err.to_string().contains(needle), "{json}: {err}");
    }
}

#[test]
fn empty_policy_name_is_rejected() {
    let config = ResilienceConfig::new().with_policy("", PolicyConfig::default());
    assert_eq!(Resilience::from_config(&config).unwrap_err(), ConfigError::EmptyPolicyName);
}

#[tokio::test]
async fn loaded_policy_drives_execution() {
    let config: ResilienceConfig = serde_json::from_str(SETTINGS).unwrap();
    let resilience = Resilience::builder()
        .config(&config)
        .sink(NullSink)
        .sleeper(InstantSleeper)
        .build()
        .unwrap();

    let calls = std::sync::atomic::AtomicUsize::new(0);
    let calls = &calls;
    for _ in 0..2 {
        let _ = resilience
            .execute("payments", move || async move {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err::<(), _>(DownstreamError::unavailable("processor down"))
            })
            .await;
    }

    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 6);
    assert!(resilience
        .execute("payments", || async { Ok::<_, DownstreamError>(()) })
        .await
        .unwrap_err()
        .is_circuit_open());
}
