use super::*;
use tokio::time::sleep;

async fn succeed(breaker: &CircuitBreaker) -> Result<()> {
    breaker.run(async { Ok(()) }).await
}

async fn fail(breaker: &CircuitBreaker) -> Result<()> {
    breaker
        .run(async { Err::<(), _>(Error::Task("downstream error".to_string())) })
        .await
}

fn fast_config() -> BreakerConfig {
    BreakerConfig::new()
        .with_failure_rate_threshold(0.5)
        .with_min_samples(5)
        .with_cooldown(Duration::from_millis(50))
        .with_success_threshold(2)
}

#[test]
fn test_default_config() {
    let config = BreakerConfig::default();
    assert!((config.failure_rate_threshold - 0.5).abs() < 1e-9);
    assert_eq!(config.min_samples, 5);
    assert_eq!(config.max_samples, 50);
    assert_eq!(config.window(), Duration::from_secs(60));
    assert_eq!(config.cooldown(), Duration::from_secs(30));
    assert_eq!(config.success_threshold, 2);
}

#[test]
fn test_config_serde_defaults() {
    let config: BreakerConfig = serde_json::from_str(r#"{"min_samples": 3}"#).unwrap();
    assert_eq!(config.min_samples, 3);
    assert_eq!(config.cooldown_secs, 30);
}

#[tokio::test]
async fn test_starts_closed_and_passes_calls() {
    let breaker = CircuitBreaker::with_defaults("llm");
    assert_eq!(breaker.state(), CircuitState::Closed);
    let value = breaker.run(async { Ok(42) }).await.unwrap();
    assert_eq!(value, 42);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_opens_when_rate_exceeds_threshold() {
    let breaker = CircuitBreaker::new("llm", fast_config());

    for _ in 0..3 {
        fail(&breaker).await.unwrap_err();
    }
    for _ in 0..2 {
        succeed(&breaker).await.unwrap();
    }
    // 3 failures / 5 samples = 0.6 > 0.5
    assert_eq!(breaker.state(), CircuitState::Open);

    let err = succeed(&breaker).await.unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { ref operation } if operation == "llm"));
}

#[tokio::test]
async fn test_success_can_complete_the_window() {
    // The tripping outcome need not itself be a failure
    let config = fast_config().with_min_samples(10);
    let breaker = CircuitBreaker::new("llm", config);

    for _ in 0..6 {
        fail(&breaker).await.unwrap_err();
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
    for _ in 0..4 {
        let _ = breaker.run(async { Ok(()) }).await;
    }
    // 6 failures / 10 samples = 0.6 > 0.5
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test]
async fn test_below_min_samples_never_trips() {
    let breaker = CircuitBreaker::new("llm", fast_config());

    for _ in 0..4 {
        fail(&breaker).await.unwrap_err();
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_exact_threshold_rate_does_not_trip() {
    let config = fast_config().with_min_samples(4);
    let breaker = CircuitBreaker::new("llm", config);

    // 2/4 = 0.5, not strictly greater than 0.5
    fail(&breaker).await.unwrap_err();
    fail(&breaker).await.unwrap_err();
    succeed(&breaker).await.unwrap();
    succeed(&breaker).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_half_open_recovery() {
    let breaker = CircuitBreaker::new("llm", fast_config());

    for _ in 0..5 {
        fail(&breaker).await.unwrap_err();
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    sleep(Duration::from_millis(60)).await;

    // First trial succeeds but one success is not enough to close
    succeed(&breaker).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    succeed(&breaker).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);

    // Recovery cleared the window; old failures cannot re-trip it
    let status = breaker.status();
    assert_eq!(status.recent_failures, 0);
}

#[tokio::test]
async fn test_trial_failure_reopens() {
    let breaker = CircuitBreaker::new("llm", fast_config());

    for _ in 0..5 {
        fail(&breaker).await.unwrap_err();
    }
    sleep(Duration::from_millis(60)).await;

    let err = fail(&breaker).await.unwrap_err();
    assert!(matches!(err, Error::Task(_)));
    assert_eq!(breaker.state(), CircuitState::Open);

    // A fresh cool-down is required before the next trial
    let err = succeed(&breaker).await.unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }));
}

#[tokio::test]
async fn test_half_open_admits_one_trial_at_a_time() {
    let breaker = Arc::new(CircuitBreaker::new("llm", fast_config()));

    for _ in 0..5 {
        fail(&breaker).await.unwrap_err();
    }
    sleep(Duration::from_millis(60)).await;

    let (trial_tx, trial_rx) = tokio::sync::oneshot::channel::<()>();
    let slow_trial = {
        let breaker = Arc::clone(&breaker);
        tokio::spawn(async move {
            breaker
                .run(async {
                    trial_rx.await.ok();
                    Ok(())
                })
                .await
        })
    };
    sleep(Duration::from_millis(20)).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    // Concurrent caller is rejected while the trial is in flight
    let err = succeed(&breaker).await.unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }));

    trial_tx.send(()).unwrap();
    slow_trial.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_abandoned_trial_releases_the_slot() {
    let breaker = CircuitBreaker::new("llm", fast_config().with_success_threshold(1));

    for _ in 0..5 {
        fail(&breaker).await.unwrap_err();
    }
    sleep(Duration::from_millis(60)).await;

    // The caller stops waiting mid-trial and drops the call
    let abandoned = tokio::time::timeout(
        Duration::from_millis(10),
        breaker.run(async {
            sleep(Duration::from_secs(600)).await;
            Ok(())
        }),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    // The next caller takes over as the trial instead of being rejected
    succeed(&breaker).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_reset_forces_closed() {
    let breaker = CircuitBreaker::new("llm", fast_config());
    for _ in 0..5 {
        fail(&breaker).await.unwrap_err();
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    breaker.reset();
    assert_eq!(breaker.state(), CircuitState::Closed);
    succeed(&breaker).await.unwrap();
}

#[tokio::test]
async fn test_status_counts_window() {
    let breaker = CircuitBreaker::new("llm", fast_config());
    succeed(&breaker).await.unwrap();
    succeed(&breaker).await.unwrap();
    fail(&breaker).await.unwrap_err();

    let status = breaker.status();
    assert_eq!(status.name, "llm");
    assert_eq!(status.state, CircuitState::Closed);
    assert_eq!(status.recent_successes, 2);
    assert_eq!(status.recent_failures, 1);
}

#[tokio::test]
async fn test_registry_isolates_operations() {
    let registry = BreakerRegistry::new(fast_config());

    for _ in 0..5 {
        registry
            .run("llm", async { Err::<(), _>(Error::Task("boom".to_string())) })
            .await
            .unwrap_err();
    }
    assert_eq!(registry.breaker("llm").state(), CircuitState::Open);

    // Other operations are unaffected
    registry.run("search", async { Ok(()) }).await.unwrap();
    assert_eq!(registry.breaker("search").state(), CircuitState::Closed);

    let states = registry.states();
    assert_eq!(states.len(), 2);
    assert_eq!(states[0].name, "llm");
    assert_eq!(states[1].name, "search");

    registry.reset_all();
    assert_eq!(registry.breaker("llm").state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_registry_returns_same_breaker() {
    let registry = BreakerRegistry::new(BreakerConfig::default());
    let first = registry.breaker("llm");
    let second = registry.breaker("llm");
    assert!(Arc::ptr_eq(&first, &second));
}
