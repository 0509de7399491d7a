use super::*;
use crate::error::Error;
use crate::limiter::AdmissionRequest;
use crate::store::Store;

async fn governor() -> Governor {
    governor_with(GovernanceConfig::default()).await
}

async fn governor_with(config: GovernanceConfig) -> Governor {
    Governor::new(Store::in_memory().await.unwrap(), config)
}

#[tokio::test]
async fn test_start_and_shutdown() {
    let governor = governor().await;
    governor.start();
    assert_eq!(governor.tasks.lock().unwrap().len(), 2);
    governor.shutdown().await;
    assert!(governor.tasks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_double_start_is_noop() {
    let governor = governor().await;
    governor.start();
    governor.start();
    assert_eq!(governor.tasks.lock().unwrap().len(), 2);
    governor.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_without_start() {
    let governor = governor().await;
    governor.shutdown().await;
}

#[tokio::test]
async fn test_background_flush_persists_state() {
    let config = GovernanceConfig {
        flush_interval_secs: 1,
        ..GovernanceConfig::default()
    };
    let governor = governor_with(config).await;

    tokio::time::pause();
    governor.start();
    assert!(
        governor
            .limiter()
            .check(&AdmissionRequest::new("alice", "web"))
            .await
            .allowed
    );
    // Past the first flush interval
    tokio::time::advance(Duration::from_millis(2_500)).await;
    tokio::time::resume();
    governor.shutdown().await;

    // The final flush found nothing left to write
    assert_eq!(governor.limiter().flush().await.unwrap(), 0);
}

#[tokio::test]
async fn test_status_aggregates_pools_and_breakers() {
    let governor = governor().await;

    governor
        .pools()
        .pool("agents")
        .run("alice", async { Ok(()) })
        .await
        .unwrap();
    governor
        .breakers()
        .run("llm", async { Err::<(), _>(Error::Task("boom".to_string())) })
        .await
        .unwrap_err();

    let status = governor.status();
    assert_eq!(status.pools.pools, 1);
    assert_eq!(status.pools.total_completed, 1);
    assert_eq!(status.breakers.len(), 1);
    assert_eq!(status.breakers[0].name, "llm");
    assert_eq!(status.breakers[0].recent_failures, 1);
}

#[tokio::test]
async fn test_components_share_one_store() {
    let governor = governor().await;

    governor
        .limiter()
        .record_request("alice", "gpt-4o", 100, 50, 0.10)
        .await
        .unwrap();

    // Cost tracker and limiter see the same ledger
    assert!((governor.costs().daily_cost("alice").await.unwrap() - 0.10).abs() < 1e-9);
    let status = governor.limiter().get_status("alice").await.unwrap();
    assert_eq!(status.quota.daily_used, 1);
}

#[tokio::test]
async fn test_config_accessor() {
    let config = GovernanceConfig {
        warn_threshold: 0.75,
        ..GovernanceConfig::default()
    };
    let governor = governor_with(config).await;
    assert!((governor.config().warn_threshold - 0.75).abs() < 1e-9);
}
