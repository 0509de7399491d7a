use super::*;
use chrono::TimeZone;

fn bucket_row(user_id: &str, tokens: f64) -> BucketRow {
    BucketRow {
        user_id: user_id.to_string(),
        dimension: "requests".to_string(),
        tokens,
        last_refill: Utc::now(),
        capacity: 10.0,
        refill_rate: 0.5,
    }
}

fn usage_row(user_id: &str, model: &str, cost_usd: f64) -> UsageRow {
    UsageRow {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        model: model.to_string(),
        input_tokens: 100,
        output_tokens: 50,
        cost_usd,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_bucket_upsert_and_load() {
    let store = Store::in_memory().await.unwrap();

    assert!(store.load_bucket("alice", "requests").await.unwrap().is_none());

    store.upsert_bucket(&bucket_row("alice", 7.5)).await.unwrap();
    let loaded = store.load_bucket("alice", "requests").await.unwrap().unwrap();
    assert!((loaded.tokens - 7.5).abs() < 1e-9);
    assert!((loaded.capacity - 10.0).abs() < 1e-9);

    // Last write wins
    store.upsert_bucket(&bucket_row("alice", 2.0)).await.unwrap();
    let loaded = store.load_bucket("alice", "requests").await.unwrap().unwrap();
    assert!((loaded.tokens - 2.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_delete_buckets() {
    let store = Store::in_memory().await.unwrap();
    store.upsert_bucket(&bucket_row("alice", 1.0)).await.unwrap();
    store.delete_buckets("alice").await.unwrap();
    assert!(store.load_bucket("alice", "requests").await.unwrap().is_none());
}

#[tokio::test]
async fn test_quota_upsert_and_load() {
    let store = Store::in_memory().await.unwrap();
    let now = Utc::now();

    let row = QuotaRow {
        user_id: "alice".to_string(),
        tier: "pro".to_string(),
        daily_requests: 12,
        monthly_requests: 340,
        daily_reset_at: now,
        monthly_reset_at: now,
        grace_period_until: None,
        is_suspended: false,
    };
    store.upsert_quota(&row).await.unwrap();

    let loaded = store.load_quota("alice").await.unwrap().unwrap();
    assert_eq!(loaded.tier, "pro");
    assert_eq!(loaded.daily_requests, 12);
    assert_eq!(loaded.monthly_requests, 340);
    assert!(loaded.grace_period_until.is_none());
    assert!(!loaded.is_suspended);

    let updated = QuotaRow {
        grace_period_until: Some(now + chrono::Duration::hours(1)),
        is_suspended: true,
        ..row
    };
    store.upsert_quota(&updated).await.unwrap();
    let loaded = store.load_quota("alice").await.unwrap().unwrap();
    assert!(loaded.grace_period_until.is_some());
    assert!(loaded.is_suspended);
}

#[tokio::test]
async fn test_ledger_aggregates() {
    let store = Store::in_memory().await.unwrap();

    store.append_usage(&usage_row("alice", "gpt-4o", 0.10)).await.unwrap();
    store.append_usage(&usage_row("alice", "gpt-4o", 0.15)).await.unwrap();
    store.append_usage(&usage_row("alice", "claude-sonnet", 0.05)).await.unwrap();
    store.append_usage(&usage_row("bob", "gpt-4o", 0.50)).await.unwrap();

    let since_epoch = Utc.timestamp_opt(0, 0).unwrap();
    let alice = store.cost_since("alice", since_epoch).await.unwrap();
    assert!((alice - 0.30).abs() < 1e-9);
    assert!((store.total_cost("alice").await.unwrap() - 0.30).abs() < 1e-9);

    // Nothing yet for unknown users
    assert!((store.total_cost("carol").await.unwrap()).abs() < 1e-9);

    let by_model = store.model_usage("alice").await.unwrap();
    assert_eq!(by_model.len(), 2);
    assert_eq!(by_model[0].model, "gpt-4o");
    assert_eq!(by_model[0].input_tokens, 200);
    assert!((by_model[0].cost_usd - 0.25).abs() < 1e-9);

    let top = store.top_users(10).await.unwrap();
    assert_eq!(top[0].0, "bob");
    assert!((top[0].1 - 0.50).abs() < 1e-9);
    assert_eq!(top[1].0, "alice");

    let top_one = store.top_users(1).await.unwrap();
    assert_eq!(top_one.len(), 1);
}

#[tokio::test]
async fn test_ledger_prune() {
    let store = Store::in_memory().await.unwrap();
    store.append_usage(&usage_row("alice", "gpt-4o", 0.10)).await.unwrap();
    store.append_usage(&usage_row("alice", "gpt-4o", 0.20)).await.unwrap();

    // Cutoff in the past removes nothing
    let removed = store
        .prune_ledger_before(Utc::now() - chrono::Duration::days(1))
        .await
        .unwrap();
    assert_eq!(removed, 0);

    // Cutoff in the future removes everything
    let removed = store
        .prune_ledger_before(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert!((store.total_cost("alice").await.unwrap()).abs() < 1e-9);
}

#[tokio::test]
async fn test_from_path_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("governance.db");

    {
        let store = Store::from_path(&path).await.unwrap();
        store.upsert_bucket(&bucket_row("alice", 3.0)).await.unwrap();
        store.close().await;
    }

    let store = Store::from_path(&path).await.unwrap();
    let loaded = store.load_bucket("alice", "requests").await.unwrap().unwrap();
    assert!((loaded.tokens - 3.0).abs() < 1e-9);
}
