use super::*;
use std::io::Write;

#[test]
fn test_tier_round_trip() {
    for tier in [Tier::Free, Tier::Pro, Tier::Enterprise] {
        assert_eq!(Tier::parse(tier.as_str()), tier);
    }
    assert_eq!(Tier::parse("unknown"), Tier::Free);
    assert_eq!(Tier::Pro.to_string(), "pro");
}

#[test]
fn test_default_config_is_valid() {
    let config = GovernanceConfig::default();
    assert!(config.fail_open);
    assert!((config.warn_threshold - 0.8).abs() < 1e-9);
    assert_eq!(config.flush_interval_secs, 30);
    assert_eq!(config.sweep_interval_secs, 60);
    config.validate().unwrap();
}

#[test]
fn test_default_tier_table_ordering() {
    let tiers = TierTable::default();
    assert!(tiers.free.requests_per_minute < tiers.pro.requests_per_minute);
    assert!(tiers.pro.requests_per_minute < tiers.enterprise.requests_per_minute);
    assert!(tiers.free.monthly_cost_usd < tiers.pro.monthly_cost_usd);
    assert_eq!(tiers.limits(Tier::Pro).daily_requests, tiers.pro.daily_requests);
}

#[test]
fn test_bucket_params_spread_over_window() {
    let limits = TierLimits {
        requests_per_minute: 60,
        tokens_per_minute: 6_000,
        daily_cost_usd: 86.4,
        ..TierLimits::default()
    };

    let (cap, rate) = limits.bucket_params(Dimension::Requests);
    assert!((cap - 60.0).abs() < 1e-9);
    assert!((rate - 1.0).abs() < 1e-9);

    let (cap, rate) = limits.bucket_params(Dimension::Tokens);
    assert!((cap - 6_000.0).abs() < 1e-9);
    assert!((rate - 100.0).abs() < 1e-9);

    // Daily ceiling spread over 24h
    let (cap, rate) = limits.bucket_params(Dimension::Cost);
    assert!((cap - 86.4).abs() < 1e-9);
    assert!((rate - 0.001).abs() < 1e-9);
}

#[test]
fn test_validate_rejects_bad_threshold() {
    let config = GovernanceConfig {
        warn_threshold: 1.5,
        ..GovernanceConfig::default()
    };
    let err = config.validate().unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { ref field, .. } if field == "warn_threshold"));
}

#[test]
fn test_validate_rejects_zero_intervals() {
    let config = GovernanceConfig {
        flush_interval_secs: 0,
        ..GovernanceConfig::default()
    };
    assert!(config.validate().is_err());

    let config = GovernanceConfig {
        sweep_interval_secs: 0,
        ..GovernanceConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_partial_toml_fills_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
fail_open = false
warn_threshold = 0.9

[tiers.free]
requests_per_minute = 3
daily_requests = 20

[pool]
max_concurrent = 8
"#
    )
    .unwrap();

    let config = GovernanceConfig::from_toml_path(file.path()).unwrap();
    assert!(!config.fail_open);
    assert!((config.warn_threshold - 0.9).abs() < 1e-9);
    // Unset fields keep their defaults
    assert_eq!(config.flush_interval_secs, 30);
    assert_eq!(config.tiers.free.requests_per_minute, 3);
    assert_eq!(config.tiers.free.daily_requests, 20);
    assert_eq!(config.tiers.free.monthly_requests, 1_000);
    assert_eq!(config.tiers.pro.requests_per_minute, 30);
    assert_eq!(config.pool.max_concurrent, 8);
    assert_eq!(config.pool.per_key_concurrency, 1);
}

#[test]
fn test_invalid_toml_reports_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "warn_threshold = \"not a number\"").unwrap();

    let err = GovernanceConfig::from_toml_path(file.path()).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { .. }));
}

#[test]
fn test_missing_file_is_config_error() {
    let err = GovernanceConfig::from_toml_path(Path::new("/nonexistent/governance.toml")).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { .. }));
}
