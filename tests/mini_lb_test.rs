//! Integration tests for Mini Load Balancer configuration and pair selection

use std::collections::HashMap;

use sglang_mini_lb::mini_lb::{MiniLbConfig, MiniLbError, MiniLoadBalancer, PrefillConfig};

fn two_by_two() -> MiniLbConfig {
    MiniLbConfig::new(
        "127.0.0.1".to_string(),
        8080,
        vec![
            PrefillConfig::new("http://localhost:30000", 30001),
            PrefillConfig::new("http://localhost:30002", 30003),
        ],
        vec![
            "http://localhost:31000".to_string(),
            "http://localhost:31001".to_string(),
        ],
        3600,
    )
}

#[test]
fn test_config_creation() {
    let config = MiniLbConfig::new(
        "127.0.0.1".to_string(),
        8080,
        vec![PrefillConfig::new("http://localhost:30000", 30001)],
        vec!["http://localhost:31000".to_string()],
        1800,
    );

    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.port, 8080);
    assert_eq!(config.prefill.len(), 1);
    assert_eq!(config.decode_urls.len(), 1);
    assert_eq!(config.timeout_secs, 1800);
}

#[test]
fn test_config_validation_success() {
    assert!(two_by_two().validate().is_ok());
}

#[test]
fn test_config_validation_no_prefill() {
    let mut config = two_by_two();
    config.prefill.clear();

    assert!(matches!(
        config.validate(),
        Err(MiniLbError::Configuration(_))
    ));
}

#[test]
fn test_config_validation_no_decode() {
    let mut config = two_by_two();
    config.decode_urls.clear();

    assert!(matches!(
        config.validate(),
        Err(MiniLbError::Configuration(_))
    ));
}

#[test]
fn test_config_from_cli_lists_per_server_ports() {
    let config = MiniLbConfig::from_cli_lists(
        vec![
            "http://10.0.0.1:30000".to_string(),
            "http://10.0.0.2:30000".to_string(),
        ],
        vec![8998, 8999],
        vec!["http://10.0.0.3:31000".to_string()],
        "0.0.0.0".to_string(),
        8000,
    )
    .unwrap();

    assert_eq!(
        config.prefill,
        vec![
            PrefillConfig::new("http://10.0.0.1:30000", 8998),
            PrefillConfig::new("http://10.0.0.2:30000", 8999),
        ]
    );
}

#[test]
fn test_config_deserializes_with_default_timeout() {
    let config: MiniLbConfig = serde_json::from_value(serde_json::json!({
        "host": "0.0.0.0",
        "port": 8000,
        "prefill": [{"url": "http://p:30000", "bootstrap_port": 8998}],
        "decode_urls": ["http://d:31000"],
    }))
    .unwrap();

    assert_eq!(config.timeout_secs, 3600);
}

#[test]
fn test_load_balancer_creation() {
    let lb = MiniLoadBalancer::new(two_by_two());
    assert!(lb.is_ok());
}

#[test]
fn test_load_balancer_invalid_config() {
    let mut config = two_by_two();
    config.prefill.clear();

    let lb = MiniLoadBalancer::new(config);
    assert!(lb.is_err());
}

#[test]
fn test_select_pair() {
    let lb = MiniLoadBalancer::new(two_by_two()).unwrap();

    for _ in 0..10 {
        let pair = lb.select_pair().unwrap();
        assert!(
            pair.prefill_url == "http://localhost:30000"
                || pair.prefill_url == "http://localhost:30002"
        );
        assert!(
            pair.decode_url == "http://localhost:31000"
                || pair.decode_url == "http://localhost:31001"
        );
        assert!(pair.prefill_bootstrap_port == 30001 || pair.prefill_bootstrap_port == 30003);
    }
}

#[test]
fn test_select_pair_round_robin_prefill() {
    let lb = MiniLoadBalancer::new(two_by_two()).unwrap();

    let pair1 = lb.select_pair().unwrap();
    assert_eq!(pair1.prefill_url, "http://localhost:30000");
    assert_eq!(pair1.prefill_bootstrap_port, 30001);

    let pair2 = lb.select_pair().unwrap();
    assert_eq!(pair2.prefill_url, "http://localhost:30002");
    assert_eq!(pair2.prefill_bootstrap_port, 30003);

    let pair3 = lb.select_pair().unwrap();
    assert_eq!(pair3.prefill_url, "http://localhost:30000");
}

#[test]
fn test_select_pair_balances_prefill() {
    let lb = MiniLoadBalancer::new(two_by_two()).unwrap();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..11 {
        *counts.entry(lb.select_pair().unwrap().prefill_url).or_default() += 1;
    }

    assert_eq!(counts["http://localhost:30000"], 6);
    assert_eq!(counts["http://localhost:30002"], 5);
}
