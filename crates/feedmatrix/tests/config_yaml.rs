// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![cfg(feature = "config-loaders")]

//! Loading collector configuration from YAML files.

use feedmatrix::{Collector, CollectorConfig, Contract, DataScheme, Error, FatalPolicy};
use std::io::Write;
use std::time::Duration;

fn write_yaml(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(content.as_bytes()).expect("write yaml");
    file
}

#[test]
fn test_load_from_file() {
    let file = write_yaml(
        r#"
subscription_bucket: 500
agent_buffer_size: 64
sticky_period_ms: 2000
store_everything: true
store_everything_records: [Candle]
unconflated_records: [TimeAndSale]
fatal_policy: panic
"#,
    );
    let config = CollectorConfig::from_yaml_file(file.path()).expect("config");
    assert_eq!(config.subscription_bucket, 500);
    assert_eq!(config.agent_buffer_size, 64);
    assert_eq!(config.sticky_period(), Duration::from_secs(2));
    assert!(config.store_everything);
    assert_eq!(config.store_everything_records, vec!["Candle".to_string()]);
    assert_eq!(config.fatal_policy, FatalPolicy::Panic);
    assert_eq!(config.retrieve_batch_size, CollectorConfig::default().retrieve_batch_size);

    let collector = Collector::builder(
        DataScheme::new(&[("Candle", true), ("TimeAndSale", true)]),
        Contract::History,
    )
    .config(config)
    .build()
    .expect("collector");
    assert_eq!(collector.sticky_period(), Duration::from_secs(2));
    let agent = collector.create_agent().expect("agent");
    assert_eq!(agent.max_buffer_size(), 64);
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let result = CollectorConfig::from_yaml_file(dir.path().join("collector.yaml"));
    assert!(matches!(result, Err(Error::ConfigFileNotFound(_))));
}

#[test]
fn test_malformed_yaml() {
    let file = write_yaml("subscription_bucket: [1, 2\n");
    let result = CollectorConfig::from_yaml_file(file.path());
    assert!(matches!(result, Err(Error::ConfigParse(_))));
}

#[test]
fn test_unknown_policy_is_a_parse_error() {
    let result = CollectorConfig::from_yaml_str("fatal_policy: ignore\n");
    assert!(matches!(result, Err(Error::ConfigParse(_))));
}

#[test]
fn test_invalid_values_rejected() {
    let file = write_yaml("distribution_bucket: 0\n");
    let result = CollectorConfig::from_yaml_file(file.path());
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}
