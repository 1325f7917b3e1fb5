use njams_sender::config::{self, SenderConfig, TransportKind};
use std::env;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

/// Test loading configuration from YAML file
#[test]
fn test_load_yaml_config() {
    let yaml = r#"
minQueueLength: 2
maxQueueLength: 16
senderThreadIdleTime: 30000
reconnectInterval: 2500
maxConnections: 4
acquireTimeout: 1000
transport: tcp
endpoint: tcp://monitor.example.com:6100
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("sender.yaml");
    fs::write(&config_path, yaml).unwrap();

    let config = config::load_from_yaml(&config_path).unwrap();

    assert_eq!(config.min_queue_length, 2);
    assert_eq!(config.max_queue_length, 16);
    assert_eq!(config.idle_time(), Duration::from_secs(30));
    assert_eq!(config.reconnect_interval(), Duration::from_millis(2500));
    assert_eq!(config.max_connections(), 4);
    assert_eq!(config.acquire_timeout(), Duration::from_secs(1));
    assert_eq!(config.transport, TransportKind::Tcp);
    assert_eq!(config.endpoint, "tcp://monitor.example.com:6100");
}

/// Test that load_config validates what it loaded
#[test]
fn test_load_config_rejects_invalid_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("invalid.yaml");
    fs::write(&config_path, "minQueueLength: 5\nmaxQueueLength: 2\n").unwrap();

    let result = config::load_config(Some(config_path.to_str().unwrap()));
    assert!(result.is_err());
}

/// Test that malformed YAML is reported
#[test]
fn test_load_yaml_parse_error() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("broken.yaml");
    fs::write(&config_path, "minQueueLength: [not, a, number]\n").unwrap();

    assert!(config::load_from_yaml(&config_path).is_err());
}

/// Test that a missing file is reported
#[test]
fn test_load_yaml_missing_file() {
    assert!(config::load_from_yaml("/nonexistent/sender.yaml").is_err());
}

/// Test loading configuration from environment variables
#[test]
fn test_load_from_env() {
    env::set_var("NJAMS_MAX_QUEUE_LENGTH", "3");
    env::set_var("NJAMS_RECONNECT_INTERVAL", "750");
    env::set_var("NJAMS_TRANSPORT", "channel");

    let config = config::load_from_env().unwrap();

    env::remove_var("NJAMS_MAX_QUEUE_LENGTH");
    env::remove_var("NJAMS_RECONNECT_INTERVAL");
    env::remove_var("NJAMS_TRANSPORT");

    assert_eq!(config.max_queue_length, 3);
    assert_eq!(config.reconnect_interval(), Duration::from_millis(750));
    assert_eq!(config.transport, TransportKind::Channel);
    assert_eq!(config.min_queue_length, 1);
}

/// Test that the configuration renders back to YAML with the property names
#[test]
fn test_yaml_round_trip_keeps_property_names() {
    let config = SenderConfig {
        max_connections: Some(2),
        ..Default::default()
    };

    let yaml = serde_yaml::to_string(&config).unwrap();
    assert!(yaml.contains("maxQueueLength: 8"));
    assert!(yaml.contains("senderThreadIdleTime: 10000"));
    assert!(yaml.contains("maxConnections: 2"));

    let parsed: SenderConfig = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(parsed, config);
}
