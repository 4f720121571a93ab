//! Settings and operating configuration loading tests

use std::io::Write;
use std::path::PathBuf;

use governance_agent::config::{AgentConfig, ConfigError, Settings};
use governance_agent::ledger::ActionValue;

fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).expect("create file");
    file.write_all(content.as_bytes()).expect("write file");
    path
}

#[test]
fn test_settings_defaults() {
    let settings: Settings = toml::from_str("").expect("empty settings parse");

    assert_eq!(settings.telemetry.metric_prefix, "oasees_");
    assert_eq!(settings.telemetry.timeout_secs, 5);
    assert_eq!(settings.ledger.call_timeout_secs, 30);
    assert_eq!(settings.agent.poll_interval_secs, 5);
    assert_eq!(settings.agent.dispatch_timeout_secs, 10);
    assert!(settings.api.enabled);
    assert_eq!(settings.api.http_port, 8088);
    assert!(settings.node.operating_config.is_none());
}

#[test]
fn test_settings_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        &dir,
        "governance-agent.toml",
        r#"
[node]
device_name = "edge-7"
operating_config = "/etc/agent/agent.yaml"

[telemetry]
query_url = "http://prometheus:9090"

[ledger]
gateway_url = "http://gateway:8545"
call_timeout_secs = 12

[agent]
poll_interval_secs = 2

[api]
enabled = false
"#,
    );

    let settings = Settings::load(&path).unwrap();

    assert_eq!(settings.device_name(), "edge-7");
    assert_eq!(
        settings.node.operating_config,
        Some(PathBuf::from("/etc/agent/agent.yaml"))
    );
    assert_eq!(settings.telemetry.query_url, "http://prometheus:9090");
    assert_eq!(settings.telemetry.metric_prefix, "oasees_");
    assert_eq!(settings.ledger.gateway_url, "http://gateway:8545");
    assert_eq!(settings.ledger.call_timeout_secs, 12);
    assert_eq!(settings.poll_interval().as_secs(), 2);
    assert!(!settings.api.enabled);
}

#[test]
fn test_device_name_falls_back_to_hostname() {
    let settings = Settings::default();
    assert!(!settings.device_name().is_empty());
}

#[test]
fn test_missing_settings_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = Settings::load(dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::Io { .. })));
}

#[test]
fn test_operating_config_yaml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        &dir,
        "agent.yaml",
        r#"
metric_index: "5"
propose_on:
  events:
    - "temperature > 70"
  proposal_contents:
    - msg: cool-down
      action_value: 3
  positive_vote_on:
    - "temperature > 60"
actions_map:
  "3":
    action_endpoint: http://fans.local/on
    args:
      speed: high
"#,
    );

    let config = AgentConfig::load(&path).unwrap();

    assert_eq!(config.metric_index, "5");
    assert_eq!(config.rules.len(), 1);
    assert_eq!(config.rules[0].message, "cool-down");
    assert_eq!(config.rules[0].action_value, ActionValue(3));
    assert_eq!(
        config.rules[0].vote_condition.as_deref(),
        Some("temperature > 60")
    );
    let action = config.action_for(ActionValue(3)).unwrap();
    assert_eq!(action.action_endpoint, "http://fans.local/on");
    assert_eq!(action.args["speed"], "high");
}

#[test]
fn test_operating_config_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        &dir,
        "agent.json",
        r#"{
            "metric_index": "2",
            "propose_on": {
                "events": ["cpu_high > 0"],
                "proposal_contents": [{"msg": "scale-up", "action_value": "2"}],
                "positive_vote_on": [null]
            },
            "actions_map": {}
        }"#,
    );

    let config = AgentConfig::load(&path).unwrap();
    assert_eq!(config.rules[0].action_value, ActionValue(2));
    assert!(config.rules[0].vote_condition.is_none());
    assert!(config.actions_map.is_empty());
}

#[test]
fn test_operating_config_rejects_unknown_extension() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "agent.ini", "metric_index = 1");
    assert!(matches!(
        AgentConfig::load(&path),
        Err(ConfigError::UnsupportedFormat(_))
    ));
}

#[test]
fn test_operating_config_without_rules_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        &dir,
        "agent.yaml",
        r#"
metric_index: "1"
propose_on:
  events: []
  proposal_contents: []
"#,
    );
    assert!(matches!(
        AgentConfig::load(&path),
        Err(ConfigError::EmptyRules)
    ));
}
