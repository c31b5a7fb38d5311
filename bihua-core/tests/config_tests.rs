// ABOUTME: Tests for configuration parsing, env overrides, validation and credential lookup.
// ABOUTME: Overrides are fed through a closure so no test touches the process environment.

use bihua_core::{Config, FleetError};
use std::collections::HashMap;

const MINIMAL: &str = r#"
[messenger]
home_server = "https://matrix.example.org"
admin_access_token = "syt_admin_secret"
"#;

fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn test_minimal_config_uses_defaults() {
    let config = Config::parse(MINIMAL).unwrap();
    config.validate().unwrap();

    assert_eq!(config.server_name().as_deref(), Some("matrix.example.org"));
    assert_eq!(config.fleet.page_size, 10);
    assert_eq!(config.fleet.sync_timeout_ms, 3000);
    assert_eq!(config.fleet.handler_dir, "./agents");
    assert_eq!(config.messenger.device_name, "bihua");
    assert_eq!(
        config.store.note_placeholder,
        "Please enter agent profile text here..."
    );
    assert!(config.fleet.room_alias.is_none());
    assert!(!config.fleet.register_as_admin);
}

#[test]
fn test_full_config_parses() {
    let config = Config::parse(
        r#"
[messenger]
home_server = "http://localhost:8008"
server_name = "example.org"
admin_access_token = "tok"
request_timeout_secs = 5

[store]
data_home = "/srv/bihua"

[fleet]
room_alias = "lobby"
room_topic = "Agents only"
handler_dir = "/srv/bihua/agents"
page_size = 50
agent_password = "hunter2"
register_as_admin = true

[fleet.credentials]
ops = "s3cret"
"#,
    )
    .unwrap();

    assert_eq!(config.server_name().as_deref(), Some("example.org"));
    assert_eq!(config.request_timeout().as_secs(), 5);
    assert_eq!(config.data_home().to_str(), Some("/srv/bihua"));
    assert_eq!(config.fleet.room_alias.as_deref(), Some("lobby"));
    assert_eq!(config.fleet.page_size, 50);
    assert!(config.fleet.register_as_admin);
    assert_eq!(config.fleet.credentials.get("ops").map(String::as_str), Some("s3cret"));
}

#[test]
fn test_env_overrides_win() {
    let mut config = Config::parse(MINIMAL).unwrap();
    config
        .apply_overrides(overrides(&[
            ("MESSENGER_HOME_SERVER", "https://other.example.org"),
            ("MESSENGER_ADMIN_TOKEN", "from_env"),
            ("BIHUA_AGENT_PASSWORD", "agentpw"),
            ("BIHUA_ROOM_ALIAS", "#ops:other.example.org"),
            ("BIHUA_DATA_HOME", "/tmp/bihua-data"),
            ("BIHUA_PAGE_SIZE", "25"),
        ]))
        .unwrap();

    assert_eq!(config.messenger.home_server, "https://other.example.org");
    assert_eq!(config.messenger.admin_access_token, "from_env");
    assert_eq!(config.fleet.agent_password.as_deref(), Some("agentpw"));
    assert_eq!(
        config.fleet.room_alias.as_deref(),
        Some("#ops:other.example.org")
    );
    assert_eq!(config.store.data_home, "/tmp/bihua-data");
    assert_eq!(config.fleet.page_size, 25);
}

#[test]
fn test_invalid_numeric_override_is_rejected() {
    let mut config = Config::parse(MINIMAL).unwrap();
    let err = config
        .apply_overrides(overrides(&[("BIHUA_PAGE_SIZE", "lots")]))
        .unwrap_err();
    assert!(err.to_string().contains("BIHUA_PAGE_SIZE"));
}

#[test]
fn test_validation_names_missing_keys() {
    let config = Config::parse("[messenger]\nhome_server = \"\"\n").unwrap();
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("MESSENGER_HOME_SERVER"), "got: {}", err);

    let config =
        Config::parse("[messenger]\nhome_server = \"https://matrix.example.org\"\n").unwrap();
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("MESSENGER_ADMIN_TOKEN"), "got: {}", err);
}

#[test]
fn test_zero_page_size_is_invalid() {
    let mut config = Config::parse(MINIMAL).unwrap();
    config.fleet.page_size = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_resolve_credential() {
    let mut config = Config::parse(MINIMAL).unwrap();
    config.fleet.agent_password = Some("default-pw".to_string());
    config
        .fleet
        .credentials
        .insert("ops".to_string(), "ops-pw".to_string());

    assert_eq!(
        config.resolve_credential("@a:x", "default").unwrap(),
        "default-pw"
    );
    assert_eq!(config.resolve_credential("@a:x", "").unwrap(), "default-pw");
    assert_eq!(config.resolve_credential("@a:x", "ops").unwrap(), "ops-pw");
    assert!(matches!(
        config.resolve_credential("@a:x", "missing"),
        Err(FleetError::Auth { .. })
    ));
}

#[test]
fn test_debug_redacts_secrets() {
    let mut config = Config::parse(MINIMAL).unwrap();
    config.fleet.agent_password = Some("hunter2".to_string());
    config
        .fleet
        .credentials
        .insert("ops".to_string(), "ops-secret".to_string());

    let debug = format!("{:?}", config);
    assert!(!debug.contains("syt_admin_secret"));
    assert!(!debug.contains("hunter2"));
    assert!(!debug.contains("ops-secret"));
    assert!(debug.contains("[REDACTED]"));
    assert!(debug.contains("ops"));
}
