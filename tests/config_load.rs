// tests/config_load.rs
use keyword_notifier::config::NotifierConfig;
use std::path::PathBuf;
use std::{env, fs};

const BODY: &str = r#"
[scheduler]
check_interval_minutes = 1

[channel]
database = "var/channel.db"
partitions = 16

[directory]
url = "http://directory.local/subscriptions"

[source]
api_key = "ENV"
"#;

#[serial_test::serial]
#[test]
fn api_key_env_placeholder_is_resolved() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notifier.toml");
    fs::write(&path, BODY).unwrap();

    env::remove_var("NEWSAPI_API_KEY");
    let err = NotifierConfig::load_from(&path).unwrap_err();
    assert!(format!("{err:#}").contains("NEWSAPI_API_KEY"));

    env::set_var("NEWSAPI_API_KEY", "secret-key");
    let cfg = NotifierConfig::load_from(&path).unwrap();
    assert_eq!(cfg.source.api_key, "secret-key");
    assert_eq!(cfg.channel.partitions, 16);
    assert_eq!(cfg.channel.database, Some(PathBuf::from("var/channel.db")));
    assert_eq!(cfg.scheduler_cfg().interval.as_secs(), 60);
    env::remove_var("NEWSAPI_API_KEY");
}

#[serial_test::serial]
#[test]
fn default_uses_env_then_fallback() {
    // isolate CWD so the repo's own config/ is not picked up
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();
    env::remove_var("NOTIFIER_CONFIG_PATH");
    env::set_var("NEWSAPI_API_KEY", "k");

    // 1) nothing at all is an error
    assert!(NotifierConfig::load_default().is_err());

    // 2) fallback ./config/notifier.toml
    fs::create_dir_all(tmp.path().join("config")).unwrap();
    fs::write(tmp.path().join("config/notifier.toml"), BODY).unwrap();
    let cfg = NotifierConfig::load_default().unwrap();
    assert_eq!(cfg.channel.partitions, 16);

    // 3) env var wins
    let other = tmp.path().join("other.toml");
    fs::write(
        &other,
        "[directory]\nurl = \"http://other/subs\"\n[source]\napi_key = \"inline\"\n",
    )
    .unwrap();
    env::set_var("NOTIFIER_CONFIG_PATH", other.display().to_string());
    let cfg = NotifierConfig::load_default().unwrap();
    assert_eq!(cfg.directory.url, "http://other/subs");
    assert_eq!(cfg.channel.partitions, 8);

    // 4) env var pointing nowhere is an error, not a silent fallback
    env::set_var("NOTIFIER_CONFIG_PATH", tmp.path().join("missing.toml"));
    assert!(NotifierConfig::load_default().is_err());

    env::remove_var("NOTIFIER_CONFIG_PATH");
    env::remove_var("NEWSAPI_API_KEY");
    env::set_current_dir(&old).unwrap();
}

#[serial_test::serial]
#[test]
fn zero_sized_settings_are_rejected() {
    for (section, field) in [
        ("channel", "partitions"),
        ("worker", "batch_size"),
        ("worker", "max_attempts"),
        ("worker", "instances"),
    ] {
        let body = format!(
            "[directory]\nurl = \"http://d\"\n[source]\napi_key = \"k\"\n[{section}]\n{field} = 0\n"
        );
        let err = NotifierConfig::from_toml_str(&body).unwrap_err();
        assert!(
            format!("{err:#}").contains(field),
            "{section}.{field} = 0 should be rejected"
        );
    }
}
