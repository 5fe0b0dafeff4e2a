use std::env;
use std::fs;

use serial_test::serial;
use tempfile::TempDir;

use super::load_config;
use super::settings::Settings;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert!(!settings.engine.strict_errors);
    assert_eq!(settings.logging.level, "info");
    assert_eq!(settings.persistence.path, "popflow_db");
    assert_eq!(settings.persistence.ttl_secs, 86_400);
    assert_eq!(settings.persistence.max_snapshots_per_key, 10);
}

#[test]
#[serial]
fn load_config_without_sources_uses_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    let cfg = temp_env::with_vars_unset(
        [
            "POPFLOW__ENGINE__STRICT_ERRORS",
            "POPFLOW__LOGGING__LEVEL",
        ],
        || load_config().expect("load_config failed"),
    );
    assert_eq!(cfg, Settings::default());

    env::set_current_dir(orig).expect("restore cwd");
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    // load_config reads config/default.toml relative to the current dir
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [engine]
        strict_errors = true

        [persistence]
        path = "file_db"
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config().expect("load_config failed");
    assert!(cfg.engine.strict_errors);
    assert_eq!(cfg.persistence.path, "file_db");
    assert_eq!(cfg.persistence.ttl_secs, 86_400);
    assert_eq!(cfg.logging.level, "info");

    env::set_current_dir(orig).expect("restore cwd");
}

#[test]
#[serial]
fn load_config_env_overrides_file() {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    fs::write("config/default.toml", "[logging]\nlevel = \"warn\"\n").expect("write config file");

    let cfg = temp_env::with_vars(
        [
            ("POPFLOW__LOGGING__LEVEL", Some("debug")),
            ("POPFLOW__ENGINE__STRICT_ERRORS", Some("true")),
        ],
        || load_config().expect("load_config failed"),
    );
    assert_eq!(cfg.logging.level, "debug");
    assert!(cfg.engine.strict_errors);

    env::set_current_dir(orig).expect("restore cwd");
}
