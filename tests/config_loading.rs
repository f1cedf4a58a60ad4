// tests/config_loading.rs

mod common;

use std::error::Error;
use std::fs;

use mailfleet::config::{load_app_config, load_fleet, validate_fleet};

type TestResult = Result<(), Box<dyn Error>>;

const HEADER: &str = "row_id,cf_api_token,cf_zone,server_ip,server_port,server_user,server_password,server_key_path,host,domain,deploy_profile,email_use,solution";

#[test]
fn fleet_csv_parses_all_thirteen_fields() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fleet.csv");
    fs::write(
        &path,
        format!(
            "{HEADER}\n1,tok-abc,example.com,203.0.113.5,22,root,,/keys/id1,mail,example.com,postfix_dovecot,newsletter,managed\n2,tok-def,example.org,203.0.113.6,,deploy,hunter22,,mx,example.org,docker_mailserver,support,selfhosted\n"
        ),
    )?;

    let rows = load_fleet(&path)?;
    assert_eq!(rows.len(), 2);

    assert_eq!(rows[0].row_id, 1);
    assert_eq!(rows[0].cf_zone, "example.com");
    assert_eq!(rows[0].server_port, 22);
    assert_eq!(rows[0].deploy_profile, "postfix_dovecot");

    // Blank port falls back to 22.
    assert_eq!(rows[1].server_port, 22);
    assert_eq!(rows[1].server_password, "hunter22");
    assert_eq!(rows[1].solution, "selfhosted");

    validate_fleet(&rows)?;
    Ok(())
}

#[test]
fn wrong_column_count_aborts_the_load() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fleet.csv");
    fs::write(
        &path,
        format!("{HEADER}\n1,tok,zone,ip,22,root,,,mail,example.com,postfix_dovecot,use\n"),
    )?;

    let result = load_fleet(&path);
    assert!(result.is_err());
    let message = format!("{:#}", result.unwrap_err());
    assert!(message.contains("columns"), "unexpected error: {message}");

    Ok(())
}

#[test]
fn non_numeric_row_id_aborts_the_load() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fleet.csv");
    fs::write(
        &path,
        format!("{HEADER}\nfirst,tok,zone,ip,22,root,,,mail,example.com,postfix_dovecot,use,sol\n"),
    )?;

    assert!(load_fleet(&path).is_err());
    Ok(())
}

#[test]
fn empty_fleet_is_rejected() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fleet.csv");
    fs::write(&path, format!("{HEADER}\n"))?;

    assert!(load_fleet(&path).is_err());
    Ok(())
}

#[test]
fn app_config_defaults_apply_to_empty_object() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("app.config.json");
    fs::write(&path, "{}")?;

    let config = load_app_config(&path)?;
    assert_eq!(config.concurrency_default, 10);
    assert_eq!(config.retry_max, 2);
    assert_eq!(config.retry_backoff_ms, 1000);
    assert_eq!(config.dkim_selector, "s1");
    assert!(config.log_masking);

    Ok(())
}

#[test]
fn app_config_overrides_are_honored() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("app.config.json");
    fs::write(
        &path,
        r#"{"concurrency_default": 3, "retry_max": 0, "dkim_selector": "mail2026", "spf_template": "v=spf1 ip4:{server_ip} -all"}"#,
    )?;

    let config = load_app_config(&path)?;
    assert_eq!(config.concurrency_default, 3);
    assert_eq!(config.retry_max, 0);
    assert_eq!(config.dkim_selector, "mail2026");
    assert_eq!(config.spf_template, "v=spf1 ip4:{server_ip} -all");

    Ok(())
}

#[test]
fn malformed_app_config_is_an_error() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("app.config.json");
    fs::write(&path, "{not json")?;

    assert!(load_app_config(&path).is_err());
    assert!(load_app_config(dir.path().join("missing.json")).is_err());
    Ok(())
}
