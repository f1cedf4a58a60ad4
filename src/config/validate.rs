// src/config/validate.rs

//! Semantic checks on loaded configuration.
//!
//! Per-row field validation lives in the `validate_input` pipeline step;
//! here we only reject configurations the engine cannot run at all.

use std::collections::HashSet;

use anyhow::{bail, Result};

use crate::config::model::{AppConfig, ServerRow};

/// Sanity-check global app config values.
pub fn validate_app_config(config: &AppConfig) -> Result<()> {
    if config.concurrency_default == 0 {
        bail!("concurrency_default must be at least 1");
    }
    if config.ssh_timeout_ms == 0 {
        bail!("ssh_timeout_ms must be positive");
    }
    if config.cmd_timeout_ms == 0 {
        bail!("cmd_timeout_ms must be positive");
    }
    Ok(())
}

/// Check run-level invariants over the loaded fleet: row ids must be
/// positive and unique within the run.
pub fn validate_fleet(rows: &[ServerRow]) -> Result<()> {
    let mut seen: HashSet<i64> = HashSet::new();

    for row in rows {
        if row.row_id <= 0 {
            bail!("row id {} is not a positive integer", row.row_id);
        }
        if !seen.insert(row.row_id) {
            bail!("duplicate row id {} in fleet CSV", row.row_id);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::AppConfig;

    fn row(id: i64) -> ServerRow {
        ServerRow {
            row_id: id,
            cf_api_token: "tok".into(),
            cf_zone: "example.com".into(),
            server_ip: "203.0.113.5".into(),
            server_port: 22,
            server_user: "root".into(),
            server_password: String::new(),
            server_key_path: String::new(),
            host: "mail".into(),
            domain: "example.com".into(),
            deploy_profile: "postfix_dovecot".into(),
            email_use: String::new(),
            solution: String::new(),
        }
    }

    #[test]
    fn default_app_config_is_valid() {
        assert!(validate_app_config(&AppConfig::default()).is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = AppConfig {
            concurrency_default: 0,
            ..AppConfig::default()
        };
        assert!(validate_app_config(&config).is_err());
    }

    #[test]
    fn duplicate_row_ids_are_rejected() {
        assert!(validate_fleet(&[row(1), row(2)]).is_ok());
        assert!(validate_fleet(&[row(1), row(1)]).is_err());
        assert!(validate_fleet(&[row(0)]).is_err());
    }
}
