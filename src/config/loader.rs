// src/config/loader.rs

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::config::model::{AppConfig, ServerRow};
use crate::config::validate::validate_app_config;

/// Number of data columns every fleet CSV row must have.
const FLEET_COLUMNS: usize = 13;

/// Load the application config from a JSON file.
///
/// Missing keys take their defaults; see [`AppConfig`].
pub fn load_app_config(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading app config at {path:?}"))?;

    let config: AppConfig = serde_json::from_str(&contents)
        .with_context(|| format!("parsing JSON app config from {path:?}"))?;

    validate_app_config(&config)?;
    Ok(config)
}

/// Load the fleet CSV: one header row, then exactly 13 columns per row.
///
/// Any malformed row aborts the whole load; partial runs are not a thing.
pub fn load_fleet(path: impl AsRef<Path>) -> Result<Vec<ServerRow>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening fleet CSV at {path:?}"))?;

    let mut rows = Vec::new();

    for (index, record) in reader.records().enumerate() {
        // Header is row 1; data starts at row 2.
        let line = index + 2;
        let record = record.with_context(|| format!("reading fleet CSV row {line}"))?;

        if record.len() != FLEET_COLUMNS {
            bail!(
                "fleet CSV row {line} has {} columns, expected {FLEET_COLUMNS}",
                record.len()
            );
        }

        let row_id: i64 = record[0]
            .trim()
            .parse()
            .with_context(|| format!("fleet CSV row {line}: row_id {:?} is not numeric", &record[0]))?;

        let server_port: u16 = match record[4].trim() {
            "" => 22,
            raw => raw.parse().unwrap_or(22),
        };

        rows.push(ServerRow {
            row_id,
            cf_api_token: record[1].trim().to_string(),
            cf_zone: record[2].trim().to_string(),
            server_ip: record[3].trim().to_string(),
            server_port,
            server_user: record[5].trim().to_string(),
            server_password: record[6].trim().to_string(),
            server_key_path: record[7].trim().to_string(),
            host: record[8].trim().to_string(),
            domain: record[9].trim().to_string(),
            deploy_profile: record[10].trim().to_string(),
            email_use: record[11].trim().to_string(),
            solution: record[12].trim().to_string(),
        });
    }

    if rows.is_empty() {
        bail!("fleet CSV at {path:?} has no data rows");
    }

    Ok(rows)
}
