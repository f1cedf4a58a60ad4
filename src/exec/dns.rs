// src/exec/dns.rs

//! Cloudflare DNS provider.
//!
//! Thin client over the v4 API: zone lookup by name, record lookup, and
//! upsert. In dry-run mode every mutating call returns without touching the
//! API; the caller logs what would have happened.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::engine::task::TaskError;
use crate::protocol::ErrorCode;

const API_BASE: &str = "https://api.cloudflare.com/client/v4";
const RECORD_TTL: u32 = 3600;

/// Render `{server_ip}` / `{domain}` / `{host}` placeholders in a record
/// template.
pub fn render_template(template: &str, server_ip: &str, domain: &str, host: &str) -> String {
    template
        .replace("{server_ip}", server_ip)
        .replace("{domain}", domain)
        .replace("{host}", host)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub record_type: String,
    pub name: String,
    pub content: String,
    pub ttl: u32,
    pub proxied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[allow(dead_code)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
}

/// A provider bound to one zone and one API token.
///
/// Every API call races against the task's cancellation token, the same way
/// the shell transport does for remote commands.
pub struct CloudflareDns {
    client: Client,
    token: String,
    zone: String,
    dry_run: bool,
    cancel: CancellationToken,
}

impl CloudflareDns {
    pub fn new(
        token: &str,
        zone: &str,
        dry_run: bool,
        cancel: CancellationToken,
    ) -> Result<Self, TaskError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| {
                TaskError::new(
                    ErrorCode::RemoteCmdTransient,
                    format!("failed to build HTTP client: {err}"),
                )
            })?;

        Ok(Self {
            client,
            token: token.to_string(),
            zone: zone.to_string(),
            dry_run,
            cancel,
        })
    }

    /// Send one request, returning promptly if the task is cancelled
    /// mid-flight.
    async fn dispatch(&self, request: RequestBuilder) -> Result<reqwest::Response, TaskError> {
        tokio::select! {
            response = request.send() => response.map_err(transport_error),
            _ = self.cancel.cancelled() => {
                Err(TaskError::new(ErrorCode::Cancelled, "task cancelled"))
            }
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Fully qualify a record name within the bound zone. `@` names the
    /// zone apex.
    pub fn qualify(&self, name: &str) -> String {
        if name == "@" || name == self.zone {
            self.zone.clone()
        } else if name.ends_with(&format!(".{}", self.zone)) {
            name.to_string()
        } else {
            format!("{name}.{}", self.zone)
        }
    }

    /// Create the record, or update it in place when one with the same type
    /// and name already exists.
    pub async fn upsert(
        &self,
        record_type: &str,
        name: &str,
        content: &str,
        priority: Option<u16>,
    ) -> Result<(), TaskError> {
        if self.dry_run {
            return Ok(());
        }

        let zone_id = self.zone_id().await?;
        let full_name = self.qualify(name);
        let existing = self.find_record(&zone_id, record_type, &full_name).await?;

        let record = DnsRecord {
            id: None,
            record_type: record_type.to_string(),
            name: full_name,
            content: content.to_string(),
            ttl: RECORD_TTL,
            proxied: false,
            priority,
        };

        match existing.and_then(|record| record.id) {
            Some(record_id) => {
                let url = format!("{API_BASE}/zones/{zone_id}/dns_records/{record_id}");
                let response = self
                    .dispatch(self.client.put(&url).bearer_auth(&self.token).json(&record))
                    .await?;
                check_response::<DnsRecord>(response).await.map(|_| ())
            }
            None => {
                let url = format!("{API_BASE}/zones/{zone_id}/dns_records");
                let response = self
                    .dispatch(self.client.post(&url).bearer_auth(&self.token).json(&record))
                    .await?;
                check_response::<DnsRecord>(response).await.map(|_| ())
            }
        }
    }

    async fn zone_id(&self) -> Result<String, TaskError> {
        let url = format!("{API_BASE}/zones?name={}", self.zone);
        let response = self
            .dispatch(self.client.get(&url).bearer_auth(&self.token))
            .await?;

        let zones: Vec<Zone> = check_response(response).await?;
        zones
            .into_iter()
            .next()
            .map(|zone| zone.id)
            .ok_or_else(|| {
                TaskError::new(
                    ErrorCode::DnsAuthFailed,
                    format!("zone not found: {}", self.zone),
                )
            })
    }

    async fn find_record(
        &self,
        zone_id: &str,
        record_type: &str,
        name: &str,
    ) -> Result<Option<DnsRecord>, TaskError> {
        let url = format!(
            "{API_BASE}/zones/{zone_id}/dns_records?type={record_type}&name={name}&per_page=100"
        );
        let response = self
            .dispatch(self.client.get(&url).bearer_auth(&self.token))
            .await?;

        let records: Vec<DnsRecord> = check_response(response).await?;
        Ok(records.into_iter().next())
    }
}

fn transport_error(err: reqwest::Error) -> TaskError {
    TaskError::new(
        ErrorCode::RemoteCmdTransient,
        format!("DNS API request failed: {err}"),
    )
}

/// Map HTTP and API-level failures onto the task error taxonomy:
/// 401/403 are fatal auth errors, 429 is retryable rate limiting.
async fn check_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, TaskError> {
    let status = response.status();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(TaskError::new(
            ErrorCode::DnsAuthFailed,
            format!("DNS API rejected credentials ({status})"),
        ));
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(TaskError::new(
            ErrorCode::DnsRateLimit,
            "DNS API rate limit exceeded",
        ));
    }

    let body: ApiResponse<T> = response.json().await.map_err(|err| {
        TaskError::new(
            ErrorCode::RemoteCmdTransient,
            format!("failed to parse DNS API response: {err}"),
        )
    })?;

    if !body.success {
        let message = body
            .errors
            .first()
            .map(|error| error.message.clone())
            .unwrap_or_else(|| "unspecified DNS API error".to_string());
        return Err(TaskError::new(
            ErrorCode::DnsAuthFailed,
            format!("DNS API error: {message}"),
        ));
    }

    body.result.ok_or_else(|| {
        TaskError::new(
            ErrorCode::RemoteCmdTransient,
            "DNS API response missing result",
        )
    })
}
