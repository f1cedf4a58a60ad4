// src/exec/steps.rs

//! Production implementations of the eight pipeline steps.
//!
//! Steps only talk to the outside world through [`RemoteShell`] and
//! [`CloudflareDns`], and only hand data forward through the scratchpad.
//! Under `dry_run`, every remote-touching step logs its intent and succeeds
//! without I/O, so the event stream keeps its shape.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::DeployProfile;
use crate::engine::task::{DkimArtifact, DnsAction, DnsChange, Scratch, TaskError};
use crate::exec::dns::{render_template, CloudflareDns};
use crate::exec::healthcheck::run_checks;
use crate::exec::profiles;
use crate::exec::shell::{RemoteShell, PKG_INSTALL_TIMEOUT, PROBE_TIMEOUT};
use crate::exec::step::{ExecutorSet, StepContext, StepExecutor, StepOutput};
use crate::protocol::{ErrorCode, Step};

/// Build the full production executor set.
pub fn production_suite() -> ExecutorSet {
    let mut suite = ExecutorSet::new();
    suite.register(Step::ValidateInput, Arc::new(ValidateInput));
    suite.register(Step::SshConnectTest, Arc::new(SshConnectTest));
    suite.register(Step::ServerPrepare, Arc::new(ServerPrepare));
    suite.register(Step::DeployMailstack, Arc::new(DeployMailstack));
    suite.register(Step::GenerateDkim, Arc::new(GenerateDkim));
    suite.register(Step::DnsApply, Arc::new(DnsApply));
    suite.register(Step::Healthcheck, Arc::new(Healthcheck));
    suite.register(Step::FinalizeReport, Arc::new(FinalizeReport));
    suite
}

fn shell_for(ctx: &StepContext) -> RemoteShell {
    RemoteShell::for_row(&ctx.row, &ctx.config, ctx.cancel.clone())
}

fn missing(field: &str) -> TaskError {
    TaskError::new(
        ErrorCode::MissingRequiredField,
        format!("{field} is required"),
    )
}

/// Check a row's required fields. Used by the scheduler before a task
/// enters Running and again by the `validate_input` step.
pub fn validate_row(row: &crate::config::ServerRow) -> Result<(), TaskError> {
    if row.cf_api_token.is_empty() {
        return Err(missing("cf_api_token"));
    }
    if row.cf_zone.is_empty() {
        return Err(missing("cf_zone"));
    }
    if row.server_ip.is_empty() {
        return Err(missing("server_ip"));
    }
    if row.domain.is_empty() {
        return Err(missing("domain"));
    }
    if row.server_port == 0 {
        return Err(TaskError::new(
            ErrorCode::InvalidConfig,
            "server_port must be positive",
        ));
    }
    if row.server_user.is_empty() {
        return Err(TaskError::new(
            ErrorCode::InvalidConfig,
            "server_user must be specified",
        ));
    }
    Ok(())
}

struct ValidateInput;

#[async_trait]
impl StepExecutor for ValidateInput {
    async fn execute(
        &self,
        ctx: &StepContext,
        _scratch: &mut Scratch,
    ) -> Result<StepOutput, TaskError> {
        ctx.info("validating input configuration");
        validate_row(&ctx.row)?;
        ctx.info("input validation passed");
        Ok(StepOutput::message("input validation passed"))
    }
}

struct SshConnectTest;

#[async_trait]
impl StepExecutor for SshConnectTest {
    async fn execute(
        &self,
        ctx: &StepContext,
        _scratch: &mut Scratch,
    ) -> Result<StepOutput, TaskError> {
        if ctx.dry_run {
            ctx.info("[dry-run] skipping SSH connection test");
            return Ok(StepOutput::message("skipped (dry run)"));
        }

        ctx.info(&format!(
            "testing SSH connection to {}:{}",
            ctx.row.server_ip, ctx.row.server_port
        ));
        shell_for(ctx).test_connection().await?;
        ctx.info("SSH connection successful");
        Ok(StepOutput::message("SSH connection successful"))
    }
}

struct ServerPrepare;

/// Packages installed on every target before the mail stack.
const COMMON_PACKAGES: [&str; 6] = [
    "apt-transport-https",
    "ca-certificates",
    "curl",
    "gnupg",
    "lsb-release",
    "net-tools",
];

#[async_trait]
impl StepExecutor for ServerPrepare {
    async fn execute(
        &self,
        ctx: &StepContext,
        _scratch: &mut Scratch,
    ) -> Result<StepOutput, TaskError> {
        if ctx.dry_run {
            ctx.info("[dry-run] skipping server preparation");
            return Ok(StepOutput::message("skipped (dry run)"));
        }

        let shell = shell_for(ctx);

        ctx.info("updating package lists");
        shell
            .exec_ok("apt-get update", PKG_INSTALL_TIMEOUT)
            .await
            .map_err(|err| match err.code {
                ErrorCode::RemoteCmdTransient => TaskError::new(
                    ErrorCode::DeployFailed,
                    format!("failed to update package lists: {err}"),
                ),
                _ => err,
            })?;

        ctx.info("installing common dependencies");
        for package in COMMON_PACKAGES {
            if let Err(err) = shell.install_package(package).await {
                if err.code == ErrorCode::Cancelled {
                    return Err(err);
                }
                // Non-critical packages: record and keep going.
                ctx.warn(&format!("failed to install {package}: {err}"));
            }
        }

        ctx.info("server preparation completed");
        Ok(StepOutput::message("server prepared"))
    }
}

struct DeployMailstack;

#[async_trait]
impl StepExecutor for DeployMailstack {
    async fn execute(
        &self,
        ctx: &StepContext,
        _scratch: &mut Scratch,
    ) -> Result<StepOutput, TaskError> {
        let profile = DeployProfile::from_tag(&ctx.row.deploy_profile).ok_or_else(|| {
            TaskError::new(
                ErrorCode::InvalidConfig,
                format!("unknown deploy profile: {}", ctx.row.deploy_profile),
            )
        })?;

        if ctx.dry_run {
            ctx.info(&format!(
                "[dry-run] would deploy {} to {}",
                ctx.row.deploy_profile, ctx.row.server_ip
            ));
            return Ok(StepOutput::message("skipped (dry run)"));
        }

        ctx.info(&format!("deploying {} profile", ctx.row.deploy_profile));
        let shell = shell_for(ctx);
        let outcome = profiles::deploy(
            profile,
            &shell,
            &ctx.row.domain,
            &ctx.row.host,
            ctx.row.row_id,
        )
        .await?;

        ctx.info(&format!("deployment completed: {}", outcome.stack));
        Ok(StepOutput::message(format!("deployed {}", outcome.stack)))
    }
}

struct GenerateDkim;

#[async_trait]
impl StepExecutor for GenerateDkim {
    async fn execute(
        &self,
        ctx: &StepContext,
        scratch: &mut Scratch,
    ) -> Result<StepOutput, TaskError> {
        let selector = dkim_selector(ctx);

        if ctx.dry_run {
            ctx.info("[dry-run] skipping DKIM key generation");
            return Ok(StepOutput::message("skipped (dry run)"));
        }

        ctx.info(&format!(
            "generating DKIM key for {} (selector {selector})",
            ctx.row.domain
        ));
        let shell = shell_for(ctx);

        let record = match DeployProfile::from_tag(&ctx.row.deploy_profile) {
            Some(DeployProfile::DockerMailserver) => {
                generate_docker_dkim(ctx, &shell, &selector).await?
            }
            _ => generate_opendkim(ctx, &shell, &selector).await?,
        };

        let mut output = StepOutput::message("DKIM key generated");
        if let Some(record) = record {
            output.dns_changes.push(DnsChange {
                record_type: "TXT".to_string(),
                name: format!("{selector}._domainkey"),
                content: record.clone(),
                action: DnsAction::Pending,
            });
            scratch.dkim = Some(DkimArtifact { selector, record });
            ctx.info("DKIM key generated successfully");
        } else {
            ctx.warn("DKIM public key could not be read; DNS record will be skipped");
        }

        Ok(output)
    }
}

struct DnsApply;

#[async_trait]
impl StepExecutor for DnsApply {
    async fn execute(
        &self,
        ctx: &StepContext,
        scratch: &mut Scratch,
    ) -> Result<StepOutput, TaskError> {
        let row = &ctx.row;
        let dry_run = ctx.dns_dry_run || ctx.dry_run;
        let dns = CloudflareDns::new(
            &row.cf_api_token,
            &row.cf_zone,
            dry_run,
            ctx.cancel.clone(),
        )?;

        let spf = match render_template(&ctx.config.spf_template, &row.server_ip, &row.domain, &row.host) {
            rendered if rendered.is_empty() => "v=spf1 mx -all".to_string(),
            rendered => rendered,
        };
        let dmarc = match render_template(&ctx.config.dmarc_template, &row.server_ip, &row.domain, &row.host) {
            rendered if rendered.is_empty() => {
                format!("v=DMARC1; p=none; rua=mailto:dmarc@{}", row.cf_zone)
            }
            rendered => rendered,
        };
        let dkim = scratch.dkim.clone();

        if dns.is_dry_run() {
            ctx.info("[dry-run] DNS changes that would be applied:");
            ctx.info(&format!("  A: {} -> {}", row.host, row.server_ip));
            ctx.info(&format!("  MX: {} -> {} (priority 10)", row.domain, row.host));
            ctx.info(&format!("  TXT (@): {spf}"));
            ctx.info(&format!("  TXT (_dmarc): {dmarc}"));
            if let Some(dkim) = &dkim {
                ctx.info(&format!("  TXT ({}._domainkey): {}", dkim.selector, dkim.record));
            }
            return Ok(StepOutput::message("DNS dry run logged"));
        }

        let mut output = StepOutput::message("DNS records applied");

        ctx.info("creating/updating A record");
        dns.upsert("A", &row.host, &row.server_ip, None).await?;
        output.dns_changes.push(DnsChange {
            record_type: "A".to_string(),
            name: dns.qualify(&row.host),
            content: row.server_ip.clone(),
            action: DnsAction::Create,
        });

        ctx.info("creating/updating MX record");
        let mx_target = dns.qualify(&row.host);
        dns.upsert("MX", "@", &mx_target, Some(10)).await?;
        output.dns_changes.push(DnsChange {
            record_type: "MX".to_string(),
            name: row.domain.clone(),
            content: format!("{mx_target} (priority 10)"),
            action: DnsAction::Create,
        });

        // SPF, DMARC and DKIM failures are non-fatal: log a warning but
        // still record the attempted change in the report.
        ctx.info("creating/updating SPF TXT record");
        if let Err(err) = dns.upsert("TXT", "@", &spf, None).await {
            if err.code == ErrorCode::Cancelled {
                return Err(err);
            }
            ctx.warn(&format!("failed to create SPF record: {err}"));
        }
        output.dns_changes.push(DnsChange {
            record_type: "TXT".to_string(),
            name: "@".to_string(),
            content: spf,
            action: DnsAction::Create,
        });

        ctx.info("creating/updating DMARC TXT record");
        if let Err(err) = dns.upsert("TXT", "_dmarc", &dmarc, None).await {
            if err.code == ErrorCode::Cancelled {
                return Err(err);
            }
            ctx.warn(&format!("failed to create DMARC record: {err}"));
        }
        output.dns_changes.push(DnsChange {
            record_type: "TXT".to_string(),
            name: "_dmarc".to_string(),
            content: dmarc,
            action: DnsAction::Create,
        });

        if let Some(dkim) = dkim {
            ctx.info("creating/updating DKIM TXT record");
            let name = format!("{}._domainkey", dkim.selector);
            if let Err(err) = dns.upsert("TXT", &name, &dkim.record, None).await {
                if err.code == ErrorCode::Cancelled {
                    return Err(err);
                }
                ctx.warn(&format!("failed to create DKIM record: {err}"));
            }
            output.dns_changes.push(DnsChange {
                record_type: "TXT".to_string(),
                name,
                content: dkim.record,
                action: DnsAction::Create,
            });
        }

        ctx.info("DNS records applied successfully");
        Ok(output)
    }
}

struct Healthcheck;

#[async_trait]
impl StepExecutor for Healthcheck {
    async fn execute(
        &self,
        ctx: &StepContext,
        _scratch: &mut Scratch,
    ) -> Result<StepOutput, TaskError> {
        if ctx.dry_run {
            ctx.info("[dry-run] skipping health checks");
            return Ok(StepOutput::message("skipped (dry run)"));
        }

        ctx.info("performing health checks");
        let profile =
            DeployProfile::from_tag(&ctx.row.deploy_profile).unwrap_or(DeployProfile::PostfixDovecot);
        let shell = shell_for(ctx);
        let snapshot = run_checks(&shell, profile).await?;

        for (port, open) in &snapshot.ports {
            if *open {
                ctx.info(&format!("port {port}: open"));
            } else {
                ctx.warn(&format!("port {port}: closed or not responding"));
            }
        }
        for (service, status) in &snapshot.services {
            ctx.info(&format!("service {service}: {status}"));
        }

        let mut output = StepOutput::message("health checks completed");
        output.ports = snapshot.ports;
        output.services = snapshot.services;
        Ok(output)
    }
}

struct FinalizeReport;

#[async_trait]
impl StepExecutor for FinalizeReport {
    async fn execute(
        &self,
        ctx: &StepContext,
        _scratch: &mut Scratch,
    ) -> Result<StepOutput, TaskError> {
        let row = &ctx.row;
        ctx.info(&format!(
            "deployment finished for {} ({}:{}, profile {})",
            row.domain, row.server_ip, row.server_port, row.deploy_profile
        ));
        ctx.info(&format!(
            "access: SMTP {host}.{domain}:25, IMAP {host}.{domain}:143",
            host = row.host,
            domain = row.domain
        ));
        Ok(StepOutput::message("report finalized"))
    }
}

fn dkim_selector(ctx: &StepContext) -> String {
    if ctx.config.dkim_selector.is_empty() {
        "s1".to_string()
    } else {
        ctx.config.dkim_selector.clone()
    }
}

async fn generate_opendkim(
    ctx: &StepContext,
    shell: &RemoteShell,
    selector: &str,
) -> Result<Option<String>, TaskError> {
    let domain = &ctx.row.domain;

    if let Err(err) = shell.install_package("opendkim-tools").await {
        if err.code == ErrorCode::Cancelled {
            return Err(err);
        }
        ctx.warn(&format!("failed to install opendkim-tools: {err}"));
    }

    let key_dir = format!("/etc/opendkim/keys/{domain}");
    shell
        .exec_ok(&format!("mkdir -p {key_dir}"), PROBE_TIMEOUT)
        .await
        .map_err(|err| {
            TaskError::new(
                ErrorCode::DeployFailed,
                format!("failed to create DKIM key directory: {err}"),
            )
        })?;

    shell
        .exec_ok(
            &format!("opendkim-genkey -b 2048 -r -s {selector} -d {domain} -D {key_dir}"),
            shell.default_timeout(),
        )
        .await
        .map_err(|err| {
            TaskError::new(
                ErrorCode::DeployFailed,
                format!("failed to generate DKIM key: {err}"),
            )
        })?;

    match shell
        .exec_ok(&format!("cat {key_dir}/{selector}.txt"), PROBE_TIMEOUT)
        .await
    {
        Ok(raw) => Ok(Some(normalize_dkim_record(&raw))),
        Err(err) if err.code == ErrorCode::Cancelled => Err(err),
        Err(err) => {
            ctx.warn(&format!("failed to read DKIM public key: {err}"));
            Ok(None)
        }
    }
}

async fn generate_docker_dkim(
    ctx: &StepContext,
    shell: &RemoteShell,
    selector: &str,
) -> Result<Option<String>, TaskError> {
    let container = format!("mailserver-{}", ctx.row.row_id);
    let domain = &ctx.row.domain;

    shell
        .exec_ok(
            &format!(
                "docker exec {container} setup config dkim selector {selector} domain {domain}"
            ),
            shell.default_timeout(),
        )
        .await
        .map_err(|err| {
            TaskError::new(
                ErrorCode::DeployFailed,
                format!("failed to generate DKIM inside container: {err}"),
            )
        })?;

    let key_path =
        format!("/opt/mailserver/config/opendkim/keys/{domain}/{selector}.txt");
    match shell
        .exec_ok(&format!("cat {key_path}"), PROBE_TIMEOUT)
        .await
    {
        Ok(raw) => Ok(Some(normalize_dkim_record(&raw))),
        Err(err) if err.code == ErrorCode::Cancelled => Err(err),
        Err(err) => {
            ctx.warn(&format!("failed to read DKIM public key: {err}"));
            Ok(None)
        }
    }
}

/// Collapse an `opendkim-genkey` zone-file fragment into a single
/// `v=DKIM1; k=rsa; p=...` record value.
fn normalize_dkim_record(raw: &str) -> String {
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        if let Some((_, rest)) = line.split_once("p=") {
            let key: String = rest
                .trim_start_matches('"')
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
                .collect();
            if !key.is_empty() {
                return format!("v=DKIM1; k=rsa; p={key}");
            }
        }
    }
    raw.trim().to_string()
}
