// src/exec/profiles.rs

//! Mail-stack deployment profiles.
//!
//! Each profile drives the remote shell through its full install/configure/
//! start sequence and reports the stack it brought up.

use crate::config::DeployProfile;
use crate::engine::task::TaskError;
use crate::exec::shell::{RemoteShell, LONG_DOWNLOAD_TIMEOUT, PKG_INSTALL_TIMEOUT};
use crate::protocol::ErrorCode;

const SERVICE_CMD_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// What a profile deployment produced.
#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub stack: String,
}

/// Run the deployment sequence for the given profile.
pub async fn deploy(
    profile: DeployProfile,
    shell: &RemoteShell,
    domain: &str,
    hostname: &str,
    row_id: i64,
) -> Result<DeployOutcome, TaskError> {
    match profile {
        DeployProfile::PostfixDovecot => deploy_postfix_dovecot(shell, domain, hostname).await,
        DeployProfile::DockerMailserver => {
            deploy_docker_mailserver(shell, domain, hostname, row_id).await
        }
    }
}

async fn deploy_postfix_dovecot(
    shell: &RemoteShell,
    domain: &str,
    hostname: &str,
) -> Result<DeployOutcome, TaskError> {
    let packages = [
        "postfix",
        "dovecot-core",
        "dovecot-imapd",
        "dovecot-pop3d",
        "opendkim",
        "opendkim-tools",
        "mailutils",
    ];
    for package in packages {
        shell.install_package(package).await.map_err(|err| {
            deploy_error(format!("failed to install {package}: {err}"), &err)
        })?;
    }

    let main_cf = postfix_main_cf(domain, hostname);
    shell
        .write_file("/etc/postfix/main.cf", &main_cf)
        .await
        .map_err(|err| deploy_error(format!("failed to write postfix config: {err}"), &err))?;

    let dovecot_conf = dovecot_local_conf();
    shell
        .write_file("/etc/dovecot/local.conf", &dovecot_conf)
        .await
        .map_err(|err| deploy_error(format!("failed to write dovecot config: {err}"), &err))?;

    let opendkim_conf = opendkim_conf(domain);
    shell
        .write_file("/etc/opendkim.conf", &opendkim_conf)
        .await
        .map_err(|err| deploy_error(format!("failed to write opendkim config: {err}"), &err))?;

    for service in ["opendkim", "postfix", "dovecot"] {
        shell
            .exec_ok(&format!("systemctl enable {service}"), SERVICE_CMD_TIMEOUT)
            .await
            .map_err(|err| deploy_error(format!("failed to enable {service}: {err}"), &err))?;
        shell
            .exec_ok(&format!("systemctl restart {service}"), SERVICE_CMD_TIMEOUT)
            .await
            .map_err(|err| deploy_error(format!("failed to restart {service}: {err}"), &err))?;
    }

    Ok(DeployOutcome {
        stack: "Postfix + Dovecot".to_string(),
    })
}

async fn deploy_docker_mailserver(
    shell: &RemoteShell,
    domain: &str,
    hostname: &str,
    row_id: i64,
) -> Result<DeployOutcome, TaskError> {
    ensure_docker(shell).await?;

    let container = format!("mailserver-{row_id}");
    let compose = docker_compose_yaml(domain, hostname, &container);
    shell
        .exec_ok("mkdir -p /opt/mailserver", SERVICE_CMD_TIMEOUT)
        .await
        .map_err(|err| deploy_error(format!("failed to create /opt/mailserver: {err}"), &err))?;
    shell
        .write_file("/opt/mailserver/docker-compose.yml", &compose)
        .await
        .map_err(|err| deploy_error(format!("failed to write compose file: {err}"), &err))?;

    shell
        .exec_ok(
            "cd /opt/mailserver && docker compose up -d",
            LONG_DOWNLOAD_TIMEOUT,
        )
        .await
        .map_err(|err| deploy_error(format!("failed to start mailserver container: {err}"), &err))?;

    // Container readiness: the image takes a while on first boot.
    shell
        .exec_ok(
            &format!(
                "for i in $(seq 1 30); do docker inspect -f '{{{{.State.Running}}}}' {container} 2>/dev/null | grep -q true && exit 0; sleep 2; done; exit 1"
            ),
            PKG_INSTALL_TIMEOUT,
        )
        .await
        .map_err(|err| deploy_error("mailserver container did not become ready".to_string(), &err))?;

    Ok(DeployOutcome {
        stack: "Docker MailServer".to_string(),
    })
}

async fn ensure_docker(shell: &RemoteShell) -> Result<(), TaskError> {
    let check = shell
        .exec("docker --version", SERVICE_CMD_TIMEOUT)
        .await?;
    if check.exit_code == 0 {
        return Ok(());
    }

    shell
        .exec_ok("apt-get update", PKG_INSTALL_TIMEOUT)
        .await
        .map_err(|err| deploy_error(format!("apt-get update failed: {err}"), &err))?;

    for package in ["ca-certificates", "curl", "gnupg"] {
        shell.install_package(package).await.map_err(|err| {
            deploy_error(format!("failed to install {package}: {err}"), &err)
        })?;
    }

    shell
        .exec_ok(
            "curl -fsSL https://get.docker.com | sh",
            LONG_DOWNLOAD_TIMEOUT,
        )
        .await
        .map_err(|err| deploy_error(format!("docker installation failed: {err}"), &err))?;

    Ok(())
}

/// Preserve transport-level codes (connection, timeout, auth, cancel);
/// everything else becomes DEPLOY_FAILED with the step-level context.
fn deploy_error(message: String, source: &TaskError) -> TaskError {
    match source.code {
        ErrorCode::SshConn
        | ErrorCode::SshTimeout
        | ErrorCode::AuthFailed
        | ErrorCode::Cancelled => source.clone(),
        _ => TaskError::new(ErrorCode::DeployFailed, message),
    }
}

fn postfix_main_cf(domain: &str, hostname: &str) -> String {
    format!(
        r#"myhostname = {hostname}.{domain}
mydomain = {domain}
myorigin = $mydomain
inet_interfaces = all
inet_protocols = all
mydestination = $myhostname, localhost.$mydomain, localhost, $mydomain
mynetworks = 127.0.0.0/8 [::ffff:127.0.0.0]/104 [::1]/128
home_mailbox = Maildir/

smtpd_sasl_auth_enable = yes
smtpd_sasl_type = dovecot
smtpd_sasl_path = private/auth
smtpd_sasl_security_options = noanonymous, noplaintext
smtpd_sasl_tls_security_options = noanonymous

smtpd_tls_cert_file = /etc/ssl/certs/ssl-cert-snakeoil.pem
smtpd_tls_key_file = /etc/ssl/private/ssl-cert-snakeoil.key
smtpd_tls_security_level = may
smtp_tls_security_level = may
smtpd_tls_protocols = !SSLv2, !SSLv3

message_size_limit = 25600000
mailbox_size_limit = 1000000000

milter_protocol = 2
milter_default_action = accept
smtpd_milters = inet:localhost:12301
non_smtpd_milters = inet:localhost:12301
"#
    )
}

fn dovecot_local_conf() -> String {
    r#"protocols = imap pop3
mail_location = maildir:~/Maildir

service auth {
  unix_listener /var/spool/postfix/private/auth {
    mode = 0660
    user = postfix
    group = postfix
  }
}

ssl = yes
ssl_cert = </etc/ssl/certs/ssl-cert-snakeoil.pem
ssl_key = </etc/ssl/private/ssl-cert-snakeoil.key
"#
    .to_string()
}

fn opendkim_conf(domain: &str) -> String {
    format!(
        r#"Syslog yes
UMask 002
Domain {domain}
KeyFile /etc/opendkim/keys/{domain}/mail.private
Selector mail
Socket inet:12301@localhost
"#
    )
}

fn docker_compose_yaml(domain: &str, hostname: &str, container: &str) -> String {
    format!(
        r#"services:
  mailserver:
    image: ghcr.io/docker-mailserver/docker-mailserver:latest
    container_name: {container}
    hostname: {hostname}.{domain}
    ports:
      - "25:25"
      - "143:143"
      - "465:465"
      - "587:587"
      - "993:993"
    volumes:
      - /opt/mailserver/data:/var/mail
      - /opt/mailserver/state:/var/mail-state
      - /opt/mailserver/config:/tmp/docker-mailserver
    environment:
      - ENABLE_OPENDKIM=1
      - PERMIT_DOCKER=network
    restart: always
"#
    )
}
