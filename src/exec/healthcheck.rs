// src/exec/healthcheck.rs

//! Post-deployment health observation.
//!
//! Results are observational: a closed port or inactive service does not
//! fail the task, it is recorded in the report for the operator.

use std::collections::BTreeMap;

use crate::config::DeployProfile;
use crate::engine::task::HealthSnapshot;
use crate::exec::shell::RemoteShell;

/// Mail-relevant ports probed on every deployment.
pub const MAIL_PORTS: [u16; 5] = [25, 587, 465, 143, 993];

/// Probe ports and service status over the remote shell.
///
/// Transport-level failures (connection loss, cancellation) propagate; a
/// probe that merely reports "closed" or "inactive" does not.
pub async fn run_checks(
    shell: &RemoteShell,
    profile: DeployProfile,
) -> Result<HealthSnapshot, crate::engine::task::TaskError> {
    let mut ports = BTreeMap::new();
    for port in MAIL_PORTS {
        let open = shell.check_port(port).await?;
        ports.insert(port.to_string(), open);
    }

    let mut services = BTreeMap::new();
    for service in profile.services() {
        let status = shell.service_status(service).await?;
        services.insert(service.to_string(), status);
    }

    Ok(HealthSnapshot { ports, services })
}
