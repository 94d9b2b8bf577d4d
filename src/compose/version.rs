//! Best-effort version resolution for running containers.

use super::runner::{CommandRunner, Invocation};
use super::status::ServiceStatus;
use crate::bridges::SERVICE_PREFIX;

const VERSION_LABEL: &str = r#"{{index .Config.Labels "org.opencontainers.image.version"}}"#;

/// Drop a leading `v` and everything from the first `+`.
pub fn clean_version(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let base = raw.split('+').next().unwrap_or(raw).trim();
    let base = base.strip_prefix('v').unwrap_or(base);
    if base.is_empty() || base == "<no value>" {
        None
    } else {
        Some(base.to_string())
    }
}

/// Tag of an image reference unless it is `latest` or absent.
pub fn explicit_tag(image: &str) -> Option<&str> {
    let (_, tag) = image.rsplit_once(':')?;
    if tag.is_empty() || tag == "latest" || tag.contains('/') {
        None
    } else {
        Some(tag)
    }
}

/// `mautrix-whatsapp v26.01+dev.4d9366c2 (built at ...)` -> second token.
pub fn from_binary_output(out: &str) -> Option<String> {
    out.split_whitespace().nth(1).and_then(clean_version)
}

pub fn from_package_metadata(out: &str) -> Option<String> {
    out.lines()
        .find_map(|l| l.strip_prefix("Version:"))
        .and_then(clean_version)
}

async fn stdout_of(runner: &dyn CommandRunner, inv: Invocation) -> Option<String> {
    match runner.run(&inv).await {
        Ok(out) if out.success => Some(out.stdout),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(command = %inv.command_line(), error = %e, "version probe failed");
            None
        }
    }
}

/// Label, then explicit tag, then the bridge binary, then package metadata.
pub async fn resolve(runner: &dyn CommandRunner, status: &ServiceStatus) -> Option<String> {
    let label = Invocation::new("docker").args(["inspect", &status.container, "--format", VERSION_LABEL]);
    if let Some(v) = stdout_of(runner, label).await.as_deref().and_then(clean_version) {
        return Some(v);
    }

    if let Some(v) = explicit_tag(&status.image).and_then(clean_version) {
        return Some(v);
    }

    if !status.name.starts_with(SERVICE_PREFIX) {
        return None;
    }

    let binary = format!("/usr/bin/{}", status.name);
    let probe = Invocation::new("docker").args(["exec", &status.container, &binary, "--version"]);
    if let Some(v) = stdout_of(runner, probe).await.as_deref().and_then(from_binary_output) {
        return Some(v);
    }

    let package = status.name.replacen('-', "_", 1);
    let pip = Invocation::new("docker").args(["exec", &status.container, "pip", "show", &package]);
    stdout_of(runner, pip)
        .await
        .as_deref()
        .and_then(from_package_metadata)
}
