use super::PROJECT;
use serde::Deserialize;

/// Observed state of one container. Recomputed per poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Logical compose service, e.g. `mautrix-whatsapp`.
    pub name: String,
    pub container: String,
    pub state: String,
    pub running: bool,
    pub health: String,
    pub image: String,
    pub version: Option<String>,
}

impl ServiceStatus {
    pub fn display_state(&self) -> String {
        match (self.running, self.health.is_empty()) {
            (true, true) => "running".into(),
            (true, false) => format!("running ({})", self.health),
            (false, _) => "stopped".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Health", default)]
    health: String,
    #[serde(rename = "Image", default)]
    image: String,
}

impl From<PsEntry> for ServiceStatus {
    fn from(e: PsEntry) -> Self {
        Self {
            name: parse_service_name(&e.name),
            running: e.state.eq_ignore_ascii_case("running"),
            container: e.name,
            state: e.state,
            health: e.health,
            image: e.image,
            version: None,
        }
    }
}

/// Parse `ps --format json` output. Newer compose prints one object per line,
/// older releases a single array. Unparsable entries are skipped.
pub fn parse_status(stdout: &str) -> Vec<ServiceStatus> {
    let trimmed = stdout.trim();
    if trimmed.starts_with('[') {
        match serde_json::from_str::<Vec<PsEntry>>(trimmed) {
            Ok(entries) => return entries.into_iter().map(Into::into).collect(),
            Err(e) => tracing::debug!(error = %e, "ps output is not a JSON array"),
        }
    }
    trimmed
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| match serde_json::from_str::<PsEntry>(line) {
            Ok(entry) => Some(entry.into()),
            Err(e) => {
                tracing::debug!(error = %e, line, "skipping unparsable ps line");
                None
            }
        })
        .filter(|s: &ServiceStatus| !s.container.is_empty())
        .collect()
}

/// Logical service name from `<project>-<service...>-<instance>`.
pub fn parse_service_name(container: &str) -> String {
    if let Some(rest) = container
        .strip_prefix(PROJECT)
        .and_then(|r| r.strip_prefix('-'))
    {
        return match rest.rsplit_once('-') {
            Some((service, _)) if !service.is_empty() => service.to_string(),
            _ => rest.to_string(),
        };
    }
    let parts: Vec<&str> = container.split('-').collect();
    if parts.len() > 2 {
        parts[1..parts.len() - 1].join("-")
    } else {
        container.to_string()
    }
}

/// Strip the `-<n>` replica suffix from a compose log prefix.
pub fn strip_instance(name: &str) -> &str {
    match name.rsplit_once('-') {
        Some((base, n)) if !base.is_empty() && !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) => {
            base
        }
        _ => name,
    }
}
