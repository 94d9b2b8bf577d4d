//! Compose driver.
//!
//! Builds `docker compose` invocations for the active profile set and turns
//! the tool's machine-readable output into [`ServiceStatus`] records.

pub mod runner;
mod status;
mod version;

use crate::bridges::SERVICE_PREFIX;
use crate::config::{Paths, Settings};
use crate::error::{Error, Result};
use crate::generator::{ELEMENT_PROFILE, HTTPS_PROFILE};
use runner::{CommandOutput, CommandRunner, Invocation, LineStream};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

pub use status::{parse_service_name, parse_status, strip_instance, ServiceStatus};

/// Compose project name; containers are `<PROJECT>-<service>-<n>`.
pub const PROJECT: &str = "muxbee";
pub const SYNAPSE_SERVICE: &str = "synapse";
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Container name of the first replica of a service.
pub fn container_name(service: &str) -> String {
    format!("{PROJECT}-{service}-1")
}

/// Enabled bridges in order, then `element`, then `https`.
pub fn profiles(settings: &Settings) -> Vec<String> {
    let mut out = settings.enabled_bridges.clone();
    if settings.element_enabled() {
        out.push(ELEMENT_PROFILE.to_string());
    }
    if settings.https_active() {
        out.push(HTTPS_PROFILE.to_string());
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpOptions {
    /// Replace containers even when their config is unchanged.
    pub recreate: bool,
    pub quiet_pull: bool,
}

#[derive(Clone)]
pub struct Compose {
    runner: Arc<dyn CommandRunner>,
    manifest: PathBuf,
    env: Vec<(String, String)>,
    profiles: Vec<String>,
}

impl Compose {
    pub fn new(runner: Arc<dyn CommandRunner>, paths: &Paths, settings: &Settings) -> Self {
        let env = vec![
            ("CONFIG_DIR".to_string(), paths.config_dir().display().to_string()),
            ("DATA_DIR".to_string(), paths.data_dir().display().to_string()),
            ("POSTGRES_PASSWORD".to_string(), settings.postgres.password.clone()),
            ("SYNAPSE_PORT".to_string(), settings.synapse_port().to_string()),
            ("ELEMENT_PORT".to_string(), settings.element_port().to_string()),
        ];
        Self {
            runner,
            manifest: paths.manifest_file(),
            env,
            profiles: profiles(settings),
        }
    }

    fn invocation<'a>(&self, extra_profiles: &[&str], sub: impl IntoIterator<Item = &'a str>) -> Invocation {
        let mut inv = Invocation::new("docker")
            .args(["compose", "-p", PROJECT, "-f"])
            .arg(self.manifest.display().to_string())
            .envs(&self.env);
        let mut seen = BTreeSet::new();
        for p in self.profiles.iter().map(String::as_str).chain(extra_profiles.iter().copied()) {
            if seen.insert(p) {
                inv = inv.args(["--profile", p]);
            }
        }
        inv.args(sub)
    }

    async fn checked(&self, inv: Invocation) -> Result<CommandOutput> {
        let out = self
            .runner
            .run(&inv)
            .await
            .map_err(|e| Error::tool(inv.command_line(), e.to_string()))?;
        if !out.success {
            let detail = out.stderr.trim();
            let detail = if detail.is_empty() { "exited with failure" } else { detail };
            return Err(Error::tool(inv.command_line(), detail));
        }
        Ok(out)
    }

    pub async fn up(&self, opts: UpOptions) -> Result<()> {
        let mut sub = vec!["up", "-d"];
        if opts.recreate {
            sub.push("--force-recreate");
        }
        if opts.quiet_pull {
            sub.push("--quiet-pull");
        }
        self.checked(self.invocation(&[], sub)).await.map(drop)
    }

    pub async fn down(&self) -> Result<()> {
        self.checked(self.invocation(&[], ["down", "--remove-orphans"]))
            .await
            .map(drop)
    }

    pub async fn down_volumes(&self) -> Result<()> {
        self.checked(self.invocation(&[], ["down", "-v", "--remove-orphans"]))
            .await
            .map(drop)
    }

    pub async fn restart(&self, service: Option<&str>) -> Result<()> {
        let mut sub = vec!["restart"];
        sub.extend(service);
        self.checked(self.invocation(&[], sub)).await.map(drop)
    }

    /// Stop and remove one service. `profile` activates it when it is no longer enabled.
    pub async fn remove_service(&self, service: &str, profile: Option<&str>) -> Result<()> {
        let extra: Vec<&str> = profile.into_iter().collect();
        self.checked(self.invocation(&extra, ["rm", "-f", "-s", service]))
            .await
            .map(drop)
    }

    /// Pull every active image.
    pub async fn pull(&self, quiet: bool) -> Result<()> {
        let mut sub = vec!["pull"];
        if quiet {
            sub.push("-q");
        }
        self.checked(self.invocation(&[], sub)).await.map(drop)
    }

    /// Pull only the given bridges' images.
    pub async fn pull_bridges(&self, bridges: &[String], quiet: bool) -> Result<()> {
        let extra: Vec<&str> = bridges.iter().map(String::as_str).collect();
        let services: Vec<String> = bridges.iter().map(|b| format!("{SERVICE_PREFIX}{b}")).collect();
        let mut sub = vec!["pull"];
        if quiet {
            sub.push("-q");
        }
        sub.extend(services.iter().map(String::as_str));
        self.checked(self.invocation(&extra, sub)).await.map(drop)
    }

    pub async fn logs(&self, service: Option<&str>, tail: usize) -> Result<String> {
        let tail = tail.to_string();
        let mut sub = vec!["logs", "--no-color", "--tail", tail.as_str()];
        sub.extend(service);
        Ok(self.checked(self.invocation(&[], sub)).await?.stdout)
    }

    pub async fn follow_logs(&self, service: Option<&str>, tail: usize) -> Result<LineStream> {
        let tail = tail.to_string();
        let mut sub = vec!["logs", "-f", "--no-color", "--tail", tail.as_str()];
        sub.extend(service);
        let inv = self.invocation(&[], sub);
        self.runner
            .stream(&inv)
            .await
            .map_err(|e| Error::tool(inv.command_line(), e.to_string()))
    }

    /// Every container of the project. An unreachable engine reads as no services.
    pub async fn status(&self) -> Vec<ServiceStatus> {
        let inv = self.invocation(&[], ["ps", "--format", "json", "-a"]);
        match self.runner.run(&inv).await {
            Ok(out) if out.success => parse_status(&out.stdout),
            Ok(out) => {
                tracing::debug!(stderr = %out.stderr.trim(), "compose ps failed");
                Vec::new()
            }
            Err(e) => {
                tracing::debug!(error = %e, "compose unavailable");
                Vec::new()
            }
        }
    }

    /// Status with versions; running containers are probed concurrently.
    pub async fn status_with_versions(&self) -> Vec<ServiceStatus> {
        let mut statuses = self.status().await;
        let runner = self.runner.as_ref();
        let probes = statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| s.running)
            .map(|(i, s)| async move { (i, version::resolve(runner, s).await) });
        let resolved = futures::future::join_all(probes).await;
        for (i, v) in resolved {
            statuses[i].version = v;
        }
        statuses
    }

    pub async fn is_running(&self, service: &str) -> bool {
        self.status()
            .await
            .iter()
            .any(|s| s.name == service && s.running)
    }

    /// Poll until every bridge was seen running at least once. Returns false on timeout.
    pub async fn wait_for_bridges(&self, bridges: &[String], timeout: Duration) -> bool {
        let mut pending: BTreeSet<String> =
            bridges.iter().map(|b| format!("{SERVICE_PREFIX}{b}")).collect();
        let deadline = Instant::now() + timeout;
        loop {
            for s in self.status().await {
                if s.running {
                    pending.remove(&s.name);
                }
            }
            if pending.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::info!(?pending, "gave up waiting for bridges");
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// `docker exec` inside a running container.
    pub async fn exec(&self, container: &str, args: &[&str]) -> Result<CommandOutput> {
        let inv = Invocation::new("docker")
            .args(["exec", container])
            .args(args.iter().copied());
        self.runner
            .run(&inv)
            .await
            .map_err(|e| Error::tool(inv.command_line(), e.to_string()))
    }

    pub async fn engine_available(&self) -> bool {
        let inv = Invocation::new("docker").args(["info", "--format", "{{.ServerVersion}}"]);
        matches!(self.runner.run(&inv).await, Ok(out) if out.success)
    }
}
