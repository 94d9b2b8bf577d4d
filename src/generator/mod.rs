//! Configuration artifact generation.
//!
//! Owns ordering: secrets are issued and persisted before anything that
//! references them is rendered, and persisted again once rendering is done.

mod artifacts;
mod manifest;

use crate::bridges::Catalog;
use crate::config::{Paths, Settings};
use crate::error::{Error, Result};
use std::path::PathBuf;

pub use manifest::{ELEMENT_PROFILE, HTTPS_PROFILE};

/// One rendered file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub contents: String,
}

impl Artifact {
    fn new(path: PathBuf, contents: String) -> Self {
        Self { path, contents }
    }

    /// Write unless the file already holds these bytes. Returns whether it wrote.
    pub fn write(&self) -> Result<bool> {
        if let Ok(existing) = std::fs::read_to_string(&self.path) {
            if existing == self.contents {
                return Ok(false);
            }
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        std::fs::write(&self.path, &self.contents).map_err(|e| Error::io(&self.path, e))?;
        Ok(true)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GenerationReport {
    /// Names of the secrets issued during this pass.
    pub tokens_issued: Vec<String>,
    /// Files whose contents changed.
    pub written: Vec<PathBuf>,
    pub saved: bool,
}

fn yaml<T: serde::Serialize>(what: &'static str, value: &T) -> Result<String> {
    serde_yaml::to_string(value).map_err(|e| Error::Serialize {
        what,
        detail: e.to_string(),
    })
}

/// Render every artifact for the current settings. Tokens must already be issued.
pub fn render(paths: &Paths, settings: &Settings, catalog: &Catalog) -> Result<Vec<Artifact>> {
    let mut out = Vec::new();

    out.push(Artifact::new(
        paths.synapse_config_dir().join("homeserver.yaml"),
        yaml("homeserver config", &artifacts::homeserver(settings))?,
    ));
    out.push(Artifact::new(
        paths.synapse_config_dir().join("log.config"),
        artifacts::SYNAPSE_LOG_CONFIG.to_string(),
    ));

    let element = serde_json::to_string_pretty(&artifacts::element(settings)).map_err(|e| {
        Error::Serialize {
            what: "element config",
            detail: e.to_string(),
        }
    })?;
    out.push(Artifact::new(
        paths.element_config_dir().join("config.json"),
        element + "\n",
    ));

    if settings.https_active() {
        out.push(Artifact::new(
            paths.caddy_config_dir().join("Caddyfile"),
            artifacts::caddyfile(settings),
        ));
    }

    out.push(Artifact::new(
        paths.synapse_data_dir().join("doublepuppet-registration.yaml"),
        yaml(
            "double puppet registration",
            &artifacts::double_puppet_registration(&settings.double_puppet, &settings.server_name),
        )?,
    ));

    for name in &settings.enabled_bridges {
        let desc = catalog.require(name)?;
        let tokens = settings
            .bridge_tokens
            .get(name)
            .filter(|t| t.is_complete())
            .ok_or_else(|| Error::Serialize {
                what: "bridge registration",
                detail: format!("no tokens issued for {name}"),
            })?;

        out.push(Artifact::new(
            paths.bridge_data_dir(name).join("config.yaml"),
            yaml("bridge config", &artifacts::bridge_config(desc, tokens, settings))?,
        ));

        // Rendered once so both copies are byte-identical.
        let registration = yaml(
            "bridge registration",
            &artifacts::bridge_registration(desc, tokens, &settings.server_name),
        )?;
        out.push(Artifact::new(
            paths.bridge_config_dir(name).join("registration.yaml"),
            registration.clone(),
        ));
        out.push(Artifact::new(
            paths.bridge_data_dir(name).join("registration.yaml"),
            registration,
        ));
    }

    Ok(out)
}

/// Issue missing secrets, persist them, render and write every artifact.
pub fn generate_all(paths: &Paths, settings: &mut Settings, catalog: &Catalog) -> Result<GenerationReport> {
    paths.ensure_skeleton()?;

    let mut report = GenerationReport::default();
    if settings.ensure_registration_secret() {
        report.tokens_issued.push("registration_secret".into());
    }
    if settings.issue_or_reuse_double_puppet().1 {
        report.tokens_issued.push("doublepuppet".into());
    }
    for name in settings.enabled_bridges.clone() {
        if settings.issue_or_reuse(&name).1 {
            report.tokens_issued.push(name);
        }
    }

    if !report.tokens_issued.is_empty() {
        settings.save(paths)?;
    }

    for artifact in render(paths, settings, catalog)? {
        if artifact.write()? {
            report.written.push(artifact.path);
        }
    }

    if !report.tokens_issued.is_empty() {
        settings.save(paths)?;
        report.saved = true;
        tracing::info!(issued = ?report.tokens_issued, "issued new secrets");
    }
    tracing::debug!(written = report.written.len(), "artifacts generated");
    Ok(report)
}

pub fn render_manifest(settings: &Settings, catalog: &Catalog) -> Result<String> {
    yaml("compose manifest", &manifest::manifest(settings, catalog))
}

pub fn write_manifest(paths: &Paths, settings: &Settings, catalog: &Catalog) -> Result<bool> {
    Artifact::new(paths.manifest_file(), render_manifest(settings, catalog)?).write()
}
