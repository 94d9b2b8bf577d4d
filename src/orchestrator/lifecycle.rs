//! Plan executor.
//!
//! Runs one [`Plan`] strictly in order. The first fatal failure stops the run
//! and leaves every earlier side effect in place; best-effort failures are
//! collected as warnings.

use super::steps::{Plan, Step, Tolerance};
use crate::bridges::Catalog;
use crate::compose::runner::CommandRunner;
use crate::compose::{container_name, Compose, UpOptions, SYNAPSE_SERVICE};
use crate::config::{Paths, Settings};
use crate::error::{self, BestEffortError, Error, OrchestrationError, Result};
use crate::generator;
use crate::matrix::BotConversations;
use std::sync::Arc;
use tokio::sync::watch;

const ALREADY_REGISTERED: [&str; 2] = ["already taken", "already exists"];

/// Step currently executing within a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub index: usize,
    pub total: usize,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct Outcome {
    /// Settings as left by the last step.
    pub settings: Settings,
    pub warnings: Vec<BestEffortError>,
    pub notes: Vec<String>,
}

#[derive(Clone)]
pub struct Orchestrator {
    paths: Paths,
    catalog: Arc<Catalog>,
    runner: Arc<dyn CommandRunner>,
    bots: Arc<dyn BotConversations>,
}

impl Orchestrator {
    pub fn new(
        paths: Paths,
        catalog: Arc<Catalog>,
        runner: Arc<dyn CommandRunner>,
        bots: Arc<dyn BotConversations>,
    ) -> Self {
        Self {
            paths,
            catalog,
            runner,
            bots,
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn compose(&self, settings: &Settings) -> Compose {
        Compose::new(self.runner.clone(), &self.paths, settings)
    }

    pub fn load_settings(&self) -> Result<Settings> {
        Settings::load(&self.paths, &self.catalog)
    }

    /// The homeserver container decides whether bridge changes touch containers.
    pub async fn stack_running(&self, settings: &Settings) -> bool {
        self.compose(settings).is_running(SYNAPSE_SERVICE).await
    }

    /// Checks that must pass before any step is allowed to change state.
    fn check_preconditions(&self, plan: &Plan, settings: &Settings) -> Result<()> {
        for planned in &plan.steps {
            match &planned.step {
                Step::SetBridge { name, enabled } => {
                    let desc = self.catalog.require(name)?;
                    if *enabled && desc.requires_credentials && settings.credentials_for(name).is_none() {
                        return Err(Error::MissingCredentials {
                            bridge: name.clone(),
                        });
                    }
                }
                Step::PullBridge(name) | Step::CleanupBot(name) => {
                    self.catalog.require(name)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub async fn execute(
        &self,
        plan: &Plan,
        mut settings: Settings,
        progress: Option<&watch::Sender<Progress>>,
    ) -> std::result::Result<Outcome, OrchestrationError> {
        self.check_preconditions(plan, &settings)
            .map_err(OrchestrationError::Precondition)?;

        let operation = plan.kind.label();
        let total = plan.steps.len();
        let mut warnings = Vec::new();
        let mut notes = Vec::new();

        for (index, planned) in plan.steps.iter().enumerate() {
            let label = planned.step.label();
            if let Some(tx) = progress {
                tx.send_replace(Progress {
                    index,
                    total,
                    label: label.clone(),
                });
            }
            tracing::info!(operation = %operation, step = index + 1, total, "{label}");

            match self.run_step(&planned.step, &mut settings, &mut notes).await {
                Ok(extra) => {
                    for w in &extra {
                        tracing::warn!(step = %w.step, service = ?w.service, "{}", w.message);
                    }
                    warnings.extend(extra);
                }
                Err(source) => match planned.tolerance {
                    Tolerance::BestEffort => {
                        let message = error::chain(&source);
                        tracing::warn!(step = %label, "{message}");
                        warnings.push(BestEffortError::new(label, planned.step.service(), message));
                    }
                    Tolerance::Fatal => {
                        tracing::error!(operation = %operation, step = %label, error = %error::chain(&source), "step failed");
                        return Err(OrchestrationError::Step {
                            index,
                            label,
                            service: planned.step.service(),
                            source,
                        });
                    }
                },
            }
        }

        tracing::info!(operation = %operation, warnings = warnings.len(), "completed");
        Ok(Outcome {
            settings,
            warnings,
            notes,
        })
    }

    async fn run_step(
        &self,
        step: &Step,
        settings: &mut Settings,
        notes: &mut Vec<String>,
    ) -> Result<Vec<BestEffortError>> {
        let compose = self.compose(settings);
        match step {
            Step::SetBridge { name, enabled } => {
                let changed = if *enabled {
                    settings.enable_bridge(name)
                } else {
                    settings.disable_bridge(name)
                };
                if !changed {
                    tracing::debug!(bridge = %name, enabled, "bridge already in target state");
                }
                settings.save(&self.paths)?;
                if *enabled {
                    if let Some(note) = self.catalog.get(name).and_then(|d| d.note.clone()) {
                        notes.push(note);
                    }
                }
            }
            Step::SetElement(enabled) => {
                settings.element_enabled = Some(*enabled);
                settings.save(&self.paths)?;
            }
            Step::Persist => settings.save(&self.paths)?,
            Step::EnsurePorts => {
                if settings.ensure_ports() {
                    tracing::info!(
                        synapse = settings.synapse_port(),
                        element = settings.element_port(),
                        "selected ports"
                    );
                }
            }
            Step::Generate => {
                generator::generate_all(&self.paths, settings, &self.catalog)?;
            }
            Step::WriteManifest => {
                generator::write_manifest(&self.paths, settings, &self.catalog)?;
            }
            Step::Pull => compose.pull(false).await?,
            Step::PullBridge(name) => compose.pull_bridges(std::slice::from_ref(name), true).await?,
            Step::Up { recreate, quiet } => {
                compose
                    .up(UpOptions {
                        recreate: *recreate,
                        quiet_pull: *quiet,
                    })
                    .await?
            }
            Step::Down => compose.down().await?,
            Step::Restart(service) => compose.restart(Some(service)).await?,
            Step::Remove { service, profile } => compose.remove_service(service, Some(profile)).await?,
            Step::Wait { duration, .. } => tokio::time::sleep(*duration).await,
            Step::VerifyRunning(service) => {
                if !compose.is_running(service).await {
                    return Err(Error::NotRunning {
                        service: service.clone(),
                    });
                }
            }
            Step::ProvisionAdmin => {
                if self.provision_admin(&compose, settings).await? {
                    notes.push(format!(
                        "Created admin account {} (password in settings.yaml)",
                        settings.admin_user_id()
                    ));
                }
            }
            Step::WaitForBridges(timeout) => {
                if !compose.wait_for_bridges(&settings.enabled_bridges, *timeout).await {
                    return Ok(vec![BestEffortError::new(
                        step.label(),
                        None,
                        format!(
                            "not every bridge was running after {}",
                            humantime::format_duration(*timeout)
                        ),
                    )]);
                }
            }
            Step::SetupBots => return Ok(self.bots.setup_bots(settings, &settings.enabled_bridges).await),
            Step::CleanupBot(name) => {
                return Ok(self.bots.cleanup_bot(settings, name).await.err().into_iter().collect())
            }
        }
        Ok(Vec::new())
    }

    /// Create the admin account once. Returns true when an account was registered.
    async fn provision_admin(&self, compose: &Compose, settings: &Settings) -> Result<bool> {
        let marker = self.paths.admin_marker();
        if marker.exists() {
            tracing::debug!("admin already provisioned");
            return Ok(false);
        }
        tokio::time::sleep(settings.timings.admin_grace).await;

        let out = compose
            .exec(
                &container_name(SYNAPSE_SERVICE),
                &[
                    "register_new_matrix_user",
                    "-u",
                    &settings.admin.username,
                    "-p",
                    &settings.admin.password,
                    "-a",
                    "-c",
                    "/config/homeserver.yaml",
                    "http://localhost:8008",
                ],
            )
            .await?;
        let created = out.success;
        if !created {
            let text = out.combined();
            if !ALREADY_REGISTERED.iter().any(|m| text.contains(m)) {
                return Err(Error::tool("register_new_matrix_user", text.trim()));
            }
            tracing::info!(user = %settings.admin_user_id(), "admin account already exists");
        }

        if let Some(parent) = marker.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        std::fs::write(&marker, b"").map_err(|e| Error::io(&marker, e))?;
        Ok(created)
    }
}
