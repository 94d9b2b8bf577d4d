//! Lifecycle procedures as explicit ordered step lists.

use crate::bridges::SERVICE_PREFIX;
use crate::compose::SYNAPSE_SERVICE;
use crate::config::Timings;
use std::time::Duration;

/// Whether a failing step aborts the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tolerance {
    Fatal,
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Flip a bridge's desired state and persist.
    SetBridge { name: String, enabled: bool },
    /// Flip the web client's desired state and persist.
    SetElement(bool),
    Persist,
    /// Choose free ports for unset entries.
    EnsurePorts,
    Generate,
    WriteManifest,
    Pull,
    PullBridge(String),
    Up { recreate: bool, quiet: bool },
    Down,
    Restart(String),
    Remove { service: String, profile: String },
    Wait { reason: &'static str, duration: Duration },
    VerifyRunning(String),
    ProvisionAdmin,
    WaitForBridges(Duration),
    SetupBots,
    CleanupBot(String),
}

fn bridge_service(name: &str) -> String {
    format!("{SERVICE_PREFIX}{name}")
}

impl Step {
    /// Shown while the step runs.
    pub fn label(&self) -> String {
        match self {
            Self::SetBridge { name, enabled: true } => format!("Enabling {name}"),
            Self::SetBridge { name, enabled: false } => format!("Disabling {name}"),
            Self::SetElement(true) => "Enabling Element".into(),
            Self::SetElement(false) => "Disabling Element".into(),
            Self::Persist => "Saving settings".into(),
            Self::EnsurePorts => "Selecting ports".into(),
            Self::Generate => "Generating configuration".into(),
            Self::WriteManifest => "Writing compose manifest".into(),
            Self::Pull => "Pulling images".into(),
            Self::PullBridge(name) => format!("Pulling {}", bridge_service(name)),
            Self::Up { recreate: true, .. } => "Recreating services".into(),
            Self::Up { .. } => "Starting services".into(),
            Self::Down => "Stopping services".into(),
            Self::Restart(svc) => format!("Restarting {svc}"),
            Self::Remove { service, .. } => format!("Removing {service}"),
            Self::Wait { reason, .. } => format!("Waiting for {reason}"),
            Self::VerifyRunning(svc) => format!("Verifying {svc}"),
            Self::ProvisionAdmin => "Creating admin account".into(),
            Self::WaitForBridges(_) => "Waiting for bridges".into(),
            Self::SetupBots => "Setting up bot conversations".into(),
            Self::CleanupBot(name) => format!("Leaving {name} bot conversation"),
        }
    }

    /// Logical compose service the step acts on, if any.
    pub fn service(&self) -> Option<String> {
        match self {
            Self::SetBridge { name, .. } | Self::PullBridge(name) | Self::CleanupBot(name) => {
                Some(bridge_service(name))
            }
            Self::SetElement(_) => Some("element".into()),
            Self::Restart(svc) | Self::VerifyRunning(svc) => Some(svc.clone()),
            Self::Remove { service, .. } => Some(service.clone()),
            Self::ProvisionAdmin => Some(SYNAPSE_SERVICE.into()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub step: Step,
    pub tolerance: Tolerance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    EnableBridge(String),
    DisableBridge(String),
    Up,
    Update,
    Stop,
    Restart,
    ToggleElement,
    ApplySettings,
    Initialize,
    AutoStart,
}

impl OperationKind {
    pub fn label(&self) -> String {
        match self {
            Self::EnableBridge(n) => format!("Enabling {n}"),
            Self::DisableBridge(n) => format!("Disabling {n}"),
            Self::Up => "Starting".into(),
            Self::Update => "Updating".into(),
            Self::Stop => "Stopping".into(),
            Self::Restart => "Restarting".into(),
            Self::ToggleElement => "Reconfiguring Element".into(),
            Self::ApplySettings => "Saving settings".into(),
            Self::Initialize => "Initializing".into(),
            Self::AutoStart => "Starting".into(),
        }
    }
}

/// Ordered steps of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub kind: OperationKind,
    pub steps: Vec<PlannedStep>,
}

struct Builder {
    kind: OperationKind,
    steps: Vec<PlannedStep>,
}

impl Builder {
    fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            steps: Vec::new(),
        }
    }

    fn fatal(mut self, step: Step) -> Self {
        self.steps.push(PlannedStep {
            step,
            tolerance: Tolerance::Fatal,
        });
        self
    }

    fn best_effort(mut self, step: Step) -> Self {
        self.steps.push(PlannedStep {
            step,
            tolerance: Tolerance::BestEffort,
        });
        self
    }

    fn when(self, cond: bool, f: impl FnOnce(Self) -> Self) -> Self {
        if cond {
            f(self)
        } else {
            self
        }
    }

    fn build(self) -> Plan {
        Plan {
            kind: self.kind,
            steps: self.steps,
        }
    }
}

impl Plan {
    /// With the stack down only the desired state and artifacts change.
    pub fn enable_bridge(name: &str, timings: &Timings, stack_running: bool) -> Self {
        let service = bridge_service(name);
        Builder::new(OperationKind::EnableBridge(name.into()))
            .fatal(Step::SetBridge {
                name: name.into(),
                enabled: true,
            })
            .fatal(Step::Generate)
            .when(stack_running, |b| {
                b.fatal(Step::Restart(SYNAPSE_SERVICE.into()))
                    .fatal(Step::Wait {
                        reason: "synapse",
                        duration: timings.homeserver_grace,
                    })
                    .best_effort(Step::PullBridge(name.into()))
                    .fatal(Step::Up {
                        recreate: false,
                        quiet: true,
                    })
                    .fatal(Step::Wait {
                        reason: "bridge startup",
                        duration: timings.bridge_grace,
                    })
                    .fatal(Step::VerifyRunning(service))
            })
            .build()
    }

    pub fn disable_bridge(name: &str, stack_running: bool) -> Self {
        Builder::new(OperationKind::DisableBridge(name.into()))
            .fatal(Step::SetBridge {
                name: name.into(),
                enabled: false,
            })
            .fatal(Step::Generate)
            .when(stack_running, |b| {
                b.best_effort(Step::CleanupBot(name.into()))
                    .best_effort(Step::Remove {
                        service: bridge_service(name),
                        profile: name.into(),
                    })
                    .fatal(Step::Restart(SYNAPSE_SERVICE.into()))
            })
            .build()
    }

    pub fn stack_up(pull: bool, has_bridges: bool, timings: &Timings) -> Self {
        Builder::new(OperationKind::Up)
            .fatal(Step::Generate)
            .fatal(Step::WriteManifest)
            .when(pull, |b| b.fatal(Step::Pull))
            .fatal(Step::Up {
                recreate: false,
                quiet: false,
            })
            .best_effort(Step::ProvisionAdmin)
            .when(has_bridges, |b| {
                b.best_effort(Step::WaitForBridges(timings.bridge_wait))
                    .best_effort(Step::SetupBots)
            })
            .build()
    }

    /// Quiet bring-up when the dashboard opens on a stopped stack.
    pub fn auto_start() -> Self {
        Builder::new(OperationKind::AutoStart)
            .fatal(Step::Generate)
            .fatal(Step::WriteManifest)
            .fatal(Step::Up {
                recreate: false,
                quiet: true,
            })
            .best_effort(Step::ProvisionAdmin)
            .build()
    }

    /// Plain `up` keeps existing containers, so the new images need a recreate.
    pub fn update() -> Self {
        Builder::new(OperationKind::Update)
            .fatal(Step::WriteManifest)
            .fatal(Step::Pull)
            .fatal(Step::Down)
            .fatal(Step::Up {
                recreate: true,
                quiet: false,
            })
            .build()
    }

    pub fn stop() -> Self {
        Builder::new(OperationKind::Stop).fatal(Step::Down).build()
    }

    pub fn restart() -> Self {
        Builder::new(OperationKind::Restart)
            .fatal(Step::Down)
            .fatal(Step::Up {
                recreate: false,
                quiet: true,
            })
            .build()
    }

    pub fn toggle_element(enabled: bool, stack_running: bool) -> Self {
        Builder::new(OperationKind::ToggleElement)
            .fatal(Step::SetElement(enabled))
            .fatal(Step::Generate)
            .fatal(Step::WriteManifest)
            .when(stack_running, |b| {
                b.fatal(Step::Down).fatal(Step::Up {
                    recreate: false,
                    quiet: true,
                })
            })
            .build()
    }

    pub fn apply_settings() -> Self {
        Builder::new(OperationKind::ApplySettings)
            .fatal(Step::Persist)
            .fatal(Step::Generate)
            .fatal(Step::WriteManifest)
            .build()
    }

    /// First-run setup from the wizard or `init`.
    pub fn initialize() -> Self {
        Builder::new(OperationKind::Initialize)
            .fatal(Step::EnsurePorts)
            .fatal(Step::Persist)
            .fatal(Step::Generate)
            .fatal(Step::WriteManifest)
            .build()
    }

    pub fn labels(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.step.label()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_restarts_homeserver_before_bringing_up_the_bridge() {
        let plan = Plan::enable_bridge("whatsapp", &Timings::default(), true);
        assert_eq!(
            plan.labels(),
            vec![
                "Enabling whatsapp",
                "Generating configuration",
                "Restarting synapse",
                "Waiting for synapse",
                "Pulling mautrix-whatsapp",
                "Starting services",
                "Waiting for bridge startup",
                "Verifying mautrix-whatsapp",
            ]
        );
        let pull = &plan.steps[4];
        assert_eq!(pull.tolerance, Tolerance::BestEffort);
        assert!(plan
            .steps
            .iter()
            .enumerate()
            .all(|(i, s)| i == 4 || s.tolerance == Tolerance::Fatal));
    }

    #[test]
    fn enable_with_stack_down_only_persists_and_generates() {
        let plan = Plan::enable_bridge("signal", &Timings::default(), false);
        assert_eq!(plan.labels(), vec!["Enabling signal", "Generating configuration"]);
    }

    #[test]
    fn disable_removes_bridge_then_restarts_homeserver() {
        let plan = Plan::disable_bridge("signal", true);
        let steps: Vec<&Step> = plan.steps.iter().map(|s| &s.step).collect();
        assert_eq!(
            steps[3],
            &Step::Remove {
                service: "mautrix-signal".into(),
                profile: "signal".into()
            }
        );
        assert_eq!(steps.last(), Some(&&Step::Restart("synapse".into())));
    }

    #[test]
    fn disable_with_stack_down_only_persists_and_regenerates() {
        let plan = Plan::disable_bridge("signal", false);
        let steps: Vec<&Step> = plan.steps.iter().map(|s| &s.step).collect();
        assert_eq!(
            steps,
            vec![
                &Step::SetBridge {
                    name: "signal".into(),
                    enabled: false
                },
                &Step::Generate,
            ]
        );
        assert!(plan.steps.iter().all(|s| s.tolerance == Tolerance::Fatal));
    }

    #[test]
    fn update_recreates_after_pull_and_teardown() {
        let plan = Plan::update();
        assert_eq!(
            plan.labels(),
            vec![
                "Writing compose manifest",
                "Pulling images",
                "Stopping services",
                "Recreating services"
            ]
        );
    }

    #[test]
    fn stack_up_waits_for_bridges_only_when_enabled() {
        let with = Plan::stack_up(true, true, &Timings::default());
        assert!(with.steps.iter().any(|s| matches!(s.step, Step::WaitForBridges(_))));
        assert_eq!(with.steps[2].step, Step::Pull);
        let without = Plan::stack_up(false, false, &Timings::default());
        assert!(!without.steps.iter().any(|s| matches!(s.step, Step::SetupBots | Step::Pull)));
    }

    #[test]
    fn services_are_named_for_error_reporting() {
        assert_eq!(
            Step::VerifyRunning("mautrix-x".into()).service().as_deref(),
            Some("mautrix-x")
        );
        assert_eq!(Step::Generate.service(), None);
        assert_eq!(
            Step::PullBridge("meta".into()).service().as_deref(),
            Some("mautrix-meta")
        );
    }
}
