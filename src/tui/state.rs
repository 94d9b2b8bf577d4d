use super::bridges::BridgesView;
use super::logs::LogsView;
use super::settings::SettingsForm;
use super::task::{InFlight, Poll};
use super::wizard::Wizard;
use crate::bridges::Catalog;
use crate::compose::{ServiceStatus, SYNAPSE_SERVICE};
use crate::config::{Paths, Settings};
use crate::orchestrator::{Plan, RunResult, UiCommand};
use crossterm::event::KeyEvent;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

/// Result checks run below 200ms.
pub const CHECK_INTERVAL: Duration = Duration::from_millis(150);
/// Cosmetic only.
pub const SPINNER_INTERVAL: Duration = Duration::from_millis(100);
pub const LOG_DRAIN_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Dashboard,
    Bridges,
    Logs,
    Settings,
    Wizard,
    Help,
}

impl Screen {
    pub const TABS: [Screen; 5] = [
        Screen::Dashboard,
        Screen::Bridges,
        Screen::Logs,
        Screen::Settings,
        Screen::Help,
    ];

    pub fn title(self) -> &'static str {
        match self {
            Screen::Dashboard => "Dashboard",
            Screen::Bridges => "Bridges",
            Screen::Logs => "Logs",
            Screen::Settings => "Settings",
            Screen::Wizard => "Setup",
            Screen::Help => "Help",
        }
    }
}

#[derive(Debug)]
pub enum Msg {
    Key(KeyEvent),
    CheckTask(Screen),
    /// Tagged with the id of the task that armed it.
    Spinner(Screen, u64),
    /// Recurring status refresh.
    StatusTick,
    /// One-off refresh after a run completes.
    RefreshStatus,
    CheckStatus,
    /// Tagged with the log stream generation.
    DrainLogs(u64),
}

#[derive(Debug)]
pub enum Cmd {
    After(Duration, Msg),
    Quit,
}

/// Single-line text input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextField {
    pub value: String,
    pub masked: bool,
}

impl TextField {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            masked: false,
        }
    }

    pub fn masked() -> Self {
        Self {
            value: String::new(),
            masked: true,
        }
    }

    pub fn push(&mut self, c: char) {
        if !c.is_control() {
            self.value.push(c);
        }
    }

    pub fn backspace(&mut self) {
        self.value.pop();
    }

    pub fn trimmed(&self) -> &str {
        self.value.trim()
    }

    pub fn display(&self) -> String {
        if self.masked {
            "*".repeat(self.value.chars().count())
        } else {
            self.value.clone()
        }
    }
}

/// At most one background plan per screen, plus what it left behind.
#[derive(Default)]
pub struct TaskSlot {
    pub task: Option<InFlight>,
    pub error: Option<String>,
    pub info: Vec<String>,
}

impl TaskSlot {
    pub fn busy(&self) -> bool {
        self.task.is_some()
    }

    /// The finished result, taking the task out of the slot.
    pub fn take_finished(&mut self) -> Option<RunResult> {
        let task = self.task.as_mut()?;
        match task.poll() {
            Poll::Pending => None,
            Poll::Done(res) => {
                self.task = None;
                Some(res)
            }
        }
    }
}

#[derive(Default)]
pub struct Dashboard {
    pub slot: TaskSlot,
    /// Start the stack once the first status fetch shows nothing running.
    pub auto_start_pending: bool,
}

/// Owned by the UI thread. Background units only reach it through the
/// receivers polled in message handlers.
pub struct UiState {
    pub screen: Screen,
    /// Where `esc` returns to from help.
    pub previous: Screen,
    pub paths: Paths,
    pub catalog: Arc<Catalog>,
    pub settings: Option<Settings>,
    pub cmd_tx: UnboundedSender<UiCommand>,

    pub statuses: Vec<ServiceStatus>,
    pub status_refreshed: Option<OffsetDateTime>,
    pub status_rx: Option<oneshot::Receiver<Vec<ServiceStatus>>>,

    pub dashboard: Dashboard,
    pub bridges: BridgesView,
    pub logs: LogsView,
    pub settings_form: SettingsForm,
    pub wizard: Wizard,
}

impl UiState {
    pub fn new(
        paths: Paths,
        catalog: Arc<Catalog>,
        settings: Option<Settings>,
        cmd_tx: UnboundedSender<UiCommand>,
    ) -> Self {
        let screen = if settings.is_some() {
            Screen::Dashboard
        } else {
            Screen::Wizard
        };
        let settings_form = settings.as_ref().map(SettingsForm::from_settings).unwrap_or_default();
        Self {
            screen,
            previous: Screen::Dashboard,
            wizard: Wizard::new(&catalog),
            paths,
            catalog,
            dashboard: Dashboard {
                auto_start_pending: settings.is_some(),
                ..Default::default()
            },
            settings,
            cmd_tx,
            statuses: Vec::new(),
            status_refreshed: None,
            status_rx: None,
            bridges: BridgesView::default(),
            logs: LogsView::default(),
            settings_form,
        }
    }

    pub fn slot_mut(&mut self, screen: Screen) -> Option<&mut TaskSlot> {
        match screen {
            Screen::Dashboard => Some(&mut self.dashboard.slot),
            Screen::Bridges => Some(&mut self.bridges.slot),
            Screen::Settings => Some(&mut self.settings_form.slot),
            Screen::Wizard => Some(&mut self.wizard.slot),
            Screen::Logs | Screen::Help => None,
        }
    }

    pub fn is_running(&self, service: &str) -> bool {
        self.statuses.iter().any(|s| s.name == service && s.running)
    }

    pub fn stack_running(&self) -> bool {
        self.is_running(SYNAPSE_SERVICE)
    }

    /// Start `plan` on `screen` unless that screen already has one in flight.
    pub fn launch(&mut self, screen: Screen, plan: Plan, settings: Settings) -> Vec<Cmd> {
        let cmd_tx = self.cmd_tx.clone();
        let Some(slot) = self.slot_mut(screen) else {
            return Vec::new();
        };
        if slot.busy() {
            tracing::debug!(screen = screen.title(), "operation in flight; ignoring");
            return Vec::new();
        }
        slot.error = None;
        slot.info.clear();
        match InFlight::launch(&cmd_tx, plan, settings) {
            Some(task) => {
                let cmds = vec![
                    Cmd::After(CHECK_INTERVAL, Msg::CheckTask(screen)),
                    Cmd::After(SPINNER_INTERVAL, Msg::Spinner(screen, task.id)),
                ];
                slot.task = Some(task);
                cmds
            }
            None => {
                slot.error = Some("background controller is not running".into());
                Vec::new()
            }
        }
    }

    /// Settings from disk, used after a failed run left them partially applied.
    pub fn reload_settings(&mut self) {
        match Settings::load(&self.paths, &self.catalog) {
            Ok(s) => self.settings = Some(s),
            Err(e) => tracing::warn!("could not reload settings: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_fields_ignore_control_characters() {
        let mut f = TextField::new("ab");
        f.push('c');
        f.push('\u{7}');
        assert_eq!(f.value, "abc");
        f.backspace();
        assert_eq!(f.value, "ab");

        let mut secret = TextField::masked();
        secret.push('x');
        secret.push('y');
        assert_eq!(secret.display(), "**");
    }
}
