use super::state::{Cmd, Screen, TaskSlot, TextField, UiState};
use super::{draw_slot, hints};
use crate::config::{Connectivity, Settings};
use crate::orchestrator::Plan;
use crossterm::event::{KeyCode, KeyEvent};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Field {
    #[default]
    ServerName,
    Connectivity,
    Element,
    HttpsEnabled,
    Domain,
    Email,
}

impl Field {
    const ORDER: [Field; 6] = [
        Field::ServerName,
        Field::Connectivity,
        Field::Element,
        Field::HttpsEnabled,
        Field::Domain,
        Field::Email,
    ];

    fn step(self, forward: bool) -> Self {
        let idx = Self::ORDER.iter().position(|f| *f == self).unwrap_or(0);
        let n = Self::ORDER.len();
        let next = if forward { (idx + 1) % n } else { (idx + n - 1) % n };
        Self::ORDER[next]
    }
}

/// Editable copy of the user-facing settings.
#[derive(Default)]
pub struct SettingsForm {
    pub slot: TaskSlot,
    pub focus: Field,
    pub server_name: TextField,
    pub connectivity: Connectivity,
    pub element: bool,
    pub https: bool,
    pub domain: TextField,
    pub email: TextField,
    pub error: Option<String>,
}

impl SettingsForm {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            server_name: TextField::new(s.server_name.clone()),
            connectivity: s.connectivity,
            element: s.element_enabled(),
            https: s.https.enabled,
            domain: TextField::new(s.https.domain.clone()),
            email: TextField::new(s.https.email.clone()),
            ..Default::default()
        }
    }

    /// Copy the form into `s`, rejecting combinations that cannot be served.
    pub fn apply_to(&self, s: &mut Settings) -> Result<(), String> {
        let server_name = self.server_name.trimmed();
        if server_name.is_empty() {
            return Err("Server name cannot be empty".into());
        }
        if self.https {
            if self.connectivity != Connectivity::Public {
                return Err("HTTPS needs public connectivity".into());
            }
            if self.domain.trimmed().is_empty() {
                return Err("HTTPS needs a domain".into());
            }
        }
        s.server_name = server_name.to_string();
        s.connectivity = self.connectivity;
        s.element_enabled = Some(self.element);
        s.https.enabled = self.https;
        s.https.domain = self.domain.trimmed().to_string();
        s.https.email = self.email.trimmed().to_string();
        Ok(())
    }

    fn text_mut(&mut self) -> Option<&mut TextField> {
        match self.focus {
            Field::ServerName => Some(&mut self.server_name),
            Field::Domain => Some(&mut self.domain),
            Field::Email => Some(&mut self.email),
            _ => None,
        }
    }
}

/// Discard unsaved edits, unless a save is still running.
pub(super) fn reset_form(state: &mut UiState) {
    if state.settings_form.slot.busy() {
        return;
    }
    if let Some(s) = &state.settings {
        let slot = std::mem::take(&mut state.settings_form.slot);
        state.settings_form = SettingsForm {
            slot,
            ..SettingsForm::from_settings(s)
        };
    }
}

pub(super) fn completed(state: &mut UiState) {
    reset_form(state);
    if state.stack_running() {
        state
            .settings_form
            .slot
            .info
            .push("Restart the stack from the dashboard (r) to apply".into());
    }
}

pub(super) fn handle_key(state: &mut UiState, k: KeyEvent) -> Option<Vec<Cmd>> {
    let form = &mut state.settings_form;
    match k.code {
        KeyCode::Tab | KeyCode::Down => form.focus = form.focus.step(true),
        KeyCode::BackTab | KeyCode::Up => form.focus = form.focus.step(false),
        KeyCode::Left if form.focus == Field::Connectivity => {
            form.connectivity = form.connectivity.prev()
        }
        KeyCode::Right if form.focus == Field::Connectivity => {
            form.connectivity = form.connectivity.next()
        }
        KeyCode::Char(' ') if form.focus == Field::Element => form.element = !form.element,
        KeyCode::Char(' ') if form.focus == Field::HttpsEnabled => form.https = !form.https,
        KeyCode::Backspace => form.text_mut()?.backspace(),
        KeyCode::Char(c) => form.text_mut()?.push(c),
        KeyCode::Enter => return Some(save(state)),
        KeyCode::Esc => {
            let back = Screen::Dashboard;
            return Some(super::switch_to(state, back));
        }
        _ => return None,
    }
    Some(Vec::new())
}

fn save(state: &mut UiState) -> Vec<Cmd> {
    if state.settings_form.slot.busy() {
        return Vec::new();
    }
    let Some(mut settings) = state.settings.clone() else {
        return Vec::new();
    };
    if let Err(e) = state.settings_form.apply_to(&mut settings) {
        state.settings_form.error = Some(e);
        return Vec::new();
    }
    state.settings_form.error = None;
    state.launch(Screen::Settings, Plan::apply_settings(), settings)
}

pub(super) fn draw(area: Rect, f: &mut Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(10), Constraint::Length(5), Constraint::Length(1)].as_ref())
        .split(area);
    let form = &state.settings_form;

    let row = |field: Field, label: &'static str, value: String| {
        let focused = form.focus == field;
        let style = if focused {
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(Color::Gray)
        };
        let marker = if focused { "> " } else { "  " };
        Line::from(vec![
            Span::styled(format!("{marker}{label:<14}"), style),
            Span::raw(value),
        ])
    };
    let check = |on: bool| if on { "[x]".to_string() } else { "[ ]".to_string() };

    let mut lines = vec![
        row(Field::ServerName, "Server name", form.server_name.display()),
        row(
            Field::Connectivity,
            "Connectivity",
            format!("< {} >  {}", form.connectivity.label(), form.connectivity.description()),
        ),
        row(Field::Element, "Element", check(form.element)),
        row(Field::HttpsEnabled, "HTTPS", check(form.https)),
        row(Field::Domain, "Domain", form.domain.display()),
        row(Field::Email, "ACME email", form.email.display()),
    ];
    if let Some(err) = &form.error {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(err.clone(), Style::default().fg(Color::Red))));
    }
    f.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Settings")),
        rows[0],
    );
    draw_slot(rows[1], f, &form.slot);
    f.render_widget(
        Paragraph::new(hints(&[
            ("tab", "next field"),
            ("←/→", "mode"),
            ("space", "toggle"),
            ("enter", "save"),
            ("esc", "back"),
        ])),
        rows[2],
    );
}

#[cfg(test)]
mod tests {
    use super::super::tests::{configured, harness, press, reply_run, running, type_text};
    use super::super::{state::Msg, update};
    use super::*;
    use crate::orchestrator::{OperationKind, UiCommand};

    fn on_settings() -> super::super::tests::Harness {
        let mut h = harness(Some(configured()));
        h.state.dashboard.auto_start_pending = false;
        press(&mut h.state, KeyCode::Char('c'));
        assert_eq!(h.state.screen, Screen::Settings);
        h
    }

    #[test]
    fn text_fields_capture_global_keys() {
        let mut h = on_settings();
        for _ in 0.."localhost".len() {
            press(&mut h.state, KeyCode::Backspace);
        }
        type_text(&mut h.state, "bq.lan");
        assert_eq!(h.state.screen, Screen::Settings);
        assert_eq!(h.state.settings_form.server_name.value, "bq.lan");

        // Off a text field, letters fall through to navigation.
        press(&mut h.state, KeyCode::Tab);
        press(&mut h.state, KeyCode::Char('d'));
        assert_eq!(h.state.screen, Screen::Dashboard);
    }

    #[test]
    fn arrows_cycle_connectivity() {
        let mut h = on_settings();
        press(&mut h.state, KeyCode::Tab);
        assert_eq!(h.state.settings_form.focus, Field::Connectivity);
        press(&mut h.state, KeyCode::Right);
        assert_eq!(h.state.settings_form.connectivity, Connectivity::Private);
        press(&mut h.state, KeyCode::Left);
        press(&mut h.state, KeyCode::Left);
        assert_eq!(h.state.settings_form.connectivity, Connectivity::Public);
    }

    #[test]
    fn https_without_public_mode_is_rejected() {
        let mut h = on_settings();
        h.state.settings_form.focus = Field::HttpsEnabled;
        press(&mut h.state, KeyCode::Char(' '));
        press(&mut h.state, KeyCode::Enter);
        assert!(h.state.settings_form.error.as_deref().unwrap().contains("public"));
        assert!(h.rx.try_recv().is_err());
    }

    #[test]
    fn save_applies_and_hints_at_restart() {
        let mut h = on_settings();
        h.state.statuses = running(&["synapse"]);
        h.state.settings_form.focus = Field::Element;
        press(&mut h.state, KeyCode::Char(' '));
        press(&mut h.state, KeyCode::Enter);

        let kind = reply_run(&mut h.rx, |s| {
            assert!(!s.element_enabled());
            super::super::tests::ok_outcome(s)
        });
        assert_eq!(kind, OperationKind::ApplySettings);
        update(&mut h.state, Msg::CheckTask(Screen::Settings));
        assert!(!h.state.settings.as_ref().unwrap().element_enabled());
        assert!(!h.state.settings_form.element);
        assert!(h
            .state
            .settings_form
            .slot
            .info
            .iter()
            .any(|l| l.contains("Restart")));
    }

    #[test]
    fn unsaved_edits_are_dropped_on_reentry() {
        let mut h = on_settings();
        type_text(&mut h.state, "xyz");
        press(&mut h.state, KeyCode::Esc);
        press(&mut h.state, KeyCode::Char('c'));
        assert_eq!(h.state.settings_form.server_name.value, "localhost");
        assert!(!matches!(h.rx.try_recv(), Ok(UiCommand::Run { .. })));
    }
}
