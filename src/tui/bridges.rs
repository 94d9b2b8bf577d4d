use super::state::{Cmd, Screen, TaskSlot, TextField, UiState};
use super::{draw_slot, hints};
use crate::config::ApiCredentials;
use crate::orchestrator::Plan;
use crossterm::event::{KeyCode, KeyEvent};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
    Frame,
};

/// API ID and hash for a bridge that cannot start without them.
pub struct CredentialForm {
    pub bridge: String,
    pub api_id: TextField,
    pub api_hash: TextField,
    /// 0 = API ID, 1 = API Hash.
    pub focus: usize,
    pub error: Option<String>,
}

impl CredentialForm {
    fn new(bridge: &str, existing: Option<&ApiCredentials>) -> Self {
        let mut api_hash = TextField::masked();
        api_hash.value = existing.map(|c| c.api_hash.clone()).unwrap_or_default();
        Self {
            bridge: bridge.to_string(),
            api_id: TextField::new(existing.map(|c| c.api_id.clone()).unwrap_or_default()),
            api_hash,
            focus: 0,
            error: None,
        }
    }

    fn focused(&mut self) -> &mut TextField {
        if self.focus == 0 {
            &mut self.api_id
        } else {
            &mut self.api_hash
        }
    }

    fn credentials(&self) -> Option<ApiCredentials> {
        let creds = ApiCredentials {
            api_id: self.api_id.trimmed().to_string(),
            api_hash: self.api_hash.trimmed().to_string(),
        };
        creds.is_complete().then_some(creds)
    }
}

#[derive(Default)]
pub struct BridgesView {
    pub slot: TaskSlot,
    pub selected: usize,
    pub show_info: bool,
    pub form: Option<CredentialForm>,
}

fn selected_name(state: &UiState) -> Option<String> {
    state
        .catalog
        .names()
        .nth(state.bridges.selected)
        .map(str::to_string)
}

pub(super) fn handle_key(state: &mut UiState, k: KeyEvent) -> Option<Vec<Cmd>> {
    if state.bridges.form.is_some() {
        return Some(handle_form_key(state, k));
    }
    let count = state.catalog.len();
    match k.code {
        KeyCode::Down | KeyCode::Char('j') => {
            if state.bridges.selected + 1 < count {
                state.bridges.selected += 1;
            }
        }
        KeyCode::Up | KeyCode::Char('k') => {
            state.bridges.selected = state.bridges.selected.saturating_sub(1);
        }
        KeyCode::Char('i') => state.bridges.show_info = !state.bridges.show_info,
        KeyCode::Esc if state.bridges.show_info => state.bridges.show_info = false,
        KeyCode::Enter | KeyCode::Char(' ') => return Some(toggle_selected(state)),
        _ => return None,
    }
    Some(Vec::new())
}

fn toggle_selected(state: &mut UiState) -> Vec<Cmd> {
    if state.bridges.slot.busy() {
        return Vec::new();
    }
    let (Some(name), Some(settings)) = (selected_name(state), state.settings.clone()) else {
        return Vec::new();
    };
    let running = state.stack_running();

    if settings.is_enabled(&name) {
        return state.launch(Screen::Bridges, Plan::disable_bridge(&name, running), settings);
    }

    let needs_creds = state
        .catalog
        .get(&name)
        .is_some_and(|d| d.requires_credentials);
    if needs_creds && settings.credentials_for(&name).is_none() {
        state.bridges.form = Some(CredentialForm::new(&name, settings.credentials.get(&name)));
        return Vec::new();
    }
    let plan = Plan::enable_bridge(&name, &settings.timings, running);
    state.launch(Screen::Bridges, plan, settings)
}

fn handle_form_key(state: &mut UiState, k: KeyEvent) -> Vec<Cmd> {
    let Some(form) = state.bridges.form.as_mut() else {
        return Vec::new();
    };
    match k.code {
        KeyCode::Esc => state.bridges.form = None,
        KeyCode::Tab | KeyCode::BackTab | KeyCode::Down | KeyCode::Up => form.focus = 1 - form.focus,
        KeyCode::Backspace => form.focused().backspace(),
        KeyCode::Char(c) => form.focused().push(c),
        KeyCode::Enter => {
            let Some(creds) = form.credentials() else {
                form.error = Some("Both API ID and API Hash are required".into());
                return Vec::new();
            };
            let bridge = form.bridge.clone();
            state.bridges.form = None;
            let Some(mut settings) = state.settings.clone() else {
                return Vec::new();
            };
            settings.set_credentials(&bridge, creds);
            let plan = Plan::enable_bridge(&bridge, &settings.timings, state.stack_running());
            return state.launch(Screen::Bridges, plan, settings);
        }
        _ => {}
    }
    Vec::new()
}

pub(super) fn draw(area: Rect, f: &mut Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(5), Constraint::Length(5), Constraint::Length(1)].as_ref())
        .split(area);
    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints(if state.bridges.show_info {
            [Constraint::Percentage(45), Constraint::Percentage(55)]
        } else {
            [Constraint::Percentage(100), Constraint::Percentage(0)]
        })
        .split(rows[0]);

    let items: Vec<ListItem> = state
        .catalog
        .iter()
        .map(|d| {
            let enabled = state.settings.as_ref().is_some_and(|s| s.is_enabled(&d.name));
            let running = state.is_running(&d.service_name());
            let (mark, color) = match (enabled, running) {
                (true, true) => ("[x]", Color::Green),
                (true, false) => ("[x]", Color::Yellow),
                (false, _) => ("[ ]", Color::DarkGray),
            };
            let mut spans = vec![
                Span::styled(mark, Style::default().fg(color)),
                Span::raw(format!(" {:<11}", d.name)),
                Span::styled(d.description.clone(), Style::default().fg(Color::Gray)),
            ];
            if d.requires_credentials {
                spans.push(Span::styled("  (API credentials)", Style::default().fg(Color::Cyan)));
            }
            ListItem::new(Line::from(spans))
        })
        .collect();
    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title("Bridges"))
        .highlight_style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD))
        .highlight_symbol("> ");
    let mut list_state = ListState::default();
    list_state.select(Some(state.bridges.selected));
    f.render_stateful_widget(list, cols[0], &mut list_state);

    if state.bridges.show_info {
        draw_info(cols[1], f, state);
    }

    draw_slot(rows[1], f, &state.bridges.slot);
    f.render_widget(
        Paragraph::new(hints(&[
            ("j/k", "move"),
            ("enter", "enable/disable"),
            ("i", "info"),
            ("d", "dashboard"),
            ("q", "quit"),
        ])),
        rows[2],
    );

    if let Some(form) = &state.bridges.form {
        draw_form(area, f, form);
    }
}

fn draw_info(area: Rect, f: &mut Frame, state: &UiState) {
    let Some(desc) = selected_name(state).and_then(|n| state.catalog.get(&n)) else {
        return;
    };
    let server = state
        .settings
        .as_ref()
        .map(|s| s.server_name.as_str())
        .unwrap_or("localhost");
    let mut lines = vec![
        Line::from(Span::styled(desc.description.clone(), Style::default().add_modifier(Modifier::BOLD))),
        Line::from(""),
        Line::from(format!("Service: {}", desc.service_name())),
        Line::from(format!("Bot:     {}", desc.bot_user_id(server))),
        Line::from(""),
    ];
    lines.extend(desc.login_instructions_for(server).lines().map(|l| Line::from(l.to_string())));
    if let Some(note) = &desc.note {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(note.clone(), Style::default().fg(Color::Yellow))));
    }
    let p = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title(desc.name.clone()));
    f.render_widget(p, area);
}

fn draw_form(area: Rect, f: &mut Frame, form: &CredentialForm) {
    let w = area.width.min(60);
    let h = 9.min(area.height);
    let popup = Rect {
        x: area.x + (area.width - w) / 2,
        y: area.y + (area.height - h) / 2,
        width: w,
        height: h,
    };
    let field = |label: &'static str, value: String, focused: bool| {
        let style = if focused {
            Style::default().fg(Color::Yellow)
        } else {
            Style::default()
        };
        let cursor = if focused { "_" } else { "" };
        Line::from(vec![
            Span::styled(label, style),
            Span::raw(value),
            Span::styled(cursor, style),
        ])
    };
    let mut lines = vec![
        Line::from(format!("{} needs API credentials from my.telegram.org", form.bridge)),
        Line::from(""),
        field("API ID:   ", form.api_id.display(), form.focus == 0),
        field("API Hash: ", form.api_hash.display(), form.focus == 1),
        Line::from(""),
    ];
    match &form.error {
        Some(err) => lines.push(Line::from(Span::styled(err.clone(), Style::default().fg(Color::Red)))),
        None => lines.push(hints(&[("tab", "switch"), ("enter", "save"), ("esc", "cancel")])),
    }
    f.render_widget(Clear, popup);
    f.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Credentials")),
        popup,
    );
}

#[cfg(test)]
mod tests {
    use super::super::tests::{configured, harness, press, reply_run, runs_queued, type_text};
    use super::*;
    use crate::orchestrator::{OperationKind, Step, UiCommand};

    fn select(state: &mut UiState, name: &str) {
        state.bridges.selected = state.catalog.names().position(|n| n == name).unwrap();
    }

    fn on_bridges(settings: crate::config::Settings) -> super::super::tests::Harness {
        let mut h = harness(Some(settings));
        h.state.dashboard.auto_start_pending = false;
        h.state.screen = Screen::Bridges;
        h
    }

    #[test]
    fn credential_bridge_opens_the_form_and_dispatches_nothing() {
        let mut h = on_bridges(configured());
        select(&mut h.state, "telegram");
        press(&mut h.state, KeyCode::Enter);
        assert!(h.state.bridges.form.is_some());
        assert_eq!(runs_queued(&mut h.rx), 0);

        press(&mut h.state, KeyCode::Esc);
        assert!(h.state.bridges.form.is_none());
        assert_eq!(runs_queued(&mut h.rx), 0);
        assert!(!h.state.settings.as_ref().unwrap().is_enabled("telegram"));
    }

    #[test]
    fn incomplete_credentials_keep_the_form_open() {
        let mut h = on_bridges(configured());
        select(&mut h.state, "telegram");
        press(&mut h.state, KeyCode::Enter);
        type_text(&mut h.state, "12345");
        press(&mut h.state, KeyCode::Enter);
        let form = h.state.bridges.form.as_ref().unwrap();
        assert!(form.error.is_some());
        assert_eq!(runs_queued(&mut h.rx), 0);
    }

    #[test]
    fn submitted_credentials_travel_with_the_enable() {
        let mut h = on_bridges(configured());
        select(&mut h.state, "telegram");
        press(&mut h.state, KeyCode::Enter);
        type_text(&mut h.state, "12345");
        press(&mut h.state, KeyCode::Tab);
        type_text(&mut h.state, "deadbeef");
        assert_eq!(h.state.bridges.form.as_ref().unwrap().api_hash.display(), "********");
        press(&mut h.state, KeyCode::Enter);
        assert!(h.state.bridges.form.is_none());

        let Ok(UiCommand::Run { plan, settings, .. }) = h.rx.try_recv() else {
            panic!("expected a run");
        };
        assert_eq!(plan.kind, OperationKind::EnableBridge("telegram".into()));
        let creds = settings.credentials_for("telegram").unwrap();
        assert_eq!(creds.api_id, "12345");
        assert_eq!(creds.api_hash, "deadbeef");
    }

    #[test]
    fn enabled_bridge_toggles_off_with_the_stack_state() {
        let mut s = configured();
        s.enable_bridge("signal");
        let mut h = on_bridges(s);
        h.state.statuses = super::super::tests::running(&["synapse"]);
        select(&mut h.state, "signal");
        press(&mut h.state, KeyCode::Enter);
        let Ok(UiCommand::Run { plan, .. }) = h.rx.try_recv() else {
            panic!("expected a run");
        };
        assert_eq!(plan.kind, OperationKind::DisableBridge("signal".into()));
        assert!(plan.steps.iter().any(|p| p.step == Step::Restart("synapse".into())));
    }

    #[test]
    fn second_toggle_is_ignored_while_one_runs() {
        let mut h = on_bridges(configured());
        select(&mut h.state, "whatsapp");
        press(&mut h.state, KeyCode::Enter);
        press(&mut h.state, KeyCode::Char('j'));
        press(&mut h.state, KeyCode::Enter);
        assert_eq!(runs_queued(&mut h.rx), 1);
    }

    #[test]
    fn navigation_is_bounded() {
        let mut h = on_bridges(configured());
        press(&mut h.state, KeyCode::Up);
        assert_eq!(h.state.bridges.selected, 0);
        for _ in 0..50 {
            press(&mut h.state, KeyCode::Down);
        }
        assert_eq!(h.state.bridges.selected, h.state.catalog.len() - 1);
        assert_eq!(runs_queued(&mut h.rx), 0);
    }

    #[test]
    fn finished_toggle_updates_settings() {
        let mut h = on_bridges(configured());
        select(&mut h.state, "signal");
        press(&mut h.state, KeyCode::Enter);
        reply_run(&mut h.rx, |mut s| {
            s.enable_bridge("signal");
            super::super::tests::ok_outcome(s)
        });
        super::super::update(&mut h.state, super::super::state::Msg::CheckTask(Screen::Bridges));
        assert!(h.state.settings.as_ref().unwrap().is_enabled("signal"));
        assert!(!h.state.bridges.slot.busy());
    }
}
