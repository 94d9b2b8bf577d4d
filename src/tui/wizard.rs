//! First-run setup: connectivity, identity and an initial bridge set.
//!
//! Bridges that need extra credentials are left out here and enabled later
//! from the Bridges screen, where the credential form lives.

use super::state::{Cmd, Screen, TaskSlot, TextField, UiState};
use super::{draw_slot, hints};
use crate::bridges::Catalog;
use crate::config::{Connectivity, HttpsConfig, Settings};
use crate::orchestrator::Plan;
use crossterm::event::{KeyCode, KeyEvent};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Welcome,
    Connectivity,
    Server,
    Bridges,
    Confirm,
    Complete,
}

impl Step {
    fn title(self) -> &'static str {
        match self {
            Step::Welcome => "Welcome",
            Step::Connectivity => "Connectivity",
            Step::Server => "Server",
            Step::Bridges => "Bridges",
            Step::Confirm => "Confirm",
            Step::Complete => "Done",
        }
    }

    fn back(self) -> Self {
        match self {
            Step::Connectivity => Step::Welcome,
            Step::Server => Step::Connectivity,
            Step::Bridges => Step::Server,
            Step::Confirm => Step::Bridges,
            other => other,
        }
    }
}

pub struct Wizard {
    pub slot: TaskSlot,
    pub step: Step,
    pub connectivity: Connectivity,
    pub server_name: TextField,
    pub domain: TextField,
    pub email: TextField,
    /// Index into the fields shown on the Server step.
    pub focus: usize,
    pub choices: Vec<String>,
    pub chosen: Vec<bool>,
    pub cursor: usize,
    pub error: Option<String>,
}

impl Wizard {
    pub fn new(catalog: &Catalog) -> Self {
        let choices: Vec<String> = catalog
            .iter()
            .filter(|d| !d.requires_credentials)
            .map(|d| d.name.clone())
            .collect();
        Self {
            slot: TaskSlot::default(),
            step: Step::Welcome,
            connectivity: Connectivity::Local,
            server_name: TextField::new("localhost"),
            domain: TextField::default(),
            email: TextField::default(),
            focus: 0,
            chosen: vec![false; choices.len()],
            choices,
            cursor: 0,
            error: None,
        }
    }

    fn field_count(&self) -> usize {
        if self.connectivity == Connectivity::Public {
            3
        } else {
            1
        }
    }

    fn focused(&mut self) -> &mut TextField {
        match self.focus {
            1 => &mut self.domain,
            2 => &mut self.email,
            _ => &mut self.server_name,
        }
    }

    pub fn selected_bridges(&self) -> Vec<String> {
        self.choices
            .iter()
            .zip(&self.chosen)
            .filter(|(_, on)| **on)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Settings described by the answers so far.
    pub fn build(&self) -> Result<Settings, String> {
        let server_name = self.server_name.trimmed();
        if server_name.is_empty() {
            return Err("Server name cannot be empty".into());
        }
        let https = (self.connectivity == Connectivity::Public).then(|| HttpsConfig {
            enabled: !self.domain.trimmed().is_empty(),
            domain: self.domain.trimmed().to_string(),
            email: self.email.trimmed().to_string(),
        });
        let mut settings = Settings::defaults_for(self.connectivity, server_name, https);
        for name in self.selected_bridges() {
            settings.enable_bridge(&name);
        }
        Ok(settings)
    }
}

pub(super) fn handle_key(state: &mut UiState, k: KeyEvent) -> Option<Vec<Cmd>> {
    if state.wizard.slot.busy() {
        return None;
    }
    let w = &mut state.wizard;
    if k.code == KeyCode::Esc && w.step != Step::Complete {
        w.error = None;
        w.step = w.step.back();
        return Some(Vec::new());
    }
    let step = w.step;
    match step {
        Step::Welcome => match k.code {
            KeyCode::Enter => w.step = Step::Connectivity,
            _ => return None,
        },
        Step::Connectivity => match k.code {
            KeyCode::Down | KeyCode::Right | KeyCode::Char('j') => w.connectivity = w.connectivity.next(),
            KeyCode::Up | KeyCode::Left | KeyCode::Char('k') => w.connectivity = w.connectivity.prev(),
            KeyCode::Enter => {
                w.focus = 0;
                w.step = Step::Server;
            }
            _ => return None,
        },
        Step::Server => match k.code {
            KeyCode::Tab | KeyCode::Down => w.focus = (w.focus + 1) % w.field_count(),
            KeyCode::BackTab | KeyCode::Up => {
                w.focus = (w.focus + w.field_count() - 1) % w.field_count()
            }
            KeyCode::Backspace => w.focused().backspace(),
            KeyCode::Char(c) => w.focused().push(c),
            KeyCode::Enter => match w.build() {
                Ok(_) => {
                    w.error = None;
                    w.step = Step::Bridges;
                }
                Err(e) => w.error = Some(e),
            },
            _ => {}
        },
        Step::Bridges => match k.code {
            KeyCode::Down | KeyCode::Char('j') => {
                if w.cursor + 1 < w.choices.len() {
                    w.cursor += 1;
                }
            }
            KeyCode::Up | KeyCode::Char('k') => w.cursor = w.cursor.saturating_sub(1),
            KeyCode::Char(' ') => {
                if let Some(on) = w.chosen.get_mut(w.cursor) {
                    *on = !*on;
                }
            }
            KeyCode::Enter => w.step = Step::Confirm,
            _ => return None,
        },
        Step::Confirm => match k.code {
            KeyCode::Enter => return Some(initialize(state)),
            _ => return None,
        },
        Step::Complete => match k.code {
            KeyCode::Enter => return Some(start_stack(state)),
            _ => return None,
        },
    }
    Some(Vec::new())
}

fn initialize(state: &mut UiState) -> Vec<Cmd> {
    match state.wizard.build() {
        Ok(settings) => state.launch(Screen::Wizard, Plan::initialize(), settings),
        Err(e) => {
            state.wizard.error = Some(e);
            Vec::new()
        }
    }
}

fn start_stack(state: &mut UiState) -> Vec<Cmd> {
    let mut cmds = super::switch_to(state, Screen::Dashboard);
    if let Some(settings) = state.settings.clone() {
        let plan = Plan::stack_up(false, !settings.enabled_bridges.is_empty(), &settings.timings);
        cmds.extend(state.launch(Screen::Dashboard, plan, settings));
    }
    cmds
}

/// Initialization finished; settings are on disk.
pub(super) fn completed(state: &mut UiState) {
    state.wizard.step = Step::Complete;
    super::settings::reset_form(state);
}

pub(super) fn draw(area: Rect, f: &mut Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(8), Constraint::Length(5), Constraint::Length(1)].as_ref())
        .split(area);
    let w = &state.wizard;
    let selected = Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD);
    let dim = Style::default().fg(Color::Gray);

    let mut lines: Vec<Line> = Vec::new();
    match w.step {
        Step::Welcome => {
            lines.push(Line::from("Welcome to muxbee."));
            lines.push(Line::from(""));
            lines.push(Line::from(
                "This sets up a Matrix homeserver (Synapse + PostgreSQL), the Element web client \
                 and optional mautrix bridges, all running under docker compose.",
            ));
            lines.push(Line::from(""));
            lines.push(Line::from("Press enter to begin."));
        }
        Step::Connectivity => {
            lines.push(Line::from("Who should be able to reach this server?"));
            lines.push(Line::from(""));
            for mode in Connectivity::ALL {
                let on = mode == w.connectivity;
                lines.push(Line::from(vec![
                    Span::styled(if on { "> " } else { "  " }, selected),
                    Span::styled(format!("{:<18}", mode.label()), if on { selected } else { Style::default() }),
                    Span::styled(mode.description(), dim),
                ]));
            }
        }
        Step::Server => {
            let mut field = |i: usize, label: &'static str, value: &TextField| {
                let style = if w.focus == i { selected } else { dim };
                lines.push(Line::from(vec![
                    Span::styled(format!("{label:<14}"), style),
                    Span::raw(value.display()),
                    Span::styled(if w.focus == i { "_" } else { "" }, style),
                ]));
            };
            field(0, "Server name", &w.server_name);
            if w.connectivity == Connectivity::Public {
                field(1, "Domain", &w.domain);
                field(2, "ACME email", &w.email);
            }
            lines.push(Line::from(""));
            lines.push(Line::from(Span::styled(
                "The server name is the part after the colon in @user:server and cannot change later.",
                dim,
            )));
        }
        Step::Bridges => {
            lines.push(Line::from("Pick the bridges to enable now. More can be added later."));
            lines.push(Line::from(""));
            for (i, name) in w.choices.iter().enumerate() {
                let mark = if w.chosen[i] { "[x]" } else { "[ ]" };
                let style = if i == w.cursor { selected } else { Style::default() };
                lines.push(Line::from(Span::styled(format!("{mark} {name}"), style)));
            }
        }
        Step::Confirm => match w.build() {
            Ok(s) => {
                lines.push(Line::from(format!("Server:       {}", s.server_name)));
                lines.push(Line::from(format!("Connectivity: {}", s.connectivity.label())));
                lines.push(Line::from(format!("Homeserver:   {}", s.public_base_url())));
                let bridges = if s.enabled_bridges.is_empty() {
                    "none".to_string()
                } else {
                    s.enabled_bridges.join(", ")
                };
                lines.push(Line::from(format!("Bridges:      {bridges}")));
                lines.push(Line::from(""));
                lines.push(Line::from("Press enter to write the configuration."));
            }
            Err(e) => lines.push(Line::from(Span::styled(e, Style::default().fg(Color::Red)))),
        },
        Step::Complete => {
            lines.push(Line::from("Configuration written."));
            if let Some(s) = &state.settings {
                lines.push(Line::from(""));
                lines.push(Line::from(format!("Admin account: {}", s.admin_user_id())));
                lines.push(Line::from(format!("Settings file: {}", state.paths.settings_file().display())));
            }
            lines.push(Line::from(""));
            lines.push(Line::from("Press enter to start the stack."));
        }
    }
    if let Some(err) = &w.error {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(err.clone(), Style::default().fg(Color::Red))));
    }

    let title = format!("Setup: {}", w.step.title());
    f.render_widget(
        Paragraph::new(lines)
            .wrap(Wrap { trim: false })
            .block(Block::default().borders(Borders::ALL).title(title)),
        rows[0],
    );
    draw_slot(rows[1], f, &w.slot);
    f.render_widget(
        Paragraph::new(hints(&[("enter", "continue"), ("esc", "back"), ("q", "quit")])),
        rows[2],
    );
}

#[cfg(test)]
mod tests {
    use super::super::state::Msg;
    use super::super::tests::{harness, press, reply_run, runs_queued, type_text};
    use super::super::update;
    use super::*;
    use crate::orchestrator::{OperationKind, UiCommand};

    #[test]
    fn credentialed_bridges_are_not_offered() {
        let w = Wizard::new(&Catalog::embedded().unwrap());
        assert!(!w.choices.iter().any(|c| c == "telegram"));
        assert!(w.choices.iter().any(|c| c == "signal"));
    }

    #[test]
    fn only_quit_escapes_an_unconfigured_wizard() {
        let mut h = harness(None);
        press(&mut h.state, KeyCode::Char('d'));
        press(&mut h.state, KeyCode::Char('b'));
        assert_eq!(h.state.screen, Screen::Wizard);
        assert!(matches!(press(&mut h.state, KeyCode::Char('q')).as_slice(), [Cmd::Quit]));
    }

    #[test]
    fn empty_server_name_stays_on_the_server_step() {
        let mut h = harness(None);
        press(&mut h.state, KeyCode::Enter);
        press(&mut h.state, KeyCode::Enter);
        for _ in 0.."localhost".len() {
            press(&mut h.state, KeyCode::Backspace);
        }
        press(&mut h.state, KeyCode::Enter);
        assert_eq!(h.state.wizard.step, Step::Server);
        assert!(h.state.wizard.error.is_some());
    }

    #[test]
    fn public_mode_collects_https_details() {
        let mut h = harness(None);
        press(&mut h.state, KeyCode::Enter);
        press(&mut h.state, KeyCode::Up);
        assert_eq!(h.state.wizard.connectivity, Connectivity::Public);
        press(&mut h.state, KeyCode::Enter);
        press(&mut h.state, KeyCode::Tab);
        type_text(&mut h.state, "matrix.example.org");
        let s = h.state.wizard.build().unwrap();
        assert!(s.https_active());
        assert_eq!(s.https.domain, "matrix.example.org");
    }

    #[test]
    fn full_walkthrough_initializes_then_starts() {
        let mut h = harness(None);
        press(&mut h.state, KeyCode::Enter); // welcome
        press(&mut h.state, KeyCode::Enter); // local
        press(&mut h.state, KeyCode::Enter); // localhost
        let signal = h.state.wizard.choices.iter().position(|c| c == "signal").unwrap();
        for _ in 0..signal {
            press(&mut h.state, KeyCode::Down);
        }
        press(&mut h.state, KeyCode::Char(' '));
        press(&mut h.state, KeyCode::Enter);
        assert_eq!(h.state.wizard.step, Step::Confirm);
        press(&mut h.state, KeyCode::Enter);

        let Ok(UiCommand::Run { plan, settings, reply, .. }) = h.rx.try_recv() else {
            panic!("expected the initialize run");
        };
        assert_eq!(plan.kind, OperationKind::Initialize);
        assert_eq!(settings.enabled_bridges, vec!["signal"]);
        reply.send(super::super::tests::ok_outcome(settings)).ok().unwrap();

        update(&mut h.state, Msg::CheckTask(Screen::Wizard));
        assert_eq!(h.state.wizard.step, Step::Complete);
        assert!(h.state.settings.is_some());

        press(&mut h.state, KeyCode::Enter);
        assert_eq!(h.state.screen, Screen::Dashboard);
        assert_eq!(
            reply_run(&mut h.rx, super::super::tests::ok_outcome),
            OperationKind::Up
        );
        assert_eq!(runs_queued(&mut h.rx), 0);
    }
}
