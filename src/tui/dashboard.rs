use super::state::{Cmd, Screen, UiState};
use super::{draw_slot, hints};
use crate::orchestrator::{Plan, UiCommand};
use crossterm::event::{KeyCode, KeyEvent};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table},
    Frame,
};
use time::macros::format_description;

pub(super) fn handle_key(state: &mut UiState, k: KeyEvent) -> Option<Vec<Cmd>> {
    let settings = state.settings.clone()?;
    let plan = match k.code {
        KeyCode::Char('s') => Plan::stack_up(false, !settings.enabled_bridges.is_empty(), &settings.timings),
        KeyCode::Char('x') => Plan::stop(),
        KeyCode::Char('r') => Plan::restart(),
        KeyCode::Char('u') => Plan::update(),
        KeyCode::Char('e') => Plan::toggle_element(!settings.element_enabled(), state.stack_running()),
        KeyCode::Char('o') => {
            if settings.element_enabled() {
                let _ = state.cmd_tx.send(UiCommand::OpenUrl(settings.element_url()));
            } else {
                state.dashboard.slot.info = vec!["Element is disabled (press e to enable)".into()];
            }
            return Some(Vec::new());
        }
        _ => return None,
    };
    Some(state.launch(Screen::Dashboard, plan, settings))
}

/// First status after launch: bring the stack up if nothing runs.
pub(super) fn after_status(state: &mut UiState) -> Vec<Cmd> {
    if !state.dashboard.auto_start_pending {
        return Vec::new();
    }
    state.dashboard.auto_start_pending = false;
    if state.statuses.iter().any(|s| s.running) {
        return Vec::new();
    }
    let Some(settings) = state.settings.clone() else {
        return Vec::new();
    };
    tracing::info!("no services running; starting stack");
    state.launch(Screen::Dashboard, Plan::auto_start(), settings)
}

pub(super) fn draw(area: Rect, f: &mut Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(7),
                Constraint::Min(5),
                Constraint::Length(5),
                Constraint::Length(1),
            ]
            .as_ref(),
        )
        .split(area);

    let label = Style::default().fg(Color::Gray);
    let mut info = Vec::new();
    if let Some(s) = &state.settings {
        let element = if s.element_enabled() {
            s.element_url()
        } else {
            "disabled".into()
        };
        info.push(Line::from(vec![
            Span::styled("Server:      ", label),
            Span::raw(s.server_name.clone()),
            Span::raw(format!("  ({})", s.connectivity.label())),
        ]));
        info.push(Line::from(vec![
            Span::styled("Homeserver:  ", label),
            Span::raw(s.public_base_url()),
        ]));
        info.push(Line::from(vec![
            Span::styled("Element:     ", label),
            Span::raw(element),
        ]));
        info.push(Line::from(vec![
            Span::styled("Admin:       ", label),
            Span::raw(s.admin_user_id()),
        ]));
        let bridges = if s.enabled_bridges.is_empty() {
            "none".to_string()
        } else {
            s.enabled_bridges.join(", ")
        };
        info.push(Line::from(vec![
            Span::styled("Bridges:     ", label),
            Span::raw(bridges),
        ]));
    }
    f.render_widget(
        Paragraph::new(info).block(Block::default().borders(Borders::ALL).title("Overview")),
        rows[0],
    );

    let header = Row::new(vec!["Service", "State", "Version", "Image"])
        .style(Style::default().add_modifier(Modifier::BOLD));
    let body: Vec<Row> = state
        .statuses
        .iter()
        .map(|s| {
            let color = if s.running { Color::Green } else { Color::Red };
            Row::new(vec![
                Cell::from(s.name.clone()),
                Cell::from(s.display_state()).style(Style::default().fg(color)),
                Cell::from(s.version.clone().unwrap_or_else(|| "-".into())),
                Cell::from(s.image.clone()),
            ])
        })
        .collect();
    let refreshed = state
        .status_refreshed
        .and_then(|t| t.format(format_description!("[hour]:[minute]:[second]")).ok())
        .map(|t| format!("Services (updated {t})"))
        .unwrap_or_else(|| "Services".into());
    let table = if body.is_empty() {
        Table::new(
            vec![Row::new(vec!["no containers"]).style(Style::default().fg(Color::DarkGray))],
            [Constraint::Percentage(100)],
        )
    } else {
        Table::new(
            body,
            [
                Constraint::Length(22),
                Constraint::Length(20),
                Constraint::Length(12),
                Constraint::Min(10),
            ],
        )
        .header(header)
    };
    f.render_widget(table.block(Block::default().borders(Borders::ALL).title(refreshed)), rows[1]);

    draw_slot(rows[2], f, &state.dashboard.slot);

    f.render_widget(
        Paragraph::new(hints(&[
            ("s", "start"),
            ("x", "stop"),
            ("r", "restart"),
            ("u", "update"),
            ("e", "element"),
            ("o", "open"),
            ("?", "help"),
            ("q", "quit"),
        ])),
        rows[3],
    );
}
