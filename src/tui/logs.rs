use super::hints;
use super::state::{Cmd, Msg, Screen, UiState, LOG_DRAIN_INTERVAL};
use crate::compose::{parse_service_name, strip_instance, PROJECT};
use crate::orchestrator::UiCommand;
use crossterm::event::{KeyCode, KeyEvent};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};
use std::collections::VecDeque;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::oneshot;

pub const LOG_CAPACITY: usize = 500;
/// Lines of history requested when a stream starts.
pub const LOG_TAIL: usize = 100;

const SERVICE_COLORS: [Color; 6] = [
    Color::Cyan,
    Color::Green,
    Color::Yellow,
    Color::Magenta,
    Color::Blue,
    Color::LightRed,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Empty when the line carried no `service |` prefix.
    pub service: String,
    pub text: String,
}

/// Split a compose log line into its service and message.
pub fn parse_log_line(raw: &str) -> LogLine {
    let Some((prefix, text)) = raw.split_once('|') else {
        return LogLine {
            service: String::new(),
            text: raw.to_string(),
        };
    };
    let prefix = prefix.trim();
    let service = if prefix.starts_with(&format!("{PROJECT}-")) {
        parse_service_name(prefix)
    } else {
        strip_instance(prefix).to_string()
    };
    LogLine {
        service,
        text: text.strip_prefix(' ').unwrap_or(text).to_string(),
    }
}

/// Bounded history with an optional single-service filter.
#[derive(Debug, Default)]
pub struct LogBuffer {
    lines: VecDeque<LogLine>,
    /// First-seen order, used for filter cycling and colors.
    services: Vec<String>,
    filter: Option<String>,
}

impl LogBuffer {
    pub fn push(&mut self, line: LogLine) {
        if !line.service.is_empty() && !self.services.contains(&line.service) {
            self.services.push(line.service.clone());
        }
        if self.lines.len() == LOG_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// All, then each known service in turn, then all again.
    pub fn cycle_filter(&mut self) {
        self.filter = match &self.filter {
            None => self.services.first().cloned(),
            Some(current) => self
                .services
                .iter()
                .position(|s| s == current)
                .and_then(|i| self.services.get(i + 1))
                .cloned(),
        };
    }

    pub fn visible(&self) -> impl Iterator<Item = &LogLine> {
        self.lines
            .iter()
            .filter(move |l| self.filter.as_ref().map_or(true, |f| &l.service == f))
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    fn color_of(&self, service: &str) -> Color {
        self.services
            .iter()
            .position(|s| s == service)
            .map(|i| SERVICE_COLORS[i % SERVICE_COLORS.len()])
            .unwrap_or(Color::Gray)
    }
}

struct LogStream {
    lines: UnboundedReceiver<String>,
    /// Dropping it ends the follow process.
    _stop: oneshot::Sender<()>,
}

#[derive(Default)]
pub struct LogsView {
    pub buffer: LogBuffer,
    pub paused: bool,
    stream: Option<LogStream>,
    /// Tags drain ticks; bumped whenever the stream is closed or replaced.
    generation: u64,
    pub error: Option<String>,
}

impl LogsView {
    pub fn streaming(&self) -> bool {
        self.stream.is_some()
    }

    pub fn close(&mut self) {
        self.generation += 1;
        if self.stream.take().is_some() {
            tracing::debug!("log stream closed");
        }
    }
}

/// Start following every service's logs.
pub(super) fn open(state: &mut UiState) -> Vec<Cmd> {
    state.logs.close();
    state.logs.error = None;
    let Some(settings) = state.settings.clone() else {
        state.logs.error = Some("not configured yet".into());
        return Vec::new();
    };
    let (sink, lines) = mpsc::unbounded_channel();
    let (stop_tx, stop) = oneshot::channel();
    let sent = state.cmd_tx.send(UiCommand::StreamLogs {
        settings,
        service: None,
        tail: LOG_TAIL,
        sink,
        stop,
    });
    if sent.is_err() {
        state.logs.error = Some("background controller is not running".into());
        return Vec::new();
    }
    state.logs.stream = Some(LogStream {
        lines,
        _stop: stop_tx,
    });
    vec![Cmd::After(LOG_DRAIN_INTERVAL, Msg::DrainLogs(state.logs.generation))]
}

pub(super) fn drain(state: &mut UiState, generation: u64) -> Vec<Cmd> {
    if generation != state.logs.generation {
        return Vec::new();
    }
    let Some(stream) = state.logs.stream.as_mut() else {
        return Vec::new();
    };
    let mut ended = false;
    loop {
        match stream.lines.try_recv() {
            Ok(raw) => {
                if !state.logs.paused {
                    state.logs.buffer.push(parse_log_line(&raw));
                }
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                ended = true;
                break;
            }
        }
    }
    if ended {
        state.logs.stream = None;
        return Vec::new();
    }
    if state.screen != Screen::Logs {
        return Vec::new();
    }
    vec![Cmd::After(LOG_DRAIN_INTERVAL, Msg::DrainLogs(generation))]
}

pub(super) fn handle_key(state: &mut UiState, k: KeyEvent) -> Option<Vec<Cmd>> {
    match k.code {
        KeyCode::Char('p') => state.logs.paused = !state.logs.paused,
        KeyCode::Char('f') => state.logs.buffer.cycle_filter(),
        KeyCode::Char('x') => state.logs.buffer.clear(),
        KeyCode::Char('r') => return Some(open(state)),
        _ => return None,
    }
    Some(Vec::new())
}

pub(super) fn draw(area: Rect, f: &mut Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(1)].as_ref())
        .split(area);

    let view = &state.logs;
    let height = rows[0].height.saturating_sub(2) as usize;
    let visible: Vec<&LogLine> = view.buffer.visible().collect();
    let start = visible.len().saturating_sub(height);
    let mut lines: Vec<Line> = visible[start..]
        .iter()
        .map(|l| {
            if l.service.is_empty() {
                return Line::from(l.text.clone());
            }
            Line::from(vec![
                Span::styled(
                    format!("{:<20}", l.service),
                    Style::default().fg(view.buffer.color_of(&l.service)),
                ),
                Span::raw(" "),
                Span::raw(l.text.clone()),
            ])
        })
        .collect();
    if let Some(err) = &view.error {
        lines.push(Line::from(Span::styled(err.clone(), Style::default().fg(Color::Red))));
    }

    let mut title = format!("Logs [{}]", view.buffer.filter().unwrap_or("all"));
    if view.paused {
        title.push_str(" (paused)");
    } else if !view.streaming() {
        title.push_str(" (ended)");
    }
    f.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title)),
        rows[0],
    );
    f.render_widget(
        Paragraph::new(hints(&[
            ("p", "pause"),
            ("f", "filter"),
            ("x", "clear"),
            ("r", "reconnect"),
            ("d", "dashboard"),
            ("q", "quit"),
        ])),
        rows[1],
    );
}
