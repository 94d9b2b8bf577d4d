mod bridges;
mod dashboard;
mod help;
mod logs;
mod settings;
mod state;
mod task;
mod wizard;

use crate::config::{Settings, Timings};
use crate::error;
use crate::orchestrator::{self, Orchestrator, UiCommand};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Tabs, Wrap},
    Terminal,
};
use state::{Cmd, Msg, Screen, TaskSlot, UiState, CHECK_INTERVAL, SPINNER_INTERVAL};
use std::{io, time::Duration, time::Instant};
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::mpsc;
use tokio::sync::oneshot::error::TryRecvError;

pub async fn run(orch: Orchestrator, settings: Option<Settings>) -> Result<()> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let state = UiState::new(orch.paths().clone(), orch.catalog().clone(), settings, cmd_tx);

    // The UI owns the terminal on its own thread; the runtime only serves background units.
    let ui_handle = std::thread::spawn(move || run_threaded(state));

    let res = orchestrator::run_controller(orch, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Delayed messages, delivered one at a time between renders.
#[derive(Default)]
struct Timers {
    queue: Vec<(Instant, Msg)>,
}

impl Timers {
    /// Returns true when a command asked to quit.
    fn schedule(&mut self, cmds: Vec<Cmd>) -> bool {
        let mut quit = false;
        for cmd in cmds {
            match cmd {
                Cmd::After(delay, msg) => self.queue.push((Instant::now() + delay, msg)),
                Cmd::Quit => quit = true,
            }
        }
        quit
    }

    fn pop_due(&mut self, now: Instant) -> Option<Msg> {
        let (idx, _) = self
            .queue
            .iter()
            .enumerate()
            .filter(|(_, (at, _))| *at <= now)
            .min_by_key(|(_, (at, _))| *at)?;
        Some(self.queue.remove(idx).1)
    }
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(mut state: UiState) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let mut timers = Timers::default();
    timers.schedule(start(&mut state));

    let tick_rate = Duration::from_millis(100);
    let mut last_draw: Option<Instant> = None;

    let res = loop {
        let mut quit = false;
        let mut dirty = false;
        while let Some(msg) = timers.pop_due(Instant::now()) {
            quit |= timers.schedule(update(&mut state, msg));
            dirty = true;
        }
        if quit {
            break Ok(());
        }

        if dirty || last_draw.map_or(true, |t| t.elapsed() >= tick_rate) {
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_draw = Some(Instant::now());
        }

        // Short poll keeps timer delivery close to schedule.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                if timers.schedule(update(&mut state, Msg::Key(k))) {
                    break Ok(());
                }
                terminal.draw(|f| draw(f.area(), f, &state)).ok();
                last_draw = Some(Instant::now());
            }
        }
    };

    state.logs.close();
    let _ = state.cmd_tx.send(UiCommand::Quit);

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

/// Messages to schedule when the UI comes up.
fn start(_state: &mut UiState) -> Vec<Cmd> {
    vec![Cmd::After(Duration::ZERO, Msg::StatusTick)]
}

/// The only place UI state changes.
fn update(state: &mut UiState, msg: Msg) -> Vec<Cmd> {
    match msg {
        Msg::Key(k) => handle_key(state, k),
        Msg::CheckTask(screen) => check_task(state, screen),
        Msg::Spinner(screen, id) => match state.slot_mut(screen).and_then(|s| s.task.as_mut()) {
            Some(task) if task.id == id => {
                task.advance_spinner();
                vec![Cmd::After(SPINNER_INTERVAL, Msg::Spinner(screen, id))]
            }
            _ => Vec::new(),
        },
        Msg::StatusTick => {
            let mut cmds = refresh_status(state);
            let every = state
                .settings
                .as_ref()
                .map(|s| s.timings.status_refresh)
                .unwrap_or_else(|| Timings::default().status_refresh);
            cmds.push(Cmd::After(every, Msg::StatusTick));
            cmds
        }
        Msg::RefreshStatus => refresh_status(state),
        Msg::CheckStatus => check_status(state),
        Msg::DrainLogs(generation) => logs::drain(state, generation),
    }
}

fn handle_key(state: &mut UiState, k: KeyEvent) -> Vec<Cmd> {
    if k.modifiers.contains(KeyModifiers::CONTROL) && k.code == KeyCode::Char('c') {
        return vec![Cmd::Quit];
    }

    // Screens see keys first; forms capture text.
    let handled = match state.screen {
        Screen::Dashboard => dashboard::handle_key(state, k),
        Screen::Bridges => bridges::handle_key(state, k),
        Screen::Logs => logs::handle_key(state, k),
        Screen::Settings => settings::handle_key(state, k),
        Screen::Wizard => wizard::handle_key(state, k),
        Screen::Help => match k.code {
            KeyCode::Esc | KeyCode::Char('?') => {
                let back = state.previous;
                Some(switch_to(state, back))
            }
            _ => None,
        },
    };
    if let Some(cmds) = handled {
        return cmds;
    }

    if state.screen == Screen::Wizard && state.settings.is_none() {
        return match k.code {
            KeyCode::Char('q') => vec![Cmd::Quit],
            _ => Vec::new(),
        };
    }

    match k.code {
        KeyCode::Char('q') => vec![Cmd::Quit],
        KeyCode::Char('d') => switch_to(state, Screen::Dashboard),
        KeyCode::Char('b') => switch_to(state, Screen::Bridges),
        KeyCode::Char('l') => switch_to(state, Screen::Logs),
        KeyCode::Char('c') => switch_to(state, Screen::Settings),
        KeyCode::Char('?') => switch_to(state, Screen::Help),
        KeyCode::Tab => {
            let idx = Screen::TABS.iter().position(|s| *s == state.screen).unwrap_or(0);
            switch_to(state, Screen::TABS[(idx + 1) % Screen::TABS.len()])
        }
        _ => Vec::new(),
    }
}

fn switch_to(state: &mut UiState, screen: Screen) -> Vec<Cmd> {
    if state.screen == screen {
        return Vec::new();
    }
    if state.screen == Screen::Logs {
        state.logs.close();
    }
    if screen == Screen::Help {
        state.previous = state.screen;
    }
    state.screen = screen;
    match screen {
        Screen::Logs => logs::open(state),
        Screen::Settings => {
            settings::reset_form(state);
            Vec::new()
        }
        _ => Vec::new(),
    }
}

fn check_task(state: &mut UiState, screen: Screen) -> Vec<Cmd> {
    let Some(slot) = state.slot_mut(screen) else {
        return Vec::new();
    };
    let Some(kind) = slot.task.as_ref().map(|t| t.kind.clone()) else {
        return Vec::new();
    };
    let Some(res) = slot.take_finished() else {
        return vec![Cmd::After(CHECK_INTERVAL, Msg::CheckTask(screen))];
    };

    match res {
        Ok(outcome) => {
            slot.info = outcome.notes;
            slot.info
                .extend(outcome.warnings.iter().map(|w| format!("warning: {w}")));
            if slot.info.is_empty() {
                slot.info.push(format!("{} done", kind.label()));
            }
            state.settings = Some(outcome.settings);
            match screen {
                Screen::Wizard => wizard::completed(state),
                Screen::Settings => settings::completed(state),
                _ => {}
            }
        }
        Err(e) => {
            tracing::warn!(operation = %kind.label(), "{}", error::chain(&e));
            slot.error = Some(error::chain(&e));
            state.reload_settings();
        }
    }
    vec![Cmd::After(Duration::ZERO, Msg::RefreshStatus)]
}

/// One status fetch unless one is already outstanding.
fn refresh_status(state: &mut UiState) -> Vec<Cmd> {
    if state.status_rx.is_some() {
        return Vec::new();
    }
    let Some(settings) = state.settings.clone() else {
        return Vec::new();
    };
    let (reply, rx) = tokio::sync::oneshot::channel();
    if state
        .cmd_tx
        .send(UiCommand::FetchStatus { settings, reply })
        .is_err()
    {
        return Vec::new();
    }
    state.status_rx = Some(rx);
    vec![Cmd::After(CHECK_INTERVAL, Msg::CheckStatus)]
}

fn check_status(state: &mut UiState) -> Vec<Cmd> {
    let Some(rx) = state.status_rx.as_mut() else {
        return Vec::new();
    };
    match rx.try_recv() {
        Ok(statuses) => {
            state.status_rx = None;
            state.statuses = statuses;
            let now = OffsetDateTime::now_utc();
            state.status_refreshed = Some(
                UtcOffset::current_local_offset()
                    .map(|o| now.to_offset(o))
                    .unwrap_or(now),
            );
            dashboard::after_status(state)
        }
        Err(TryRecvError::Empty) => vec![Cmd::After(CHECK_INTERVAL, Msg::CheckStatus)],
        Err(TryRecvError::Closed) => {
            state.status_rx = None;
            Vec::new()
        }
    }
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let selected = Screen::TABS.iter().position(|s| *s == state.screen);
    let mut tabs = Tabs::new(Screen::TABS.iter().map(|s| Line::from(s.title())).collect::<Vec<_>>())
        .block(Block::default().borders(Borders::ALL).title("muxbee"))
        .highlight_style(Style::default().fg(Color::Yellow));
    if let Some(idx) = selected {
        tabs = tabs.select(idx);
    }
    f.render_widget(tabs, chunks[0]);

    match state.screen {
        Screen::Dashboard => dashboard::draw(chunks[1], f, state),
        Screen::Bridges => bridges::draw(chunks[1], f, state),
        Screen::Logs => logs::draw(chunks[1], f, state),
        Screen::Settings => settings::draw(chunks[1], f, state),
        Screen::Wizard => wizard::draw(chunks[1], f, state),
        Screen::Help => help::draw_help(chunks[1], f),
    }
}

pub(super) fn key(k: &'static str) -> Span<'static> {
    Span::styled(k, Style::default().fg(Color::Magenta))
}

/// `key desc  key desc ...`
pub(super) fn hints(pairs: &[(&'static str, &'static str)]) -> Line<'static> {
    let mut spans = Vec::with_capacity(pairs.len() * 2);
    for (k, desc) in pairs {
        spans.push(key(k));
        spans.push(Span::raw(format!(" {desc}  ")));
    }
    Line::from(spans)
}

/// Spinner and step while running, else the last error or result.
pub(super) fn slot_lines(slot: &TaskSlot) -> Vec<Line<'static>> {
    if let Some(task) = &slot.task {
        return vec![Line::from(vec![
            Span::styled(task.spinner(), Style::default().fg(Color::Cyan)),
            Span::raw(" "),
            Span::raw(task.step_label()),
        ])];
    }
    if let Some(err) = &slot.error {
        return vec![Line::from(Span::styled(
            format!("Error: {err}"),
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        ))];
    }
    slot.info
        .iter()
        .map(|l| {
            let style = if l.starts_with("warning:") {
                Style::default().fg(Color::Yellow)
            } else {
                Style::default().fg(Color::Green)
            };
            Line::from(Span::styled(l.clone(), style))
        })
        .collect()
}

pub(super) fn draw_slot(area: Rect, f: &mut ratatui::Frame, slot: &TaskSlot) {
    let p = Paragraph::new(slot_lines(slot))
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(p, area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridges::Catalog;
    use crate::compose::ServiceStatus;
    use crate::config::{Connectivity, Paths};
    use crate::orchestrator::{OperationKind, Outcome};
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    pub(super) struct Harness {
        pub _dir: tempfile::TempDir,
        pub state: UiState,
        pub rx: UnboundedReceiver<UiCommand>,
    }

    pub(super) fn harness(settings: Option<Settings>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("config"), dir.path().join("data"));
        let (tx, rx) = mpsc::unbounded_channel();
        let state = UiState::new(paths, Arc::new(Catalog::embedded().unwrap()), settings, tx);
        Harness { _dir: dir, state, rx }
    }

    pub(super) fn configured() -> Settings {
        let mut s = Settings::defaults("localhost", Connectivity::Local);
        s.ports.synapse = Some(8008);
        s.ports.element = Some(8080);
        s
    }

    pub(super) fn press(state: &mut UiState, code: KeyCode) -> Vec<Cmd> {
        update(state, Msg::Key(KeyEvent::new(code, KeyModifiers::NONE)))
    }

    pub(super) fn type_text(state: &mut UiState, text: &str) {
        for c in text.chars() {
            press(state, KeyCode::Char(c));
        }
    }

    pub(super) fn running(names: &[&str]) -> Vec<ServiceStatus> {
        names
            .iter()
            .map(|n| ServiceStatus {
                name: n.to_string(),
                container: format!("muxbee-{n}-1"),
                state: "running".into(),
                running: true,
                ..Default::default()
            })
            .collect()
    }

    /// Answer the next queued run with `res`, returning its plan kind.
    pub(super) fn reply_run(
        rx: &mut UnboundedReceiver<UiCommand>,
        res: impl FnOnce(Settings) -> orchestrator::RunResult,
    ) -> OperationKind {
        loop {
            match rx.try_recv() {
                Ok(UiCommand::Run {
                    plan,
                    settings,
                    reply,
                    ..
                }) => {
                    reply.send(res(settings)).ok().unwrap();
                    return plan.kind;
                }
                Ok(_) => continue,
                Err(e) => panic!("no run queued: {e}"),
            }
        }
    }

    pub(super) fn ok_outcome(settings: Settings) -> orchestrator::RunResult {
        Ok(Outcome {
            settings,
            warnings: Vec::new(),
            notes: Vec::new(),
        })
    }

    pub(super) fn runs_queued(rx: &mut UnboundedReceiver<UiCommand>) -> usize {
        let mut n = 0;
        while let Ok(cmd) = rx.try_recv() {
            if matches!(cmd, UiCommand::Run { .. }) {
                n += 1;
            }
        }
        n
    }

    #[test]
    fn first_run_opens_the_wizard() {
        let h = harness(None);
        assert_eq!(h.state.screen, Screen::Wizard);
        let h = harness(Some(configured()));
        assert_eq!(h.state.screen, Screen::Dashboard);
    }

    #[test]
    fn quit_keys() {
        let mut h = harness(Some(configured()));
        assert!(matches!(press(&mut h.state, KeyCode::Char('q')).as_slice(), [Cmd::Quit]));
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert!(matches!(update(&mut h.state, Msg::Key(ctrl_c)).as_slice(), [Cmd::Quit]));
    }

    #[test]
    fn status_fetch_is_not_duplicated_while_outstanding() {
        let mut h = harness(Some(configured()));
        let cmds = update(&mut h.state, Msg::RefreshStatus);
        assert!(matches!(cmds.as_slice(), [Cmd::After(_, Msg::CheckStatus)]));
        assert!(update(&mut h.state, Msg::RefreshStatus).is_empty());

        let Ok(UiCommand::FetchStatus { reply, .. }) = h.rx.try_recv() else {
            panic!("expected a status fetch");
        };
        assert!(h.rx.try_recv().is_err());

        // Not answered yet: check again later.
        assert!(matches!(
            update(&mut h.state, Msg::CheckStatus).as_slice(),
            [Cmd::After(_, Msg::CheckStatus)]
        ));
        reply.send(running(&["synapse", "postgres"])).unwrap();
        update(&mut h.state, Msg::CheckStatus);
        assert!(h.state.stack_running());
        assert!(h.state.status_refreshed.is_some());
        assert!(h.state.status_rx.is_none());
    }

    #[test]
    fn status_tick_reschedules_itself() {
        let mut h = harness(Some(configured()));
        let cmds = update(&mut h.state, Msg::StatusTick);
        assert!(cmds
            .iter()
            .any(|c| matches!(c, Cmd::After(d, Msg::StatusTick) if *d == Duration::from_secs(2))));
    }

    #[test]
    fn check_ticks_stop_once_the_result_is_consumed() {
        let mut h = harness(Some(configured()));
        h.state.dashboard.auto_start_pending = false;
        let cmds = press(&mut h.state, KeyCode::Char('x'));
        assert!(cmds
            .iter()
            .any(|c| matches!(c, Cmd::After(d, Msg::CheckTask(Screen::Dashboard)) if *d < Duration::from_millis(200))));
        assert!(cmds
            .iter()
            .any(|c| matches!(c, Cmd::After(d, Msg::Spinner(Screen::Dashboard, _)) if *d < Duration::from_millis(150))));

        assert!(matches!(
            update(&mut h.state, Msg::CheckTask(Screen::Dashboard)).as_slice(),
            [Cmd::After(_, Msg::CheckTask(Screen::Dashboard))]
        ));
        assert_eq!(reply_run(&mut h.rx, ok_outcome), OperationKind::Stop);

        let cmds = update(&mut h.state, Msg::CheckTask(Screen::Dashboard));
        assert!(!cmds.iter().any(|c| matches!(c, Cmd::After(_, Msg::CheckTask(_)))));
        assert!(!h.state.dashboard.slot.busy());
        assert_eq!(h.state.dashboard.slot.info, vec!["Stopping done"]);
        assert!(update(&mut h.state, Msg::Spinner(Screen::Dashboard, 0)).is_empty());
        assert!(update(&mut h.state, Msg::CheckTask(Screen::Dashboard)).is_empty());
    }

    #[test]
    fn failed_run_is_shown_inline_and_settings_reload() {
        let mut h = harness(Some(configured()));
        h.state.dashboard.auto_start_pending = false;
        let mut on_disk = configured();
        on_disk.enable_bridge("signal");
        on_disk.save(&h.state.paths).unwrap();

        press(&mut h.state, KeyCode::Char('r'));
        reply_run(&mut h.rx, |_| {
            Err(crate::error::OrchestrationError::Step {
                index: 0,
                label: "Stopping services".into(),
                service: None,
                source: crate::error::Error::tool("docker compose down", "daemon not running"),
            })
        });
        update(&mut h.state, Msg::CheckTask(Screen::Dashboard));
        let err = h.state.dashboard.slot.error.clone().unwrap();
        assert!(err.starts_with("Stopping services failed"));
        assert!(err.contains("daemon not running"));
        assert!(h.state.settings.as_ref().unwrap().is_enabled("signal"));
    }

    #[test]
    fn one_task_per_screen_extra_intents_are_ignored() {
        let mut h = harness(Some(configured()));
        h.state.dashboard.auto_start_pending = false;
        press(&mut h.state, KeyCode::Char('x'));
        assert!(press(&mut h.state, KeyCode::Char('r')).is_empty());
        assert!(press(&mut h.state, KeyCode::Char('s')).is_empty());
        assert_eq!(runs_queued(&mut h.rx), 1);
    }

    #[test]
    fn timers_deliver_in_due_order() {
        let mut t = Timers::default();
        let now = Instant::now();
        t.queue.push((now + Duration::from_millis(5), Msg::CheckStatus));
        t.queue.push((now, Msg::DrainLogs(1)));
        t.queue.push((now + Duration::from_secs(60), Msg::StatusTick));
        let later = now + Duration::from_millis(10);
        assert!(matches!(t.pop_due(later), Some(Msg::DrainLogs(1))));
        assert!(matches!(t.pop_due(later), Some(Msg::CheckStatus)));
        assert!(t.pop_due(later).is_none());
        assert_eq!(t.queue.len(), 1);
    }

    /// Deliver everything queued once, as a frame of the event loop would.
    fn run_round(t: &mut Timers, state: &mut UiState) {
        for (_, msg) in std::mem::take(&mut t.queue) {
            t.schedule(update(state, msg));
        }
    }

    #[test]
    fn log_reconnects_leave_a_single_drain_chain() {
        let mut h = harness(Some(configured()));
        h.state.dashboard.auto_start_pending = false;
        let mut t = Timers::default();
        t.schedule(press(&mut h.state, KeyCode::Char('l')));
        for _ in 0..4 {
            t.schedule(press(&mut h.state, KeyCode::Char('r')));
        }
        for _ in 0..10 {
            run_round(&mut t, &mut h.state);
        }
        let chains = t
            .queue
            .iter()
            .filter(|(_, m)| matches!(m, Msg::DrainLogs(_)))
            .count();
        assert_eq!(chains, 1);
        assert!(h.state.logs.streaming());
    }

    #[test]
    fn relaunch_keeps_a_single_spinner_chain() {
        let mut h = harness(Some(configured()));
        h.state.dashboard.auto_start_pending = false;
        let mut t = Timers::default();
        t.schedule(press(&mut h.state, KeyCode::Char('x')));
        reply_run(&mut h.rx, ok_outcome);
        // Consume the result without running the stale spinner tick.
        update(&mut h.state, Msg::CheckTask(Screen::Dashboard));
        t.queue.retain(|(_, m)| !matches!(m, Msg::CheckTask(_)));
        assert!(!h.state.dashboard.slot.busy());

        t.schedule(press(&mut h.state, KeyCode::Char('r')));
        for _ in 0..5 {
            run_round(&mut t, &mut h.state);
        }
        let spinners = t
            .queue
            .iter()
            .filter(|(_, m)| matches!(m, Msg::Spinner(Screen::Dashboard, _)))
            .count();
        assert_eq!(spinners, 1);
    }
}
