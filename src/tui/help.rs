use ratatui::{
    layout::Rect,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

const SECTIONS: &[(&str, &[(&str, &str)])] = &[
    (
        "Navigation",
        &[
            ("d / b / l / c", "Dashboard, Bridges, Logs, Settings"),
            ("tab", "Next screen"),
            ("?", "Toggle this help"),
            ("q / Ctrl-C", "Quit"),
        ],
    ),
    (
        "Dashboard",
        &[
            ("s", "Start the stack"),
            ("x", "Stop all services"),
            ("r", "Restart all services"),
            ("u", "Pull images and recreate"),
            ("e", "Enable or disable Element"),
            ("o", "Open Element in a browser"),
        ],
    ),
    (
        "Bridges",
        &[
            ("j / k", "Move selection"),
            ("enter", "Enable or disable the bridge"),
            ("i", "Show login instructions"),
        ],
    ),
    (
        "Logs",
        &[
            ("p", "Pause or resume"),
            ("f", "Cycle service filter"),
            ("x", "Clear"),
            ("r", "Reconnect"),
        ],
    ),
    (
        "Settings",
        &[
            ("tab / shift-tab", "Next or previous field"),
            ("left / right", "Change connectivity mode"),
            ("space", "Toggle checkbox"),
            ("enter", "Save and regenerate configuration"),
        ],
    ),
];

pub fn draw_help(area: Rect, f: &mut Frame) {
    let mut lines = Vec::new();
    for (title, binds) in SECTIONS {
        lines.push(Line::from(Span::styled(
            *title,
            Style::default().add_modifier(Modifier::BOLD),
        )));
        for (keys, what) in binds.iter() {
            lines.push(Line::from(vec![
                Span::raw("  "),
                Span::styled(format!("{keys:<16}"), Style::default().fg(Color::Magenta)),
                Span::raw(*what),
            ]));
        }
        lines.push(Line::from(""));
    }
    lines.push(Line::from(vec![
        Span::raw("Press "),
        Span::styled("esc", Style::default().fg(Color::Magenta)),
        Span::raw(" to go back."),
    ]));
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
