//! Terminal dashboard for the sync server

use crate::config::ServerConfig;
use crate::metrics::{LogLevel, Metrics, ServerStatus};
use crate::network::{self, BoxError};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use loopsync_core::{StatusReport, SyncEngine};
use parking_lot::RwLock;
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Scrollbar, ScrollbarOrientation, ScrollbarState},
    Frame, Terminal,
};
use std::io::stdout;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Entries moved per PgUp/PgDn
const PAGE: usize = 10;

/// Footer key hints
const KEY_HINTS: &[(&str, &str)] = &[
    ("Q", "Quit"),
    ("↑↓", "Scroll"),
    ("PgUp/Dn", "Page"),
    ("Home/End", "Oldest/Newest"),
    ("A", "Follow"),
];

/// Which slice of the activity log is on screen.
///
/// `offset` counts entries back from the newest one. While following, the
/// view is pinned to the newest entry; otherwise it stays on the same
/// entries as new ones arrive.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LogView {
    offset: usize,
    follow: bool,
    seen: usize,
}

impl LogView {
    fn new() -> Self {
        Self {
            offset: 0,
            follow: true,
            seen: 0,
        }
    }

    /// Account for entries appended since the last frame
    fn sync(&mut self, total: usize) {
        if self.follow {
            self.offset = 0;
        } else if total > self.seen {
            self.offset += total - self.seen;
        }
        self.offset = self.offset.min(total.saturating_sub(1));
        self.seen = total;
    }

    fn handle_key(&mut self, code: KeyCode, total: usize) {
        let last = total.saturating_sub(1);
        match code {
            KeyCode::Up => self.offset = (self.offset + 1).min(last),
            KeyCode::PageUp => self.offset = (self.offset + PAGE).min(last),
            KeyCode::Home => self.offset = last,
            KeyCode::Down => self.offset = self.offset.saturating_sub(1),
            KeyCode::PageDown => self.offset = self.offset.saturating_sub(PAGE),
            KeyCode::End => self.offset = 0,
            KeyCode::Char('a') => {
                self.follow = !self.follow;
                if self.follow {
                    self.offset = 0;
                }
                return;
            }
            _ => return,
        }
        // Reaching the newest entry resumes following
        self.follow = self.offset == 0;
    }

    /// Indices (oldest first) of the entries that fit in `height` rows
    fn window(&self, total: usize, height: usize) -> std::ops::Range<usize> {
        let end = total.saturating_sub(self.offset);
        end.saturating_sub(height)..end
    }

    fn title(&self, total: usize) -> String {
        if self.follow {
            " Activity Log [FOLLOW] ".to_string()
        } else {
            format!(" Activity Log [{}/{}] ", total - self.offset.min(total), total)
        }
    }
}

/// Run the dashboard
pub async fn run(
    config: ServerConfig,
    engine: Arc<SyncEngine>,
    metrics: Arc<RwLock<Metrics>>,
) -> Result<(), BoxError> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Start network in background
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let metrics_for_network = Arc::clone(&metrics);
    let engine_for_network = Arc::clone(&engine);
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = network::run(config, engine_for_network, Arc::clone(&metrics_for_network), shutdown).await {
            metrics_for_network
                .write()
                .log(LogLevel::Error, format!("Network error: {}", e));
        }
    });

    let mut view = LogView::new();
    let tick_rate = Duration::from_millis(100);

    loop {
        view.sync(metrics.read().logs.len());
        terminal.draw(|f| draw(f, &metrics, &engine, &view))?;

        if !event::poll(tick_rate)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => break,
            code => view.handle_key(code, metrics.read().logs.len()),
        }
    }

    // Cleanup
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    let _ = shutdown_tx.send(());
    let _ = server.await;

    Ok(())
}

/// Draw the dashboard
fn draw(f: &mut Frame, metrics: &Arc<RwLock<Metrics>>, engine: &SyncEngine, view: &LogView) {
    let m = metrics.read();
    let status = engine.status();

    // Main layout
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),  // Header
            Constraint::Length(6),  // Stats
            Constraint::Min(10),    // Logs
            Constraint::Length(1),  // Footer
        ])
        .split(f.area());

    // Header
    draw_header(f, chunks[0], &m);

    // Stats
    draw_stats(f, chunks[1], &m, &status);

    // Logs
    draw_logs(f, chunks[2], &m, view);

    // Footer
    draw_footer(f, chunks[3], view);
}

fn draw_header(f: &mut Frame, area: Rect, m: &Metrics) {
    let status_style = match m.status {
        ServerStatus::Starting => Style::default().fg(Color::Yellow),
        ServerStatus::Running => Style::default().fg(Color::Green),
        ServerStatus::Error => Style::default().fg(Color::Red),
    };

    let status_text = match m.status {
        ServerStatus::Starting => "STARTING",
        ServerStatus::Running => "RUNNING",
        ServerStatus::Error => "ERROR",
    };

    let title = vec![
        Line::from(vec![
            Span::styled("LoopSync Server", Style::default().add_modifier(Modifier::BOLD)),
            Span::raw("  │  Status: "),
            Span::styled(status_text, status_style),
            Span::raw("  │  Uptime: "),
            Span::styled(m.uptime(), Style::default().fg(Color::Cyan)),
        ])
    ];

    let header = Paragraph::new(title)
        .block(Block::default().borders(Borders::ALL).title(" Dashboard "));

    f.render_widget(header, area);
}

fn draw_stats(f: &mut Frame, area: Rect, m: &Metrics, status: &StatusReport) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(33),
            Constraint::Percentage(34),
            Constraint::Percentage(33),
        ])
        .split(area);

    // Server Info
    let listen = m.listen_addr.clone().unwrap_or_else(|| "binding...".to_string());

    let server_info = vec![
        Line::from(vec![
            Span::raw("Listen: "),
            Span::styled(listen, Style::default().fg(Color::Yellow)),
        ]),
        Line::from(vec![
            Span::raw("Origins: "),
            Span::styled(&m.allowed_origins, Style::default().fg(Color::Cyan)),
        ]),
    ];

    let server_block = Paragraph::new(server_info)
        .block(Block::default().borders(Borders::ALL).title(" Server "));
    f.render_widget(server_block, chunks[0]);

    // Viewers
    let viewer_info = vec![
        Line::from(vec![
            Span::raw("Active: "),
            Span::styled(
                m.active_viewers.to_string(),
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
            ),
        ]),
        Line::from(vec![
            Span::raw("Total: "),
            Span::styled(m.total_viewers.to_string(), Style::default().fg(Color::White)),
        ]),
        Line::from(vec![
            Span::raw("Peak: "),
            Span::styled(m.peak_viewers.to_string(), Style::default().fg(Color::Magenta)),
        ]),
        Line::from(match m.viewer_list.last() {
            Some(v) => vec![
                Span::raw("Latest: "),
                Span::styled(format!("{} {}", v.viewer_id, v.color), Style::default().fg(Color::Yellow)),
                Span::styled(
                    format!(" since {}", v.connected_at.format("%H:%M:%S")),
                    Style::default().fg(Color::DarkGray),
                ),
            ],
            None => vec![Span::styled("No viewers", Style::default().fg(Color::DarkGray))],
        }),
    ];

    let viewer_block = Paragraph::new(viewer_info)
        .block(Block::default().borders(Borders::ALL).title(" Viewers "));
    f.render_widget(viewer_block, chunks[1]);

    // Loop
    let loop_info = vec![
        Line::from(vec![
            Span::raw("Position: "),
            Span::styled(
                format!("{:>6.2}s / {:.2}s", status.position, m.loop_duration_secs),
                Style::default().fg(Color::Cyan),
            ),
        ]),
        Line::from(vec![
            Span::raw("Loop: "),
            Span::styled(format!("#{}", status.loop_count), Style::default().fg(Color::Yellow)),
        ]),
        Line::from(vec![
            Span::raw("Activations: "),
            Span::styled(
                format!("{} ({} debounced)", m.activations_accepted, m.activations_debounced),
                Style::default().fg(Color::Green),
            ),
        ]),
    ];

    let loop_block = Paragraph::new(loop_info)
        .block(Block::default().borders(Borders::ALL).title(" Loop "));
    f.render_widget(loop_block, chunks[2]);
}

fn level_style(level: LogLevel) -> Style {
    let color = match level {
        LogLevel::Info => Color::Blue,
        LogLevel::Warning => Color::Yellow,
        LogLevel::Error => Color::Red,
        LogLevel::Connection => Color::Green,
        LogLevel::Activation => Color::Magenta,
    };
    Style::default().fg(color)
}

fn draw_logs(f: &mut Frame, area: Rect, m: &Metrics, view: &LogView) {
    let height = area.height.saturating_sub(2) as usize;
    let total = m.logs.len();
    let shown = view.window(total, height);

    // Oldest at the top, newest at the bottom
    let items: Vec<ListItem> = m
        .logs
        .range(shown.clone())
        .map(|entry| {
            ListItem::new(Line::from(vec![
                Span::styled(
                    entry.timestamp.format("%H:%M:%S ").to_string(),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(format!("{:<5} ", entry.level.as_str()), level_style(entry.level)),
                Span::raw(entry.message.as_str()),
            ]))
        })
        .collect();

    let list = List::new(items).block(Block::default().borders(Borders::ALL).title(view.title(total)));
    f.render_widget(list, area);

    if total > height {
        let mut scrollbar_state = ScrollbarState::new(total.saturating_sub(height)).position(shown.start);
        f.render_stateful_widget(
            Scrollbar::new(ScrollbarOrientation::VerticalRight),
            area.inner(ratatui::layout::Margin { vertical: 1, horizontal: 0 }),
            &mut scrollbar_state,
        );
    }
}

fn draw_footer(f: &mut Frame, area: Rect, view: &LogView) {
    let key_style = Style::default().fg(Color::Black).bg(Color::White);
    let mut spans: Vec<Span> = KEY_HINTS
        .iter()
        .flat_map(|(key, action)| {
            [
                Span::styled(format!(" {} ", key), key_style),
                Span::raw(format!(" {}  ", action)),
            ]
        })
        .collect();
    spans.push(if view.follow {
        Span::styled("following", Style::default().fg(Color::Green))
    } else {
        Span::styled("paused", Style::default().fg(Color::Yellow))
    });

    f.render_widget(Paragraph::new(Line::from(spans)), area);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_follow_pins_newest() {
        let mut view = LogView::new();
        view.sync(30);
        assert_eq!(view.window(30, 10), 20..30);
        view.sync(35);
        assert_eq!(view.window(35, 10), 25..35);
    }

    #[test]
    fn test_scrolled_view_stays_on_same_entries() {
        let mut view = LogView::new();
        view.sync(30);
        view.handle_key(KeyCode::PageUp, 30);
        assert!(!view.follow);
        assert_eq!(view.window(30, 10), 10..20);

        view.sync(33);
        assert_eq!(view.window(33, 10), 10..20);
        assert_eq!(view.title(33), " Activity Log [20/33] ");
    }

    #[test]
    fn test_scroll_bounds_and_resume() {
        let mut view = LogView::new();
        view.sync(5);
        view.handle_key(KeyCode::Home, 5);
        assert_eq!(view.offset, 4);
        view.handle_key(KeyCode::Up, 5);
        assert_eq!(view.offset, 4);

        view.handle_key(KeyCode::PageDown, 5);
        assert_eq!(view.offset, 0);
        assert!(view.follow);

        view.handle_key(KeyCode::Char('a'), 5);
        assert!(!view.follow);
        view.handle_key(KeyCode::Char('a'), 5);
        assert!(view.follow);
    }

    #[test]
    fn test_empty_log() {
        let mut view = LogView::new();
        view.handle_key(KeyCode::Up, 0);
        view.sync(0);
        assert_eq!(view.window(0, 10), 0..0);
        assert_eq!(view.offset, 0);
    }
}
