//! Terminal monitor for a Snapcast server
//!
//! Usage: `cargo run --example monitor -- <host> [port]`
//!
//! Set `RUST_LOG` to write a log to `monitor.log`.

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use snapcast_control::{
    Client, Endpoint, LifecycleEvent, LifecycleReceiver, Reconnector, Session, SessionPhase,
    StateEvent, StateReceiver, DEFAULT_CONTROL_PORT,
};
use std::io;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

const VOLUME_STEP: u8 = 5;

struct App {
    session: Session,
    selected_index: usize,
    status_message: String,
    lifecycle: LifecycleReceiver,
    updates: StateReceiver,
}

impl App {
    fn new(session: Session) -> Self {
        let lifecycle = session.subscribe_lifecycle();
        let updates = session.subscribe_state();
        Self {
            session,
            selected_index: 0,
            status_message: "Connecting...".to_string(),
            lifecycle,
            updates,
        }
    }

    fn clients(&self) -> Vec<Client> {
        self.session.snapshot().clients().cloned().collect()
    }

    fn selected_client(&self) -> Option<Client> {
        self.clients().into_iter().nth(self.selected_index)
    }

    fn select_next(&mut self) {
        let count = self.clients().len();
        if count > 0 {
            self.selected_index = (self.selected_index + 1) % count;
        }
    }

    fn select_previous(&mut self) {
        let count = self.clients().len();
        if count > 0 {
            self.selected_index = if self.selected_index == 0 {
                count - 1
            } else {
                self.selected_index - 1
            };
        }
    }

    async fn adjust_volume(&mut self, up: bool) {
        let Some(client) = self.selected_client() else {
            self.status_message = "No client selected".to_string();
            return;
        };

        let current = client.volume().percent;
        let percent = if up {
            current.saturating_add(VOLUME_STEP).min(100)
        } else {
            current.saturating_sub(VOLUME_STEP)
        };
        self.status_message = match self.session.set_volume(&client.id, percent).await {
            Ok(()) => format!("{}: {}%", client.visible_name(), percent),
            Err(e) => format!("Failed to set volume: {}", e),
        };
    }

    async fn toggle_mute(&mut self) {
        let Some(client) = self.selected_client() else {
            self.status_message = "No client selected".to_string();
            return;
        };

        let muted = !client.volume().muted;
        self.status_message = match self.session.set_mute(&client.id, muted).await {
            Ok(()) => format!("{}: mute {}", client.visible_name(), if muted { "ON" } else { "OFF" }),
            Err(e) => format!("Failed to set mute: {}", e),
        };
    }

    async fn refresh(&mut self) {
        self.status_message = match self.session.get_status().await {
            Ok(status) => format!("Refreshed, {} clients", status.clients().count()),
            Err(e) => format!("Refresh failed: {}", e),
        };
    }

    fn handle_events(&mut self) {
        while let Ok(Some(event)) = self.lifecycle.try_recv() {
            self.status_message = match event {
                LifecycleEvent::Connecting(endpoint) => format!("Connecting to {}...", endpoint),
                LifecycleEvent::Connected(endpoint) => {
                    format!("Connected to {}. j/k select, +/- volume, m mute, r refresh, q quit", endpoint)
                }
                LifecycleEvent::Disconnected { endpoint, reason } => {
                    format!("Disconnected from {}: {}", endpoint, reason)
                }
            };
        }

        while let Ok(Some(event)) = self.updates.try_recv() {
            if let StateEvent::ClientChanged { client, kind } = event {
                self.status_message = format!("{} {:?}", client.visible_name(), kind);
            }
        }

        let count = self.clients().len();
        if self.selected_index >= count {
            self.selected_index = count.saturating_sub(1);
        }
    }
}

fn ui(f: &mut Frame, app: &App) {
    let outer_chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([Constraint::Min(0), Constraint::Length(3)])
        .split(f.size());

    let inner_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(outer_chunks[0]);

    render_clients(f, app, inner_chunks[0]);
    render_groups(f, app, inner_chunks[1]);
    render_status(f, app, outer_chunks[1]);
}

fn render_clients(f: &mut Frame, app: &App, area: Rect) {
    let stale = if app.session.snapshot().stale { " (stale)" } else { "" };
    let block = Block::default()
        .title(format!(" Clients{} ", stale))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let clients = app.clients();
    if clients.is_empty() {
        let text = Paragraph::new("No clients yet.")
            .block(block)
            .wrap(Wrap { trim: true });
        f.render_widget(text, area);
        return;
    }

    let items: Vec<ListItem> = clients
        .iter()
        .map(|client| {
            let volume = client.volume();
            let state_style = if client.connected {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::DarkGray)
            };
            ListItem::new(vec![
                Line::from(vec![
                    Span::styled(if client.connected { "● " } else { "○ " }, state_style),
                    Span::raw(client.visible_name().to_string()),
                ]),
                Line::from(vec![
                    Span::styled("  Volume: ", Style::default().fg(Color::Yellow)),
                    Span::raw(format!(
                        "{}%{}",
                        volume.percent,
                        if volume.muted { " (muted)" } else { "" }
                    )),
                    Span::styled("  Latency: ", Style::default().fg(Color::Yellow)),
                    Span::raw(format!("{} ms", client.config.latency)),
                ]),
            ])
        })
        .collect();

    let mut state = ListState::default();
    state.select(Some(app.selected_index));

    let list = List::new(items)
        .block(block)
        .highlight_style(
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol(">> ");

    f.render_stateful_widget(list, area, &mut state);
}

fn render_groups(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(" Groups & Streams ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let status = app.session.snapshot();
    let mut lines = Vec::new();
    for group in &status.groups {
        let stream = status
            .stream(&group.stream_id)
            .map(|s| format!("{} [{:?}]", s.name(), s.status))
            .unwrap_or_else(|| group.stream_id.clone());
        let name = if group.name.is_empty() { &group.id } else { &group.name };
        lines.push(Line::from(vec![
            Span::styled(format!("{} ", name), Style::default().fg(Color::Yellow)),
            Span::raw(format!("-> {}{}", stream, if group.muted { " (muted)" } else { "" })),
        ]));
        for client in group.clients.iter().filter(|c| !c.deleted) {
            lines.push(Line::from(format!("    {}", client.visible_name())));
        }
    }

    let text = Paragraph::new(lines).block(block).wrap(Wrap { trim: false });
    f.render_widget(text, area);
}

fn render_status(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(" Status ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Gray));

    let text = Paragraph::new(app.status_message.clone())
        .block(block)
        .wrap(Wrap { trim: true });

    f.render_widget(text, area);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let Some(host) = args.next() else {
        eprintln!("usage: monitor <host> [port]");
        std::process::exit(2);
    };
    let port = match args.next() {
        Some(port) => port.parse()?,
        None => DEFAULT_CONTROL_PORT,
    };

    // the terminal belongs to the UI, so logs go to a file
    if std::env::var_os("RUST_LOG").is_some() {
        let file = std::fs::File::create("monitor.log")?;
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .init();
    }

    let session = Session::default();
    let mut app = App::new(session.clone());
    let mut reconnector = Reconnector::new(session, Endpoint::new(host, port));
    reconnector.start();

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Main loop
    let res = run_app(&mut terminal, &mut app).await;

    reconnector.stop().await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("Error: {}", err);
    }

    Ok(())
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        app.handle_events();
        terminal.draw(|f| ui(f, app))?;

        // Handle input events (non-blocking)
        if event::poll(std::time::Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                let connected = app.session.phase().await == SessionPhase::Connected;
                match key.code {
                    KeyCode::Char('q') => return Ok(()),
                    KeyCode::Char('j') | KeyCode::Down => app.select_next(),
                    KeyCode::Char('k') | KeyCode::Up => app.select_previous(),
                    KeyCode::Char('+') | KeyCode::Char('=') if connected => {
                        app.adjust_volume(true).await
                    }
                    KeyCode::Char('-') | KeyCode::Char('_') if connected => {
                        app.adjust_volume(false).await
                    }
                    KeyCode::Char('m') if connected => app.toggle_mute().await,
                    KeyCode::Char('r') if connected => app.refresh().await,
                    _ => {}
                }
            }
        }
    }
}
