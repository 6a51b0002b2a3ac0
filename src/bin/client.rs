use std::io;
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures::{SinkExt, StreamExt};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph},
    Frame, Terminal,
};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use relay::Message;

// ─── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "client", about = "Terminal client for the broadcast relay")]
struct Args {
    #[arg(long, env = "RELAY_URL", default_value = "ws://localhost:8080/ws")]
    addr: String,

    /// Type tag put on every message sent
    #[arg(long, default_value = "chat")]
    kind: String,
}

// ─── Simple one-line text input ───────────────────────────────────────────────

#[derive(Default, Clone)]
struct Input {
    value: String,
    cursor: usize,
}

impl Input {
    fn insert(&mut self, ch: char) {
        self.value.insert(self.cursor, ch);
        self.cursor += ch.len_utf8();
    }

    fn delete_back(&mut self) {
        if self.cursor == 0 {
            return;
        }
        let mut prev = self.cursor - 1;
        while prev > 0 && !self.value.is_char_boundary(prev) {
            prev -= 1;
        }
        self.value.drain(prev..self.cursor);
        self.cursor = prev;
    }

    fn take(&mut self) -> String {
        self.cursor = 0;
        std::mem::take(&mut self.value)
    }

    fn as_str(&self) -> &str {
        &self.value
    }
}

// ─── App state ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Entry {
    received: String,
    sender: String,
    kind: String,
    data: String,
    is_system: bool,
}

struct App {
    addr: String,
    kind: String,
    entries: Vec<Entry>,
    input: Input,
    scroll: usize, // lines from the bottom
    viewport_height: u16,
    connected: bool,
    quit: bool,
}

impl App {
    fn new(addr: String, kind: String) -> Self {
        Self {
            addr,
            kind,
            entries: Vec::new(),
            input: Input::default(),
            scroll: 0,
            viewport_height: 20,
            connected: true,
            quit: false,
        }
    }

    fn push(&mut self, msg: Message) {
        self.entries.push(Entry {
            received: Local::now().format("%H:%M:%S").to_string(),
            sender: msg.sender_id().to_string(),
            kind: msg.kind().to_string(),
            data: msg.data().to_string(),
            is_system: msg.is_system(),
        });
        // keep the view anchored while scrolled back
        if self.scroll > 0 {
            self.scroll += 1;
        }
    }

    fn scroll_up(&mut self) {
        let max = self.entries.len().saturating_sub(self.viewport_height as usize);
        self.scroll = (self.scroll + 3).min(max);
    }

    fn scroll_down(&mut self) {
        self.scroll = self.scroll.saturating_sub(3);
    }
}

enum NetMsg {
    Message(Message),
    Disconnected(String),
}

// ─── Main ────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (stream, _) = connect_async(args.addr.as_str()).await?;
    let (mut ws_tx, mut ws_rx) = stream.split();

    // Channel: server → UI
    let (net_tx, mut net_rx) = mpsc::channel::<NetMsg>(128);
    // Channel: UI → server writer
    let (write_tx, mut write_rx) = mpsc::channel::<String>(64);

    tokio::spawn(async move {
        loop {
            let reason = match ws_rx.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Ok(msg) = Message::decode(text.as_str()) {
                        if net_tx.send(NetMsg::Message(msg)).await.is_err() {
                            return;
                        }
                    }
                    continue;
                }
                Some(Ok(WsMessage::Close(_))) | None => "server closed the connection".to_string(),
                Some(Ok(_)) => continue,
                Some(Err(e)) => e.to_string(),
            };
            net_tx.send(NetMsg::Disconnected(reason)).await.ok();
            return;
        }
    });

    tokio::spawn(async move {
        while let Some(text) = write_rx.recv().await {
            if ws_tx.send(WsMessage::text(text)).await.is_err() {
                break;
            }
        }
        ws_tx.close().await.ok();
    });

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(args.addr, args.kind);
    let result = run_app(&mut terminal, &mut app, &mut net_rx, &write_tx).await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    net_rx: &mut mpsc::Receiver<NetMsg>,
    write_tx: &mpsc::Sender<String>,
) -> Result<()> {
    loop {
        let size = terminal.size()?;
        app.viewport_height = size.height.saturating_sub(5);
        terminal.draw(|f| draw(f, app))?;

        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(key) = event::read()? {
                handle_key(app, key, write_tx).await?;
            }
        }

        while let Ok(msg) = net_rx.try_recv() {
            match msg {
                NetMsg::Message(msg) => app.push(msg),
                NetMsg::Disconnected(reason) => {
                    app.connected = false;
                    app.push(Message::system("disconnected", reason));
                }
            }
        }

        if app.quit {
            break;
        }
    }
    Ok(())
}

async fn handle_key(app: &mut App, key: KeyEvent, write_tx: &mpsc::Sender<String>) -> Result<()> {
    match key.code {
        KeyCode::Char('c') | KeyCode::Char('q') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            app.quit = true;
        }
        KeyCode::PageUp => app.scroll_up(),
        KeyCode::PageDown => app.scroll_down(),
        KeyCode::Enter => {
            let data = app.input.take();
            if data.trim().is_empty() || !app.connected {
                return Ok(());
            }
            let text = Message::new(app.kind.as_str(), data).encode()?;
            write_tx.send(text).await.ok();
        }
        KeyCode::Backspace => app.input.delete_back(),
        KeyCode::Char(c) => app.input.insert(c),
        _ => {}
    }
    Ok(())
}

// ─── Drawing ─────────────────────────────────────────────────────────────────

fn draw(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1), // header
            Constraint::Min(3),    // messages
            Constraint::Length(3), // input
        ])
        .split(f.area());

    let status = if app.connected { "connected" } else { "offline" };
    let header = Paragraph::new(format!(
        " relay  │  {}  │  {}  │  type={}  │  PgUp/PgDn scroll  │  Ctrl+Q quit ",
        app.addr, status, app.kind
    ))
    .style(
        Style::default()
            .bg(Color::DarkGray)
            .fg(Color::White)
            .add_modifier(Modifier::BOLD),
    );
    f.render_widget(header, chunks[0]);

    let msg_block = Block::default()
        .borders(Borders::LEFT | Borders::RIGHT | Borders::TOP)
        .border_style(Style::default().fg(Color::DarkGray));
    let msg_inner = msg_block.inner(chunks[1]);
    f.render_widget(msg_block, chunks[1]);

    let height = msg_inner.height as usize;
    let end = app.entries.len().saturating_sub(app.scroll);
    let start = end.saturating_sub(height);

    let items: Vec<ListItem> = app.entries[start..end]
        .iter()
        .map(|line| {
            if line.is_system {
                ListItem::new(Line::from(vec![Span::styled(
                    format!("  ◆ [{}] {} {}", line.received, line.kind, line.data),
                    Style::default()
                        .fg(Color::DarkGray)
                        .add_modifier(Modifier::ITALIC),
                )]))
            } else {
                ListItem::new(Line::from(vec![
                    Span::styled(
                        format!("[{}] ", line.received),
                        Style::default().fg(Color::DarkGray),
                    ),
                    Span::styled(
                        format!("{} ", line.sender),
                        Style::default()
                            .fg(Color::Cyan)
                            .add_modifier(Modifier::BOLD),
                    ),
                    Span::styled(
                        format!("<{}> ", line.kind),
                        Style::default().fg(Color::Yellow),
                    ),
                    Span::raw(line.data.clone()),
                ]))
            }
        })
        .collect();
    f.render_widget(List::new(items), msg_inner);

    let input_block = Block::default()
        .title(" Message (Enter to send) ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));
    let input_inner = input_block.inner(chunks[2]);
    f.render_widget(input_block, chunks[2]);

    f.render_widget(
        Paragraph::new(app.input.as_str()).style(Style::default().fg(Color::White)),
        input_inner,
    );
    f.set_cursor_position((input_inner.x + app.input.cursor as u16, input_inner.y));
}
