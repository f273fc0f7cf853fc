//! Terminal user interface
//!
//! Transcript pane, roster sidebar, and an input bar. The UI consumes
//! [`UiCommand`]s from the event wiring and emits `InputSubmitted`
//! into the bus; it never touches sockets or the registry.

use std::io;
use std::sync::Arc;

use chrono::Local;
use crossterm::event::{self, Event as TermEvent, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout, Position};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, List, ListItem, Paragraph};
use ratatui::{Frame, Terminal};
use tokio::sync::mpsc;
use uuid::Uuid;

use confab_net::{Event, EventBus, User};

/// Oldest transcript entries are purged beyond this many
const TRANSCRIPT_CAP: usize = 500;

/// Rendering commands consumed by the UI task
#[derive(Debug)]
pub enum UiCommand {
    /// Append a user-authored message to the transcript
    User { user: User, text: String },
    /// Append an informational line to the transcript
    System { text: String },
    /// Replace the roster sidebar wholesale
    Roster {
        users: Vec<User>,
        self_id: Option<Uuid>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Focus {
    Transcript,
    Input,
}

struct TranscriptLine {
    stamp: String,
    text: String,
    color: Option<Color>,
}

/// The terminal UI state and loop
pub struct Ui {
    bus: Arc<EventBus>,
    commands: mpsc::UnboundedReceiver<UiCommand>,
    transcript: Vec<TranscriptLine>,
    roster: Vec<User>,
    self_id: Option<Uuid>,
    input: String,
    cursor: usize,
    scroll: usize,
    focus: Focus,
}

impl Ui {
    pub fn new(bus: Arc<EventBus>, commands: mpsc::UnboundedReceiver<UiCommand>) -> Self {
        Self {
            bus,
            commands,
            transcript: Vec::new(),
            roster: Vec::new(),
            self_id: None,
            input: String::new(),
            cursor: 0,
            scroll: 0,
            focus: Focus::Input,
        }
    }

    /// Take over the terminal and run until the user quits.
    pub async fn run(mut self) -> io::Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

        // Crossterm reads block, so they get a thread of their own.
        let (key_tx, mut key_rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            while let Ok(event) = event::read() {
                if key_tx.send(event).is_err() {
                    break;
                }
            }
        });

        let result = self.event_loop(&mut terminal, &mut key_rx).await;

        disable_raw_mode()?;
        execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
        terminal.show_cursor()?;
        result
    }

    async fn event_loop(
        &mut self,
        terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
        key_rx: &mut mpsc::UnboundedReceiver<TermEvent>,
    ) -> io::Result<()> {
        loop {
            terminal.draw(|frame| self.draw(frame))?;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => return Ok(()),
                },
                term_event = key_rx.recv() => match term_event {
                    Some(TermEvent::Key(key)) if key.kind == KeyEventKind::Press => {
                        if self.handle_key(key).await {
                            return Ok(());
                        }
                    }
                    Some(_) => {} // resize and friends redraw on the next pass
                    None => return Ok(()),
                },
            }
        }
    }

    fn apply(&mut self, command: UiCommand) {
        match command {
            UiCommand::User { user, text } => {
                let body = format!("{:>10}:  {}", user.username, text);
                self.append(body, Some(hex_color(&user.color)));
            }
            UiCommand::System { text } => self.append(text, None),
            UiCommand::Roster { users, self_id } => {
                self.roster = users;
                self.self_id = self_id;
            }
        }
    }

    fn append(&mut self, text: String, color: Option<Color>) {
        self.transcript.push(TranscriptLine {
            stamp: Local::now().format("%H:%M").to_string(),
            text,
            color,
        });
        if self.transcript.len() > TRANSCRIPT_CAP {
            let excess = self.transcript.len() - TRANSCRIPT_CAP;
            self.transcript.drain(..excess);
        }
        // Follow the newest message unless the user is reading history
        if self.focus != Focus::Transcript {
            self.scroll = 0;
        }
    }

    /// Returns true when the user asked to quit.
    async fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.modifiers.contains(KeyModifiers::CONTROL)
            && matches!(key.code, KeyCode::Char('c') | KeyCode::Char('q'))
        {
            return true;
        }

        match key.code {
            KeyCode::Tab | KeyCode::BackTab => {
                self.focus = match self.focus {
                    Focus::Transcript => Focus::Input,
                    Focus::Input => Focus::Transcript,
                };
            }
            _ => match self.focus {
                Focus::Transcript => self.handle_scroll_key(key.code),
                Focus::Input => self.handle_input_key(key.code).await,
            },
        }
        false
    }

    fn handle_scroll_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Up => self.scroll += 1,
            KeyCode::Down => self.scroll = self.scroll.saturating_sub(1),
            KeyCode::PageUp => self.scroll += 10,
            KeyCode::PageDown => self.scroll = self.scroll.saturating_sub(10),
            KeyCode::End => self.scroll = 0,
            _ => {}
        }
    }

    async fn handle_input_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Char(c) => {
                let at = byte_index(&self.input, self.cursor);
                self.input.insert(at, c);
                self.cursor += 1;
            }
            KeyCode::Backspace => {
                if self.cursor > 0 {
                    self.cursor -= 1;
                    let at = byte_index(&self.input, self.cursor);
                    self.input.remove(at);
                }
            }
            KeyCode::Delete => {
                if self.cursor < self.input.chars().count() {
                    let at = byte_index(&self.input, self.cursor);
                    self.input.remove(at);
                }
            }
            KeyCode::Left => self.cursor = self.cursor.saturating_sub(1),
            KeyCode::Right => {
                self.cursor = (self.cursor + 1).min(self.input.chars().count());
            }
            KeyCode::Home => self.cursor = 0,
            KeyCode::End => self.cursor = self.input.chars().count(),
            KeyCode::Enter => {
                let text = std::mem::take(&mut self.input).trim().to_string();
                self.cursor = 0;
                if !text.is_empty() {
                    self.bus.publish(Event::InputSubmitted { text }).await;
                }
            }
            _ => {}
        }
    }

    fn draw(&self, frame: &mut Frame) {
        let [main, input_area] =
            Layout::vertical([Constraint::Min(1), Constraint::Length(3)]).areas(frame.area());
        let [transcript_area, roster_area] =
            Layout::horizontal([Constraint::Min(20), Constraint::Length(24)]).areas(main);

        self.draw_transcript(frame, transcript_area);
        self.draw_roster(frame, roster_area);
        self.draw_input(frame, input_area);
    }

    fn draw_transcript(&self, frame: &mut Frame, area: ratatui::layout::Rect) {
        let width = area.width.saturating_sub(2) as usize;
        let height = area.height.saturating_sub(2) as usize;

        let mut lines: Vec<Line> = Vec::new();
        for entry in &self.transcript {
            let style = match entry.color {
                Some(color) => Style::default().fg(color),
                None => Style::default().add_modifier(Modifier::DIM),
            };
            let full = format!("{} {}", entry.stamp, entry.text);
            for chunk in wrap(&full, width) {
                lines.push(Line::styled(chunk, style));
            }
        }

        let max_scroll = lines.len().saturating_sub(height);
        let scroll = self.scroll.min(max_scroll);
        let end = lines.len() - scroll;
        let start = end.saturating_sub(height);
        let visible = lines[start..end].to_vec();

        let block = self.pane_block("confab", self.focus == Focus::Transcript);
        frame.render_widget(Paragraph::new(Text::from(visible)).block(block), area);
    }

    fn draw_roster(&self, frame: &mut Frame, area: ratatui::layout::Rect) {
        let items: Vec<ListItem> = self
            .roster
            .iter()
            .map(|user| {
                let mut name = user.username.clone();
                if Some(user.uid) == self.self_id {
                    name.push_str(" (you)");
                }
                ListItem::new(Line::styled(
                    name,
                    Style::default().fg(hex_color(&user.color)),
                ))
            })
            .collect();

        let block = self.pane_block("users", false);
        frame.render_widget(List::new(items).block(block), area);
    }

    fn draw_input(&self, frame: &mut Frame, area: ratatui::layout::Rect) {
        let width = area.width.saturating_sub(2) as usize;

        // Keep the cursor visible when the line outgrows the pane
        let offset = self.cursor.saturating_sub(width.saturating_sub(1));
        let visible: String = self.input.chars().skip(offset).take(width).collect();

        let block = self.pane_block("message", self.focus == Focus::Input);
        frame.render_widget(
            Paragraph::new(Span::raw(visible)).block(block),
            area,
        );

        if self.focus == Focus::Input {
            let x = area.x + 1 + (self.cursor - offset) as u16;
            let y = area.y + 1;
            frame.set_cursor_position(Position::new(x, y));
        }
    }

    fn pane_block(&self, title: &'static str, focused: bool) -> Block<'static> {
        let block = Block::bordered().title(title);
        if focused {
            block.border_style(Style::default().fg(Color::LightBlue))
        } else {
            block
        }
    }
}

/// Best-effort terminal restore for abnormal exit paths.
pub fn restore_terminal() {
    let _ = disable_raw_mode();
    let _ = execute!(io::stdout(), LeaveAlternateScreen);
}

/// Byte offset of the `cursor`-th character.
fn byte_index(s: &str, cursor: usize) -> usize {
    s.char_indices()
        .nth(cursor)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

/// Hard-wrap text to `width` characters, honoring embedded newlines.
fn wrap(text: &str, width: usize) -> Vec<String> {
    if width == 0 {
        return vec![text.to_string()];
    }

    let mut lines = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for ch in text.chars() {
        if ch == '\n' {
            lines.push(std::mem::take(&mut current));
            count = 0;
            continue;
        }
        if count == width {
            lines.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(ch);
        count += 1;
    }
    lines.push(current);
    lines
}

/// Parse a normalized 6-hex-digit color into a terminal RGB color.
fn hex_color(hex: &str) -> Color {
    if hex.len() != 6 || !hex.is_ascii() {
        return Color::Reset;
    }
    let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).unwrap_or(0);
    Color::Rgb(channel(0..2), channel(2..4), channel(4..6))
}
