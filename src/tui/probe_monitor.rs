//! TUI showing live probe progress

use crate::proxy::models::ProbeResult;
use crate::proxy::scheduler::ProbeEvent;
use crate::Result;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::collections::VecDeque;
use std::io;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Duration;

/// Maximum number of recent entries kept per list
const MAX_RECENT: usize = 100;

/// A failed probe as shown in the UI
#[derive(Debug, Clone)]
struct FailedProbe {
    label: String,
    reason: String,
}

/// Probe monitor application state
pub struct ProbeMonitorApp {
    events: UnboundedReceiver<ProbeEvent>,
    total: usize,
    checked: usize,
    /// Current window, one-based, and the number of windows
    window: Option<(usize, usize)>,
    recent_passed: VecDeque<ProbeResult>,
    recent_failed: VecDeque<FailedProbe>,
    passed_count: usize,
    failed_count: usize,
    /// Selected list (0 = passed, 1 = failed)
    selected_list: usize,
    list_state: ListState,
    status_message: String,
    is_complete: bool,
    should_quit: bool,
}

impl ProbeMonitorApp {
    /// Monitor `total` probes reported through `events`
    pub fn new(total: usize, events: UnboundedReceiver<ProbeEvent>) -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            events,
            total,
            checked: 0,
            window: None,
            recent_passed: VecDeque::new(),
            recent_failed: VecDeque::new(),
            passed_count: 0,
            failed_count: 0,
            selected_list: 0,
            list_state,
            status_message: "Starting probes... Press 'q' to quit.".to_string(),
            is_complete: false,
            should_quit: false,
        }
    }

    /// Run the TUI until the user quits
    pub async fn run(&mut self) -> Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.run_app(&mut terminal).await;

        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        )?;
        terminal.show_cursor()?;

        result
    }

    async fn run_app<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> Result<()> {
        loop {
            terminal.draw(|f| self.ui(f))?;

            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_input(key.code);
                        if self.should_quit {
                            break;
                        }
                    }
                }
            }

            self.drain_events();
            tokio::task::yield_now().await;
        }

        Ok(())
    }

    /// Apply every pending event without blocking
    fn drain_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.apply(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.is_complete {
                        self.is_complete = true;
                        self.status_message = format!(
                            "Complete! Probed: {} | Passed: {} | Failed: {} | Press 'q' to quit",
                            self.checked, self.passed_count, self.failed_count
                        );
                    }
                    break;
                }
            }
        }
    }

    fn apply(&mut self, event: ProbeEvent) {
        match event {
            ProbeEvent::WindowStarted { index, total } => {
                self.window = Some((index + 1, total));
            }
            ProbeEvent::Passed(result) => {
                self.checked += 1;
                self.passed_count += 1;
                self.recent_passed.push_back(result);
                if self.recent_passed.len() > MAX_RECENT {
                    self.recent_passed.pop_front();
                }
            }
            ProbeEvent::Failed { label, reason } => {
                self.checked += 1;
                self.failed_count += 1;
                self.recent_failed.push_back(FailedProbe { label, reason });
                if self.recent_failed.len() > MAX_RECENT {
                    self.recent_failed.pop_front();
                }
            }
        }

        let window = self
            .window
            .map(|(current, total)| format!(" | Window {}/{}", current, total))
            .unwrap_or_default();
        self.status_message = format!(
            "Probing... {}/{}{} | Passed: {} | Failed: {}",
            self.checked, self.total, window, self.passed_count, self.failed_count
        );
    }

    fn selected_len(&self) -> usize {
        if self.selected_list == 0 {
            self.recent_passed.len()
        } else {
            self.recent_failed.len()
        }
    }

    fn handle_input(&mut self, key: KeyCode) {
        match key {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_quit = true;
            }
            KeyCode::Tab => {
                self.selected_list = (self.selected_list + 1) % 2;
                self.list_state.select(Some(0));
            }
            KeyCode::Down => {
                let len = self.selected_len();
                let i = match self.list_state.selected() {
                    Some(i) if i + 1 < len => i + 1,
                    _ => 0,
                };
                self.list_state.select(Some(i));
            }
            KeyCode::Up => {
                let len = self.selected_len();
                let i = match self.list_state.selected() {
                    Some(0) | None => len.saturating_sub(1),
                    Some(i) => i - 1,
                };
                self.list_state.select(Some(i));
            }
            _ => {}
        }
    }

    fn ui(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3),
                Constraint::Length(3),
                Constraint::Min(0),
                Constraint::Length(3),
            ])
            .split(f.size());

        let title = Paragraph::new("Link Prober")
            .style(Style::default().fg(Color::Cyan))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(title, chunks[0]);

        let progress = if self.total > 0 {
            (self.checked as f64 / self.total as f64 * 100.0).min(100.0) as u16
        } else {
            0
        };
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Progress"))
            .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
            .percent(progress)
            .label(format!("{}/{} ({}%)", self.checked, self.total, progress));
        f.render_widget(gauge, chunks[1]);

        let list_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(chunks[2]);

        let passed: Vec<String> = self
            .recent_passed
            .iter()
            .rev()
            .map(|result| {
                let speed = result
                    .speed_mbps
                    .map(|s| format!(" {:.2}Mbps", s))
                    .unwrap_or_default();
                format!(
                    "{}ms{} {} {}",
                    result.latency, speed, result.country_code, result.name
                )
            })
            .collect();
        let failed: Vec<String> = self
            .recent_failed
            .iter()
            .rev()
            .map(|failure| format!("[{}] {}", failure.reason, failure.label))
            .collect();

        render_list(
            f,
            list_chunks[0],
            &format!("Passed ({})", self.passed_count),
            passed,
            Color::Green,
            (self.selected_list == 0).then_some(&mut self.list_state),
        );
        render_list(
            f,
            list_chunks[1],
            &format!("Failed ({})", self.failed_count),
            failed,
            Color::Red,
            (self.selected_list == 1).then_some(&mut self.list_state),
        );

        let status = Paragraph::new(self.status_message.clone())
            .style(if self.is_complete {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::Yellow)
            })
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).title("Status"));
        f.render_widget(status, chunks[3]);
    }
}

fn render_list(
    f: &mut Frame,
    area: Rect,
    title: &str,
    lines: Vec<String>,
    color: Color,
    list_state: Option<&mut ListState>,
) {
    let items: Vec<ListItem> = lines
        .into_iter()
        .map(|line| ListItem::new(line).style(Style::default().fg(color)))
        .collect();

    let border_style = if list_state.is_some() {
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(title.to_string())
                .border_style(border_style),
        )
        .highlight_style(Style::default().bg(Color::DarkGray))
        .highlight_symbol(">> ");

    match list_state {
        Some(state) => f.render_stateful_widget(list, area, state),
        None => f.render_widget(list, area),
    }
}
