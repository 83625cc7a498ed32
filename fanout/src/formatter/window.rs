use super::{Formatter, Output};
use crate::sig;
use color_eyre::Report;
use crossbeam_channel::{unbounded, Receiver, Sender};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::Frame;
use ratatui::Terminal;
use std::time::Duration;

enum UiMsg {
    Add(Output),
    Finish,
}

/// Interactive presenter: an event loop on a dedicated thread renders a
/// progress gauge, the host list and the selected host's output. `print`
/// pins the gauge to 100% and blocks until the operator quits; quitting
/// before the run completed triggers the supervised cleanup and ends the
/// process with a distinguished code.
pub struct WindowFormatter {
    tx: Sender<UiMsg>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl WindowFormatter {
    pub fn new(user: &str, hosts: Vec<String>) -> Self {
        let (tx, rx) = unbounded();
        let state = WindowState::new(user, hosts);
        let handle = std::thread::spawn(move || {
            if let Err(err) = ui_loop(state, rx) {
                eprintln!("{}", err);
            }
        });
        Self {
            tx,
            handle: Some(handle),
        }
    }
}

impl Formatter for WindowFormatter {
    fn add(&mut self, output: &Output) {
        let _ = self.tx.send(UiMsg::Add(output.clone()));
    }

    fn print(&mut self) {
        let _ = self.tx.send(UiMsg::Finish);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn restore_terminal() {
    let _ = disable_raw_mode();
    let _ = execute!(std::io::stdout(), LeaveAlternateScreen);
}

fn ui_loop(mut state: WindowState, rx: Receiver<UiMsg>) -> Result<(), Report> {
    enable_raw_mode()?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    sig::register(
        "window",
        0,
        Box::new(|| {
            restore_terminal();
            Ok(())
        }),
    );

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    loop {
        terminal.draw(|frame| state.render(frame))?;
        if event::poll(Duration::from_millis(50))? {
            match event::read()? {
                Event::Key(key) if key.kind != KeyEventKind::Release => {
                    if state.handle_key(key) == Action::Quit {
                        break;
                    }
                }
                _ => {}
            }
        }
        while let Ok(msg) = rx.try_recv() {
            match msg {
                UiMsg::Add(output) => state.push(output),
                UiMsg::Finish => state.finish(),
            }
        }
    }

    restore_terminal();
    sig::disable("window");
    if !state.finished {
        // the operator left while hosts were still running
        sig::abort(-1);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pane {
    Hosts,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingInput {
    None,
    /// A `g` waiting for its second `g`.
    Leader,
    Search(String),
    Goto(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    None,
    Quit,
}

/// The window's state machine, kept free of terminal handles so the key
/// grammar can be exercised directly.
struct WindowState {
    user: String,
    hosts: Vec<String>,
    outputs: Vec<Option<Output>>,
    statuses: Vec<HostStatus>,
    progress: f64,
    step: f64,
    selected: usize,
    output_scroll: usize,
    focus: Pane,
    pending: PendingInput,
    count_prefix: String,
    last_search: Option<String>,
    finished: bool,
    page: usize,
}

impl WindowState {
    fn new(user: &str, hosts: Vec<String>) -> Self {
        let count = hosts.len();
        Self {
            user: user.to_string(),
            outputs: vec![None; count],
            statuses: vec![HostStatus::Pending; count],
            hosts,
            progress: 0.0,
            step: if count == 0 { 0.0 } else { 100.0 / count as f64 },
            selected: 0,
            output_scroll: 0,
            focus: Pane::Hosts,
            pending: PendingInput::None,
            count_prefix: String::new(),
            last_search: None,
            finished: false,
            page: 0,
        }
    }

    fn push(&mut self, output: Output) {
        let index = output.index;
        if index >= self.hosts.len() {
            return;
        }
        self.statuses[index] = if output.exit_code == 0 {
            HostStatus::Success
        } else {
            HostStatus::Failed
        };
        self.outputs[index] = Some(output);
        self.progress = (self.progress + self.step).min(100.0);
        // selection stays where the operator put it
    }

    fn finish(&mut self) {
        self.progress = 100.0;
        self.finished = true;
    }

    fn take_count(&mut self) -> usize {
        let count = self.count_prefix.parse::<usize>().unwrap_or(1).max(1);
        self.count_prefix.clear();
        count.min(10_000)
    }

    fn repeat(&mut self, action: impl Fn(&mut Self)) {
        let count = self.take_count();
        for _ in 0..count {
            action(self);
        }
    }

    fn select(&mut self, index: usize) {
        if self.hosts.is_empty() {
            return;
        }
        self.selected = index.min(self.hosts.len() - 1);
        self.output_scroll = 0;
    }

    fn move_selection(&mut self, delta: isize) {
        let count = self.hosts.len();
        if count == 0 {
            return;
        }
        let next = (self.selected as isize + delta).rem_euclid(count as isize);
        self.select(next as usize);
    }

    fn output_lines(&self) -> usize {
        self.output_text().0.lines().count()
    }

    fn scroll_output(&mut self, delta: isize) {
        let lines = self.output_lines();
        if lines == 0 {
            self.output_scroll = 0;
            return;
        }
        let next = (self.output_scroll as isize + delta).rem_euclid(lines as isize);
        self.output_scroll = next as usize;
    }

    fn move_focused(&mut self, delta: isize) {
        match self.focus {
            Pane::Hosts => self.move_selection(delta),
            Pane::Output => self.scroll_output(delta),
        }
    }

    fn half_page(&mut self, down: bool) {
        let half = (self.page / 2).max(1) as isize;
        self.move_focused(if down { half } else { -half });
    }

    fn go_start(&mut self) {
        match self.focus {
            Pane::Hosts => self.select(0),
            Pane::Output => self.output_scroll = 0,
        }
    }

    fn go_end(&mut self) {
        match self.focus {
            Pane::Hosts => {
                if !self.hosts.is_empty() {
                    self.select(self.hosts.len() - 1);
                }
            }
            Pane::Output => {
                self.output_scroll = self.output_lines().saturating_sub(1);
            }
        }
    }

    /// Moves the selection to the next alias containing the last pattern,
    /// wrapping around; `forward` picks the scan direction.
    fn search(&mut self, forward: bool) {
        let Some(pattern) = self.last_search.clone() else {
            return;
        };
        let count = self.hosts.len();
        if count == 0 {
            return;
        }
        let step: isize = if forward { 1 } else { -1 };
        let mut position = self.selected as isize;
        for _ in 0..count {
            position = (position + step).rem_euclid(count as isize);
            if self.hosts[position as usize].contains(&pattern) {
                self.select(position as usize);
                return;
            }
        }
    }

    fn goto_line(&mut self, buf: &str) {
        if let Ok(line) = buf.parse::<usize>() {
            if line >= 1 {
                self.select(line - 1);
            }
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> Action {
        match std::mem::replace(&mut self.pending, PendingInput::None) {
            PendingInput::Search(mut buf) => {
                match key.code {
                    KeyCode::Esc => {}
                    KeyCode::Enter => {
                        if !buf.is_empty() {
                            self.last_search = Some(buf);
                            self.search(true);
                        }
                    }
                    KeyCode::Backspace => {
                        buf.pop();
                        self.pending = PendingInput::Search(buf);
                    }
                    KeyCode::Char(c) => {
                        buf.push(c);
                        self.pending = PendingInput::Search(buf);
                    }
                    _ => self.pending = PendingInput::Search(buf),
                }
                return Action::None;
            }
            PendingInput::Goto(mut buf) => {
                match key.code {
                    KeyCode::Esc => {}
                    KeyCode::Enter => self.goto_line(&buf),
                    KeyCode::Backspace => {
                        buf.pop();
                        self.pending = PendingInput::Goto(buf);
                    }
                    KeyCode::Char('q') if buf.is_empty() => return Action::Quit,
                    KeyCode::Char(c) if c.is_ascii_digit() => {
                        buf.push(c);
                        self.pending = PendingInput::Goto(buf);
                    }
                    _ => self.pending = PendingInput::Goto(buf),
                }
                return Action::None;
            }
            PendingInput::Leader => {
                if key.code == KeyCode::Char('g') {
                    self.go_start();
                }
                return Action::None;
            }
            PendingInput::None => {}
        }

        if key.modifiers.contains(KeyModifiers::CONTROL) {
            match key.code {
                KeyCode::Char('c') => return Action::Quit,
                KeyCode::Char('u') => self.repeat(|state| state.half_page(false)),
                KeyCode::Char('d') => self.repeat(|state| state.half_page(true)),
                KeyCode::Char('n') => self.repeat(|state| state.scroll_output(1)),
                KeyCode::Char('p') => self.repeat(|state| state.scroll_output(-1)),
                _ => {}
            }
            return Action::None;
        }

        match key.code {
            KeyCode::Char('q') => return Action::Quit,
            KeyCode::Char('h') => self.focus = Pane::Hosts,
            KeyCode::Char('l') => self.focus = Pane::Output,
            KeyCode::Char('j') => self.repeat(|state| state.move_focused(1)),
            KeyCode::Char('k') => self.repeat(|state| state.move_focused(-1)),
            KeyCode::Char('G') => self.repeat(|state| state.go_end()),
            KeyCode::Char('g') => self.pending = PendingInput::Leader,
            KeyCode::Char('/') => self.pending = PendingInput::Search(String::new()),
            KeyCode::Char(':') => self.pending = PendingInput::Goto(String::new()),
            KeyCode::Char('n') => self.repeat(|state| state.search(true)),
            KeyCode::Char('N') => self.repeat(|state| state.search(false)),
            KeyCode::Char(c @ '1'..='9') => self.count_prefix.push(c),
            KeyCode::Char('0') if !self.count_prefix.is_empty() => self.count_prefix.push('0'),
            KeyCode::Esc => self.count_prefix.clear(),
            _ => {}
        }
        Action::None
    }

    fn output_text(&self) -> (String, Style) {
        match self.outputs.get(self.selected).and_then(Option::as_ref) {
            Some(output) if !output.stdout.is_empty() => {
                (output.stdout.clone(), Style::default())
            }
            Some(output) if !output.stderr.is_empty() => {
                (output.stderr.clone(), Style::default().fg(Color::Red))
            }
            Some(output) if !output.error.is_empty() => (
                output.error.clone(),
                Style::default().fg(Color::Red).bg(Color::White),
            ),
            _ => (String::new(), Style::default()),
        }
    }

    fn help_line(&self) -> String {
        match &self.pending {
            PendingInput::Search(buf) => format!("/{}", buf),
            PendingInput::Goto(buf) => format!(":{}", buf),
            _ => {
                "q:QUIT  j/k:MOVE  h/l:FOCUS  C-u/C-d:HALF PAGE  gg/G:START/END  \
                 /:SEARCH n/N:NEXT/PREV  ::GOTO"
                    .to_string()
            }
        }
    }

    fn render(&mut self, frame: &mut Frame<'_>) {
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Min(3),
                Constraint::Length(3),
            ])
            .split(frame.area());
        let header = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Ratio(8, 12), Constraint::Ratio(4, 12)])
            .split(rows[0]);
        let main = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Ratio(6, 12), Constraint::Ratio(6, 12)])
            .split(rows[1]);
        self.page = main[0].height.saturating_sub(2) as usize;

        let border = Style::default().fg(Color::Cyan);
        let focused = Style::default().fg(Color::Yellow);

        let gauge = Gauge::default()
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title("PROGRESS")
                    .border_style(border),
            )
            .gauge_style(Style::default().fg(Color::Green))
            .percent(self.progress.min(100.0) as u16);
        frame.render_widget(gauge, header[0]);

        let info_style = if self.user == "root" {
            Style::default().fg(Color::Red)
        } else {
            Style::default().fg(Color::Green)
        };
        let info = Paragraph::new(format!("USER : {}", self.user))
            .style(info_style)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title("INFO")
                    .border_style(border),
            );
        frame.render_widget(info, header[1]);

        let digit_width = self.hosts.len().to_string().len();
        let items: Vec<ListItem<'_>> = self
            .hosts
            .iter()
            .enumerate()
            .map(|(index, alias)| {
                let style = match self.statuses[index] {
                    HostStatus::Pending => Style::default(),
                    HostStatus::Success => Style::default().fg(Color::Green),
                    HostStatus::Failed => Style::default().fg(Color::Red),
                };
                ListItem::new(format!(
                    "[{:>width$}] {}",
                    index + 1,
                    alias,
                    width = digit_width
                ))
                .style(style)
            })
            .collect();
        let hosts = List::new(items)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title("HOSTS")
                    .border_style(if self.focus == Pane::Hosts {
                        focused
                    } else {
                        border
                    }),
            )
            .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
            .highlight_symbol("-> ");
        let mut list_state = ListState::default();
        list_state.select(Some(self.selected));
        frame.render_stateful_widget(hosts, main[0], &mut list_state);

        let (text, style) = self.output_text();
        let output = Paragraph::new(text)
            .style(style)
            .wrap(Wrap { trim: false })
            .scroll((self.output_scroll as u16, 0))
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title("OUTPUT")
                    .border_style(if self.focus == Pane::Output {
                        focused
                    } else {
                        border
                    }),
            );
        frame.render_widget(output, main[1]);

        let help = Paragraph::new(self.help_line()).block(
            Block::default()
                .borders(Borders::ALL)
                .title("HELP")
                .border_style(border),
        );
        frame.render_widget(help, rows[2]);
    }
}
