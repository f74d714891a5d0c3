use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout},
    style::{Color, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph},
    Frame, Terminal,
};
use std::{
    collections::VecDeque,
    error::Error,
    io,
    sync::mpsc::Receiver,
    time::{Duration, Instant},
};

use mazerig::{experiment::Experiment, frame_source::Received, trial::Summary};

/// Points of the trace kept on screen.
const TRAIL_LEN: usize = 2000;

struct App {
    experiment: Experiment,
    feed: Receiver<Received>,
    trail: VecDeque<(f64, f64)>,
    frames: u64,
}

impl App {
    fn new(experiment: Experiment, feed: Receiver<Received>) -> App {
        App {
            experiment,
            feed,
            trail: VecDeque::with_capacity(TRAIL_LEN),
            frames: 0,
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        while let Ok(received) = self.feed.try_recv() {
            let before = self.experiment.subject().trial.trial_number;
            self.experiment.process_frame(received, now);
            self.frames += 1;
            // a new trial starts a new trace
            if self.experiment.subject().trial.trial_number != before {
                self.trail.clear();
            }
            let pose = self.experiment.subject().pose;
            if self.trail.len() == TRAIL_LEN {
                self.trail.pop_front();
            }
            self.trail.push_back((pose.x, pose.y));
        }
    }
}

pub fn engage_gui(
    experiment: Experiment,
    feed: Receiver<Received>,
) -> Result<Summary, Box<dyn Error>> {
    // setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // create app and run it
    let tick_rate = Duration::from_millis(50);
    let mut app = App::new(experiment, feed);
    let res = run_app(&mut terminal, &mut app, tick_rate);

    // restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("{:?}", err)
    }

    Ok(app.experiment.terminate(Instant::now()))
}

fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    tick_rate: Duration,
) -> io::Result<()> {
    let mut last_tick = Instant::now();
    loop {
        terminal.draw(|f| ui(f, app))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_secs(0));
        if crossterm::event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if let KeyCode::Char('q') = key.code {
                    return Ok(());
                }
            }
        }
        if last_tick.elapsed() >= tick_rate {
            app.on_tick();
            last_tick = Instant::now();
        }
    }
}

fn bounds(values: impl Iterator<Item = f64>, min_span: f64) -> [f64; 2] {
    let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !lo.is_finite() {
        return [-min_span / 2.0, min_span / 2.0];
    }
    let mid = (lo + hi) / 2.0;
    let half = ((hi - lo) / 2.0).max(min_span / 2.0) * 1.1;
    [mid - half, mid + half]
}

fn labels(bounds: [f64; 2]) -> Vec<Span<'static>> {
    let mid = (bounds[0] + bounds[1]) / 2.0;
    [bounds[0], mid, bounds[1]]
        .iter()
        .map(|v| Span::from(format!("{:.1}", v)))
        .collect()
}

fn ui(f: &mut Frame, app: &mut App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(10), Constraint::Length(4)])
        .split(f.size());

    let points: Vec<(f64, f64)> = app.trail.iter().copied().collect();
    let x_bounds = bounds(points.iter().map(|p| p.0), 10.0);
    let y_bounds = bounds(points.iter().map(|p| p.1), 10.0);

    let chart = Chart::new(vec![Dataset::default()
        .name("Path")
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(Color::Green))
        .data(&points)])
    .block(
        Block::default()
            .title(" Trackball path ")
            .borders(Borders::ALL),
    )
    .x_axis(
        Axis::default()
            .title(Span::styled("Lateral", Style::default().fg(Color::Green)))
            .style(Style::default().fg(Color::White))
            .bounds(x_bounds)
            .labels(labels(x_bounds)),
    )
    .y_axis(
        Axis::default()
            .title(Span::styled("Forward", Style::default().fg(Color::Green)))
            .style(Style::default().fg(Color::White))
            .bounds(y_bounds)
            .labels(labels(y_bounds)),
    );
    f.render_widget(chart, chunks[0]);

    let subject = app.experiment.subject();
    let text = vec![
        Line::from(format!(
            " x {:>8.2}  y {:>8.2}  heading {:>6.2}  frames {}",
            subject.pose.x, subject.pose.y, subject.pose.heading, app.frames
        )),
        Line::from(format!(
            " trials {}  rewards {}  falls {}   <q> quit",
            subject.trial.trial_number, subject.trial.num_rewards, subject.trial.fall_count
        )),
    ];
    let status = Paragraph::new(text).block(Block::default().borders(Borders::ALL));
    f.render_widget(status, chunks[1]);
}
