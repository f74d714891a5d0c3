use std::{io::stdout, path::PathBuf, time::Duration};

use crate::config::SIMULATED_PORT;
use crate::gui::error::RigGuiError;
use crate::serial_reader::available_ports;

use crossterm::{
    event::{self, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
    Terminal,
};

/// One pickable entry: a serial device or the simulated trackball.
#[derive(Debug, Clone, PartialEq)]
struct Choice {
    port: String,
    label: String,
}

/// Rows offered to the user, and the row the cursor starts on.
///
/// The configured port is marked and preselected when it is plugged in.
/// The simulated trackball is always last so the monitor is usable with
/// no hardware attached.
fn choices(ports: &[PathBuf], configured: &str) -> (Vec<Choice>, usize) {
    let mut rows: Vec<Choice> = ports
        .iter()
        .map(|p| {
            let port = p.to_string_lossy().into_owned();
            let label = if port == configured {
                format!("{}  (configured)", port)
            } else {
                port.clone()
            };
            Choice { port, label }
        })
        .collect();
    rows.push(Choice {
        port: SIMULATED_PORT.to_owned(),
        label: "simulated trackball".to_owned(),
    });
    let start = rows.iter().position(|c| c.port == configured).unwrap_or(0);
    (rows, start)
}

/// Let the user pick the trackball's serial device.
///
/// Returns the port to open, which is [SIMULATED_PORT] for the simulated
/// trackball, or `None` if the user quit.
pub fn device_selector(configured: &str) -> Result<Option<String>, RigGuiError> {
    let ports = available_ports()?;
    let (mut rows, start) = choices(&ports, configured);
    let n_rows = rows.len();

    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let mut list_state = ListState::default().with_selected(Some(start));
    let mut picked = None;
    loop {
        let title = Title::from(Line::from(vec![
            " Trackball ".green().bold(),
            format!("({} serial) ", ports.len()).into(),
        ]));
        let keys = Title::from(Line::from(vec![
            " <Up>/<Down> ".green().bold(),
            "move ".into(),
            " <Enter> ".green().bold(),
            "open ".into(),
            " <Q> ".green().bold(),
            "quit ".into(),
        ]));
        let list = List::new(rows.iter().map(|c| c.label.as_str()))
            .highlight_symbol("> ")
            .highlight_style(Style::default().fg(Color::Black).bg(Color::Green))
            .block(
                Block::default()
                    .title(title.alignment(Alignment::Left))
                    .title(keys.alignment(Alignment::Right).position(Position::Bottom))
                    .borders(Borders::ALL),
            );
        terminal.draw(|frame| frame.render_stateful_widget(list, frame.size(), &mut list_state))?;

        if !event::poll(Duration::from_millis(16))? {
            continue;
        }
        let event::Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        let row = list_state.selected().unwrap_or(0);
        match key.code {
            KeyCode::Down | KeyCode::Char('j') => list_state.select(Some((row + 1) % n_rows)),
            KeyCode::Up | KeyCode::Char('k') => {
                list_state.select(Some((row + n_rows - 1) % n_rows))
            }
            KeyCode::Enter => {
                picked = Some(row);
                break;
            }
            KeyCode::Char('q') | KeyCode::Esc => break,
            _ => {}
        }
    }

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    Ok(picked.map(|i| rows.swap_remove(i).port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_port_is_marked_and_preselected() {
        let ports = [PathBuf::from("/dev/ttyUSB0"), PathBuf::from("/dev/ttyACM0")];
        let (rows, start) = choices(&ports, "/dev/ttyACM0");
        assert_eq!(start, 1);
        assert_eq!(rows[1].label, "/dev/ttyACM0  (configured)");
        assert_eq!(rows[0].label, "/dev/ttyUSB0");
        assert_eq!(rows.last().map(|c| c.port.as_str()), Some(SIMULATED_PORT));
    }

    #[test]
    fn simulation_is_offered_without_devices() {
        let (rows, start) = choices(&[], "/dev/ttyACM0");
        assert_eq!(start, 0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].port, SIMULATED_PORT);
    }
}
