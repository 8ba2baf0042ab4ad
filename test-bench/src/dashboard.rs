//! Terminal dashboard: one card per unit plus the Flash All control.
//!
//! [`DashboardState`] is the whole view model. It is fed [`BatchEvent`]s and
//! knows nothing about the terminal; [`run_dashboard`] owns the terminal,
//! draws the state and turns key presses into batch runs.
//!
//! Keys: `f` runs the batch (only while no unit is busy and no batch is in
//! flight), `q`/`Esc` quits once the station is idle, `Ctrl-C` quits
//! unconditionally.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Paragraph, Wrap};
use ratatui::Frame;
use tracing::{error, Level};

use crate::orchestrator::{BatchError, BatchEvent, BatchOrchestrator, BatchSummary, Workflow};
use crate::presentation::{card_style, flash_all_enabled, Rgb, FLASH_ALL_LABEL};
use crate::unit::{UnitRecord, UnitState};
use crate::unit_log::UnitLog;

/// Minimum card width before the grid drops a column.
const CARD_WIDTH: u16 = 40;

const EVENT_POLL: Duration = Duration::from_millis(100);

/// What one unit card shows.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitCard {
    pub label: String,
    pub serial: String,
    pub state: UnitState,
    pub log: UnitLog,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DashboardState {
    pub cards: Vec<UnitCard>,
    /// A batch has been started and its `Finished` event not yet seen.
    pub running: bool,
    pub status: String,
}

impl DashboardState {
    pub fn new(units: &[UnitRecord]) -> Self {
        Self {
            cards: units
                .iter()
                .map(|unit| UnitCard {
                    label: unit.label(),
                    serial: unit.identity.serial.clone(),
                    state: unit.state,
                    log: UnitLog::default(),
                })
                .collect(),
            running: false,
            status: format!("{} units configured", units.len()),
        }
    }

    pub fn apply(&mut self, event: &BatchEvent) {
        match event {
            BatchEvent::UnitState { slot, state } => {
                if let Some(card) = self.cards.get_mut(*slot) {
                    card.state = *state;
                }
            }
            BatchEvent::Log { slot, level, line } => {
                if let Some(card) = self.cards.get_mut(*slot) {
                    card.log.push(*level, line);
                }
            }
            BatchEvent::Finished(summary) => {
                self.running = false;
                self.status = summary_line(summary);
            }
        }
    }

    pub fn flash_all_enabled(&self) -> bool {
        !self.running && flash_all_enabled(self.cards.iter().map(|card| card.state))
    }

    /// Mark a batch as started and clear the previous run's logs.
    pub fn start_batch(&mut self) {
        self.running = true;
        self.status = "Running 运行中...".to_string();
        for card in &mut self.cards {
            card.log.clear();
        }
    }
}

fn summary_line(summary: &BatchSummary) -> String {
    let mut line = format!(
        "Done in {:.0}s: {} passed, {} failed",
        summary.elapsed.as_secs_f64(),
        summary.succeeded(),
        summary.failed()
    );
    if summary.any_adc_failure {
        line.push_str(" - CHECK POWER SUPPLY 检查电源");
    }
    line
}

fn color(rgb: Rgb) -> Color {
    Color::Rgb(rgb.0, rgb.1, rgb.2)
}

fn render(frame: &mut Frame, state: &DashboardState) {
    let [header, body] = Layout::vertical([Constraint::Length(3), Constraint::Min(0)])
        .areas(frame.area());

    let control_style = if state.flash_all_enabled() {
        Style::new().add_modifier(Modifier::BOLD)
    } else {
        Style::new().fg(Color::DarkGray)
    };
    let controls = Line::from(vec![
        Span::styled(format!("[f] {FLASH_ALL_LABEL}"), control_style),
        Span::raw("   [q] Quit   "),
        Span::raw(state.status.as_str()),
    ]);
    frame.render_widget(
        Paragraph::new(controls).block(Block::bordered().title(" OtO Station ")),
        header,
    );

    if state.cards.is_empty() {
        frame.render_widget(
            Paragraph::new("No flasher boards configured. Run `oto_station configure --save`."),
            body,
        );
        return;
    }
    for (card, area) in state.cards.iter().zip(card_areas(body, state.cards.len())) {
        render_card(frame, card, area);
    }
}

fn card_areas(area: Rect, count: usize) -> Vec<Rect> {
    let columns = usize::from((area.width / CARD_WIDTH).max(1)).min(count);
    let rows = count.div_ceil(columns);

    let row_areas = Layout::vertical(vec![Constraint::Ratio(1, rows as u32); rows]).split(area);
    row_areas
        .iter()
        .flat_map(|row| {
            Layout::horizontal(vec![Constraint::Ratio(1, columns as u32); columns])
                .split(*row)
                .to_vec()
        })
        .take(count)
        .collect()
}

fn render_card(frame: &mut Frame, card: &UnitCard, area: Rect) {
    let style = card_style(card.state);
    let base = Style::new().bg(color(style.color)).fg(Color::Black);

    let mut lines: Vec<Line> = style
        .label
        .lines()
        .map(|text| Line::styled(text.to_string(), base.add_modifier(Modifier::BOLD)))
        .collect();
    let log_rows = usize::from(area.height.saturating_sub(2)).saturating_sub(lines.len());
    lines.extend(card.log.tail(log_rows).map(|line| {
        let style = match line.level {
            Level::ERROR => base.add_modifier(Modifier::BOLD),
            Level::WARN => base.add_modifier(Modifier::ITALIC),
            _ => base,
        };
        Line::styled(line.text.clone(), style)
    }));

    let block = Block::bordered()
        .title(format!(" {} {} ", card.label, card.serial))
        .style(base);
    frame.render_widget(
        Paragraph::new(lines).block(block).wrap(Wrap { trim: false }),
        area,
    );
}

/// Run the dashboard until the operator quits.
///
/// `events` must be the receiving end of the channel `orchestrator` publishes
/// to.
pub fn run_dashboard(
    orchestrator: Arc<BatchOrchestrator>,
    workflow: Workflow,
    events: Receiver<BatchEvent>,
) -> io::Result<()> {
    let mut state = DashboardState::new(&orchestrator.units_snapshot());
    let mut terminal = ratatui::init();
    let result = dashboard_loop(&mut terminal, &mut state, &orchestrator, &workflow, &events);
    ratatui::restore();
    result
}

fn dashboard_loop(
    terminal: &mut ratatui::DefaultTerminal,
    state: &mut DashboardState,
    orchestrator: &Arc<BatchOrchestrator>,
    workflow: &Workflow,
    events: &Receiver<BatchEvent>,
) -> io::Result<()> {
    loop {
        for event in events.try_iter() {
            state.apply(&event);
        }
        terminal.draw(|frame| render(frame, state))?;

        if !event::poll(EVENT_POLL)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return Ok(()),
            KeyCode::Char('q') | KeyCode::Esc => {
                if state.running {
                    state.status = "Batch running, wait for it to finish (Ctrl-C to abort)".to_string();
                } else {
                    return Ok(());
                }
            }
            KeyCode::Char('f') if state.flash_all_enabled() => {
                state.start_batch();
                let orchestrator = Arc::clone(orchestrator);
                let workflow = workflow.clone();
                thread::Builder::new()
                    .name("batch".to_string())
                    .spawn(move || match orchestrator.run_all(&workflow) {
                        Ok(_) => {}
                        Err(BatchError::AlreadyRunning) => error!("Batch already running"),
                        Err(err) => error!("Batch failed: {err}"),
                    })?;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::UnitOutcome;
    use hardware::ports::UsbIdentity;

    fn state(count: usize) -> DashboardState {
        let units: Vec<_> = (0..count)
            .map(|slot| UnitRecord::new(slot, UsbIdentity::flasher(format!("S{slot}"))))
            .collect();
        DashboardState::new(&units)
    }

    #[test]
    fn test_events_update_cards() {
        let mut dash = state(2);
        dash.apply(&BatchEvent::UnitState {
            slot: 1,
            state: UnitState::Flashing,
        });
        dash.apply(&BatchEvent::Log {
            slot: 1,
            level: Level::INFO,
            line: "Started processing\n启动程序...".to_string(),
        });
        dash.apply(&BatchEvent::UnitState {
            slot: 7,
            state: UnitState::Flashing,
        });

        assert_eq!(dash.cards[0].state, UnitState::Idle);
        assert_eq!(dash.cards[1].state, UnitState::Flashing);
        assert_eq!(dash.cards[1].log.len(), 2);
        assert_eq!(dash.cards[1].label, "2");
        assert_eq!(dash.cards[1].serial, "S1");
    }

    #[test]
    fn test_flash_all_gating() {
        let mut dash = state(2);
        assert!(dash.flash_all_enabled());

        dash.start_batch();
        assert!(!dash.flash_all_enabled());

        dash.apply(&BatchEvent::UnitState {
            slot: 0,
            state: UnitState::Writing,
        });
        dash.apply(&BatchEvent::Finished(BatchSummary::default()));
        assert!(!dash.running);
        assert!(!dash.flash_all_enabled());

        dash.apply(&BatchEvent::UnitState {
            slot: 0,
            state: UnitState::CheckPower,
        });
        assert!(dash.flash_all_enabled());
    }

    #[test]
    fn test_summary_status() {
        let mut dash = state(1);
        dash.apply(&BatchEvent::Finished(BatchSummary {
            outcomes: vec![UnitOutcome {
                slot: 0,
                state: UnitState::CheckPower,
                error: None,
            }],
            any_adc_failure: true,
            elapsed: Duration::from_secs(42),
        }));
        assert_eq!(dash.status, "Done in 42s: 0 passed, 1 failed - CHECK POWER SUPPLY 检查电源");
    }

    #[test]
    fn test_card_grid() {
        let areas = card_areas(Rect::new(0, 0, 200, 40), 20);
        assert_eq!(areas.len(), 20);
        assert_eq!(areas[0].width, 40);
        assert_eq!(areas[5].y, areas[0].y + areas[0].height);

        let narrow = card_areas(Rect::new(0, 0, 30, 40), 3);
        assert_eq!(narrow.len(), 3);
        assert!(narrow.iter().all(|a| a.x == 0));
    }
}
