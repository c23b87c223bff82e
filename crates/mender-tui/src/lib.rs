mod app;
mod event;
mod input;
mod ui;

use std::sync::Arc;

use mender_core::config::AppConfig;
use mender_core::event::EventBus;
use mender_graph::RunnerHandle;

pub use app::parse_failure_form;

/// Launch the terminal UI against a spawned flow runner.
pub async fn run_tui(
    config: &AppConfig,
    runner: RunnerHandle,
    event_bus: Arc<EventBus>,
) -> anyhow::Result<()> {
    // Enter raw mode
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = std::io::stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;

    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    let mut terminal = ratatui::Terminal::new(backend)?;

    let result = app::run_app(&mut terminal, config, runner, event_bus).await;

    // Restore terminal
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;
    terminal.show_cursor()?;

    result
}
