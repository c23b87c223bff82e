use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::Frame;

use mender_core::types::{FailureStatus, NodeStatus};
use mender_graph::view::preview;
use mender_graph::NodeView;
use mender_monitor::{CenterView, Failure};

use crate::app::App;
use crate::input::Focus;

const SPINNER: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Draw the TUI layout.
pub fn draw(f: &mut Frame, app: &App) {
    let form_open = app.layout.is_submit_form_open();
    let mut constraints = vec![Constraint::Length(1), Constraint::Min(6)];
    if form_open {
        constraints.push(Constraint::Length(3));
    }
    constraints.push(Constraint::Length(3));
    constraints.push(Constraint::Length(1));

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(f.area());

    draw_status_bar(f, app, chunks[0]);

    let main = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(chunks[1]);
    draw_flow(f, app, main[0]);
    draw_monitor(f, app, main[1]);

    let mut next = 2;
    if form_open {
        draw_form(f, app, chunks[next]);
        next += 1;
    }
    draw_input(f, app, chunks[next]);
    draw_help(f, app, chunks[next + 1]);
}

fn spinner(app: &App) -> &'static str {
    SPINNER[(app.tick_count / 2) % SPINNER.len()]
}

fn node_style(status: NodeStatus) -> Style {
    let color = match status {
        NodeStatus::Idle => Color::DarkGray,
        NodeStatus::Waiting => Color::Yellow,
        NodeStatus::Running | NodeStatus::Aggregating => Color::Cyan,
        NodeStatus::Success | NodeStatus::Complete => Color::Green,
        NodeStatus::Error => Color::Red,
    };
    Style::default().fg(color)
}

fn node_symbol(app: &App, status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Idle => "○",
        NodeStatus::Waiting => "◌",
        NodeStatus::Running | NodeStatus::Aggregating => spinner(app),
        NodeStatus::Success | NodeStatus::Complete => "●",
        NodeStatus::Error => "✗",
    }
}

fn failure_style(status: FailureStatus) -> Style {
    let color = match status {
        FailureStatus::Pending => Color::Yellow,
        FailureStatus::Running => Color::Cyan,
        FailureStatus::Completed => Color::Green,
        FailureStatus::Failed => Color::Red,
        FailureStatus::Escalated => Color::Magenta,
    };
    Style::default().fg(color)
}

fn pane_block(title: String, focused: bool) -> Block<'static> {
    let style = if focused {
        Style::default().fg(Color::Cyan)
    } else {
        Style::default()
    };
    Block::default()
        .borders(Borders::ALL)
        .border_style(style)
        .title(title)
}

fn draw_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let run = match app.flow.run.as_ref() {
        None => "no run".to_string(),
        Some(run) => match run.outcome {
            None => format!("{} run {} {}ms", spinner(app), run.run_id.short(), run.elapsed_ms),
            Some(true) => format!("run {} succeeded in {}ms", run.run_id.short(), run.elapsed_ms),
            Some(false) => format!("run {} failed after {}ms", run.run_id.short(), run.elapsed_ms),
        },
    };
    let stats = app.service().stats(&app.store);
    let text = format!(
        " {} | {} | failures {} (pending {}, running {}, escalated {}) | success {:.1}%",
        app.flow.flow_name,
        run,
        stats.total,
        stats.pending,
        stats.running,
        stats.escalated,
        stats.success_rate
    );
    let status = Paragraph::new(text).style(Style::default().bg(Color::DarkGray).fg(Color::White));
    f.render_widget(status, area);
}

fn draw_flow(f: &mut Frame, app: &App, area: Rect) {
    let width = area.width.saturating_sub(8) as usize;
    let mut lines: Vec<Line> = Vec::new();

    for node in &app.flow.nodes {
        let status = node.status();
        let style = node_style(status);
        let mut header = vec![
            Span::styled(format!("{} ", node_symbol(app, status)), style),
            Span::styled(
                node.label().to_string(),
                style.add_modifier(Modifier::BOLD),
            ),
            Span::styled(format!(" [{}]", status), Style::default().fg(Color::DarkGray)),
        ];

        match node {
            NodeView::Trigger(t) => {
                lines.push(Line::from(header));
                lines.push(Line::from(Span::styled(
                    format!("    prompt: {}", preview(&t.draft, width)),
                    Style::default().fg(Color::White),
                )));
            }
            NodeView::Task(t) => {
                lines.push(Line::from(header));
                if let Some(error) = &t.error {
                    lines.push(Line::from(Span::styled(
                        format!("    ✗ {}", preview(error, width)),
                        Style::default().fg(Color::Red),
                    )));
                } else if let Some(output) = &t.output {
                    lines.push(Line::from(Span::styled(
                        format!("    → {}", preview(output, width)),
                        Style::default().fg(Color::Gray),
                    )));
                }
            }
            NodeView::Join(j) => {
                header.push(Span::styled(
                    format!(" {}/{}", j.received, j.total),
                    Style::default().fg(Color::Yellow),
                ));
                lines.push(Line::from(header));
                for port in &j.ports {
                    let (mark, mark_style) = if port.received {
                        ("✓", Style::default().fg(Color::Green))
                    } else {
                        ("·", Style::default().fg(Color::DarkGray))
                    };
                    lines.push(Line::from(vec![
                        Span::styled(format!("    {} ", mark), mark_style),
                        Span::styled(
                            format!("{} ← {}", port.port_id, port.source_id),
                            Style::default().fg(Color::Gray),
                        ),
                    ]));
                }
                if let Some(result) = &j.result {
                    lines.push(Line::from(Span::styled(
                        format!("    ⇒ {}", preview(result, width)),
                        Style::default().fg(Color::Green),
                    )));
                }
            }
        }
    }

    let widget = Paragraph::new(lines)
        .block(pane_block(format!(" Flow: {} ", app.flow.flow_name), false))
        .wrap(Wrap { trim: false });
    f.render_widget(widget, area);
}

fn draw_monitor(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(65), Constraint::Percentage(35)])
        .split(area);
    let focused = app.input.focus == Focus::Failures;

    match app.layout.view(&app.store).center {
        CenterView::FullList { failures } => {
            let highlighted = app.highlighted();
            draw_failure_list(
                f,
                chunks[0],
                &failures,
                highlighted.as_ref().map(|id| id.as_str()),
                focused,
            );
        }
        CenterView::Detail { collapsed, failure } => {
            let rows = Layout::default()
                .direction(Direction::Vertical)
                .constraints([
                    Constraint::Length(collapsed.len() as u16 + 2),
                    Constraint::Min(3),
                ])
                .split(chunks[0]);
            draw_failure_list(f, rows[0], &collapsed, Some(failure.id.as_str()), focused);
            draw_failure_detail(f, app, rows[1], failure);
        }
    }

    draw_activity(f, app, chunks[1]);
}

fn draw_failure_list(
    f: &mut Frame,
    area: Rect,
    failures: &[&Failure],
    highlighted: Option<&str>,
    focused: bool,
) {
    let width = area.width.saturating_sub(30) as usize;
    let lines: Vec<Line> = if failures.is_empty() {
        vec![Line::from(Span::styled(
            "No failures reported. Ctrl+N to submit one.",
            Style::default().fg(Color::DarkGray),
        ))]
    } else {
        failures
            .iter()
            .map(|failure| {
                let mut line = Line::from(vec![
                    Span::styled(
                        format!("{:<10}", failure.status.as_str()),
                        failure_style(failure.status),
                    ),
                    Span::raw(format!("{} ", failure.id)),
                    Span::styled(preview(&failure.title(), width), Style::default().fg(Color::White)),
                ]);
                if highlighted == Some(failure.id.as_str()) {
                    line = line.patch_style(Style::default().add_modifier(Modifier::REVERSED));
                }
                line
            })
            .collect()
    };

    let widget = Paragraph::new(lines).block(pane_block(
        format!(" Failures ({}) ", failures.len()),
        focused,
    ));
    f.render_widget(widget, area);
}

fn draw_failure_detail(f: &mut Frame, app: &App, area: Rect, failure: &Failure) {
    let label = Style::default().fg(Color::DarkGray);
    let field = |name: &str, value: String| {
        Line::from(vec![
            Span::styled(format!("{:<10}", name), label),
            Span::raw(value),
        ])
    };

    let mut lines = vec![
        Line::from(Span::styled(
            failure.title(),
            Style::default().add_modifier(Modifier::BOLD),
        )),
        Line::from(vec![
            Span::styled(format!("{:<10}", "status"), label),
            Span::styled(failure.status.to_string(), failure_style(failure.status)),
            Span::styled(format!("  retries {}", failure.retry_count), label),
        ]),
        field("error", failure.error_message.clone()),
    ];
    if let Some(expected) = &failure.expected {
        lines.push(field("expected", expected.clone()));
    }
    if let Some(actual) = &failure.actual {
        lines.push(field("actual", actual.clone()));
    }
    if let Some(workflow) = &failure.workflow_id {
        lines.push(field("workflow", workflow.clone()));
    }
    if let Some(node) = &failure.current_node_id {
        lines.push(field("at node", node.clone()));
    }
    if app.active_failure() == Some(&failure.id) {
        lines.push(Line::from(Span::styled(
            format!("{} repair in progress", spinner(app)),
            Style::default().fg(Color::Cyan),
        )));
    }
    if !failure.node_results.is_empty() {
        lines.push(Line::from(""));
        for (node_id, result) in &failure.node_results {
            let status = result["status"].as_str().unwrap_or("?");
            lines.push(field(node_id.as_str(), status.to_string()));
        }
    }
    if let Some(trace) = &failure.stack_trace {
        lines.push(Line::from(""));
        for trace_line in trace.lines().take(6) {
            lines.push(Line::from(Span::styled(trace_line.to_string(), label)));
        }
    }

    let widget = Paragraph::new(lines)
        .block(pane_block(
            format!(" {} | r retry  e escalate  Esc close ", failure.id),
            false,
        ))
        .wrap(Wrap { trim: false });
    f.render_widget(widget, area);
}

fn draw_activity(f: &mut Frame, app: &App, area: Rect) {
    let visible = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = app
        .store
        .activity()
        .take(visible)
        .map(|event| {
            Line::from(vec![
                Span::styled(
                    format!("{} ", event.timestamp.format("%H:%M:%S")),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::raw(event.message.clone()),
            ])
        })
        .collect();

    let widget = Paragraph::new(lines).block(pane_block(" Activity ".to_string(), false));
    f.render_widget(widget, area);
}

fn draw_form(f: &mut Frame, app: &App, area: Rect) {
    let focused = app.input.focus == Focus::SubmitForm;
    let widget = Paragraph::new(app.input.form.buffer.as_str())
        .block(pane_block(
            " Report failure: file::test name | error message ".to_string(),
            focused,
        ))
        .style(Style::default().fg(Color::White));
    f.render_widget(widget, area);
    if focused {
        set_cursor(f, area, app.input.form.cursor);
    }
}

fn draw_input(f: &mut Frame, app: &App, area: Rect) {
    let focused = app.input.focus == Focus::Prompt;
    let locked = app.prompt_locked();
    let title = if locked {
        format!(" Prompt {} running ", spinner(app))
    } else {
        " Prompt ".to_string()
    };
    let style = if locked {
        Style::default().fg(Color::DarkGray)
    } else {
        Style::default().fg(Color::White)
    };
    let widget = Paragraph::new(app.input.prompt.buffer.as_str())
        .block(pane_block(title, focused))
        .style(style);
    f.render_widget(widget, area);
    if focused && !locked {
        set_cursor(f, area, app.input.prompt.cursor);
    }
}

fn draw_help(f: &mut Frame, app: &App, area: Rect) {
    let text = match &app.notice {
        Some(notice) => format!(" {}", notice),
        None => " Tab focus | Enter submit/open | Ctrl+N report failure | Ctrl+R reset | Ctrl+C quit"
            .to_string(),
    };
    f.render_widget(
        Paragraph::new(text).style(Style::default().fg(Color::DarkGray)),
        area,
    );
}

fn set_cursor(f: &mut Frame, area: Rect, cursor: usize) {
    let cursor_x = area.x + 1 + cursor as u16;
    let cursor_y = area.y + 1;
    f.set_cursor_position((cursor_x.min(area.x + area.width.saturating_sub(2)), cursor_y));
}
