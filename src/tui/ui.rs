//! UI rendering for the TUI

use chrono::Utc;
use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Widget},
    Frame,
};

use super::app::App;
use super::log_pane;
use crate::calling::session::{CallSession, Direction};
use crate::calling::{Status, StatusKind};

const CALL_PANEL_HEIGHT: u16 = 9;

pub fn render(frame: &mut Frame, app: &App) {
    let area = frame.area();

    let [header_area, call_area, log_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Length(CALL_PANEL_HEIGHT),
        Constraint::Fill(1),
        Constraint::Length(1),
    ])
    .areas(area);

    let buf = frame.buffer_mut();
    render_header(header_area, buf, app);
    render_call_panel(call_area, buf, app);
    if app.log_pane.visible {
        log_pane::render(log_area, buf, &app.log_pane);
    }
    render_footer(footer_area, buf, &app.status);
}

fn render_header(area: Rect, buf: &mut Buffer, app: &App) {
    let bar = Style::default().bg(Color::Blue).fg(Color::White);
    let mut spans = vec![Span::styled(
        " Outreach Dialer",
        bar.add_modifier(Modifier::BOLD),
    )];
    if !app.caller_id.is_empty() {
        spans.push(Span::styled(format!("  from {}", app.caller_id), bar));
    }
    Paragraph::new(Line::from(spans)).style(bar).render(area, buf);
}

pub fn status_style(kind: StatusKind) -> Style {
    let base = Style::default();
    match kind {
        StatusKind::Idle | StatusKind::Ended | StatusKind::Cancelled => base.fg(Color::Gray),
        StatusKind::Registering | StatusKind::Connecting | StatusKind::Reconnecting => {
            base.fg(Color::Yellow)
        }
        StatusKind::Ready => base.fg(Color::Green),
        StatusKind::Incoming => base.fg(Color::Magenta).add_modifier(Modifier::BOLD),
        StatusKind::InCall => base.fg(Color::Green).add_modifier(Modifier::BOLD),
        StatusKind::Error => base.fg(Color::Red),
    }
}

/// Input text with the cursor cell shown reversed.
fn input_line(text: &str, cursor: usize) -> Line<'static> {
    let chars: Vec<char> = text.chars().collect();
    let before: String = chars[..cursor.min(chars.len())].iter().collect();
    let at = chars.get(cursor).map(|c| c.to_string()).unwrap_or_else(|| " ".to_string());
    let after: String = chars.iter().skip(cursor + 1).collect();
    Line::from(vec![
        Span::styled("Number: ", Style::default().fg(Color::DarkGray)),
        Span::raw(before),
        Span::styled(at, Style::default().add_modifier(Modifier::REVERSED)),
        Span::raw(after),
    ])
}

fn preview_line(app: &App) -> Line<'static> {
    let label = Span::styled("Dials:  ", Style::default().fg(Color::DarkGray));
    if app.input.text.trim().is_empty() {
        return Line::from(label);
    }
    match app.input.preview() {
        Some(e164) => Line::from(vec![label, Span::styled(e164, Style::default().fg(Color::Cyan))]),
        None => Line::from(vec![
            label,
            Span::styled("not a valid number", Style::default().fg(Color::DarkGray)),
        ]),
    }
}

/// "Outbound to +15551234567  01:23"
pub fn session_summary(session: &CallSession, show_elapsed: bool) -> String {
    let direction = match session.direction {
        Direction::Outbound => "Outbound to",
        Direction::Inbound => "Inbound from",
    };
    if !show_elapsed {
        return format!("{} {}", direction, session.target);
    }
    let secs = (Utc::now() - session.started_at).num_seconds().max(0);
    format!(
        "{} {}  {:02}:{:02}",
        direction,
        session.target,
        secs / 60,
        secs % 60
    )
}

fn render_call_panel(area: Rect, buf: &mut Buffer, app: &App) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray))
        .title(" Call ");
    let inner = block.inner(area);
    block.render(area, buf);

    let [input_area, preview_area, _, status_area, session_area, meter_area, notice_area] =
        Layout::vertical([Constraint::Length(1); 7]).areas(inner);

    Paragraph::new(input_line(&app.input.text, app.input.cursor)).render(input_area, buf);
    Paragraph::new(preview_line(app)).render(preview_area, buf);

    let status = match app.config_error {
        Some(ref e) if app.status.kind == StatusKind::Idle => {
            Span::styled(e.clone(), status_style(StatusKind::Error))
        }
        _ => Span::styled(app.status.message.clone(), status_style(app.status.kind)),
    };
    Paragraph::new(Line::from(vec![
        Span::styled("Status: ", Style::default().fg(Color::DarkGray)),
        status,
    ]))
    .render(status_area, buf);

    if let Some(ref session) = app.session {
        let in_call = app.status.kind == StatusKind::InCall;
        Paragraph::new(session_summary(session, in_call)).render(session_area, buf);
    }

    if app.status.kind == StatusKind::InCall {
        match app.mic_error {
            Some(ref e) => {
                Paragraph::new(Span::styled(e.clone(), Style::default().fg(Color::Yellow)))
                    .render(meter_area, buf)
            }
            None => Gauge::default()
                .gauge_style(Style::default().fg(Color::Green))
                .ratio(f64::from(app.level.clamp(0.0, 1.0)))
                .label("mic")
                .render(meter_area, buf),
        }
    }

    if let Some(ref notice) = app.notice {
        Paragraph::new(Span::styled(notice.clone(), Style::default().fg(Color::Red)))
            .render(notice_area, buf);
    }
}

/// Key hints for whatever the user can do right now.
pub fn key_hints(status: &Status) -> &'static str {
    match status.kind {
        StatusKind::Incoming => " a accept  r reject  l log  q quit",
        _ if status.is_busy() => " h/Esc hang up  l log  q quit",
        _ => " Enter dial  Ctrl-U clear  l log  PgUp/PgDn scroll  q quit",
    }
}

fn render_footer(area: Rect, buf: &mut Buffer, status: &Status) {
    Paragraph::new(key_hints(status))
        .style(Style::default().fg(Color::DarkGray))
        .render(area, buf);
}
