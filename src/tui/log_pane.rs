//! Log pane: scrollable view of captured tracing output.

use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Widget},
};

use super::log_capture::{LogBuffer, Severity};

/// Scroll history kept for display.
const MAX_LINES: usize = 1000;

pub struct LogPaneState {
    buffer: LogBuffer,
    lines: Vec<String>,
    pub visible: bool,
    /// 0 = pinned to the newest line.
    scroll_offset: usize,
}

impl LogPaneState {
    pub fn new(buffer: LogBuffer) -> Self {
        Self {
            buffer,
            lines: Vec::new(),
            visible: true,
            scroll_offset: 0,
        }
    }

    /// Pull new lines from the capture buffer. Call once per frame.
    pub fn refresh(&mut self) {
        let (new_lines, dropped) = self.buffer.drain();
        if dropped > 0 {
            self.lines.push(format!("... {} log lines dropped ...", dropped));
        }
        if new_lines.is_empty() && dropped == 0 {
            return;
        }
        let added = new_lines.len() + usize::from(dropped > 0);
        self.lines.extend(new_lines);
        // Keep the view steady while scrolled back.
        if self.scroll_offset > 0 {
            self.scroll_offset += added;
        }
        if self.lines.len() > MAX_LINES {
            let excess = self.lines.len() - MAX_LINES;
            self.lines.drain(..excess);
        }
        self.scroll_offset = self.scroll_offset.min(self.lines.len().saturating_sub(1));
    }

    pub fn toggle(&mut self) {
        self.visible = !self.visible;
        if self.visible {
            self.scroll_offset = 0;
        }
    }

    pub fn scroll_up(&mut self, n: usize) {
        let max_offset = self.lines.len().saturating_sub(1);
        self.scroll_offset = self.scroll_offset.saturating_add(n).min(max_offset);
    }

    pub fn scroll_down(&mut self, n: usize) {
        self.scroll_offset = self.scroll_offset.saturating_sub(n);
    }

    /// Lines that fit in `height` rows at the current scroll position.
    fn window(&self, height: usize) -> &[String] {
        let end = self.lines.len().saturating_sub(self.scroll_offset);
        let start = end.saturating_sub(height);
        &self.lines[start..end]
    }
}

fn severity_style(severity: Severity) -> Style {
    match severity {
        Severity::Error => Style::default().fg(Color::Red),
        Severity::Warn => Style::default().fg(Color::Yellow),
        Severity::Info => Style::default().fg(Color::Gray),
        Severity::Debug => Style::default().fg(Color::DarkGray),
    }
}

pub fn render(area: Rect, buf: &mut Buffer, state: &LogPaneState) {
    let title = if state.scroll_offset > 0 {
        format!(" Log (+{}) ", state.scroll_offset)
    } else {
        " Log ".to_string()
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray))
        .title(Span::styled(
            title,
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ));

    let inner = block.inner(area);
    block.render(area, buf);
    if inner.height == 0 || inner.width == 0 {
        return;
    }

    let lines: Vec<Line> = state
        .window(inner.height as usize)
        .iter()
        .map(|l| Line::from(Span::styled(l.as_str(), severity_style(Severity::of(l)))))
        .collect();
    Paragraph::new(lines).render(inner, buf);
}
