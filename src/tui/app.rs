//! TUI application state and main event loop

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use futures::StreamExt;
use ratatui::DefaultTerminal;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info};

use super::input::NumberInput;
use super::log_capture::LogBuffer;
use super::log_pane::LogPaneState;
use super::ui;
use crate::calling::session::CallSession;
use crate::calling::volume::{self, MicrophoneSource, VolumeMonitor};
use crate::calling::{self, CallSessionManager, Status, StatusKind};
use crate::config::Config;

/// Target frame rate for UI updates (~30 fps)
const FRAME_DURATION: Duration = Duration::from_millis(33);

const LOG_SCROLL_STEP: usize = 5;

pub struct App {
    manager: Option<Arc<CallSessionManager>>,
    /// Why the manager could not be built.
    pub config_error: Option<String>,
    pub caller_id: String,
    pub input: NumberInput,
    pub status: Status,
    pub session: Option<CallSession>,
    pub log_pane: LogPaneState,
    pub level: f32,
    /// Last failed action, shown under the status line.
    pub notice: Option<String>,
    pub mic_error: Option<String>,
    mic: Box<dyn MicrophoneSource>,
    monitor: Option<VolumeMonitor>,
    notices: mpsc::UnboundedSender<String>,
    should_exit: bool,
}

impl App {
    fn new(config: &Config, logs: LogBuffer, notices: mpsc::UnboundedSender<String>) -> Self {
        let (manager, config_error) = match calling::build_manager(config) {
            Ok(m) => (Some(Arc::new(m)), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Self {
            manager,
            config_error,
            caller_id: config.twilio.caller_id.clone(),
            input: NumberInput::default(),
            status: Status::idle(),
            session: None,
            log_pane: LogPaneState::new(logs),
            level: 0.0,
            notice: None,
            mic_error: None,
            mic: volume::default_source(),
            monitor: None,
            notices,
            should_exit: false,
        }
    }

    fn manager(&mut self) -> Option<Arc<CallSessionManager>> {
        if self.manager.is_none() {
            self.notice = self.config_error.clone();
        }
        self.manager.clone()
    }

    /// Register in the background so the first dial is fast.
    fn start_prepare(&mut self) {
        let Some(manager) = self.manager.clone() else {
            return;
        };
        let notices = self.notices.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.prepare().await {
                let _ = notices.send(e.user_message());
            }
        });
    }

    fn dial(&mut self) {
        let Some(manager) = self.manager() else {
            return;
        };
        self.notice = None;
        let number = self.input.text.clone();
        let notices = self.notices.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.initiate(&number).await {
                let _ = notices.send(e.user_message());
            }
        });
    }

    fn accept(&mut self) {
        let Some(manager) = self.manager() else {
            return;
        };
        self.notice = None;
        let notices = self.notices.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.accept_incoming().await {
                let _ = notices.send(e.user_message());
            }
        });
    }

    fn reject(&mut self) {
        if let Some(manager) = self.manager() {
            if let Err(e) = manager.reject_incoming() {
                self.notice = Some(e.user_message());
            }
        }
    }

    fn hang_up(&mut self) {
        if let Some(manager) = self.manager() {
            manager.hang_up();
        }
    }

    fn handle_key(&mut self, key: KeyEvent) {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Char('c') if ctrl => self.should_exit = true,
            KeyCode::Char('u') if ctrl => self.input.clear(),
            KeyCode::Char(c) if !ctrl => self.handle_char(c),
            KeyCode::Enter => self.dial(),
            KeyCode::Esc => self.hang_up(),
            KeyCode::Backspace => self.input.backspace(),
            KeyCode::Delete => self.input.delete(),
            KeyCode::Left => self.input.move_left(),
            KeyCode::Right => self.input.move_right(),
            KeyCode::Home => self.input.move_home(),
            KeyCode::End => self.input.move_end(),
            KeyCode::PageUp => self.log_pane.scroll_up(LOG_SCROLL_STEP),
            KeyCode::PageDown => self.log_pane.scroll_down(LOG_SCROLL_STEP),
            _ => {}
        }
    }

    /// Dial characters go to the input; anything else is a command key.
    fn handle_char(&mut self, c: char) {
        if self.input.insert(c) {
            return;
        }
        match c {
            'q' => self.should_exit = true,
            'a' => self.accept(),
            'r' => self.reject(),
            'h' => self.hang_up(),
            'l' => self.log_pane.toggle(),
            _ => {}
        }
    }

    fn on_status(&mut self, status: Status) {
        debug!("Status: {}", status);
        self.session = self.manager.as_ref().and_then(|m| m.session());

        if status.kind == StatusKind::InCall {
            if self.monitor.is_none() {
                match VolumeMonitor::start(self.mic.as_ref()) {
                    Ok(m) => {
                        self.monitor = Some(m);
                        self.mic_error = None;
                    }
                    Err(e) => self.mic_error = Some(e.user_message()),
                }
            }
        } else {
            self.stop_monitor();
            self.mic_error = None;
        }
        self.status = status;
    }

    fn stop_monitor(&mut self) {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }
        self.level = 0.0;
    }

    fn tick(&mut self) {
        self.log_pane.refresh();
        if let Some(ref monitor) = self.monitor {
            self.level = monitor.level();
        }
    }

    fn shutdown(&mut self) {
        self.stop_monitor();
        if let Some(ref manager) = self.manager {
            manager.shutdown();
        }
    }
}

/// Run the TUI until the user quits.
///
/// `ratatui::init` installs a panic hook that restores the terminal, so a
/// panic inside the loop still leaves the shell usable.
pub async fn run(config: Config, logs: LogBuffer) -> Result<()> {
    let mut terminal = ratatui::init();
    let result = run_app(&mut terminal, &config, logs).await;
    ratatui::restore();
    result
}

async fn run_app(terminal: &mut DefaultTerminal, config: &Config, logs: LogBuffer) -> Result<()> {
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
    let mut app = App::new(config, logs, notice_tx);
    // Without a manager the stream ends at once and the branch stays idle.
    let status_rx = match app.manager {
        Some(ref m) => m.subscribe(),
        None => watch::channel(Status::idle()).1,
    };
    let mut statuses = WatchStream::from_changes(status_rx);
    let mut events = EventStream::new();
    let mut frame = time::interval(FRAME_DURATION);
    frame.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("Dialer started");
    app.start_prepare();

    while !app.should_exit {
        terminal.draw(|f| ui::render(f, &app))?;

        tokio::select! {
            _ = frame.tick() => app.tick(),
            event = events.next() => match event {
                Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => app.handle_key(key),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    app.shutdown();
                    return Err(e.into());
                }
                None => break,
            },
            Some(status) = statuses.next() => app.on_status(status),
            Some(notice) = notice_rx.recv() => app.notice = Some(notice),
        }
    }

    app.shutdown();
    Ok(())
}
