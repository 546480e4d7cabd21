//! Terminal front-end for the dialer
//!
//! One screen: number entry, live call status, mic level, and the log pane.

mod app;
mod input;
pub mod log_capture;
mod log_pane;
mod ui;

pub use app::run;
