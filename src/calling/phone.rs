//! E.164 phone number normalization.
//!
//! Numbers typed by a rep come in every shape ("(555) 123-4567",
//! "0044 7911 123456", "+1 555 123 4567"). Everything that leaves this crate
//! towards the calling backend or the SMS endpoint goes through [`normalize`].

use std::sync::OnceLock;

use regex::Regex;

use super::CallError;

fn e164() -> &'static Regex {
    static E164: OnceLock<Regex> = OnceLock::new();
    E164.get_or_init(|| Regex::new(r"^\+[1-9]\d{7,14}$").expect("static E.164 pattern"))
}

/// Normalize a user-entered phone number to E.164.
///
/// Returns `None` for anything that cannot be turned into a plausible
/// international number. Bare 10-digit numbers are assumed North American.
pub fn normalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut cleaned = String::with_capacity(trimmed.len());
    for (i, c) in trimmed.chars().enumerate() {
        if c.is_ascii_digit() || (c == '+' && i == 0) {
            cleaned.push(c);
        }
    }

    if let Some(rest) = cleaned.strip_prefix("00") {
        cleaned = format!("+{}", rest);
    }

    if !cleaned.starts_with('+') {
        if cleaned.len() != 10 {
            return None;
        }
        cleaned = format!("+1{}", cleaned);
    }

    e164().is_match(&cleaned).then_some(cleaned)
}

/// Normalize, distinguishing blank input from malformed input.
pub fn validate(raw: &str) -> Result<String, CallError> {
    if raw.trim().is_empty() {
        return Err(CallError::EmptyNumber);
    }
    normalize(raw).ok_or(CallError::InvalidNumber)
}
