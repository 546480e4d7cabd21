//! Phone number entry line.

use crate::calling::phone;

/// Characters people paste into a number field.
fn is_dial_char(c: char) -> bool {
    c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')' | '.')
}

/// State for the number input.
#[derive(Default)]
pub struct NumberInput {
    pub text: String,
    /// Cursor position (character offset into `text`).
    pub cursor: usize,
}

impl NumberInput {
    /// Insert a character at the cursor. Returns false for characters a
    /// number can't contain, so the caller can treat them as commands.
    pub fn insert(&mut self, c: char) -> bool {
        if !is_dial_char(c) {
            return false;
        }
        let byte_pos = self.char_to_byte(self.cursor);
        self.text.insert(byte_pos, c);
        self.cursor += 1;
        true
    }

    pub fn backspace(&mut self) {
        if self.cursor > 0 {
            let end = self.char_to_byte(self.cursor);
            let start = self.char_to_byte(self.cursor - 1);
            self.text.drain(start..end);
            self.cursor -= 1;
        }
    }

    pub fn delete(&mut self) {
        if self.cursor < self.text.chars().count() {
            let start = self.char_to_byte(self.cursor);
            let end = self.char_to_byte(self.cursor + 1);
            self.text.drain(start..end);
        }
    }

    pub fn move_left(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    pub fn move_right(&mut self) {
        self.cursor = (self.cursor + 1).min(self.text.chars().count());
    }

    pub fn move_home(&mut self) {
        self.cursor = 0;
    }

    pub fn move_end(&mut self) {
        self.cursor = self.text.chars().count();
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.cursor = 0;
    }

    /// What the number will dial as, if it is valid.
    pub fn preview(&self) -> Option<String> {
        phone::normalize(&self.text)
    }

    fn char_to_byte(&self, char_pos: usize) -> usize {
        self.text
            .char_indices()
            .nth(char_pos)
            .map(|(i, _)| i)
            .unwrap_or(self.text.len())
    }
}
