//! The interactive input side of the session.
//!
//! The session needs to run keepalives and drain device output while the user
//! is idle, so input is read in short slices: each call to
//! [`Console::next_input`] returns after at most one slice.

use std::{
    io::{stdout, Write},
    time::{Duration, Instant},
};

use crossterm::{
    event::{poll, read, Event, KeyCode, KeyEvent, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use log::debug;

// =============================================================================
// Public Interface
// =============================================================================

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Input {
    /// A complete line (without the terminator).
    Line(String),
    /// Nothing complete yet.
    Idle,
    /// The input stream is gone; the session should end.
    Closed,
}

/// Source of console lines.
pub trait Console {
    /// Wait up to `slice` for a complete line.
    fn next_input(&mut self, slice: Duration) -> Input;

    /// Show the prompt for the next line.
    fn prompt(&mut self, _prompt: &str) {}
}

/// Line editor on the terminal, in raw mode while polling.
///
/// Enter submits, Backspace deletes, Esc clears the line and Ctrl+C or
/// Ctrl+D close the input.
#[derive(Debug, Default)]
pub struct TerminalConsole {
    buffer: String,
}

impl TerminalConsole {
    pub fn new() -> Self {
        Self::default()
    }

    fn poll_keys(&mut self, slice: Duration) -> crossterm::Result<Input> {
        let deadline = Instant::now() + slice;
        enable_raw_mode()?;
        let result = self.read_until(deadline);
        disable_raw_mode()?;
        result
    }

    fn read_until(&mut self, deadline: Instant) -> crossterm::Result<Input> {
        let mut out = stdout();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() || !poll(left)? {
                return Ok(Input::Idle);
            }
            // `read` won't block after `poll` returned `Ok(true)`.
            let key = match read()? {
                Event::Key(key) => key,
                _ => continue,
            };
            match edit_line(&mut self.buffer, key) {
                Edit::Echo(text) => write!(out, "{}", text)?,
                Edit::Done(input) => {
                    write!(out, "\r\n")?;
                    out.flush()?;
                    return Ok(input);
                }
            }
            out.flush()?;
        }
    }
}

impl Console for TerminalConsole {
    fn next_input(&mut self, slice: Duration) -> Input {
        match self.poll_keys(slice) {
            Ok(input) => input,
            Err(e) => {
                debug!("terminal input failed: {}", e);
                // Best effort: leave the terminal usable.
                let _ = disable_raw_mode();
                Input::Closed
            }
        }
    }

    fn prompt(&mut self, prompt: &str) {
        let mut out = stdout();
        let _ = write!(out, "{}{}", prompt, self.buffer);
        let _ = out.flush();
    }
}

// =============================================================================
// Private stuff
// =============================================================================

const ERASE: &str = "\u{8} \u{8}";

/// What a key press does to the line being edited.
#[derive(Debug, Eq, PartialEq)]
enum Edit {
    /// Keep editing after echoing this text.
    Echo(String),
    /// The line is over.
    Done(Input),
}

fn edit_line(buffer: &mut String, key: KeyEvent) -> Edit {
    match key {
        KeyEvent {
            code: KeyCode::Char('c'),
            modifiers: KeyModifiers::CONTROL,
        }
        | KeyEvent {
            code: KeyCode::Char('d'),
            modifiers: KeyModifiers::CONTROL,
        } => {
            // Raw mode swallows the signal, so Ctrl+C shows up here.
            Edit::Done(Input::Closed)
        }
        KeyEvent {
            code: KeyCode::Enter,
            ..
        } => Edit::Done(Input::Line(std::mem::take(buffer))),
        KeyEvent {
            code: KeyCode::Backspace,
            ..
        } => match buffer.pop() {
            Some(_) => Edit::Echo(ERASE.to_string()),
            None => Edit::Echo(String::new()),
        },
        KeyEvent {
            code: KeyCode::Esc, ..
        } => {
            let erased = ERASE.repeat(buffer.chars().count());
            buffer.clear();
            Edit::Echo(erased)
        }
        KeyEvent {
            code: KeyCode::Char(c),
            ..
        } => {
            buffer.push(c);
            Edit::Echo(c.to_string())
        }
        _ => Edit::Echo(String::new()),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent {
            code,
            modifiers: KeyModifiers::NONE,
        }
    }

    fn ctrl(c: char) -> KeyEvent {
        KeyEvent {
            code: KeyCode::Char(c),
            modifiers: KeyModifiers::CONTROL,
        }
    }

    fn type_text(buffer: &mut String, text: &str) {
        for c in text.chars() {
            assert_eq!(edit_line(buffer, key(KeyCode::Char(c))), Edit::Echo(c.to_string()));
        }
    }

    #[test]
    fn enter_submits_and_empties_the_buffer() {
        let mut buffer = String::new();
        type_text(&mut buffer, "version");
        assert_eq!(
            edit_line(&mut buffer, key(KeyCode::Enter)),
            Edit::Done(Input::Line("version".into()))
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn backspace_erases_one_char() {
        let mut buffer = String::new();
        type_text(&mut buffer, "pinh");
        assert_eq!(
            edit_line(&mut buffer, key(KeyCode::Backspace)),
            Edit::Echo(ERASE.into())
        );
        type_text(&mut buffer, "g");
        assert_eq!(buffer, "ping");
    }

    #[test]
    fn backspace_on_empty_line_echoes_nothing() {
        let mut buffer = String::new();
        assert_eq!(
            edit_line(&mut buffer, key(KeyCode::Backspace)),
            Edit::Echo(String::new())
        );
    }

    #[test]
    fn esc_clears_the_line() {
        let mut buffer = String::new();
        type_text(&mut buffer, "dht");
        assert_eq!(
            edit_line(&mut buffer, key(KeyCode::Esc)),
            Edit::Echo(ERASE.repeat(3))
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn ctrl_c_and_ctrl_d_close_the_input() {
        let mut buffer = String::from("half a line");
        assert_eq!(edit_line(&mut buffer, ctrl('c')), Edit::Done(Input::Closed));
        assert_eq!(edit_line(&mut buffer, ctrl('d')), Edit::Done(Input::Closed));
    }

    #[test]
    fn shifted_chars_are_typed() {
        let mut buffer = String::new();
        let shifted = KeyEvent {
            code: KeyCode::Char('Q'),
            modifiers: KeyModifiers::SHIFT,
        };
        assert_eq!(edit_line(&mut buffer, shifted), Edit::Echo("Q".into()));
        assert_eq!(buffer, "Q");
    }
}
