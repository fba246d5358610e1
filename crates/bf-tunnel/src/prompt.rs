//! User interaction during orchestration
//!
//! The orchestrator never talks to the terminal directly: decisions it
//! cannot take alone (an occupied local port, a destructive remote stop, an
//! SSH password) go through [`Interaction`].

use std::io::{self, BufRead, IsTerminal, Write};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

/// Questions the orchestrator may ask
pub trait Interaction: Send + Sync {
    /// Ask for another local port after `busy` turned out to be taken
    fn alternate_port(&self, busy: u16) -> Option<u16>;

    /// Yes/no confirmation, defaulting to no
    fn confirm(&self, question: &str) -> bool;

    /// Read a secret without echoing it
    fn password(&self, prompt: &str) -> Option<String>;
}

/// Never asks anything; every question is declined
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractive;

impl Interaction for NonInteractive {
    fn alternate_port(&self, _busy: u16) -> Option<u16> {
        None
    }

    fn confirm(&self, _question: &str) -> bool {
        false
    }

    fn password(&self, _prompt: &str) -> Option<String> {
        None
    }
}

/// Prompts on the controlling terminal
///
/// Falls back to [`NonInteractive`] answers when stdin is not a terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalInteraction;

impl TerminalInteraction {
    fn ask(&self, prompt: &str) -> Option<String> {
        if !io::stdin().is_terminal() {
            return None;
        }
        let mut stderr = io::stderr();
        write!(stderr, "{}", prompt).ok()?;
        stderr.flush().ok()?;

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).ok()?;
        Some(line.trim().to_string())
    }
}

impl Interaction for TerminalInteraction {
    fn alternate_port(&self, busy: u16) -> Option<u16> {
        let answer = self.ask(&format!(
            "Local port {} is in use. Enter another port (empty to abort): ",
            busy
        ))?;
        match answer.parse() {
            Ok(0) | Err(_) => None,
            Ok(port) => Some(port),
        }
    }

    fn confirm(&self, question: &str) -> bool {
        self.ask(&format!("{} [y/N] ", question))
            .map(|a| matches!(a.to_ascii_lowercase().as_str(), "y" | "yes"))
            .unwrap_or(false)
    }

    fn password(&self, prompt: &str) -> Option<String> {
        if !io::stdin().is_terminal() {
            return None;
        }
        let mut stderr = io::stderr();
        write!(stderr, "{}", prompt).ok()?;
        stderr.flush().ok()?;

        enable_raw_mode().ok()?;
        let secret = read_secret();
        let _ = disable_raw_mode();
        let _ = writeln!(stderr);
        secret
    }
}

/// Collect key presses until Enter; Esc or Ctrl+C cancel
fn read_secret() -> Option<String> {
    let mut secret = String::new();
    loop {
        let Event::Key(KeyEvent {
            code,
            modifiers,
            kind,
            ..
        }) = event::read().ok()?
        else {
            continue;
        };
        if kind != KeyEventKind::Press {
            continue;
        }
        match code {
            KeyCode::Enter => return Some(secret),
            KeyCode::Esc => return None,
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => return None,
            KeyCode::Backspace => {
                secret.pop();
            }
            KeyCode::Char(c) => secret.push(c),
            _ => {}
        }
    }
}
