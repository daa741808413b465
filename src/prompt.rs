//! Interactive prompts behind a narrow capability trait.
//!
//! The auth flow and the chat/mode choosers only ever need these three
//! questions, and tests inject scripted answers instead of a terminal.

use std::io::{self, BufRead, Write};

use crate::error::{Error, Result};

pub trait UserInteraction: Send + Sync {
    /// Free-form line input (chat index, mode number).
    fn ask_choice(&self, prompt: &str) -> Result<String>;

    /// The login code sent via Telegram.
    fn ask_code(&self, phone: &str) -> Result<String>;

    /// The 2FA password; never echoed.
    fn ask_password(&self, hint: &str) -> Result<String>;
}

/// Terminal-backed prompts. Questions go to stderr so stdout stays clean.
pub struct StdinPrompts;

impl StdinPrompts {
    fn read_line(prompt: &str) -> Result<String> {
        eprint!("{prompt}");
        io::stderr()
            .flush()
            .map_err(|e| Error::fs("flush", "stderr", e))?;

        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(|e| Error::fs("read", "stdin", e))?;
        Ok(line.trim().to_string())
    }
}

impl UserInteraction for StdinPrompts {
    fn ask_choice(&self, prompt: &str) -> Result<String> {
        Self::read_line(prompt)
    }

    fn ask_code(&self, phone: &str) -> Result<String> {
        let code = Self::read_line(&format!("Enter the code sent to {phone}: "))?;
        if code.is_empty() {
            return Err(Error::Auth("empty login code".to_string()));
        }
        Ok(code)
    }

    fn ask_password(&self, hint: &str) -> Result<String> {
        let prompt = if hint.is_empty() {
            "Enter your 2FA password: ".to_string()
        } else {
            format!("Enter your 2FA password (hint: {hint}): ")
        };
        rpassword::prompt_password(prompt).map_err(|e| Error::fs("read", "tty", e))
    }
}

/// Scripted answers for tests, consumed in order.
pub struct ScriptedPrompts {
    answers: std::sync::Mutex<std::collections::VecDeque<String>>,
}

impl ScriptedPrompts {
    pub fn new(answers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            answers: std::sync::Mutex::new(answers.into_iter().map(Into::into).collect()),
        }
    }

    fn next(&self) -> Result<String> {
        self.answers
            .lock()
            .expect("prompt script lock")
            .pop_front()
            .ok_or_else(|| Error::Auth("prompt script exhausted".to_string()))
    }
}

impl UserInteraction for ScriptedPrompts {
    fn ask_choice(&self, _prompt: &str) -> Result<String> {
        self.next()
    }

    fn ask_code(&self, _phone: &str) -> Result<String> {
        self.next()
    }

    fn ask_password(&self, _hint: &str) -> Result<String> {
        self.next()
    }
}
