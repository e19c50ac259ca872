//! Operator input.
//!
//! Prompts block until a full line arrives. An empty line selects the offered
//! default. End of input is an error rather than an empty answer, so a
//! mandatory prompt cannot spin on a closed channel.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("operator input closed")]
    Closed,
    #[error("operator i/o failed: {0}")]
    Io(String),
}

impl From<io::Error> for PromptError {
    fn from(value: io::Error) -> Self {
        PromptError::Io(format!("{value}"))
    }
}

pub trait Prompter {
    /// Shows `prompt` with `default` and returns the answer, or `default`
    /// when the operator enters nothing.
    fn prompt_line(&mut self, prompt: &str, default: &str) -> Result<String, PromptError>;

    /// Yes/no question. Any answer starting with `y` or `Y` means yes.
    fn prompt_yes_no(&mut self, prompt: &str, default: bool) -> Result<bool, PromptError> {
        let question = format!("{prompt} {}", if default { "(Y/n)" } else { "(y/N)" });
        let answer = self.prompt_line(&question, if default { "Y" } else { "N" })?;
        Ok(answer.trim_start().to_lowercase().starts_with('y'))
    }
}

/// Line-oriented prompter over any reader/writer pair.
pub struct ConsolePrompter<R, W> {
    input: R,
    output: W,
}

impl ConsolePrompter<io::StdinLock<'static>, io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> ConsolePrompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn read_line(&mut self) -> Result<String, PromptError> {
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Err(PromptError::Closed);
        }
        line.retain(|c| c != '\r' && c != '\n');
        Ok(line)
    }
}

impl<R: BufRead, W: Write> Prompter for ConsolePrompter<R, W> {
    fn prompt_line(&mut self, prompt: &str, default: &str) -> Result<String, PromptError> {
        write!(self.output, "{prompt} [{default}]: ")?;
        self.output.flush()?;
        let line = self.read_line()?;
        if line.is_empty() {
            Ok(default.to_string())
        } else {
            Ok(line)
        }
    }
}

/// Prompter that answers from a prepared script and records what was asked.
///
/// Used for simulated devices and unattended provisioning. Runs out with
/// `PromptError::Closed`.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: VecDeque<String>,
    asked: Vec<String>,
}

impl ScriptedPrompter {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            asked: Vec::new(),
        }
    }

    /// Prompts shown so far, in order.
    pub fn asked(&self) -> &[String] {
        &self.asked
    }

    pub fn remaining(&self) -> usize {
        self.answers.len()
    }
}

impl Prompter for ScriptedPrompter {
    fn prompt_line(&mut self, prompt: &str, default: &str) -> Result<String, PromptError> {
        self.asked.push(prompt.to_string());
        let answer = self.answers.pop_front().ok_or(PromptError::Closed)?;
        if answer.is_empty() {
            Ok(default.to_string())
        } else {
            Ok(answer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn console_returns_typed_line() {
        let mut output = Vec::new();
        let mut prompter = ConsolePrompter::new(Cursor::new("Europe/Paris\r\n"), &mut output);
        let answer = prompter.prompt_line("Time zone", "UTC").expect("answer");
        assert_eq!(answer, "Europe/Paris");
        drop(prompter);
        assert_eq!(String::from_utf8(output).expect("utf8"), "Time zone [UTC]: ");
    }

    #[test]
    fn console_empty_line_selects_default() {
        let mut prompter = ConsolePrompter::new(Cursor::new("\n"), io::sink());
        assert_eq!(prompter.prompt_line("Time zone", "UTC").expect("answer"), "UTC");
    }

    #[test]
    fn console_reports_closed_input() {
        let mut prompter = ConsolePrompter::new(Cursor::new(""), io::sink());
        assert!(matches!(
            prompter.prompt_line("Time zone", "UTC"),
            Err(PromptError::Closed)
        ));
    }

    #[test]
    fn yes_no_uses_first_letter_and_default() {
        let mut prompter = ConsolePrompter::new(Cursor::new("Yes\n\nnope\n"), io::sink());
        assert!(prompter.prompt_yes_no("Configure?", false).expect("first"));
        assert!(!prompter.prompt_yes_no("Configure?", false).expect("second"));
        assert!(!prompter.prompt_yes_no("Configure?", true).expect("third"));
    }

    #[test]
    fn yes_no_shows_default_hint() {
        let mut prompter = ScriptedPrompter::new([""]);
        assert!(prompter.prompt_yes_no("Configure?", true).expect("answer"));
        assert_eq!(prompter.asked(), ["Configure? (Y/n)".to_string()]);
    }

    #[test]
    fn scripted_prompter_runs_dry() {
        let mut prompter = ScriptedPrompter::new(["a"]);
        assert_eq!(prompter.prompt_line("p", "d").expect("first"), "a");
        assert!(matches!(prompter.prompt_line("p", "d"), Err(PromptError::Closed)));
        assert_eq!(prompter.remaining(), 0);
    }
}
