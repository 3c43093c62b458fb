//! Confirmation of destructive operations.

use std::io::{self, BufRead, Write};

/// Asks whether a destructive operation may proceed
pub trait Confirm {
    fn confirm(&mut self, prompt: &str) -> bool;
}

/// Built-in confirmation policies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Prompt on stdout and read the answer from stdin
    Interactive,
    /// Answer every prompt with the given value
    Preset(bool),
}

impl Confirm for Confirmation {
    fn confirm(&mut self, prompt: &str) -> bool {
        match self {
            Confirmation::Preset(answer) => {
                log::debug!("Confirmation preset to {}: {}", answer, prompt.trim());
                *answer
            }
            Confirmation::Interactive => {
                let mut stdout = io::stdout();
                if write!(stdout, "{}", prompt).and_then(|_| stdout.flush()).is_err() {
                    return false;
                }

                let mut answer = String::new();
                if io::stdin().lock().read_line(&mut answer).is_err() {
                    return false;
                }
                is_affirmative(&answer)
            }
        }
    }
}

impl<F> Confirm for F
where
    F: FnMut(&str) -> bool,
{
    fn confirm(&mut self, prompt: &str) -> bool {
        self(prompt)
    }
}

/// `y` or `yes`, in any case
pub fn is_affirmative(answer: &str) -> bool {
    let answer = answer.trim();
    answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes")
}
