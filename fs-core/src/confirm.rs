//! Operator confirmation
//!
//! Interactive runs ask before each repair. The front end supplies the
//! prompt; the library only needs a yes or a no back.

use std::collections::VecDeque;

/// Answers repair questions
pub trait Confirm: Send {
    /// `question` is a complete sentence such as "UNREF FILE I=12 CLEAR?"
    fn confirm(&mut self, question: &str) -> bool;
}

/// Says yes to everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysYes;

impl Confirm for AlwaysYes {
    fn confirm(&mut self, _question: &str) -> bool {
        true
    }
}

/// Says no to everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysNo;

impl Confirm for AlwaysNo {
    fn confirm(&mut self, _question: &str) -> bool {
        false
    }
}

/// Replays a fixed list of answers, then falls back to `default`. Keeps the
/// questions it was asked.
#[derive(Debug, Default, Clone)]
pub struct Scripted {
    answers: VecDeque<bool>,
    default: bool,
    pub asked: Vec<String>,
}

impl Scripted {
    pub fn new(answers: impl IntoIterator<Item = bool>, default: bool) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            default,
            asked: Vec::new(),
        }
    }
}

impl Confirm for Scripted {
    fn confirm(&mut self, question: &str) -> bool {
        self.asked.push(question.to_string());
        self.answers.pop_front().unwrap_or(self.default)
    }
}
