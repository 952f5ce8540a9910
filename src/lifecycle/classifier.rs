//! Deterministic intent classification.
//!
//! Rules are evaluated in a fixed order:
//! 1. user input while awaiting input is an answer
//! 2. any other user input is a command
//! 3. agent text ending in `?` or matching a question pattern is a question
//! 4. agent text matching a completion pattern is a completion
//! 5. agent output with no text is progress
//! 6. anything else from the agent is progress
//!
//! The pattern lists come from configuration and are compiled once.

use crate::config::ClassifierConfig;
use crate::types::{Actor, Intent, TaskState};
use anyhow::{Result, anyhow};
use regex_lite::Regex;

/// Compiled classifier patterns.
#[derive(Debug, Clone)]
pub struct IntentClassifier {
    question: Vec<Regex>,
    completion: Vec<Regex>,
}

impl Default for IntentClassifier {
    fn default() -> Self {
        // Built-in patterns are known to compile.
        Self::from_config(&ClassifierConfig::default()).unwrap_or(Self {
            question: Vec::new(),
            completion: Vec::new(),
        })
    }
}

fn compile(kind: &str, patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(&format!("(?i){}", p))
                .map_err(|e| anyhow!("Invalid {} pattern '{}': {}", kind, p, e))
        })
        .collect()
}

impl IntentClassifier {
    /// Compile the configured pattern lists. Fails on the first invalid regex.
    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        Ok(Self {
            question: compile("question", &config.question_patterns)?,
            completion: compile("completion", &config.completion_patterns)?,
        })
    }

    pub fn classify(&self, actor: Actor, text: Option<&str>, current: TaskState) -> Intent {
        match actor {
            Actor::User if current == TaskState::AwaitingInput => Intent::Answer,
            Actor::User => Intent::Command,
            Actor::Agent => {
                let text = text.map(str::trim).unwrap_or_default();
                if text.is_empty() {
                    Intent::Progress
                } else if self.is_question(text) {
                    Intent::Question
                } else if self.completion.iter().any(|re| re.is_match(text)) {
                    Intent::Completion
                } else {
                    Intent::Progress
                }
            }
        }
    }

    fn is_question(&self, text: &str) -> bool {
        text.ends_with('?') || self.question.iter().any(|re| re.is_match(text))
    }
}
