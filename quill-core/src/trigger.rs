//! Trigger detection on the text immediately before the cursor.
//!
//! A trigger is either a literal the prefix must end with, or a regular
//! expression that must match (regex triggers are anchored with `$`).
//! Triggers are tried in configured order and the first match wins.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::settings::SettingsError;

/// A single configured trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Trigger {
    /// The prefix must end with this exact text.
    #[serde(rename = "string")]
    Literal(String),
    /// The prefix must match this regular expression.
    #[serde(rename = "regex")]
    Pattern(String),
}

impl Trigger {
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    pub fn pattern(value: impl Into<String>) -> Self {
        Self::Pattern(value.into())
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Literal(v) | Self::Pattern(v) => v,
        }
    }

    /// Check the structural rules for this trigger.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.value().is_empty() {
            return Err(SettingsError::EmptyTrigger);
        }
        if let Self::Pattern(pattern) = self {
            if !pattern.ends_with('$') {
                return Err(SettingsError::UnanchoredRegex(pattern.clone()));
            }
            Regex::new(pattern).map_err(|e| SettingsError::InvalidRegex {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// The trigger set enabled out of the box.
    pub fn defaults() -> Vec<Trigger> {
        let literals = [
            "# ", ". ", ": ", ", ", "! ", "? ", "`", "' ", "= ", "$ ", "> ", "\n",
        ];
        let patterns = [
            // bullet list
            r"[\t ]*(\-|\*)[\t ]+$",
            // numbered list
            r"[\t ]*[0-9A-Za-z]+\.[\t ]+$",
            // new line inside a $$ block
            r"\$\$\n[\t ]*$",
            // fenced code block
            r"```[a-zA-Z0-9]*(\n\s*)?$",
            // task list, plain or numbered
            r"\s*(-|[0-9]+\.) \[.\]\s+$",
        ];
        literals
            .into_iter()
            .map(Trigger::literal)
            .chain(patterns.into_iter().map(Trigger::pattern))
            .collect()
    }
}

#[derive(Debug, Clone)]
enum CompiledTrigger {
    Literal(String),
    Pattern(Regex),
}

/// Triggers compiled once per settings revision.
#[derive(Debug, Clone, Default)]
pub struct TriggerSet {
    triggers: Vec<CompiledTrigger>,
}

impl TriggerSet {
    /// Compile triggers in order. Fails on the first invalid one.
    pub fn compile(triggers: &[Trigger]) -> Result<Self, SettingsError> {
        let mut compiled = Vec::with_capacity(triggers.len());
        for trigger in triggers {
            trigger.validate()?;
            compiled.push(match trigger {
                Trigger::Literal(value) => CompiledTrigger::Literal(value.clone()),
                Trigger::Pattern(pattern) => {
                    let regex = Regex::new(pattern).map_err(|e| SettingsError::InvalidRegex {
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    })?;
                    CompiledTrigger::Pattern(regex)
                }
            });
        }
        Ok(Self { triggers: compiled })
    }

    /// Index of the first trigger matching the text before the cursor.
    pub fn first_match(&self, prefix: &str) -> Option<usize> {
        self.triggers.iter().position(|trigger| match trigger {
            CompiledTrigger::Literal(value) => prefix.ends_with(value.as_str()),
            CompiledTrigger::Pattern(regex) => regex.is_match(prefix),
        })
    }

    pub fn matches(&self, prefix: &str) -> bool {
        self.first_match(prefix).is_some()
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}
