//! Editor-side settings and their validation.
//!
//! Loading and persisting settings is the host's job; this module only
//! defines the shape, the defaults, and the rules that decide whether the
//! suggestion machine may run at all.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::eligibility::PathMatcher;
use crate::trigger::{Trigger, TriggerSet};

pub const MIN_DELAY_MS: u64 = 0;
pub const MAX_DELAY_MS: u64 = 2000;
pub const DEFAULT_DELAY_MS: u64 = 500;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// A violated settings rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("invalid server url '{0}' (expected ws:// or wss://)")]
    InvalidServerUrl(String),

    #[error("delay must be between 0ms and 2000ms, got {0}ms")]
    DelayOutOfRange(u64),

    #[error("trigger value must be at least 1 character long")]
    EmptyTrigger,

    #[error("regex trigger '{0}' must end with a $")]
    UnanchoredRegex(String),

    #[error("invalid regex '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },

    #[error("invalid ignore pattern '{pattern}': {reason}")]
    InvalidIgnorePattern { pattern: String, reason: String },

    #[error("invalid tag '{0}': enter each tag on its own line, without '#', spaces or commas")]
    InvalidTag(String),

    #[error("request timeout must be greater than zero")]
    ZeroRequestTimeout,
}

/// User-facing configuration for inline completions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub enabled: bool,
    /// Completion server, `ws://` or `wss://`.
    pub server_url: String,
    pub triggers: Vec<Trigger>,
    /// Debounce window before a queued request is sent.
    pub delay_ms: u64,
    /// Globs (`!` negates) for files that never trigger.
    pub ignored_file_patterns: Vec<String>,
    /// Tags, without `#`, that disable triggering for a file.
    pub ignored_tags: Vec<String>,
    /// When set, files outside this folder are disabled outright.
    pub allowed_folder: Option<String>,
    pub cache_suggestions: bool,
    /// Close the connection after this much silence. `None` or `0`
    /// keeps it open.
    pub idle_timeout_ms: Option<u64>,
    pub request_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            server_url: "ws://127.0.0.1:8080".to_string(),
            triggers: Trigger::defaults(),
            delay_ms: DEFAULT_DELAY_MS,
            ignored_file_patterns: vec!["**/secret/**".to_string()],
            ignored_tags: Vec::new(),
            allowed_folder: None,
            cache_suggestions: true,
            idle_timeout_ms: Some(DEFAULT_IDLE_TIMEOUT_MS),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl Settings {
    /// Every rule these settings violate, in field order.
    pub fn validate(&self) -> Vec<SettingsError> {
        let mut errors = Vec::new();

        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            errors.push(SettingsError::InvalidServerUrl(self.server_url.clone()));
        }

        errors.extend(self.triggers.iter().filter_map(|t| t.validate().err()));

        if !(MIN_DELAY_MS..=MAX_DELAY_MS).contains(&self.delay_ms) {
            errors.push(SettingsError::DelayOutOfRange(self.delay_ms));
        }

        for pattern in &self.ignored_file_patterns {
            if let Err(e) = PathMatcher::new(std::slice::from_ref(pattern)) {
                errors.push(e);
            }
        }

        errors.extend(
            self.ignored_tags
                .iter()
                .filter(|t| t.contains([' ', '#', ',']))
                .map(|t| SettingsError::InvalidTag(t.clone())),
        );

        if self.request_timeout_ms == 0 {
            errors.push(SettingsError::ZeroRequestTimeout);
        }

        errors
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn compile_triggers(&self) -> Result<TriggerSet, SettingsError> {
        TriggerSet::compile(&self.triggers)
    }

    pub fn path_matcher(&self) -> Result<PathMatcher, SettingsError> {
        PathMatcher::new(&self.ignored_file_patterns)
    }

    /// Parse settings from JSON, filling missing fields with defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
