//! The suggestion lifecycle as one closed sum type.

/// Exactly one of these is live at a time. Each variant holds only what
/// it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Before settings have been evaluated.
    Init,
    Idle,
    /// Waiting out the debounce window for `ticket`.
    Queued {
        prefix: String,
        suffix: String,
        ticket: u64,
    },
    /// Request `request_id` is in flight.
    Predicting {
        prefix: String,
        suffix: String,
        request_id: String,
    },
    /// `suggestion` is rendered at `prefix|suffix`.
    Suggesting {
        suggestion: String,
        prefix: String,
        suffix: String,
    },
    DisabledManual,
    DisabledInvalidSettings,
    DisabledFileSpecific,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Idle => "idle",
            Self::Queued { .. } => "queued",
            Self::Predicting { .. } => "predicting",
            Self::Suggesting { .. } => "suggesting",
            Self::DisabledManual => "disabled-manual",
            Self::DisabledInvalidSettings => "disabled-invalid-settings",
            Self::DisabledFileSpecific => "disabled-file-specific",
        }
    }

    /// Status line shown by the host. `delay_ms` is the debounce window.
    pub fn status_text(&self, delay_ms: u64) -> String {
        let detail = match self {
            Self::Init => "Connecting".to_string(),
            Self::Idle => "Idle".to_string(),
            Self::Queued { .. } => format!("Queued ({delay_ms} ms)"),
            Self::Predicting { .. } => "Predicting".to_string(),
            Self::Suggesting { .. } => "Suggesting".to_string(),
            Self::DisabledManual => "Disabled".to_string(),
            Self::DisabledInvalidSettings => "Disabled (invalid settings)".to_string(),
            Self::DisabledFileSpecific => "Disabled for this file".to_string(),
        };
        format!("Quill: {detail}")
    }

    pub fn is_disabled(&self) -> bool {
        matches!(
            self,
            Self::DisabledManual | Self::DisabledInvalidSettings | Self::DisabledFileSpecific
        )
    }

    pub fn is_suggesting(&self) -> bool {
        matches!(self, Self::Suggesting { .. })
    }

    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Suggesting { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }
}
