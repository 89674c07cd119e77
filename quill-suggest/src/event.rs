//! Inputs to the suggestion machine.

use quill_core::{FileInfo, Settings};
use quill_link::LinkError;

/// One editor update, already classified by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentChange {
    /// Text before the cursor.
    pub prefix: String,
    /// Text after the cursor.
    pub suffix: String,
    pub doc_in_focus: bool,
    /// The user typed (insert via keyboard).
    pub user_typed: bool,
    pub user_deleted: bool,
    /// The cursor moved without typing.
    pub cursor_moved: bool,
    /// Text was added by any means (paste, completion, typing).
    pub text_added: bool,
    pub has_selection: bool,
    pub multiple_cursors: bool,
    pub undone: bool,
    pub redone: bool,
}

impl DocumentChange {
    /// The user typed, leaving `prefix|suffix` around the cursor.
    pub fn typed(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
            doc_in_focus: true,
            user_typed: true,
            text_added: true,
            ..Self::default()
        }
    }

    pub fn deleted(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
            doc_in_focus: true,
            user_deleted: true,
            ..Self::default()
        }
    }

    pub fn cursor_moved(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
            doc_in_focus: true,
            cursor_moved: true,
            ..Self::default()
        }
    }

    pub fn with_selection(mut self) -> Self {
        self.has_selection = true;
        self
    }

    pub fn unfocused(mut self) -> Self {
        self.doc_in_focus = false;
        self
    }

    pub fn is_typing(&self) -> bool {
        self.user_typed || self.text_added
    }

    /// Anything that abandons an in-progress suggestion outright.
    pub(crate) fn breaks_suggestion(&self) -> bool {
        !self.doc_in_focus
            || self.cursor_moved
            || self.has_selection
            || self.multiple_cursors
            || self.user_deleted
            || self.undone
            || self.redone
    }
}

/// Everything the machine reacts to.
#[derive(Debug, Clone)]
pub enum Event {
    DocumentChanged(DocumentChange),
    /// Explicit "predict now" command.
    PredictCommand { prefix: String, suffix: String },
    AcceptKey,
    PartialAcceptKey,
    CancelKey,
    SettingsChanged(Settings),
    FileChanged(Option<FileInfo>),
    /// A debounce timer armed with `ticket` fired.
    DebounceElapsed { ticket: u64 },
    /// The request tagged `request_id` completed.
    PredictionResolved {
        request_id: String,
        result: Result<String, LinkError>,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DocumentChanged(_) => "document-changed",
            Self::PredictCommand { .. } => "predict-command",
            Self::AcceptKey => "accept-key",
            Self::PartialAcceptKey => "partial-accept-key",
            Self::CancelKey => "cancel-key",
            Self::SettingsChanged(_) => "settings-changed",
            Self::FileChanged(_) => "file-changed",
            Self::DebounceElapsed { .. } => "debounce-elapsed",
            Self::PredictionResolved { .. } => "prediction-resolved",
        }
    }
}
