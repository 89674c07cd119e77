//! # quill-core - Editor-side policy for inline AI completions
//!
//! Everything the suggestion state machine consults that is not I/O:
//! what the user configured, whether the text before the cursor should
//! trigger a request, whether the current file is eligible at all, and
//! which suggestions are already known for a given cursor context.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   validate()   ┌──────────────────┐
//! │  Settings   │ ─────────────► │ SettingsError[]  │
//! └──────┬──────┘                └──────────────────┘
//!        │ compile
//!        ▼
//! ┌─────────────┐  prefix   ┌─────────────┐
//! │ TriggerSet  │ ◄──────── │ text before │
//! └─────────────┘           │   cursor    │
//! ┌─────────────┐  file     └─────────────┘
//! │ Eligibility │ ◄──────── path + tags
//! └─────────────┘
//! ┌─────────────────┐
//! │ SuggestionCache │  prefix ⧺ <mask/> ⧺ suffix → text (LRU + TTL)
//! └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`settings`] - User settings, defaults and validation
//! - [`trigger`] - Literal / regex trigger matching
//! - [`eligibility`] - Ignore globs, ignored tags, allowed folder
//! - [`cache`] - Bounded, time-expiring suggestion cache
//! - [`text`] - Word splitting and case-insensitive affix stripping

pub mod cache;
pub mod eligibility;
pub mod settings;
pub mod text;
pub mod trigger;

pub use cache::{SuggestionCache, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};
pub use eligibility::{Eligibility, FileInfo, PathMatcher};
pub use settings::{Settings, SettingsError};
pub use text::{extract_next_word_and_remaining, strip_prefix_ci, strip_suffix_ci};
pub use trigger::{Trigger, TriggerSet};
