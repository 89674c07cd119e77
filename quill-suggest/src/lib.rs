//! # quill-suggest - Inline suggestion lifecycle
//!
//! Decides when to ask for a completion, which response is still
//! relevant, and what the editor should show, insert or clear.
//!
//! ## Architecture
//!
//! ```text
//!  editor callbacks          ┌──────────────────┐   effects   ┌───────────────┐
//! ─────────────────────────► │ SuggestionDriver │ ──────────► │ EditorSurface │
//!  DocumentChange, keys      │  (tokio task)    │             └───────────────┘
//!                            │ ┌──────────────┐ │   predict   ┌───────────────┐
//!  timers, responses ──────► │ │ step(S, E)   │ │ ──────────► │ Hub/Connection│
//!                            │ └──────────────┘ │             └───────────────┘
//!                            └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`state`] - the lifecycle states
//! - [`event`] - document changes, keys, timers and responses
//! - [`machine`] - the transition function and its effects
//! - [`driver`] - async host that runs effects

pub mod driver;
pub mod event;
pub mod machine;
pub mod state;

pub use driver::{DriverHandle, EditorSurface, SuggestionDriver, CONNECT_FAILURE_NOTICE_THRESHOLD};
pub use event::{DocumentChange, Event};
pub use machine::{step, Effect, MachineContext, Step, SuggestionMachine, Transition};
pub use state::State;
