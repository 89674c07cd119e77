//! Transition function for the suggestion lifecycle.
//!
//! [`step`] is pure apart from the context it is handed: it maps
//! `(State, Event)` to the next state plus the side effects the host must
//! run. Lifecycle effects are derived from the state change itself:
//!
//! | Change                               | Effect            |
//! |--------------------------------------|-------------------|
//! | leave `Queued{ticket}`               | `CancelDebounce`  |
//! | leave `Suggesting`                   | `ClearSuggestion` |
//! | enter any `Disabled*` from elsewhere | `TearDownConnection` |
//! | enter `Queued{ticket}`               | `ArmDebounce`     |
//! | enter `Predicting{request_id}`       | `SendPredict`     |
//! | enter/replace `Suggesting`           | `ShowSuggestion`  |
//! | status text changed                  | `UpdateStatus`    |
//!
//! Stale timers and late responses are recognised by their ticket or
//! request id and leave the state untouched.

use std::time::Duration;

use quill_core::text::char_boundaries;
use quill_core::{
    extract_next_word_and_remaining, strip_prefix_ci, strip_suffix_ci, Eligibility, FileInfo,
    PathMatcher, Settings, SuggestionCache, TriggerSet,
};
use quill_link::LinkError;
use uuid::Uuid;

use crate::event::{DocumentChange, Event};
use crate::state::State;

/// Side effects requested by a transition, in the order they must run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    ArmDebounce { ticket: u64, delay: Duration },
    CancelDebounce,
    SendPredict {
        request_id: String,
        prefix: String,
        suffix: String,
    },
    ShowSuggestion(String),
    ClearSuggestion,
    InsertText(String),
    /// One-line notice for a hard failure.
    Notify(String),
    TearDownConnection,
    UpdateStatus(String),
}

/// Result of one [`step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub state: State,
    pub effects: Vec<Effect>,
    /// Whether a key event was consumed.
    pub handled: bool,
}

/// Shared data every transition may read or update.
#[derive(Debug)]
pub struct MachineContext {
    settings: Settings,
    triggers: TriggerSet,
    ignored_paths: PathMatcher,
    cache: SuggestionCache,
    current_file: Option<FileInfo>,
    next_ticket: u64,
}

impl MachineContext {
    pub fn new(settings: Settings) -> Self {
        let mut ctx = Self {
            settings: Settings::default(),
            triggers: TriggerSet::default(),
            ignored_paths: PathMatcher::empty(),
            cache: SuggestionCache::default(),
            current_file: None,
            next_ticket: 0,
        };
        ctx.apply_settings(settings);
        ctx
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn current_file(&self) -> Option<&FileInfo> {
        self.current_file.as_ref()
    }

    pub fn cache(&self) -> &SuggestionCache {
        &self.cache
    }

    /// Cached suggestion for a cursor context, ignoring blank entries and
    /// honouring the caching switch.
    pub fn cached_suggestion(&mut self, prefix: &str, suffix: &str) -> Option<String> {
        if !self.settings.cache_suggestions {
            return None;
        }
        self.cache
            .get(prefix, suffix)
            .filter(|text| !text.trim().is_empty())
    }

    fn remember(&mut self, prefix: &str, suffix: &str, text: &str) {
        if self.settings.cache_suggestions {
            self.cache.insert(prefix, suffix, text);
        }
    }

    fn apply_settings(&mut self, settings: Settings) {
        // invalid triggers or globs leave matching disabled; validation
        // keeps the machine in DisabledInvalidSettings anyway
        self.triggers = settings.compile_triggers().unwrap_or_default();
        self.ignored_paths = settings.path_matcher().unwrap_or_default();
        if !settings.cache_suggestions {
            self.cache.clear();
        }
        self.settings = settings;
    }

    fn eligibility(&self) -> Eligibility {
        Eligibility::evaluate(
            self.current_file.as_ref(),
            &self.ignored_paths,
            &self.settings.ignored_tags,
            self.settings.allowed_folder.as_deref(),
        )
    }

    fn next_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// Where an enabled-or-not machine should rest after settings or
    /// file re-evaluation.
    fn resting_state(&self) -> State {
        if !self.settings.enabled {
            State::DisabledManual
        } else if !self.settings.is_valid() {
            State::DisabledInvalidSettings
        } else if self.eligibility() == Eligibility::OutsideAllowedFolder {
            State::DisabledFileSpecific
        } else {
            State::Idle
        }
    }
}

/// Transition outcome before lifecycle effects are derived.
struct Outcome {
    state: State,
    effects: Vec<Effect>,
    handled: bool,
}

impl Outcome {
    fn to(state: State) -> Self {
        Self {
            state,
            effects: Vec::new(),
            handled: false,
        }
    }

    fn handled(mut self) -> Self {
        self.handled = true;
        self
    }

    fn with(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Apply `event` to `state`.
pub fn step(state: State, event: Event, ctx: &mut MachineContext) -> Step {
    let previous = state.clone();
    let outcome = transition(state, event, ctx);
    let effects = lifecycle_effects(
        &previous,
        &outcome.state,
        outcome.effects,
        ctx.settings.delay_ms,
    );
    Step {
        state: outcome.state,
        effects,
        handled: outcome.handled,
    }
}

fn transition(state: State, event: Event, ctx: &mut MachineContext) -> Outcome {
    match event {
        Event::SettingsChanged(settings) => on_settings(state, settings, ctx),
        Event::FileChanged(file) => on_file(state, file, ctx),
        Event::DocumentChanged(change) => on_document(state, change, ctx),
        Event::PredictCommand { prefix, suffix } => match state {
            State::Idle => match ctx.eligibility() {
                Eligibility::OutsideAllowedFolder => Outcome::to(State::DisabledFileSpecific),
                Eligibility::IgnoredPath | Eligibility::IgnoredTag => Outcome::to(State::Idle),
                Eligibility::Eligible => Outcome::to(predicting(prefix, suffix)),
            },
            other => Outcome::to(other),
        },
        Event::AcceptKey => match state {
            State::Suggesting {
                suggestion,
                prefix,
                suffix,
            } => accept(&suggestion, &prefix, &suffix, ctx),
            other => Outcome::to(other),
        },
        Event::PartialAcceptKey => match state {
            State::Suggesting {
                suggestion,
                prefix,
                suffix,
            } => partial_accept(&suggestion, &prefix, suffix, ctx),
            other => Outcome::to(other),
        },
        Event::CancelKey => match state {
            State::Queued { .. } | State::Predicting { .. } => Outcome::to(State::Idle).handled(),
            State::Suggesting { .. } => {
                ctx.cache.clear();
                Outcome::to(State::Idle).handled()
            }
            other => Outcome::to(other),
        },
        Event::DebounceElapsed { ticket } => match state {
            State::Queued {
                prefix,
                suffix,
                ticket: current,
            } if current == ticket => Outcome::to(predicting(prefix, suffix)),
            other => {
                log::trace!("Ignoring stale debounce ticket {ticket} in {}", other.name());
                Outcome::to(other)
            }
        },
        Event::PredictionResolved { request_id, result } => match state {
            State::Predicting {
                prefix,
                suffix,
                request_id: current,
            } if current == request_id => resolved(prefix, suffix, result, ctx),
            other => {
                log::debug!("Dropping response for request {request_id} in {}", other.name());
                Outcome::to(other)
            }
        },
    }
}

fn predicting(prefix: String, suffix: String) -> State {
    State::Predicting {
        prefix,
        suffix,
        request_id: Uuid::new_v4().to_string(),
    }
}

fn on_settings(state: State, settings: Settings, ctx: &mut MachineContext) -> Outcome {
    ctx.apply_settings(settings);

    match state {
        State::Init
        | State::DisabledManual
        | State::DisabledInvalidSettings
        | State::DisabledFileSpecific => Outcome::to(ctx.resting_state()),
        active => match ctx.resting_state() {
            State::Idle => match active {
                State::Suggesting { .. } if !ctx.settings.cache_suggestions => {
                    Outcome::to(State::Idle)
                }
                unchanged => Outcome::to(unchanged),
            },
            other => Outcome::to(other),
        },
    }
}

fn on_file(state: State, file: Option<FileInfo>, ctx: &mut MachineContext) -> Outcome {
    ctx.current_file = file;

    match state {
        State::Init | State::DisabledManual | State::DisabledInvalidSettings => Outcome::to(state),
        State::DisabledFileSpecific => Outcome::to(ctx.resting_state()),
        State::Idle => match ctx.eligibility() {
            Eligibility::OutsideAllowedFolder => Outcome::to(State::DisabledFileSpecific),
            _ => Outcome::to(State::Idle),
        },
        // prefix and suffix belonged to the previous file
        State::Queued { .. } | State::Predicting { .. } | State::Suggesting { .. } => {
            match ctx.eligibility() {
                Eligibility::OutsideAllowedFolder => Outcome::to(State::DisabledFileSpecific),
                _ => Outcome::to(State::Idle),
            }
        }
    }
}

fn on_document(state: State, change: DocumentChange, ctx: &mut MachineContext) -> Outcome {
    match state {
        State::Idle => idle_document(change, ctx),
        State::Queued {
            prefix,
            suffix,
            ticket,
        } => {
            if change.breaks_suggestion() {
                return Outcome::to(State::Idle);
            }
            if !change.is_typing() {
                return Outcome::to(State::Queued {
                    prefix,
                    suffix,
                    ticket,
                });
            }
            if let Some(cached) = ctx.cached_suggestion(&change.prefix, &change.suffix) {
                return Outcome::to(State::Suggesting {
                    suggestion: cached,
                    prefix: change.prefix,
                    suffix: change.suffix,
                });
            }
            Outcome::to(State::Queued {
                prefix: change.prefix,
                suffix: change.suffix,
                ticket: ctx.next_ticket(),
            })
        }
        State::Predicting { .. } if change.is_typing() || change.breaks_suggestion() => {
            Outcome::to(State::Idle)
        }
        State::Suggesting {
            suggestion,
            prefix,
            suffix,
        } => suggesting_document(suggestion, prefix, suffix, change, ctx),
        other => Outcome::to(other),
    }
}

fn idle_document(change: DocumentChange, ctx: &mut MachineContext) -> Outcome {
    if !change.doc_in_focus || !change.user_typed {
        return Outcome::to(State::Idle);
    }

    match ctx.eligibility() {
        Eligibility::OutsideAllowedFolder => return Outcome::to(State::DisabledFileSpecific),
        Eligibility::IgnoredPath | Eligibility::IgnoredTag => return Outcome::to(State::Idle),
        Eligibility::Eligible => {}
    }

    if let Some(cached) = ctx.cached_suggestion(&change.prefix, &change.suffix) {
        return Outcome::to(State::Suggesting {
            suggestion: cached,
            prefix: change.prefix,
            suffix: change.suffix,
        });
    }

    match ctx.triggers.first_match(&change.prefix) {
        Some(index) => {
            log::debug!("Trigger #{index} matched");
            Outcome::to(State::Queued {
                prefix: change.prefix,
                suffix: change.suffix,
                ticket: ctx.next_ticket(),
            })
        }
        None => Outcome::to(State::Idle),
    }
}

fn suggesting_document(
    suggestion: String,
    prefix: String,
    suffix: String,
    change: DocumentChange,
    ctx: &mut MachineContext,
) -> Outcome {
    if change.breaks_suggestion() {
        return Outcome::to(State::Idle);
    }
    let unchanged = change.prefix == prefix && change.suffix == suffix;
    if !change.is_typing() || unchanged {
        return Outcome::to(State::Suggesting {
            suggestion,
            prefix,
            suffix,
        });
    }

    if let Some(outcome) = narrow(&suggestion, &prefix, &suffix, &change, ctx) {
        return outcome;
    }

    match ctx.cached_suggestion(&change.prefix, &change.suffix) {
        Some(cached) if cached == suggestion => Outcome::to(State::Suggesting {
            suggestion,
            prefix,
            suffix,
        }),
        Some(cached) => Outcome::to(State::Suggesting {
            suggestion: cached,
            prefix: change.prefix,
            suffix: change.suffix,
        }),
        None => Outcome::to(State::Idle),
    }
}

/// The user typed text that the suggestion already contains at its start
/// and/or end. Strip it and keep suggesting the rest.
fn narrow(
    suggestion: &str,
    old_prefix: &str,
    old_suffix: &str,
    change: &DocumentChange,
    ctx: &mut MachineContext,
) -> Option<Outcome> {
    let added_prefix = change.prefix.strip_prefix(old_prefix)?;
    let added_suffix = change.suffix.strip_suffix(old_suffix)?;
    let after_prefix = strip_prefix_ci(suggestion, added_prefix)?;
    let remaining = strip_suffix_ci(after_prefix, added_suffix)?;

    if remaining.trim().is_empty() {
        return Some(Outcome::to(State::Idle));
    }

    for end in added_prefix
        .char_indices()
        .map(|(idx, ch)| idx + ch.len_utf8())
        .filter(|end| *end < added_prefix.len())
    {
        if let Some(rest) = strip_prefix_ci(suggestion, &added_prefix[..end]) {
            let key_prefix = format!("{old_prefix}{}", &added_prefix[..end]);
            ctx.remember(&key_prefix, old_suffix, rest);
        }
    }
    ctx.remember(&change.prefix, &change.suffix, remaining);

    Some(Outcome::to(State::Suggesting {
        suggestion: remaining.to_string(),
        prefix: change.prefix.clone(),
        suffix: change.suffix.clone(),
    }))
}

/// Cache every split of `accepted` so retyping part of it hits the cache.
fn remember_partials(
    ctx: &mut MachineContext,
    prefix: &str,
    suffix: &str,
    accepted: &str,
    remaining: &str,
) {
    for idx in char_boundaries(accepted) {
        let key_prefix = format!("{prefix}{}", &accepted[..idx]);
        let value = format!("{}{remaining}", &accepted[idx..]);
        ctx.remember(&key_prefix, suffix, &value);
    }
}

fn accept(suggestion: &str, prefix: &str, suffix: &str, ctx: &mut MachineContext) -> Outcome {
    remember_partials(ctx, prefix, suffix, suggestion, "");
    Outcome::to(State::Idle)
        .with(Effect::InsertText(suggestion.to_string()))
        .handled()
}

fn partial_accept(
    suggestion: &str,
    prefix: &str,
    suffix: String,
    ctx: &mut MachineContext,
) -> Outcome {
    let (token, rest) = extract_next_word_and_remaining(suggestion);
    if rest.is_empty() {
        return accept(suggestion, prefix, &suffix, ctx);
    }

    remember_partials(ctx, prefix, &suffix, token, rest);
    Outcome::to(State::Suggesting {
        suggestion: rest.to_string(),
        prefix: format!("{prefix}{token}"),
        suffix,
    })
    .with(Effect::InsertText(token.to_string()))
    .handled()
}

fn resolved(
    prefix: String,
    suffix: String,
    result: Result<String, LinkError>,
    ctx: &mut MachineContext,
) -> Outcome {
    match result {
        Ok(text) if text.trim().is_empty() => Outcome::to(State::Idle),
        Ok(text) => {
            ctx.remember(&prefix, &suffix, &text);
            Outcome::to(State::Suggesting {
                suggestion: text,
                prefix,
                suffix,
            })
        }
        Err(e) if e.is_benign() || matches!(e, LinkError::Connect { .. }) => {
            log::debug!("Prediction unavailable: {e}");
            Outcome::to(State::Idle)
        }
        Err(e) => {
            log::warn!("Prediction failed: {e}");
            Outcome::to(State::Idle).with(Effect::Notify(format!(
                "Quill: could not fetch a suggestion ({e})"
            )))
        }
    }
}

fn lifecycle_effects(
    previous: &State,
    next: &State,
    explicit: Vec<Effect>,
    delay_ms: u64,
) -> Vec<Effect> {
    let mut effects = Vec::with_capacity(explicit.len() + 3);

    if let State::Queued { ticket, .. } = previous {
        if !matches!(next, State::Queued { ticket: t, .. } if t == ticket) {
            effects.push(Effect::CancelDebounce);
        }
    }
    if previous.is_suggesting() && !next.is_suggesting() {
        effects.push(Effect::ClearSuggestion);
    }
    if next.is_disabled() && !previous.is_disabled() {
        effects.push(Effect::TearDownConnection);
    }

    effects.extend(explicit);

    match next {
        State::Queued { ticket, .. } => {
            if !matches!(previous, State::Queued { ticket: t, .. } if t == ticket) {
                effects.push(Effect::ArmDebounce {
                    ticket: *ticket,
                    delay: Duration::from_millis(delay_ms),
                });
            }
        }
        State::Predicting {
            request_id,
            prefix,
            suffix,
        } => {
            if !matches!(previous, State::Predicting { request_id: r, .. } if r == request_id) {
                effects.push(Effect::SendPredict {
                    request_id: request_id.clone(),
                    prefix: prefix.clone(),
                    suffix: suffix.clone(),
                });
            }
        }
        State::Suggesting { suggestion, .. } if previous != next => {
            effects.push(Effect::ShowSuggestion(suggestion.clone()));
        }
        _ => {}
    }

    let status = next.status_text(delay_ms);
    if status != previous.status_text(delay_ms) {
        effects.push(Effect::UpdateStatus(status));
    }

    effects
}

/// Result of [`SuggestionMachine::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub effects: Vec<Effect>,
    pub handled: bool,
}

/// Owns the live [`State`] and the context, and applies events one at a
/// time.
#[derive(Debug)]
pub struct SuggestionMachine {
    state: State,
    ctx: MachineContext,
}

impl SuggestionMachine {
    /// A machine in `Init`. Call [`start`](Self::start) to evaluate the
    /// settings.
    pub fn new(settings: Settings) -> Self {
        Self {
            state: State::Init,
            ctx: MachineContext::new(settings),
        }
    }

    /// Leave `Init` for `Idle` or the matching `Disabled*` state.
    pub fn start(&mut self) -> Transition {
        let settings = self.ctx.settings.clone();
        self.handle(Event::SettingsChanged(settings))
    }

    pub fn handle(&mut self, event: Event) -> Transition {
        let name = event.name();
        let state = std::mem::replace(&mut self.state, State::Init);
        let from = state.name();
        let Step {
            state,
            effects,
            handled,
        } = step(state, event, &mut self.ctx);
        if from != state.name() {
            log::debug!("{name}: {from} -> {}", state.name());
        }
        self.state = state;
        Transition { effects, handled }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn context(&self) -> &MachineContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut MachineContext {
        &mut self.ctx
    }

    pub fn settings(&self) -> &Settings {
        &self.ctx.settings
    }

    pub fn status_text(&self) -> String {
        self.state.status_text(self.ctx.settings.delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(settings: Settings) -> SuggestionMachine {
        let mut machine = SuggestionMachine::new(settings);
        machine.start();
        machine
    }

    fn idle_machine() -> SuggestionMachine {
        let machine = started(Settings::default());
        assert_eq!(machine.state(), &State::Idle);
        machine
    }

    fn suggesting(machine: &mut SuggestionMachine, suggestion: &str, prefix: &str) {
        let request_id = predict(machine, prefix, "");
        machine.handle(Event::PredictionResolved {
            request_id,
            result: Ok(suggestion.to_string()),
        });
        assert_eq!(machine.state().suggestion(), Some(suggestion));
    }

    fn predict(machine: &mut SuggestionMachine, prefix: &str, suffix: &str) -> String {
        machine.handle(Event::PredictCommand {
            prefix: prefix.into(),
            suffix: suffix.into(),
        });
        match machine.state() {
            State::Predicting { request_id, .. } => request_id.clone(),
            other => panic!("expected predicting, got {other:?}"),
        }
    }

    fn queued_ticket(machine: &SuggestionMachine) -> u64 {
        match machine.state() {
            State::Queued { ticket, .. } => *ticket,
            other => panic!("expected queued, got {other:?}"),
        }
    }

    fn has_send(effects: &[Effect]) -> bool {
        effects.iter().any(|e| matches!(e, Effect::SendPredict { .. }))
    }

    #[test]
    fn test_start_states() {
        assert_eq!(started(Settings::default()).state(), &State::Idle);

        let disabled = Settings {
            enabled: false,
            ..Settings::default()
        };
        assert_eq!(started(disabled).state(), &State::DisabledManual);

        let invalid = Settings {
            delay_ms: 10_000,
            ..Settings::default()
        };
        assert_eq!(started(invalid).state(), &State::DisabledInvalidSettings);
    }

    #[test]
    fn test_scenario_trigger_debounce_predict_accept() {
        let mut machine = idle_machine();

        let t = machine.handle(Event::DocumentChanged(DocumentChange::typed("# ", "")));
        let ticket = queued_ticket(&machine);
        assert!(t.effects.contains(&Effect::ArmDebounce {
            ticket,
            delay: Duration::from_millis(500)
        }));
        assert!(t.effects.contains(&Effect::UpdateStatus("Quill: Queued (500 ms)".into())));

        let t = machine.handle(Event::DebounceElapsed { ticket });
        let request_id = match machine.state() {
            State::Predicting { request_id, prefix, .. } => {
                assert_eq!(prefix, "# ");
                request_id.clone()
            }
            other => panic!("expected predicting, got {other:?}"),
        };
        assert!(t.effects.contains(&Effect::SendPredict {
            request_id: request_id.clone(),
            prefix: "# ".into(),
            suffix: String::new(),
        }));

        let t = machine.handle(Event::PredictionResolved {
            request_id,
            result: Ok("Hello".into()),
        });
        assert_eq!(machine.state().suggestion(), Some("Hello"));
        assert!(t.effects.contains(&Effect::ShowSuggestion("Hello".into())));

        let t = machine.handle(Event::AcceptKey);
        assert!(t.handled);
        assert_eq!(machine.state(), &State::Idle);
        assert_eq!(
            t.effects,
            vec![
                Effect::ClearSuggestion,
                Effect::InsertText("Hello".into()),
                Effect::UpdateStatus("Quill: Idle".into()),
            ]
        );
    }

    #[test]
    fn test_scenario_delete_while_queued() {
        let mut machine = idle_machine();
        machine.handle(Event::DocumentChanged(DocumentChange::typed("# ", "")));
        let ticket = queued_ticket(&machine);

        let t = machine.handle(Event::DocumentChanged(DocumentChange::deleted("#", "")));
        assert_eq!(machine.state(), &State::Idle);
        assert!(t.effects.contains(&Effect::CancelDebounce));

        let t = machine.handle(Event::DebounceElapsed { ticket });
        assert_eq!(machine.state(), &State::Idle);
        assert!(!has_send(&t.effects));
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_scenario_cursor_move_while_predicting() {
        let mut machine = idle_machine();
        let request_id = predict(&mut machine, "abc", "");

        machine.handle(Event::DocumentChanged(DocumentChange::cursor_moved("ab", "c")));
        assert_eq!(machine.state(), &State::Idle);

        let t = machine.handle(Event::PredictionResolved {
            request_id,
            result: Ok("late".into()),
        });
        assert_eq!(machine.state(), &State::Idle);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_stale_response_for_same_context_ignored() {
        let mut machine = idle_machine();
        let first = predict(&mut machine, "same", "ctx");
        let t = machine.handle(Event::CancelKey);
        assert!(t.handled);

        let second = predict(&mut machine, "same", "ctx");
        assert_ne!(first, second);

        let t = machine.handle(Event::PredictionResolved {
            request_id: first,
            result: Ok("stale".into()),
        });
        assert!(t.effects.is_empty());
        assert!(matches!(machine.state(), State::Predicting { request_id, .. } if *request_id == second));

        machine.handle(Event::PredictionResolved {
            request_id: second,
            result: Ok("fresh".into()),
        });
        assert_eq!(machine.state().suggestion(), Some("fresh"));
    }

    #[test]
    fn test_scenario_narrowing() {
        let mut machine = idle_machine();
        suggesting(&mut machine, "world peace", "Hello ");

        let t = machine.handle(Event::DocumentChanged(DocumentChange::typed("Hello world ", "")));
        assert_eq!(
            machine.state(),
            &State::Suggesting {
                suggestion: "peace".into(),
                prefix: "Hello world ".into(),
                suffix: String::new(),
            }
        );
        assert!(t.effects.contains(&Effect::ShowSuggestion("peace".into())));
        assert!(!t.effects.contains(&Effect::ClearSuggestion));

        let ctx = machine.context_mut();
        assert_eq!(ctx.cached_suggestion("Hello world ", ""), Some("peace".into()));
        assert_eq!(ctx.cached_suggestion("Hello w", ""), Some("orld peace".into()));
    }

    #[test]
    fn test_narrowing_is_case_insensitive() {
        let mut machine = idle_machine();
        suggesting(&mut machine, "world peace", "Hello ");

        machine.handle(Event::DocumentChanged(DocumentChange::typed("Hello WORLD ", "")));
        assert_eq!(machine.state().suggestion(), Some("peace"));
    }

    #[test]
    fn test_narrowing_with_added_suffix() {
        let mut machine = idle_machine();
        suggesting(&mut machine, "(x)", "call");

        machine.handle(Event::DocumentChanged(DocumentChange::typed("call(", ")")));
        assert_eq!(
            machine.state(),
            &State::Suggesting {
                suggestion: "x".into(),
                prefix: "call(".into(),
                suffix: ")".into(),
            }
        );
    }

    #[test]
    fn test_typing_whole_suggestion_goes_idle() {
        let mut machine = idle_machine();
        suggesting(&mut machine, "done", "all ");

        let t = machine.handle(Event::DocumentChanged(DocumentChange::typed("all done", "")));
        assert_eq!(machine.state(), &State::Idle);
        assert!(t.effects.contains(&Effect::ClearSuggestion));
    }

    #[test]
    fn test_unrelated_edit_clears_suggestion() {
        let mut machine = idle_machine();
        suggesting(&mut machine, "world", "Hello ");

        let t = machine.handle(Event::DocumentChanged(DocumentChange::typed("Hello x", "")));
        assert_eq!(machine.state(), &State::Idle);
        assert!(t.effects.contains(&Effect::ClearSuggestion));
    }

    #[test]
    fn test_partial_accept_then_finish() {
        let mut machine = idle_machine();
        suggesting(&mut machine, "world peace", "Hello ");

        let t = machine.handle(Event::PartialAcceptKey);
        assert!(t.handled);
        assert_eq!(
            t.effects,
            vec![
                Effect::InsertText("world ".into()),
                Effect::ShowSuggestion("peace".into()),
            ]
        );
        assert_eq!(
            machine.state(),
            &State::Suggesting {
                suggestion: "peace".into(),
                prefix: "Hello world ".into(),
                suffix: String::new(),
            }
        );
        assert_eq!(
            machine.context_mut().cached_suggestion("Hello wor", ""),
            Some("ld peace".into())
        );

        // the editor echoes the insertion back; nothing changes
        let t = machine.handle(Event::DocumentChanged(DocumentChange::typed("Hello world ", "")));
        assert!(t.effects.is_empty());

        let t = machine.handle(Event::PartialAcceptKey);
        assert!(t.effects.contains(&Effect::InsertText("peace".into())));
        assert_eq!(machine.state(), &State::Idle);
    }

    #[test]
    fn test_accept_caches_sub_suggestions() {
        let mut machine = idle_machine();
        suggesting(&mut machine, "abc", "x");
        machine.handle(Event::AcceptKey);

        let ctx = machine.context_mut();
        assert_eq!(ctx.cached_suggestion("x", ""), Some("abc".into()));
        assert_eq!(ctx.cached_suggestion("xa", ""), Some("bc".into()));
        assert_eq!(ctx.cached_suggestion("xab", ""), Some("c".into()));
        assert_eq!(ctx.cached_suggestion("xabc", ""), None);
    }

    #[test]
    fn test_cache_hit_in_idle_skips_request() {
        let mut machine = idle_machine();
        suggesting(&mut machine, "abc", "x");
        machine.handle(Event::AcceptKey);

        let t = machine.handle(Event::DocumentChanged(DocumentChange::typed("xa", "")));
        assert_eq!(machine.state().suggestion(), Some("bc"));
        assert!(!has_send(&t.effects));
    }

    #[test]
    fn test_cache_hit_while_queued() {
        let mut machine = idle_machine();
        suggesting(&mut machine, "world", "Say: ");
        machine.handle(Event::AcceptKey);

        machine.handle(Event::DocumentChanged(DocumentChange::typed("# ", "")));
        queued_ticket(&machine);

        let t = machine.handle(Event::DocumentChanged(DocumentChange::typed("Say: wo", "")));
        assert_eq!(machine.state().suggestion(), Some("rld"));
        assert!(t.effects.contains(&Effect::CancelDebounce));
    }

    #[test]
    fn test_retyping_rearms_debounce() {
        let mut machine = idle_machine();
        machine.handle(Event::DocumentChanged(DocumentChange::typed("# ", "")));
        let first = queued_ticket(&machine);

        let t = machine.handle(Event::DocumentChanged(DocumentChange::typed("# a", "")));
        let second = queued_ticket(&machine);
        assert_ne!(first, second);
        assert!(t.effects.contains(&Effect::CancelDebounce));
        assert!(t.effects.contains(&Effect::ArmDebounce {
            ticket: second,
            delay: Duration::from_millis(500)
        }));

        machine.handle(Event::DebounceElapsed { ticket: first });
        assert_eq!(queued_ticket(&machine), second);

        machine.handle(Event::DebounceElapsed { ticket: second });
        assert!(matches!(machine.state(), State::Predicting { prefix, .. } if prefix == "# a"));
    }

    #[test]
    fn test_no_trigger_stays_idle() {
        let mut machine = idle_machine();
        let t = machine.handle(Event::DocumentChanged(DocumentChange::typed("plain", "")));
        assert_eq!(machine.state(), &State::Idle);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_cancel_in_suggesting_clears_cache() {
        let mut machine = idle_machine();
        suggesting(&mut machine, "abc", "x");
        assert!(!machine.context().cache().is_empty());

        let t = machine.handle(Event::CancelKey);
        assert!(t.handled);
        assert!(t.effects.contains(&Effect::ClearSuggestion));
        assert!(machine.context().cache().is_empty());
    }

    #[test]
    fn test_keys_not_handled_when_idle() {
        let mut machine = idle_machine();
        assert!(!machine.handle(Event::AcceptKey).handled);
        assert!(!machine.handle(Event::PartialAcceptKey).handled);
        assert!(!machine.handle(Event::CancelKey).handled);
    }

    #[test]
    fn test_empty_prediction_goes_idle() {
        let mut machine = idle_machine();
        let request_id = predict(&mut machine, "a", "");
        let t = machine.handle(Event::PredictionResolved {
            request_id,
            result: Ok("  \n".into()),
        });
        assert_eq!(machine.state(), &State::Idle);
        assert!(!t.effects.iter().any(|e| matches!(e, Effect::Notify(_))));
    }

    #[test]
    fn test_server_error_notifies() {
        let mut machine = idle_machine();
        let request_id = predict(&mut machine, "a", "");
        let t = machine.handle(Event::PredictionResolved {
            request_id,
            result: Err(LinkError::Server {
                code: 500,
                message: "boom".into(),
            }),
        });
        assert_eq!(machine.state(), &State::Idle);
        assert!(t.effects.iter().any(|e| matches!(e, Effect::Notify(msg) if msg.contains("boom"))));
    }

    #[test]
    fn test_benign_error_is_silent() {
        let mut machine = idle_machine();
        let request_id = predict(&mut machine, "a", "");
        let t = machine.handle(Event::PredictionResolved {
            request_id,
            result: Err(LinkError::NoSession),
        });
        assert_eq!(machine.state(), &State::Idle);
        assert!(!t.effects.iter().any(|e| matches!(e, Effect::Notify(_))));
    }

    #[test]
    fn test_ignored_path_suppresses_trigger() {
        let mut machine = idle_machine();
        machine.handle(Event::FileChanged(Some(FileInfo::new("notes/secret/plan.md"))));
        let t = machine.handle(Event::DocumentChanged(DocumentChange::typed("# ", "")));
        assert_eq!(machine.state(), &State::Idle);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_ignored_tag_suppresses_trigger() {
        let mut machine = started(Settings {
            ignored_tags: vec!["private".into()],
            ..Settings::default()
        });
        machine.handle(Event::FileChanged(Some(
            FileInfo::new("a.md").with_tags(["#Private"]),
        )));
        machine.handle(Event::DocumentChanged(DocumentChange::typed("# ", "")));
        assert_eq!(machine.state(), &State::Idle);
    }

    #[test]
    fn test_allowed_folder_disables_file_and_recovers() {
        let mut machine = started(Settings {
            allowed_folder: Some("work".into()),
            ..Settings::default()
        });

        let t = machine.handle(Event::FileChanged(Some(FileInfo::new("personal/a.md"))));
        assert_eq!(machine.state(), &State::DisabledFileSpecific);
        assert!(t.effects.contains(&Effect::TearDownConnection));
        assert!(t.effects.contains(&Effect::UpdateStatus("Quill: Disabled for this file".into())));

        machine.handle(Event::DocumentChanged(DocumentChange::typed("# ", "")));
        assert_eq!(machine.state(), &State::DisabledFileSpecific);

        machine.handle(Event::FileChanged(Some(FileInfo::new("work/a.md"))));
        assert_eq!(machine.state(), &State::Idle);
    }

    #[test]
    fn test_file_specific_to_manual_when_disabled() {
        let mut machine = started(Settings {
            allowed_folder: Some("work".into()),
            ..Settings::default()
        });
        machine.handle(Event::FileChanged(Some(FileInfo::new("other/a.md"))));
        machine.handle(Event::SettingsChanged(Settings {
            enabled: false,
            allowed_folder: Some("work".into()),
            ..Settings::default()
        }));
        assert_eq!(machine.state(), &State::DisabledManual);
    }

    #[test]
    fn test_toggle_enabled() {
        let mut machine = idle_machine();
        machine.handle(Event::DocumentChanged(DocumentChange::typed("# ", "")));

        let t = machine.handle(Event::SettingsChanged(Settings {
            enabled: false,
            ..Settings::default()
        }));
        assert_eq!(machine.state(), &State::DisabledManual);
        assert!(t.effects.contains(&Effect::CancelDebounce));
        assert!(t.effects.contains(&Effect::TearDownConnection));

        machine.handle(Event::SettingsChanged(Settings::default()));
        assert_eq!(machine.state(), &State::Idle);
    }

    #[test]
    fn test_invalid_settings_disable_until_fixed() {
        let mut machine = idle_machine();
        machine.handle(Event::SettingsChanged(Settings {
            server_url: "http://nope".into(),
            ..Settings::default()
        }));
        assert_eq!(machine.state(), &State::DisabledInvalidSettings);
        assert_eq!(machine.status_text(), "Quill: Disabled (invalid settings)");

        machine.handle(Event::SettingsChanged(Settings::default()));
        assert_eq!(machine.state(), &State::Idle);
    }

    #[test]
    fn test_disabling_cache_while_suggesting() {
        let mut machine = idle_machine();
        suggesting(&mut machine, "abc", "x");

        let t = machine.handle(Event::SettingsChanged(Settings {
            cache_suggestions: false,
            ..Settings::default()
        }));
        assert_eq!(machine.state(), &State::Idle);
        assert!(t.effects.contains(&Effect::ClearSuggestion));
        assert!(machine.context().cache().is_empty());
    }

    #[test]
    fn test_caching_disabled_skips_cache() {
        let mut machine = started(Settings {
            cache_suggestions: false,
            ..Settings::default()
        });
        suggesting(&mut machine, "abc", "x");
        machine.handle(Event::AcceptKey);
        assert!(machine.context().cache().is_empty());
    }

    #[test]
    fn test_file_change_abandons_queue() {
        let mut machine = idle_machine();
        machine.handle(Event::DocumentChanged(DocumentChange::typed("# ", "")));
        let t = machine.handle(Event::FileChanged(Some(FileInfo::new("other.md"))));
        assert_eq!(machine.state(), &State::Idle);
        assert!(t.effects.contains(&Effect::CancelDebounce));
    }
}
