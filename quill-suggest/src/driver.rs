//! Runs a [`SuggestionMachine`] on a tokio task and carries out its
//! effects: debounce timers, predict requests over a [`Hub`] connection,
//! and calls into the host editor.
//!
//! All events, including timer expiries and responses, are funnelled
//! through one task so the machine never sees two events at once.

use std::sync::Arc;
use std::time::Duration;

use quill_core::{FileInfo, Settings};
use quill_link::{Hub, LinkConfig, LinkError, PredictRequest};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::event::{DocumentChange, Event};
use crate::machine::{Effect, SuggestionMachine};
use crate::state::State;

/// Consecutive connect failures before the user is told.
pub const CONNECT_FAILURE_NOTICE_THRESHOLD: u32 = 3;

/// What the driver needs from the editor. Calls happen on the driver
/// task, one at a time.
pub trait EditorSurface: Send + 'static {
    fn show_suggestion(&mut self, text: &str);
    fn clear_suggestion(&mut self);
    fn insert_text(&mut self, text: &str);
    fn set_status(&mut self, text: &str);
    fn notify(&mut self, message: &str);
}

enum Command {
    Event(Event),
    Key {
        event: Event,
        reply: oneshot::Sender<bool>,
    },
    Inspect(oneshot::Sender<State>),
    Shutdown,
}

enum Internal {
    Event(Event),
    Connected {
        generation: u64,
        result: Result<(), LinkError>,
    },
}

/// Cheap handle for feeding the driver from editor callbacks.
#[derive(Clone)]
pub struct DriverHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl DriverHandle {
    pub fn document_changed(&self, change: DocumentChange) {
        self.post(Event::DocumentChanged(change));
    }

    pub fn predict(&self, prefix: impl Into<String>, suffix: impl Into<String>) {
        self.post(Event::PredictCommand {
            prefix: prefix.into(),
            suffix: suffix.into(),
        });
    }

    pub fn settings_changed(&self, settings: Settings) {
        self.post(Event::SettingsChanged(settings));
    }

    pub fn file_changed(&self, file: Option<FileInfo>) {
        self.post(Event::FileChanged(file));
    }

    /// Returns whether the key was consumed. `false` lets the editor
    /// apply its default binding.
    pub async fn accept(&self) -> bool {
        self.key(Event::AcceptKey).await
    }

    pub async fn partial_accept(&self) -> bool {
        self.key(Event::PartialAcceptKey).await
    }

    pub async fn cancel(&self) -> bool {
        self.key(Event::CancelKey).await
    }

    /// Current machine state, or `None` once the driver has stopped.
    pub async fn state(&self) -> Option<State> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Inspect(reply)).ok()?;
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn post(&self, event: Event) {
        if self.commands.send(Command::Event(event)).is_err() {
            log::debug!("Suggestion driver stopped; event dropped");
        }
    }

    async fn key(&self, event: Event) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Key { event, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

/// Owns the machine, the editor and the backend link.
pub struct SuggestionDriver<E: EditorSurface> {
    machine: SuggestionMachine,
    editor: E,
    hub: Arc<Hub>,
    /// Bumped whenever the hub is replaced; stale connect results are
    /// ignored.
    generation: u64,
    connecting: bool,
    connect_failures: u32,
    failure_noticed: bool,
    debounce: Option<JoinHandle<()>>,
    internal: mpsc::UnboundedSender<Internal>,
}

impl<E: EditorSurface> SuggestionDriver<E> {
    fn new(settings: Settings, editor: E, internal: mpsc::UnboundedSender<Internal>) -> Self {
        let hub = Arc::new(Hub::new(link_config(&settings)));
        Self {
            machine: SuggestionMachine::new(settings),
            editor,
            hub,
            generation: 0,
            connecting: false,
            connect_failures: 0,
            failure_noticed: false,
            debounce: None,
            internal,
        }
    }

    /// Start the driver on the current runtime.
    pub fn spawn(settings: Settings, editor: E) -> (DriverHandle, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal, internal_rx) = mpsc::unbounded_channel();
        let driver = Self::new(settings, editor, internal);
        let task = tokio::spawn(driver.run(command_rx, internal_rx));
        (DriverHandle { commands }, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let started = self.machine.start();
        self.apply_all(started.effects);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Event(event)) => {
                        self.dispatch(event);
                    }
                    Some(Command::Key { event, reply }) => {
                        let handled = self.dispatch(event);
                        let _ = reply.send(handled);
                    }
                    Some(Command::Inspect(reply)) => {
                        let _ = reply.send(self.machine.state().clone());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(message) = internal.recv() => match message {
                    Internal::Event(event) => {
                        self.dispatch(event);
                    }
                    Internal::Connected { generation, result } => {
                        self.on_connected(generation, result);
                    }
                },
            }
        }

        self.cancel_debounce();
        let key = self.server_url().to_string();
        self.hub.terminate_connection(&key).await;
        log::debug!("Suggestion driver stopped");
    }

    fn server_url(&self) -> &str {
        &self.machine.settings().server_url
    }

    fn dispatch(&mut self, event: Event) -> bool {
        if let Event::SettingsChanged(settings) = &event {
            self.reconfigure(settings);
        }

        let prewarm = matches!(event, Event::DocumentChanged(_));
        let transition = self.machine.handle(event);
        self.apply_all(transition.effects);

        if prewarm && !self.machine.state().is_disabled() {
            self.ensure_connection();
        }
        transition.handled
    }

    fn apply_all(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            self.apply(effect);
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::ArmDebounce { ticket, delay } => {
                self.cancel_debounce();
                let tx = self.internal.clone();
                self.debounce = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Internal::Event(Event::DebounceElapsed { ticket }));
                }));
            }
            Effect::CancelDebounce => self.cancel_debounce(),
            Effect::SendPredict {
                request_id,
                prefix,
                suffix,
            } => self.send_predict(request_id, prefix, suffix),
            Effect::ShowSuggestion(text) => self.editor.show_suggestion(&text),
            Effect::ClearSuggestion => self.editor.clear_suggestion(),
            Effect::InsertText(text) => self.editor.insert_text(&text),
            Effect::UpdateStatus(text) => self.editor.set_status(&text),
            Effect::Notify(message) => self.editor.notify(&message),
            Effect::TearDownConnection => {
                let hub = Arc::clone(&self.hub);
                let key = self.server_url().to_string();
                tokio::spawn(async move { hub.terminate_connection(&key).await });
            }
        }
    }

    fn cancel_debounce(&mut self) {
        if let Some(timer) = self.debounce.take() {
            timer.abort();
        }
    }

    fn send_predict(&mut self, request_id: String, prefix: String, suffix: String) {
        let hub = Arc::clone(&self.hub);
        let key = self.server_url().to_string();
        let tx = self.internal.clone();

        tokio::spawn(async move {
            let result = async {
                let conn = hub.get_connection(&key).await?;
                let session = conn.wait_for_session(hub.config().session_timeout).await?;
                let request = PredictRequest::new(Some(session), prefix, suffix)
                    .with_id(request_id.as_str());
                let response = conn.send(request).await?;
                Ok::<_, LinkError>(response.prediction.unwrap_or_default())
            }
            .await;
            let _ = tx.send(Internal::Event(Event::PredictionResolved { request_id, result }));
        });
    }

    /// Open the connection ahead of the first request. Only these
    /// attempts count towards the failure notice; a predict that fails to
    /// connect shares the same hub attempt.
    fn ensure_connection(&mut self) {
        let key = self.server_url().to_string();
        if self.connecting || self.hub.contains(&key) {
            return;
        }
        self.connecting = true;

        let hub = Arc::clone(&self.hub);
        let tx = self.internal.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = hub.get_connection(&key).await.map(|_| ());
            let _ = tx.send(Internal::Connected { generation, result });
        });
    }

    fn on_connected(&mut self, generation: u64, result: Result<(), LinkError>) {
        if generation != self.generation {
            return;
        }
        self.connecting = false;
        match result {
            Ok(()) => {
                self.connect_failures = 0;
                self.failure_noticed = false;
            }
            Err(e) => self.record_connect_failure(&e),
        }
    }

    fn record_connect_failure(&mut self, e: &LinkError) {
        self.connect_failures += 1;
        log::warn!(
            "Connect to {} failed ({} in a row): {}",
            self.server_url(),
            self.connect_failures,
            e
        );
        if self.connect_failures >= CONNECT_FAILURE_NOTICE_THRESHOLD && !self.failure_noticed {
            self.failure_noticed = true;
            let message = format!(
                "Quill: cannot reach the completion server at {}",
                self.server_url()
            );
            self.editor.notify(&message);
        }
    }

    /// Swap the hub when connection parameters change.
    fn reconfigure(&mut self, settings: &Settings) {
        let config = link_config(settings);
        if &config == self.hub.config() {
            return;
        }

        let old_hub = std::mem::replace(&mut self.hub, Arc::new(Hub::new(config)));
        let old_key = self.server_url().to_string();
        tokio::spawn(async move { old_hub.terminate_connection(&old_key).await });

        self.generation += 1;
        self.connecting = false;
        self.connect_failures = 0;
        self.failure_noticed = false;
    }
}

fn link_config(settings: &Settings) -> LinkConfig {
    LinkConfig::new(settings.server_url.clone())
        .with_idle_timeout(settings.idle_timeout())
        .with_request_timeout(settings.request_timeout().max(Duration::from_millis(1)))
}
