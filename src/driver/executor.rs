//! Stream driver task

use super::callbacks::StreamCallbacks;
use super::health::ConnectionHealth;
use super::session::{Admission, StreamSession};
use super::{Command, StoreOp, StreamOptions, StreamStatus};
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::mode::{Mode, ModeMachine};
use crate::protocol::{DeltaFrame, DoneFrame, Frame};
use crate::store::{Outcome, PerformanceSummary, TurnStore};
use crate::timer::Timer;
use crate::transport::{FrameSource, StreamRequest, TransportEvent, TransportGuard, TransportSignal};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Deferred work queued by the stream's timers
#[derive(Debug, Clone, Copy)]
enum TimerEvent {
    RetryDue { generation: u64 },
    HealthTick { generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Streaming,
    RetryWaiting,
}

/// The stream currently owned by the driver
struct ActiveStream {
    /// Distinguishes this stream's timer events from earlier streams'
    generation: u64,
    turn_id: String,
    prompt: String,
    callbacks: Box<dyn StreamCallbacks>,
    phase: Phase,
    /// Retries used so far
    attempt: u32,
    started_at: Instant,
    first_fragment_at: Option<Instant>,
    fragments: u32,
    dropped_fragments: u32,
    evidence: Option<Value>,
    retry_timer: Option<Timer>,
    _health_timer: Timer,
}

impl ActiveStream {
    fn performance(&self, characters: usize) -> PerformanceSummary {
        PerformanceSummary {
            elapsed_ms: millis(self.started_at.elapsed()),
            time_to_first_fragment_ms: self
                .first_fragment_at
                .map(|at| millis(at.duration_since(self.started_at))),
            fragments: self.fragments,
            dropped_fragments: self.dropped_fragments,
            retries: self.attempt,
            characters,
        }
    }
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub(super) struct StreamDriver<S: FrameSource + 'static> {
    config: StreamConfig,
    source: Arc<S>,
    mode: Arc<ModeMachine>,
    guard: TransportGuard,
    signal_rx: mpsc::UnboundedReceiver<TransportSignal>,
    command_rx: mpsc::Receiver<Command>,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
    timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    status_tx: watch::Sender<StreamStatus>,
    store_tx: watch::Sender<TurnStore>,
    session: StreamSession,
    store: TurnStore,
    active: Option<ActiveStream>,
    health: ConnectionHealth,
    next_generation: u64,
}

impl<S: FrameSource + 'static> StreamDriver<S> {
    pub(super) fn new(
        config: StreamConfig,
        session_id: String,
        source: Arc<S>,
        mode: Arc<ModeMachine>,
        command_rx: mpsc::Receiver<Command>,
        status_tx: watch::Sender<StreamStatus>,
        store_tx: watch::Sender<TurnStore>,
    ) -> Self {
        let (guard, signal_rx) = TransportGuard::new(config.inactivity_timeout);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let store = store_tx.borrow().clone();
        Self {
            config,
            source,
            mode,
            guard,
            signal_rx,
            command_rx,
            timer_tx,
            timer_rx,
            status_tx,
            store_tx,
            session: StreamSession::new(session_id),
            store,
            active: None,
            health: ConnectionHealth::Healthy,
            next_generation: 0,
        }
    }

    pub(super) async fn run(mut self) {
        tracing::info!(session_id = %self.session.session_id, "Starting stream driver");

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(signal) = self.signal_rx.recv() => {
                    if let Some(event) = self.guard.filter(signal) {
                        self.handle_transport(event);
                    }
                }
                Some(event) = self.timer_rx.recv() => self.handle_timer(event),
            }
        }

        self.stop();
        tracing::info!(session_id = %self.session.session_id, "Stream driver stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                prompt,
                options,
                callbacks,
                reply,
            } => {
                let result = self.start(prompt, options, callbacks);
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            Command::Store { op, reply } => {
                let outcome = self.edit_store(op);
                let _ = reply.send(outcome);
            }
        }
    }

    // ------------------------------------------------------------------
    // Stream lifecycle
    // ------------------------------------------------------------------

    fn start(
        &mut self,
        prompt: String,
        options: StreamOptions,
        mut callbacks: Box<dyn StreamCallbacks>,
    ) -> Result<String, StreamError> {
        let turn_id = options
            .turn_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(active) = &self.active {
            if active.turn_id == turn_id {
                tracing::warn!(turn_id = %turn_id, "Stream already running for turn");
                return Err(StreamError::invalid_request(format!(
                    "a stream is already running for turn {turn_id}"
                )));
            }
        }
        if self.store.get(&turn_id).is_some_and(|t| t.is_final()) {
            return Err(StreamError::invalid_request(format!(
                "turn {turn_id} is already final"
            )));
        }

        if let Some(previous) = self.active.take() {
            tracing::info!(
                turn_id = %previous.turn_id,
                next_turn_id = %turn_id,
                "Superseding running stream"
            );
            self.cancel_stream(previous);
        }

        let (store, _) = self.store.add_placeholder(&turn_id);
        self.replace_store(store);
        self.session.begin_turn();

        let Some(uid) = self.config.uid.clone() else {
            let error = StreamError::auth("no caller identity configured");
            tracing::error!(turn_id = %turn_id, "Cannot open stream without a uid");
            let (store, _) = self.store.set_error(&turn_id, &error.message);
            self.replace_store(store);
            self.drive_mode(Mode::Error, "missing identity");
            self.health = ConnectionHealth::Unhealthy;
            self.publish_status();
            callbacks.on_error(&error);
            return Err(error);
        };

        self.drive_mode(Mode::Thinking, "stream started");

        self.next_generation += 1;
        let generation = self.next_generation;
        let health_tx = self.timer_tx.clone();
        let health_timer = Timer::repeating(self.config.health.poll_interval, move || {
            let _ = health_tx.send(TimerEvent::HealthTick { generation });
        });

        tracing::info!(turn_id = %turn_id, uid = %uid, "Starting stream");
        self.active = Some(ActiveStream {
            generation,
            turn_id: turn_id.clone(),
            prompt,
            callbacks,
            phase: Phase::Connecting,
            attempt: 0,
            started_at: Instant::now(),
            first_fragment_at: None,
            fragments: 0,
            dropped_fragments: 0,
            evidence: None,
            retry_timer: None,
            _health_timer: health_timer,
        });
        self.health = ConnectionHealth::Healthy;
        self.open_transport(&uid);
        self.publish_status();
        Ok(turn_id)
    }

    /// Open (or reopen after a failure) the transport for the active stream
    fn open_transport(&mut self, uid: &str) {
        let Some(active) = &self.active else { return };
        let turn_id = active.turn_id.clone();
        let attempt = active.attempt;
        let request = StreamRequest {
            session_id: self.session.session_id.clone(),
            prompt: active.prompt.clone(),
            uid: uid.to_string(),
            client_message_id: turn_id.clone(),
            expand: self.config.expand,
        };
        let url = match request.url(&self.config.base_url) {
            Ok(url) => url,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        let key = self.session.transport_key(&turn_id);
        let source = Arc::clone(&self.source);
        let opened = self
            .guard
            .start_exclusive(&key, move || async move { source.open(url).await });
        if let Some(transport) = opened {
            tracing::debug!(transport = %transport, key = %key, attempt, "Connecting");
        }
    }

    fn stop(&mut self) {
        match self.active.take() {
            Some(active) => {
                tracing::info!(turn_id = %active.turn_id, "Stopping stream");
                self.cancel_stream(active);
                self.drive_mode(Mode::Idle, "stream stopped");
                self.publish_status();
            }
            None => self.release_transport(),
        }
    }

    /// Close a stream the caller no longer wants, keeping its buffered text
    fn cancel_stream(&mut self, mut active: ActiveStream) {
        self.release_transport();
        let buffered = self
            .store
            .get(&active.turn_id)
            .map_or(0, |t| t.buffered_text.chars().count());
        let performance = active.performance(buffered);
        let (store, _) = self.store.finalize(
            &active.turn_id,
            None,
            Some(performance),
            active.evidence.take(),
        );
        self.replace_store(store);
        self.health = ConnectionHealth::Healthy;
        active.callbacks.on_cancelled();
    }

    fn complete(&mut self, done: DoneFrame) {
        let Some(mut active) = self.active.take() else { return };
        self.release_transport();

        let characters = match &done.full {
            Some(full) => full.chars().count(),
            None => self
                .store
                .get(&active.turn_id)
                .map_or(0, |t| t.buffered_text.chars().count()),
        };
        let performance = active.performance(characters);
        tracing::info!(
            turn_id = %active.turn_id,
            elapsed_ms = performance.elapsed_ms,
            fragments = performance.fragments,
            dropped = performance.dropped_fragments,
            retries = performance.retries,
            "Stream complete"
        );

        let (store, outcome) = self.store.finalize(
            &active.turn_id,
            done.full,
            Some(performance),
            active.evidence.take(),
        );
        if outcome == Outcome::NoOp {
            tracing::debug!(turn_id = %active.turn_id, "Turn was already final at completion");
        }
        self.replace_store(store);
        self.health = ConnectionHealth::Healthy;
        self.drive_mode(Mode::Idle, "stream complete");
        self.publish_status();

        if let Some(turn) = self.store.get(&active.turn_id) {
            active.callbacks.on_complete(turn);
        }
    }

    /// Retry a retryable failure while budget remains, otherwise give up
    fn handle_failure(&mut self, error: StreamError) {
        let retry = self.config.retry;
        let Some(active) = self.active.as_mut() else { return };

        if !error.is_retryable() {
            self.fail(error);
            return;
        }
        if !retry.allows_retry(active.attempt) {
            let exhausted = StreamError::retries_exhausted(active.attempt, &error);
            self.fail(exhausted);
            return;
        }

        let delay = retry.delay_for(active.attempt);
        active.attempt += 1;
        active.phase = Phase::RetryWaiting;
        tracing::warn!(
            turn_id = %active.turn_id,
            attempt = active.attempt,
            delay_ms = millis(delay),
            error = %error,
            "Stream failed, retrying"
        );

        let attempt = active.attempt;
        let generation = active.generation;
        let retry_tx = self.timer_tx.clone();
        active.retry_timer = Some(Timer::once(delay, move || {
            let _ = retry_tx.send(TimerEvent::RetryDue { generation });
        }));

        self.release_transport();
        self.health = ConnectionHealth::Unhealthy;
        self.publish_status();
        if let Some(active) = self.active.as_mut() {
            active.callbacks.on_retry(attempt, delay, &error);
        }
    }

    /// End the active stream with a terminal error
    fn fail(&mut self, error: StreamError) {
        let Some(mut active) = self.active.take() else { return };
        self.release_transport();

        tracing::error!(
            turn_id = %active.turn_id,
            kind = ?error.kind,
            retries = active.attempt,
            error = %error,
            "Stream failed"
        );
        let (store, _) = self.store.set_error(&active.turn_id, &error.message);
        self.replace_store(store);
        self.health = ConnectionHealth::Unhealthy;
        self.drive_mode(Mode::Error, "stream failed");
        self.publish_status();
        active.callbacks.on_error(&error);
    }

    fn release_transport(&mut self) {
        self.guard.cancel();
    }

    // ------------------------------------------------------------------
    // Inbound events
    // ------------------------------------------------------------------

    fn handle_transport(&mut self, event: TransportEvent) {
        if self.active.is_none() {
            return;
        }
        match event {
            TransportEvent::Frame(frame) => self.handle_frame(frame),
            TransportEvent::Failed(error) => self.handle_failure(error),
            TransportEvent::Closed => {
                self.handle_failure(StreamError::connection("stream closed before done"));
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        self.session.touch();
        let Some(active) = self.active.as_mut() else { return };
        if active.phase == Phase::Connecting {
            active.phase = Phase::Streaming;
            self.health = ConnectionHealth::Healthy;
            self.publish_status();
        }

        if matches!(frame, Frame::Open | Frame::Ping | Frame::Meta(_) | Frame::Limit(_)) {
            self.mode.heartbeat();
        }

        match frame {
            Frame::Open => {
                if let Some(active) = self.active.as_mut() {
                    active.callbacks.on_open();
                }
            }
            Frame::Ping => {}
            Frame::Meta(meta) => {
                if let Some(active) = self.active.as_mut() {
                    if let Some(evidence) = meta.get("evidence") {
                        active.evidence = Some(evidence.clone());
                    }
                    active.callbacks.on_meta(&meta);
                }
            }
            Frame::Limit(limit) => {
                if let Some(active) = self.active.as_mut() {
                    tracing::warn!(turn_id = %active.turn_id, limit = %limit, "Server reported a limit");
                    active.callbacks.on_limit(&limit);
                }
            }
            Frame::Delta(delta) => self.handle_delta(&delta),
            Frame::Done(done) => self.complete(done),
            Frame::Error(payload) => {
                let error = StreamError::from_error_frame(payload.as_ref());
                self.handle_failure(error);
            }
        }
    }

    fn handle_delta(&mut self, delta: &DeltaFrame) {
        let Some(active) = self.active.as_mut() else { return };

        match self.session.admit(delta, &active.turn_id) {
            Admission::Accept => {}
            Admission::Foreign => {
                active.dropped_fragments += 1;
                tracing::debug!(
                    turn_id = %active.turn_id,
                    tagged = ?delta.client_message_id,
                    "Dropping fragment for another turn"
                );
                return;
            }
            Admission::Duplicate => {
                active.dropped_fragments += 1;
                tracing::debug!(
                    turn_id = %active.turn_id,
                    seq = ?delta.seq,
                    last_seq = ?self.session.last_seq,
                    "Dropping replayed fragment"
                );
                return;
            }
        }

        active.fragments += 1;
        let first = active.first_fragment_at.is_none();
        if first {
            active.first_fragment_at = Some(Instant::now());
            active.callbacks.on_first_fragment(&active.turn_id);
        }
        let turn_id = active.turn_id.clone();

        let (store, _) = self.store.append_delta(&turn_id, &delta.text);
        self.replace_store(store);

        if first {
            self.drive_mode(Mode::Streaming, "first fragment");
        } else {
            self.mode.heartbeat();
        }
    }

    fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::RetryDue { generation } => {
                let Some(active) = self.active.as_mut() else { return };
                if active.generation != generation || active.phase != Phase::RetryWaiting {
                    return;
                }
                active.phase = Phase::Connecting;
                drop(active.retry_timer.take());
                tracing::info!(turn_id = %active.turn_id, attempt = active.attempt, "Retrying stream");

                let Some(uid) = self.config.uid.clone() else {
                    self.fail(StreamError::auth("no caller identity configured"));
                    return;
                };
                self.open_transport(&uid);
                self.publish_status();
            }
            TimerEvent::HealthTick { generation } => {
                let Some(active) = &self.active else { return };
                if active.generation != generation {
                    return;
                }
                let health = ConnectionHealth::classify(
                    self.session.idle_for(),
                    active.phase == Phase::RetryWaiting,
                    &self.config.health,
                );
                if health != self.health {
                    tracing::info!(from = %self.health, to = %health, "Connection health changed");
                    self.health = health;
                    self.publish_status();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Store and mode
    // ------------------------------------------------------------------

    fn edit_store(&mut self, op: StoreOp) -> Outcome {
        let (store, outcome) = match &op {
            StoreOp::AddUser { id, text } => self.store.add_user(id, text),
            StoreOp::AddPlaceholder { id } => self.store.add_placeholder(id),
            StoreOp::Finalize { id, text } => self.store.finalize(id, text.clone(), None, None),
            StoreOp::SetError { id, message } => self.store.set_error(id, message),
            StoreOp::ClearStreaming => self.store.clear_streaming(),
        };
        tracing::debug!(op = ?op, outcome = ?outcome, "Store edit");
        self.replace_store(store);
        outcome
    }

    fn replace_store(&mut self, store: TurnStore) {
        if store == self.store {
            return;
        }
        self.store = store;
        self.store_tx.send_replace(self.store.clone());
    }

    /// Walk the mode machine to `target` along the shortest legal path
    fn drive_mode(&self, target: Mode, reason: &str) {
        let current = self.mode.current();
        let Some(path) = current.route_to(target) else {
            tracing::warn!(from = %current, to = %target, "No mode path");
            return;
        };
        for step in path {
            if let Err(e) = self.mode.transition_to(step, reason) {
                tracing::warn!(error = %e, to = %target, "Mode route interrupted");
                return;
            }
        }
    }

    fn publish_status(&self) {
        let status = match &self.active {
            Some(active) => StreamStatus {
                is_streaming: true,
                is_connecting: active.phase == Phase::Connecting,
                is_retrying: active.phase == Phase::RetryWaiting,
                retry_count: active.attempt,
                connection_health: self.health,
            },
            None => StreamStatus {
                connection_health: self.health,
                ..StreamStatus::default()
            },
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
