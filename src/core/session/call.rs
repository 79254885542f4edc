use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{CallCapabilities, CallConfig};
use super::registry::SessionRegistry;
use super::state::{ConversationState, Speaker};
use super::termination::{Disposition, TerminationSignal};
use crate::core::audio::AudioPipeline;
use crate::core::cache::CacheStore;
use crate::core::coordinator::CallStateHandle;
use crate::core::dead_air::{DeadAirAction, DeadAirMonitor, DeadAirState};
use crate::core::errors::{CallErrorKind, report_degraded};
use crate::core::graph::{ConversationGraph, NodeIndex, NodeKind};
use crate::core::interruption::{BargeInDecision, InterruptionDetector, SpeakingState};
use crate::core::response::{FragmentSink, ResponsePipeline, ResponseRequest};
use crate::core::stt::{STTError, SpeechRecognizer, TranscriptEvent};
use crate::core::text;
use crate::core::transition::TransitionEvaluator;
use crate::core::transport::PlaybackEventKind;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Call {0} is already active")]
    DuplicateCall(String),

    #[error("Call {0} is not hosted by this worker")]
    NotFound(String),

    #[error("Call {0} has ended")]
    Closed(String),

    #[error("Recognizer failed to start: {0}")]
    Recognizer(#[from] STTError),
}

impl SessionError {
    pub fn kind(&self) -> CallErrorKind {
        match self {
            Self::Recognizer(_) => CallErrorKind::RecognizerFailure,
            _ => CallErrorKind::SessionNotFound,
        }
    }
}

/// Everything that can happen to a live call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Caller audio for the recognizer.
    Audio(Bytes),
    Partial(String),
    Final(String),
    PlaybackStarted(String),
    PlaybackEnded(String),
    Hangup,
}

/// Per-call inputs to [`CallSession::spawn`].
pub struct CallSetup {
    pub call_id: String,
    pub graph: Arc<ConversationGraph>,
    /// Initial variables, e.g. caller details from the dialer.
    pub variables: HashMap<String, String>,
    pub recognizer: Box<dyn SpeechRecognizer>,
    pub capabilities: CallCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallInfo {
    pub call_id: String,
    pub graph_id: String,
    pub node: String,
    pub disposition: Option<Disposition>,
}

/// Handle to a running call. The call itself runs on its own task.
pub struct CallSession {
    call_id: String,
    graph_id: String,
    events: mpsc::Sender<CallEvent>,
    audio: Arc<AudioPipeline>,
    termination: Arc<TerminationSignal>,
    node: watch::Receiver<String>,
    finished: CancellationToken,
}

impl CallSession {
    /// Start the recognizer, register the call, speak the start node and
    /// start dead-air monitoring.
    pub async fn spawn(
        setup: CallSetup,
        registry: &SessionRegistry,
        config: Arc<CallConfig>,
        cache: Option<Arc<CacheStore>>,
    ) -> Result<Arc<Self>, SessionError> {
        let CallSetup {
            call_id,
            graph,
            mut variables,
            mut recognizer,
            capabilities,
        } = setup;

        if registry.contains(&call_id) {
            return Err(SessionError::DuplicateCall(call_id));
        }

        let (transcript_tx, transcript_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        recognizer.start(transcript_tx).await?;

        let shared = registry.coordinator().for_call(&call_id);
        let audio = Arc::new(AudioPipeline::spawn(
            shared.clone(),
            capabilities.synthesizer,
            capabilities.transport,
            config.audio.clone(),
        ));
        let responses = Arc::new(ResponsePipeline::new(
            capabilities.generator,
            capabilities.extractor,
            capabilities.webhooks,
            config.response.clone(),
        ));
        let evaluator =
            TransitionEvaluator::standard(capabilities.classifier, cache, &config.transition);

        let (events_tx, events_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let termination = Arc::new(TerminationSignal::new());
        let start = graph.start();
        let (node_tx, node_rx) = watch::channel(graph.node(start).id.clone());
        let finished = CancellationToken::new();

        let session = Arc::new(Self {
            call_id: call_id.clone(),
            graph_id: graph.id().to_string(),
            events: events_tx,
            audio: Arc::clone(&audio),
            termination: Arc::clone(&termination),
            node: node_rx,
            finished: finished.clone(),
        });
        if let Err(e) = registry.register(Arc::clone(&session)) {
            if let Err(stop) = recognizer.stop().await {
                warn!(call_id = %call_id, error = %stop, "Recognizer stop failed");
            }
            return Err(e);
        }

        variables
            .entry("call_id".to_string())
            .or_insert_with(|| call_id.clone());

        let dead_air = Arc::new(DeadAirState::default());
        let (dead_air_tx, dead_air_rx) = mpsc::channel(4);
        let monitor_cancel = CancellationToken::new();
        tokio::spawn(
            DeadAirMonitor::new(shared.clone(), Arc::clone(&dead_air), config.dead_air.clone())
                .with_local_audio(audio.outstanding())
                .run(dead_air_tx, monitor_cancel.clone()),
        );

        info!(call_id = %call_id, graph = graph.id(), "Call started");
        let ctx = Arc::new(TurnContext {
            call_id,
            graph,
            evaluator,
            responses,
            audio,
            shared,
            node: node_tx,
            config: Arc::clone(&config),
        });
        let mut driver = Driver {
            detector: InterruptionDetector::new(config.interruption.clone()),
            state: Some(ConversationState::new(start, variables)),
            ctx,
            recognizer,
            dead_air,
            termination,
            registry: registry.clone(),
            monitor_cancel,
            turn: None,
            ending: false,
        };
        driver.start_turn(TurnInput::Opening);
        tokio::spawn(driver.run(events_rx, transcript_rx, dead_air_rx, finished));

        Ok(session)
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    pub async fn send(&self, event: CallEvent) -> Result<(), SessionError> {
        self.events
            .send(event)
            .await
            .map_err(|_| SessionError::Closed(self.call_id.clone()))
    }

    /// Deliver a transport playback callback straight to the audio pipeline.
    pub fn on_playback_event(&self, kind: PlaybackEventKind, unit_id: &str) {
        match kind {
            PlaybackEventKind::Started => self.audio.on_playback_started(unit_id),
            PlaybackEventKind::Ended => {
                if !self.audio.on_playback_ended(unit_id) {
                    debug!(call_id = %self.call_id, unit_id, "Playback end for a unit no longer waiting");
                }
            }
        }
    }

    pub fn hangup(&self) -> bool {
        self.termination.fire(Disposition::Completed)
    }

    pub fn termination(&self) -> &Arc<TerminationSignal> {
        &self.termination
    }

    pub fn info(&self) -> CallInfo {
        CallInfo {
            call_id: self.call_id.clone(),
            graph_id: self.graph_id.clone(),
            node: self.node.borrow().clone(),
            disposition: self.termination.disposition(),
        }
    }

    /// Resolve once the call has ended and cleaned up after itself.
    pub async fn closed(&self) {
        self.finished.cancelled().await;
    }
}

enum TurnInput {
    /// Speak the start node.
    Opening,
    /// React to a final transcript.
    Utterance(String),
    /// Say a fixed line without touching the graph.
    Say(String),
    /// Say a fixed line, then end the call for silence.
    Goodbye(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnEnd {
    Continue,
    Terminate(Disposition),
}

type TurnOutput = (ConversationState, TurnEnd);

struct RunningTurn {
    cancel: CancellationToken,
    handle: JoinHandle<TurnOutput>,
}

/// What a turn task needs, shared across turns.
struct TurnContext {
    call_id: String,
    graph: Arc<ConversationGraph>,
    config: Arc<CallConfig>,
    evaluator: TransitionEvaluator,
    responses: Arc<ResponsePipeline>,
    audio: Arc<AudioPipeline>,
    shared: CallStateHandle,
    node: watch::Sender<String>,
}

async fn run_turn(
    ctx: Arc<TurnContext>,
    mut state: ConversationState,
    input: TurnInput,
    cancel: CancellationToken,
) -> TurnOutput {
    let (tx, mut rx) = mpsc::channel(ctx.config.fragment_channel_capacity.max(1));
    let forwarder = {
        let audio = Arc::clone(&ctx.audio);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while let Some(fragment) = rx.recv().await {
                if !audio.enqueue(fragment, &cancel).await {
                    break;
                }
            }
        })
    };

    let mut sink = FragmentSink::new(tx, cancel);
    let end = match input {
        TurnInput::Opening => {
            let start = state.current();
            ctx.speak_from(&mut state, start, None, true, &mut sink).await
        }
        TurnInput::Utterance(text) => ctx.answer(&mut state, &text, &mut sink).await,
        TurnInput::Say(line) => {
            sink.emit(line.as_str()).await;
            state.record(Speaker::Agent, line);
            TurnEnd::Continue
        }
        TurnInput::Goodbye(line) => {
            sink.emit(line.as_str()).await;
            state.record(Speaker::Agent, line);
            TurnEnd::Terminate(Disposition::MaxSilenceReached)
        }
    };

    drop(sink);
    if let Err(e) = forwarder.await {
        warn!(call_id = %ctx.call_id, error = %e, "Fragment forwarder failed");
    }
    (state, end)
}

impl TurnContext {
    async fn answer(
        &self,
        state: &mut ConversationState,
        utterance: &str,
        sink: &mut FragmentSink,
    ) -> TurnEnd {
        state.record(Speaker::User, utterance);
        let current = state.current();

        if let NodeKind::Extract { variables, .. } = &self.graph.node(current).kind {
            let values = self
                .responses
                .extract(&self.call_id, variables, utterance, state.history())
                .await;
            state.bind(values);

            // Nothing leaves an extract node while a required answer is missing.
            if !variables.iter().all(|v| v.is_satisfied_by(state.variables())) {
                debug!(
                    call_id = %self.call_id,
                    node = %self.graph.node(current).id,
                    "Required variables unbound, re-prompting"
                );
                let (next, entering) = self.advance(state, current, None);
                return self
                    .speak_from(state, next, Some(utterance), entering, sink)
                    .await;
            }
        }

        let decision = tokio::select! {
            biased;
            _ = sink.cancel_token().cancelled() => return TurnEnd::Continue,
            decision = self.evaluator.evaluate(
                &self.graph,
                current,
                utterance,
                state.history(),
                state.variables(),
            ) => decision,
        };
        debug!(
            call_id = %self.call_id,
            node = %self.graph.node(current).id,
            source = ?decision.source,
            "Transition evaluated"
        );

        let (next, entering) = self.advance(state, current, decision.target);
        self.speak_from(state, next, Some(utterance), entering, sink)
            .await
    }

    /// Apply a transition decision. Staying on a node counts as another
    /// visit; once a node's visit limit is hit the call leaves through its
    /// exit instead.
    fn advance(
        &self,
        state: &mut ConversationState,
        from: NodeIndex,
        target: Option<NodeIndex>,
    ) -> (NodeIndex, bool) {
        if let Some(target) = target {
            state.enter(target);
            return (target, true);
        }
        let node = self.graph.node(from);
        if let Some(policy) = node.loop_policy
            && state.visits(from) >= policy.max_visits
        {
            info!(
                call_id = %self.call_id,
                node = %node.id,
                visits = state.visits(from),
                exit = %self.graph.node(policy.exit_to).id,
                "Visit limit reached"
            );
            state.enter(policy.exit_to);
            return (policy.exit_to, true);
        }
        state.enter(from);
        (from, false)
    }

    /// Speak `node`, following webhook results through further transitions.
    async fn speak_from(
        &self,
        state: &mut ConversationState,
        mut node: NodeIndex,
        mut utterance: Option<&str>,
        mut entering: bool,
        sink: &mut FragmentSink,
    ) -> TurnEnd {
        let mut hops = 0;
        loop {
            let current = self.graph.node(node);
            self.node.send_replace(current.id.clone());

            let before = sink.emitted();
            let outcome = {
                let request = ResponseRequest {
                    call_id: &self.call_id,
                    node: current,
                    utterance,
                    entering,
                    history: state.history(),
                    variables: state.variables(),
                    shared: &self.shared,
                };
                self.responses.respond(&request, sink).await
            };
            state.record(Speaker::Agent, sink.spoken()[before..].join(" "));
            state.bind(outcome.bindings);

            if let Some(disposition) = outcome.terminate {
                return TurnEnd::Terminate(disposition);
            }
            let Some(webhook) = outcome.webhook else {
                return TurnEnd::Continue;
            };
            if sink.is_cancelled() {
                return TurnEnd::Continue;
            }
            if hops >= self.config.max_webhook_hops {
                warn!(call_id = %self.call_id, node = %current.id, hops, "Webhook hop limit reached");
                return TurnEnd::Continue;
            }
            hops += 1;

            let decision = self
                .evaluator
                .evaluate(
                    &self.graph,
                    node,
                    webhook.as_utterance(),
                    state.history(),
                    state.variables(),
                )
                .await;
            let Some(target) = decision.target else {
                return TurnEnd::Continue;
            };
            state.enter(target);
            node = target;
            utterance = None;
            entering = true;
        }
    }
}

enum Wake {
    TurnDone(Result<TurnOutput, JoinError>),
    Event(Option<CallEvent>),
    Transcript(Option<TranscriptEvent>),
    DeadAir(Option<DeadAirAction>),
}

async fn join(turn: &mut Option<RunningTurn>) -> Result<TurnOutput, JoinError> {
    match turn {
        Some(running) => (&mut running.handle).await,
        None => std::future::pending().await,
    }
}

fn mentions_any(words: &[String], phrases: &[String]) -> bool {
    phrases
        .iter()
        .any(|phrase| text::contains_phrase(words, &text::words(phrase)))
}

/// The call's event loop. Owns the conversation state between turns.
struct Driver {
    ctx: Arc<TurnContext>,
    recognizer: Box<dyn SpeechRecognizer>,
    detector: InterruptionDetector,
    dead_air: Arc<DeadAirState>,
    termination: Arc<TerminationSignal>,
    registry: SessionRegistry,
    monitor_cancel: CancellationToken,
    /// `None` while a turn task holds it.
    state: Option<ConversationState>,
    turn: Option<RunningTurn>,
    /// Termination is decided; only the closing audio is left.
    ending: bool,
}

impl Driver {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<CallEvent>,
        mut transcripts: mpsc::Receiver<TranscriptEvent>,
        mut dead_air: mpsc::Receiver<DeadAirAction>,
        finished: CancellationToken,
    ) {
        let termination = Arc::clone(&self.termination);
        let mut transcripts_open = true;
        let mut dead_air_open = true;

        let disposition = loop {
            let wake = tokio::select! {
                biased;
                disposition = termination.wait() => break disposition,
                joined = join(&mut self.turn) => Wake::TurnDone(joined),
                event = events.recv() => Wake::Event(event),
                transcript = transcripts.recv(), if transcripts_open => Wake::Transcript(transcript),
                action = dead_air.recv(), if dead_air_open => Wake::DeadAir(action),
            };

            match wake {
                Wake::TurnDone(joined) => {
                    self.turn = None;
                    self.finish_turn(joined);
                }
                Wake::Event(None) => {
                    self.termination.fire(Disposition::Completed);
                }
                Wake::Event(Some(event)) => self.handle_event(event).await,
                Wake::Transcript(None) => transcripts_open = false,
                Wake::Transcript(Some(TranscriptEvent::Partial { text })) => {
                    self.handle_partial(&text).await;
                }
                Wake::Transcript(Some(TranscriptEvent::Final { text, .. })) => {
                    self.handle_final(text).await;
                }
                Wake::DeadAir(None) => dead_air_open = false,
                Wake::DeadAir(Some(action)) => self.handle_dead_air(action).await,
            }
        };

        drop(events);
        self.shutdown(disposition).await;
        finished.cancel();
    }

    fn start_turn(&mut self, input: TurnInput) {
        let Some(state) = self.state.take() else {
            error!(call_id = %self.ctx.call_id, "Turn started while another holds the state");
            self.termination.fire(Disposition::Error);
            return;
        };
        self.dead_air.set_turn_active(true);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_turn(
            Arc::clone(&self.ctx),
            state,
            input,
            cancel.clone(),
        ));
        self.turn = Some(RunningTurn { cancel, handle });
    }

    /// Cancel the running turn, if any, and take its state back.
    async fn settle(&mut self) {
        if let Some(turn) = self.turn.take() {
            turn.cancel.cancel();
            let joined = turn.handle.await;
            self.finish_turn(joined);
        }
    }

    fn finish_turn(&mut self, joined: Result<TurnOutput, JoinError>) {
        self.dead_air.set_turn_active(false);
        match joined {
            Ok((state, end)) => {
                self.state = Some(state);
                if let TurnEnd::Terminate(disposition) = end {
                    self.end_after_playback(disposition);
                }
            }
            Err(e) => {
                error!(call_id = %self.ctx.call_id, error = %e, "Turn task failed");
                self.termination.fire(Disposition::Error);
            }
        }
    }

    fn end_after_playback(&mut self, disposition: Disposition) {
        self.ending = true;
        let audio = Arc::clone(&self.ctx.audio);
        let termination = Arc::clone(&self.termination);
        tokio::spawn(async move {
            audio.wait_idle().await;
            termination.fire(disposition);
        });
    }

    async fn handle_event(&mut self, event: CallEvent) {
        match event {
            CallEvent::Audio(audio) => {
                if let Err(e) = self.recognizer.send_audio(audio).await {
                    warn!(call_id = %self.ctx.call_id, error = %e, "Recognizer rejected audio");
                }
            }
            CallEvent::Partial(text) => self.handle_partial(&text).await,
            CallEvent::Final(text) => self.handle_final(text).await,
            CallEvent::PlaybackStarted(unit_id) => self.ctx.audio.on_playback_started(&unit_id),
            CallEvent::PlaybackEnded(unit_id) => {
                self.ctx.audio.on_playback_ended(&unit_id);
            }
            CallEvent::Hangup => {
                info!(call_id = %self.ctx.call_id, "Caller hung up");
                self.termination.fire(Disposition::Completed);
            }
        }
    }

    async fn handle_partial(&mut self, partial: &str) {
        if self.ending {
            return;
        }
        if let Err(e) = self.ctx.shared.set_user_speaking(true).await {
            report_degraded(&self.ctx.call_id, e.kind(), &e);
        }

        let audio = &self.ctx.audio;
        self.detector.set_state(if audio.is_speaking() {
            SpeakingState::AgentSpeaking
        } else {
            SpeakingState::Idle
        });
        match self.detector.on_partial(partial, &audio.recent_speech()) {
            BargeInDecision::Interrupt => {
                info!(call_id = %self.ctx.call_id, "Caller barged in");
                if let Some(turn) = &self.turn {
                    turn.cancel.cancel();
                }
                audio.interrupt().await;
            }
            BargeInDecision::Echo { overlap } => {
                debug!(call_id = %self.ctx.call_id, overlap, "Ignoring echoed partial");
            }
            BargeInDecision::BelowThreshold { .. } | BargeInDecision::NotSpeaking => {}
        }
    }

    async fn handle_final(&mut self, utterance: String) {
        if let Err(e) = self.ctx.shared.set_user_speaking(false).await {
            report_degraded(&self.ctx.call_id, e.kind(), &e);
        }
        if self.ending {
            debug!(call_id = %self.ctx.call_id, "Ignoring transcript, call is ending");
            return;
        }
        if text::is_trivial(&utterance) {
            debug!(call_id = %self.ctx.call_id, utterance = %utterance, "Ignoring filler");
            return;
        }
        let audio = Arc::clone(&self.ctx.audio);
        if audio.is_speaking() && self.detector.is_echo(&utterance, &audio.recent_speech()) {
            debug!(call_id = %self.ctx.call_id, "Ignoring echoed transcript");
            return;
        }

        let words = text::words(&utterance);
        if mentions_any(&words, &self.ctx.config.voicemail_phrases) {
            info!(call_id = %self.ctx.call_id, "Voicemail detected");
            self.settle().await;
            audio.interrupt().await;
            self.termination.fire(Disposition::VoicemailDetected);
            return;
        }

        self.dead_air.reset();
        if let Err(e) = self.ctx.shared.set_check_ins(0).await {
            report_degraded(&self.ctx.call_id, e.kind(), &e);
        }
        if mentions_any(&words, &self.ctx.config.hold_phrases) {
            debug!(call_id = %self.ctx.call_id, "Caller asked to hold");
            self.dead_air.set_holding(true);
        }

        self.settle().await;
        if audio.is_speaking() {
            audio.interrupt().await;
        }
        if self.ending {
            return;
        }
        self.start_turn(TurnInput::Utterance(utterance));
    }

    async fn handle_dead_air(&mut self, action: DeadAirAction) {
        if self.ending {
            return;
        }
        match action {
            DeadAirAction::CheckIn { attempt, message } => {
                if self.turn.is_some() {
                    debug!(call_id = %self.ctx.call_id, attempt, "Skipping check-in, a turn is running");
                    return;
                }
                self.start_turn(TurnInput::Say(message));
            }
            DeadAirAction::Terminate { message } => {
                self.settle().await;
                if self.ending {
                    return;
                }
                self.ending = true;
                self.start_turn(TurnInput::Goodbye(message));
            }
        }
    }

    async fn shutdown(mut self, disposition: Disposition) {
        let call_id = self.ctx.call_id.clone();
        self.monitor_cancel.cancel();
        if let Some(turn) = self.turn.take() {
            turn.cancel.cancel();
            let _ = turn.handle.await;
        }

        self.ctx.audio.shutdown().await;
        if tokio::time::timeout(Duration::from_secs(2), self.ctx.audio.wait_idle())
            .await
            .is_err()
        {
            warn!(call_id = %call_id, "Audio did not drain before shutdown");
        }
        if let Err(e) = self.recognizer.stop().await {
            warn!(call_id = %call_id, error = %e, "Recognizer stop failed");
        }
        if let Err(e) = self.ctx.shared.clear().await {
            report_degraded(&call_id, e.kind(), &e);
        }
        self.registry.unregister(&call_id);
        info!(call_id = %call_id, disposition = %disposition, "Call ended");
    }
}
