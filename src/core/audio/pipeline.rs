use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AudioConfig, PlaybackUnit};
use crate::core::coordinator::CallStateHandle;
use crate::core::errors::report_degraded;
use crate::core::response::Fragment;
use crate::core::transport::PlaybackTransport;
use crate::core::tts::{SpeechSynthesizer, SynthesisError};

/// A queued fragment whose audio may still be synthesizing.
struct Pending {
    seq: u64,
    cancel: CancellationToken,
    audio: oneshot::Receiver<Option<PlaybackUnit>>,
    _slot: OwnedSemaphorePermit,
}

struct Queue {
    pending: VecDeque<Pending>,
    /// Bumped by every interrupt. Fragments enqueued for an older epoch are
    /// refused.
    epoch: u64,
    cancel: CancellationToken,
}

struct Inner {
    call_id: String,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    transport: Arc<dyn PlaybackTransport>,
    shared: CallStateHandle,
    config: AudioConfig,
    slots: Arc<Semaphore>,
    synthesis: Arc<Semaphore>,
    queue: Mutex<Queue>,
    queued: Notify,
    seq: AtomicU64,
    /// Local completion callbacks, by unit id.
    completions: Mutex<HashMap<String, oneshot::Sender<()>>>,
    /// Units enqueued and not yet finished.
    outstanding: watch::Sender<usize>,
    recent: Mutex<VecDeque<String>>,
    speaking: AtomicBool,
    closed: CancellationToken,
}

/// The call's audio output: synthesis fan-out, ordered playback, interruption.
pub struct AudioPipeline {
    inner: Arc<Inner>,
}

impl AudioPipeline {
    /// Create the pipeline and start its playback consumer.
    pub fn spawn(
        shared: CallStateHandle,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        transport: Arc<dyn PlaybackTransport>,
        config: AudioConfig,
    ) -> Self {
        let (outstanding, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            call_id: shared.call_id().to_string(),
            synthesizer,
            transport,
            shared,
            slots: Arc::new(Semaphore::new(config.queue_capacity.max(1))),
            synthesis: Arc::new(Semaphore::new(config.max_concurrent_synthesis.max(1))),
            queue: Mutex::new(Queue {
                pending: VecDeque::new(),
                epoch: 0,
                cancel: CancellationToken::new(),
            }),
            queued: Notify::new(),
            seq: AtomicU64::new(0),
            completions: Mutex::new(HashMap::new()),
            outstanding,
            recent: Mutex::new(VecDeque::with_capacity(config.recent_fragments)),
            speaking: AtomicBool::new(false),
            closed: CancellationToken::new(),
            config,
        });
        tokio::spawn(Arc::clone(&inner).run());
        Self { inner }
    }

    /// Queue a fragment for synthesis and playback.
    ///
    /// Waits for queue capacity. Returns false if `cancel` fires first, or if
    /// the pipeline was interrupted while waiting.
    pub async fn enqueue(&self, fragment: Fragment, cancel: &CancellationToken) -> bool {
        let inner = &self.inner;
        let epoch = inner.queue.lock().epoch;
        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = inner.closed.cancelled() => return false,
            slot = Arc::clone(&inner.slots).acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => return false,
            },
        };

        let (tx, rx) = oneshot::channel();
        let seq = inner.seq.fetch_add(1, Ordering::Relaxed);
        let audio_cancel = {
            let mut queue = inner.queue.lock();
            if queue.epoch != epoch || cancel.is_cancelled() {
                debug!(call_id = %inner.call_id, seq, "Dropping fragment from an interrupted turn");
                return false;
            }
            let audio_cancel = queue.cancel.clone();
            inner.outstanding.send_modify(|n| *n += 1);
            queue.pending.push_back(Pending {
                seq,
                cancel: audio_cancel.clone(),
                audio: rx,
                _slot: slot,
            });
            audio_cancel
        };
        inner.queued.notify_one();

        debug!(call_id = %inner.call_id, seq, first = fragment.first, "Fragment queued");
        tokio::spawn(Arc::clone(inner).synthesize(fragment, seq, audio_cancel, tx));
        true
    }

    /// Stop everything: cancel synthesis, drop queued units, cut the
    /// transport off. The unit that was playing releases its lease as its
    /// wait is cancelled.
    pub async fn interrupt(&self) {
        let inner = &self.inner;
        let dropped = {
            let mut queue = inner.queue.lock();
            queue.epoch += 1;
            queue.cancel.cancel();
            queue.cancel = CancellationToken::new();
            let drained: Vec<Pending> = queue.pending.drain(..).collect();
            inner
                .outstanding
                .send_modify(|n| *n = n.saturating_sub(drained.len()));
            drained.len()
        };

        if let Err(e) = inner.transport.stop_playback().await {
            report_degraded(&inner.call_id, e.kind(), &e);
        }
        inner.speaking_ended().await;
        info!(call_id = %inner.call_id, dropped, "Audio interrupted");
    }

    /// Interrupt and stop the playback consumer.
    pub async fn shutdown(&self) {
        self.interrupt().await;
        self.inner.closed.cancel();
    }

    /// Local transport callback: the unit finished playing.
    pub fn on_playback_ended(&self, unit_id: &str) -> bool {
        let Some(done) = self.inner.completions.lock().remove(unit_id) else {
            return false;
        };
        done.send(()).is_ok()
    }

    pub fn on_playback_started(&self, unit_id: &str) {
        debug!(call_id = %self.inner.call_id, unit_id, "Playback started");
    }

    /// Count of units queued, synthesizing or playing, as it changes.
    pub fn outstanding(&self) -> watch::Receiver<usize> {
        self.inner.outstanding.subscribe()
    }

    /// Whether anything is queued, synthesizing or playing.
    pub fn is_speaking(&self) -> bool {
        *self.inner.outstanding.borrow() > 0
    }

    /// Resolve once every enqueued unit has finished or been dropped.
    pub async fn wait_idle(&self) {
        let mut outstanding = self.inner.outstanding.subscribe();
        let _ = outstanding.wait_for(|n| *n == 0).await;
    }

    pub fn queued_len(&self) -> usize {
        self.inner.queue.lock().pending.len()
    }

    /// Texts of the most recently played fragments, oldest first.
    pub fn recent_speech(&self) -> Vec<String> {
        self.inner.recent.lock().iter().cloned().collect()
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.inner.queue.lock().cancel.cancel();
        self.inner.closed.cancel();
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        debug!(call_id = %self.call_id, "Playback consumer started");
        loop {
            let next = self.queue.lock().pending.pop_front();
            let Some(pending) = next else {
                tokio::select! {
                    _ = self.closed.cancelled() => break,
                    _ = self.queued.notified() => {}
                }
                continue;
            };
            self.play(pending).await;
            let idle = {
                let mut idle = false;
                self.outstanding.send_modify(|n| {
                    *n = n.saturating_sub(1);
                    idle = *n == 0;
                });
                idle
            };
            if idle {
                self.speaking_ended().await;
            }
        }
        debug!(call_id = %self.call_id, "Playback consumer stopped");
    }

    async fn synthesize(
        self: Arc<Self>,
        fragment: Fragment,
        seq: u64,
        cancel: CancellationToken,
        tx: oneshot::Sender<Option<PlaybackUnit>>,
    ) {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            permit = Arc::clone(&self.synthesis).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let mut unit = self.synthesize_text(&fragment.text, seq, &cancel).await;
        if unit.is_none() && fragment.first && !cancel.is_cancelled() {
            warn!(call_id = %self.call_id, seq, "First fragment failed, apologizing instead");
            unit = self
                .synthesize_text(&self.config.apology_text, seq, &cancel)
                .await;
        }
        let _ = tx.send(unit);
    }

    async fn synthesize_text(
        &self,
        text: &str,
        seq: u64,
        cancel: &CancellationToken,
    ) -> Option<PlaybackUnit> {
        let timeout = self.config.synthesis_timeout();
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            attempt = tokio::time::timeout(timeout, self.synthesizer.synthesize(text)) => attempt,
        };
        match attempt.unwrap_or(Err(SynthesisError::Timeout(timeout))) {
            Ok(audio) => Some(PlaybackUnit::new(seq, text, audio, self.config.estimate(text))),
            Err(e) => {
                warn!(
                    call_id = %self.call_id,
                    seq,
                    kind = %e.kind(),
                    error = %e,
                    "Skipping fragment"
                );
                None
            }
        }
    }

    async fn play(&self, pending: Pending) {
        let Pending {
            seq,
            cancel,
            audio,
            _slot,
        } = pending;

        let unit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            unit = audio => unit.ok().flatten(),
        };
        let Some(unit) = unit else {
            debug!(call_id = %self.call_id, seq, "Nothing to play");
            return;
        };
        if cancel.is_cancelled() {
            return;
        }

        // Re-asserted per unit: the last release of the previous unit clears it.
        self.speaking.store(true, Ordering::Release);
        if let Err(e) = self.shared.set_agent_speaking(true).await {
            report_degraded(&self.call_id, e.kind(), &e);
        }

        let lease = match self.shared.acquire_playback(&unit.unit_id).await {
            Ok(lease) => Some(lease),
            Err(e) => {
                report_degraded(&self.call_id, e.kind(), &e);
                None
            }
        };

        let (done_tx, done_rx) = oneshot::channel();
        self.completions
            .lock()
            .insert(unit.unit_id.clone(), done_tx);

        // The store round trips above can outlast an interrupt.
        let played = if cancel.is_cancelled() {
            None
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                played = self.transport.play(&unit) => Some(played),
            }
        };

        match played {
            None => {
                debug!(call_id = %self.call_id, unit_id = %unit.unit_id, seq, "Interrupted before playback");
            }
            Some(Ok(())) => {
                self.remember(&unit.text);
                debug!(call_id = %self.call_id, unit_id = %unit.unit_id, seq, "Unit playing");
                let deadline = unit.expected_duration + self.config.playback_grace();
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(call_id = %self.call_id, unit_id = %unit.unit_id, "Playback cut off");
                    }
                    _ = done_rx => {
                        debug!(call_id = %self.call_id, unit_id = %unit.unit_id, "Playback ended");
                    }
                    _ = self.released_elsewhere(&unit.unit_id), if lease.is_some() => {
                        debug!(call_id = %self.call_id, unit_id = %unit.unit_id, "Playback ended on another worker");
                    }
                    _ = tokio::time::sleep(deadline) => {
                        warn!(
                            call_id = %self.call_id,
                            unit_id = %unit.unit_id,
                            deadline_ms = deadline.as_millis() as u64,
                            "No playback completion, releasing at deadline"
                        );
                    }
                }
            }
            Some(Err(e)) => report_degraded(&self.call_id, e.kind(), &e),
        }

        self.completions.lock().remove(&unit.unit_id);
        if let Some(lease) = lease
            && let Err(e) = lease.release().await
        {
            report_degraded(&self.call_id, e.kind(), &e);
        }
    }

    /// Resolves once `unit_id` has left the shared playback set.
    async fn released_elsewhere(&self, unit_id: &str) {
        let mut poll = tokio::time::interval(self.config.completion_poll());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;
        loop {
            poll.tick().await;
            match self.shared.is_playback_active(unit_id).await {
                Ok(false) => return,
                Ok(true) => {}
                Err(e) => debug!(call_id = %self.call_id, unit_id, error = %e, "Playback poll failed"),
            }
        }
    }

    fn remember(&self, text: &str) {
        let mut recent = self.recent.lock();
        if recent.len() == self.config.recent_fragments.max(1) {
            recent.pop_front();
        }
        recent.push_back(text.to_string());
    }

    async fn speaking_ended(&self) {
        if self.speaking.swap(false, Ordering::AcqRel)
            && let Err(e) = self.shared.set_agent_speaking(false).await
        {
            report_degraded(&self.call_id, e.kind(), &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::coordinator::{
        MemoryStateStore, SlotChange, StateCoordinator, StateStore, StateStoreResult,
    };
    use crate::core::transport::TransportError;
    use crate::core::tts::{SynthesisResult, SynthesizedAudio};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Synthesizes 100ms of silence after a per-text delay.
    #[derive(Default)]
    struct StubSynth {
        delays: HashMap<&'static str, u64>,
        failing: Vec<&'static str>,
        hanging: Vec<&'static str>,
    }

    #[async_trait]
    impl SpeechSynthesizer for StubSynth {
        async fn synthesize(&self, text: &str) -> SynthesisResult<SynthesizedAudio> {
            if self.hanging.iter().any(|t| *t == text) {
                std::future::pending::<()>().await;
            }
            let delay = self.delays.get(text).copied().unwrap_or(10);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if self.failing.iter().any(|t| *t == text) {
                return Err(SynthesisError::ProviderError("voice unavailable".to_string()));
            }
            Ok(SynthesizedAudio::new(vec![0u8; 1600], "linear16", 8000))
        }
    }

    struct RecordingTransport {
        played: Mutex<Vec<PlaybackUnit>>,
        events: mpsc::UnboundedSender<String>,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl PlaybackTransport for RecordingTransport {
        async fn play(&self, unit: &PlaybackUnit) -> Result<(), TransportError> {
            self.played.lock().push(unit.clone());
            let _ = self.events.send(unit.unit_id.clone());
            Ok(())
        }

        async fn stop_playback(&self) -> Result<(), TransportError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl RecordingTransport {
        fn texts(&self) -> Vec<String> {
            self.played.lock().iter().map(|u| u.text.clone()).collect()
        }
    }

    struct Harness {
        coordinator: StateCoordinator,
        shared: CallStateHandle,
        transport: Arc<RecordingTransport>,
        played: mpsc::UnboundedReceiver<String>,
        pipeline: Arc<AudioPipeline>,
    }

    /// Memory store whose slot acquire takes a network-like round trip.
    struct SlowSlots {
        inner: MemoryStateStore,
        delay: Duration,
    }

    #[async_trait]
    impl StateStore for SlowSlots {
        async fn get(&self, key: &str) -> StateStoreResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Duration) -> StateStoreResult<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> StateStoreResult<()> {
            self.inner.delete(key).await
        }

        async fn increment(&self, key: &str, ttl: Duration) -> StateStoreResult<i64> {
            self.inner.increment(key, ttl).await
        }

        async fn decrement(&self, key: &str, ttl: Duration) -> StateStoreResult<i64> {
            self.inner.decrement(key, ttl).await
        }

        async fn add_member(&self, key: &str, member: &str, ttl: Duration) -> StateStoreResult<bool> {
            self.inner.add_member(key, member, ttl).await
        }

        async fn remove_member(&self, key: &str, member: &str) -> StateStoreResult<bool> {
            self.inner.remove_member(key, member).await
        }

        async fn members(&self, key: &str) -> StateStoreResult<Vec<String>> {
            self.inner.members(key).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> StateStoreResult<bool> {
            self.inner.expire(key, ttl).await
        }

        async fn acquire_slot(
            &self,
            set_key: &str,
            counter_key: &str,
            member: &str,
            ttl: Duration,
        ) -> StateStoreResult<SlotChange> {
            tokio::time::sleep(self.delay).await;
            self.inner.acquire_slot(set_key, counter_key, member, ttl).await
        }

        async fn release_slot(
            &self,
            set_key: &str,
            counter_key: &str,
            member: &str,
            ttl: Duration,
        ) -> StateStoreResult<SlotChange> {
            self.inner.release_slot(set_key, counter_key, member, ttl).await
        }

        fn backend_type(&self) -> &'static str {
            "slow"
        }
    }

    fn harness(synth: StubSynth) -> Harness {
        harness_with_store(synth, Arc::new(MemoryStateStore::new()))
    }

    fn harness_with_store(synth: StubSynth, store: Arc<dyn StateStore>) -> Harness {
        let coordinator = StateCoordinator::new(store, Duration::from_secs(60));
        let shared = coordinator.for_call("call-1");
        let (events, played) = mpsc::unbounded_channel();
        let transport = Arc::new(RecordingTransport {
            played: Mutex::new(Vec::new()),
            events,
            stops: AtomicUsize::new(0),
        });
        let pipeline = Arc::new(AudioPipeline::spawn(
            shared.clone(),
            Arc::new(synth),
            transport.clone(),
            AudioConfig::default(),
        ));
        Harness {
            coordinator,
            shared,
            transport,
            played,
            pipeline,
        }
    }

    /// Report every unit as finished as soon as the transport takes it.
    fn auto_complete(h: &mut Harness) {
        let (_, empty) = mpsc::unbounded_channel();
        let mut played = std::mem::replace(&mut h.played, empty);
        let pipeline = Arc::clone(&h.pipeline);
        tokio::spawn(async move {
            while let Some(unit_id) = played.recv().await {
                pipeline.on_playback_ended(&unit_id);
            }
        });
    }

    fn fragment(text: &str, first: bool) -> Fragment {
        Fragment {
            text: text.to_string(),
            first,
        }
    }

    async fn enqueue_all(pipeline: &AudioPipeline, texts: &[&str]) {
        let cancel = CancellationToken::new();
        for (i, text) in texts.iter().enumerate() {
            assert!(pipeline.enqueue(fragment(text, i == 0), &cancel).await);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_in_order_despite_synthesis_order() {
        let mut h = harness(StubSynth {
            delays: HashMap::from([("A", 300), ("B", 10), ("C", 100)]),
            ..StubSynth::default()
        });
        auto_complete(&mut h);

        enqueue_all(&h.pipeline, &["A", "B", "C"]).await;
        h.pipeline.wait_idle().await;

        assert_eq!(h.transport.texts(), vec!["A", "B", "C"]);
        let seqs: Vec<u64> = h.transport.played.lock().iter().map(|u| u.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        let activity = h.shared.activity().await.unwrap();
        assert_eq!(activity.playback_count, 0);
        assert!(!activity.agent_speaking);
        assert_eq!(h.pipeline.recent_speech(), vec!["A", "B", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_while_second_fragment_synthesizes() {
        let mut h = harness(StubSynth {
            hanging: vec!["B"],
            ..StubSynth::default()
        });

        enqueue_all(&h.pipeline, &["A", "B", "C"]).await;
        let first = h.played.recv().await.unwrap();
        assert!(h.shared.is_playback_active(&first).await.unwrap());
        assert!(h.pipeline.is_speaking());

        h.pipeline.interrupt().await;
        assert_eq!(h.pipeline.queued_len(), 0);
        h.pipeline.wait_idle().await;

        assert_eq!(h.transport.texts(), vec!["A"]);
        assert_eq!(h.transport.stops.load(Ordering::SeqCst), 1);
        assert!(!h.pipeline.is_speaking());
        assert_eq!(h.shared.activity().await.unwrap().playback_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_during_lease_acquire_never_plays_the_unit() {
        let h = harness_with_store(
            StubSynth::default(),
            Arc::new(SlowSlots {
                inner: MemoryStateStore::new(),
                delay: Duration::from_millis(50),
            }),
        );

        enqueue_all(&h.pipeline, &["A"]).await;
        // Synthesis is done at 10ms; the lease is still in flight at 30ms.
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.pipeline.interrupt().await;
        h.pipeline.wait_idle().await;

        assert!(h.transport.texts().is_empty());
        assert_eq!(h.transport.stops.load(Ordering::SeqCst), 1);
        let activity = h.shared.activity().await.unwrap();
        assert_eq!(activity.playback_count, 0);
        assert!(!activity.agent_speaking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_enqueue_after_interrupt_is_refused() {
        let h = harness(StubSynth::default());
        let turn = CancellationToken::new();
        turn.cancel();
        assert!(!h.pipeline.enqueue(fragment("late", false), &turn).await);
        assert_eq!(h.pipeline.queued_len(), 0);
        assert!(!h.pipeline.is_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_fragment_failure_is_replaced_by_apology() {
        let mut h = harness(StubSynth {
            failing: vec!["broken first", "broken later"],
            ..StubSynth::default()
        });
        auto_complete(&mut h);

        enqueue_all(&h.pipeline, &["broken first", "fine", "broken later"]).await;
        h.pipeline.wait_idle().await;

        assert_eq!(
            h.transport.texts(),
            vec![AudioConfig::default().apology_text, "fine".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_delivered_to_another_worker() {
        let mut h = harness(StubSynth::default());
        let started = tokio::time::Instant::now();

        enqueue_all(&h.pipeline, &["A"]).await;
        let unit_id = h.played.recv().await.unwrap();
        let change = h
            .coordinator
            .playback_ended("call-1", &unit_id)
            .await
            .unwrap();
        assert!(change.changed);
        h.pipeline.wait_idle().await;

        // Finished on the poll, well before the 100ms + grace deadline.
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(h.shared.activity().await.unwrap().playback_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_completion_releases_at_deadline() {
        let mut h = harness(StubSynth::default());
        let started = tokio::time::Instant::now();

        enqueue_all(&h.pipeline, &["A"]).await;
        h.played.recv().await.unwrap();
        h.pipeline.wait_idle().await;

        assert!(started.elapsed() >= Duration::from_millis(1600));
        assert_eq!(h.shared.activity().await.unwrap().playback_count, 0);
    }
}
