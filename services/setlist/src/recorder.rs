//!
//! src/recorder.rs  Andrew Belles  Oct 17th, 2026
//!
//! The chunked recording loop: capture a window of audio, hand it off
//! for identification in the background, rest, repeat until stopped
//!

use std::sync::Arc;

use tokio::{sync::watch, task::JoinSet, time::{sleep, timeout}};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::capture::{AudioSource, CaptureHandle};
use crate::config::RecordingConfig;
use crate::errors::SetListError;
use crate::fetch::Recognizer;
use crate::merge::{MergeOutcome, MergePipeline};
use crate::platform::{require_microphone, Permissions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording { chunk: u64 },
    Identifying { chunk: u64 },
    Failed(String)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecorderSummary {
    pub chunks_captured: u64,
    pub chunks_failed: u64,
    pub identifications_failed: u64,
    pub identifications_aborted: u64
}

type ChunkResult = (u64, Result<MergeOutcome, SetListError>);

pub struct Recorder {
    cfg: RecordingConfig,
    permissions: Arc<dyn Permissions>,
    source: Arc<dyn AudioSource>,
    recognizer: Arc<dyn Recognizer>,
    pipeline: Arc<MergePipeline>,

    state: watch::Sender<RecorderState>,

    // handles loop exit
    shutdown: CancellationToken
}

impl Recorder {
    pub fn new(
        cfg: &RecordingConfig,
        permissions: Arc<dyn Permissions>,
        source: Arc<dyn AudioSource>,
        recognizer: Arc<dyn Recognizer>,
        pipeline: Arc<MergePipeline>
    ) -> Self {
        let (state, _) = watch::channel(RecorderState::Idle);
        Self {
            cfg: cfg.clone(),
            permissions,
            source,
            recognizer,
            pipeline,
            state,
            shutdown: CancellationToken::new()
        }
    }

    pub fn shutdown(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn state(&self) -> watch::Receiver<RecorderState> {
        self.state.subscribe()
    }

    /// Runs until the shutdown token fires or the capture device is lost
    pub async fn run(self) -> Result<RecorderSummary, SetListError> {
        if let Err(e) = require_microphone(self.permissions.as_ref()).await {
            self.state.send_replace(RecorderState::Failed(e.to_string()));
            return Err(e);
        }

        info!(
            set = %self.pipeline.set_id(),
            record_ms = self.cfg.record_window.as_millis() as u64,
            idle_ms = self.cfg.idle_window.as_millis() as u64,
            "recorder.start"
        );

        let mut tasks: JoinSet<ChunkResult> = JoinSet::new();
        let mut slot: Option<Box<dyn CaptureHandle>> = None;
        let mut summary = RecorderSummary::default();
        let mut fatal: Option<SetListError> = None;
        let mut chunk = 0_u64;

        while !self.shutdown.is_cancelled() {
            chunk += 1;

            // never two live captures
            if let Some(stale) = slot.take() {
                stale.discard().await;
            }

            match self.source.begin(&self.cfg.capture).await {
                Ok(handle) => slot = Some(handle),
                Err(e) if e.is_fatal() => {
                    error!(error = ?e, chunk, "recorder.capture.unavailable");
                    fatal = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(error = ?e, chunk, "recorder.capture.begin failed");
                    summary.chunks_failed += 1;
                    if self.rest(&mut tasks, &mut summary).await {
                        break;
                    }
                    continue;
                }
            }
            self.state.send_replace(RecorderState::Recording { chunk });
            debug!(chunk, "recorder.capture.start");

            let cancelled = tokio::select! {
                () = self.shutdown.cancelled() => true,
                () = sleep(self.cfg.record_window) => false
            };

            let Some(handle) = slot.take() else { continue };
            if cancelled {
                handle.discard().await;
                info!(chunk, "recorder.capture.discarded");
                break;
            }

            match handle.finish().await {
                Ok(clip) => {
                    summary.chunks_captured += 1;
                    self.state.send_replace(RecorderState::Identifying { chunk });
                    let recognizer = self.recognizer.clone();
                    let pipeline = self.pipeline.clone();
                    tasks.spawn(async move {
                        let res = match recognizer.identify(&clip).await {
                            Ok(recognition) => Ok(pipeline.ingest(&recognition).await),
                            Err(e) => Err(e)
                        };
                        (chunk, res)
                    }.instrument(info_span!("chunk", chunk)));
                }
                Err(e) => {
                    warn!(error = ?e, chunk, "recorder.capture.finish failed");
                    summary.chunks_failed += 1;
                }
            }

            reap(&mut tasks, &mut summary);

            if self.rest(&mut tasks, &mut summary).await {
                break;
            }
        }

        if let Some(stale) = slot.take() {
            stale.discard().await;
        }

        // bounded wait for identifications already in flight
        let grace = self.cfg.shutdown_grace;
        if timeout(grace, drain(&mut tasks, &mut summary)).await.is_err() {
            let aborted = tasks.len() as u64;
            warn!(aborted, grace_ms = grace.as_millis() as u64, "recorder.drain.timeout");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            summary.identifications_aborted += aborted;
        }

        info!(
            captured = summary.chunks_captured,
            chunk_failures = summary.chunks_failed,
            identify_failures = summary.identifications_failed,
            aborted = summary.identifications_aborted,
            "recorder.stop"
        );

        match fatal {
            Some(e) => {
                self.state.send_replace(RecorderState::Failed(e.to_string()));
                Err(e)
            }
            None => {
                self.state.send_replace(RecorderState::Idle);
                Ok(summary)
            }
        }
    }

    /// Idle window between captures. Identifications that finish meanwhile
    /// are settled, and the state drops to Idle once none are left.
    /// True if stopped while waiting.
    async fn rest(
        &self,
        tasks: &mut JoinSet<ChunkResult>,
        summary: &mut RecorderSummary
    ) -> bool {
        let idle = sleep(self.cfg.idle_window);
        tokio::pin!(idle);

        loop {
            if tasks.is_empty() {
                self.state.send_if_modified(|state| {
                    let busy = *state != RecorderState::Idle;
                    if busy {
                        *state = RecorderState::Idle;
                    }
                    busy
                });
            }

            tokio::select! {
                () = self.shutdown.cancelled() => return true,
                () = &mut idle => return false,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    settle(joined, summary);
                }
            }
        }
    }
}

fn settle(
    joined: Result<ChunkResult, tokio::task::JoinError>,
    summary: &mut RecorderSummary
) {
    match joined {
        Ok((chunk, Ok(outcome))) => {
            debug!(chunk, ?outcome, "recorder.identify.done");
        }
        Ok((chunk, Err(e))) => {
            warn!(chunk, error = ?e, "recorder.identify failed");
            summary.identifications_failed += 1;
        }
        Err(e) => {
            error!(error = ?e, "identification task panicked");
            summary.identifications_failed += 1;
        }
    }
}

fn reap(tasks: &mut JoinSet<ChunkResult>, summary: &mut RecorderSummary) {
    while let Some(joined) = tasks.try_join_next() {
        settle(joined, summary);
    }
}

async fn drain(tasks: &mut JoinSet<ChunkResult>, summary: &mut RecorderSummary) {
    while let Some(joined) = tasks.join_next().await {
        settle(joined, summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::time::Instant;

    use crate::capture::AudioClip;
    use crate::config::CaptureConfig;
    use crate::fetch::Recognition;
    use crate::persistent::Persistent;
    use crate::platform::{PermissionStatus, StaticPermissions};
    use crate::types::{SetId, UserId};

    #[derive(Default)]
    struct Counters {
        begins: AtomicU64,
        discards: AtomicU64,
        begin_times: Mutex<Vec<Instant>>
    }

    struct FakeHandle(Arc<Counters>);

    #[async_trait]
    impl CaptureHandle for FakeHandle {
        async fn finish(self: Box<Self>) -> Result<AudioClip, SetListError> {
            Ok( AudioClip {
                bytes: vec![1, 2, 3],
                file_name: "chunk.wav".into(),
                mime: "audio/wav".into(),
                captured_at: Utc::now()
            })
        }

        async fn discard(self: Box<Self>) {
            self.0.discards.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Hands out captures until `fail_after` begins, then loses the device
    struct FakeSource {
        counters: Arc<Counters>,
        fail_after: Option<u64>
    }

    #[async_trait]
    impl AudioSource for FakeSource {
        async fn begin(&self, _: &CaptureConfig) -> Result<Box<dyn CaptureHandle>, SetListError> {
            let n = self.counters.begins.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_after.is_some_and(|limit| n > limit) {
                return Err(SetListError::DeviceUnavailable("microphone unplugged".into()));
            }
            self.counters.begin_times.lock().unwrap().push(Instant::now());
            Ok(Box::new(FakeHandle(self.counters.clone())))
        }
    }

    /// Takes `delay` per clip, optionally failing every call
    struct SlowRecognizer {
        delay: Duration,
        fail: bool,
        spans: Mutex<Vec<(Instant, Instant)>>
    }

    #[async_trait]
    impl Recognizer for SlowRecognizer {
        async fn identify(&self, _: &AudioClip) -> Result<Recognition, SetListError> {
            let start = Instant::now();
            sleep(self.delay).await;
            self.spans.lock().unwrap().push((start, Instant::now()));
            if self.fail {
                return Err(SetListError::Network("status 503".into()));
            }
            Ok(Recognition::no_match())
        }
    }

    fn cfg(record_s: u64, idle_s: u64) -> RecordingConfig {
        RecordingConfig {
            record_window: Duration::from_secs(record_s),
            idle_window: Duration::from_secs(idle_s),
            shutdown_grace: Duration::from_secs(2),
            ..RecordingConfig::default()
        }
    }

    /// Pipeline over a fresh store, then freeze the clock. The pool must
    /// connect on real time or its acquire timeout fires under auto-advance.
    async fn pipeline() -> Arc<MergePipeline> {
        let store = Arc::new(Persistent::init("sqlite::memory:").await.unwrap());
        let pipeline = MergePipeline::new(store, SetId("set".into()), UserId("user".into()), 40);
        tokio::time::pause();
        Arc::new(pipeline)
    }

    fn recorder(
        cfg: RecordingConfig,
        counters: Arc<Counters>,
        fail_after: Option<u64>,
        recognizer: Arc<SlowRecognizer>,
        pipeline: Arc<MergePipeline>
    ) -> Recorder {
        Recorder::new(
            &cfg,
            Arc::new(StaticPermissions::granted()),
            Arc::new(FakeSource { counters, fail_after }),
            recognizer,
            pipeline
        )
    }

    fn recognizer(delay_s: u64, fail: bool) -> Arc<SlowRecognizer> {
        Arc::new(SlowRecognizer {
            delay: Duration::from_secs(delay_s),
            fail,
            spans: Mutex::new(Vec::new())
        })
    }

    #[tokio::test]
    async fn next_capture_overlaps_identification() {
        let counters = Arc::new(Counters::default());
        let slow = recognizer(25, false);
        let rec = recorder(cfg(10, 1), counters.clone(), None, slow.clone(), pipeline().await);
        let stop = rec.shutdown();
        let run = tokio::spawn(rec.run());

        sleep(Duration::from_secs(40)).await;
        stop.cancel();
        let summary = run.await.unwrap().unwrap();
        assert!(summary.chunks_captured >= 2);

        let begins = counters.begin_times.lock().unwrap().clone();
        let spans = slow.spans.lock().unwrap().clone();
        assert!(!spans.is_empty());
        let (start, end) = spans[0];
        assert!(
            begins.iter().any(|b| *b > start && *b < end),
            "a capture began while the first clip was being identified"
        );
    }

    #[tokio::test]
    async fn recognition_failures_do_not_stop_the_loop() {
        let counters = Arc::new(Counters::default());
        let rec = recorder(cfg(10, 20), counters.clone(), None, recognizer(1, true), pipeline().await);
        let stop = rec.shutdown();
        let run = tokio::spawn(rec.run());

        sleep(Duration::from_secs(100)).await;
        stop.cancel();
        let summary = run.await.unwrap().unwrap();

        assert!(summary.chunks_captured >= 3, "{summary:?}");
        assert!(summary.identifications_failed >= 3, "{summary:?}");
        assert_eq!(summary.chunks_failed, 0);
    }

    #[tokio::test]
    async fn lost_device_is_fatal() {
        let counters = Arc::new(Counters::default());
        let rec = recorder(cfg(10, 20), counters.clone(), Some(1), recognizer(1, false), pipeline().await);
        let state = rec.state();

        let err = rec.run().await.unwrap_err();
        assert!(matches!(err, SetListError::DeviceUnavailable(_)));
        assert!(matches!(*state.borrow(), RecorderState::Failed(_)));
        assert_eq!(counters.begins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stop_discards_capture_in_progress() {
        let counters = Arc::new(Counters::default());
        let rec = recorder(cfg(10, 20), counters.clone(), None, recognizer(1, false), pipeline().await);
        let stop = rec.shutdown();
        let mut state = rec.state();
        let run = tokio::spawn(rec.run());

        state.wait_for(|s| matches!(s, RecorderState::Recording { chunk: 1 })).await.unwrap();
        sleep(Duration::from_secs(3)).await;
        stop.cancel();
        stop.cancel();

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.chunks_captured, 0);
        assert_eq!(counters.begins.load(Ordering::SeqCst), 1);
        assert_eq!(counters.discards.load(Ordering::SeqCst), 1);
        assert_eq!(*state.borrow(), RecorderState::Idle);
    }

    #[tokio::test]
    async fn slow_identification_is_aborted_after_grace() {
        let counters = Arc::new(Counters::default());
        let rec = recorder(cfg(10, 20), counters, None, recognizer(60, false), pipeline().await);
        let stop = rec.shutdown();
        let run = tokio::spawn(rec.run());

        sleep(Duration::from_secs(15)).await;
        stop.cancel();
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.chunks_captured, 1);
        assert_eq!(summary.identifications_aborted, 1);
    }

    #[tokio::test]
    async fn denied_microphone_never_captures() {
        let counters = Arc::new(Counters::default());
        let rec = Recorder::new(
            &cfg(10, 20),
            Arc::new(StaticPermissions {
                microphone: PermissionStatus::Denied,
                location: PermissionStatus::Granted
            }),
            Arc::new(FakeSource { counters: counters.clone(), fail_after: None }),
            recognizer(1, false),
            pipeline().await
        );
        let err = rec.run().await.unwrap_err();
        assert!(matches!(err, SetListError::PermissionDenied(_)));
        assert_eq!(counters.begins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn state_returns_to_idle_once_identification_settles() {
        let counters = Arc::new(Counters::default());
        let rec = recorder(cfg(10, 20), counters, None, recognizer(1, false), pipeline().await);
        let stop = rec.shutdown();
        let mut state = rec.state();
        let run = tokio::spawn(rec.run());

        state.wait_for(|s| matches!(s, RecorderState::Identifying { chunk: 1 })).await.unwrap();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(*state.borrow(), RecorderState::Idle, "resting with nothing in flight");

        state.wait_for(|s| matches!(s, RecorderState::Recording { chunk: 2 })).await.unwrap();
        stop.cancel();
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.chunks_captured, 1);
        assert_eq!(summary.identifications_failed, 0);
    }

    #[tokio::test]
    async fn state_stays_identifying_while_a_clip_is_in_flight() {
        let counters = Arc::new(Counters::default());
        let rec = recorder(cfg(10, 20), counters, None, recognizer(8, false), pipeline().await);
        let stop = rec.shutdown();
        let mut state = rec.state();
        let run = tokio::spawn(rec.run());

        state.wait_for(|s| matches!(s, RecorderState::Identifying { chunk: 1 })).await.unwrap();
        sleep(Duration::from_secs(4)).await;
        assert_eq!(*state.borrow(), RecorderState::Identifying { chunk: 1 });
        sleep(Duration::from_secs(8)).await;
        assert_eq!(*state.borrow(), RecorderState::Idle);

        stop.cancel();
        run.await.unwrap().unwrap();
    }
}
