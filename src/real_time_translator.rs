//! The scheduling core: wires capture, VAD, segmentation, the ASR pool, the
//! MT worker and the output dispatcher together with bounded queues, and owns
//! the pipeline lifecycle.
//!
//! One long-lived task per role on the multi-threaded runtime; port inference
//! runs on the blocking pool. Ordering across the concurrent ASR pool is
//! restored by a reorder buffer in front of the MT worker, so the subscriber
//! always sees events in segment-sequence order, and within a segment in
//! `(draft..., final)` order.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio_ring::{AudioFrame, CaptureItem, FrameRing};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::events::{DropReason, PipelineEvent, SegmentDescriptor, Stage};
use crate::ports::{AsrMode, AsrOutput, AsrPort, MtPort, PipelinePorts, Clock};
use crate::post_processor::{self, Outcome};
use crate::queue::{BoundedQueue, QueueDepth};
use crate::reorder_buffer::ReorderBuffer;
use crate::segment_tracker::SegmentTracker;
use crate::segment_writer;
use crate::segmenter::{ActiveSegmentSlot, Segmenter, SegmenterOutput, SpeechSegment};
use crate::streaming_recognizer::{
    should_dispatch_draft, AsrKind, AsrResult, StreamingRecognizer,
};
use crate::translation_processor::{TranslationProcessor, TranslationResult};
use crate::translation_stats::{
    HealthSnapshot, MetricsSnapshot, QueueDepths, SegmentLatency, TranslationStats,
};

/// How long a blocked push into `seg->asr` / `asr->mt` may stall the producer
/// before the newest item is dropped.
const QUEUE_BLOCK_MS: u64 = 50;
/// Queue-depth monitor cadence.
const MONITOR_INTERVAL_MS: u64 = 250;
/// Consecutive warning-level samples before the monitor escalates to a log.
const MONITOR_WARN_STREAK: u32 = 3;
/// Delay before the last MT retry of a failed final.
const MT_RETRY_DELAY_MS: u64 = 200;
/// Upstream queues above this ratio suppress draft ticks.
const DRAFT_UPSTREAM_RATIO: f64 = 0.60;
/// Output queue above this ratio suppresses draft ticks.
const DRAFT_OUTPUT_RATIO: f64 = 0.80;

/// Items between the VAD and segmentation tasks.
enum VadItem {
    Frame(crate::vad_processor::VadFrame),
    Reset {
        expected_sample: u64,
        received_sample: u64,
    },
}

/// Jobs consumed by the ASR pool.
enum AsrJob {
    Draft {
        descriptor: SegmentDescriptor,
        audio: Vec<f32>,
        audio_ms: u64,
    },
    Final {
        segment: SpeechSegment,
    },
    Reset {
        order_seq: u64,
        expected_sample: u64,
        received_sample: u64,
    },
}

/// Results flowing from the ASR pool to the MT worker, unordered.
enum AsrItem {
    Draft {
        descriptor: SegmentDescriptor,
        result: AsrResult,
    },
    Final {
        descriptor: SegmentDescriptor,
        result: AsrResult,
    },
    Dropped {
        segment_id: Uuid,
        seq: u64,
        stage: Stage,
        reason: DropReason,
    },
    Reset {
        order_seq: u64,
        expected_sample: u64,
        received_sample: u64,
    },
}

impl AsrItem {
    fn order_seq(&self) -> u64 {
        match self {
            AsrItem::Draft { result, .. } | AsrItem::Final { result, .. } => result.seq,
            AsrItem::Dropped { seq, .. } => *seq,
            AsrItem::Reset { order_seq, .. } => *order_seq,
        }
    }

    fn disposable(&self) -> bool {
        matches!(self, AsrItem::Draft { .. })
    }
}

type Subscriber = Box<dyn FnMut(PipelineEvent) + Send + 'static>;

/// The real-time streaming voice translation engine.
///
/// Construction validates the configuration; `start` spins up the role tasks
/// and begins consuming pushed frames; `stop` drains in-flight work within
/// the grace period and audits the segment registry. `stop` is idempotent.
pub struct TranslatePipeline {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    stats: Arc<Mutex<TranslationStats>>,
    tracker: Arc<SegmentTracker>,

    ring: Arc<FrameRing>,
    vad_seg: Arc<BoundedQueue<VadItem>>,
    seg_asr: Arc<BoundedQueue<AsrJob>>,
    asr_mt: Arc<BoundedQueue<AsrItem>>,
    mt_out: Arc<BoundedQueue<PipelineEvent>>,

    running: Arc<AtomicBool>,
    accepting: Arc<AtomicBool>,
    drafts_paused: Arc<AtomicBool>,
    expected_sample: Arc<AtomicU64>,
    asr_in_flight: Arc<AtomicUsize>,

    vad_breaker: Arc<CircuitBreaker>,
    asr_breaker: Arc<CircuitBreaker>,
    mt_breaker: Arc<CircuitBreaker>,

    vad_port: Option<Box<dyn crate::ports::VadPort>>,
    asr_port: Arc<dyn AsrPort>,
    mt_port: Arc<dyn MtPort>,

    active_segment: ActiveSegmentSlot,
    recognizer: Arc<StreamingRecognizer>,

    handles: Vec<(&'static str, JoinHandle<()>)>,
    started: bool,
    stopped: bool,
}

impl TranslatePipeline {
    /// Validate the configuration and wire the ports. No threads start here.
    pub fn new(config: AppConfig, ports: PipelinePorts) -> Result<Self, PipelineError> {
        config.validate()?;

        let clock = ports.clock;
        let recognizer = Arc::new(StreamingRecognizer::new(
            config.recognizer.clone(),
            config.translator.source_lang.clone(),
        ));
        Ok(Self {
            ring: Arc::new(FrameRing::new(config.queues.audio_to_vad)),
            vad_seg: Arc::new(BoundedQueue::new(config.queues.vad_to_seg)),
            seg_asr: Arc::new(BoundedQueue::new(config.queues.seg_to_asr)),
            asr_mt: Arc::new(BoundedQueue::new(config.queues.asr_to_mt)),
            mt_out: Arc::new(BoundedQueue::new(config.queues.mt_to_out)),
            running: Arc::new(AtomicBool::new(false)),
            accepting: Arc::new(AtomicBool::new(false)),
            drafts_paused: Arc::new(AtomicBool::new(false)),
            expected_sample: Arc::new(AtomicU64::new(u64::MAX)),
            asr_in_flight: Arc::new(AtomicUsize::new(0)),
            vad_breaker: Arc::new(CircuitBreaker::new("vad", clock.clone())),
            asr_breaker: Arc::new(CircuitBreaker::new("asr", clock.clone())),
            mt_breaker: Arc::new(CircuitBreaker::new("mt", clock.clone())),
            vad_port: Some(ports.vad),
            asr_port: ports.asr,
            mt_port: ports.mt,
            active_segment: Arc::new(Mutex::new(None)),
            recognizer,
            stats: Arc::new(Mutex::new(TranslationStats::new())),
            tracker: Arc::new(SegmentTracker::new()),
            handles: Vec::new(),
            started: false,
            stopped: false,
            clock,
            config,
        })
    }

    /// Spin up the role tasks and begin consuming pushed frames. Events are
    /// delivered to `on_event` from the output task only.
    pub fn start(
        &mut self,
        on_event: impl FnMut(PipelineEvent) + Send + 'static,
    ) -> Result<(), PipelineError> {
        if self.started {
            return Err(PipelineError::AlreadyRunning);
        }
        let vad_port = self.vad_port.take().ok_or(PipelineError::AlreadyRunning)?;
        self.started = true;
        self.running.store(true, Ordering::SeqCst);
        self.accepting.store(true, Ordering::SeqCst);
        info!(
            source = %self.config.translator.source_lang,
            target = %self.config.translator.target_lang,
            asr_workers = self.config.recognizer.asr_workers,
            "translation pipeline starting"
        );

        self.handles.push(("vad", self.spawn_vad_task(vad_port)));
        self.handles.push(("segmenter", self.spawn_segmenter_task()));
        let pool_remaining = Arc::new(AtomicUsize::new(self.config.recognizer.asr_workers));
        for worker in 0..self.config.recognizer.asr_workers {
            self.handles
                .push(("asr", self.spawn_asr_worker(worker, pool_remaining.clone())));
        }
        self.handles.push(("mt", self.spawn_mt_task()));
        self.handles
            .push(("output", self.spawn_output_task(Box::new(on_event))));
        self.handles.push(("draft-timer", self.spawn_draft_timer()));
        self.handles.push(("monitor", self.spawn_monitor_task()));
        Ok(())
    }

    /// Push one capture frame. Called by the capture layer; real-time safe
    /// (one short lock, no waiting). Frames pushed while the pipeline is not
    /// accepting are ignored.
    pub fn push_frame(&self, samples: &[f32], first_sample: u64, capture_time: DateTime<Utc>) {
        if !self.accepting.load(Ordering::Relaxed) {
            return;
        }
        let expected = self.expected_sample.load(Ordering::Relaxed);
        if expected != u64::MAX && first_sample != expected {
            warn!(
                expected,
                received = first_sample,
                "capture gap detected, resetting session"
            );
            self.ring.push(CaptureItem::Reset {
                expected_sample: expected,
                received_sample: first_sample,
            });
        }
        self.expected_sample
            .store(first_sample + samples.len() as u64, Ordering::Relaxed);

        let frame = AudioFrame::new(samples.to_vec(), first_sample, capture_time);
        if self.ring.push(CaptureItem::Frame(frame)) {
            if let Some(mut stats) = self.stats.try_lock() {
                stats.record_frame_drop(1);
            }
        }
    }

    /// Pause or resume draft decodes. Finals are unaffected.
    pub fn set_drafts_paused(&self, paused: bool) {
        self.drafts_paused.store(paused, Ordering::Relaxed);
    }

    /// Frozen read-only view of counters, latency windows and queue depths.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = self.stats.lock().snapshot(Some(self.queue_depths()));
        snapshot.segments_created = self.tracker.created_count();
        snapshot.segments_emitted = self.tracker.emitted_count();
        snapshot.segments_dropped = self.tracker.dropped_count();
        snapshot
    }

    fn queue_depths(&self) -> QueueDepths {
        QueueDepths {
            audio_to_vad: QueueDepth {
                len: self.ring.len(),
                capacity: self.ring.capacity(),
            },
            vad_to_seg: self.vad_seg.depth(),
            seg_to_asr: self.seg_asr.depth(),
            asr_to_mt: self.asr_mt.depth(),
            mt_to_out: self.mt_out.depth(),
        }
    }

    /// Stop accepting audio, flush the open segment, drain in-flight work
    /// within the grace period, then join all tasks and audit the tracker.
    /// Idempotent; returns within the grace period plus one second.
    pub async fn stop(&mut self) {
        if self.stopped || !self.started {
            self.stopped = true;
            return;
        }
        self.stopped = true;
        info!("translation pipeline stopping");

        self.accepting.store(false, Ordering::SeqCst);
        // Closing the ring cascades: each role task drains its inbox, closes
        // its downstream queue and exits.
        self.ring.close();

        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.shutdown_grace_ms);
        let handles = std::mem::take(&mut self.handles);
        for (name, handle) in handles {
            let now = tokio::time::Instant::now();
            let budget = deadline.saturating_duration_since(now);
            let abort = handle.abort_handle();
            match tokio::time::timeout(budget, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    if join_err.is_panic() {
                        error!(task = name, "pipeline task panicked");
                    }
                }
                Err(_) => {
                    warn!(task = name, "pipeline task did not drain in time, aborting");
                    abort.abort();
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        self.vad_seg.close();
        self.seg_asr.close();
        self.asr_mt.close();
        self.mt_out.close();

        let violations = self.tracker.audit_at_stop(self.clock.now_ms());
        if !violations.is_empty() {
            warn!(
                count = violations.len(),
                "segments force-terminated at shutdown"
            );
        }
        info!(
            created = self.tracker.created_count(),
            emitted = self.tracker.emitted_count(),
            dropped = self.tracker.dropped_count(),
            "translation pipeline stopped"
        );
    }

    // ------------------------------------------------------------------
    // Role tasks
    // ------------------------------------------------------------------

    fn spawn_vad_task(&self, port: Box<dyn crate::ports::VadPort>) -> JoinHandle<()> {
        let ring = self.ring.clone();
        let vad_seg = self.vad_seg.clone();
        let stats = self.stats.clone();
        let mut vad = crate::vad_processor::AdaptiveVad::new(
            self.config.vad.clone(),
            self.config.audio.frame_ms as u64,
            port,
            self.vad_breaker.clone(),
            self.clock.clone(),
        );

        tokio::spawn(async move {
            debug!("vad task started");
            loop {
                match ring.pop_timeout(Duration::from_millis(100)).await {
                    Some(CaptureItem::Frame(frame)) => {
                        let vad_frame = vad.process_frame(&frame);
                        vad_seg.push_drop_oldest(VadItem::Frame(vad_frame));
                        if vad.frames_seen() % 32 == 0 {
                            stats
                                .lock()
                                .set_vad_frames(vad.frames_seen(), vad.frames_prefiltered());
                        }
                    }
                    Some(CaptureItem::Reset {
                        expected_sample,
                        received_sample,
                    }) => {
                        vad.reset();
                        // A reset must never be lost to the drop-oldest
                        // policy; block until it is queued.
                        let _ = vad_seg
                            .push(VadItem::Reset {
                                expected_sample,
                                received_sample,
                            })
                            .await;
                    }
                    None => {
                        if ring.is_closed() {
                            break;
                        }
                    }
                }
            }
            stats
                .lock()
                .set_vad_frames(vad.frames_seen(), vad.frames_prefiltered());
            vad_seg.close();
            debug!("vad task stopped");
        })
    }

    fn spawn_segmenter_task(&self) -> JoinHandle<()> {
        let vad_seg = self.vad_seg.clone();
        let seg_asr = self.seg_asr.clone();
        let asr_mt = self.asr_mt.clone();
        let tracker = self.tracker.clone();
        let stats = self.stats.clone();
        let recognizer = self.recognizer.clone();
        let clock = self.clock.clone();
        let debug_config = self.config.debug.clone();
        let sample_rate = self.config.audio.sample_rate;
        let mut segmenter = Segmenter::new(
            self.config.segmenter.clone(),
            self.config.audio.frame_ms as u64,
            sample_rate,
            self.clock.clone(),
            self.active_segment.clone(),
        );

        tokio::spawn(async move {
            debug!("segmenter task started");

            async fn handle_outputs(
                outputs: Vec<SegmenterOutput>,
                seg_asr: &BoundedQueue<AsrJob>,
                asr_mt: &BoundedQueue<AsrItem>,
                tracker: &SegmentTracker,
                stats: &Mutex<TranslationStats>,
                recognizer: &StreamingRecognizer,
                clock: &dyn Clock,
                debug_config: &crate::config::DebugConfig,
                sample_rate: u32,
            ) {
                for output in outputs {
                    match output {
                        SegmenterOutput::Opened(descriptor) => {
                            tracker.register(descriptor.id, descriptor.seq, clock.now_ms());
                            debug!(seq = descriptor.seq, "segment opened");
                        }
                        SegmenterOutput::Closed(segment) => {
                            tracker.record_vad_closed(
                                segment.id,
                                clock.now_ms(),
                                segment.last_audio_ms,
                            );
                            segment_writer::save_segment_wav(&segment, sample_rate, debug_config);
                            let id = segment.id;
                            let seq = segment.seq;
                            let push = seg_asr
                                .push_timeout(
                                    AsrJob::Final { segment },
                                    Duration::from_millis(QUEUE_BLOCK_MS),
                                )
                                .await;
                            if push.is_err() {
                                warn!(seq, "asr queue full, dropping segment final");
                                recognizer.discard_segment(id);
                                let _ = asr_mt
                                    .push(AsrItem::Dropped {
                                        segment_id: id,
                                        seq,
                                        stage: Stage::Asr,
                                        reason: DropReason::BackpressureDrop,
                                    })
                                    .await;
                            }
                        }
                        SegmenterOutput::DiscardedTooShort => {
                            stats.lock().segments_too_short += 1;
                        }
                    }
                }
            }

            while let Some(item) = vad_seg.pop().await {
                match item {
                    VadItem::Frame(vad_frame) => {
                        let outputs = segmenter.process(vad_frame);
                        if !outputs.is_empty() {
                            handle_outputs(
                                outputs,
                                &seg_asr,
                                &asr_mt,
                                &tracker,
                                &stats,
                                &recognizer,
                                clock.as_ref(),
                                &debug_config,
                                sample_rate,
                            )
                            .await;
                        }
                    }
                    VadItem::Reset {
                        expected_sample,
                        received_sample,
                    } => {
                        let outputs = segmenter.flush();
                        handle_outputs(
                            outputs,
                            &seg_asr,
                            &asr_mt,
                            &tracker,
                            &stats,
                            &recognizer,
                            clock.as_ref(),
                            &debug_config,
                            sample_rate,
                        )
                        .await;
                        let _ = seg_asr
                            .push(AsrJob::Reset {
                                order_seq: segmenter.next_seq(),
                                expected_sample,
                                received_sample,
                            })
                            .await;
                    }
                }
            }

            // Shutdown: flush the open segment before closing downstream.
            let outputs = segmenter.flush();
            handle_outputs(
                outputs,
                &seg_asr,
                &asr_mt,
                &tracker,
                &stats,
                &recognizer,
                clock.as_ref(),
                &debug_config,
                sample_rate,
            )
            .await;
            seg_asr.close();
            debug!("segmenter task stopped");
        })
    }

    fn spawn_asr_worker(
        &self,
        worker_index: usize,
        pool_remaining: Arc<AtomicUsize>,
    ) -> JoinHandle<()> {
        let seg_asr = self.seg_asr.clone();
        let asr_mt = self.asr_mt.clone();
        let asr_port = self.asr_port.clone();
        let breaker = self.asr_breaker.clone();
        let recognizer = self.recognizer.clone();
        let tracker = self.tracker.clone();
        let stats = self.stats.clone();
        let clock = self.clock.clone();
        let in_flight = self.asr_in_flight.clone();
        let post_config = self.config.post_process.clone();
        let draft_timeout = Duration::from_millis(self.config.recognizer.draft_timeout_ms);
        let final_timeout = Duration::from_millis(self.config.recognizer.final_timeout_ms);

        tokio::spawn(async move {
            debug!(worker = worker_index, "asr worker started");
            while let Some(job) = seg_asr.pop().await {
                match job {
                    AsrJob::Draft {
                        descriptor,
                        audio,
                        audio_ms,
                    } => {
                        if !breaker.allows_call() {
                            stats.lock().drafts_skipped += 1;
                            continue;
                        }
                        let language = recognizer.request_language(descriptor.id);
                        let started_ms = clock.now_ms();
                        in_flight.fetch_add(1, Ordering::SeqCst);
                        let outcome = run_asr(
                            asr_port.clone(),
                            audio,
                            language,
                            AsrMode::Fast,
                            draft_timeout,
                        )
                        .await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        let compute_ms = clock.now_ms().saturating_sub(started_ms);

                        match outcome {
                            Ok(output) => {
                                breaker.record_success();
                                match post_processor::process_transcript(
                                    &output.text,
                                    output.confidence,
                                    &output.language,
                                    &post_config,
                                ) {
                                    Outcome::Clean(text) => {
                                        let cleaned = AsrOutput { text, ..output };
                                        if let Some(result) = recognizer.admit_draft(
                                            descriptor.id,
                                            descriptor.seq,
                                            cleaned,
                                            audio_ms,
                                            compute_ms,
                                        ) {
                                            tracker.record_asr_draft(
                                                descriptor.id,
                                                clock.now_ms(),
                                            );
                                            let item = AsrItem::Draft { descriptor, result };
                                            if asr_mt.try_push(item).is_err() {
                                                stats.lock().drafts_skipped += 1;
                                            }
                                        }
                                    }
                                    Outcome::Skip(reason) => {
                                        debug!(?reason, "draft rejected by post-processor");
                                        stats.lock().hallucinations_filtered += 1;
                                    }
                                }
                            }
                            Err(AsrFailure::Port(fatal)) => {
                                breaker.record_failure(fatal);
                            }
                            Err(AsrFailure::Timeout) => {
                                breaker.record_failure(false);
                            }
                        }
                    }
                    AsrJob::Final { segment } => {
                        handle_final_job(
                            segment,
                            &asr_port,
                            &breaker,
                            &recognizer,
                            &tracker,
                            &stats,
                            clock.as_ref(),
                            &in_flight,
                            &asr_mt,
                            &post_config,
                            final_timeout,
                        )
                        .await;
                    }
                    AsrJob::Reset {
                        order_seq,
                        expected_sample,
                        received_sample,
                    } => {
                        let _ = asr_mt
                            .push(AsrItem::Reset {
                                order_seq,
                                expected_sample,
                                received_sample,
                            })
                            .await;
                    }
                }
            }
            // Last worker out closes the result queue.
            if pool_remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                asr_mt.close();
            }
            debug!(worker = worker_index, "asr worker stopped");
        })
    }

    fn spawn_mt_task(&self) -> JoinHandle<()> {
        let asr_mt = self.asr_mt.clone();
        let mt_out = self.mt_out.clone();
        let mt_port = self.mt_port.clone();
        let breaker = self.mt_breaker.clone();
        let tracker = self.tracker.clone();
        let stats = self.stats.clone();
        let clock = self.clock.clone();
        let in_flight = self.asr_in_flight.clone();
        let mt_timeout = Duration::from_millis(self.config.translator.mt_timeout_ms);
        let mut translator = TranslationProcessor::new(self.config.translator.clone());
        let mut reorder: ReorderBuffer<AsrItem> =
            ReorderBuffer::new(self.config.recognizer.asr_workers + 1);

        tokio::spawn(async move {
            debug!("mt task started");
            let mut announced: Option<u64> = None;
            loop {
                while let Some(item) = reorder.next_ready() {
                    process_mt_item(
                        item,
                        &mut translator,
                        &mut reorder,
                        &mut announced,
                        &mt_port,
                        &breaker,
                        &tracker,
                        &stats,
                        clock.as_ref(),
                        &in_flight,
                        &mt_out,
                        mt_timeout,
                    )
                    .await;
                }
                match asr_mt.pop().await {
                    Some(item) => {
                        let disposable = item.disposable();
                        reorder.push(item.order_seq(), item, disposable);
                    }
                    None => break,
                }
            }
            // Drain whatever is still held, in order, so no final is lost.
            for item in reorder.drain() {
                process_mt_item(
                    item,
                    &mut translator,
                    &mut reorder,
                    &mut announced,
                    &mt_port,
                    &breaker,
                    &tracker,
                    &stats,
                    clock.as_ref(),
                    &in_flight,
                    &mt_out,
                    mt_timeout,
                )
                .await;
            }
            mt_out.close();
            debug!("mt task stopped");
        })
    }

    fn spawn_output_task(&self, mut subscriber: Subscriber) -> JoinHandle<()> {
        let mt_out = self.mt_out.clone();
        let tracker = self.tracker.clone();
        let stats = self.stats.clone();
        let clock = self.clock.clone();
        let debug_config = self.config.debug.clone();

        tokio::spawn(async move {
            debug!("output task started");
            // Final-ASR compute times, remembered until the matching
            // translation arrives.
            let mut asr_final_ms: std::collections::HashMap<Uuid, u64> =
                std::collections::HashMap::new();

            while let Some(event) = mt_out.pop().await {
                let now = clock.now_ms();
                match &event {
                    PipelineEvent::NewSegment(descriptor) => {
                        tracker.record_first_output(descriptor.id, now);
                    }
                    PipelineEvent::DraftAsr(result) | PipelineEvent::FinalAsr(result) => {
                        tracker.record_first_output(result.segment_id, now);
                        if result.kind == AsrKind::Final {
                            asr_final_ms.insert(result.segment_id, result.compute_time_ms);
                        }
                    }
                    PipelineEvent::Translation(result) => {
                        tracker.record_first_output(result.segment_id, now);
                        if result.kind == AsrKind::Final {
                            tracker.mark_emitted(result.segment_id, now);
                            if let Err(e) =
                                segment_writer::append_translation_history(result, &debug_config)
                            {
                                warn!(error = %e, "failed to append translation history");
                            }
                            if let Some(trace) = tracker.trace(result.segment_id) {
                                let latency = SegmentLatency {
                                    ttft_ms: trace
                                        .first_output_ms
                                        .unwrap_or(now)
                                        .saturating_sub(trace.created_ms),
                                    meaning_ms: now
                                        .saturating_sub(trace.last_audio_ms.unwrap_or(now)),
                                    ear_voice_ms: now
                                        .saturating_sub(trace.vad_closed_ms.unwrap_or(now)),
                                    asr_ms: asr_final_ms
                                        .remove(&result.segment_id)
                                        .unwrap_or_default(),
                                    mt_ms: result.compute_time_ms,
                                    overlap_savings_ms: 0,
                                };
                                stats.lock().record_segment_latency(latency);
                            }
                        }
                    }
                    PipelineEvent::Dropped {
                        segment_id, reason, ..
                    } => {
                        tracker.mark_dropped(*segment_id, *reason, now);
                        asr_final_ms.remove(segment_id);
                    }
                    PipelineEvent::SessionReset { .. } | PipelineEvent::HealthTick(_) => {}
                }
                subscriber(event);
            }
            debug!("output task stopped");
        })
    }

    fn spawn_draft_timer(&self) -> JoinHandle<()> {
        let running = self.running.clone();
        let seg_asr = self.seg_asr.clone();
        let ring = self.ring.clone();
        let vad_seg = self.vad_seg.clone();
        let mt_out = self.mt_out.clone();
        let active = self.active_segment.clone();
        let stats = self.stats.clone();
        let drafts_paused = self.drafts_paused.clone();
        let in_flight = self.asr_in_flight.clone();
        let breaker = self.asr_breaker.clone();
        let recognizer_config = self.config.recognizer.clone();
        let interval = Duration::from_millis(self.config.recognizer.draft_interval_ms);

        tokio::spawn(async move {
            debug!("draft timer started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the immediate first tick
            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                if !running.load(Ordering::Relaxed) || ring.is_closed() {
                    break;
                }

                // Orchestrator-level suppression: congested queues or a busy
                // pool mean this tick's compute is better spent elsewhere.
                let ring_ratio = ring.len() as f64 / ring.capacity() as f64;
                let upstream_busy = ring_ratio > DRAFT_UPSTREAM_RATIO
                    || vad_seg.depth().ratio() > DRAFT_UPSTREAM_RATIO
                    || seg_asr.depth().ratio() > DRAFT_UPSTREAM_RATIO;
                let pool_busy = in_flight.load(Ordering::SeqCst) >= 2;
                let output_busy = mt_out.depth().ratio() > DRAFT_OUTPUT_RATIO;
                if upstream_busy || pool_busy || output_busy || !breaker.allows_call() {
                    if active.lock().is_some() {
                        stats.lock().drafts_skipped += 1;
                    }
                    continue;
                }

                let job = {
                    let mut slot = active.lock();
                    match slot.as_mut() {
                        Some(segment) => {
                            let queued = seg_asr.depth().len;
                            let paused = drafts_paused.load(Ordering::Relaxed);
                            match should_dispatch_draft(
                                segment,
                                in_flight.load(Ordering::SeqCst) + queued,
                                paused,
                                &recognizer_config,
                            ) {
                                Ok(()) => {
                                    let audio_ms = segment.audio_ms();
                                    segment.last_draft_audio_ms = audio_ms;
                                    Some(AsrJob::Draft {
                                        descriptor: SegmentDescriptor {
                                            id: segment.id,
                                            seq: segment.seq,
                                            start_sample: segment.start_sample,
                                            pre_roll_ms: segment.pre_roll_ms,
                                            is_partial: segment.is_partial,
                                            creation_time: segment.creation_time,
                                        },
                                        audio: segment.flatten(),
                                        audio_ms,
                                    })
                                }
                                Err(skip) => {
                                    debug!(?skip, "draft tick skipped");
                                    stats.lock().drafts_skipped += 1;
                                    None
                                }
                            }
                        }
                        None => None,
                    }
                };
                if let Some(job) = job {
                    if seg_asr.try_push(job).is_err() {
                        stats.lock().drafts_skipped += 1;
                    }
                }
            }
            debug!("draft timer stopped");
        })
    }

    fn spawn_monitor_task(&self) -> JoinHandle<()> {
        let running = self.running.clone();
        let ring = self.ring.clone();
        let vad_seg = self.vad_seg.clone();
        let seg_asr = self.seg_asr.clone();
        let asr_mt = self.asr_mt.clone();
        let mt_out = self.mt_out.clone();
        let tracker = self.tracker.clone();
        let in_flight = self.asr_in_flight.clone();
        let clock = self.clock.clone();

        tokio::spawn(async move {
            debug!("queue monitor started");
            let mut ticker =
                tokio::time::interval(Duration::from_millis(MONITOR_INTERVAL_MS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut warn_streak: u32 = 0;
            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                if ring.is_closed() {
                    break;
                }
                let queues = QueueDepths {
                    audio_to_vad: QueueDepth {
                        len: ring.len(),
                        capacity: ring.capacity(),
                    },
                    vad_to_seg: vad_seg.depth(),
                    seg_to_asr: seg_asr.depth(),
                    asr_to_mt: asr_mt.depth(),
                    mt_to_out: mt_out.depth(),
                };
                if queues.any_warning() {
                    warn_streak += 1;
                    if warn_streak == MONITOR_WARN_STREAK {
                        warn!(?queues, "pipeline queues sustained above warning watermark");
                    }
                } else {
                    warn_streak = 0;
                }
                let snapshot = HealthSnapshot {
                    at_ms: clock.now_ms(),
                    queues,
                    asr_in_flight: in_flight.load(Ordering::SeqCst),
                    segments_in_flight: tracker.in_flight_count(),
                };
                // Health ticks are best-effort; never block on a full
                // output queue.
                let _ = mt_out.try_push(PipelineEvent::HealthTick(snapshot));
            }
            debug!("queue monitor stopped");
        })
    }
}

enum AsrFailure {
    /// Port error; `true` means fatal.
    Port(bool),
    Timeout,
}

async fn run_asr(
    port: Arc<dyn AsrPort>,
    audio: Vec<f32>,
    language: Option<String>,
    mode: AsrMode,
    timeout: Duration,
) -> Result<AsrOutput, AsrFailure> {
    let call = tokio::task::spawn_blocking(move || {
        port.transcribe(&audio, language.as_deref(), mode)
    });
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(Ok(output))) => Ok(output),
        Ok(Ok(Err(err))) => {
            debug!(error = %err, "asr port call failed");
            Err(AsrFailure::Port(err.is_fatal()))
        }
        Ok(Err(join_err)) => {
            error!(error = %join_err, "asr call panicked");
            Err(AsrFailure::Port(true))
        }
        // The blocking call is abandoned; its thread finishes in the
        // background.
        Err(_) => Err(AsrFailure::Timeout),
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_final_job(
    segment: SpeechSegment,
    asr_port: &Arc<dyn AsrPort>,
    breaker: &Arc<CircuitBreaker>,
    recognizer: &Arc<StreamingRecognizer>,
    tracker: &Arc<SegmentTracker>,
    stats: &Arc<Mutex<TranslationStats>>,
    clock: &dyn Clock,
    in_flight: &Arc<AtomicUsize>,
    asr_mt: &Arc<BoundedQueue<AsrItem>>,
    post_config: &crate::config::PostProcessConfig,
    final_timeout: Duration,
) {
    let descriptor = segment.descriptor();
    let audio_ms = segment.duration_ms;
    let language = recognizer.request_language(segment.id);
    // While the breaker is open the final is still probed once; when closed,
    // one immediate retry covers transient failures.
    let attempts = if breaker.allows_call() { 2 } else { 1 };

    let mut drop_reason: Option<DropReason> = None;
    let mut decoded: Option<(AsrOutput, u64)> = None;
    for attempt in 0..attempts {
        let started_ms = clock.now_ms();
        in_flight.fetch_add(1, Ordering::SeqCst);
        let outcome = run_asr(
            asr_port.clone(),
            segment.samples.clone(),
            language.clone(),
            AsrMode::Accurate,
            final_timeout,
        )
        .await;
        in_flight.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            Ok(output) => {
                breaker.record_success();
                decoded = Some((output, clock.now_ms().saturating_sub(started_ms)));
                break;
            }
            Err(AsrFailure::Timeout) => {
                breaker.record_failure(false);
                drop_reason = Some(DropReason::Timeout);
                break;
            }
            Err(AsrFailure::Port(fatal)) => {
                breaker.record_failure(fatal);
                drop_reason = Some(DropReason::AsrUnavailable);
                if fatal {
                    break;
                }
                debug!(seq = segment.seq, attempt, "final decode failed, retrying");
            }
        }
    }

    match decoded {
        Some((output, compute_ms)) => {
            match post_processor::process_transcript(
                &output.text,
                output.confidence,
                &output.language,
                post_config,
            ) {
                Outcome::Clean(text) => {
                    let cleaned = AsrOutput { text, ..output };
                    let result = recognizer.admit_final(
                        segment.id,
                        segment.seq,
                        cleaned,
                        audio_ms,
                        compute_ms,
                    );
                    tracker.record_asr_final(segment.id, clock.now_ms());
                    let _ = asr_mt
                        .push(AsrItem::Final { descriptor, result })
                        .await;
                }
                Outcome::Skip(reason) => {
                    debug!(seq = segment.seq, ?reason, "final rejected by post-processor");
                    stats.lock().hallucinations_filtered += 1;
                    recognizer.discard_segment(segment.id);
                    let _ = asr_mt
                        .push(AsrItem::Dropped {
                            segment_id: segment.id,
                            seq: segment.seq,
                            stage: Stage::Asr,
                            reason: DropReason::Hallucination,
                        })
                        .await;
                }
            }
        }
        None => {
            let reason = drop_reason.unwrap_or(DropReason::AsrUnavailable);
            warn!(seq = segment.seq, ?reason, "segment final dropped");
            recognizer.discard_segment(segment.id);
            let _ = asr_mt
                .push(AsrItem::Dropped {
                    segment_id: segment.id,
                    seq: segment.seq,
                    stage: Stage::Asr,
                    reason,
                })
                .await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_mt_item(
    item: AsrItem,
    translator: &mut TranslationProcessor,
    reorder: &mut ReorderBuffer<AsrItem>,
    announced: &mut Option<u64>,
    mt_port: &Arc<dyn MtPort>,
    breaker: &Arc<CircuitBreaker>,
    tracker: &Arc<SegmentTracker>,
    stats: &Arc<Mutex<TranslationStats>>,
    clock: &dyn Clock,
    asr_in_flight: &Arc<AtomicUsize>,
    mt_out: &Arc<BoundedQueue<PipelineEvent>>,
    mt_timeout: Duration,
) {
    match item {
        AsrItem::Draft { descriptor, result } => {
            // A worker interleaving can queue a draft behind its segment's
            // final; by the time it surfaces the head has advanced.
            if result.seq < reorder.next_seq() {
                return;
            }
            announce(mt_out, announced, &descriptor).await;
            let emit = mt_out
                .push(PipelineEvent::DraftAsr(result.clone()))
                .await;
            if emit.is_err() {
                return;
            }
            stats.lock().drafts_emitted += 1;

            if !translator.gate_draft(&result.text, &result.language) {
                debug!(seq = result.seq, "draft gated, not translated");
                return;
            }
            let translation = translate_text(
                translator,
                mt_port,
                breaker,
                stats,
                clock,
                asr_in_flight,
                &result,
                mt_timeout,
                false,
            )
            .await;
            if let Some(translation) = translation {
                tracker.record_mt_draft(result.segment_id, clock.now_ms());
                let _ = mt_out
                    .push(PipelineEvent::Translation(translation))
                    .await;
            }
        }
        AsrItem::Final { descriptor, result } => {
            announce(mt_out, announced, &descriptor).await;
            let _ = mt_out.push(PipelineEvent::FinalAsr(result.clone())).await;

            let translation = translate_text(
                translator,
                mt_port,
                breaker,
                stats,
                clock,
                asr_in_flight,
                &result,
                mt_timeout,
                true,
            )
            .await;
            // Finals always produce a result, degrading to pass-through.
            if let Some(translation) = translation {
                tracker.record_mt_final(result.segment_id, clock.now_ms());
                translator.finish_segment(result.segment_id);
                let _ = mt_out
                    .push(PipelineEvent::Translation(translation))
                    .await;
            }
            reorder.advance();
        }
        AsrItem::Dropped {
            segment_id,
            seq,
            stage,
            reason,
        } => {
            translator.finish_segment(segment_id);
            let _ = mt_out
                .push(PipelineEvent::Dropped {
                    segment_id,
                    seq,
                    stage,
                    reason,
                })
                .await;
            reorder.advance();
        }
        AsrItem::Reset {
            expected_sample,
            received_sample,
            ..
        } => {
            stats.lock().session_resets += 1;
            let _ = mt_out
                .push(PipelineEvent::SessionReset {
                    expected_sample,
                    received_sample,
                })
                .await;
        }
    }
}

async fn announce(
    mt_out: &Arc<BoundedQueue<PipelineEvent>>,
    announced: &mut Option<u64>,
    descriptor: &SegmentDescriptor,
) {
    if *announced != Some(descriptor.seq) {
        *announced = Some(descriptor.seq);
        let _ = mt_out
            .push(PipelineEvent::NewSegment(descriptor.clone()))
            .await;
    }
}

/// Translate one transcript. Drafts return `None` on failure (the previous
/// draft stays on screen); finals always return a result, degrading to
/// pass-through with `mt_failed` after the retry budget is spent.
#[allow(clippy::too_many_arguments)]
async fn translate_text(
    translator: &mut TranslationProcessor,
    mt_port: &Arc<dyn MtPort>,
    breaker: &Arc<CircuitBreaker>,
    stats: &Arc<Mutex<TranslationStats>>,
    clock: &dyn Clock,
    asr_in_flight: &Arc<AtomicUsize>,
    result: &AsrResult,
    mt_timeout: Duration,
    is_final: bool,
) -> Option<TranslationResult> {
    let source_lang = result.language.clone();
    let target_lang = translator.target_lang().to_string();

    let make = |translator: &mut TranslationProcessor,
                translated: String,
                compute_ms: u64,
                from_cache: bool,
                mt_failed: bool| {
        let stability = translator.score_stability(result.segment_id, &translated);
        TranslationResult {
            segment_id: result.segment_id,
            seq: result.seq,
            kind: if is_final { AsrKind::Final } else { AsrKind::Draft },
            source_text: result.text.clone(),
            translated_text: translated,
            source_lang: source_lang.clone(),
            target_lang: target_lang.clone(),
            stability,
            compute_time_ms: compute_ms,
            from_cache,
            mt_failed,
        }
    };

    if let Some(hit) = translator.cache_lookup(&result.text, &source_lang) {
        stats.lock().cache_hits += 1;
        return Some(make(translator, hit, 0, true, false));
    }
    stats.lock().cache_misses += 1;

    if !breaker.allows_call() {
        // Open breaker: pass-through keeps the stream alive.
        if is_final {
            stats.lock().mt_failures += 1;
            return Some(make(translator, result.text.clone(), 0, false, true));
        }
        return None;
    }

    let attempts = if is_final { 3 } else { 1 };
    let started_ms = clock.now_ms();
    let overlap_candidate = asr_in_flight.load(Ordering::SeqCst) > 0;
    for attempt in 0..attempts {
        if attempt == 2 {
            tokio::time::sleep(Duration::from_millis(MT_RETRY_DELAY_MS)).await;
        }
        let port = mt_port.clone();
        let text = result.text.clone();
        let source = source_lang.clone();
        let target = target_lang.clone();
        let call =
            tokio::task::spawn_blocking(move || port.translate(&text, &source, &target));
        match tokio::time::timeout(mt_timeout, call).await {
            Ok(Ok(Ok(translated))) => {
                breaker.record_success();
                let compute_ms = clock.now_ms().saturating_sub(started_ms);
                // Opportunistic ASR/MT overlap: this MT call ran while the
                // pool was decoding the next segment.
                if overlap_candidate && asr_in_flight.load(Ordering::SeqCst) > 0 {
                    stats.lock().overlap_savings_ms_total += compute_ms;
                }
                translator.cache_store(&result.text, &source_lang, &translated);
                return Some(make(translator, translated, compute_ms, false, false));
            }
            Ok(Ok(Err(err))) => {
                breaker.record_failure(err.is_fatal());
                debug!(error = %err, attempt, "mt call failed");
            }
            Ok(Err(join_err)) => {
                breaker.record_failure(true);
                error!(error = %join_err, "mt call panicked");
            }
            Err(_) => {
                breaker.record_failure(false);
                debug!(attempt, "mt call timed out");
            }
        }
    }

    if is_final {
        stats.lock().mt_failures += 1;
        let compute_ms = clock.now_ms().saturating_sub(started_ms);
        Some(make(translator, result.text.clone(), compute_ms, false, true))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{PortError, VadPort};

    struct NullVad;
    impl VadPort for NullVad {
        fn probe(&mut self, _frame: &[f32]) -> Result<(f32, f32), PortError> {
            Ok((0.0, 1.0))
        }
    }

    struct NullAsr;
    impl AsrPort for NullAsr {
        fn transcribe(
            &self,
            _audio: &[f32],
            _language: Option<&str>,
            _mode: AsrMode,
        ) -> Result<AsrOutput, PortError> {
            Ok(AsrOutput {
                text: String::new(),
                language: "en".to_string(),
                confidence: 1.0,
                word_timings: None,
                consumed_ms: None,
            })
        }
    }

    struct NullMt;
    impl MtPort for NullMt {
        fn translate(
            &self,
            text: &str,
            _source_lang: &str,
            _target_lang: &str,
        ) -> Result<String, PortError> {
            Ok(text.to_string())
        }
    }

    fn pipeline() -> TranslatePipeline {
        let ports = PipelinePorts::new(Box::new(NullVad), Arc::new(NullAsr), Arc::new(NullMt));
        TranslatePipeline::new(AppConfig::for_languages("en", "zh"), ports).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let ports = PipelinePorts::new(Box::new(NullVad), Arc::new(NullAsr), Arc::new(NullMt));
        let mut config = AppConfig::for_languages("en", "zh");
        config.audio.sample_rate = 44_100;
        assert!(TranslatePipeline::new(config, ports).is_err());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let mut p = pipeline();
        p.start(|_event| {}).unwrap();
        assert!(matches!(p.start(|_event| {}), Err(PipelineError::AlreadyRunning)));
        p.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_fast() {
        let mut p = pipeline();
        p.start(|_event| {}).unwrap();
        let started = std::time::Instant::now();
        p.stop().await;
        p.stop().await;
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn frames_after_stop_are_ignored() {
        let mut p = pipeline();
        p.start(|_event| {}).unwrap();
        p.stop().await;
        p.push_frame(&[0.0; 480], 0, Utc::now());
        assert_eq!(p.snapshot().segments_created, 0);
    }

    #[tokio::test]
    async fn snapshot_reports_queue_capacities() {
        let p = pipeline();
        let snapshot = p.snapshot();
        let queues = snapshot.queues.unwrap();
        assert_eq!(queues.seg_to_asr.capacity, 5);
        assert_eq!(queues.mt_to_out.capacity, 20);
    }
}
