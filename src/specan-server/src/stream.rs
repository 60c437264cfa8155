// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Streaming orchestrator.
//!
//! Bridges three execution domains: the device producer thread feeding the
//! ingest queue, the CPU-bound DSP worker thread, and the tokio event loop
//! running the broadcast task and command surface.
//!
//! ```text
//! source ──[ingest queue]──▶ DSP worker ──[result queue]──▶ broadcast ──▶ clients
//!                               ├─▶ IQ recorder tap
//!                               ├─▶ spectrum recorder tap
//!                               └─▶ detector tap ──▶ event pump ──▶ store + clients
//! ```
//!
//! At most one mode among {live, sweep, playback} is active at any instant;
//! transitions are serialized by the mode mutex.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver as CbReceiver, RecvTimeoutError, Sender as CbSender};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tracing::{error, info, warn};

use specan_backend::{IqMessage, Receiver, SampleSource};
use specan_core::{DeviceStatus, DynResult, SignalEvent, SignalEventKind};
use specan_dsp::{DspConfig, DspPipeline, SignalDetector, SoftwareAgc};
use specan_protocol::{encode_json_frame, encode_spectrum_packet, ServerMessage, SignalEventMsg};

use crate::config::ServerConfig;
use crate::recording::RecordingManager;
use crate::signals::SignalStore;

const INGEST_RECV_TIMEOUT: Duration = Duration::from_secs(1);
const RESULT_RECV_TIMEOUT: Duration = Duration::from_secs(1);
const DSP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const DSP_ERROR_LIMIT: u32 = 10;
const DSP_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const CLIENT_QUEUE_LEN: usize = 64;
const STATS_EVERY_FRAMES: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    Live,
    /// Live DSP halted while the device keeps running; used during sweep
    /// setup and teardown.
    Paused,
    Sweep,
    Playback,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Idle => "idle",
            Mode::Live => "live",
            Mode::Paused => "paused",
            Mode::Sweep => "sweep",
            Mode::Playback => "playback",
        }
    }
}

/// Liveness flags shared with the broadcast loop and worker threads.
#[derive(Default)]
pub struct SharedFlags {
    streaming: AtomicBool,
    paused: AtomicBool,
    sweep_active: AtomicBool,
    playback: AtomicBool,
}

impl SharedFlags {
    fn any_active(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
            || self.paused.load(Ordering::SeqCst)
            || self.sweep_active.load(Ordering::SeqCst)
            || self.playback.load(Ordering::SeqCst)
    }

    pub fn sweep_active(&self) -> bool {
        self.sweep_active.load(Ordering::SeqCst)
    }
}

pub struct StreamManager {
    config: Arc<ServerConfig>,
    receiver: Arc<Receiver>,
    dsp: RwLock<Arc<DspPipeline>>,
    dsp_template: StdMutex<DspConfig>,
    pub agc: Arc<SoftwareAgc>,
    pub detector: Arc<SignalDetector>,
    pub recording: Arc<RecordingManager>,
    flags: Arc<SharedFlags>,
    mode: TokioMutex<Mode>,
    clients: Arc<TokioMutex<HashMap<u64, mpsc::Sender<Bytes>>>>,
    next_client_id: AtomicU64,
    ingest: StdMutex<Option<(CbSender<IqMessage>, CbReceiver<IqMessage>)>>,
    result_tx: StdMutex<Option<mpsc::Sender<Bytes>>>,
    dsp_running: Arc<AtomicBool>,
    dsp_thread: StdMutex<Option<JoinHandle<()>>>,
    broadcast_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    event_tx: mpsc::UnboundedSender<SignalEvent>,
}

impl StreamManager {
    /// Build the manager and hand back the detector-event receiver for
    /// [`spawn_event_pump`].
    pub fn new(
        config: Arc<ServerConfig>,
        receiver: Arc<Receiver>,
        agc: Arc<SoftwareAgc>,
        detector: Arc<SignalDetector>,
        recording: Arc<RecordingManager>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SignalEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let template = config.dsp_config();
        let dsp = Arc::new(DspPipeline::new(&template));
        let manager = Arc::new(Self {
            config,
            receiver,
            dsp: RwLock::new(dsp),
            dsp_template: StdMutex::new(template),
            agc,
            detector,
            recording,
            flags: Arc::new(SharedFlags::default()),
            mode: TokioMutex::new(Mode::Idle),
            clients: Arc::new(TokioMutex::new(HashMap::new())),
            next_client_id: AtomicU64::new(1),
            ingest: StdMutex::new(None),
            result_tx: StdMutex::new(None),
            dsp_running: Arc::new(AtomicBool::new(false)),
            dsp_thread: StdMutex::new(None),
            broadcast_task: StdMutex::new(None),
            event_tx,
        });
        (manager, event_rx)
    }

    pub fn dsp_pipeline(&self) -> Arc<DspPipeline> {
        Arc::clone(&self.dsp.read().expect("dsp lock poisoned"))
    }

    pub fn receiver(&self) -> &Arc<Receiver> {
        &self.receiver
    }

    pub async fn current_mode(&self) -> Mode {
        *self.mode.lock().await
    }

    pub fn is_streaming(&self) -> bool {
        self.flags.streaming.load(Ordering::SeqCst)
    }

    pub fn is_playback(&self) -> bool {
        self.flags.playback.load(Ordering::SeqCst)
    }

    /// Status of whatever is producing samples right now: the receiver, or
    /// the playback source when replaying a file.
    pub fn source_status(&self) -> DeviceStatus {
        if self.is_playback() {
            self.recording.playback.status()
        } else {
            self.receiver.status()
        }
    }

    // -- Client registry -----------------------------------------------------

    /// Register a client; returns its id, a sender for direct replies, and
    /// the packet stream to write to its socket.
    pub async fn add_client(&self) -> (u64, mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_LEN);
        let mut clients = self.clients.lock().await;
        clients.insert(id, tx.clone());
        info!("Client connected, total: {}", clients.len());
        (id, tx, rx)
    }

    pub async fn remove_client(&self, id: u64) {
        let mut clients = self.clients.lock().await;
        if clients.remove(&id).is_some() {
            info!("Client disconnected, total: {}", clients.len());
        }
    }

    /// Send a JSON message to every connected client.
    pub async fn broadcast_text(&self, msg: &ServerMessage) {
        let Ok(json) = serde_json::to_vec(msg) else {
            return;
        };
        let frame = encode_json_frame(&json);
        let mut clients = self.clients.lock().await;
        clients.retain(|_, tx| !matches!(tx.try_send(frame.clone()), Err(mpsc::error::TrySendError::Closed(_))));
    }

    /// Route detector events raised outside the DSP worker (e.g. the lost
    /// flush when detection is disabled) through the event pump.
    pub fn forward_events(&self, events: Vec<SignalEvent>) {
        for event in events {
            let _ = self.event_tx.send(event);
        }
    }

    // -- Mode transitions ----------------------------------------------------

    /// Start the full live pipeline: device -> DSP worker -> broadcast.
    pub async fn start_live(&self) -> DynResult<()> {
        let mut mode = self.mode.lock().await;
        match *mode {
            Mode::Live => return Err("already streaming".into()),
            Mode::Playback => return Err("stop playback first".into()),
            Mode::Paused | Mode::Sweep => return Err("sweep in progress".into()),
            Mode::Idle => {}
        }

        let dsp = self.dsp_pipeline();
        let (tx, rx) = bounded(self.config.stream.iq_queue_size);
        *self.lock_ingest() = Some((tx.clone(), rx));

        self.receiver.set_chunk_size(dsp.fft_size());
        if let Err(e) = self.receiver.start(tx) {
            *self.lock_ingest() = None;
            return Err(e);
        }

        self.flags.streaming.store(true, Ordering::SeqCst);
        self.spawn_broadcast();
        self.spawn_dsp_worker(false);
        *mode = Mode::Live;
        info!("Streaming pipeline started");
        Ok(())
    }

    /// Stop all live pipeline components in order.
    pub async fn stop_live(&self) {
        let mut mode = self.mode.lock().await;
        if *mode != Mode::Live {
            return;
        }
        self.stop_live_inner().await;
        *mode = Mode::Idle;
    }

    async fn stop_live_inner(&self) {
        info!("Stopping streaming pipeline...");
        self.flags.streaming.store(false, Ordering::SeqCst);

        // Stop the device first; starving the queue unblocks the worker
        // naturally, the sentinel covers the case where it is mid-wait.
        let receiver = Arc::clone(&self.receiver);
        let _ = tokio::task::spawn_blocking(move || receiver.stop()).await;

        self.stop_dsp_worker().await;
        self.abort_broadcast().await;
        self.drain_ingest();
        *self.lock_ingest() = None;
        self.dsp_pipeline().reset();
        info!("Streaming pipeline stopped");
    }

    /// Halt the DSP worker but keep the device and broadcast loop running.
    /// Used by the sweep engine.
    pub async fn pause_for_sweep(&self) {
        let mut mode = self.mode.lock().await;
        if *mode != Mode::Live {
            return;
        }
        info!("Pausing live DSP pipeline...");
        self.stop_dsp_worker().await;
        self.flags.paused.store(true, Ordering::SeqCst);
        *mode = Mode::Paused;
        info!("Live DSP pipeline paused");
    }

    /// Restart the DSP worker after a pause; the device is restarted if the
    /// sweep stopped it.
    pub async fn resume_live(&self) {
        let mut mode = self.mode.lock().await;
        if *mode != Mode::Paused {
            return;
        }
        info!("Resuming live DSP pipeline...");

        let dsp = self.dsp_pipeline();
        dsp.reset();
        self.drain_ingest();

        if !self.receiver.status().running {
            self.receiver.set_chunk_size(dsp.fft_size());
            let tx = match self.ingest_tx() {
                Some(tx) => tx,
                None => {
                    let (tx, rx) = bounded(self.config.stream.iq_queue_size);
                    *self.lock_ingest() = Some((tx.clone(), rx));
                    tx
                }
            };
            if let Err(e) = self.receiver.start(tx) {
                error!("Failed to restart receiver after pause: {}", e);
                self.flags.paused.store(false, Ordering::SeqCst);
                self.flags.streaming.store(false, Ordering::SeqCst);
                *mode = Mode::Idle;
                return;
            }
        }

        self.ensure_broadcast();
        self.spawn_dsp_worker(false);
        self.flags.paused.store(false, Ordering::SeqCst);
        *mode = Mode::Live;
        info!("Live DSP pipeline resumed");
    }

    /// Mark sweep active and make sure sweep packets can reach clients even
    /// when live streaming was never started.
    pub async fn enter_sweep(&self) {
        let mut mode = self.mode.lock().await;
        self.flags.sweep_active.store(true, Ordering::SeqCst);
        self.ensure_broadcast();
        *mode = Mode::Sweep;
    }

    /// Leave sweep mode; `resume` says whether live streaming was active
    /// before the sweep and should come back.
    pub async fn exit_sweep(&self, resume: bool) {
        {
            let mut mode = self.mode.lock().await;
            self.flags.sweep_active.store(false, Ordering::SeqCst);
            *mode = if resume { Mode::Paused } else { Mode::Idle };
        }
        if resume {
            self.flags.paused.store(true, Ordering::SeqCst);
            self.resume_live().await;
        } else {
            let receiver = Arc::clone(&self.receiver);
            let _ = tokio::task::spawn_blocking(move || receiver.stop()).await;
            self.abort_broadcast().await;
            self.drain_ingest();
            *self.lock_ingest() = None;
            self.flags.paused.store(false, Ordering::SeqCst);
            self.flags.streaming.store(false, Ordering::SeqCst);
        }
    }

    /// Start playback mode: live streaming is stopped if active and the
    /// file-backed source replaces the device as the queue producer.
    pub async fn start_playback(&self, filename: &str) -> DynResult<Value> {
        let mut mode = self.mode.lock().await;
        match *mode {
            Mode::Playback => return Err("playback already active".into()),
            Mode::Paused | Mode::Sweep => return Err("stop sweep first".into()),
            Mode::Live => {
                self.stop_live_inner().await;
                *mode = Mode::Idle;
            }
            Mode::Idle => {}
        }

        let dsp = self.dsp_pipeline();
        let playback = Arc::clone(&self.recording.playback);
        let metadata = playback.prepare(filename)?;
        playback.set_chunk_size(dsp.fft_size());

        let (tx, rx) = bounded(self.config.stream.iq_queue_size);
        *self.lock_ingest() = Some((tx.clone(), rx));
        dsp.reset();

        if let Err(e) = playback.start(tx) {
            *self.lock_ingest() = None;
            return Err(e);
        }

        self.flags.playback.store(true, Ordering::SeqCst);
        self.flags.streaming.store(true, Ordering::SeqCst);
        self.spawn_broadcast();
        self.spawn_dsp_worker(true);
        *mode = Mode::Playback;
        info!("Playback mode started: {}", filename);
        Ok(metadata)
    }

    pub async fn stop_playback(&self) {
        let mut mode = self.mode.lock().await;
        if *mode != Mode::Playback {
            return;
        }

        let playback = Arc::clone(&self.recording.playback);
        let _ = tokio::task::spawn_blocking(move || playback.stop()).await;

        self.stop_dsp_worker().await;
        self.abort_broadcast().await;
        self.drain_ingest();
        *self.lock_ingest() = None;
        self.flags.playback.store(false, Ordering::SeqCst);
        self.flags.streaming.store(false, Ordering::SeqCst);
        self.dsp_pipeline().reset();
        *mode = Mode::Idle;
        info!("Playback mode stopped");
    }

    /// Rebuild the DSP pipeline with a new FFT size. Rejected in any active
    /// mode: the spectrum length must stay constant while frames flow.
    pub async fn set_fft_size(&self, size: usize) -> Result<(), String> {
        let mode = self.mode.lock().await;
        if *mode != Mode::Idle {
            return Err("stop streaming before changing FFT size".to_string());
        }
        if size == 0 || !size.is_power_of_two() {
            return Err(format!("fft_size must be a positive power of 2, got {}", size));
        }
        let mut template = self.dsp_template.lock().expect("dsp template lock poisoned");
        template.fft_size = size;
        *self.dsp.write().expect("dsp lock poisoned") = Arc::new(DspPipeline::new(&template));
        info!("DSP pipeline rebuilt with fft_size={}", size);
        Ok(())
    }

    /// Best-effort shutdown of whatever mode is active.
    pub async fn shutdown(&self) {
        self.stop_playback().await;
        self.stop_live().await;
        self.receiver.cleanup();
    }

    // -- Queue plumbing (shared with the sweep engine) -----------------------

    /// Swap in a fresh ingest queue. The caller must have stopped every
    /// consumer of the old one first.
    pub fn replace_ingest(&self) -> (CbSender<IqMessage>, CbReceiver<IqMessage>) {
        let (tx, rx) = bounded(self.config.stream.iq_queue_size);
        *self.lock_ingest() = Some((tx.clone(), rx.clone()));
        (tx, rx)
    }

    pub fn ingest_rx(&self) -> Option<CbReceiver<IqMessage>> {
        self.lock_ingest().as_ref().map(|(_, rx)| rx.clone())
    }

    fn ingest_tx(&self) -> Option<CbSender<IqMessage>> {
        self.lock_ingest().as_ref().map(|(tx, _)| tx.clone())
    }

    pub fn drain_ingest(&self) {
        if let Some(rx) = self.ingest_rx() {
            while rx.try_recv().is_ok() {}
        }
    }

    /// Enqueue a packet for broadcast from outside the DSP worker (sweep
    /// worker thread). Non-blocking.
    pub fn inject_packet(&self, packet: Bytes) {
        if let Some(tx) = self.result_tx.lock().expect("result lock poisoned").as_ref() {
            if tx.try_send(packet).is_err() {
                warn!("Result queue full, dropped injected packet");
            }
        }
    }

    // -- Internal plumbing ---------------------------------------------------

    fn lock_ingest(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<(CbSender<IqMessage>, CbReceiver<IqMessage>)>> {
        self.ingest.lock().expect("ingest lock poisoned")
    }

    fn spawn_dsp_worker(&self, playback_mode: bool) {
        let Some(ingest) = self.ingest_rx() else {
            error!("No ingest queue; cannot start DSP worker");
            return;
        };
        let Some(result_tx) = self
            .result_tx
            .lock()
            .expect("result lock poisoned")
            .clone()
        else {
            error!("No result queue; cannot start DSP worker");
            return;
        };

        self.dsp_running.store(true, Ordering::SeqCst);
        let ctx = DspWorkerCtx {
            ingest,
            result_tx,
            dsp: self.dsp_pipeline(),
            agc: Arc::clone(&self.agc),
            detector: Arc::clone(&self.detector),
            recording: Arc::clone(&self.recording),
            receiver: Arc::clone(&self.receiver),
            event_tx: self.event_tx.clone(),
            running: Arc::clone(&self.dsp_running),
            target_fps: self.config.stream.target_fps,
            playback_mode,
        };
        let handle = std::thread::Builder::new()
            .name("dsp-worker".to_string())
            .spawn(move || run_dsp_worker(ctx))
            .expect("failed to spawn dsp-worker thread");
        *self.dsp_thread.lock().expect("dsp thread lock poisoned") = Some(handle);
    }

    async fn stop_dsp_worker(&self) {
        self.dsp_running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.ingest_tx() {
            let _ = tx.try_send(None); // sentinel unblocks a waiting worker
        }
        let handle = self.dsp_thread.lock().expect("dsp thread lock poisoned").take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + DSP_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("dsp-worker thread did not exit in {:?}", DSP_JOIN_TIMEOUT);
            }
        }
    }

    fn spawn_broadcast(&self) {
        let (tx, rx) = mpsc::channel(self.config.stream.result_queue_size);
        *self.result_tx.lock().expect("result lock poisoned") = Some(tx);
        let clients = Arc::clone(&self.clients);
        let flags = Arc::clone(&self.flags);
        let handle = tokio::spawn(broadcast_loop(rx, clients, flags));
        *self
            .broadcast_task
            .lock()
            .expect("broadcast lock poisoned") = Some(handle);
    }

    /// Make sure the result queue and broadcast task exist (sweep packets
    /// must reach clients even if live streaming never started).
    fn ensure_broadcast(&self) {
        let finished = self
            .broadcast_task
            .lock()
            .expect("broadcast lock poisoned")
            .as_ref()
            .map_or(true, |h| h.is_finished());
        if finished {
            self.spawn_broadcast();
        }
    }

    async fn abort_broadcast(&self) {
        *self.result_tx.lock().expect("result lock poisoned") = None;
        let handle = self
            .broadcast_task
            .lock()
            .expect("broadcast lock poisoned")
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// DSP worker
// ---------------------------------------------------------------------------

struct DspWorkerCtx {
    ingest: CbReceiver<IqMessage>,
    result_tx: mpsc::Sender<Bytes>,
    dsp: Arc<DspPipeline>,
    agc: Arc<SoftwareAgc>,
    detector: Arc<SignalDetector>,
    recording: Arc<RecordingManager>,
    receiver: Arc<Receiver>,
    event_tx: mpsc::UnboundedSender<SignalEvent>,
    running: Arc<AtomicBool>,
    target_fps: f64,
    playback_mode: bool,
}

fn run_dsp_worker(ctx: DspWorkerCtx) {
    info!("DSP worker started");
    let frame_interval = Duration::from_secs_f64(1.0 / ctx.target_fps);
    let fft_size = ctx.dsp.fft_size() as u32;
    let mut last_emit: Option<Instant> = None;
    let mut frames: u64 = 0;
    let mut errors: u32 = 0;

    while ctx.running.load(Ordering::SeqCst) {
        let msg = match ctx.ingest.recv_timeout(INGEST_RECV_TIMEOUT) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let Some(chunk) = msg else {
            break; // shutdown sentinel
        };

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            process_frame(&ctx, &chunk, fft_size, frame_interval, &mut last_emit, &mut frames)
        }));
        match outcome {
            Ok(()) => errors = 0,
            Err(_) => {
                errors += 1;
                error!("DSP error ({} consecutive)", errors);
                if errors >= DSP_ERROR_LIMIT {
                    error!("Too many DSP errors, stopping worker");
                    ctx.running.store(false, Ordering::SeqCst);
                    break;
                }
                std::thread::sleep(DSP_ERROR_BACKOFF);
            }
        }
    }
    info!("DSP worker exited (emitted {} frames)", frames);
}

fn process_frame(
    ctx: &DspWorkerCtx,
    chunk: &specan_core::IqChunk,
    fft_size: u32,
    frame_interval: Duration,
    last_emit: &mut Option<Instant>,
    frames: &mut u64,
) {
    // IQ recording tap before any processing.
    if ctx.recording.iq.is_recording() {
        ctx.recording.iq.put(chunk);
    }

    let Some(result) = ctx.dsp.process(chunk) else {
        return;
    };

    // Frame rate limiting.
    let now = Instant::now();
    if let Some(last) = *last_emit {
        if now.duration_since(last) < frame_interval {
            return;
        }
    }
    *last_emit = Some(now);
    *frames += 1;

    let mut status = source_status(ctx);

    // AGC never acts on recorded data.
    if !ctx.playback_mode && ctx.agc.enabled() {
        if let Some(gain) = ctx.agc.update(result.peak_power as f64, status.gain) {
            ctx.receiver.set_gain(gain);
            status = ctx.receiver.status();
        }
    }

    // Spectrum recording tap (throttles itself to ~1 Hz).
    if ctx.recording.spectrum.is_recording() {
        ctx.recording
            .spectrum
            .capture(&result, status.center_freq, status.sample_rate);
    }

    // Detection tap; events bridge to the async domain via the pump.
    if ctx.detector.enabled() {
        let events = ctx.detector.detect(
            &result.spectrum,
            result.noise_floor,
            status.center_freq,
            status.sample_rate,
        );
        for event in events {
            let _ = ctx.event_tx.send(event);
        }
    }

    let packet = encode_spectrum_packet(&status, fft_size, &result, unix_now());
    // Drop the frame if the async side is behind; live spectrum is
    // latest-wins anyway.
    let _ = ctx.result_tx.try_send(packet);

    if *frames % STATS_EVERY_FRAMES == 0 {
        info!(
            "DSP stats: {} frames emitted, IQ queue depth: {}",
            frames,
            ctx.ingest.len()
        );
    }
}

fn source_status(ctx: &DspWorkerCtx) -> DeviceStatus {
    if ctx.playback_mode {
        ctx.recording.playback.status()
    } else {
        ctx.receiver.status()
    }
}

// ---------------------------------------------------------------------------
// Broadcast loop
// ---------------------------------------------------------------------------

async fn broadcast_loop(
    mut result_rx: mpsc::Receiver<Bytes>,
    clients: Arc<TokioMutex<HashMap<u64, mpsc::Sender<Bytes>>>>,
    flags: Arc<SharedFlags>,
) {
    info!("Broadcast loop started");

    while flags.any_active() {
        let packet = match tokio::time::timeout(RESULT_RECV_TIMEOUT, result_rx.recv()).await {
            Err(_) => continue,
            Ok(None) => break,
            Ok(Some(packet)) => packet,
        };

        // Live spectrum is idempotent: drain to the most recent frame.
        // Sweep packets cover different bands and must all be delivered
        // in order.
        let mut latest = packet;
        if !flags.sweep_active() {
            while let Ok(next) = result_rx.try_recv() {
                latest = next;
            }
        }

        let mut guard = clients.lock().await;
        let mut dead = Vec::new();
        for (&id, tx) in guard.iter() {
            match tx.try_send(latest.clone()) {
                Ok(()) => {}
                // A full queue means a slow client; skip this frame for it.
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }
        for id in dead {
            guard.remove(&id);
            info!("Removed disconnected client");
        }
    }

    info!("Broadcast loop exited");
}

// ---------------------------------------------------------------------------
// Detector event pump
// ---------------------------------------------------------------------------

/// Consume detector events on the async side: persist to the signal store
/// and fan the JSON event out to clients. Keeps the DSP thread free of both
/// concerns.
pub fn spawn_event_pump(
    manager: Arc<StreamManager>,
    store: Arc<SignalStore>,
    mut event_rx: mpsc::UnboundedReceiver<SignalEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let s = &event.signal;
            match event.kind {
                SignalEventKind::New | SignalEventKind::Update => {
                    store.upsert_signal(
                        s.center_freq,
                        s.peak_freq,
                        s.bandwidth,
                        s.peak_power as f64,
                        s.avg_power as f64,
                        1,
                    );
                }
                SignalEventKind::Lost => store.mark_lost(s.center_freq),
            }
            let msg = ServerMessage::SignalEvent {
                data: SignalEventMsg::new(&event),
            };
            manager.broadcast_text(&msg).await;
        }
    })
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use specan_backend::{DriverFactory, MockDriver};
    use specan_core::DeviceLimits;
    use specan_dsp::DetectionConfig;
    use specan_protocol::{FrameHeader, SpectrumPacket, MSG_SPECTRUM};

    fn test_manager(dir: &std::path::Path) -> Arc<StreamManager> {
        let mut config = ServerConfig::default();
        config.recording.storage_path = dir.to_string_lossy().to_string();
        config.dsp.fft_size = 512;
        config.dsp.target_display_bins = 512;
        config.stream.target_fps = 1000.0;
        let config = Arc::new(config);

        let factory: DriverFactory = Box::new(|status: &DeviceStatus| {
            Ok(Box::new(MockDriver::tone(status.sample_rate, 250e3, 0.5))
                as Box<dyn specan_backend::IqDriver>)
        });
        let receiver = Arc::new(Receiver::new(
            factory,
            config.initial_status(),
            DeviceLimits::default(),
        ));
        let agc = Arc::new(SoftwareAgc::default());
        let detector = Arc::new(SignalDetector::new(DetectionConfig::default()));
        let recording = Arc::new(RecordingManager::new(&config.recording));
        let (manager, _event_rx) =
            StreamManager::new(config, receiver, agc, detector, recording);
        manager
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn live_mode_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        assert_eq!(manager.current_mode().await, Mode::Idle);

        let (id, _client_tx, mut client_rx) = manager.add_client().await;
        manager.start_live().await.unwrap();
        assert_eq!(manager.current_mode().await, Mode::Live);
        assert!(manager.start_live().await.is_err());

        let packet = tokio::time::timeout(Duration::from_secs(5), client_rx.recv())
            .await
            .expect("timed out waiting for spectrum frame")
            .expect("client channel closed");
        let header = FrameHeader::parse(&packet).unwrap();
        assert_eq!(header.message_type, MSG_SPECTRUM);
        let decoded = SpectrumPacket::decode(&packet).unwrap();
        assert_eq!(decoded.num_bins, 512);
        assert_eq!(decoded.center_freq, 100e6);
        // 250 kHz tone at 2 MS/s: an eighth of the span above center.
        assert!(decoded.peak_freq_offset > 0.10 && decoded.peak_freq_offset < 0.15);

        manager.stop_live().await;
        assert_eq!(manager.current_mode().await, Mode::Idle);
        manager.remove_client(id).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fft_size_locked_while_active() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());

        manager.set_fft_size(1024).await.unwrap();
        assert_eq!(manager.dsp_pipeline().fft_size(), 1024);
        assert!(manager.set_fft_size(1000).await.is_err());

        manager.start_live().await.unwrap();
        assert!(manager.set_fft_size(2048).await.is_err());
        manager.stop_live().await;
        manager.set_fft_size(2048).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn playback_replaces_live_mode() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());

        // Record a short file straight through the recorder.
        let base = {
            let status = DeviceStatus {
                sample_rate: 512_000.0,
                ..DeviceStatus::default()
            };
            let base = manager.recording.iq.start(&status, 512).unwrap();
            let chunk: specan_core::IqChunk =
                vec![num_complex::Complex::new(0.1_f32, 0.0); 512];
            for _ in 0..4 {
                manager.recording.iq.put(&chunk);
            }
            std::thread::sleep(Duration::from_millis(100));
            manager.recording.iq.stop().unwrap();
            base
        };

        manager.start_live().await.unwrap();
        let meta = manager.start_playback(&base).await.unwrap();
        assert_eq!(manager.current_mode().await, Mode::Playback);
        assert!(manager.is_playback());
        assert_eq!(meta["format"], "complex64");
        // Live pipeline was cleanly stopped underneath.
        assert!(!manager.receiver().status().running);
        // Status now reflects playback metadata.
        assert_eq!(manager.source_status().sample_rate, 512_000.0);
        assert_eq!(manager.source_status().gain, 0.0);

        manager.stop_playback().await;
        assert_eq!(manager.current_mode().await, Mode::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_rejected_during_playback() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        let status = DeviceStatus::default();
        let base = manager.recording.iq.start(&status, 512).unwrap();
        let chunk: specan_core::IqChunk = vec![num_complex::Complex::new(0.1_f32, 0.0); 512];
        manager.recording.iq.put(&chunk);
        std::thread::sleep(Duration::from_millis(100));
        manager.recording.iq.stop().unwrap();

        manager.start_playback(&base).await.unwrap();
        assert!(manager.start_live().await.is_err());
        manager.stop_playback().await;
    }
}
