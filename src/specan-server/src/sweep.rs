// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Sweep engine: steps the receiver across a frequency range, averages
//! short-window FFTs at each step, stitches them into a panorama, and
//! injects sweep packets into the broadcast pipeline.
//!
//! The live DSP worker is paused for the duration; the sweep worker thread
//! drives the tuner directly and runs its own DSP pipeline so per-step
//! state never leaks between steps or into live mode. When the sweep
//! sample rate or chunk size differs from the live configuration, the
//! receiver is stopped and restarted on a fresh ingest queue; no consumer
//! ever observes a mid-swap queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver as CbReceiver, RecvTimeoutError};
use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tracing::{info, warn};

use specan_backend::{IqMessage, Receiver, SampleSource};
use specan_core::{DeviceLimits, DynResult};
use specan_dsp::{
    plan_steps, AveragingMode, DspConfig, DspPipeline, Stitcher, WindowType,
};
use specan_protocol::{encode_sweep_panorama_packet, encode_sweep_segment_packet};

use crate::config::ServerConfig;
use crate::stream::{unix_now, Mode, StreamManager};

const SWEEP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const COLLECT_TIMEOUT: Duration = Duration::from_secs(2);
const FLUSH_TIMEOUT: Duration = Duration::from_millis(500);
const SETTLE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    Survey,
    BandMonitor,
}

impl SweepMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepMode::Survey => "survey",
            SweepMode::BandMonitor => "band_monitor",
        }
    }

    pub fn wire_code(&self) -> u8 {
        match self {
            SweepMode::Survey => 0,
            SweepMode::BandMonitor => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweepParams {
    pub mode: SweepMode,
    pub freq_start: f64,
    pub freq_end: f64,
    pub fft_size: usize,
    pub sample_rate: f64,
    pub usable_fraction: f64,
    pub settle_chunks: u32,
    pub averages_per_step: u32,
    pub display_bins: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepStatus {
    pub sweep_mode: String,
    pub sweep_running: bool,
    pub sweep_id: u32,
    pub sweep_step: usize,
    pub sweep_total_steps: usize,
    pub sweep_progress: f64,
    pub sweep_last_duration_ms: f64,
    pub sweeps_completed: u64,
}

impl Default for SweepStatus {
    fn default() -> Self {
        Self {
            sweep_mode: "off".to_string(),
            sweep_running: false,
            sweep_id: 0,
            sweep_step: 0,
            sweep_total_steps: 0,
            sweep_progress: 0.0,
            sweep_last_duration_ms: 0.0,
            sweeps_completed: 0,
        }
    }
}

struct RestoreState {
    sample_rate: f64,
    bandwidth: f64,
    was_streaming: bool,
    /// The receiver was stopped and restarted with sweep parameters, so it
    /// must be brought down again before live settings come back.
    restarted: bool,
}

pub struct SweepEngine {
    manager: Arc<StreamManager>,
    receiver: Arc<Receiver>,
    config: Arc<ServerConfig>,
    op_lock: TokioMutex<()>,
    running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    thread: StdMutex<Option<JoinHandle<()>>>,
    status: Arc<StdMutex<SweepStatus>>,
    restore: StdMutex<Option<RestoreState>>,
}

impl SweepEngine {
    pub fn new(
        manager: Arc<StreamManager>,
        receiver: Arc<Receiver>,
        config: Arc<ServerConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            receiver,
            config,
            op_lock: TokioMutex::new(()),
            running: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            thread: StdMutex::new(None),
            status: Arc::new(StdMutex::new(SweepStatus::default())),
            restore: StdMutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SweepStatus {
        self.status.lock().expect("sweep status lock poisoned").clone()
    }

    /// Start a sweep. Pauses live mode, reconfigures the receiver, and
    /// launches the sweep worker thread.
    pub async fn start(self: &Arc<Self>, params: SweepParams) -> DynResult<()> {
        let _guard = self.op_lock.lock().await;
        if self.running.load(Ordering::SeqCst) {
            warn!("Sweep already running");
            return Err("sweep already running".into());
        }

        let before = self.receiver.status();
        let was_streaming = self.manager.current_mode().await == Mode::Live;
        if was_streaming {
            self.manager.pause_for_sweep().await;
        }

        let rate_changed = before.sample_rate != params.sample_rate;
        let chunk_changed = params.fft_size != self.manager.dsp_pipeline().fft_size();
        let restart = rate_changed || chunk_changed || !self.receiver.status().running;
        let ingest_rx = if restart {
            // Strict stopped-then-restarted swap: every consumer of the old
            // queue is already joined, so a fresh queue is safe.
            let receiver = Arc::clone(&self.receiver);
            let _ = tokio::task::spawn_blocking(move || receiver.stop()).await;

            if !self.receiver.set_sample_rate(params.sample_rate) {
                self.rollback(was_streaming).await;
                return Err("sweep sample rate rejected by device".into());
            }
            self.receiver.set_bandwidth(params.sample_rate);
            self.receiver.set_chunk_size(params.fft_size);
            let (tx, rx) = self.manager.replace_ingest();
            if let Err(e) = self.receiver.start(tx) {
                self.rollback(was_streaming).await;
                return Err(format!("failed to restart receiver for sweep: {}", e).into());
            }
            tokio::time::sleep(SETTLE_DELAY).await;
            rx
        } else {
            self.manager.drain_ingest();
            self.manager
                .ingest_rx()
                .ok_or("no ingest queue available for sweep")?
        };

        *self.restore.lock().expect("sweep restore lock poisoned") = Some(RestoreState {
            sample_rate: before.sample_rate,
            bandwidth: before.bandwidth,
            was_streaming,
            restarted: restart,
        });

        self.manager.enter_sweep().await;
        self.stop_requested.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let sweep_id = {
            let mut status = self.status.lock().expect("sweep status lock poisoned");
            status.sweep_id += 1;
            status.sweep_mode = params.mode.as_str().to_string();
            status.sweep_running = true;
            status.sweep_step = 0;
            status.sweep_progress = 0.0;
            status.sweep_id
        };

        let ctx = SweepCtx {
            receiver: Arc::clone(&self.receiver),
            manager: Arc::clone(&self.manager),
            engine: Arc::clone(self),
            ingest: ingest_rx,
            params: params.clone(),
            limits: self.receiver.limits(),
            status: Arc::clone(&self.status),
            running: Arc::clone(&self.running),
            stop_requested: Arc::clone(&self.stop_requested),
            rt: tokio::runtime::Handle::current(),
            sweep_id,
        };
        let handle = std::thread::Builder::new()
            .name("sweep-worker".to_string())
            .spawn(move || sweep_loop(ctx))
            .map_err(|e| format!("failed to spawn sweep-worker thread: {}", e))?;
        *self.thread.lock().expect("sweep thread lock poisoned") = Some(handle);

        info!(
            "Sweep started: mode={}, {:.3}-{:.3} MHz, {:.0} MS/s",
            params.mode.as_str(),
            params.freq_start / 1e6,
            params.freq_end / 1e6,
            params.sample_rate / 1e6,
        );
        Ok(())
    }

    /// Stop any active sweep and restore the pre-sweep state. The worker
    /// finishes its current per-step collect before exiting.
    pub async fn stop(&self) {
        let _guard = self.op_lock.lock().await;
        if !self.running.load(Ordering::SeqCst)
            && self.thread.lock().expect("sweep thread lock poisoned").is_none()
        {
            return;
        }
        info!("Stopping sweep...");
        self.stop_requested.store(true, Ordering::SeqCst);
        self.join_worker().await;
        self.running.store(false, Ordering::SeqCst);
        self.finish().await;
        info!("Sweep stopped, previous mode restored");
    }

    /// Called on the runtime when a survey pass finishes on its own.
    async fn on_survey_complete(self: Arc<Self>) {
        let _guard = self.op_lock.lock().await;
        if self.restore.lock().expect("sweep restore lock poisoned").is_none() {
            return; // an explicit stop already cleaned up
        }
        self.join_worker().await;
        self.finish().await;
        info!("Survey sweep complete, previous mode restored");
    }

    async fn join_worker(&self) {
        let handle = self.thread.lock().expect("sweep thread lock poisoned").take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + SWEEP_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("Sweep thread did not exit in {:?}", SWEEP_JOIN_TIMEOUT);
            }
        }
    }

    /// Restore sample rate/bandwidth and hand control back to the
    /// orchestrator.
    async fn finish(&self) {
        {
            let mut status = self.status.lock().expect("sweep status lock poisoned");
            status.sweep_mode = "off".to_string();
            status.sweep_running = false;
        }

        let restore = self.restore.lock().expect("sweep restore lock poisoned").take();
        let Some(restore) = restore else {
            return;
        };

        if restore.restarted {
            let receiver = Arc::clone(&self.receiver);
            let _ = tokio::task::spawn_blocking(move || receiver.stop()).await;
            self.receiver.set_sample_rate(restore.sample_rate);
            self.receiver.set_bandwidth(restore.bandwidth);
            // resume_live restarts the receiver with the live chunk size.
        }
        self.manager.exit_sweep(restore.was_streaming).await;
    }

    /// Undo a partial start that failed before the worker launched.
    async fn rollback(&self, was_streaming: bool) {
        if was_streaming {
            self.manager.exit_sweep(true).await;
        }
    }
}

struct SweepCtx {
    receiver: Arc<Receiver>,
    manager: Arc<StreamManager>,
    engine: Arc<SweepEngine>,
    ingest: CbReceiver<IqMessage>,
    params: SweepParams,
    limits: DeviceLimits,
    status: Arc<StdMutex<SweepStatus>>,
    running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    rt: tokio::runtime::Handle,
    sweep_id: u32,
}

fn sweep_loop(ctx: SweepCtx) {
    info!("Sweep thread started");
    let params = &ctx.params;

    let steps = plan_steps(
        params.freq_start,
        params.freq_end,
        params.sample_rate,
        params.usable_fraction,
        &ctx.limits,
    );
    let total_steps = steps.len();
    {
        let mut status = ctx.status.lock().expect("sweep status lock poisoned");
        status.sweep_total_steps = total_steps;
    }
    info!("Sweep plan: {} steps", total_steps);

    // Dedicated per-step pipeline: independent FFTs, full resolution, no
    // state shared with the live pipeline.
    let dsp = DspPipeline::new(&DspConfig {
        fft_size: params.fft_size,
        window: WindowType::BlackmanHarris,
        averaging_mode: AveragingMode::None,
        averaging_count: 1,
        averaging_alpha: 0.3,
        dc_removal: true,
        overlap: false,
        target_display_bins: params.fft_size,
    });
    let mut stitcher = Stitcher::new(
        params.freq_start,
        params.freq_end,
        steps.clone(),
        params.sample_rate,
        params.fft_size,
        params.usable_fraction,
    );

    let mut sweep_id = ctx.sweep_id;
    let mut completed: u64 = 0;

    'passes: while ctx.running.load(Ordering::SeqCst)
        && !ctx.stop_requested.load(Ordering::SeqCst)
    {
        stitcher.reset();
        let pass_start = Instant::now();

        for (step_idx, &center) in steps.iter().enumerate() {
            if ctx.stop_requested.load(Ordering::SeqCst) {
                break 'passes;
            }
            {
                let mut status = ctx.status.lock().expect("sweep status lock poisoned");
                status.sweep_step = step_idx;
                status.sweep_progress = step_idx as f64 / total_steps.max(1) as f64;
            }

            ctx.receiver.set_frequency(center);
            flush_queue(&ctx.ingest, params.settle_chunks);

            // Average per-step FFTs in linear power.
            let mut accumulated: Option<Vec<f64>> = None;
            let mut valid = 0u32;
            for _ in 0..params.averages_per_step {
                if ctx.stop_requested.load(Ordering::SeqCst) {
                    break;
                }
                let chunk = match ctx.ingest.recv_timeout(COLLECT_TIMEOUT) {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => continue,
                    Err(RecvTimeoutError::Timeout) => {
                        warn!("Sweep: IQ queue timeout at step {}", step_idx);
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break 'passes,
                };
                let Some(result) = dsp.process(&chunk) else {
                    continue;
                };
                match accumulated.as_mut() {
                    None => {
                        accumulated = Some(
                            result
                                .spectrum
                                .iter()
                                .map(|&db| 10f64.powf(db as f64 / 10.0))
                                .collect(),
                        );
                    }
                    Some(acc) => {
                        for (a, &db) in acc.iter_mut().zip(result.spectrum.iter()) {
                            *a += 10f64.powf(db as f64 / 10.0);
                        }
                    }
                }
                valid += 1;
            }

            let Some(mut acc) = accumulated else {
                continue;
            };
            if valid == 0 {
                continue;
            }
            for a in acc.iter_mut() {
                *a /= valid as f64;
            }
            let averaged: Vec<f32> = acc
                .iter()
                .map(|&lin| (10.0 * lin.max(1e-20).log10()) as f32)
                .collect();
            dsp.reset();

            stitcher.add_segment(step_idx, &averaged);

            if params.mode == SweepMode::Survey {
                let usable = stitcher.usable_slice(&averaged);
                let half_usable = params.sample_rate * params.usable_fraction / 2.0;
                let packet = encode_sweep_segment_packet(
                    sweep_id,
                    step_idx as u16,
                    total_steps as u16,
                    center - half_usable,
                    center + half_usable,
                    params.freq_start,
                    params.freq_end,
                    usable,
                );
                ctx.manager.inject_packet(packet);
            }
        }

        if ctx.stop_requested.load(Ordering::SeqCst) {
            break;
        }

        let duration_ms = pass_start.elapsed().as_secs_f64() * 1000.0;
        completed += 1;
        {
            let mut status = ctx.status.lock().expect("sweep status lock poisoned");
            status.sweep_last_duration_ms = duration_ms;
            status.sweeps_completed = completed;
            status.sweep_progress = 1.0;
        }

        let (_, power) = stitcher.display_panorama(params.display_bins);
        let packet = encode_sweep_panorama_packet(
            sweep_id,
            params.mode.wire_code(),
            params.freq_start,
            params.freq_end,
            duration_ms as f32,
            unix_now(),
            &power,
        );
        ctx.manager.inject_packet(packet);

        info!(
            "Sweep #{} complete: {} steps in {:.0} ms",
            completed, total_steps, duration_ms
        );

        if params.mode == SweepMode::Survey {
            break;
        }
        sweep_id += 1;
        ctx.status.lock().expect("sweep status lock poisoned").sweep_id = sweep_id;
    }

    ctx.running.store(false, Ordering::SeqCst);
    info!("Sweep thread exited ({} passes completed)", completed);

    // A survey that ran to completion restores live mode on the runtime.
    if !ctx.stop_requested.load(Ordering::SeqCst) && params.mode == SweepMode::Survey {
        let engine = ctx.engine;
        ctx.rt.spawn(async move { engine.on_survey_complete().await });
    }
}

fn flush_queue(rx: &CbReceiver<IqMessage>, settle_chunks: u32) -> u32 {
    let mut discarded = 0;
    while discarded < settle_chunks {
        match rx.recv_timeout(FLUSH_TIMEOUT) {
            Ok(_) => discarded += 1,
            Err(_) => break,
        }
    }
    discarded
}
