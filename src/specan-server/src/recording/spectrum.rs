// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Spectrum recorder: captures processed DSP frames to CSV.
//!
//! Lightweight alternative to raw IQ capture for offline analysis. Called
//! from the DSP worker with every frame and throttled internally to the
//! configured capture rate (~1 Hz). Rows are flushed every 10 frames.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info};

use specan_core::{DeviceStatus, DspFrame, DynResult};

const FLUSH_EVERY: u64 = 10;

#[derive(Debug, Clone, Serialize)]
struct SpectrumMeta {
    filename: String,
    sample_rate: f64,
    center_freq: f64,
    fft_size: u32,
    num_bins: u32,
    start_time: f64,
    end_time: f64,
    total_frames: u64,
}

struct ActiveSpectrum {
    writer: csv::Writer<File>,
    meta: SpectrumMeta,
    meta_path: PathBuf,
    last_capture: Option<Instant>,
    frames: u64,
}

pub struct SpectrumRecorder {
    storage: PathBuf,
    capture_interval: Duration,
    recording: AtomicBool,
    active: Mutex<Option<ActiveSpectrum>>,
}

impl SpectrumRecorder {
    pub fn new(storage: PathBuf, capture_rate_hz: f64) -> Self {
        Self {
            storage,
            capture_interval: Duration::from_secs_f64(1.0 / capture_rate_hz.max(0.001)),
            recording: AtomicBool::new(false),
            active: Mutex::new(None),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    pub fn start(&self, status: &DeviceStatus, fft_size: u32) -> DynResult<String> {
        let mut active = self.lock_active();
        if active.is_some() {
            return Err("already recording spectrum".into());
        }
        std::fs::create_dir_all(&self.storage)
            .map_err(|e| format!("cannot create {}: {}", self.storage.display(), e))?;

        let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let base = format!("spectrum_{}_{:.3}MHz", ts, status.center_freq / 1e6);
        let csv_path = self.storage.join(format!("{}.csv", base));
        let meta_path = self.storage.join(format!("{}.json", base));

        let file =
            File::create(&csv_path).map_err(|e| format!("failed to open spectrum file: {}", e))?;
        let writer = csv::Writer::from_writer(file);

        *active = Some(ActiveSpectrum {
            writer,
            meta: SpectrumMeta {
                filename: base.clone(),
                sample_rate: status.sample_rate,
                center_freq: status.center_freq,
                fft_size,
                num_bins: 0,
                start_time: unix_now(),
                end_time: 0.0,
                total_frames: 0,
            },
            meta_path,
            last_capture: None,
            frames: 0,
        });
        self.recording.store(true, Ordering::SeqCst);
        info!("Spectrum recording started: {}", base);
        Ok(base)
    }

    /// Capture one frame if the throttle interval has elapsed. Called from
    /// the DSP worker.
    pub fn capture(&self, frame: &DspFrame, center_freq: f64, sample_rate: f64) {
        if !self.recording.load(Ordering::Relaxed) {
            return;
        }
        let mut guard = self.lock_active();
        let Some(active) = guard.as_mut() else {
            return;
        };

        let now = Instant::now();
        if let Some(last) = active.last_capture {
            if now.duration_since(last) < self.capture_interval {
                return;
            }
        }
        active.last_capture = Some(now);

        if active.frames == 0 {
            active.meta.num_bins = frame.spectrum.len() as u32;
            let mut header = vec![
                "timestamp".to_string(),
                "center_freq".to_string(),
                "sample_rate".to_string(),
                "noise_floor".to_string(),
                "peak_power".to_string(),
                "peak_freq_offset".to_string(),
            ];
            header.extend((0..frame.spectrum.len()).map(|i| format!("bin_{}", i)));
            if let Err(e) = active.writer.write_record(&header) {
                error!("Spectrum CSV header write failed: {}", e);
                return;
            }
        }

        let mut row = vec![
            format!("{:.6}", unix_now()),
            format!("{:.0}", center_freq),
            format!("{:.0}", sample_rate),
            format!("{:.2}", frame.noise_floor),
            format!("{:.2}", frame.peak_power),
            format!("{:.6}", frame.peak_freq_offset),
        ];
        row.extend(frame.spectrum.iter().map(|v| format!("{:.2}", v)));
        if let Err(e) = active.writer.write_record(&row) {
            error!("Spectrum CSV write failed: {}", e);
            return;
        }

        active.frames += 1;
        if active.frames % FLUSH_EVERY == 0 {
            let _ = active.writer.flush();
        }
    }

    /// Stop and finalize. Returns the base filename, or `None` if idle.
    pub fn stop(&self) -> Option<String> {
        let mut guard = self.lock_active();
        let mut active = guard.take()?;
        self.recording.store(false, Ordering::SeqCst);

        let _ = active.writer.flush();
        active.meta.end_time = unix_now();
        active.meta.total_frames = active.frames;
        match serde_json::to_string_pretty(&active.meta) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&active.meta_path, text) {
                    error!("Failed to write spectrum metadata: {}", e);
                }
            }
            Err(e) => error!("Failed to serialize spectrum metadata: {}", e),
        }

        info!(
            "Spectrum recording stopped: {} ({} frames)",
            active.meta.filename, active.frames
        );
        Some(active.meta.filename)
    }

    pub fn status(&self) -> Value {
        let active = self.lock_active();
        match active.as_ref() {
            Some(a) => json!({
                "spectrum_recording": true,
                "spectrum_frames": a.frames,
                "spectrum_filename": a.meta.filename,
            }),
            None => json!({
                "spectrum_recording": false,
                "spectrum_frames": 0,
                "spectrum_filename": Value::Null,
            }),
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveSpectrum>> {
        self.active.lock().expect("spectrum recorder mutex poisoned")
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
