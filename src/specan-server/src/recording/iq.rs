// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Raw IQ recorder.
//!
//! `put` is called from the DSP worker for every chunk and must never block
//! it: chunks go through a bounded queue with drop-on-full. A dedicated
//! writer thread drains the queue into a buffered file and finalizes the
//! JSON sidecar when recording ends, including the auto-stop path when
//! total storage usage crosses the configured cap.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use specan_core::{DeviceStatus, DynResult, IqChunk};

use super::dir_usage;

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata sidecar for IQ recordings.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingMetadata {
    pub filename: String,
    pub format: String,
    pub sample_rate: f64,
    pub center_freq: f64,
    pub bandwidth: f64,
    pub gain: f64,
    pub fft_size: u32,
    pub start_time: f64,
    pub end_time: f64,
    pub total_samples: u64,
    pub total_bytes: u64,
    pub duration_seconds: f64,
}

struct ActiveRecording {
    tx: Option<Sender<IqChunk>>,
    handle: Option<JoinHandle<()>>,
    filename: String,
    meta: Arc<Mutex<RecordingMetadata>>,
}

pub struct IqRecorder {
    storage: PathBuf,
    max_bytes: u64,
    queue_size: usize,
    buffer_size: usize,
    recording: Arc<AtomicBool>,
    active: Mutex<Option<ActiveRecording>>,
    drops: AtomicU64,
}

impl IqRecorder {
    pub fn new(storage: PathBuf, max_bytes: u64, queue_size: usize, buffer_size: usize) -> Self {
        Self {
            storage,
            max_bytes,
            queue_size,
            buffer_size,
            recording: Arc::new(AtomicBool::new(false)),
            active: Mutex::new(None),
            drops: AtomicU64::new(0),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    /// Chunks dropped because the writer queue was full.
    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Begin recording with the given hardware parameters. Returns the base
    /// filename (no extension).
    pub fn start(&self, status: &DeviceStatus, fft_size: u32) -> DynResult<String> {
        let mut active = self.lock_active();
        if self.recording.load(Ordering::SeqCst) {
            return Err("already recording".into());
        }
        std::fs::create_dir_all(&self.storage)
            .map_err(|e| format!("cannot create {}: {}", self.storage.display(), e))?;

        let initial_usage = dir_usage(&self.storage);
        if initial_usage >= self.max_bytes {
            return Err(format!(
                "storage limit reached: {} / {} bytes",
                initial_usage, self.max_bytes
            )
            .into());
        }

        let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let base = format!("iq_{}_{:.3}MHz", ts, status.center_freq / 1e6);
        let raw_path = self.storage.join(format!("{}.raw", base));
        let meta_path = self.storage.join(format!("{}.json", base));

        let file = File::create(&raw_path)
            .map_err(|e| format!("failed to open recording file: {}", e))?;
        let writer = BufWriter::with_capacity(self.buffer_size, file);

        let meta = Arc::new(Mutex::new(RecordingMetadata {
            filename: base.clone(),
            format: "complex64".to_string(),
            sample_rate: status.sample_rate,
            center_freq: status.center_freq,
            bandwidth: status.bandwidth,
            gain: status.gain,
            fft_size,
            start_time: unix_now(),
            end_time: 0.0,
            total_samples: 0,
            total_bytes: 0,
            duration_seconds: 0.0,
        }));

        let (tx, rx) = bounded::<IqChunk>(self.queue_size);
        let recording = Arc::clone(&self.recording);
        let writer_meta = Arc::clone(&meta);
        let max_bytes = self.max_bytes;
        let handle = std::thread::Builder::new()
            .name("iq-recorder".to_string())
            .spawn(move || {
                writer_loop(
                    rx,
                    writer,
                    writer_meta,
                    meta_path,
                    recording,
                    max_bytes,
                    initial_usage,
                );
            })
            .map_err(|e| format!("failed to spawn iq-recorder thread: {}", e))?;

        self.recording.store(true, Ordering::SeqCst);
        *active = Some(ActiveRecording {
            tx: Some(tx),
            handle: Some(handle),
            filename: base.clone(),
            meta,
        });

        info!(
            "IQ recording started: {} ({:.3} MHz, {:.2} MS/s)",
            base,
            status.center_freq / 1e6,
            status.sample_rate / 1e6
        );
        Ok(base)
    }

    /// Submit a chunk from the DSP thread. Non-blocking; drops on full.
    pub fn put(&self, chunk: &IqChunk) {
        if !self.recording.load(Ordering::Relaxed) {
            return;
        }
        let active = self.lock_active();
        if let Some(tx) = active.as_ref().and_then(|a| a.tx.as_ref()) {
            if let Err(TrySendError::Full(_)) = tx.try_send(chunk.clone()) {
                self.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Stop recording and finalize the sidecar. Returns the base filename,
    /// or `None` if nothing was active.
    pub fn stop(&self) -> Option<String> {
        let mut guard = self.lock_active();
        let mut active = guard.take()?;
        self.recording.store(false, Ordering::SeqCst);

        // Closing the channel lets the writer drain and finalize.
        drop(active.tx.take());
        if let Some(handle) = active.handle.take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("iq-recorder thread did not exit in {:?}", JOIN_TIMEOUT);
            }
        }

        let meta = active.meta.lock().expect("recorder meta mutex poisoned");
        info!(
            "IQ recording stopped: {} ({} samples, {} bytes, {:.1} s)",
            active.filename, meta.total_samples, meta.total_bytes, meta.duration_seconds
        );
        Some(active.filename)
    }

    pub fn status(&self) -> Value {
        let active = self.lock_active();
        match active.as_ref() {
            Some(a) => {
                let meta = a.meta.lock().expect("recorder meta mutex poisoned");
                json!({
                    "iq_recording": self.is_recording(),
                    "iq_bytes_written": meta.total_bytes,
                    "iq_samples_written": meta.total_samples,
                    "iq_duration": unix_now() - meta.start_time,
                    "iq_filename": a.filename,
                })
            }
            None => json!({
                "iq_recording": false,
                "iq_bytes_written": 0,
                "iq_samples_written": 0,
                "iq_duration": 0.0,
                "iq_filename": Value::Null,
            }),
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveRecording>> {
        self.active.lock().expect("recorder mutex poisoned")
    }
}

fn writer_loop(
    rx: Receiver<IqChunk>,
    mut writer: BufWriter<File>,
    meta: Arc<Mutex<RecordingMetadata>>,
    meta_path: PathBuf,
    recording: Arc<AtomicBool>,
    max_bytes: u64,
    initial_usage: u64,
) {
    info!("IQ recorder thread started");
    let mut bytes_written: u64 = 0;
    let mut samples_written: u64 = 0;
    let mut raw = Vec::new();

    loop {
        let chunk = match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(chunk) => chunk,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        raw.clear();
        raw.reserve(chunk.len() * 8);
        for s in &chunk {
            raw.extend_from_slice(&s.re.to_le_bytes());
            raw.extend_from_slice(&s.im.to_le_bytes());
        }

        if let Err(e) = writer.write_all(&raw) {
            error!("IQ write error: {}", e);
            recording.store(false, Ordering::SeqCst);
            break;
        }
        bytes_written += raw.len() as u64;
        samples_written += chunk.len() as u64;
        {
            let mut m = meta.lock().expect("recorder meta mutex poisoned");
            m.total_bytes = bytes_written;
            m.total_samples = samples_written;
        }

        if initial_usage + bytes_written >= max_bytes {
            warn!("Storage limit reached, auto-stopping recording");
            recording.store(false, Ordering::SeqCst);
            break;
        }
    }

    if let Err(e) = writer.flush() {
        error!("IQ flush error: {}", e);
    }
    drop(writer);

    // Finalize the sidecar on the writer side so the auto-stop path gets
    // one too.
    let snapshot = {
        let mut m = meta.lock().expect("recorder meta mutex poisoned");
        m.end_time = unix_now();
        m.total_bytes = bytes_written;
        m.total_samples = samples_written;
        m.duration_seconds = m.end_time - m.start_time;
        m.clone()
    };
    match serde_json::to_string_pretty(&snapshot) {
        Ok(text) => {
            if let Err(e) = std::fs::write(&meta_path, text) {
                error!("Failed to write metadata: {}", e);
            }
        }
        Err(e) => error!("Failed to serialize metadata: {}", e),
    }

    info!("IQ recorder thread exited ({} bytes written)", bytes_written);
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
