// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Hardware receiver façade.
//!
//! Owns the one native producer thread per instance: it runs the blocking
//! driver, slices reads into FFT-sized chunks, and pushes them into the
//! ingest queue with a non-blocking send. A full queue drops the chunk and
//! bumps a counter; the warning is rate-limited to once per five seconds.
//!
//! Parameter setters validate against the device limits, cache the value,
//! and hand it to the producer thread, which applies it to the driver
//! before its next read.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, TrySendError};
use num_complex::Complex;
use tracing::{info, warn};

use specan_core::{DeviceLimits, DeviceStatus, DynResult, IqChunk};

use crate::driver::DriverFactory;
use crate::{IqMessage, SampleSource};

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct PendingParams {
    frequency: Option<f64>,
    gain: Option<f64>,
    sample_rate: Option<f64>,
    bandwidth: Option<f64>,
}

pub struct Receiver {
    factory: DriverFactory,
    limits: DeviceLimits,
    params: Mutex<DeviceStatus>,
    pending: Arc<Mutex<PendingParams>>,
    chunk_size: AtomicUsize,
    running: Arc<AtomicBool>,
    drops: Arc<AtomicU64>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Receiver {
    pub fn new(factory: DriverFactory, initial: DeviceStatus, limits: DeviceLimits) -> Self {
        info!(
            "Receiver initialized: freq={:.3} MHz, rate={:.2} MS/s, gain={:.0} dB",
            initial.center_freq / 1e6,
            initial.sample_rate / 1e6,
            initial.gain,
        );
        Self {
            factory,
            limits,
            params: Mutex::new(DeviceStatus {
                running: false,
                ..initial
            }),
            pending: Arc::new(Mutex::new(PendingParams::default())),
            chunk_size: AtomicUsize::new(2048),
            running: Arc::new(AtomicBool::new(false)),
            drops: Arc::new(AtomicU64::new(0)),
            thread: Mutex::new(None),
        }
    }

    pub fn limits(&self) -> DeviceLimits {
        self.limits
    }

    /// Set the chunk (FFT) size. Call before `start`.
    pub fn set_chunk_size(&self, size: usize) {
        self.chunk_size.store(size, Ordering::SeqCst);
    }

    /// Chunks dropped because the ingest queue was full.
    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn set_frequency(&self, freq_hz: f64) -> bool {
        if !self.limits.frequency_in_range(freq_hz) {
            warn!(
                "Frequency {:.3} MHz out of range [{:.1} - {:.1} MHz]",
                freq_hz / 1e6,
                self.limits.min_freq / 1e6,
                self.limits.max_freq / 1e6,
            );
            return false;
        }
        let mut params = self.lock_params();
        let old = params.center_freq;
        params.center_freq = freq_hz;
        if params.running {
            self.lock_pending().frequency = Some(freq_hz);
            info!("Frequency: {:.3} -> {:.3} MHz", old / 1e6, freq_hz / 1e6);
        }
        true
    }

    pub fn set_gain(&self, gain_db: f64) -> bool {
        let gain_db = self.limits.clamp_gain(gain_db);
        let mut params = self.lock_params();
        let old = params.gain;
        params.gain = gain_db;
        if params.running {
            self.lock_pending().gain = Some(gain_db);
            info!("Gain: {:.0} -> {:.0} dB", old, gain_db);
        }
        true
    }

    pub fn set_sample_rate(&self, rate_hz: f64) -> bool {
        if !self.limits.sample_rate_in_range(rate_hz) {
            warn!("Sample rate {:.2} MS/s out of range", rate_hz / 1e6);
            return false;
        }
        let mut params = self.lock_params();
        let old = params.sample_rate;
        params.sample_rate = rate_hz;
        if params.running {
            self.lock_pending().sample_rate = Some(rate_hz);
            info!("Sample rate: {:.2} -> {:.2} MS/s", old / 1e6, rate_hz / 1e6);
        }
        true
    }

    pub fn set_bandwidth(&self, bw_hz: f64) -> bool {
        let mut params = self.lock_params();
        let old = params.bandwidth;
        params.bandwidth = bw_hz;
        if params.running {
            self.lock_pending().bandwidth = Some(bw_hz);
            info!("Bandwidth: {:.3} -> {:.3} MHz", old / 1e6, bw_hz / 1e6);
        }
        true
    }

    /// Stop and release everything. Idempotent.
    pub fn cleanup(&self) {
        self.stop();
    }

    fn lock_params(&self) -> std::sync::MutexGuard<'_, DeviceStatus> {
        self.params.lock().expect("receiver params mutex poisoned")
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingParams> {
        self.pending.lock().expect("receiver pending mutex poisoned")
    }
}

impl SampleSource for Receiver {
    fn start(&self, tx: Sender<IqMessage>) -> DynResult<()> {
        if self.running.load(Ordering::SeqCst) {
            warn!("Receiver already running");
            return Err("receiver already running".into());
        }

        let status = *self.lock_params();
        let driver = (self.factory)(&status)
            .map_err(|e| format!("failed to start receiver: {}", e))?;
        *self.lock_pending() = PendingParams::default();

        self.running.store(true, Ordering::SeqCst);
        self.lock_params().running = true;

        let chunk_size = self.chunk_size.load(Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let pending = Arc::clone(&self.pending);
        let drops = Arc::clone(&self.drops);

        let handle = std::thread::Builder::new()
            .name("sdr-iq-read".to_string())
            .spawn(move || {
                produce_loop(driver, tx, chunk_size, running, pending, drops);
            })
            .map_err(|e| format!("failed to spawn sdr-iq-read thread: {}", e))?;

        *self.thread.lock().expect("receiver thread mutex poisoned") = Some(handle);
        info!("Streaming started (chunk={})", chunk_size);
        Ok(())
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping receiver...");

        let handle = self
            .thread
            .lock()
            .expect("receiver thread mutex poisoned")
            .take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("sdr-iq-read thread did not exit in {:?}", JOIN_TIMEOUT);
            }
        }

        self.lock_params().running = false;
        info!("Receiver stopped");
    }

    fn status(&self) -> DeviceStatus {
        *self.lock_params()
    }
}

fn produce_loop(
    mut driver: Box<dyn crate::IqDriver>,
    tx: Sender<IqMessage>,
    chunk_size: usize,
    running: Arc<AtomicBool>,
    pending: Arc<Mutex<PendingParams>>,
    drops: Arc<AtomicU64>,
) {
    let mut buf = vec![Complex::new(0.0_f32, 0.0); chunk_size];
    let mut chunk: IqChunk = Vec::with_capacity(chunk_size);
    let mut read_error_streak: u32 = 0;
    let mut dropped_since_log: u64 = 0;
    let mut last_drop_log = Instant::now();

    while running.load(Ordering::SeqCst) {
        // Apply pending tuning changes before the next read.
        {
            let mut cmds = pending.lock().expect("receiver pending mutex poisoned");
            if let Some(hz) = cmds.frequency.take() {
                if let Err(e) = driver.set_frequency(hz) {
                    warn!("Retune to {:.0} Hz failed: {}", hz, e);
                }
            }
            if let Some(db) = cmds.gain.take() {
                if let Err(e) = driver.set_gain(db) {
                    warn!("Gain change to {:.1} dB failed: {}", db, e);
                }
            }
            if let Some(hz) = cmds.sample_rate.take() {
                if let Err(e) = driver.set_sample_rate(hz) {
                    warn!("Sample rate change to {:.0} Hz failed: {}", hz, e);
                }
            }
            if let Some(hz) = cmds.bandwidth.take() {
                if let Err(e) = driver.set_bandwidth(hz) {
                    warn!("Bandwidth change to {:.0} Hz failed: {}", hz, e);
                }
            }
        }

        let n = match driver.read_into(&mut buf) {
            Ok(n) => {
                read_error_streak = 0;
                n
            }
            Err(e) => {
                read_error_streak = read_error_streak.saturating_add(1);
                warn!(
                    "IQ read error: {}; retrying (streak={})",
                    e, read_error_streak
                );
                let sleep_ms =
                    (10u64 << read_error_streak.saturating_sub(1).min(4)).min(250);
                std::thread::sleep(Duration::from_millis(sleep_ms));
                continue;
            }
        };
        if n == 0 {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }

        chunk.extend_from_slice(&buf[..n]);
        while chunk.len() >= chunk_size {
            let rest = chunk.split_off(chunk_size);
            let full = std::mem::replace(&mut chunk, rest);
            match tx.try_send(Some(full)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    drops.fetch_add(1, Ordering::Relaxed);
                    dropped_since_log += 1;
                    if last_drop_log.elapsed() >= DROP_LOG_INTERVAL {
                        warn!(
                            "IQ queue full, dropped {} chunks in last {:?}",
                            dropped_since_log, DROP_LOG_INTERVAL
                        );
                        dropped_since_log = 0;
                        last_drop_log = Instant::now();
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    info!("Ingest queue closed, producer exiting");
                    running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    }
    // Driver drops here, releasing device resources on the producer thread.
    info!("sdr-iq-read thread exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use crossbeam_channel::bounded;

    fn mock_receiver(paced: bool) -> Receiver {
        let factory: DriverFactory = Box::new(move |status: &DeviceStatus| {
            let drv = MockDriver::silent(status.sample_rate);
            let drv = if paced { drv } else { drv.unpaced() };
            Ok(Box::new(drv) as Box<dyn crate::IqDriver>)
        });
        Receiver::new(factory, DeviceStatus::default(), DeviceLimits::default())
    }

    #[test]
    fn produces_fixed_size_chunks() {
        let rx = mock_receiver(true);
        rx.set_chunk_size(1024);
        let (tx, rx_chan) = bounded(16);
        rx.start(tx).unwrap();

        let msg = rx_chan
            .recv_timeout(Duration::from_secs(2))
            .expect("no chunk produced");
        let chunk = msg.expect("sentinel before any data");
        assert_eq!(chunk.len(), 1024);
        rx.stop();
        assert!(!rx.status().running);
    }

    #[test]
    fn saturated_queue_drops_instead_of_blocking() {
        let rx = mock_receiver(false);
        rx.set_chunk_size(256);
        let (tx, rx_chan) = bounded(2);
        rx.start(tx).unwrap();

        // Nobody consumes: the producer must keep running and count drops.
        std::thread::sleep(Duration::from_millis(200));
        assert!(rx.drop_count() > 0, "no drops recorded");
        assert_eq!(rx_chan.len(), 2);
        rx.stop();
    }

    #[test]
    fn start_is_exclusive_and_stop_idempotent() {
        let rx = mock_receiver(true);
        rx.set_chunk_size(512);
        let (tx, _rx_chan) = bounded(4);
        rx.start(tx).unwrap();
        let (tx2, _rx2) = bounded::<IqMessage>(4);
        assert!(rx.start(tx2).is_err());
        rx.stop();
        rx.stop();
    }

    #[test]
    fn setters_validate_and_cache() {
        let rx = mock_receiver(true);
        assert!(rx.set_frequency(100e6));
        assert!(!rx.set_frequency(1e6)); // below 47 MHz floor
        assert!(rx.set_sample_rate(4e6));
        assert!(!rx.set_sample_rate(100e6)); // above max
        assert!(rx.set_gain(70.0)); // clamped, not rejected
        let status = rx.status();
        assert_eq!(status.center_freq, 100e6);
        assert_eq!(status.sample_rate, 4e6);
        assert_eq!(status.gain, 60.0);
        assert!(!status.running);
    }

    #[test]
    fn failed_driver_open_reports_start_failure() {
        let factory: DriverFactory =
            Box::new(|_| Err("no device found".to_string()));
        let rx = Receiver::new(factory, DeviceStatus::default(), DeviceLimits::default());
        let (tx, _rx_chan) = bounded(4);
        let err = rx.start(tx).unwrap_err();
        assert!(err.to_string().contains("failed to start receiver"));
        assert!(!rx.status().running);
    }
}
