// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Spectrum-based signal detection and tracking.
//!
//! Each call thresholds the display spectrum above the estimated noise
//! floor, extracts contiguous regions, matches them against the tracked
//! table by bin overlap, and emits new/update/lost events. Called from the
//! DSP worker with every frame; internally throttled to the configured
//! update interval.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use specan_core::{SignalEvent, SignalEventKind, TrackedSignal};

#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// dB above the noise floor for a bin to count as active.
    pub threshold_db: f32,
    /// Minimum run length in bins for a valid region.
    pub min_bandwidth_bins: usize,
    /// Regions separated by at most this many empty bins are merged.
    pub merge_gap_bins: usize,
    pub update_interval_secs: f64,
    /// Idle time before a tracked signal is declared lost.
    pub persistence_timeout_secs: f64,
    /// Bin-overlap ratio (`|intersection| / min(|a|, |b|)`) to match a
    /// region to a tracked signal.
    pub overlap_match_ratio: f64,
    pub max_tracked_signals: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold_db: 6.0,
            min_bandwidth_bins: 3,
            merge_gap_bins: 5,
            update_interval_secs: 0.5,
            persistence_timeout_secs: 10.0,
            overlap_match_ratio: 0.3,
            max_tracked_signals: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectorStatus {
    pub detection_enabled: bool,
    pub tracked_signals: usize,
    pub total_detections: u64,
    pub threshold_db: f32,
}

struct DetectorState {
    config: DetectionConfig,
    enabled: bool,
    tracked: Vec<TrackedSignal>,
    next_id: u64,
    last_detect: Option<Instant>,
    total_detections: u64,
}

pub struct SignalDetector {
    state: Mutex<DetectorState>,
}

impl SignalDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            state: Mutex::new(DetectorState {
                config,
                enabled: false,
                tracked: Vec::new(),
                next_id: 1,
                last_detect: None,
                total_detections: 0,
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.state.lock().expect("detector mutex poisoned").enabled
    }

    /// Enable or disable detection. Disabling flushes every tracked signal
    /// as a lost event and empties the table.
    pub fn set_enabled(&self, enabled: bool) -> Vec<SignalEvent> {
        let mut state = self.state.lock().expect("detector mutex poisoned");
        state.enabled = enabled;
        info!(
            "Signal detection {}",
            if enabled { "enabled" } else { "disabled" }
        );
        if enabled {
            return Vec::new();
        }
        state
            .tracked
            .drain(..)
            .map(|signal| SignalEvent {
                kind: SignalEventKind::Lost,
                signal,
            })
            .collect()
    }

    pub fn set_threshold_db(&self, v: f32) {
        self.lock().config.threshold_db = v;
    }

    pub fn set_min_bandwidth_bins(&self, v: usize) {
        self.lock().config.min_bandwidth_bins = v;
    }

    pub fn set_merge_gap_bins(&self, v: usize) {
        self.lock().config.merge_gap_bins = v;
    }

    pub fn set_update_interval(&self, secs: f64) {
        self.lock().config.update_interval_secs = secs.max(0.0);
    }

    pub fn set_persistence_timeout(&self, secs: f64) {
        self.lock().config.persistence_timeout_secs = secs.max(0.0);
    }

    pub fn set_overlap_match_ratio(&self, ratio: f64) {
        self.lock().config.overlap_match_ratio = ratio.clamp(0.0, 1.0);
    }

    pub fn set_max_tracked_signals(&self, n: usize) {
        self.lock().config.max_tracked_signals = n;
    }

    pub fn tracked(&self) -> Vec<TrackedSignal> {
        self.lock().tracked.clone()
    }

    pub fn status(&self) -> DetectorStatus {
        let state = self.lock();
        DetectorStatus {
            detection_enabled: state.enabled,
            tracked_signals: state.tracked.len(),
            total_detections: state.total_detections,
            threshold_db: state.config.threshold_db,
        }
    }

    /// Run detection on one spectrum frame.
    pub fn detect(
        &self,
        spectrum: &[f32],
        noise_floor: f32,
        center_freq: f64,
        sample_rate: f64,
    ) -> Vec<SignalEvent> {
        self.detect_at(spectrum, noise_floor, center_freq, sample_rate, Instant::now())
    }

    fn detect_at(
        &self,
        spectrum: &[f32],
        noise_floor: f32,
        center_freq: f64,
        sample_rate: f64,
        now: Instant,
    ) -> Vec<SignalEvent> {
        let mut state = self.lock();
        if !state.enabled || spectrum.is_empty() {
            return Vec::new();
        }
        if let Some(last) = state.last_detect {
            if now.duration_since(last).as_secs_f64() < state.config.update_interval_secs {
                return Vec::new();
            }
        }
        state.last_detect = Some(now);

        let threshold = noise_floor + state.config.threshold_db;
        let regions = find_regions(
            spectrum,
            threshold,
            state.config.min_bandwidth_bins,
            state.config.merge_gap_bins,
        );

        let num_bins = spectrum.len();
        let freq_start = center_freq - sample_rate / 2.0;
        let bin_width = sample_rate / num_bins as f64;

        let mut events = Vec::new();
        let mut matched: Vec<u64> = Vec::new();

        for &(start, end) in &regions {
            let segment = &spectrum[start..end];
            let (local_peak, peak_power) = segment
                .iter()
                .copied()
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |acc, (i, v)| {
                    if v > acc.1 {
                        (i, v)
                    } else {
                        acc
                    }
                });
            let peak_bin = start + local_peak;

            let sig_center = freq_start + (start + end - 1) as f64 / 2.0 * bin_width;
            let sig_peak_freq = freq_start + peak_bin as f64 * bin_width;
            let sig_bandwidth = (end - start) as f64 * bin_width;
            let mean_linear: f64 = segment
                .iter()
                .map(|&db| 10f64.powf(db as f64 / 10.0))
                .sum::<f64>()
                / segment.len() as f64;
            let avg_power = (10.0 * mean_linear.log10()) as f32;

            // Best unmatched tracked signal by bin-overlap ratio.
            let mut best: Option<(usize, f64)> = None;
            for (idx, tracked) in state.tracked.iter().enumerate() {
                if matched.contains(&tracked.id) {
                    continue;
                }
                let overlap =
                    overlap_ratio(start, end, tracked.bin_start, tracked.bin_end);
                if overlap > best.map_or(0.0, |(_, o)| o) {
                    best = Some((idx, overlap));
                }
            }

            match best {
                Some((idx, overlap)) if overlap >= state.config.overlap_match_ratio => {
                    let tracked = &mut state.tracked[idx];
                    tracked.center_freq = sig_center;
                    tracked.peak_freq = sig_peak_freq;
                    tracked.bandwidth = sig_bandwidth;
                    tracked.peak_power = peak_power;
                    tracked.avg_power = avg_power;
                    tracked.bin_start = start;
                    tracked.bin_end = end;
                    tracked.last_seen = now;
                    tracked.hit_count += 1;
                    matched.push(tracked.id);
                    events.push(SignalEvent {
                        kind: SignalEventKind::Update,
                        signal: tracked.clone(),
                    });
                }
                _ => {
                    if state.tracked.len() >= state.config.max_tracked_signals {
                        continue;
                    }
                    let signal = TrackedSignal {
                        id: state.next_id,
                        center_freq: sig_center,
                        peak_freq: sig_peak_freq,
                        bandwidth: sig_bandwidth,
                        peak_power,
                        avg_power,
                        bin_start: start,
                        bin_end: end,
                        first_seen: now,
                        last_seen: now,
                        hit_count: 1,
                        classification: String::new(),
                        notes: String::new(),
                    };
                    state.next_id += 1;
                    state.total_detections += 1;
                    state.tracked.push(signal.clone());
                    matched.push(signal.id);
                    events.push(SignalEvent {
                        kind: SignalEventKind::New,
                        signal,
                    });
                }
            }
        }

        // Expire tracked signals not seen within the persistence window.
        let timeout = Duration::from_secs_f64(state.config.persistence_timeout_secs);
        let mut kept = Vec::with_capacity(state.tracked.len());
        for signal in state.tracked.drain(..) {
            if now.duration_since(signal.last_seen) > timeout {
                events.push(SignalEvent {
                    kind: SignalEventKind::Lost,
                    signal,
                });
            } else {
                kept.push(signal);
            }
        }
        state.tracked = kept;

        events
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DetectorState> {
        self.state.lock().expect("detector mutex poisoned")
    }
}

/// Maximal runs above `threshold`, filtered by minimum width, then merged
/// across gaps of at most `merge_gap` empty bins.
fn find_regions(
    spectrum: &[f32],
    threshold: f32,
    min_bins: usize,
    merge_gap: usize,
) -> Vec<(usize, usize)> {
    let mut runs: Vec<(usize, usize)> = Vec::new();
    let mut run_start: Option<usize> = None;
    for (i, &v) in spectrum.iter().enumerate() {
        match (v > threshold, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(s)) => {
                runs.push((s, i));
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = run_start {
        runs.push((s, spectrum.len()));
    }

    runs.retain(|&(s, e)| e - s >= min_bins);

    if runs.len() < 2 {
        return runs;
    }
    let mut merged: Vec<(usize, usize)> = vec![runs[0]];
    for &(s, e) in &runs[1..] {
        let last = merged.last_mut().expect("merged is non-empty");
        if s - last.1 <= merge_gap {
            last.1 = e;
        } else {
            merged.push((s, e));
        }
    }
    merged
}

fn overlap_ratio(a_start: usize, a_end: usize, b_start: usize, b_end: usize) -> f64 {
    let start = a_start.max(b_start);
    let end = a_end.min(b_end);
    if start >= end {
        return 0.0;
    }
    let min_len = (a_end - a_start).min(b_end - b_start);
    if min_len == 0 {
        return 0.0;
    }
    (end - start) as f64 / min_len as f64
}
