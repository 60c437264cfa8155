// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Tracked-signal state and the events the detector emits when it changes.

use std::time::Instant;

/// A signal currently tracked by the detector.
#[derive(Debug, Clone)]
pub struct TrackedSignal {
    /// Monotonically increasing unique id.
    pub id: u64,
    /// Center frequency in Hz.
    pub center_freq: f64,
    /// Frequency of the peak bin in Hz.
    pub peak_freq: f64,
    /// Estimated bandwidth in Hz.
    pub bandwidth: f64,
    /// Peak power in dBFS.
    pub peak_power: f32,
    /// Average power in dBFS (mean taken in linear power).
    pub avg_power: f32,
    /// Bin range `[start, end)` in the last spectrum the signal was seen in.
    pub bin_start: usize,
    pub bin_end: usize,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub hit_count: u64,
    pub classification: String,
    pub notes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEventKind {
    New,
    Update,
    Lost,
}

impl SignalEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalEventKind::New => "signal_new",
            SignalEventKind::Update => "signal_update",
            SignalEventKind::Lost => "signal_lost",
        }
    }
}

/// Emitted by the detector when a tracked signal appears, changes, or
/// expires.
#[derive(Debug, Clone)]
pub struct SignalEvent {
    pub kind: SignalEventKind,
    pub signal: TrackedSignal,
}
