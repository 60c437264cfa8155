// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Receiver status and tuning-range types shared between the backend,
//! the orchestrator, and the wire protocol.

use serde::{Deserialize, Serialize};

/// Snapshot of the parameters a sample source is currently running with.
///
/// For a hardware receiver these are the tuner settings in effect; for file
/// playback they come from the recording sidecar. Every spectrum packet
/// carries the snapshot that was current when the frame was computed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub center_freq: f64,
    pub sample_rate: f64,
    pub bandwidth: f64,
    pub gain: f64,
    pub running: bool,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            center_freq: 100e6,
            sample_rate: 2e6,
            bandwidth: 2e6,
            gain: 40.0,
            running: false,
        }
    }
}

/// Hard tuning limits enforced by the receiver façade.
///
/// Defaults cover the bladeRF 2.0 envelope; other devices narrow them via
/// configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeviceLimits {
    pub min_freq: f64,
    pub max_freq: f64,
    pub min_gain: f64,
    pub max_gain: f64,
    pub min_sample_rate: f64,
    pub max_sample_rate: f64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_freq: 47e6,
            max_freq: 6e9,
            min_gain: 0.0,
            max_gain: 60.0,
            min_sample_rate: 1e6,
            max_sample_rate: 61.44e6,
        }
    }
}

impl DeviceLimits {
    pub fn clamp_gain(&self, gain_db: f64) -> f64 {
        gain_db.clamp(self.min_gain, self.max_gain)
    }

    pub fn frequency_in_range(&self, freq_hz: f64) -> bool {
        (self.min_freq..=self.max_freq).contains(&freq_hz)
    }

    pub fn sample_rate_in_range(&self, rate_hz: f64) -> bool {
        (self.min_sample_rate..=self.max_sample_rate).contains(&rate_hz)
    }
}
