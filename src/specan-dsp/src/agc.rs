// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Software automatic gain control.
//!
//! Proportional controller on measured peak power: outside the hysteresis
//! dead band the hardware gain is stepped toward the target, at most once
//! per `min_interval`, clamped to the hardware limits. The orchestrator
//! applies the returned gain through the receiver façade.

use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct AgcSettings {
    pub target_dbfs: f64,
    pub hysteresis: f64,
    pub gain_step: f64,
    pub min_interval_secs: f64,
    pub gain_min: f64,
    pub gain_max: f64,
}

impl Default for AgcSettings {
    fn default() -> Self {
        Self {
            target_dbfs: -20.0,
            hysteresis: 6.0,
            gain_step: 3.0,
            min_interval_secs: 1.0,
            gain_min: 0.0,
            gain_max: 60.0,
        }
    }
}

struct AgcState {
    settings: AgcSettings,
    enabled: bool,
    last_adjust: Option<Instant>,
}

pub struct SoftwareAgc {
    state: Mutex<AgcState>,
}

impl Default for SoftwareAgc {
    fn default() -> Self {
        Self::new(AgcSettings::default())
    }
}

impl SoftwareAgc {
    pub fn new(settings: AgcSettings) -> Self {
        Self {
            state: Mutex::new(AgcState {
                settings,
                enabled: false,
                last_adjust: None,
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.state.lock().expect("AGC mutex poisoned").enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.lock().expect("AGC mutex poisoned");
        state.enabled = enabled;
        if enabled {
            info!(
                "AGC enabled: target={:.0} dBFS, hysteresis={:.0} dB, step={:.0} dB",
                state.settings.target_dbfs, state.settings.hysteresis, state.settings.gain_step,
            );
        } else {
            info!("AGC disabled");
        }
    }

    pub fn set_target_dbfs(&self, v: f64) {
        self.state.lock().expect("AGC mutex poisoned").settings.target_dbfs = v;
    }

    pub fn set_hysteresis(&self, v: f64) {
        self.state.lock().expect("AGC mutex poisoned").settings.hysteresis = v;
    }

    pub fn set_gain_step(&self, v: f64) {
        self.state.lock().expect("AGC mutex poisoned").settings.gain_step = v;
    }

    pub fn set_min_interval(&self, secs: f64) {
        self.state
            .lock()
            .expect("AGC mutex poisoned")
            .settings
            .min_interval_secs = secs.max(0.0);
    }

    /// Evaluate one frame. Returns the new gain to apply, or `None` when no
    /// adjustment is due (disabled, inside the dead band, rate-limited, or
    /// already railed).
    pub fn update(&self, peak_power: f64, current_gain: f64) -> Option<f64> {
        let mut state = self.state.lock().expect("AGC mutex poisoned");
        if !state.enabled {
            return None;
        }

        let now = Instant::now();
        if let Some(last) = state.last_adjust {
            if now.duration_since(last).as_secs_f64() < state.settings.min_interval_secs {
                return None;
            }
        }

        let half_hyst = state.settings.hysteresis / 2.0;
        let error = peak_power - state.settings.target_dbfs;

        let new_gain = if error > half_hyst {
            current_gain - state.settings.gain_step
        } else if error < -half_hyst {
            current_gain + state.settings.gain_step
        } else {
            return None;
        };

        let new_gain = new_gain.clamp(state.settings.gain_min, state.settings.gain_max);
        if new_gain == current_gain {
            return None;
        }

        state.last_adjust = Some(now);
        debug!(
            "AGC: peak={:.1} dBFS, target={:.1}, gain {:.0} -> {:.0} dB",
            peak_power, state.settings.target_dbfs, current_gain, new_gain,
        );
        Some(new_gain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_agc() -> SoftwareAgc {
        let agc = SoftwareAgc::new(AgcSettings {
            min_interval_secs: 0.0,
            ..AgcSettings::default()
        });
        agc.set_enabled(true);
        agc
    }

    #[test]
    fn disabled_does_nothing() {
        let agc = SoftwareAgc::default();
        assert_eq!(agc.update(0.0, 40.0), None);
    }

    #[test]
    fn strong_signal_reduces_gain() {
        let agc = fast_agc();
        assert_eq!(agc.update(-5.0, 40.0), Some(37.0));
    }

    #[test]
    fn weak_signal_increases_gain() {
        let agc = fast_agc();
        assert_eq!(agc.update(-50.0, 40.0), Some(43.0));
    }

    #[test]
    fn dead_band_suppresses_adjustment() {
        let agc = fast_agc();
        assert_eq!(agc.update(-18.0, 40.0), None);
        assert_eq!(agc.update(-22.0, 40.0), None);
    }

    #[test]
    fn clamps_at_rails() {
        let agc = fast_agc();
        assert_eq!(agc.update(-80.0, 59.0), Some(60.0));
        // Already railed: no change, no event.
        assert_eq!(agc.update(-80.0, 60.0), None);
        assert_eq!(agc.update(10.0, 1.0), Some(0.0));
        assert_eq!(agc.update(10.0, 0.0), None);
    }

    #[test]
    fn rate_limited() {
        let agc = SoftwareAgc::new(AgcSettings {
            min_interval_secs: 60.0,
            ..AgcSettings::default()
        });
        agc.set_enabled(true);
        assert_eq!(agc.update(-5.0, 40.0), Some(37.0));
        assert_eq!(agc.update(-5.0, 37.0), None);
    }
}
