// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configuration file support for specan-server.
//!
//! Config is loaded from `specan.toml`. Default search order:
//! 1. Path specified via `--config` CLI argument
//! 2. `./specan.toml`
//! 3. `~/.config/specan/specan.toml`
//! 4. `/etc/specan/specan.toml`

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use specan_core::{DeviceLimits, DeviceStatus, DynResult};
use specan_dsp::{AveragingMode, DetectionConfig, DspConfig, WindowType};

/// Top-level server configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// General settings
    pub general: GeneralConfig,
    /// TCP listener configuration
    pub listen: ListenConfig,
    /// Receiver hardware configuration
    pub device: DeviceConfig,
    /// Live DSP pipeline configuration
    pub dsp: DspSection,
    /// Streaming queue and frame-rate tuning
    pub stream: StreamConfig,
    /// Frequency sweep defaults
    pub sweep: SweepConfig,
    /// Signal detection configuration
    pub detection: DetectionSection,
    /// Recording and playback configuration
    pub recording: RecordingConfig,
}

/// General application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub enabled: bool,
    pub listen: IpAddr,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Driver selection: "mock" or "soapysdr".
    pub driver: String,
    /// SoapySDR args string (e.g. "driver=bladerf").
    pub device_args: String,
    pub center_freq: f64,
    pub sample_rate: f64,
    pub bandwidth: f64,
    pub gain: f64,
    pub min_freq: f64,
    pub max_freq: f64,
    pub min_gain: f64,
    pub max_gain: f64,
    pub min_sample_rate: f64,
    pub max_sample_rate: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let limits = DeviceLimits::default();
        Self {
            driver: "mock".to_string(),
            device_args: String::new(),
            center_freq: 100e6,
            sample_rate: 2e6,
            bandwidth: 2e6,
            gain: 40.0,
            min_freq: limits.min_freq,
            max_freq: limits.max_freq,
            min_gain: limits.min_gain,
            max_gain: limits.max_gain,
            min_sample_rate: limits.min_sample_rate,
            max_sample_rate: limits.max_sample_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DspSection {
    pub fft_size: usize,
    pub window_type: String,
    pub averaging_mode: String,
    pub averaging_count: usize,
    pub averaging_alpha: f32,
    pub dc_removal: bool,
    pub target_display_bins: usize,
}

impl Default for DspSection {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            window_type: "blackman-harris".to_string(),
            averaging_mode: "exponential".to_string(),
            averaging_count: 8,
            averaging_alpha: 0.3,
            dc_removal: true,
            target_display_bins: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Ingest queue capacity in chunks (~128 ms of data at the defaults).
    pub iq_queue_size: usize,
    /// Result queue capacity; small, live frames are latest-wins.
    pub result_queue_size: usize,
    pub target_fps: f64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            iq_queue_size: 256,
            result_queue_size: 8,
            target_fps: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub sample_rate: f64,
    pub fft_size: usize,
    /// Fraction of each step's bandwidth kept after edge trimming.
    pub usable_fraction: f64,
    /// IQ chunks discarded after each retune (PLL settling).
    pub settle_chunks: u32,
    pub averages_per_step: u32,
    pub display_bins: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            sample_rate: 20e6,
            fft_size: 2048,
            usable_fraction: 0.8,
            settle_chunks: 10,
            averages_per_step: 4,
            display_bins: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSection {
    pub threshold_db: f32,
    pub min_bandwidth_bins: usize,
    pub merge_gap_bins: usize,
    pub update_interval: f64,
    pub persistence_timeout: f64,
    pub overlap_match_ratio: f64,
    pub max_tracked_signals: usize,
    /// Persistent signal store location.
    pub db_path: String,
    /// Frequency tolerance when matching store rows.
    pub match_bandwidth_hz: f64,
}

impl Default for DetectionSection {
    fn default() -> Self {
        let d = DetectionConfig::default();
        Self {
            threshold_db: d.threshold_db,
            min_bandwidth_bins: d.min_bandwidth_bins,
            merge_gap_bins: d.merge_gap_bins,
            update_interval: d.update_interval_secs,
            persistence_timeout: d.persistence_timeout_secs,
            overlap_match_ratio: d.overlap_match_ratio,
            max_tracked_signals: d.max_tracked_signals,
            db_path: "data/signals.db".to_string(),
            match_bandwidth_hz: 50e3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub storage_path: String,
    pub max_storage_bytes: u64,
    /// Write buffer for the raw IQ file.
    pub iq_buffer_size: usize,
    /// Recorder queue capacity in chunks.
    pub iq_queue_size: usize,
    /// Spectrum capture rate in Hz.
    pub spectrum_rate: f64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            storage_path: "data/recordings".to_string(),
            max_storage_bytes: 1_073_741_824,
            iq_buffer_size: 524_288,
            iq_queue_size: 512,
            spectrum_rate: 1.0,
        }
    }
}

impl ServerConfig {
    pub fn load_from_file(path: &Path) -> DynResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        let cfg: ServerConfig = toml::from_str(&text)
            .map_err(|e| format!("cannot parse {}: {}", path.display(), e))?;
        Ok(cfg)
    }

    /// Search the default locations; absent files fall back to defaults.
    pub fn load_from_default_paths() -> DynResult<(Self, Option<PathBuf>)> {
        for path in Self::default_paths() {
            if path.is_file() {
                return Ok((Self::load_from_file(&path)?, Some(path)));
            }
        }
        Ok((Self::default(), None))
    }

    fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("specan.toml")];
        if let Ok(home) = std::env::var("HOME") {
            paths.push(PathBuf::from(home).join(".config/specan/specan.toml"));
        }
        paths.push(PathBuf::from("/etc/specan/specan.toml"));
        paths
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.dsp.fft_size.is_power_of_two() {
            return Err(format!(
                "dsp.fft_size must be a power of 2, got {}",
                self.dsp.fft_size
            ));
        }
        if !self.sweep.fft_size.is_power_of_two() {
            return Err(format!(
                "sweep.fft_size must be a power of 2, got {}",
                self.sweep.fft_size
            ));
        }
        self.dsp
            .window_type
            .parse::<WindowType>()
            .map_err(|e| format!("dsp.window_type: {}", e))?;
        self.dsp
            .averaging_mode
            .parse::<AveragingMode>()
            .map_err(|e| format!("dsp.averaging_mode: {}", e))?;
        if self.stream.target_fps <= 0.0 {
            return Err("stream.target_fps must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.sweep.usable_fraction) || self.sweep.usable_fraction == 0.0 {
            return Err("sweep.usable_fraction must be in (0, 1]".to_string());
        }
        if self.device.min_freq >= self.device.max_freq {
            return Err("device.min_freq must be below device.max_freq".to_string());
        }
        Ok(())
    }

    pub fn limits(&self) -> DeviceLimits {
        DeviceLimits {
            min_freq: self.device.min_freq,
            max_freq: self.device.max_freq,
            min_gain: self.device.min_gain,
            max_gain: self.device.max_gain,
            min_sample_rate: self.device.min_sample_rate,
            max_sample_rate: self.device.max_sample_rate,
        }
    }

    pub fn initial_status(&self) -> DeviceStatus {
        DeviceStatus {
            center_freq: self.device.center_freq,
            sample_rate: self.device.sample_rate,
            bandwidth: self.device.bandwidth,
            gain: self.device.gain,
            running: false,
        }
    }

    /// Live pipeline configuration; `validate` has vetted the strings.
    pub fn dsp_config(&self) -> DspConfig {
        DspConfig {
            fft_size: self.dsp.fft_size,
            window: self
                .dsp
                .window_type
                .parse()
                .unwrap_or(WindowType::BlackmanHarris),
            averaging_mode: self
                .dsp
                .averaging_mode
                .parse()
                .unwrap_or(AveragingMode::Exponential),
            averaging_count: self.dsp.averaging_count,
            averaging_alpha: self.dsp.averaging_alpha,
            dc_removal: self.dsp.dc_removal,
            overlap: true,
            target_display_bins: self.dsp.target_display_bins,
        }
    }

    pub fn detection_config(&self) -> DetectionConfig {
        DetectionConfig {
            threshold_db: self.detection.threshold_db,
            min_bandwidth_bins: self.detection.min_bandwidth_bins,
            merge_gap_bins: self.detection.merge_gap_bins,
            update_interval_secs: self.detection.update_interval,
            persistence_timeout_secs: self.detection.persistence_timeout,
            overlap_match_ratio: self.detection.overlap_match_ratio,
            max_tracked_signals: self.detection.max_tracked_signals,
        }
    }

    pub fn example_toml() -> String {
        let cfg = ServerConfig::default();
        toml::to_string_pretty(&cfg).unwrap_or_default()
    }
}
