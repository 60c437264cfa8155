// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! SoapySDR driver implementation.
//!
//! `RxStream<Complex<f32>>` is `Send` and `StreamSample` is implemented for
//! `num_complex::Complex<f32>`, so samples need no conversion on the way
//! through.

use num_complex::Complex;
use soapysdr::{Device, Direction};
use tracing::{info, warn};

use specan_core::DeviceStatus;

use crate::driver::IqDriver;

/// Read timeout: long enough not to busy-spin, short enough that the
/// producer loop notices a stop request promptly.
const READ_TIMEOUT_US: i64 = 1_000_000;

pub struct SoapyDriver {
    /// Held to keep the device alive for the stream's lifetime.
    device: Device,
    stream: soapysdr::RxStream<Complex<f32>>,
}

impl SoapyDriver {
    /// Open and configure a device from a SoapySDR args string
    /// (e.g. `"driver=bladerf"`), then activate its RX stream.
    pub fn open(args: &str, status: &DeviceStatus) -> Result<Self, String> {
        info!("Initializing SoapySDR device with args: {}", args);

        let device = Device::new(args)
            .map_err(|e| format!("failed to open SoapySDR device '{}': {}", args, e))?;

        device
            .set_sample_rate(Direction::Rx, 0, status.sample_rate)
            .map_err(|e| format!("failed to set sample rate: {}", e))?;
        device
            .set_frequency(Direction::Rx, 0, status.center_freq, ())
            .map_err(|e| format!("failed to set frequency: {}", e))?;
        if status.bandwidth > 0.0 {
            if let Err(e) = device.set_bandwidth(Direction::Rx, 0, status.bandwidth) {
                warn!("Failed to set bandwidth: {}; continuing with default", e);
            }
        }
        if let Err(e) = device.set_gain(Direction::Rx, 0, status.gain) {
            warn!("Failed to set gain: {}; using device default", e);
        }

        let mut stream = device
            .rx_stream::<Complex<f32>>(&[0])
            .map_err(|e| format!("failed to create RX stream: {}", e))?;
        stream
            .activate(None)
            .map_err(|e| format!("failed to activate RX stream: {}", e))?;

        info!("SoapySDR RX stream activated");
        Ok(Self { device, stream })
    }
}

impl IqDriver for SoapyDriver {
    fn read_into(&mut self, buf: &mut [Complex<f32>]) -> Result<usize, String> {
        self.stream
            .read(&[buf], READ_TIMEOUT_US)
            .map_err(|e| format!("stream read error: {}", e))
    }

    fn set_frequency(&mut self, hz: f64) -> Result<(), String> {
        self.device
            .set_frequency(Direction::Rx, 0, hz, ())
            .map_err(|e| format!("failed to retune center frequency: {}", e))
    }

    fn set_gain(&mut self, db: f64) -> Result<(), String> {
        self.device
            .set_gain(Direction::Rx, 0, db)
            .map_err(|e| format!("failed to set gain: {}", e))
    }

    fn set_sample_rate(&mut self, hz: f64) -> Result<(), String> {
        self.device
            .set_sample_rate(Direction::Rx, 0, hz)
            .map_err(|e| format!("failed to set sample rate: {}", e))
    }

    fn set_bandwidth(&mut self, hz: f64) -> Result<(), String> {
        self.device
            .set_bandwidth(Direction::Rx, 0, hz)
            .map_err(|e| format!("failed to set bandwidth: {}", e))
    }
}
