// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! IQ chunk and DSP frame types flowing through the processing pipeline.

use num_complex::Complex;

/// One fixed-size block of complex baseband samples.
///
/// The length always equals the configured FFT size; ownership transfers
/// from the producer thread to the DSP worker through the ingest queue.
pub type IqChunk = Vec<Complex<f32>>;

/// Output of the DSP pipeline for one frame.
#[derive(Debug, Clone)]
pub struct DspFrame {
    /// Display spectrum, power in dBFS.
    pub spectrum: Vec<f32>,
    /// Peak-hold trace, present iff peak hold is enabled. Same length as
    /// `spectrum`.
    pub peak_hold: Option<Vec<f32>>,
    /// Estimated noise floor in dB.
    pub noise_floor: f32,
    /// Peak power in dBFS.
    pub peak_power: f32,
    /// Peak bin position normalized to [-0.5, 0.5].
    pub peak_freq_offset: f32,
}
