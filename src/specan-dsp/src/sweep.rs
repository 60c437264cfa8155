// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Sweep step planning and panorama stitching.
//!
//! A sweep tunes the receiver across `[freq_start, freq_end]` in steps of
//! the usable bandwidth `u * sample_rate`. Each step produces a
//! full-resolution FFT; the stitcher trims the filter-rolloff edges and
//! places the usable bins contiguously into a panorama, crossfading each
//! seam against the previous segment's trailing edge in linear power.

use tracing::{info, warn};

use specan_core::DeviceLimits;

use crate::downsample::peak_decimate;

/// Fill value for panorama bins no segment has written yet.
const EMPTY_DB: f32 = -200.0;
/// Bins above this have been written by a real segment.
const WRITTEN_DB: f32 = -190.0;

/// Compute the center frequency for each sweep step.
///
/// Centers advance by the usable bandwidth so the kept portions tile
/// contiguously; each center is clamped into the device's tunable range.
/// An empty plan falls back to a single step at the band midpoint.
pub fn plan_steps(
    freq_start: f64,
    freq_end: f64,
    sample_rate: f64,
    usable_fraction: f64,
    limits: &DeviceLimits,
) -> Vec<f64> {
    let usable_bw = sample_rate * usable_fraction;
    let half_bw = sample_rate / 2.0;

    let lo = limits.min_freq + half_bw;
    let hi = limits.max_freq - half_bw;

    let mut steps = Vec::new();
    let mut center = freq_start + usable_bw / 2.0;
    while center - usable_bw / 2.0 < freq_end {
        steps.push(center.clamp(lo, hi));
        center += usable_bw;
    }

    if steps.is_empty() {
        steps.push((freq_start + freq_end) / 2.0);
    }
    steps
}

/// Assembles per-step spectra into one panoramic power spectrum.
pub struct Stitcher {
    freq_start: f64,
    freq_end: f64,
    steps: Vec<f64>,
    fft_size: usize,
    trim_bins: usize,
    usable_bins: usize,
    taper_len: usize,
    panorama: Vec<f32>,
    freqs: Vec<f64>,
}

impl Stitcher {
    pub fn new(
        freq_start: f64,
        freq_end: f64,
        steps: Vec<f64>,
        sample_rate: f64,
        fft_size: usize,
        usable_fraction: f64,
    ) -> Self {
        let trim_fraction = (1.0 - usable_fraction) / 2.0;
        let trim_bins = (fft_size as f64 * trim_fraction) as usize;
        let usable_bins = fft_size - 2 * trim_bins;
        let panorama_bins = usable_bins * steps.len();

        // Absolute frequency of every panorama bin.
        let bin_width = sample_rate / fft_size as f64;
        let mut freqs = vec![0.0f64; panorama_bins];
        for (step_idx, &center) in steps.iter().enumerate() {
            let base = step_idx * usable_bins;
            for b in 0..usable_bins {
                let abs_bin = trim_bins + b;
                freqs[base + b] = center - sample_rate / 2.0 + abs_bin as f64 * bin_width;
            }
        }

        let taper_len = 32.min(usable_bins / 4);

        info!(
            "Stitcher: {} steps, {} usable bins/step, {} panorama bins, {:.3} - {:.3} MHz",
            steps.len(),
            usable_bins,
            panorama_bins,
            freq_start / 1e6,
            freq_end / 1e6,
        );

        Self {
            freq_start,
            freq_end,
            steps,
            fft_size,
            trim_bins,
            usable_bins,
            taper_len,
            panorama: vec![EMPTY_DB; panorama_bins],
            freqs,
        }
    }

    pub fn num_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn usable_bins(&self) -> usize {
        self.usable_bins
    }

    pub fn panorama_bins(&self) -> usize {
        self.panorama.len()
    }

    pub fn freq_start(&self) -> f64 {
        self.freq_start
    }

    pub fn freq_end(&self) -> f64 {
        self.freq_end
    }

    /// Trim a step spectrum to its usable portion (what a segment packet
    /// carries).
    pub fn usable_slice<'a>(&self, spectrum: &'a [f32]) -> &'a [f32] {
        &spectrum[self.trim_bins..self.trim_bins + self.usable_bins]
    }

    /// Insert one step's full-resolution dBFS spectrum into the panorama.
    pub fn add_segment(&mut self, step_idx: usize, spectrum: &[f32]) {
        if step_idx >= self.steps.len() {
            return;
        }
        if spectrum.len() != self.fft_size {
            warn!(
                "stitcher: segment length {} != fft size {}",
                spectrum.len(),
                self.fft_size
            );
            return;
        }

        let mut segment = self.usable_slice(spectrum).to_vec();

        // Crossfade the left edge against the previous segment's trailing
        // bins (linear power), but only once those bins hold real data.
        let taper = self.taper_len;
        let base = step_idx * self.usable_bins;
        if taper > 0 && step_idx > 0 {
            let prev_edge = &self.panorama[base - taper..base];
            if prev_edge.iter().all(|&v| v > WRITTEN_DB) {
                for i in 0..taper {
                    let t = i as f32 / (taper - 1).max(1) as f32;
                    let prev_lin = 10f32.powf(prev_edge[i] / 10.0);
                    let curr_lin = 10f32.powf(segment[i] / 10.0);
                    let blended = (1.0 - t) * prev_lin + t * curr_lin;
                    segment[i] = 10.0 * blended.max(1e-20).log10();
                }
            }
        }

        self.panorama[base..base + self.usable_bins].copy_from_slice(&segment);
    }

    /// Full-resolution panorama: (frequencies, powers).
    pub fn panorama(&self) -> (&[f64], &[f32]) {
        (&self.freqs, &self.panorama)
    }

    /// Peak-preserving downsample to `target_bins`; the frequency axis is
    /// decimated by the mean of each bin group.
    pub fn display_panorama(&self, target_bins: usize) -> (Vec<f64>, Vec<f32>) {
        if self.panorama.len() <= target_bins {
            return (self.freqs.clone(), self.panorama.clone());
        }

        let power = peak_decimate(&self.panorama, target_bins);
        let factor = self.panorama.len() / target_bins;
        let freqs = (0..target_bins)
            .map(|i| {
                let group = &self.freqs[i * factor..(i + 1) * factor];
                group.iter().sum::<f64>() / factor as f64
            })
            .collect();
        (freqs, power)
    }

    /// Clear the panorama for the next sweep pass.
    pub fn reset(&mut self) {
        self.panorama.fill(EMPTY_DB);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> DeviceLimits {
        DeviceLimits::default()
    }

    #[test]
    fn step_plan_tiles_the_band() {
        let steps = plan_steps(100e6, 200e6, 20e6, 0.8, &limits());
        // usable_bw = 16 MHz, span = 100 MHz -> ceil(100/16) = 7 steps
        assert_eq!(steps.len(), 7);
        assert!((steps[0] - 108e6).abs() < 1.0);
        for pair in steps.windows(2) {
            assert!((pair[1] - pair[0] - 16e6).abs() < 1.0);
        }
    }

    #[test]
    fn step_plan_clamps_to_device_range() {
        let steps = plan_steps(40e6, 80e6, 20e6, 0.8, &limits());
        let lo = limits().min_freq + 10e6;
        assert!(steps.iter().all(|&c| c >= lo));
    }

    #[test]
    fn empty_plan_falls_back_to_midpoint() {
        // Degenerate range narrower than numerical progress.
        let steps = plan_steps(100e6, 100e6, 20e6, 0.8, &limits());
        assert_eq!(steps.len(), 1);
        assert!((steps[0] - 100e6).abs() < 1.0);
    }

    fn stitcher_for(
        freq_start: f64,
        freq_end: f64,
        sr: f64,
        fft: usize,
        u: f64,
    ) -> Stitcher {
        let steps = plan_steps(freq_start, freq_end, sr, u, &limits());
        Stitcher::new(freq_start, freq_end, steps, sr, fft, u)
    }

    #[test]
    fn frequency_axis_is_monotonic_and_anchored() {
        let st = stitcher_for(100e6, 200e6, 20e6, 2048, 0.8);
        let (freqs, _) = st.panorama();
        for pair in freqs.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        let bin_width = 20e6 / 2048.0;
        assert!((freqs[0] - 100e6).abs() < bin_width + 1.0);
        let usable_bw = 16e6;
        let expected_last = 100e6 + st.num_steps() as f64 * usable_bw - bin_width;
        assert!(
            (freqs[freqs.len() - 1] - expected_last).abs() < bin_width + 1.0,
            "last = {}, expected = {}",
            freqs[freqs.len() - 1],
            expected_last
        );
    }

    #[test]
    fn segments_place_contiguously() {
        let mut st = stitcher_for(100e6, 140e6, 20e6, 256, 0.8);
        let usable = st.usable_bins();

        st.add_segment(0, &vec![-50.0; 256]);
        st.add_segment(1, &vec![-70.0; 256]);

        let (_, pano) = st.panorama();
        assert_eq!(pano[0], -50.0);
        // Outside the crossfade the second segment is untouched.
        assert_eq!(pano[usable + st.taper_len], -70.0);
    }

    #[test]
    fn seam_crossfades_between_levels() {
        let mut st = stitcher_for(100e6, 140e6, 20e6, 256, 0.8);
        let usable = st.usable_bins();
        st.add_segment(0, &vec![-50.0; 256]);
        st.add_segment(1, &vec![-70.0; 256]);

        let (_, pano) = st.panorama();
        // First blended bin leans toward the previous segment's level, the
        // last toward the incoming one.
        assert!(pano[usable] > -52.0);
        assert!(pano[usable + st.taper_len - 1] <= -69.0);
        for i in 0..st.taper_len {
            let v = pano[usable + i];
            assert!(v <= -49.9 && v >= -70.1, "bin {} = {}", i, v);
        }
    }

    #[test]
    fn no_blend_against_unwritten_bins() {
        let mut st = stitcher_for(100e6, 140e6, 20e6, 256, 0.8);
        let usable = st.usable_bins();
        // Segment 1 arrives before segment 0: its left edge must not blend
        // with the -200 dB fill.
        st.add_segment(1, &vec![-70.0; 256]);
        let (_, pano) = st.panorama();
        assert_eq!(pano[usable], -70.0);
    }

    #[test]
    fn display_downsample_preserves_peaks() {
        let mut st = stitcher_for(100e6, 200e6, 20e6, 2048, 0.8);
        let mut seg = vec![-80.0f32; 2048];
        seg[1024] = -10.0;
        st.add_segment(3, &seg);

        let (freqs, power) = st.display_panorama(1024);
        assert_eq!(freqs.len(), 1024);
        assert_eq!(power.len(), 1024);
        let max = power.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        assert_eq!(max, -10.0);
        for pair in freqs.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn reset_refills_panorama() {
        let mut st = stitcher_for(100e6, 140e6, 20e6, 256, 0.8);
        st.add_segment(0, &vec![-50.0; 256]);
        st.reset();
        let (_, pano) = st.panorama();
        assert!(pano.iter().all(|&v| v == EMPTY_DB));
    }
}
