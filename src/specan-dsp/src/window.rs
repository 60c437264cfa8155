// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! FFT window functions.
//!
//! Each window trades main-lobe width against sidelobe suppression:
//! Hanning is the general-purpose default (-31 dB sidelobes),
//! Blackman-Harris suppresses to -92 dB, flat-top gives the best amplitude
//! accuracy, Kaiser is tunable via beta.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    Hanning,
    Hamming,
    Blackman,
    BlackmanHarris,
    FlatTop,
    Kaiser6,
    Kaiser10,
    Kaiser14,
    Rectangular,
}

impl WindowType {
    pub const ALL: [WindowType; 9] = [
        WindowType::Hanning,
        WindowType::Hamming,
        WindowType::Blackman,
        WindowType::BlackmanHarris,
        WindowType::FlatTop,
        WindowType::Kaiser6,
        WindowType::Kaiser10,
        WindowType::Kaiser14,
        WindowType::Rectangular,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowType::Hanning => "hanning",
            WindowType::Hamming => "hamming",
            WindowType::Blackman => "blackman",
            WindowType::BlackmanHarris => "blackman-harris",
            WindowType::FlatTop => "flat-top",
            WindowType::Kaiser6 => "kaiser-6",
            WindowType::Kaiser10 => "kaiser-10",
            WindowType::Kaiser14 => "kaiser-14",
            WindowType::Rectangular => "rectangular",
        }
    }

    /// Compute the window coefficients for a given length.
    pub fn coefficients(&self, size: usize) -> Vec<f32> {
        match self {
            WindowType::Hanning => cosine_window(size, &[0.5, 0.5]),
            WindowType::Hamming => cosine_window(size, &[0.54, 0.46]),
            WindowType::Blackman => cosine_window(size, &[0.42, 0.5, 0.08]),
            WindowType::BlackmanHarris => {
                cosine_window(size, &[0.35875, 0.48829, 0.14128, 0.01168])
            }
            WindowType::FlatTop => cosine_window(
                size,
                &[0.21557895, 0.41663158, 0.277263158, 0.083578947, 0.006947368],
            ),
            WindowType::Kaiser6 => kaiser_window(size, 6.0),
            WindowType::Kaiser10 => kaiser_window(size, 10.0),
            WindowType::Kaiser14 => kaiser_window(size, 14.0),
            WindowType::Rectangular => vec![1.0; size],
        }
    }
}

impl fmt::Display for WindowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hanning" | "hann" => Ok(WindowType::Hanning),
            "hamming" => Ok(WindowType::Hamming),
            "blackman" => Ok(WindowType::Blackman),
            "blackman-harris" | "blackmanharris" => Ok(WindowType::BlackmanHarris),
            "flat-top" | "flattop" => Ok(WindowType::FlatTop),
            "kaiser-6" => Ok(WindowType::Kaiser6),
            "kaiser-10" => Ok(WindowType::Kaiser10),
            "kaiser-14" => Ok(WindowType::Kaiser14),
            "rectangular" | "rect" => Ok(WindowType::Rectangular),
            other => Err(format!(
                "unknown window: {} (options: {})",
                other,
                WindowType::ALL
                    .iter()
                    .map(|w| w.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }
}

/// Coherent gain of a window: the plain coefficient sum. Used to normalize
/// FFT magnitude so a full-scale tone reads 0 dBFS.
pub fn coherent_gain(window: &[f32]) -> f64 {
    window.iter().map(|&w| w as f64).sum()
}

/// Generalized cosine window: `sum_k (-1)^k a_k cos(2*pi*k*n / (N-1))`.
fn cosine_window(size: usize, coeffs: &[f64]) -> Vec<f32> {
    if size == 1 {
        return vec![1.0];
    }
    let denom = (size - 1) as f64;
    (0..size)
        .map(|n| {
            let x = 2.0 * PI * n as f64 / denom;
            let mut acc = 0.0;
            for (k, &a) in coeffs.iter().enumerate() {
                let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
                acc += sign * a * (x * k as f64).cos();
            }
            acc as f32
        })
        .collect()
}

fn kaiser_window(size: usize, beta: f64) -> Vec<f32> {
    if size == 1 {
        return vec![1.0];
    }
    let denom = bessel_i0(beta);
    let half = (size - 1) as f64 / 2.0;
    (0..size)
        .map(|n| {
            let r = (n as f64 - half) / half;
            (bessel_i0(beta * (1.0 - r * r).max(0.0).sqrt()) / denom) as f32
        })
        .collect()
}

/// Zeroth-order modified Bessel function of the first kind, via its power
/// series. Converges quickly for the beta range used here (<= 14).
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    let half_x = x / 2.0;
    for k in 1..=32 {
        term *= (half_x / k as f64) * (half_x / k as f64);
        sum += term;
        if term < sum * 1e-16 {
            break;
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hanning_endpoints_and_symmetry() {
        let w = WindowType::Hanning.coefficients(64);
        assert_eq!(w.len(), 64);
        assert!(w[0].abs() < 1e-6);
        assert!(w[63].abs() < 1e-6);
        for i in 0..32 {
            assert!((w[i] - w[63 - i]).abs() < 1e-6, "asymmetry at {}", i);
        }
    }

    #[test]
    fn rectangular_is_all_ones() {
        let w = WindowType::Rectangular.coefficients(16);
        assert!(w.iter().all(|&x| x == 1.0));
        assert!((coherent_gain(&w) - 16.0).abs() < 1e-9);
    }

    #[test]
    fn blackman_harris_peak_near_unity() {
        let w = WindowType::BlackmanHarris.coefficients(1025);
        let peak = w[512];
        assert!((peak - 1.0).abs() < 1e-3, "peak = {}", peak);
    }

    #[test]
    fn kaiser_tapers_with_beta() {
        // Higher beta concentrates energy in the center.
        let w6 = WindowType::Kaiser6.coefficients(128);
        let w14 = WindowType::Kaiser14.coefficients(128);
        assert!(w14[4] < w6[4]);
        assert!((w6[63] - 1.0).abs() < 0.01);
    }

    #[test]
    fn every_window_has_positive_gain() {
        for wt in WindowType::ALL {
            let w = wt.coefficients(256);
            assert!(coherent_gain(&w) > 0.0, "{} has nonpositive gain", wt);
        }
    }

    #[test]
    fn parse_round_trip() {
        for wt in WindowType::ALL {
            assert_eq!(wt.as_str().parse::<WindowType>().unwrap(), wt);
        }
        assert!("triangular".parse::<WindowType>().is_err());
    }
}
