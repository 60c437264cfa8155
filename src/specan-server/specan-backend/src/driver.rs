// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Blocking IQ driver seam.
//!
//! A driver reads complex samples from a device and accepts tuning changes.
//! The hardware implementation lives in [`crate::soapy`] behind the
//! `soapysdr-sys` feature; [`MockDriver`] stands in when no hardware is
//! present and paces itself to the nominal sample rate.

use std::time::Duration;

use num_complex::Complex;

use specan_core::DeviceStatus;

/// Blocking sample reader plus tuning setters. Errors are strings at this
/// seam; the façade converts them upward.
pub trait IqDriver: Send {
    /// Read the next block of samples into `buf`, returning how many were
    /// written. Blocks until samples are available or a timeout elapses.
    fn read_into(&mut self, buf: &mut [Complex<f32>]) -> Result<usize, String>;

    fn set_frequency(&mut self, _hz: f64) -> Result<(), String> {
        Ok(())
    }

    fn set_gain(&mut self, _db: f64) -> Result<(), String> {
        Ok(())
    }

    fn set_sample_rate(&mut self, _hz: f64) -> Result<(), String> {
        Ok(())
    }

    fn set_bandwidth(&mut self, _hz: f64) -> Result<(), String> {
        Ok(())
    }
}

/// Builds a driver from the parameters in effect at stream start.
pub type DriverFactory =
    Box<dyn Fn(&DeviceStatus) -> Result<Box<dyn IqDriver>, String> + Send + Sync>;

/// Software driver producing silence or a complex tone at a fixed offset
/// from center. Paces reads to the nominal sample rate so the rest of the
/// pipeline sees realistic timing.
pub struct MockDriver {
    sample_rate: f64,
    /// Tone offset from center in Hz, or `None` for silence.
    tone_offset_hz: Option<f64>,
    tone_amplitude: f32,
    phase: f64,
    paced: bool,
}

impl MockDriver {
    pub fn silent(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            tone_offset_hz: None,
            tone_amplitude: 0.0,
            phase: 0.0,
            paced: true,
        }
    }

    pub fn tone(sample_rate: f64, offset_hz: f64, amplitude: f32) -> Self {
        Self {
            sample_rate,
            tone_offset_hz: Some(offset_hz),
            tone_amplitude: amplitude,
            phase: 0.0,
            paced: true,
        }
    }

    /// Disable read pacing (tests that want the producer to run flat out).
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }
}

impl IqDriver for MockDriver {
    fn read_into(&mut self, buf: &mut [Complex<f32>]) -> Result<usize, String> {
        match self.tone_offset_hz {
            None => buf.fill(Complex::new(0.0, 0.0)),
            Some(offset) => {
                let step = 2.0 * std::f64::consts::PI * offset / self.sample_rate;
                for s in buf.iter_mut() {
                    *s = Complex::new(
                        self.tone_amplitude * self.phase.cos() as f32,
                        self.tone_amplitude * self.phase.sin() as f32,
                    );
                    self.phase += step;
                }
                self.phase %= 2.0 * std::f64::consts::PI;
            }
        }

        if self.paced && self.sample_rate > 0.0 {
            let dt = buf.len() as f64 / self.sample_rate;
            std::thread::sleep(Duration::from_secs_f64(dt));
        }
        Ok(buf.len())
    }

    fn set_sample_rate(&mut self, hz: f64) -> Result<(), String> {
        self.sample_rate = hz;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_driver_fills_zeros() {
        let mut drv = MockDriver::silent(1e6).unpaced();
        let mut buf = vec![Complex::new(1.0_f32, 1.0); 64];
        assert_eq!(drv.read_into(&mut buf).unwrap(), 64);
        assert!(buf.iter().all(|s| s.re == 0.0 && s.im == 0.0));
    }

    #[test]
    fn tone_driver_keeps_phase_across_reads() {
        let mut drv = MockDriver::tone(1024.0, 128.0, 1.0).unpaced();
        let mut a = vec![Complex::new(0.0_f32, 0.0); 16];
        let mut b = a.clone();
        drv.read_into(&mut a).unwrap();
        drv.read_into(&mut b).unwrap();

        // 128 Hz at 1024 S/s: period 8 samples, so block two continues the
        // same sequence.
        for i in 0..8 {
            assert!((a[i].re - b[i].re).abs() < 1e-5);
            assert!((a[i].im - b[i].im).abs() < 1e-5);
        }
        let mag = (a[3].re * a[3].re + a[3].im * a[3].im).sqrt();
        assert!((mag - 1.0).abs() < 1e-5);
    }
}
