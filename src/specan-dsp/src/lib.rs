// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! DSP building blocks for the spectrum analysis engine: window functions,
//! DC removal, the chunk-to-frame pipeline, software AGC, signal detection,
//! and sweep planning/stitching.
//!
//! Everything in this crate is a pure transform plus explicit state; no
//! threads are spawned here. Concurrency lives in the server crate.

pub mod agc;
pub mod dc;
pub mod detect;
pub mod downsample;
pub mod pipeline;
pub mod sweep;
pub mod window;

pub use agc::{AgcSettings, SoftwareAgc};
pub use dc::DcBlocker;
pub use detect::{DetectionConfig, DetectorStatus, SignalDetector};
pub use downsample::peak_decimate;
pub use pipeline::{AveragingMode, DspConfig, DspParam, DspParams, DspPipeline};
pub use sweep::{plan_steps, Stitcher};
pub use window::WindowType;
