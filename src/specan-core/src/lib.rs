// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod device;
pub mod frame;
pub mod signal;

pub type DynResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub use device::{DeviceLimits, DeviceStatus};
pub use frame::{DspFrame, IqChunk};
pub use signal::{SignalEvent, SignalEventKind, TrackedSignal};
