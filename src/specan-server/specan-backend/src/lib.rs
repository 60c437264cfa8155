// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Receiver backend: the sample-source abstraction, the blocking driver
//! seam, and the hardware receiver façade with its producer thread.

pub mod driver;
pub mod probe;
pub mod receiver;
#[cfg(feature = "soapysdr-sys")]
pub mod soapy;

use crossbeam_channel::Sender;

use specan_core::{DeviceStatus, DynResult, IqChunk};

/// A message on the ingest queue: `Some(chunk)` from the producer, `None`
/// as the shutdown sentinel pushed by the orchestrator.
pub type IqMessage = Option<IqChunk>;

/// Anything that can fill the ingest queue with fixed-size IQ chunks.
///
/// The hardware receiver and the file playback reader both implement this,
/// so the streaming orchestrator never branches on where samples come from.
pub trait SampleSource: Send + Sync {
    /// Begin producing chunks into `tx`. Spawns the producer thread.
    fn start(&self, tx: Sender<IqMessage>) -> DynResult<()>;

    /// Signal the producer to exit and block until it has released its
    /// resources (bounded by an internal join timeout). Idempotent.
    fn stop(&self);

    /// Parameters the source is currently producing with.
    fn status(&self) -> DeviceStatus;
}

pub use driver::{DriverFactory, IqDriver, MockDriver};
pub use probe::{probe_devices, ProbeResult};
pub use receiver::Receiver;
