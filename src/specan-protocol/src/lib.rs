// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Client/server protocol for the spectrum streaming channel.
//!
//! Client to server: newline-delimited JSON commands (`cmd`-tagged).
//! Server to client: binary frames with an 8-byte header; spectrum and
//! sweep payloads are packed big-endian, JSON status/error/event messages
//! ride in a frame of their own message type.

pub mod command;
pub mod frame;

pub use command::{parse_command, ClientCommand, ParsedCommand, ServerMessage, SignalEventMsg};
pub use frame::{
    encode_json_frame, encode_spectrum_packet, encode_sweep_panorama_packet,
    encode_sweep_segment_packet, FrameHeader, SpectrumPacket, SweepPanoramaPacket,
    SweepSegmentPacket, FLAG_PEAK_HOLD, FLAG_SWEEP_COMPLETE, FLAG_SWEEP_IN_PROGRESS,
    MSG_JSON, MSG_SPECTRUM, MSG_SWEEP_PANORAMA, MSG_SWEEP_SEGMENT, PROTOCOL_VERSION,
};
