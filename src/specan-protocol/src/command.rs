// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! JSON DTOs for the command/status channel.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use specan_core::TrackedSignal;

/// Command received from a client (one JSON object per line).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ClientCommand {
    Start,
    Stop,
    SetFrequency {
        value: f64,
    },
    SetGain {
        value: f64,
    },
    SetSampleRate {
        value: f64,
    },
    SetBandwidth {
        value: f64,
    },
    SetFftSize {
        value: u32,
    },
    SetDsp {
        #[serde(default)]
        params: HashMap<String, Value>,
    },
    SetAgc {
        enabled: Option<bool>,
        target_dbfs: Option<f64>,
        hysteresis: Option<f64>,
        gain_step: Option<f64>,
        min_interval: Option<f64>,
    },
    SweepStart {
        mode: Option<String>,
        freq_start: f64,
        freq_end: f64,
        fft_size: Option<u32>,
        sample_rate: Option<f64>,
        averages: Option<u32>,
        settle_chunks: Option<u32>,
        display_bins: Option<u32>,
    },
    SweepStop,
    SweepStatus,
    DetectionEnable {
        enabled: Option<bool>,
    },
    DetectionSet {
        #[serde(default)]
        params: HashMap<String, Value>,
    },
    DetectionStatus,
    SignalList {
        active_only: Option<bool>,
        limit: Option<usize>,
        offset: Option<usize>,
        freq_min: Option<f64>,
        freq_max: Option<f64>,
    },
    SignalClassify {
        signal_id: u64,
        classification: Option<String>,
        notes: Option<String>,
    },
    SignalDelete {
        signal_id: u64,
    },
    SignalDbStats,
    RecIqStart,
    RecIqStop,
    RecSpectrumStart,
    RecSpectrumStop,
    RecList,
    RecDelete {
        filename: String,
    },
    RecStatus,
    PlaybackStart {
        filename: String,
    },
    PlaybackStop,
    PlaybackPause,
    PlaybackResume,
    PlaybackSpeed {
        value: f64,
    },
    PlaybackLoop {
        enabled: Option<bool>,
    },
    PlaybackSeek {
        position: f64,
    },
    CheckDevice,
    GetStatus,
}

/// Outcome of parsing one client line: an unknown-but-well-formed `cmd` is
/// reported separately so the session can warn and continue.
#[derive(Debug)]
pub enum ParsedCommand {
    Known(ClientCommand),
    Unknown(String),
}

/// Parse a JSON command line.
///
/// Malformed JSON or a missing `cmd` field is an error; a well-formed
/// object with an unrecognized `cmd` parses as `Unknown`.
pub fn parse_command(input: &str) -> Result<ParsedCommand, serde_json::Error> {
    let value: Value = serde_json::from_str(input)?;
    match serde_json::from_value::<ClientCommand>(value.clone()) {
        Ok(cmd) => Ok(ParsedCommand::Known(cmd)),
        Err(err) => {
            if let Some(cmd) = value.get("cmd").and_then(Value::as_str) {
                if !KNOWN_COMMANDS.contains(&cmd) {
                    return Ok(ParsedCommand::Unknown(cmd.to_string()));
                }
            }
            Err(err)
        }
    }
}

const KNOWN_COMMANDS: &[&str] = &[
    "start",
    "stop",
    "set_frequency",
    "set_gain",
    "set_sample_rate",
    "set_bandwidth",
    "set_fft_size",
    "set_dsp",
    "set_agc",
    "sweep_start",
    "sweep_stop",
    "sweep_status",
    "detection_enable",
    "detection_set",
    "detection_status",
    "signal_list",
    "signal_classify",
    "signal_delete",
    "signal_db_stats",
    "rec_iq_start",
    "rec_iq_stop",
    "rec_spectrum_start",
    "rec_spectrum_stop",
    "rec_list",
    "rec_delete",
    "rec_status",
    "playback_start",
    "playback_stop",
    "playback_pause",
    "playback_resume",
    "playback_speed",
    "playback_loop",
    "playback_seek",
    "check_device",
    "get_status",
];

/// Text message sent to clients (inside a `MSG_JSON` frame).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status { data: Value },
    Error { message: String },
    SignalEvent { data: SignalEventMsg },
}

impl ServerMessage {
    pub fn status(data: Value) -> Self {
        ServerMessage::Status { data }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

/// Serialized form of a detector event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEventMsg {
    pub event: String,
    pub signal_id: u64,
    pub center_freq: f64,
    pub peak_freq: f64,
    pub bandwidth: f64,
    pub peak_power: f32,
    pub avg_power: f32,
    pub hit_count: u64,
    pub classification: String,
}

impl SignalEventMsg {
    pub fn new(event: &specan_core::SignalEvent) -> Self {
        let s: &TrackedSignal = &event.signal;
        Self {
            event: event.kind.as_str().to_string(),
            signal_id: s.id,
            center_freq: s.center_freq,
            peak_freq: s.peak_freq,
            bandwidth: s.bandwidth,
            peak_power: s.peak_power,
            avg_power: s.avg_power,
            hit_count: s.hit_count,
            classification: s.classification.clone(),
        }
    }
}
